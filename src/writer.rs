use std::fs;
use std::io::Write;
use std::os::unix::fs::DirBuilderExt;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use prost::Message;
use tracing::debug;

use filament_proto::profile::pprof;
use filament_proto::store::v1::{Label, LabelSet, RawProfileSeries, RawSample};

use crate::buffer_pool::BufferPool;
use crate::metrics;
use crate::profile::Labels;
use crate::profile::PROFILE_NAME_LABEL;
use crate::store::BatchWriteClient;

/// Number of serialization buffers each writer keeps around.
const WRITER_POOL_SIZE: usize = 4;

/// Where finished profiles go. Implementations must not panic on backend
/// failures, the profiler treats write errors as survivable.
pub trait ProfileWriter: Send + Sync {
    fn write(&self, labels: &Labels, profile: &pprof::Profile) -> Result<()>;
}

/// Serializes `profile` into its gzipped pprof encoding, appending to `out`.
fn encode_gzipped(profile: &pprof::Profile, out: &mut Vec<u8>) -> Result<()> {
    let raw = profile.encode_to_vec();
    let mut encoder = GzEncoder::new(out, Compression::default());
    encoder.write_all(&raw)?;
    encoder.finish()?;
    Ok(())
}

/// Writes gzipped pprof artifacts into a directory.
pub struct FileWriter {
    directory: PathBuf,
    buffer_pool: Arc<BufferPool>,
}

impl FileWriter {
    pub fn new(directory: PathBuf) -> Self {
        FileWriter {
            directory,
            buffer_pool: BufferPool::new(WRITER_POOL_SIZE),
        }
    }

    fn file_name(labels: &Labels) -> String {
        let get = |key: &str| labels.get(key).map(String::as_str).unwrap_or_default();
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        format!(
            "{}_{}_{}_{:03}.pb.gz",
            get(PROFILE_NAME_LABEL),
            get("node"),
            get("pid"),
            nanos
        )
    }
}

impl ProfileWriter for FileWriter {
    fn write(&self, labels: &Labels, profile: &pprof::Profile) -> Result<()> {
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o755)
            .create(&self.directory)
            .with_context(|| format!("could not create {}", self.directory.display()))?;

        let path = self.directory.join(Self::file_name(labels));
        let mut file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .mode(0o666)
            .open(&path)
            .with_context(|| format!("could not create {}", path.display()))?;

        let mut buffer = self.buffer_pool.check_out();
        let result = encode_gzipped(profile, &mut buffer)
            .and_then(|()| file.write_all(&buffer).map_err(Into::into));

        let outcome = if result.is_ok() { "ok" } else { "error" };
        metrics::WRITES_TOTAL
            .with_label_values(&["file", outcome])
            .inc();
        if result.is_ok() {
            debug!("wrote profile to {}", path.display());
        }
        result
    }
}

/// Hands gzipped pprof artifacts to the remote store, one series with one
/// raw sample per profile. Series go through the batch write client, which
/// ships everything queued in a single `WriteRaw` RPC on its own cadence.
pub struct RemoteWriter {
    batcher: Arc<BatchWriteClient>,
    buffer_pool: Arc<BufferPool>,
}

impl RemoteWriter {
    pub fn new(batcher: Arc<BatchWriteClient>) -> Self {
        RemoteWriter {
            batcher,
            buffer_pool: BufferPool::new(WRITER_POOL_SIZE),
        }
    }
}

impl ProfileWriter for RemoteWriter {
    fn write(&self, labels: &Labels, profile: &pprof::Profile) -> Result<()> {
        let mut buffer = self.buffer_pool.check_out();
        encode_gzipped(profile, &mut buffer)?;

        // `Labels` iterates sorted by key, which is the order the store
        // expects label sets in.
        let labels = labels
            .iter()
            .map(|(name, value)| Label {
                name: name.clone(),
                value: value.clone(),
            })
            .collect();

        self.batcher.enqueue(RawProfileSeries {
            labels: Some(LabelSet { labels }),
            samples: vec![RawSample {
                raw_profile: buffer.clone(),
            }],
        });

        metrics::WRITES_TOTAL
            .with_label_values(&["remote", "ok"])
            .inc();
        Ok(())
    }
}
