use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use reqwest::StatusCode;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::mappings::ProcessMapping;
use crate::metrics;
use crate::object::{ObjectFile, ObjectFileCache};

/// How many pending upload batches may sit in the queue before new ones
/// are dropped.
const UPLOAD_QUEUE_CAPACITY: usize = 16;

const HTTP_CLIENT_TIMEOUT: Duration = Duration::from_secs(15);

/// Sink for the debug information of mapped files the profiler has seen.
/// `ensure_uploaded` may be called with the same files again and again and
/// must make the upload happen at most once.
pub trait DebugInfoManager: Send + Sync {
    fn ensure_uploaded(&self, object_files: &[Arc<ObjectFile>]) -> Result<()>;
}

pub struct DebugInfoBackendNull {}

impl DebugInfoManager for DebugInfoBackendNull {
    fn ensure_uploaded(&self, _object_files: &[Arc<ObjectFile>]) -> Result<()> {
        Ok(())
    }
}

/// Keeps a copy of each distinct executable under `path`, keyed by build
/// id. Useful for symbolizing local profiles after the original binaries
/// are gone.
#[derive(Debug)]
pub struct DebugInfoBackendFilesystem {
    pub path: PathBuf,
}

impl DebugInfoManager for DebugInfoBackendFilesystem {
    fn ensure_uploaded(&self, object_files: &[Arc<ObjectFile>]) -> Result<()> {
        std::fs::create_dir_all(&self.path)?;

        for object_file in object_files {
            if object_file.build_id.is_empty() {
                continue;
            }

            let destination = self.path.join(&object_file.build_id);
            if destination.exists() {
                continue;
            }

            if let Err(e) = std::fs::copy(&object_file.path, &destination) {
                debug!(
                    "copying debug info for {} failed with {:?}",
                    object_file.path.display(),
                    e
                );
            }
        }

        Ok(())
    }
}

/// Uploads debug information over HTTP, skipping files the backend
/// already knows about.
#[derive(Debug)]
pub struct DebugInfoBackendRemote {
    pub server_url: String,
    pub token: Option<String>,
}

impl DebugInfoManager for DebugInfoBackendRemote {
    fn ensure_uploaded(&self, object_files: &[Arc<ObjectFile>]) -> Result<()> {
        let client = reqwest::blocking::Client::builder()
            .timeout(HTTP_CLIENT_TIMEOUT)
            .build()?;

        for object_file in object_files {
            if object_file.build_id.is_empty() {
                continue;
            }

            match self.find_in_backend(&client, &object_file.build_id) {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => {
                    debug!("querying debug info backend failed with {:?}", e);
                    continue;
                }
            }

            if let Err(e) = self.upload_to_backend(&client, object_file) {
                debug!(
                    "uploading debug info for {} failed with {:?}",
                    object_file.path.display(),
                    e
                );
            }
        }

        Ok(())
    }
}

impl DebugInfoBackendRemote {
    /// Whether the backend knows about some debug information.
    fn find_in_backend(&self, client: &reqwest::blocking::Client, build_id: &str) -> Result<bool> {
        let mut request = client.get(format!("{}/debuginfo/{}", self.server_url, build_id));
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        Ok(request.send()?.status() == StatusCode::OK)
    }

    fn upload_to_backend(
        &self,
        client: &reqwest::blocking::Client,
        object_file: &ObjectFile,
    ) -> Result<()> {
        let name = object_file
            .path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let debug_info = std::fs::read(&object_file.path)?;

        let mut request = client
            .post(format!(
                "{}/debuginfo/new/{}/{}",
                self.server_url, name, object_file.build_id
            ))
            .body(debug_info);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request.send()?;
        debug!("debug info upload response: {:?}", response.status());
        Ok(())
    }
}

/// Hands freshly observed mapped files to the uploader without ever
/// blocking the profiler loop. The queue is bounded; overflow drops the
/// batch and bumps a counter.
#[derive(Clone)]
pub struct DebugInfoUploader {
    sender: mpsc::Sender<Vec<ProcessMapping>>,
}

impl DebugInfoUploader {
    pub fn new(
        manager: Box<dyn DebugInfoManager>,
        object_files: Arc<ObjectFileCache>,
    ) -> (Self, DebugInfoWorker) {
        let (sender, receiver) = mpsc::channel(UPLOAD_QUEUE_CAPACITY);
        (
            DebugInfoUploader { sender },
            DebugInfoWorker {
                receiver,
                manager,
                object_files,
            },
        )
    }

    pub fn dispatch(&self, mapped_files: Vec<ProcessMapping>) {
        if mapped_files.is_empty() {
            return;
        }
        if self.sender.try_send(mapped_files).is_err() {
            metrics::DEBUGINFO_DROPS_TOTAL.inc();
            debug!("debug info upload queue is full, dropping batch");
        }
    }
}

/// Drains the upload queue, resolves mapped files through the object file
/// cache and feeds them to the configured backend.
pub struct DebugInfoWorker {
    receiver: mpsc::Receiver<Vec<ProcessMapping>>,
    manager: Box<dyn DebugInfoManager>,
    object_files: Arc<ObjectFileCache>,
}

impl DebugInfoWorker {
    pub async fn run(mut self, token: CancellationToken) -> Result<()> {
        let manager: Arc<dyn DebugInfoManager> = Arc::from(self.manager);
        loop {
            let mapped_files = tokio::select! {
                _ = token.cancelled() => return Ok(()),
                mapped_files = self.receiver.recv() => match mapped_files {
                    Some(mapped_files) => mapped_files,
                    None => return Ok(()),
                },
            };

            let mut objects = Vec::new();
            for mapped_file in &mapped_files {
                match self
                    .object_files
                    .object_file_for(mapped_file.pid, &mapped_file.mapping)
                {
                    Ok(object_file) => objects.push(object_file),
                    Err(e) => {
                        debug!(
                            "skipping debug info for {}: {:?}",
                            mapped_file.mapping.file, e
                        );
                    }
                }
            }

            if objects.is_empty() {
                continue;
            }

            // Backends do blocking filesystem and network I/O.
            let manager = manager.clone();
            let result =
                tokio::task::spawn_blocking(move || manager.ensure_uploaded(&objects)).await;
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("debug info upload failed with {:?}", e),
                Err(e) => warn!("debug info upload task panicked: {:?}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filesystem_backend_copies_each_build_id_once() {
        let source = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(source.path(), b"fake debug info").unwrap();

        let dir = tempfile::tempdir().unwrap();
        let backend = DebugInfoBackendFilesystem {
            path: dir.path().join("debuginfo"),
        };

        let object_file = Arc::new(ObjectFile::with_build_id(
            source.path().to_path_buf(),
            "f00dfeed".to_string(),
        ));

        backend
            .ensure_uploaded(std::slice::from_ref(&object_file))
            .unwrap();
        let copied = dir.path().join("debuginfo").join("f00dfeed");
        assert_eq!(std::fs::read(&copied).unwrap(), b"fake debug info");

        // Nothing breaks if the file is already there.
        backend.ensure_uploaded(&[object_file]).unwrap();
    }

    #[test]
    fn filesystem_backend_skips_missing_build_ids() {
        let dir = tempfile::tempdir().unwrap();
        let backend = DebugInfoBackendFilesystem {
            path: dir.path().to_path_buf(),
        };

        let object_file = Arc::new(ObjectFile::with_segments(false, vec![]));
        backend.ensure_uploaded(&[object_file]).unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn full_queue_drops_batches() {
        let object_files = Arc::new(ObjectFileCache::new());
        let (uploader, _worker) =
            DebugInfoUploader::new(Box::new(DebugInfoBackendNull {}), object_files);

        // The worker is not running, so the queue fills up and further
        // dispatches are dropped rather than blocking.
        for _ in 0..UPLOAD_QUEUE_CAPACITY + 5 {
            uploader.dispatch(vec![ProcessMapping {
                pid: 1,
                mapping: Arc::new(crate::mappings::Mapping::kernel()),
            }]);
        }
    }
}
