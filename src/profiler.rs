use std::collections::HashMap;
use std::mem::ManuallyDrop;
use std::mem::MaybeUninit;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{select, tick, Receiver};
use libbpf_rs::skel::OpenSkel;
use libbpf_rs::skel::Skel;
use libbpf_rs::skel::SkelBuilder;
use libbpf_rs::Link;
use libbpf_rs::OpenObject;
use nix::sys::resource::{getrlimit, setrlimit, Resource};
use parking_lot::RwLock;
use tracing::{debug, error, warn};

use crate::bpf::maps::{empty_combined_stack, BpfMaps};
use crate::bpf::profiler_skel::{ProfilerSkel, ProfilerSkelBuilder};
use crate::debug_info::DebugInfoUploader;
use crate::ksym::KsymCache;
use crate::mappings::{Mapping, MappingCache, MappingError, RoundMappings};
use crate::metrics;
use crate::object::ObjectFileCache;
use crate::perf_events::{online_cpus, open_cpu_clock_event};
use crate::process::{Pid, ProcessDescriptor, ProcessSnapshot};
use crate::profile::{to_pprof, Labels, ProcessProfileBuilder, PROFILE_NAME, PROFILE_NAME_LABEL};
use crate::writer::ProfileWriter;

/// Per-CPU sampling frequency. Always needs to be in sync with the period
/// stamped on emitted profiles.
const SAMPLE_FREQ_HZ: u64 = 100;

/// BPF maps are locked pages, so the memlock budget has to be generous.
const MEMLOCK_RLIMIT_BYTES: u64 = 1024 << 20; // ~1GiB

const PROGRAM_NAME: &str = "profile_cpu";

/// The shared round clock. `loop_started_at` feeds the capture time of the
/// next round's profiles, `last_successful_loop_started_at` is what the
/// introspection surface reports as time of the last successful scrape.
#[derive(Clone, Copy)]
pub struct LoopClock {
    pub loop_started_at: SystemTime,
    pub last_successful_loop_started_at: SystemTime,
}

pub type SharedLoopClock = Arc<RwLock<LoopClock>>;

impl LoopClock {
    pub fn shared() -> SharedLoopClock {
        let now = SystemTime::now();
        Arc::new(RwLock::new(LoopClock {
            loop_started_at: now,
            last_successful_loop_started_at: now,
        }))
    }

    fn advance(&mut self) {
        self.last_successful_loop_started_at = self.loop_started_at;
        self.loop_started_at = SystemTime::now();
    }
}

/// Optional collaborators of the profiler.
#[derive(Default)]
pub struct ProfilerOptions {
    pub profile_writer: Option<Box<dyn ProfileWriter>>,
    pub debuginfo_uploader: Option<DebugInfoUploader>,
}

pub struct Profiler {
    node: String,
    profiling_duration: Duration,

    // Prevent the links from being removed.
    _links: Vec<Link>,
    open_object: ManuallyDrop<Box<MaybeUninit<OpenObject>>>,
    skel: ManuallyDrop<ProfilerSkel<'static>>,

    clock: SharedLoopClock,

    // Caches, caches everywhere!
    ksym_cache: KsymCache,
    mapping_cache: MappingCache,
    object_file_cache: Arc<ObjectFileCache>,

    profile_writer: Option<Box<dyn ProfileWriter>>,
    debuginfo_uploader: Option<DebugInfoUploader>,
}

impl Drop for Profiler {
    fn drop(&mut self) {
        unsafe { ManuallyDrop::drop(&mut self.skel) };
        unsafe { ManuallyDrop::drop(&mut self.open_object) };
    }
}

impl Profiler {
    /// Loads the sampler into the kernel and attaches it to one perf event
    /// per online CPU. Everything that can fail here is fatal.
    pub fn new(
        node: String,
        profiling_duration: Duration,
        clock: SharedLoopClock,
        object_file_cache: Arc<ObjectFileCache>,
        options: ProfilerOptions,
    ) -> Result<Self> {
        bump_memlock_rlimit().context("bump memlock rlimit")?;

        let mut open_object = ManuallyDrop::new(Box::new(MaybeUninit::uninit()));

        let skel_builder = ProfilerSkelBuilder::default();
        let open_skel = skel_builder
            .open(&mut open_object)
            .context("open BPF object")?;
        let skel = ManuallyDrop::new(open_skel.load().context("load BPF object")?);

        // SAFETY: skel never outlives open_object.
        let mut skel = unsafe {
            std::mem::transmute::<ManuallyDrop<ProfilerSkel<'_>>, ManuallyDrop<ProfilerSkel<'static>>>(
                skel,
            )
        };

        let links = Self::setup_perf_events(&mut skel)?;
        debug!("cpu sampler loaded and attached");

        Ok(Profiler {
            node,
            profiling_duration,
            _links: links,
            open_object,
            skel,
            clock,
            ksym_cache: KsymCache::new(),
            mapping_cache: MappingCache::new(),
            object_file_cache,
            profile_writer: options.profile_writer,
            debuginfo_uploader: options.debuginfo_uploader,
        })
    }

    fn setup_perf_events(skel: &mut ManuallyDrop<ProfilerSkel<'static>>) -> Result<Vec<Link>> {
        let mut perf_fds = Vec::new();
        for cpu in online_cpus().context("get online CPUs")? {
            perf_fds.push(open_cpu_clock_event(cpu, SAMPLE_FREQ_HZ).context("open perf event")?);
        }

        let mut links = Vec::new();
        for perf_fd in perf_fds {
            let mut prog = skel
                .object_mut()
                .progs_mut()
                .find(|prog| prog.name().to_string_lossy() == PROGRAM_NAME)
                .ok_or(anyhow!("program {} not found", PROGRAM_NAME))?;
            links.push(
                prog.attach_perf_event(perf_fd)
                    .context("attach perf event")?,
            );
        }
        Ok(links)
    }

    /// The profiling loop. One round per tick; a slow round delays the next
    /// tick rather than overlapping with it. Returns when the stop channel
    /// fires.
    pub fn run(&self, stop: Receiver<()>) -> Result<()> {
        debug!("start profiling loop");
        let ticker = tick(self.profiling_duration);

        loop {
            select! {
                recv(stop) -> _ => {
                    debug!("profiler stop signal received");
                    return Ok(());
                },
                recv(ticker) -> _ => {
                    let started = Instant::now();
                    let result = self.round();
                    metrics::ROUND_DURATION.observe(started.elapsed().as_secs_f64());

                    match &result {
                        Ok(()) => {
                            metrics::ROUNDS_TOTAL.with_label_values(&["ok"]).inc();
                        }
                        Err(e) => {
                            metrics::ROUNDS_TOTAL.with_label_values(&["error"]).inc();
                            warn!("profile round failed with {:?}", e);
                        }
                    }

                    self.observe_round(result.is_ok());
                },
            }
        }
    }

    /// Advances the round clock. Only successful rounds move it, so the
    /// capture time of the next profiles is the start of the previous
    /// successful round.
    fn observe_round(&self, success: bool) {
        if success {
            self.clock.write().advance();
        }
    }

    fn capture_time(&self) -> SystemTime {
        self.clock.read().loop_started_at
    }

    /// One drain-and-emit round over the kernel's aggregated counts.
    fn round(&self) -> Result<()> {
        let capture_time = self.capture_time();
        let processes = ProcessSnapshot::capture().context("snapshot processes")?;
        let kernel_mapping = Arc::new(Mapping::kernel());
        let maps = BpfMaps::new(&self.skel.maps.counts, &self.skel.maps.stack_traces);

        let mut round_mappings = RoundMappings::new(&self.mapping_cache);
        let mut builders: HashMap<Pid, ProcessProfileBuilder> = HashMap::new();
        let mut samples_drained = 0u64;

        for key_bytes in maps.iter_counts() {
            let key = BpfMaps::parse_count_key(&key_bytes).context("decode stack count key")?;

            // Processes that died with their stacks still in the map.
            if !processes.contains(key.pid) {
                continue;
            }

            let mut stack = empty_combined_stack();
            let user_err = match maps.read_user_stack(key.user_stack_id, &mut stack) {
                Ok(()) => None,
                Err(e) if e.is_recoverable() => {
                    debug!("failed to read user stack: {}", e);
                    Some(e)
                }
                Err(e) => return Err(e).context("read user stack"),
            };
            let kernel_err = match maps.read_kernel_stack(key.kernel_stack_id, &mut stack) {
                Ok(()) => None,
                Err(e) if e.is_recoverable() => {
                    debug!("failed to read kernel stack: {}", e);
                    Some(e)
                }
                Err(e) => return Err(e).context("read kernel stack"),
            };
            if user_err.is_some() && kernel_err.is_some() {
                continue;
            }

            let value = maps
                .read_stack_count(&key_bytes)
                .context("read stack count")?;
            if value == 0 {
                continue;
            }
            samples_drained += 1;

            let builder = builders
                .entry(key.pid)
                .or_insert_with(|| ProcessProfileBuilder::new(key.pid, kernel_mapping.clone()));

            let object_file_cache = &self.object_file_cache;
            let mut resolve = |pid: Pid, addr: u64| {
                resolve_user_address(&mut round_mappings, object_file_cache, pid, addr)
            };
            builder.add_stack_count(stack, value, &mut resolve);
        }

        metrics::SAMPLES_TOTAL.inc_by(samples_drained as f64);

        let (user_mappings, mapped_files) = round_mappings.all_mappings();

        // Upload debug information of the discovered object files, without
        // waiting for it.
        if let Some(uploader) = &self.debuginfo_uploader {
            uploader.dispatch(mapped_files);
        }

        let now = SystemTime::now();
        for (pid, builder) in builders {
            if !builder.has_samples() {
                continue;
            }

            let profile = builder.build(capture_time, user_mappings.clone());
            let pprof_profile =
                to_pprof(&profile, &self.ksym_cache, now).context("build pprof profile")?;
            metrics::PROFILES_TOTAL.inc();

            let labels = self.labels_for(pid);
            if let Some(writer) = &self.profile_writer {
                if let Err(e) = writer.write(&labels, &pprof_profile) {
                    error!("failed to write profile: {:?}", e);
                }
            }
        }

        if let Err(e) = maps.clean() {
            warn!("failed to clean BPF maps: {:?}", e);
        }

        Ok(())
    }

    fn labels_for(&self, pid: Pid) -> Labels {
        let mut labels = Labels::new();
        labels.insert(PROFILE_NAME_LABEL.to_string(), PROFILE_NAME.to_string());
        labels.insert("node".to_string(), self.node.clone());
        labels.insert("pid".to_string(), pid.to_string());

        // Processes can be gone by the time their profile is emitted; their
        // samples still count, they just carry fewer labels.
        if let Some(descriptor) = ProcessDescriptor::describe(pid) {
            labels.insert("exec".to_string(), descriptor.exec);
            labels.insert(
                "path".to_string(),
                descriptor.path.to_string_lossy().to_string(),
            );
            if let Some(build_version) = self.mapping_cache.main_build_id(pid) {
                labels.insert("build_version".to_string(), build_version);
            }
        }

        labels
    }
}

/// Finds the mapping for a user-space address and normalizes the address
/// into it. Lookup failures leave the address untouched with no mapping;
/// only unexpected failures are worth a warning.
fn resolve_user_address(
    round_mappings: &mut RoundMappings,
    object_file_cache: &ObjectFileCache,
    pid: Pid,
    addr: u64,
) -> (u64, Option<Arc<Mapping>>) {
    let mapping = match round_mappings.mapping_for(pid, addr) {
        Ok(mapping) => mapping,
        Err(e) => {
            match e {
                MappingError::NotFound { .. } => {
                    debug!("no mapping for address {:#x} in pid {}", addr, pid)
                }
                _ => warn!("failed to get process mapping: {:?}", e),
            }
            return (addr, None);
        }
    };

    let normalized = normalize_address(object_file_cache, pid, &mapping, addr);
    (normalized, Some(mapping))
}

/// Normalizes a runtime address for position independent code. Every
/// failure mode falls back to the raw address, the server can still use it
/// together with the mapping.
fn normalize_address(
    object_file_cache: &ObjectFileCache,
    pid: Pid,
    mapping: &Arc<Mapping>,
    addr: u64,
) -> u64 {
    if mapping.is_unsymbolizable() {
        debug!("mapping {} is unsymbolizable", mapping.file);
        return addr;
    }

    let object_file = match object_file_cache.object_file_for(pid, mapping) {
        Ok(object_file) => object_file,
        Err(e) => {
            debug!("failed to open object file: {:?}", e);
            return addr;
        }
    };

    match object_file.obj_addr(addr, mapping) {
        Ok(normalized) => normalized,
        Err(e) => {
            debug!("failed to normalize address: {}", e);
            addr
        }
    }
}

/// Raises the locked-memory limit to a value more reasonable for the
/// profiler's needs. BPF maps are locked pages, so failing here is fatal.
fn bump_memlock_rlimit() -> Result<()> {
    setrlimit(
        Resource::RLIMIT_MEMLOCK,
        MEMLOCK_RLIMIT_BYTES,
        MEMLOCK_RLIMIT_BYTES,
    )
    .context("setrlimit")?;

    let (soft, _hard) = getrlimit(Resource::RLIMIT_MEMLOCK).context("getrlimit")?;
    debug!("increased max memory locked rlimit to {} bytes", soft);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsymbolizable_mappings_are_not_normalized() {
        let cache = ObjectFileCache::new();
        let mapping = Arc::new(Mapping {
            start: 0x1000,
            limit: 0x2000,
            offset: 0,
            file: "[vdso]".to_string(),
            build_id: String::new(),
        });
        assert_eq!(normalize_address(&cache, 1, &mapping, 0xDEAD), 0xDEAD);
    }

    #[test]
    fn unopenable_object_files_leave_the_address_alone() {
        let cache = ObjectFileCache::new();
        let mapping = Arc::new(Mapping {
            start: 0x1000,
            limit: 0x2000,
            offset: 0,
            file: "/does/not/exist".to_string(),
            build_id: String::new(),
        });
        assert_eq!(normalize_address(&cache, 1, &mapping, 0x1234), 0x1234);
    }

    #[test]
    fn missing_mappings_resolve_to_none() {
        let mapping_cache = MappingCache::new();
        let object_file_cache = ObjectFileCache::new();
        let mut round_mappings = RoundMappings::new(&mapping_cache);

        let (addr, mapping) = resolve_user_address(
            &mut round_mappings,
            &object_file_cache,
            std::process::id(),
            0x10,
        );
        assert_eq!(addr, 0x10);
        assert!(mapping.is_none());
    }

    #[test]
    fn clock_advance_promotes_the_previous_round_start() {
        let clock = LoopClock::shared();
        let before = clock.read().loop_started_at;

        clock.write().advance();

        let after = *clock.read();
        assert_eq!(after.last_successful_loop_started_at, before);
        assert!(after.loop_started_at >= before);
    }
}
