use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::debug;

use crate::object;
use crate::process::Pid;

/// File name of the synthetic mapping all kernel frames are attributed to.
pub const KERNEL_MAPPING_FILE: &str = "[kernel.kallsyms]";

/// An executable region of a process's address space.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Mapping {
    pub start: u64,
    pub limit: u64,
    pub offset: u64,
    pub file: String,
    /// Hex-encoded build id of the backing file, empty when unknown.
    pub build_id: String,
}

impl Mapping {
    /// The synthetic mapping that collects kernel-address locations.
    pub fn kernel() -> Self {
        Mapping {
            start: 0,
            limit: 0,
            offset: 0,
            file: KERNEL_MAPPING_FILE.to_string(),
            build_id: String::new(),
        }
    }

    /// Whether this region has no object file we could ever resolve
    /// addresses against: anonymous memory, pseudo-files and deleted
    /// binaries.
    pub fn is_unsymbolizable(&self) -> bool {
        self.file.is_empty()
            || self.file.starts_with('[')
            || self.file.starts_with("anon_inode:")
            || self.file.starts_with("linux-vdso")
            || self.file.ends_with("(deleted)")
    }

    pub fn contains(&self, addr: u64) -> bool {
        (self.start..self.limit).contains(&addr)
    }
}

#[derive(Debug, Error)]
pub enum MappingError {
    /// The address does not fall into any executable mapping of the process.
    #[error("no mapping contains address {addr:#x} in pid {pid}")]
    NotFound { pid: Pid, addr: u64 },
    #[error("reading memory maps of pid {pid} failed: {source}")]
    Maps {
        pid: Pid,
        #[source]
        source: procfs::ProcError,
    },
}

#[derive(Default)]
struct MappingCacheInner {
    by_pid: HashMap<Pid, Arc<Vec<Arc<Mapping>>>>,
    /// Build ids are immutable per file, so they are memoized across
    /// processes and rounds.
    build_ids: HashMap<String, String>,
}

/// Caches, per process, the executable regions of its published address
/// space table. Entries live until the cache is dropped; samples of
/// processes that exited are filtered out upstream against the process
/// snapshot, so stale entries are never served for dead pids.
#[derive(Default)]
pub struct MappingCache {
    inner: Mutex<MappingCacheInner>,
}

impl MappingCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the unique executable mapping of `pid` containing `addr`.
    pub fn mapping_for(&self, pid: Pid, addr: u64) -> Result<Arc<Mapping>, MappingError> {
        let mappings = self.mappings_for_pid(pid)?;
        mappings
            .iter()
            .find(|mapping| mapping.contains(addr))
            .cloned()
            .ok_or(MappingError::NotFound { pid, addr })
    }

    pub fn mappings_for_pid(&self, pid: Pid) -> Result<Arc<Vec<Arc<Mapping>>>, MappingError> {
        let mut inner = self.inner.lock();
        if let Some(mappings) = inner.by_pid.get(&pid) {
            return Ok(mappings.clone());
        }

        let mappings = Arc::new(Self::read_mappings(&mut inner, pid)?);
        inner.by_pid.insert(pid, mappings.clone());
        Ok(mappings)
    }

    /// The build id of the main executable mapping of `pid`, if known.
    pub fn main_build_id(&self, pid: Pid) -> Option<String> {
        let mappings = self.mappings_for_pid(pid).ok()?;
        mappings
            .iter()
            .find(|mapping| !mapping.is_unsymbolizable() && !mapping.build_id.is_empty())
            .map(|mapping| mapping.build_id.clone())
    }

    fn read_mappings(
        inner: &mut MappingCacheInner,
        pid: Pid,
    ) -> Result<Vec<Arc<Mapping>>, MappingError> {
        let process = procfs::process::Process::new(pid as i32)
            .map_err(|source| MappingError::Maps { pid, source })?;
        let maps = process
            .maps()
            .map_err(|source| MappingError::Maps { pid, source })?;

        let mut mappings = Vec::new();
        for map in maps.iter() {
            if !map.perms.contains(procfs::process::MMPermissions::EXECUTE) {
                continue;
            }

            let file = match &map.pathname {
                procfs::process::MMapPath::Path(path) => path.to_string_lossy().to_string(),
                procfs::process::MMapPath::Heap => "[heap]".to_string(),
                procfs::process::MMapPath::Stack => "[stack]".to_string(),
                procfs::process::MMapPath::TStack(tid) => format!("[stack:{}]", tid),
                procfs::process::MMapPath::Vdso => "[vdso]".to_string(),
                procfs::process::MMapPath::Vvar => "[vvar]".to_string(),
                procfs::process::MMapPath::Vsyscall => "[vsyscall]".to_string(),
                procfs::process::MMapPath::Anonymous => String::new(),
                other => format!("{:?}", other),
            };

            let mut mapping = Mapping {
                start: map.address.0,
                limit: map.address.1,
                offset: map.offset,
                file,
                build_id: String::new(),
            };

            if !mapping.is_unsymbolizable() {
                // Open through /proc/<pid>/root so files in other mount
                // namespaces resolve too.
                let abs_path = format!("/proc/{}/root{}", pid, mapping.file);
                mapping.build_id = match inner.build_ids.get(&abs_path) {
                    Some(build_id) => build_id.clone(),
                    None => {
                        let build_id = match object::file_build_id(std::path::Path::new(&abs_path)) {
                            Ok(build_id) => build_id,
                            Err(e) => {
                                debug!("build id of {} failed with {:?}", abs_path, e);
                                String::new()
                            }
                        };
                        inner.build_ids.insert(abs_path, build_id.clone());
                        build_id
                    }
                };
            }

            mappings.push(Arc::new(mapping));
        }

        Ok(mappings)
    }
}

/// A mapping observed in a round, together with the process it belongs to.
/// This is what the debug info uploader consumes.
#[derive(Clone)]
pub struct ProcessMapping {
    pub pid: Pid,
    pub mapping: Arc<Mapping>,
}

/// Collects the mappings actually referenced while building one round's
/// profiles, in first-use order. Every per-process profile of the round
/// shares this list, and mapping ids are assigned from its order at
/// emission time.
pub struct RoundMappings<'a> {
    cache: &'a MappingCache,
    seen: HashSet<(Pid, u64)>,
    mappings: Vec<Arc<Mapping>>,
    mapped_files: Vec<ProcessMapping>,
}

impl<'a> RoundMappings<'a> {
    pub fn new(cache: &'a MappingCache) -> Self {
        RoundMappings {
            cache,
            seen: HashSet::new(),
            mappings: Vec::new(),
            mapped_files: Vec::new(),
        }
    }

    pub fn mapping_for(&mut self, pid: Pid, addr: u64) -> Result<Arc<Mapping>, MappingError> {
        let mapping = self.cache.mapping_for(pid, addr)?;
        if self.seen.insert((pid, mapping.start)) {
            self.mappings.push(mapping.clone());
            self.mapped_files.push(ProcessMapping {
                pid,
                mapping: mapping.clone(),
            });
        }
        Ok(mapping)
    }

    pub fn all_mappings(self) -> (Vec<Arc<Mapping>>, Vec<ProcessMapping>) {
        (self.mappings, self.mapped_files)
    }
}
