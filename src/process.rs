use std::path::PathBuf;

use anyhow::Result;
use tracing::debug;

pub type Pid = u32;

/// The set of processes alive at the start of a profiling round. Samples for
/// pids that are not in here belong to processes that died while their
/// stacks were still sitting in the BPF maps, and get dropped.
pub struct ProcessSnapshot {
    pids: Vec<Pid>,
}

impl ProcessSnapshot {
    pub fn capture() -> Result<Self> {
        let mut pids = Vec::new();
        for process in procfs::process::all_processes()? {
            let Ok(process) = process else {
                // The process went away between readdir and stat.
                continue;
            };
            pids.push(process.pid() as Pid);
        }
        pids.sort_unstable();
        debug!("captured {} running processes", pids.len());
        Ok(ProcessSnapshot { pids })
    }

    #[cfg(test)]
    pub fn with_pids(mut pids: Vec<Pid>) -> Self {
        pids.sort_unstable();
        ProcessSnapshot { pids }
    }

    pub fn contains(&self, pid: Pid) -> bool {
        self.pids.binary_search(&pid).is_ok()
    }

    pub fn len(&self) -> usize {
        self.pids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pids.is_empty()
    }
}

/// Metadata of a live process, stamped onto its profiles as labels.
#[derive(Debug, Clone)]
pub struct ProcessDescriptor {
    pub pid: Pid,
    /// The command name, from the process's comm.
    pub exec: String,
    /// Path of the executable backing the process.
    pub path: PathBuf,
}

impl ProcessDescriptor {
    /// Returns None if the process is gone or cannot be inspected.
    pub fn describe(pid: Pid) -> Option<ProcessDescriptor> {
        let process = procfs::process::Process::new(pid as i32).ok()?;
        let exec = process.stat().ok()?.comm;
        let path = process.exe().unwrap_or_default();
        Some(ProcessDescriptor { pid, exec, path })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_contains_ourselves() {
        let snapshot = ProcessSnapshot::capture().unwrap();
        assert!(!snapshot.is_empty());
        assert!(snapshot.contains(std::process::id()));
    }

    #[test]
    fn snapshot_lookup_is_by_pid() {
        let snapshot = ProcessSnapshot::with_pids(vec![99, 7, 42]);
        assert!(snapshot.contains(7));
        assert!(snapshot.contains(42));
        assert!(snapshot.contains(99));
        assert!(!snapshot.contains(1));
        assert_eq!(snapshot.len(), 3);
    }

    #[test]
    fn describing_ourselves_works() {
        let descriptor = ProcessDescriptor::describe(std::process::id()).unwrap();
        assert!(!descriptor.exec.is_empty());
    }
}
