use libbpf_rs::MapCore;
use libbpf_rs::MapFlags;
use libbpf_rs::MapMut;
use thiserror::Error;
use tracing::debug;

use crate::bpf::profiler_bindings::{stack_count_key_t, stack_trace_t, MAX_STACK_DEPTH};

pub const STACK_DEPTH: usize = MAX_STACK_DEPTH as usize;
pub const DOUBLE_STACK_DEPTH: usize = STACK_DEPTH * 2;

/// One user stack followed by one kernel stack. The user half lives in
/// `[0..STACK_DEPTH)`, the kernel half in `[STACK_DEPTH..DOUBLE_STACK_DEPTH)`.
/// A zero address terminates each half. Within a profiling round this is the
/// identity of a sample.
pub type CombinedStack = [u64; DOUBLE_STACK_DEPTH];

pub fn empty_combined_stack() -> CombinedStack {
    [0; DOUBLE_STACK_DEPTH]
}

#[derive(Debug, Error)]
pub enum StackReadError {
    /// The kernel did not capture this half of the stack.
    #[error("no stack captured, id is {0}")]
    NoStack(i32),
    /// The stack id was captured but has since been evicted from the stack
    /// traces map.
    #[error("stack id {0} not found in the stack traces map")]
    NotFound(i32),
    /// The map itself could not be read, e.g. its descriptor is invalid.
    /// There is no point continuing the round when this happens.
    #[error("reading the stack traces map failed: {0}")]
    Map(#[from] libbpf_rs::Error),
}

impl StackReadError {
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, StackReadError::Map(_))
    }
}

/// Typed access to the two maps shared with the in-kernel sampler: the
/// aggregated stack counts and the stack traces they reference. The kernel
/// keeps writing while we read, so iteration tolerates entries appearing and
/// disappearing under it.
pub struct BpfMaps<'a> {
    counts: &'a MapMut<'a>,
    stack_traces: &'a MapMut<'a>,
}

impl<'a> BpfMaps<'a> {
    pub fn new(counts: &'a MapMut<'a>, stack_traces: &'a MapMut<'a>) -> Self {
        BpfMaps {
            counts,
            stack_traces,
        }
    }

    /// Returns the raw keys of the stack counts map. The order is
    /// unspecified and entries might race with the kernel-side writers.
    pub fn iter_counts(&self) -> impl Iterator<Item = Vec<u8>> + '_ {
        self.counts.keys()
    }

    /// Decodes a raw key of the stack counts map.
    pub fn parse_count_key(key_bytes: &[u8]) -> Result<stack_count_key_t, StackReadError> {
        let key: &stack_count_key_t = plain::from_bytes(key_bytes)
            .map_err(|_| StackReadError::Map(libbpf_rs::Error::from_raw_os_error(libc::EINVAL)))?;
        Ok(*key)
    }

    /// Reads the count for the given raw key, in host byte order.
    pub fn read_stack_count(&self, key_bytes: &[u8]) -> Result<u64, StackReadError> {
        match self.counts.lookup(key_bytes, MapFlags::ANY)? {
            Some(value_bytes) => {
                let count = u64::from_ne_bytes(value_bytes.as_slice().try_into().map_err(|_| {
                    StackReadError::Map(libbpf_rs::Error::from_raw_os_error(libc::EINVAL))
                })?);
                Ok(count)
            }
            None => Ok(0),
        }
    }

    /// Fills the user half of `stack` with the stack trace stored under
    /// `stack_id`.
    pub fn read_user_stack(
        &self,
        stack_id: i32,
        stack: &mut CombinedStack,
    ) -> Result<(), StackReadError> {
        let trace = self.read_stack_trace(stack_id)?;
        stack[..STACK_DEPTH].copy_from_slice(&trace.addresses);
        Ok(())
    }

    /// Fills the kernel half of `stack` with the stack trace stored under
    /// `stack_id`.
    pub fn read_kernel_stack(
        &self,
        stack_id: i32,
        stack: &mut CombinedStack,
    ) -> Result<(), StackReadError> {
        let trace = self.read_stack_trace(stack_id)?;
        stack[STACK_DEPTH..].copy_from_slice(&trace.addresses);
        Ok(())
    }

    fn read_stack_trace(&self, stack_id: i32) -> Result<stack_trace_t, StackReadError> {
        // The kernel stack trace helper returns a negative value when it
        // could not capture a stack.
        if stack_id < 0 {
            return Err(StackReadError::NoStack(stack_id));
        }

        match self
            .stack_traces
            .lookup(&(stack_id as u32).to_ne_bytes(), MapFlags::ANY)?
        {
            Some(stack_bytes) => {
                let mut trace = stack_trace_t::default();
                plain::copy_from_bytes(&mut trace, &stack_bytes).map_err(|_| {
                    StackReadError::Map(libbpf_rs::Error::from_raw_os_error(libc::EINVAL))
                })?;
                Ok(trace)
            }
            None => Err(StackReadError::NotFound(stack_id)),
        }
    }

    /// Deletes every entry of both maps. Runs at the end of each round so
    /// that counts never leak into the next one.
    pub fn clean(&self) -> Result<(), libbpf_rs::Error> {
        Self::clear_map(self.counts, "counts")?;
        Self::clear_map(self.stack_traces, "stack_traces")?;
        Ok(())
    }

    /// Clears a BPF map in a iterator-stable way.
    fn clear_map(map: &MapMut, name: &str) -> Result<(), libbpf_rs::Error> {
        let mut total_entries = 0;
        let mut failures = 0;
        let mut last_error = None;
        let mut previous_key: Option<Vec<u8>> = None;

        let mut delete_entry = |previous_key: Option<Vec<u8>>| {
            if let Some(previous_key) = previous_key {
                if let Err(e) = map.delete(&previous_key) {
                    failures += 1;
                    last_error = Some(e);
                }
            }
        };

        for key in map.keys() {
            delete_entry(previous_key);
            total_entries += 1;
            previous_key = Some(key);
        }

        // Delete last entry.
        delete_entry(previous_key);

        debug!(
            "clearing map {} found {} entries, failed to delete {} entries",
            name, total_entries, failures
        );

        match last_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
