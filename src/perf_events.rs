use std::fs;
use std::os::raw::c_int;

use anyhow::{Context, Result};
use perf_event_open_sys as sys;

const ONLINE_CPUS_PATH: &str = "/sys/devices/system/cpu/online";

/// Opens the sampling event for one CPU: a software CPU clock in frequency
/// mode at `sample_freq` Hz. The event is created disabled and only starts
/// firing once the sampler program is attached to it.
pub fn open_cpu_clock_event(cpu: u32, sample_freq: u64) -> Result<c_int> {
    let mut attrs = sys::bindings::perf_event_attr {
        size: std::mem::size_of::<sys::bindings::perf_event_attr>() as u32,
        type_: sys::bindings::PERF_TYPE_SOFTWARE,
        config: sys::bindings::PERF_COUNT_SW_CPU_CLOCK as u64,
        ..Default::default()
    };
    attrs.set_freq(1);
    attrs.__bindgen_anon_1.sample_freq = sample_freq;
    attrs.set_disabled(1);

    // pid -1 with a concrete CPU samples everything scheduled on that CPU.
    let fd = unsafe { sys::perf_event_open(&mut attrs, -1, cpu as c_int, -1, 0) } as c_int;
    if fd < 0 {
        return Err(std::io::Error::last_os_error())
            .with_context(|| format!("perf_event_open on cpu {cpu}"));
    }

    Ok(fd)
}

/// The CPUs that can currently schedule work. Sampling events are opened
/// on these, not on every possible CPU.
pub fn online_cpus() -> Result<Vec<u32>> {
    let online = fs::read_to_string(ONLINE_CPUS_PATH)
        .with_context(|| format!("read {ONLINE_CPUS_PATH}"))?;
    parse_cpu_list(online.trim_end())
}

/// Parses the kernel's CPU list format: comma separated entries, each
/// either a lone CPU number or an inclusive `start-end` range.
fn parse_cpu_list(list: &str) -> Result<Vec<u32>> {
    let mut cpus = Vec::new();

    for entry in list.split(',') {
        match entry.split_once('-') {
            None => {
                let cpu: u32 = entry
                    .parse()
                    .with_context(|| format!("bad cpu entry {entry:?}"))?;
                cpus.push(cpu);
            }
            Some((start, end)) => {
                let start: u32 = start
                    .parse()
                    .with_context(|| format!("bad start of cpu range {entry:?}"))?;
                let end: u32 = end
                    .parse()
                    .with_context(|| format!("bad end of cpu range {entry:?}"))?;
                cpus.extend(start..=end);
            }
        }
    }

    Ok(cpus)
}
