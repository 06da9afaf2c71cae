use std::collections::hash_map::Entry;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use anyhow::Result;

use filament_proto::profile::pprof;

use crate::bpf::maps::{CombinedStack, STACK_DEPTH};
use crate::ksym::KsymCache;
use crate::mappings::Mapping;
use crate::process::Pid;

/// We sample at 100Hz, which is every 10 million nanoseconds.
pub const PERIOD_NANOS: i64 = 10_000_000;

pub const PROFILE_NAME_LABEL: &str = "__name__";
/// The profile family name the store matches series on.
pub const PROFILE_NAME: &str = "tiny_profiler_cpu";

/// Labels attached to an emitted profile. A BTreeMap keeps them sorted by
/// key, which is what the remote store expects of a label set.
pub type Labels = BTreeMap<String, String>;

/// A code address observed in some stack during a round. `id` is its
/// 1-based position in the profile's location table.
#[derive(Debug)]
pub struct Location {
    pub id: u64,
    pub address: u64,
    /// None when no mapping of the process contains the address.
    pub mapping: Option<Arc<Mapping>>,
}

/// An aggregated stack observation. `locations` holds location ids, leaf
/// first, kernel frames before user frames.
#[derive(Debug)]
pub struct Sample {
    pub value: i64,
    pub locations: Vec<u64>,
}

/// The per-process profile of one round, ready for pprof conversion.
pub struct RoundProfile {
    pub pid: Pid,
    pub capture_time: SystemTime,
    pub samples: HashMap<CombinedStack, Sample>,
    pub all_locations: Vec<Location>,
    /// User locations grouped by pid. Kept around for when samples of
    /// children end up attributed to a process group leader.
    pub user_locations: HashMap<Pid, Vec<u64>>,
    pub kernel_locations: Vec<u64>,
    pub user_mappings: Vec<Arc<Mapping>>,
    pub kernel_mapping: Arc<Mapping>,
}

/// Accumulates samples and their locations for one process within a round.
///
/// Locations are deduplicated by `(pid_marker, address)` where the marker is
/// 0 for kernel frames, so a given address resolves to exactly one location
/// per profile. Ids are handed out in insertion order starting at 1.
pub struct ProcessProfileBuilder {
    pid: Pid,
    kernel_mapping: Arc<Mapping>,
    samples: HashMap<CombinedStack, Sample>,
    all_locations: Vec<Location>,
    location_indices: HashMap<(Pid, u64), usize>,
    user_locations: HashMap<Pid, Vec<u64>>,
    kernel_locations: Vec<u64>,
}

impl ProcessProfileBuilder {
    pub fn new(pid: Pid, kernel_mapping: Arc<Mapping>) -> Self {
        ProcessProfileBuilder {
            pid,
            kernel_mapping,
            samples: HashMap::new(),
            all_locations: Vec::new(),
            location_indices: HashMap::new(),
            user_locations: HashMap::new(),
            kernel_locations: Vec::new(),
        }
    }

    /// Registers one drained count. The first time a combined stack is seen
    /// its locations get built through `resolve_user_addr`, which maps a
    /// runtime user-space address to its normalized address and mapping;
    /// subsequent observations only bump the count.
    pub fn add_stack_count(
        &mut self,
        stack: CombinedStack,
        count: u64,
        resolve_user_addr: &mut dyn FnMut(Pid, u64) -> (u64, Option<Arc<Mapping>>),
    ) {
        if let Some(sample) = self.samples.get_mut(&stack) {
            sample.value += count as i64;
            return;
        }

        let mut sample_locations = Vec::new();

        // Collect kernel stack trace samples.
        for &addr in &stack[STACK_DEPTH..] {
            if addr == 0 {
                break;
            }
            sample_locations.push(self.kernel_location(addr));
        }

        // Collect user stack trace samples.
        for &addr in &stack[..STACK_DEPTH] {
            if addr == 0 {
                break;
            }
            sample_locations.push(self.user_location(addr, resolve_user_addr));
        }

        self.samples.insert(
            stack,
            Sample {
                value: count as i64,
                locations: sample_locations,
            },
        );
    }

    fn kernel_location(&mut self, addr: u64) -> u64 {
        // PID 0 is not a real process, so it marks kernel locations.
        let key = (0, addr);
        match self.location_indices.entry(key) {
            Entry::Occupied(entry) => self.all_locations[*entry.get()].id,
            Entry::Vacant(entry) => {
                let index = self.all_locations.len();
                let id = index as u64 + 1;
                self.all_locations.push(Location {
                    id,
                    address: addr,
                    mapping: Some(self.kernel_mapping.clone()),
                });
                self.kernel_locations.push(id);
                entry.insert(index);
                id
            }
        }
    }

    fn user_location(
        &mut self,
        addr: u64,
        resolve_user_addr: &mut dyn FnMut(Pid, u64) -> (u64, Option<Arc<Mapping>>),
    ) -> u64 {
        // Deduplicated on the runtime address; the stored address is the
        // normalized one.
        let key = (self.pid, addr);
        if let Some(&index) = self.location_indices.get(&key) {
            return self.all_locations[index].id;
        }

        let (normalized_addr, mapping) = resolve_user_addr(self.pid, addr);
        let index = self.all_locations.len();
        let id = index as u64 + 1;
        self.all_locations.push(Location {
            id,
            address: normalized_addr,
            mapping,
        });
        self.user_locations.entry(self.pid).or_default().push(id);
        self.location_indices.insert(key, index);
        id
    }

    pub fn has_samples(&self) -> bool {
        !self.samples.is_empty()
    }

    pub fn build(
        self,
        capture_time: SystemTime,
        user_mappings: Vec<Arc<Mapping>>,
    ) -> RoundProfile {
        RoundProfile {
            pid: self.pid,
            capture_time,
            samples: self.samples,
            all_locations: self.all_locations,
            user_locations: self.user_locations,
            kernel_locations: self.kernel_locations,
            user_mappings,
            kernel_mapping: self.kernel_mapping,
        }
    }
}

/// String table of a pprof profile under construction. Index 0 is always
/// the empty string.
struct StringTable {
    known: HashMap<String, i64>,
    table: Vec<String>,
}

impl StringTable {
    fn new() -> Self {
        StringTable {
            known: HashMap::from([(String::new(), 0)]),
            table: vec![String::new()],
        }
    }

    fn get_or_insert(&mut self, string: &str) -> i64 {
        match self.known.entry(string.to_string()) {
            Entry::Occupied(o) => *o.get(),
            Entry::Vacant(v) => {
                let id = self.table.len() as i64;
                v.insert(id);
                self.table.push(string.to_string());
                id
            }
        }
    }
}

/// Converts a round profile into its pprof encoding, resolving kernel
/// frames to function names on the way.
pub fn to_pprof(
    profile: &RoundProfile,
    ksym_cache: &KsymCache,
    now: SystemTime,
) -> Result<pprof::Profile> {
    let mut strings = StringTable::new();

    let sample_type = pprof::ValueType {
        r#type: strings.get_or_insert("samples"),
        unit: strings.get_or_insert("count"),
    };
    let period_type = pprof::ValueType {
        r#type: strings.get_or_insert("cpu"),
        unit: strings.get_or_insert("nanoseconds"),
    };

    // Mapping ids follow the round's first-use order; the kernel mapping
    // always comes last.
    let mut mapping_ids: HashMap<*const Mapping, u64> = HashMap::new();
    let mut mappings = Vec::with_capacity(profile.user_mappings.len() + 1);
    for user_mapping in &profile.user_mappings {
        let id = mappings.len() as u64 + 1;
        mapping_ids.insert(Arc::as_ptr(user_mapping), id);
        mappings.push(pprof::Mapping {
            id,
            memory_start: user_mapping.start,
            memory_limit: user_mapping.limit,
            file_offset: user_mapping.offset,
            filename: strings.get_or_insert(&user_mapping.file),
            build_id: strings.get_or_insert(&user_mapping.build_id),
            ..Default::default()
        });
    }
    let kernel_mapping_id = mappings.len() as u64 + 1;
    mapping_ids.insert(Arc::as_ptr(&profile.kernel_mapping), kernel_mapping_id);
    mappings.push(pprof::Mapping {
        id: kernel_mapping_id,
        filename: strings.get_or_insert(&profile.kernel_mapping.file),
        build_id: strings.get_or_insert(&profile.kernel_mapping.build_id),
        ..Default::default()
    });

    let mut locations = Vec::with_capacity(profile.all_locations.len());
    for location in &profile.all_locations {
        let mapping_id = location
            .mapping
            .as_ref()
            .and_then(|mapping| mapping_ids.get(&Arc::as_ptr(mapping)).copied())
            .unwrap_or(0);
        locations.push(pprof::Location {
            id: location.id,
            mapping_id,
            address: location.address,
            line: vec![],
            is_folded: false,
        });
    }

    // Resolve kernel functions. One function per unique address, ids
    // assigned in the order the locations were appended.
    let kernel_addresses: HashSet<u64> = profile
        .kernel_locations
        .iter()
        .map(|&id| profile.all_locations[id as usize - 1].address)
        .collect();
    let kernel_symbols = ksym_cache.resolve(&kernel_addresses)?;

    let mut functions = Vec::new();
    let mut function_ids: HashMap<u64, u64> = HashMap::new();
    for &location_id in &profile.kernel_locations {
        let address = profile.all_locations[location_id as usize - 1].address;
        let function_id = match function_ids.entry(address) {
            Entry::Occupied(entry) => *entry.get(),
            Entry::Vacant(entry) => {
                let name = kernel_symbols
                    .get(&address)
                    .map(String::as_str)
                    .unwrap_or(crate::ksym::SYMBOL_NOT_FOUND);
                let name_idx = strings.get_or_insert(name);
                let id = functions.len() as u64 + 1;
                functions.push(pprof::Function {
                    id,
                    name: name_idx,
                    system_name: name_idx,
                    ..Default::default()
                });
                entry.insert(id);
                id
            }
        };
        locations[location_id as usize - 1].line = vec![pprof::Line {
            function_id,
            line: 0,
        }];
    }

    let samples = profile
        .samples
        .values()
        .map(|sample| pprof::Sample {
            location_id: sample.locations.clone(),
            value: vec![sample.value],
            label: vec![],
        })
        .collect();

    let time_nanos = profile
        .capture_time
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0);
    let duration_nanos = now
        .duration_since(profile.capture_time)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0);

    Ok(pprof::Profile {
        sample_type: vec![sample_type],
        sample: samples,
        mapping: mappings,
        location: locations,
        function: functions,
        string_table: strings.table,
        time_nanos,
        duration_nanos,
        period_type: Some(period_type),
        period: PERIOD_NANOS,
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::bpf::maps::empty_combined_stack;
    use crate::ksym::Ksym;

    fn user_mapping(start: u64, limit: u64) -> Arc<Mapping> {
        Arc::new(Mapping {
            start,
            limit,
            offset: 0,
            file: "/bin/looper".to_string(),
            build_id: "deadbeef".to_string(),
        })
    }

    fn no_normalization(
        mapping: Arc<Mapping>,
    ) -> impl FnMut(Pid, u64) -> (u64, Option<Arc<Mapping>>) {
        move |_pid, addr| (addr, Some(mapping.clone()))
    }

    #[test]
    fn single_process_single_hot_stack() {
        let kernel_mapping = Arc::new(Mapping::kernel());
        let mapping = user_mapping(0x0, 0x10000);
        let mut builder = ProcessProfileBuilder::new(42, kernel_mapping);

        let mut stack = empty_combined_stack();
        stack[0] = 0xA;
        stack[1] = 0xB;
        builder.add_stack_count(stack, 5, &mut no_normalization(mapping.clone()));

        let profile = builder.build(SystemTime::now(), vec![mapping]);
        assert_eq!(profile.samples.len(), 1);
        let sample = profile.samples.values().next().unwrap();
        assert_eq!(sample.value, 5);
        assert_eq!(sample.locations, vec![1, 2]);
        assert_eq!(profile.all_locations.len(), 2);
        assert_eq!(profile.all_locations[0].address, 0xA);
        assert_eq!(profile.all_locations[1].address, 0xB);
        assert!(profile.kernel_locations.is_empty());
        assert_eq!(profile.user_locations[&42].len(), 2);
    }

    #[test]
    fn kernel_only_stack_resolves_symbols() {
        let kernel_mapping = Arc::new(Mapping::kernel());
        let mut builder = ProcessProfileBuilder::new(7, kernel_mapping);

        let mut stack = empty_combined_stack();
        stack[STACK_DEPTH] = 0xFFFF0100;
        stack[STACK_DEPTH + 1] = 0xFFFF0200;
        builder.add_stack_count(stack, 3, &mut |_, _| unreachable!("no user frames"));

        let profile = builder.build(SystemTime::now(), vec![]);
        assert_eq!(profile.kernel_locations, vec![1, 2]);

        let ksyms = KsymCache::with_symbols(vec![
            Ksym {
                start_addr: 0xFFFF0100,
                symbol_name: "schedule".to_string(),
            },
            Ksym {
                start_addr: 0xFFFF0200,
                symbol_name: "__do_softirq".to_string(),
            },
        ]);
        let pprof_profile = to_pprof(&profile, &ksyms, SystemTime::now()).unwrap();
        filament_proto::profile::validate(&pprof_profile).unwrap();

        assert_eq!(pprof_profile.sample.len(), 1);
        assert_eq!(pprof_profile.sample[0].value, vec![3]);
        assert_eq!(pprof_profile.function.len(), 2);

        let names: Vec<&str> = pprof_profile
            .location
            .iter()
            .map(|location| {
                let function_id = location.line[0].function_id;
                let function = &pprof_profile.function[function_id as usize - 1];
                pprof_profile.string_table[function.name as usize].as_str()
            })
            .collect();
        assert_eq!(names, vec!["schedule", "__do_softirq"]);

        // All kernel locations point at the kernel mapping, which is last.
        let kernel_mapping_id = pprof_profile.mapping.last().unwrap().id;
        assert_eq!(kernel_mapping_id, pprof_profile.mapping.len() as u64);
        for location in &pprof_profile.location {
            assert_eq!(location.mapping_id, kernel_mapping_id);
        }
    }

    #[test]
    fn repeated_stack_accumulates_count_once_located() {
        let kernel_mapping = Arc::new(Mapping::kernel());
        let mapping = user_mapping(0x0, 0x10000);
        let mut builder = ProcessProfileBuilder::new(42, kernel_mapping);

        let mut stack = empty_combined_stack();
        stack[0] = 0xA;

        let mut calls = 0;
        let mut resolve = |_pid: Pid, addr: u64| {
            calls += 1;
            (addr, Some(mapping.clone()))
        };
        builder.add_stack_count(stack, 2, &mut resolve);
        builder.add_stack_count(stack, 3, &mut resolve);
        drop(resolve);

        assert_eq!(calls, 1);
        let sample = &builder.samples[&stack];
        assert_eq!(sample.value, 5);
        assert_eq!(sample.locations, vec![1]);
        assert_eq!(builder.all_locations.len(), 1);
    }

    #[test]
    fn shared_addresses_share_locations_across_samples() {
        let kernel_mapping = Arc::new(Mapping::kernel());
        let mapping = user_mapping(0x0, 0x10000);
        let mut builder = ProcessProfileBuilder::new(42, kernel_mapping);

        let mut first = empty_combined_stack();
        first[0] = 0xA;
        first[1] = 0xB;
        let mut second = empty_combined_stack();
        second[0] = 0xA;
        second[1] = 0xC;

        builder.add_stack_count(first, 1, &mut no_normalization(mapping.clone()));
        builder.add_stack_count(second, 1, &mut no_normalization(mapping.clone()));

        // 0xA is shared, 0xB and 0xC are distinct.
        assert_eq!(builder.all_locations.len(), 3);
        assert_eq!(builder.samples[&first].locations, vec![1, 2]);
        assert_eq!(builder.samples[&second].locations, vec![1, 3]);
    }

    #[test]
    fn kernel_and_user_halves_keep_kernel_first() {
        let kernel_mapping = Arc::new(Mapping::kernel());
        let mapping = user_mapping(0x0, 0x10000);
        let mut builder = ProcessProfileBuilder::new(42, kernel_mapping);

        let mut stack = empty_combined_stack();
        stack[0] = 0x100;
        stack[STACK_DEPTH] = 0xFFFF0100;
        builder.add_stack_count(stack, 1, &mut no_normalization(mapping));

        let sample = &builder.samples[&stack];
        // Kernel frame first, then the user frame.
        assert_eq!(sample.locations, vec![1, 2]);
        assert_eq!(builder.kernel_locations, vec![1]);
        assert_eq!(builder.user_locations[&42], vec![2]);
    }

    #[test]
    fn zeroes_terminate_each_half() {
        let kernel_mapping = Arc::new(Mapping::kernel());
        let mapping = user_mapping(0x0, 0x10000);
        let mut builder = ProcessProfileBuilder::new(42, kernel_mapping);

        let mut stack = empty_combined_stack();
        stack[0] = 0xA;
        // stack[1] is zero, so this frame is unreachable.
        stack[2] = 0xB;
        builder.add_stack_count(stack, 1, &mut no_normalization(mapping));

        assert_eq!(builder.all_locations.len(), 1);
        assert_eq!(builder.all_locations[0].address, 0xA);
    }

    #[test]
    fn missing_mapping_keeps_address_untouched() {
        let kernel_mapping = Arc::new(Mapping::kernel());
        let mut builder = ProcessProfileBuilder::new(42, kernel_mapping);

        let mut stack = empty_combined_stack();
        stack[0] = 0xDEAD;
        builder.add_stack_count(stack, 1, &mut |_, addr| (addr, None));

        let profile = builder.build(SystemTime::now(), vec![]);
        assert_eq!(profile.all_locations[0].address, 0xDEAD);
        assert!(profile.all_locations[0].mapping.is_none());

        let ksyms = KsymCache::with_symbols(vec![]);
        let pprof_profile = to_pprof(&profile, &ksyms, SystemTime::now()).unwrap();
        filament_proto::profile::validate(&pprof_profile).unwrap();
        // Null mapping encodes as mapping_id 0.
        assert_eq!(pprof_profile.location[0].mapping_id, 0);
        assert_eq!(pprof_profile.location[0].address, 0xDEAD);
    }

    #[test]
    fn pprof_numerics() {
        let kernel_mapping = Arc::new(Mapping::kernel());
        let mapping = user_mapping(0x0, 0x10000);
        let mut builder = ProcessProfileBuilder::new(42, kernel_mapping);

        let mut stack = empty_combined_stack();
        stack[0] = 0xA;
        builder.add_stack_count(stack, 1, &mut no_normalization(mapping.clone()));

        let capture_time = UNIX_EPOCH + std::time::Duration::from_secs(1_000);
        let now = capture_time + std::time::Duration::from_secs(10);
        let profile = builder.build(capture_time, vec![mapping]);

        let ksyms = KsymCache::with_symbols(vec![]);
        let pprof_profile = to_pprof(&profile, &ksyms, now).unwrap();
        filament_proto::profile::validate(&pprof_profile).unwrap();

        assert_eq!(pprof_profile.period, PERIOD_NANOS);
        assert_eq!(pprof_profile.time_nanos, 1_000 * 1_000_000_000);
        assert_eq!(pprof_profile.duration_nanos, 10 * 1_000_000_000);

        let sample_type = &pprof_profile.sample_type[0];
        assert_eq!(
            pprof_profile.string_table[sample_type.r#type as usize],
            "samples"
        );
        assert_eq!(pprof_profile.string_table[sample_type.unit as usize], "count");
        let period_type = pprof_profile.period_type.as_ref().unwrap();
        assert_eq!(
            pprof_profile.string_table[period_type.r#type as usize],
            "cpu"
        );
        assert_eq!(
            pprof_profile.string_table[period_type.unit as usize],
            "nanoseconds"
        );

        // User mappings come first with ids from insertion order, the
        // kernel mapping is last.
        assert_eq!(pprof_profile.mapping.len(), 2);
        assert_eq!(pprof_profile.mapping[0].id, 1);
        assert_eq!(pprof_profile.mapping[0].memory_limit, 0x10000);
        let kernel = pprof_profile.mapping.last().unwrap();
        assert_eq!(kernel.id, 2);
        assert_eq!(
            pprof_profile.string_table[kernel.filename as usize],
            crate::mappings::KERNEL_MAPPING_FILE
        );
    }

    #[test]
    fn location_ids_match_their_position() {
        let kernel_mapping = Arc::new(Mapping::kernel());
        let mapping = user_mapping(0x0, 0x10000);
        let mut builder = ProcessProfileBuilder::new(42, kernel_mapping);

        let mut stack = empty_combined_stack();
        for i in 0..5 {
            stack[i] = 0x100 + i as u64;
        }
        stack[STACK_DEPTH] = 0xFFFF0100;
        builder.add_stack_count(stack, 1, &mut no_normalization(mapping));

        let profile = builder.build(SystemTime::now(), vec![]);
        for (index, location) in profile.all_locations.iter().enumerate() {
            assert_eq!(location.id, index as u64 + 1);
        }
        // Every sample location references an existing location.
        for sample in profile.samples.values() {
            for &id in &sample.locations {
                assert!(profile.all_locations.get(id as usize - 1).is_some());
            }
        }
    }
}
