pub mod bpf;
pub mod buffer_pool;
pub mod debug_info;
pub mod ksym;
pub mod mappings;
pub mod metrics;
pub mod object;
pub mod perf_events;
pub mod process;
pub mod profile;
pub mod profiler;
pub mod server;
pub mod store;
pub mod writer;
