pub mod maps;
pub mod profiler_bindings;
#[allow(clippy::all)]
pub mod profiler_skel;
