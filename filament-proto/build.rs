use prost_types::FileDescriptorSet;

const PROTO_DIR: &str = "src/protos";

fn descriptors(proto: &str) -> FileDescriptorSet {
    protox::compile([format!("{PROTO_DIR}/{proto}")], [PROTO_DIR])
        .unwrap_or_else(|e| panic!("compiling {proto} failed: {e}"))
}

fn main() {
    // pprof defines no services, plain prost output is all it needs.
    prost_build::compile_fds(descriptors("profile.proto")).expect("generate pprof types");

    // The store proto carries the WriteRaw service, so it goes through
    // tonic to get a client stub as well.
    tonic_build::configure()
        .build_server(false)
        .compile_fds(descriptors("profilestore.proto"))
        .expect("generate profile store client");
}
