#[allow(clippy::all)]
pub mod v1 {
    include!(concat!(env!("OUT_DIR"), "/filament.profilestore.v1.rs"));
}

/// Maximum gRPC message size the store accepts, in bytes. Kept in sync with
/// the server's published limit.
pub const MAX_MSG_SIZE: usize = 64 * 1024 * 1024;
