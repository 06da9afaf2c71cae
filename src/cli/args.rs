use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use crate::validators::parse_duration;

#[derive(clap::ValueEnum, Debug, Clone, Default)]
pub(crate) enum LoggingLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
}

#[derive(Parser, Debug)]
pub(crate) struct CliArgs {
    /// Minimum level of emitted log lines
    #[arg(long, default_value_t, value_enum)]
    pub(crate) log_level: LoggingLevel,
    /// Address to bind the HTTP server to
    #[arg(long, default_value = ":6060")]
    pub(crate) http_address: String,
    /// Name of the node the process is running on. Used to identify the
    /// emitted profiles
    #[arg(long, default_value = "localhost")]
    pub(crate) node: String,
    /// The profiling round period, in seconds
    #[arg(long, default_value = "10", value_parser = parse_duration, value_name = "SECONDS")]
    pub(crate) profiling_duration: Duration,
    /// The local directory to store the profiling data. An empty value
    /// disables the local store
    #[arg(long, default_value = "./tmp/profiles")]
    pub(crate) local_store_directory: String,
    /// gRPC address to send profiles and symbols to
    #[arg(long)]
    pub(crate) remote_store_address: Option<String>,
    /// Bearer token to authenticate with the store
    #[arg(long)]
    pub(crate) remote_store_bearer_token: Option<String>,
    /// File to read the bearer token from to authenticate with the store
    #[arg(long)]
    pub(crate) remote_store_bearer_token_file: Option<PathBuf>,
    /// Send gRPC requests via plaintext instead of TLS
    #[arg(long)]
    pub(crate) remote_store_insecure: bool,
    /// Skip TLS certificate verification
    #[arg(long)]
    pub(crate) remote_store_insecure_skip_verify: bool,
    /// Disable debuginfo collection and upload
    #[arg(long)]
    pub(crate) remote_store_debuginfo_upload_disable: bool,
}
