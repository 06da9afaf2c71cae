use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use nix::unistd::Uid;
use tokio::signal;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, Level};
use tracing_subscriber::FmtSubscriber;

use filament::debug_info::{
    DebugInfoBackendFilesystem, DebugInfoBackendRemote, DebugInfoManager, DebugInfoUploader,
};
use filament::object::ObjectFileCache;
use filament::profiler::{LoopClock, Profiler, ProfilerOptions};
use filament::server;
use filament::store::{BatchWriteClient, GrpcProfileStore, RemoteStoreConfig};
use filament::writer::{FileWriter, ProfileWriter, RemoteWriter};

mod args;
mod validators;

use crate::args::CliArgs;
use crate::args::LoggingLevel;
use crate::validators::parse_listen_addr;

fn main() {
    let args = CliArgs::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(match args.log_level {
            LoggingLevel::Error => Level::ERROR,
            LoggingLevel::Warn => Level::WARN,
            LoggingLevel::Info => Level::INFO,
            LoggingLevel::Debug => Level::DEBUG,
        })
        .with_ansi(std::io::stderr().is_terminal())
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    if let Err(e) = run(args) {
        error!("{:?}", e);
        std::process::exit(1);
    }
}

fn run(args: CliArgs) -> Result<()> {
    if !Uid::effective().is_root() {
        bail!("root permissions are required to run filament");
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("build runtime")?;
    runtime.block_on(supervise(args))
}

/// Reads the bearer token from the flag or the token file.
fn bearer_token(args: &CliArgs) -> Result<Option<String>> {
    if let Some(token) = &args.remote_store_bearer_token {
        return Ok(Some(token.clone()));
    }
    if let Some(path) = &args.remote_store_bearer_token_file {
        let token = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read bearer token from {}", path.display()))?;
        return Ok(Some(token.trim().to_string()));
    }
    Ok(None)
}

/// Wires the sinks and runs everything as a group of cancellable tasks:
/// the profiler loop, the HTTP server, the remote batch write client when a
/// remote store is configured, and the signal handler. The first task to
/// finish, cleanly or not, takes the whole group down.
async fn supervise(args: CliArgs) -> Result<()> {
    info!("filament starting...");
    if let Some(address) = &args.remote_store_address {
        info!("profiles will be sent to {}", address);
    }

    let http_addr = parse_listen_addr(&args.http_address).map_err(|e| anyhow!(e))?;
    let clock = LoopClock::shared();
    let object_file_cache = Arc::new(ObjectFileCache::new());
    let token = CancellationToken::new();

    let mut profile_writer: Option<Box<dyn ProfileWriter>> = None;
    let mut debuginfo_manager: Option<Box<dyn DebugInfoManager>> = None;
    let mut batcher: Option<Arc<BatchWriteClient>> = None;

    if !args.local_store_directory.is_empty() {
        profile_writer = Some(Box::new(FileWriter::new(PathBuf::from(
            &args.local_store_directory,
        ))));
        if !args.remote_store_debuginfo_upload_disable {
            debuginfo_manager = Some(Box::new(DebugInfoBackendFilesystem {
                path: PathBuf::from(&args.local_store_directory).join("debuginfo"),
            }));
        }
    }

    if let Some(address) = &args.remote_store_address {
        let bearer = bearer_token(&args)?;
        let store = GrpcProfileStore::connect(&RemoteStoreConfig {
            address: address.clone(),
            bearer_token: bearer.clone(),
            insecure: args.remote_store_insecure,
            insecure_skip_verify: args.remote_store_insecure_skip_verify,
        })?;
        let batch_client = Arc::new(BatchWriteClient::new(Arc::new(store)));
        profile_writer = Some(Box::new(RemoteWriter::new(batch_client.clone())));
        batcher = Some(batch_client);

        if !args.remote_store_debuginfo_upload_disable {
            info!("debug information collection is enabled");
            let scheme = if args.remote_store_insecure {
                "http"
            } else {
                "https"
            };
            debuginfo_manager = Some(Box::new(DebugInfoBackendRemote {
                server_url: format!("{}://{}", scheme, address),
                token: bearer,
            }));
        }
    }

    let mut tasks: JoinSet<Result<()>> = JoinSet::new();

    // Signal handler. A received signal is the clean way out.
    {
        let token = token.clone();
        tasks.spawn(async move {
            shutdown_signal().await;
            info!("signal received, stopping...");
            token.cancel();
            Ok(())
        });
    }

    // Metrics and runtime introspection.
    {
        let token = token.clone();
        let clock = clock.clone();
        tasks.spawn(async move { server::serve(http_addr, clock, token).await });
    }

    // Remote batch write client.
    if let Some(batcher) = batcher {
        let token = token.clone();
        tasks.spawn(async move { batcher.run(token).await });
    }

    // Debug info uploader.
    let debuginfo_uploader = match debuginfo_manager {
        Some(manager) => {
            let (uploader, worker) = DebugInfoUploader::new(manager, object_file_cache.clone());
            let token = token.clone();
            tasks.spawn(async move { worker.run(token).await });
            Some(uploader)
        }
        None => None,
    };

    // The profiler loop runs on its own thread; the BPF handles never
    // leave it. The cancellation token is bridged into its stop channel.
    let (stop_sender, stop_receiver) = crossbeam_channel::bounded(1);
    {
        let token = token.clone();
        tokio::spawn(async move {
            token.cancelled().await;
            let _ = stop_sender.send(());
        });
    }
    {
        let node = args.node.clone();
        let profiling_duration: Duration = args.profiling_duration;
        let clock = clock.clone();
        let object_file_cache = object_file_cache.clone();
        tasks.spawn_blocking(move || {
            let profiler = Profiler::new(
                node,
                profiling_duration,
                clock,
                object_file_cache,
                ProfilerOptions {
                    profile_writer,
                    debuginfo_uploader,
                },
            )?;
            profiler.run(stop_receiver)
        });
    }

    // The first task to finish cancels all others; the first error wins.
    let mut result = Ok(());
    while let Some(joined) = tasks.join_next().await {
        token.cancel();
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                if result.is_ok() {
                    result = Err(e);
                }
            }
            Err(e) => {
                if result.is_ok() {
                    result = Err(anyhow!("task failed: {}", e));
                }
            }
        }
    }

    debug!("all tasks finished");
    result
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        CliArgs::command().debug_assert()
    }

    #[test]
    fn bearer_token_prefers_the_flag() {
        let mut args = CliArgs::parse_from(["filament"]);
        assert_eq!(bearer_token(&args).unwrap(), None);

        args.remote_store_bearer_token = Some("secret".to_string());
        assert_eq!(bearer_token(&args).unwrap(), Some("secret".to_string()));
    }

    #[test]
    fn bearer_token_file_is_trimmed() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "secret-from-file\n").unwrap();

        let mut args = CliArgs::parse_from(["filament"]);
        args.remote_store_bearer_token_file = Some(file.path().to_path_buf());
        assert_eq!(
            bearer_token(&args).unwrap(),
            Some("secret-from-file".to_string())
        );
    }

    #[test]
    fn missing_bearer_token_file_is_a_configuration_error() {
        let mut args = CliArgs::parse_from(["filament"]);
        args.remote_store_bearer_token_file = Some(PathBuf::from("/does/not/exist"));
        assert!(bearer_token(&args).is_err());
    }
}
