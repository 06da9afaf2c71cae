use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::metrics;
use crate::profiler::SharedLoopClock;

/// Serves `/metrics`, `/healthz` and the profiler introspection endpoint
/// until the cancellation token fires.
pub async fn serve(
    addr: SocketAddr,
    clock: SharedLoopClock,
    token: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("could not bind http server to {}", addr))?;
    info!("http server listening on {}", addr);

    loop {
        let (stream, _) = tokio::select! {
            _ = token.cancelled() => return Ok(()),
            accepted = listener.accept() => accepted.context("accept http connection")?,
        };

        let io = TokioIo::new(stream);
        let clock = clock.clone();
        tokio::spawn(async move {
            let service = service_fn(move |request| {
                let clock = clock.clone();
                async move { handle(request, &clock) }
            });
            if let Err(e) = hyper::server::conn::http1::Builder::new()
                .serve_connection(io, service)
                .await
            {
                debug!("http connection error: {:?}", e);
            }
        });
    }
}

fn handle(
    request: Request<hyper::body::Incoming>,
    clock: &SharedLoopClock,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let response = match request.uri().path() {
        "/healthz" => Response::new(Full::new(Bytes::from("ok\n"))),

        "/metrics" => Response::builder()
            .header("Content-Type", "text/plain; version=0.0.4")
            .body(Full::new(Bytes::from(metrics::encode_metrics())))
            .unwrap(),

        // Runtime introspection: when the profiler last completed a round.
        "/debug/profiler" => {
            let clock = *clock.read();
            let unix_seconds = |time: SystemTime| {
                time.duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs())
                    .unwrap_or(0)
            };
            let body = format!(
                "loop_started_at: {}\nlast_successful_loop_started_at: {}\n",
                unix_seconds(clock.loop_started_at),
                unix_seconds(clock.last_successful_loop_started_at),
            );
            Response::new(Full::new(Bytes::from(body)))
        }

        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from("not found\n")))
            .unwrap(),
    };

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::profiler::LoopClock;

    async fn fetch(path: &str) -> (StatusCode, String) {
        let clock = LoopClock::shared();
        let token = CancellationToken::new();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let server = tokio::spawn(serve(addr, clock, token.clone()));
        // Give the listener a moment to come up.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let response = reqwest::get(format!("http://{}{}", addr, path))
            .await
            .unwrap();
        let status = StatusCode::from_u16(response.status().as_u16()).unwrap();
        let body = response.text().await.unwrap();

        token.cancel();
        let _ = server.await;
        (status, body)
    }

    #[tokio::test]
    async fn healthz_responds() {
        let (status, body) = fetch("/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok\n");
    }

    #[tokio::test]
    async fn metrics_are_exposed() {
        crate::metrics::PROFILES_TOTAL.inc();
        let (status, body) = fetch("/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("filament_profiles_total"));
    }

    #[tokio::test]
    async fn unknown_paths_are_not_found() {
        let (status, _) = fetch("/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn profiler_introspection_shows_the_clock() {
        let (status, body) = fetch("/debug/profiler").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("last_successful_loop_started_at"));
    }
}
