use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tonic::metadata::{Ascii, MetadataValue};
use tonic::service::interceptor::InterceptedService;
use tonic::service::Interceptor;
use tonic::transport::{Channel, ClientTlsConfig, Endpoint, Uri};
use tonic::Status;
use tower::Service;
use tracing::{debug, warn};

use filament_proto::store::v1::profile_store_service_client::ProfileStoreServiceClient;
use filament_proto::store::v1::{RawProfileSeries, WriteRawRequest};
use filament_proto::store::MAX_MSG_SIZE;

use crate::metrics;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// How often the batch write client ships accumulated series.
pub const BATCH_FLUSH_INTERVAL: Duration = Duration::from_secs(10);

/// Connection parameters of the remote profile store.
#[derive(Debug, Clone, Default)]
pub struct RemoteStoreConfig {
    pub address: String,
    pub bearer_token: Option<String>,
    pub insecure: bool,
    pub insecure_skip_verify: bool,
}

/// Anything profiles can be shipped through with a `WriteRaw` call. The
/// gRPC client and the batching layer in front of it both satisfy this.
#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn write_raw(&self, request: WriteRawRequest) -> Result<()>;
}

/// Injects the bearer token as an `authorization` header on every request.
#[derive(Clone)]
pub struct AuthInterceptor {
    token: Option<MetadataValue<Ascii>>,
}

impl Interceptor for AuthInterceptor {
    fn call(&mut self, mut request: tonic::Request<()>) -> Result<tonic::Request<()>, Status> {
        if let Some(token) = &self.token {
            request.metadata_mut().insert("authorization", token.clone());
        }
        Ok(request)
    }
}

type StoreClient = ProfileStoreServiceClient<InterceptedService<Channel, AuthInterceptor>>;

pub struct GrpcProfileStore {
    client: StoreClient,
}

impl GrpcProfileStore {
    /// Sets up the channel to the store. The connection itself is
    /// established lazily, so failures surface on the first write.
    pub fn connect(config: &RemoteStoreConfig) -> Result<Self> {
        let scheme = if config.insecure { "http" } else { "https" };
        let url = format!("{}://{}", scheme, config.address);
        let endpoint = Endpoint::from_shared(url.clone())
            .with_context(|| format!("invalid remote store address {}", url))?
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT);

        let channel = if config.insecure {
            endpoint.connect_lazy()
        } else if config.insecure_skip_verify {
            let https = skip_verify_connector();
            endpoint.connect_with_connector_lazy(tower::service_fn(move |uri: Uri| {
                let mut https = https.clone();
                async move {
                    let stream = https.call(uri).await?;
                    Ok::<_, Box<dyn std::error::Error + Send + Sync>>(
                        hyper_util::rt::TokioIo::new(stream),
                    )
                }
            }))
        } else {
            endpoint
                .tls_config(ClientTlsConfig::new().with_native_roots())
                .context("remote store TLS configuration")?
                .connect_lazy()
        };

        let token = match &config.bearer_token {
            Some(token) => {
                if config.insecure {
                    // Mirrors the "require transport security" escape hatch
                    // of the bearer credentials.
                    warn!("sending the bearer token over a plaintext connection");
                }
                Some(
                    format!("Bearer {}", token)
                        .parse()
                        .context("bearer token contains invalid characters")?,
                )
            }
            None => None,
        };

        let client =
            ProfileStoreServiceClient::with_interceptor(channel, AuthInterceptor { token })
                .max_decoding_message_size(MAX_MSG_SIZE)
                .max_encoding_message_size(MAX_MSG_SIZE);

        Ok(GrpcProfileStore { client })
    }
}

#[async_trait]
impl ProfileStore for GrpcProfileStore {
    async fn write_raw(&self, request: WriteRawRequest) -> Result<()> {
        let mut client = self.client.clone();
        client
            .write_raw(request)
            .await
            .context("WriteRaw RPC failed")?;
        Ok(())
    }
}

/// Accepts any certificate the server presents. Only used when the operator
/// explicitly asked to skip verification.
#[derive(Debug)]
struct AcceptAnyServerCert;

impl rustls::client::danger::ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// A TLS connector that skips certificate verification. tonic's own TLS
/// configuration does not expose this, so the rustls config is built by
/// hand and handed to the channel as a custom connector.
fn skip_verify_connector(
) -> hyper_rustls::HttpsConnector<hyper_util::client::legacy::connect::HttpConnector> {
    let mut tls = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
        .with_no_client_auth();
    tls.alpn_protocols = vec![b"h2".to_vec()];

    let mut http = hyper_util::client::legacy::connect::HttpConnector::new();
    http.enforce_http(false);

    hyper_rustls::HttpsConnectorBuilder::new()
        .with_tls_config(tls)
        .https_only()
        .enable_http2()
        .wrap_connector(http)
}

/// Buffers series handed to it by the writers and ships everything queued
/// in one `WriteRaw` RPC on a fixed cadence. Flush failures are logged and
/// the batch is dropped, a transient backend is survivable.
pub struct BatchWriteClient {
    store: Arc<dyn ProfileStore>,
    series: Mutex<Vec<RawProfileSeries>>,
}

impl BatchWriteClient {
    pub fn new(store: Arc<dyn ProfileStore>) -> Self {
        BatchWriteClient {
            store,
            series: Mutex::new(Vec::new()),
        }
    }

    /// Queues one series for the next flush. Never blocks.
    pub fn enqueue(&self, series: RawProfileSeries) {
        self.series.lock().push(series);
    }

    pub async fn run(&self, token: CancellationToken) -> Result<()> {
        let mut ticker = tokio::time::interval(BATCH_FLUSH_INTERVAL);
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    // One last flush so profiles emitted right before
                    // shutdown are not lost.
                    self.flush().await;
                    return Ok(());
                }
                _ = ticker.tick() => {
                    self.flush().await;
                }
            }
        }
    }

    pub(crate) async fn flush(&self) {
        let series = std::mem::take(&mut *self.series.lock());
        if series.is_empty() {
            return;
        }

        debug!("flushing {} series to the remote store", series.len());
        let request = WriteRawRequest {
            series,
            normalized: true,
        };
        match self.store.write_raw(request).await {
            Ok(()) => {
                metrics::BATCH_FLUSHES_TOTAL.with_label_values(&["ok"]).inc();
            }
            Err(e) => {
                metrics::BATCH_FLUSHES_TOTAL
                    .with_label_values(&["error"])
                    .inc();
                warn!("failed to flush profiles to the remote store: {:?}", e);
            }
        }
    }
}
