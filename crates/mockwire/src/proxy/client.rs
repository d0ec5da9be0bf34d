//! Upstream HTTP client shared by all proxied requests.

use http_body_util::Full;
use hyper::body::Bytes;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;
use tracing::info;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

pub type HttpClient = Client<hyper_rustls::HttpsConnector<HttpConnector>, Full<Bytes>>;

/// Pooled HTTP/1.1 client for both `http` and `https` targets, verifying
/// certificates against the platform roots.
pub fn create_http_client() -> Result<HttpClient, anyhow::Error> {
    // Several rustls providers may be compiled in; pick one explicitly.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let mut http_connector = HttpConnector::new();
    http_connector.set_connect_timeout(Some(CONNECT_TIMEOUT));
    http_connector.enforce_http(false);

    let https_connector = hyper_rustls::HttpsConnectorBuilder::new()
        .with_native_roots()
        .map_err(|e| anyhow::anyhow!("Failed to load native root certificates: {e}"))?
        .https_or_http()
        .enable_http1()
        .wrap_connector(http_connector);

    let client = Client::builder(TokioExecutor::new())
        .pool_idle_timeout(POOL_IDLE_TIMEOUT)
        .build(https_connector);

    info!(
        "Upstream client configured (HTTP/1.1): connect_timeout={}s, idle_timeout={}s",
        CONNECT_TIMEOUT.as_secs(),
        POOL_IDLE_TIMEOUT.as_secs()
    );
    Ok(client)
}
