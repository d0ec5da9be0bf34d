//! Listener loop and per-request handling for the interception proxy.

use super::client::HttpClient;
use super::forwarding::{error_response, forward_request};
use super::headers::{set_request_id, VALUE_TRUE, X_MOCKWIRE_MOCKED};
use crate::service::MockService;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::{Body, Bytes};
use hyper::header::HOST;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{HeaderMap, Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Absolute target of a proxied request: the request target itself in
/// absolute form, else `http://` plus the `Host` header.
pub fn target_uri(uri: &Uri, headers: &HeaderMap) -> Option<Uri> {
    if uri.scheme().is_some() && uri.authority().is_some() {
        return Some(uri.clone());
    }
    let host = headers.get(HOST)?.to_str().ok()?;
    let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    format!("http://{host}{path}").parse().ok()
}

pub struct ProxyServer {
    service: Arc<MockService>,
    addr: SocketAddr,
    http_client: HttpClient,
}

impl ProxyServer {
    pub fn new(service: Arc<MockService>, addr: SocketAddr, http_client: HttpClient) -> Self {
        Self {
            service,
            addr,
            http_client,
        }
    }

    /// Bind the configured address and serve until the task is dropped.
    pub async fn run(self) -> Result<(), anyhow::Error> {
        let listener = TcpListener::bind(self.addr).await?;
        self.serve(listener).await
    }

    pub async fn serve(self, listener: TcpListener) -> Result<(), anyhow::Error> {
        info!("Interception proxy listening on http://{}", listener.local_addr()?);
        let server = Arc::new(self);

        loop {
            let (stream, remote_addr) = listener.accept().await?;
            let server = Arc::clone(&server);

            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |req| {
                    let server = Arc::clone(&server);
                    async move { server.handle_request(req).await }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    error!("Error serving connection from {}: {}", remote_addr, err);
                }
            });
        }
    }

    /// Dispatch one request; answer with the mock or the upstream response.
    pub async fn handle_request<B>(&self, req: Request<B>) -> Result<Response<Full<Bytes>>, Infallible>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let (parts, body) = req.into_parts();

        let Some(uri) = target_uri(&parts.uri, &parts.headers) else {
            warn!("Rejecting request without a target host: {}", parts.uri);
            return Ok(error_response(StatusCode::BAD_REQUEST, "Missing target host").into_hyper());
        };

        let limit = self.service.config().body_size_limit_bytes;
        let body = match Limited::new(body, limit).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                warn!("Failed to read request body for {}: {}", uri, e);
                return Ok(error_response(StatusCode::PAYLOAD_TOO_LARGE, "Request body too large").into_hyper());
            }
        };

        let request = self.service.request(parts.method, uri, parts.headers, body);
        let dispatcher = self.service.dispatcher();
        let resolution = dispatcher.dispatch(&request).await;
        debug!("{} resolved as {}", request.request_id(), resolution.outcome());

        let (mut response, is_mocked) = match resolution.into_response() {
            Some(response) => (response, true),
            None => match forward_request(&self.http_client, &request, limit).await {
                Ok(response) => (response, false),
                Err(e) => {
                    error!("Forwarding {} failed: {:#}", request.uri(), e);
                    return Ok(error_response(StatusCode::BAD_GATEWAY, "Bad Gateway").into_hyper());
                }
            },
        };

        let write_back = dispatcher.clone();
        let recorded = response.clone();
        let recorded_request = request.clone();
        tokio::spawn(async move {
            write_back
                .on_response(&recorded_request, &recorded, is_mocked)
                .await;
        });

        if is_mocked {
            response
                .headers
                .insert(X_MOCKWIRE_MOCKED.clone(), VALUE_TRUE.clone());
        }
        set_request_id(&mut response.headers, request.request_id());
        Ok(response.into_hyper())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::model::MockRecord;
    use crate::store::{InMemoryStore, KvStore};
    use hyper_util::client::legacy::Client;
    use hyper_util::rt::TokioExecutor;
    use serde_json::{json, Value};
    use std::time::Duration;

    fn test_client() -> HttpClient {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let tls = rustls::ClientConfig::builder()
            .with_root_certificates(rustls::RootCertStore::empty())
            .with_no_client_auth();
        let connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls)
            .https_or_http()
            .enable_http1()
            .build();
        Client::builder(TokioExecutor::new()).build(connector)
    }

    async fn proxy(store: Arc<dyn KvStore>) -> ProxyServer {
        proxy_with(store, Config::default()).await
    }

    async fn proxy_with(store: Arc<dyn KvStore>, config: Config) -> ProxyServer {
        let service = MockService::builder(config)
            .store(store)
            .build()
            .await
            .unwrap();
        ProxyServer::new(Arc::new(service), "127.0.0.1:0".parse().unwrap(), test_client())
    }

    async fn body_of(response: Response<Full<Bytes>>) -> Bytes {
        response.into_body().collect().await.unwrap().to_bytes()
    }

    /// Upstream that answers every request with `upstream says hi`.
    async fn spawn_upstream() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let service = service_fn(|_req: Request<hyper::body::Incoming>| async {
                        Ok::<_, Infallible>(
                            Response::builder()
                                .header("content-type", "text/plain; charset=utf-8")
                                .body(Full::new(Bytes::from("upstream says hi")))
                                .unwrap(),
                        )
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });
        addr
    }

    #[test]
    fn test_target_uri() {
        let absolute: Uri = "http://api.example.com/a?b=1".parse().unwrap();
        assert_eq!(target_uri(&absolute, &HeaderMap::new()), Some(absolute.clone()));

        let origin: Uri = "/a?b=1".parse().unwrap();
        let mut headers = HeaderMap::new();
        assert_eq!(target_uri(&origin, &headers), None);
        headers.insert(HOST, "api.example.com:8080".parse().unwrap());
        assert_eq!(
            target_uri(&origin, &headers).unwrap().to_string(),
            "http://api.example.com:8080/a?b=1"
        );
    }

    #[tokio::test]
    async fn test_mocked_request_is_answered_locally() {
        let store: Arc<dyn KvStore> = Arc::new(InMemoryStore::new());
        let server = proxy(Arc::clone(&store)).await;
        server
            .service
            .dashboard()
            .set_mock("GET-api.example.com-users", MockRecord::mock(json!({"users": []})))
            .await
            .unwrap();

        let req = Request::get("http://api.example.com/users")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let response = server.handle_request(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get(&X_MOCKWIRE_MOCKED).unwrap(), "true");
        let request_id = response
            .headers()
            .get(&crate::proxy::X_MOCKWIRE_REQUEST_ID)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();

        let body: Value = serde_json::from_slice(&body_of(response).await).unwrap();
        assert_eq!(body, json!({"users": []}));

        let key = format!("ms:response:{request_id}");
        tokio::time::timeout(Duration::from_secs(1), async {
            while store.get(&key).await.unwrap().is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_unmatched_request_is_forwarded() {
        let upstream = spawn_upstream().await;
        let server = proxy(Arc::new(InMemoryStore::new())).await;

        let req = Request::get(format!("http://{upstream}/hello"))
            .header("proxy-connection", "keep-alive")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let response = server.handle_request(req).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(&X_MOCKWIRE_MOCKED).is_none());
        assert_eq!(body_of(response).await, Bytes::from("upstream says hi"));
    }

    #[tokio::test]
    async fn test_oversized_upstream_body_is_bad_gateway() {
        let upstream = spawn_upstream().await;
        let config = Config {
            body_size_limit_bytes: 8,
            ..Config::default()
        };
        let server = proxy_with(Arc::new(InMemoryStore::new()), config).await;

        let req = Request::get(format!("http://{upstream}/hello"))
            .body(Full::new(Bytes::new()))
            .unwrap();
        let response = server.handle_request(req).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body: Value = serde_json::from_slice(&body_of(response).await).unwrap();
        assert_eq!(body, json!({"error": "Bad Gateway"}));
    }

    #[tokio::test]
    async fn test_unreachable_upstream_is_bad_gateway() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let closed = listener.local_addr().unwrap();
        drop(listener);
        let server = proxy(Arc::new(InMemoryStore::new())).await;

        let req = Request::get(format!("http://{closed}/x"))
            .body(Full::new(Bytes::new()))
            .unwrap();
        let response = server.handle_request(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
}
