//! Standalone interception proxy.
//!
//! An HTTP/1.1 forward proxy: clients send absolute-form requests
//! (`GET http://host/path`), each request runs through the dispatch pipeline
//! and is either answered with a mock or forwarded to its real target.
//!
//! # Module Structure
//!
//! - `server` - listener loop and per-request handling
//! - `forwarding` - upstream forwarding and error responses
//! - `client` - shared upstream HTTP client
//! - `headers` - mockwire response headers and hop-by-hop filtering

mod client;
mod forwarding;
mod headers;
mod server;

pub use client::{create_http_client, HttpClient};
pub use forwarding::{error_response, forward_request};
pub use headers::{X_MOCKWIRE_MOCKED, X_MOCKWIRE_REQUEST_ID};
pub use server::{target_uri, ProxyServer};
