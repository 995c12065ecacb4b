#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![cfg_attr(test, deny(warnings))]

//! # weft
//!
//! An async pooled HTTP client speaking HTTP/1.1, HTTP/2 and HTTP/3 over
//! one request interface, with WebSocket upgrade.
//!
//! - Per-origin connection pooling with keep-alive and idle PING probing
//! - Protocol negotiation via ALPN; streams multiplexed over HTTP/2 and
//!   HTTP/3 connections
//! - [Retry policies](retry::Policy) with granular counters, backoff and
//!   `Retry-After`
//! - Redirect following with sensitive-header scrubbing across origins
//! - Plain, [JSON](RequestBuilder::json) and [form](RequestBuilder::form)
//!   bodies
//! - System proxies (`HTTP_PROXY`/`HTTPS_PROXY`/`ALL_PROXY`/`NO_PROXY`)
//! - TLS via rustls, roots from webpki or `SSL_CERT_FILE`/`SSL_CERT_DIR`
//! - [WebSocket](Client::websocket) upgrade, including RFC 8441 extended
//!   CONNECT over a shared HTTP/2 connection
//!
//! ## Making a GET request
//!
//! ```rust,no_run
//! # async fn run() -> Result<(), weft::Error> {
//! let body = weft::Client::new()
//!     .get("https://www.rust-lang.org")
//!     .send()
//!     .await?
//!     .text()
//!     .await?;
//!
//! println!("body = {body:?}");
//! # Ok(())
//! # }
//! ```
//!
//! **NOTE**: If you plan to perform multiple requests, it is best to create
//! a [`Client`] and reuse it, taking advantage of keep-alive connection
//! pooling.
//!
//! ## Retries
//!
//! The client retries connection failures up to its total budget and never
//! replays a request whose bytes already went out unless the request is
//! idempotent (or explicitly marked so):
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use weft::retry;
//!
//! # fn run() -> Result<(), weft::Error> {
//! let client = weft::Client::builder()
//!     .retries(
//!         retry::Policy::new(5)
//!             .status_forcelist([429, 503])
//!             .backoff_factor(0.5)
//!             .backoff_max(Duration::from_secs(30)),
//!     )
//!     .build()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## WebSocket
//!
//! ```rust,no_run
//! # async fn run() -> Result<(), weft::Error> {
//! use weft::Message;
//!
//! let mut ws = weft::Client::new()
//!     .websocket("wss://echo.example/")
//!     .send()
//!     .await?
//!     .into_websocket()?;
//!
//! ws.send(Message::text("hi")).await?;
//! if let Some(msg) = ws.recv().await {
//!     println!("received: {:?}", msg?);
//! }
//! ws.close().await?;
//! # Ok(())
//! # }
//! ```
//!
//! Using the `ws+rfc8441`/`wss+rfc8441` schemes rides the handshake over an
//! extended CONNECT stream of a pooled HTTP/2 connection instead of
//! dedicating a socket.

pub use http::header;
pub use http::{Method, StatusCode, Version};
pub use url::Url;

mod error;
mod into_url;

pub use self::error::{Error, Result};
pub use self::into_url::IntoUrl;

mod body;
mod client;
mod conn;
pub mod dns;
mod keepalive;
mod origin;
mod pool;
mod proxy;
mod redirect;
mod request;
mod response;
pub mod retry;
mod tls;
mod ws;

pub use self::body::Body;
pub use self::client::{get, request, reset_default_client, Client, ClientBuilder};
pub use self::keepalive::KeepalivePolicy;
pub use self::origin::Scheme;
pub use self::proxy::{NoProxy, Proxy};
pub use self::request::{Request, RequestBuilder};
pub use self::response::Response;
pub use self::ws::{Message, WebSocket};

fn _assert_impls() {
    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}
    fn assert_clone<T: Clone>() {}

    assert_send::<Client>();
    assert_sync::<Client>();
    assert_clone::<Client>();

    assert_send::<Request>();
    assert_send::<RequestBuilder>();
    assert_send::<Response>();
    assert_send::<WebSocket>();

    assert_send::<Error>();
    assert_sync::<Error>();
}
