//! WebSocket upgrades.
//!
//! Two negotiation paths end in the same [`WebSocket`]:
//!
//! * `ws` / `wss`: a GET with `Upgrade: websocket` on a fresh HTTP/1.1
//!   connection; on `101 Switching Protocols` the transport is taken out of
//!   the pool (dedicated) and the frame codec runs directly on it.
//! * `ws+rfc8441` / `wss+rfc8441`: an extended CONNECT stream on an HTTP/2
//!   connection; on `:status 200` the frames ride DATA frames of that one
//!   stream while the connection keeps serving other requests. Closing the
//!   WebSocket closes only the stream and returns the connection to the
//!   pool.

use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use futures_core::Stream;
use futures_util::{Sink, SinkExt, StreamExt};
use http::{header, HeaderMap, StatusCode};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};
pub use tungstenite::Message;
use tungstenite::protocol::Role;

use crate::{
    conn::{http2::H2StreamIo, Conn, Rewind},
    error::Error,
    pool::ReleaseOutcome,
};

/// Prepares the HTTP/1.1 upgrade handshake headers; returns the nonce to
/// verify the response with.
pub(crate) fn prepare_h1(headers: &mut HeaderMap, protocols: &[String]) -> Result<String, Error> {
    let nonce = tungstenite::handshake::client::generate_key();
    headers.insert(header::CONNECTION, header::HeaderValue::from_static("upgrade"));
    headers.insert(header::UPGRADE, header::HeaderValue::from_static("websocket"));
    headers.insert(
        header::SEC_WEBSOCKET_KEY,
        nonce.parse().map_err(Error::builder)?,
    );
    headers.insert(
        header::SEC_WEBSOCKET_VERSION,
        header::HeaderValue::from_static("13"),
    );
    insert_protocols(headers, protocols)?;
    Ok(nonce)
}

/// Prepares the RFC 8441 extended-CONNECT headers (the `:protocol`
/// pseudo-header is added by the connection layer).
pub(crate) fn prepare_rfc8441(
    headers: &mut HeaderMap,
    protocols: &[String],
) -> Result<(), Error> {
    headers.insert(
        header::SEC_WEBSOCKET_VERSION,
        header::HeaderValue::from_static("13"),
    );
    insert_protocols(headers, protocols)
}

fn insert_protocols(headers: &mut HeaderMap, protocols: &[String]) -> Result<(), Error> {
    if !protocols.is_empty() {
        let joined = protocols.join(", ");
        headers.insert(
            header::SEC_WEBSOCKET_PROTOCOL,
            joined
                .parse()
                .map_err(|_| Error::builder(InvalidProtocol))?,
        );
    }
    Ok(())
}

/// Checks the server's 101 response; returns the accepted subprotocol.
pub(crate) fn verify_h1(
    status: StatusCode,
    headers: &HeaderMap,
    nonce: &str,
    protocols: &[String],
) -> Result<Option<String>, Error> {
    if status != StatusCode::SWITCHING_PROTOCOLS {
        return Err(Error::upgrade(UnexpectedStatus(status)));
    }

    if !headers
        .get(header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.eq_ignore_ascii_case("upgrade"))
        .unwrap_or_default()
    {
        return Err(Error::upgrade(MissingHeader("connection")));
    }

    if !headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.eq_ignore_ascii_case("websocket"))
        .unwrap_or_default()
    {
        return Err(Error::upgrade(MissingHeader("upgrade")));
    }

    let accept = headers
        .get(header::SEC_WEBSOCKET_ACCEPT)
        .and_then(|v| v.to_str().ok())
        .ok_or(Error::upgrade(MissingHeader("sec-websocket-accept")))?;
    let expected = tungstenite::handshake::derive_accept_key(nonce.as_bytes());
    if accept != expected {
        return Err(Error::upgrade(InvalidAcceptKey));
    }

    check_protocol(headers, protocols)
}

/// Checks the `:status 200` of an accepted extended CONNECT.
pub(crate) fn verify_rfc8441(
    status: StatusCode,
    headers: &HeaderMap,
    protocols: &[String],
) -> Result<Option<String>, Error> {
    if status != StatusCode::OK {
        return Err(Error::upgrade(UnexpectedStatus(status)));
    }
    check_protocol(headers, protocols)
}

fn check_protocol(headers: &HeaderMap, requested: &[String]) -> Result<Option<String>, Error> {
    let answered = headers
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);

    match (requested.is_empty(), &answered) {
        // Nothing requested, nothing offered back.
        (true, None) => Ok(None),
        (false, Some(protocol)) if requested.iter().any(|p| p == protocol) => Ok(answered),
        (false, None) => Err(Error::upgrade(MissingHeader("sec-websocket-protocol"))),
        _ => Err(Error::upgrade(InvalidProtocol)),
    }
}

/// Returns a multiplexed connection's stream slot to the pool on drop.
pub(crate) struct StreamGuard {
    conn: Arc<Conn>,
}

impl StreamGuard {
    pub(crate) fn new(conn: Arc<Conn>) -> StreamGuard {
        StreamGuard { conn }
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        if let Some(pool) = self.conn.pool() {
            pool.release(&self.conn, ReleaseOutcome::Ok);
        } else {
            self.conn.end_stream();
        }
    }
}

/// The byte pipe under the frame codec.
pub(crate) enum WsIo {
    /// A dedicated former-HTTP/1.1 transport; closing it closes the socket.
    H1(Rewind),
    /// One stream of a shared HTTP/2 connection.
    H2 {
        io: H2StreamIo,
        _guard: StreamGuard,
    },
}

impl AsyncRead for WsIo {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            WsIo::H1(io) => Pin::new(io).poll_read(cx, buf),
            WsIo::H2 { io, .. } => Pin::new(io).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for WsIo {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            WsIo::H1(io) => Pin::new(io).poll_write(cx, buf),
            WsIo::H2 { io, .. } => Pin::new(io).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            WsIo::H1(io) => Pin::new(io).poll_flush(cx),
            WsIo::H2 { io, .. } => Pin::new(io).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            WsIo::H1(io) => Pin::new(io).poll_shutdown(cx),
            WsIo::H2 { io, .. } => Pin::new(io).poll_shutdown(cx),
        }
    }
}

/// A WebSocket connection.
///
/// Implements `Stream` for incoming [`Message`]s and `Sink<Message>` for
/// outgoing ones.
pub struct WebSocket {
    inner: async_tungstenite::WebSocketStream<Compat<WsIo>>,
    protocol: Option<String>,
}

impl WebSocket {
    pub(crate) async fn from_io(io: WsIo, protocol: Option<String>) -> WebSocket {
        let inner =
            async_tungstenite::WebSocketStream::from_raw_socket(io.compat(), Role::Client, None)
                .await;
        WebSocket { inner, protocol }
    }

    /// The subprotocol the server accepted, if any was negotiated.
    pub fn protocol(&self) -> Option<&str> {
        self.protocol.as_deref()
    }

    /// Sends a message.
    pub async fn send(&mut self, message: Message) -> Result<(), Error> {
        self.inner.send(message).await.map_err(Error::upgrade)
    }

    /// Receives the next message; `None` once the peer closed.
    pub async fn recv(&mut self) -> Option<Result<Message, Error>> {
        loop {
            match self.inner.next().await? {
                // The codec answers pings internally on flush; surface only
                // application traffic.
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
                Ok(Message::Close(_)) => return None,
                Ok(message) => return Some(Ok(message)),
                Err(tungstenite::Error::ConnectionClosed) => return None,
                Err(e) => return Some(Err(Error::upgrade(e))),
            }
        }
    }

    /// Sends a PING frame.
    pub async fn ping(&mut self, payload: Vec<u8>) -> Result<(), Error> {
        self.inner
            .send(Message::Ping(payload))
            .await
            .map_err(Error::upgrade)
    }

    /// Performs the closing handshake. For a dedicated HTTP/1.1 transport
    /// the socket closes with it; for an RFC 8441 stream the connection
    /// returns to the pool.
    pub async fn close(mut self) -> Result<(), Error> {
        match self.inner.close(None).await {
            Ok(()) | Err(tungstenite::Error::ConnectionClosed) => Ok(()),
            Err(e) => Err(Error::upgrade(e)),
        }
    }
}

impl Stream for WebSocket {
    type Item = Result<Message, Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match futures_core::ready!(self.inner.poll_next_unpin(cx)) {
            None => Poll::Ready(None),
            Some(Ok(message)) => Poll::Ready(Some(Ok(message))),
            Some(Err(tungstenite::Error::ConnectionClosed)) => Poll::Ready(None),
            Some(Err(e)) => Poll::Ready(Some(Err(Error::upgrade(e)))),
        }
    }
}

impl Sink<Message> for WebSocket {
    type Error = Error;

    fn poll_ready(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
        self.inner.poll_ready_unpin(cx).map_err(Error::upgrade)
    }

    fn start_send(mut self: Pin<&mut Self>, item: Message) -> Result<(), Error> {
        self.inner.start_send_unpin(item).map_err(Error::upgrade)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
        self.inner.poll_flush_unpin(cx).map_err(Error::upgrade)
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
        self.inner.poll_close_unpin(cx).map_err(Error::upgrade)
    }
}

impl std::fmt::Debug for WebSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocket")
            .field("protocol", &self.protocol)
            .finish()
    }
}

#[derive(Debug)]
struct UnexpectedStatus(StatusCode);

impl std::fmt::Display for UnexpectedStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unexpected status code {}", self.0)
    }
}

impl std::error::Error for UnexpectedStatus {}

#[derive(Debug)]
struct MissingHeader(&'static str);

impl std::fmt::Display for MissingHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "missing or invalid {} header", self.0)
    }
}

impl std::error::Error for MissingHeader {}

#[derive(Debug)]
struct InvalidAcceptKey;

impl std::fmt::Display for InvalidAcceptKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("invalid accept key")
    }
}

impl std::error::Error for InvalidAcceptKey {}

#[derive(Debug)]
struct InvalidProtocol;

impl std::fmt::Display for InvalidProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("invalid subprotocol")
    }
}

impl std::error::Error for InvalidProtocol {}
