//! Responses.
//!
//! The response head is surfaced as soon as the first HEADERS frame or
//! status line arrives; the body flows through a bounded channel fed by a
//! pump task that owns the protocol-specific read state. The pump is also
//! the release hook: when the body is fully read (or abandoned) it returns
//! the connection to its pool with the right outcome.

use std::{
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
    time::Duration,
};

use bytes::Bytes;
use futures_core::Stream;
use futures_util::StreamExt;
use http::{header, HeaderMap, StatusCode, Version};
use log::trace;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use url::Url;

use crate::{
    conn::{http2, http3, Conn, IncomingBody},
    error::{Error, TimedOut},
    pool::ReleaseOutcome,
    ws::WebSocket,
};

/// A response to a submitted request.
pub struct Response {
    status: StatusCode,
    version: Version,
    headers: HeaderMap,
    url: Url,
    body: BodyStream,
    trailers: Arc<Mutex<Option<HeaderMap>>>,
    extension: Option<WebSocket>,
}

impl Response {
    pub(crate) fn new(
        status: StatusCode,
        version: Version,
        headers: HeaderMap,
        url: Url,
        body: BodyStream,
        trailers: Arc<Mutex<Option<HeaderMap>>>,
    ) -> Response {
        Response {
            status,
            version,
            headers,
            url,
            body,
            trailers,
            extension: None,
        }
    }

    pub(crate) fn with_extension(mut self, ws: WebSocket) -> Response {
        self.extension = Some(ws);
        self
    }

    /// The response status code.
    #[inline]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// The negotiated HTTP version this response arrived over.
    #[inline]
    pub fn version(&self) -> Version {
        self.version
    }

    /// The response headers. Lookup is case-insensitive; iteration
    /// preserves wire order of repeated values.
    #[inline]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Mutable access to the response headers.
    #[inline]
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// The advertised `Content-Length`, if any.
    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse().ok())
    }

    /// The final URL of this response (after redirects).
    #[inline]
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Trailer headers, available once the body has been fully read.
    pub fn trailers(&self) -> Option<HeaderMap> {
        self.trailers.lock().expect("trailer slot poisoned").clone()
    }

    /// Whether a protocol switch succeeded and an extension took over the
    /// stream.
    pub fn has_extension(&self) -> bool {
        self.extension.is_some()
    }

    /// Consumes the response into the post-upgrade WebSocket.
    pub fn into_websocket(self) -> Result<WebSocket, Error> {
        self.extension
            .ok_or_else(|| Error::upgrade(NotUpgraded).with_url(self.url))
    }

    /// The next body chunk, or `None` once the body is complete.
    pub async fn chunk(&mut self) -> Result<Option<Bytes>, Error> {
        match self.body.next().await {
            None => Ok(None),
            Some(Ok(chunk)) => Ok(Some(chunk)),
            Some(Err(e)) => Err(e.with_url(self.url.clone())),
        }
    }

    /// Collects the full body.
    pub async fn bytes(mut self) -> Result<Bytes, Error> {
        let mut collected = Vec::with_capacity(
            self.content_length().unwrap_or(1024).min(1 << 20) as usize,
        );
        while let Some(chunk) = self.chunk().await? {
            collected.extend_from_slice(&chunk);
        }
        Ok(collected.into())
    }

    /// Collects the full body as UTF-8 text (lossy).
    pub async fn text(self) -> Result<String, Error> {
        let bytes = self.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Deserializes the full body as JSON.
    pub async fn json<T: DeserializeOwned>(self) -> Result<T, Error> {
        let url = self.url.clone();
        let bytes = self.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| Error::decode(e).with_url(url))
    }

    /// The body as a stream of chunks.
    pub fn bytes_stream(self) -> impl Stream<Item = Result<Bytes, Error>> {
        self.body
    }

    /// Turns responses with 4xx/5xx status codes into errors.
    pub fn error_for_status(self) -> Result<Response, Error> {
        if self.status.is_client_error() || self.status.is_server_error() {
            Err(Error::status_code(self.url.clone(), self.status))
        } else {
            Ok(self)
        }
    }

    /// Releases the connection back to its pool without reading the rest of
    /// the body. An HTTP/1.1 connection with unread bytes cannot be reused
    /// and is closed; a multiplexed stream is reset.
    pub fn release_conn(self) {
        drop(self);
    }
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Response")
            .field("url", &self.url.as_str())
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish()
    }
}

#[derive(Debug)]
struct NotUpgraded;

impl std::fmt::Display for NotUpgraded {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("response did not switch protocols")
    }
}

impl std::error::Error for NotUpgraded {}

// ===== body plumbing =====

/// Raw chunks from the pump, as a `Stream`.
pub(crate) struct ChannelStream {
    rx: mpsc::Receiver<Result<Bytes, Error>>,
}

impl Stream for ChannelStream {
    type Item = Result<Bytes, Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// The consumer-facing body: raw, or routed through a gzip decoder.
pub(crate) enum BodyStream {
    Plain(ChannelStream),
    Gzip(
        tokio_util::io::ReaderStream<
            async_compression::tokio::bufread::GzipDecoder<
                tokio_util::io::StreamReader<IoChunks, Bytes>,
            >,
        >,
    ),
    Empty,
}

impl Stream for BodyStream {
    type Item = Result<Bytes, Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.get_mut() {
            BodyStream::Plain(inner) => Pin::new(inner).poll_next(cx),
            BodyStream::Gzip(inner) => match futures_core::ready!(Pin::new(inner).poll_next(cx))
            {
                None => Poll::Ready(None),
                Some(Ok(chunk)) => Poll::Ready(Some(Ok(chunk))),
                Some(Err(io_err)) => Poll::Ready(Some(Err(unwrap_io(io_err)))),
            },
            BodyStream::Empty => Poll::Ready(None),
        }
    }
}

/// `ChannelStream` with errors mapped into `io::Error`, the shape
/// `StreamReader` wants.
pub(crate) struct IoChunks {
    inner: ChannelStream,
}

impl Stream for IoChunks {
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match futures_core::ready!(Pin::new(&mut self.inner).poll_next(cx)) {
            None => Poll::Ready(None),
            Some(Ok(chunk)) => Poll::Ready(Some(Ok(chunk))),
            Some(Err(e)) => Poll::Ready(Some(Err(std::io::Error::other(e)))),
        }
    }
}

/// Recovers a crate error smuggled through the gzip decoder, or wraps a
/// genuine decoder failure.
fn unwrap_io(err: std::io::Error) -> Error {
    match err.get_ref().is_some_and(|inner| inner.is::<Error>()) {
        true => *err
            .into_inner()
            .expect("get_ref was Some")
            .downcast::<Error>()
            .expect("is::<Error> was true"),
        false => Error::decode(err),
    }
}

/// Spawns the pump that drains a protocol body into a channel and fires the
/// release hook when done. Returns the consumer stream and the trailer
/// slot.
pub(crate) fn spawn_body(
    conn: Arc<Conn>,
    incoming: IncomingBody,
    read_timeout: Option<Duration>,
    gzip: bool,
) -> (BodyStream, Arc<Mutex<Option<HeaderMap>>>) {
    let trailers = Arc::new(Mutex::new(None));
    let slot = trailers.clone();
    let (tx, rx) = mpsc::channel(2);

    tokio::spawn(async move {
        pump(conn, incoming, read_timeout, tx, slot).await;
    });

    let raw = ChannelStream { rx };
    let stream = if gzip {
        let reader = tokio_util::io::StreamReader::new(IoChunks { inner: raw });
        let decoder = async_compression::tokio::bufread::GzipDecoder::new(reader);
        BodyStream::Gzip(tokio_util::io::ReaderStream::new(decoder))
    } else {
        BodyStream::Plain(raw)
    };
    (stream, trailers)
}

async fn pump(
    conn: Arc<Conn>,
    incoming: IncomingBody,
    read_timeout: Option<Duration>,
    tx: mpsc::Sender<Result<Bytes, Error>>,
    trailers: Arc<Mutex<Option<HeaderMap>>>,
) {
    let outcome = match incoming {
        IncomingBody::H1 { mut guard, mut framing } => {
            let mut outcome = ReleaseOutcome::Broken;
            let Some(transport) = guard.as_mut() else {
                return release(&conn, ReleaseOutcome::Broken);
            };
            loop {
                let read = transport.read_body_data(&mut framing);
                let chunk = match with_timeout(read_timeout, read).await {
                    Ok(Some(chunk)) => chunk,
                    Ok(None) => {
                        if let Some(t) = framing.trailers() {
                            *trailers.lock().expect("trailer slot poisoned") = Some(t);
                        }
                        if framing.is_complete() && transport.is_reusable() {
                            outcome = ReleaseOutcome::Ok;
                        }
                        break;
                    }
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        break;
                    }
                };
                conn.touch();
                if tx.send(Ok(chunk)).await.is_err() {
                    // Consumer abandoned a half-read H1 body: the framing
                    // position is lost, so the connection goes with it.
                    trace!("conn {} body abandoned mid-read", conn.id());
                    break;
                }
            }
            drop(guard);
            outcome
        }
        IncomingBody::H2 { mut recv } => {
            let mut outcome = ReleaseOutcome::Ok;
            loop {
                let chunk = match with_timeout(read_timeout, http2::recv_data(&mut recv)).await {
                    Ok(Some(chunk)) => chunk,
                    Ok(None) => {
                        if let Ok(Some(t)) = http2::recv_trailers(&mut recv).await {
                            *trailers.lock().expect("trailer slot poisoned") = Some(t);
                        }
                        break;
                    }
                    Err(e) => {
                        // A stream-level failure doesn't poison the
                        // connection; a dead transport does.
                        if !conn.is_open() {
                            outcome = ReleaseOutcome::Broken;
                        }
                        let _ = tx.send(Err(e)).await;
                        break;
                    }
                };
                conn.touch();
                if tx.send(Ok(chunk)).await.is_err() {
                    // Dropping the RecvStream resets the stream; the
                    // connection itself stays healthy.
                    break;
                }
            }
            outcome
        }
        IncomingBody::H3 { mut stream } => {
            let mut outcome = ReleaseOutcome::Ok;
            loop {
                let chunk = match with_timeout(read_timeout, http3::recv_data(&mut stream)).await
                {
                    Ok(Some(chunk)) => chunk,
                    Ok(None) => {
                        if let Ok(Some(t)) = http3::recv_trailers(&mut stream).await {
                            *trailers.lock().expect("trailer slot poisoned") = Some(t);
                        }
                        break;
                    }
                    Err(e) => {
                        if !conn.is_open() {
                            outcome = ReleaseOutcome::Broken;
                        }
                        let _ = tx.send(Err(e)).await;
                        break;
                    }
                };
                conn.touch();
                if tx.send(Ok(chunk)).await.is_err() {
                    break;
                }
            }
            outcome
        }
    };

    release(&conn, outcome);
}

fn release(conn: &Arc<Conn>, outcome: ReleaseOutcome) {
    if let Some(pool) = conn.pool() {
        pool.release(conn, outcome);
    } else if outcome == ReleaseOutcome::Broken {
        conn.close(crate::conn::CloseReason::Error);
    } else {
        conn.end_stream();
    }
}

async fn with_timeout<F, T>(read_timeout: Option<Duration>, fut: F) -> Result<T, Error>
where
    F: std::future::Future<Output = Result<T, Error>>,
{
    match read_timeout {
        None => fut.await,
        Some(dur) => match tokio::time::timeout(dur, fut).await {
            Ok(result) => result,
            Err(_elapsed) => Err(Error::timeout(TimedOut::Read)),
        },
    }
}
