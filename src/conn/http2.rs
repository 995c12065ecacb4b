//! HTTP/2 transport.
//!
//! One [`Http2Transport`] wraps one h2 connection. Streams are opened by
//! cloning the `SendRequest` handle; the connection driver runs as its own
//! task and flips `closed` when the transport dies, which is how the pool
//! learns a multiplexed connection is no longer usable. The `PingPong`
//! handle is reserved for the keepalive scheduler.

use std::{
    future::poll_fn,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    task::{Context, Poll},
};

use bytes::Bytes;
use futures_util::StreamExt;
use h2::{
    client::{ResponseFuture, SendRequest},
    Ping, PingPong, Reason, RecvStream, SendStream,
};
use log::{debug, trace};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::{
    body::Body,
    conn::{BoxedIo, SendFailure},
    error::Error,
};

pub(crate) struct Http2Transport {
    send: Mutex<SendRequest<Bytes>>,
    ping: tokio::sync::Mutex<PingPong>,
    closed: Arc<AtomicBool>,
}

impl Http2Transport {
    pub(crate) async fn handshake(io: BoxedIo) -> Result<Http2Transport, Error> {
        let (send, mut connection) = h2::client::Builder::new()
            .handshake::<_, Bytes>(io)
            .await
            .map_err(Error::connect)?;

        let ping = connection
            .ping_pong()
            .ok_or_else(|| Error::protocol(PingUnavailable))?;

        trace!("h2 handshake complete, spawning connection driver");
        let closed = Arc::new(AtomicBool::new(false));
        let flag = closed.clone();
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!("h2 connection error: {e}");
            }
            flag.store(true, Ordering::SeqCst);
        });

        // Wait for the transport to ready up before declaring it usable,
        // so the peer's initial SETTINGS are in effect.
        let send = send.ready().await.map_err(Error::connect)?;

        Ok(Http2Transport {
            send: Mutex::new(send),
            ping: tokio::sync::Mutex::new(ping),
            closed,
        })
    }

    /// Whether the connection driver is still alive.
    pub(crate) fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    /// Opens a stream, pumps the body, and resolves the response head.
    pub(crate) async fn send_request(
        &self,
        req: http::Request<()>,
        body: Option<Body>,
    ) -> Result<http::Response<RecvStream>, SendFailure> {
        let handle = self.send.lock().expect("h2 send handle poisoned").clone();
        let mut handle = handle.ready().await.map_err(stream_failure)?;

        let end_stream = body.is_none();
        let (response, send_stream) = handle
            .send_request(req, end_stream)
            .map_err(stream_failure)?;

        match body {
            None => await_response(response).await,
            Some(body) => {
                // The body is pumped concurrently with awaiting the head so
                // an early server response (redirect, error) cannot
                // deadlock against flow control.
                let (tx, mut rx) = tokio::sync::oneshot::channel();
                tokio::spawn(async move {
                    let _ = tx.send(pump_body(send_stream, body).await);
                });

                let mut response = std::pin::pin!(response);
                tokio::select! {
                    res = response.as_mut() => match res {
                        Ok(resp) => Ok(resp),
                        Err(e) => Err(stream_failure(e)),
                    },
                    pump = &mut rx => match pump {
                        Ok(Err(error)) => Err(SendFailure {
                            error,
                            retryable_presend: false,
                        }),
                        // Body fully sent (or pump task vanished); the
                        // response head is still on its way.
                        _ => match response.await {
                            Ok(resp) => Ok(resp),
                            Err(e) => Err(stream_failure(e)),
                        },
                    },
                }
            }
        }
    }

    /// RFC 8441 extended CONNECT: opens a stream that stays writable, for a
    /// protocol switch. The response head decides acceptance.
    pub(crate) async fn extended_connect(
        &self,
        req: http::Request<()>,
    ) -> Result<(http::Response<RecvStream>, SendStream<Bytes>), Error> {
        let handle = self.send.lock().expect("h2 send handle poisoned").clone();
        let mut handle = handle.ready().await.map_err(|e| Error::upgrade(e))?;

        let (response, send_stream) = handle
            .send_request(req, false)
            .map_err(|e| Error::upgrade(e))?;
        let response = response.await.map_err(|e| Error::upgrade(e))?;
        Ok((response, send_stream))
    }

    /// One PING round trip.
    pub(crate) async fn ping(&self) -> Result<(), Error> {
        let mut ping = self.ping.lock().await;
        ping.ping(Ping::opaque()).await.map(drop).map_err(Error::read)
    }
}

impl std::fmt::Debug for Http2Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Http2Transport")
            .field("open", &self.is_open())
            .finish()
    }
}

async fn await_response(
    response: ResponseFuture,
) -> Result<http::Response<RecvStream>, SendFailure> {
    response.await.map_err(stream_failure)
}

fn stream_failure(e: h2::Error) -> SendFailure {
    // GOAWAY means the server stopped accepting new streams; REFUSED_STREAM
    // means this one was never processed. Both are safe to replay on a
    // fresh connection.
    let retryable_presend =
        e.is_go_away() || e.reason() == Some(Reason::REFUSED_STREAM);
    let error = if e.is_io() {
        Error::read(e)
    } else {
        Error::protocol(e)
    };
    SendFailure {
        error,
        retryable_presend,
    }
}

/// Sends a request body respecting h2 flow control.
async fn pump_body(mut stream: SendStream<Bytes>, body: Body) -> Result<(), Error> {
    let mut data = body.into_data_stream();
    while let Some(chunk) = data.next().await {
        let mut chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                stream.send_reset(Reason::CANCEL);
                return Err(Error::write(e));
            }
        };
        while !chunk.is_empty() {
            stream.reserve_capacity(chunk.len());
            let granted = match poll_fn(|cx| stream.poll_capacity(cx)).await {
                Some(Ok(n)) => n,
                Some(Err(e)) => return Err(Error::write(e)),
                None => return Err(Error::write(StreamClosed)),
            };
            let frame = chunk.split_to(granted.min(chunk.len()));
            stream.send_data(frame, false).map_err(Error::write)?;
        }
    }
    stream.send_data(Bytes::new(), true).map_err(Error::write)
}

/// Reads the next DATA chunk from a stream, releasing flow-control credit.
pub(crate) async fn recv_data(recv: &mut RecvStream) -> Result<Option<Bytes>, Error> {
    match poll_fn(|cx| recv.poll_data(cx)).await {
        None => Ok(None),
        Some(Ok(chunk)) => {
            let _ = recv.flow_control().release_capacity(chunk.len());
            Ok(Some(chunk))
        }
        Some(Err(e)) => Err(if e.is_io() {
            Error::read(e)
        } else {
            Error::protocol(e)
        }),
    }
}

pub(crate) async fn recv_trailers(
    recv: &mut RecvStream,
) -> Result<Option<http::HeaderMap>, Error> {
    poll_fn(|cx| recv.poll_trailers(cx))
        .await
        .map_err(Error::protocol)
}

#[derive(Debug)]
struct PingUnavailable;

impl std::fmt::Display for PingUnavailable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("h2 ping handle already taken")
    }
}

impl std::error::Error for PingUnavailable {}

#[derive(Debug)]
struct StreamClosed;

impl std::fmt::Display for StreamClosed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("h2 stream closed while sending body")
    }
}

impl std::error::Error for StreamClosed {}

/// Adapts one h2 stream to a byte pipe for post-upgrade protocols
/// (RFC 8441 WebSocket frames ride DATA frames).
pub(crate) struct H2StreamIo {
    recv: RecvStream,
    send: SendStream<Bytes>,
    leftover: Bytes,
}

impl H2StreamIo {
    pub(crate) fn new(recv: RecvStream, send: SendStream<Bytes>) -> H2StreamIo {
        H2StreamIo {
            recv,
            send,
            leftover: Bytes::new(),
        }
    }
}

impl AsyncRead for H2StreamIo {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if self.leftover.is_empty() {
            match self.recv.poll_data(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Ready(Some(Err(e))) => {
                    return Poll::Ready(Err(std::io::Error::other(e)))
                }
                Poll::Ready(Some(Ok(chunk))) => {
                    let _ = self.recv.flow_control().release_capacity(chunk.len());
                    self.leftover = chunk;
                }
            }
        }

        let n = self.leftover.len().min(buf.remaining());
        buf.put_slice(&self.leftover.split_to(n));
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for H2StreamIo {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        self.send.reserve_capacity(buf.len());
        match self.send.poll_capacity(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(None) => Poll::Ready(Err(std::io::ErrorKind::BrokenPipe.into())),
            Poll::Ready(Some(Err(e))) => Poll::Ready(Err(std::io::Error::other(e))),
            Poll::Ready(Some(Ok(granted))) => {
                let n = granted.min(buf.len());
                self.send
                    .send_data(Bytes::copy_from_slice(&buf[..n]), false)
                    .map_err(std::io::Error::other)?;
                Poll::Ready(Ok(n))
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        self.send
            .send_data(Bytes::new(), true)
            .map_err(std::io::Error::other)?;
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{Request, Response, StatusCode};

    async fn serve_one(io: tokio::io::DuplexStream, body: &'static [u8]) {
        let mut conn = h2::server::handshake(io).await.unwrap();
        if let Some(Ok((_request, mut respond))) = conn.accept().await {
            let response = Response::builder()
                .status(StatusCode::OK)
                .body(())
                .unwrap();
            let mut stream = respond.send_response(response, false).unwrap();
            stream.send_data(Bytes::from_static(body), true).unwrap();
        }
        // Drive until the client is done.
        while (conn.accept().await).is_some() {}
    }

    #[tokio::test]
    async fn round_trip_over_duplex() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        tokio::spawn(serve_one(server_io, b"h2 body"));

        let transport = Http2Transport::handshake(Box::new(client_io)).await.unwrap();
        assert!(transport.is_open());

        let req = Request::builder()
            .method("GET")
            .uri("https://test.local/")
            .body(())
            .unwrap();
        let response = transport
            .send_request(req, None)
            .await
            .map_err(|f| f.error)
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let mut recv = response.into_body();
        let mut collected = Vec::new();
        while let Some(chunk) = recv_data(&mut recv).await.unwrap() {
            collected.extend_from_slice(&chunk);
        }
        assert_eq!(collected, b"h2 body");
    }
}
