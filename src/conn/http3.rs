//! HTTP/3 transport.
//!
//! One [`Http3Transport`] wraps one QUIC connection with an h3 control
//! layer. QUIC owns connection liveness (transport keepalive and idle
//! timeout are configured from the client's keepalive policy), so unlike
//! HTTP/2 there is no application-level PING task.

use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use bytes::{Buf, Bytes};
use futures_util::StreamExt;
use h3::client::SendRequest;
use h3_quinn::OpenStreams;
use log::{debug, trace};

use crate::{body::Body, conn::SendFailure, error::Error};

pub(crate) type H3RequestStream = h3::client::RequestStream<h3_quinn::BidiStream<Bytes>, Bytes>;

pub(crate) struct Http3Transport {
    send: Mutex<SendRequest<OpenStreams, Bytes>>,
    connection: quinn::Connection,
}

impl Http3Transport {
    /// Dials `addr` over QUIC and performs the h3 handshake.
    pub(crate) async fn handshake(
        endpoint: &quinn::Endpoint,
        tls: Arc<rustls::ClientConfig>,
        addr: SocketAddr,
        server_name: &str,
        keepalive_interval: Option<Duration>,
    ) -> Result<Http3Transport, Error> {
        let quic_tls = quinn::crypto::rustls::QuicClientConfig::try_from(tls)
            .map_err(Error::tls)?;
        let mut config = quinn::ClientConfig::new(Arc::new(quic_tls));

        let mut transport = quinn::TransportConfig::default();
        transport.keep_alive_interval(keepalive_interval);
        config.transport_config(Arc::new(transport));

        let connecting = endpoint
            .connect_with(config, addr, server_name)
            .map_err(Error::connect)?;
        let connection = connecting.await.map_err(Error::connect)?;

        let h3_conn = h3_quinn::Connection::new(connection.clone());
        let (mut driver, send) = h3::client::new(h3_conn).await.map_err(Error::connect)?;

        trace!("h3 handshake complete, spawning connection driver");
        tokio::spawn(async move {
            if let Err(e) = std::future::poll_fn(|cx| driver.poll_close(cx)).await {
                debug!("h3 connection close error: {e}");
            }
        });

        Ok(Http3Transport {
            send: Mutex::new(send),
            connection,
        })
    }

    pub(crate) fn is_open(&self) -> bool {
        self.connection.close_reason().is_none()
    }

    pub(crate) fn close(&self) {
        self.connection.close(0u32.into(), b"");
    }

    /// Opens a request stream, sends the body, and reads the response head.
    pub(crate) async fn send_request(
        &self,
        req: http::Request<()>,
        body: Option<Body>,
    ) -> Result<(http::Response<()>, H3RequestStream), SendFailure> {
        let mut handle = self.send.lock().expect("h3 send handle poisoned").clone();

        let mut stream = handle.send_request(req).await.map_err(open_failure)?;

        if let Some(body) = body {
            let mut data = body.into_data_stream();
            while let Some(chunk) = data.next().await {
                let chunk = chunk.map_err(|e| SendFailure {
                    error: Error::write(e),
                    retryable_presend: false,
                })?;
                if chunk.is_empty() {
                    continue;
                }
                stream.send_data(chunk).await.map_err(|e| SendFailure {
                    error: Error::write(e),
                    retryable_presend: false,
                })?;
            }
        }
        stream.finish().await.map_err(|e| SendFailure {
            error: Error::write(e),
            retryable_presend: false,
        })?;

        let response = stream.recv_response().await.map_err(|e| SendFailure {
            error: Error::read(e),
            retryable_presend: false,
        })?;

        Ok((response, stream))
    }
}

impl std::fmt::Debug for Http3Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Http3Transport")
            .field("open", &self.is_open())
            .finish()
    }
}

/// A stream that failed to open never reached the server.
fn open_failure(e: h3::Error) -> SendFailure {
    SendFailure {
        error: Error::read(e),
        retryable_presend: true,
    }
}

/// Reads the next DATA chunk from a response stream.
pub(crate) async fn recv_data(stream: &mut H3RequestStream) -> Result<Option<Bytes>, Error> {
    match stream.recv_data().await {
        Ok(None) => Ok(None),
        Ok(Some(mut buf)) => Ok(Some(buf.copy_to_bytes(buf.remaining()))),
        Err(e) => Err(Error::read(e)),
    }
}

pub(crate) async fn recv_trailers(
    stream: &mut H3RequestStream,
) -> Result<Option<http::HeaderMap>, Error> {
    stream.recv_trailers().await.map_err(Error::protocol)
}

/// A shared client endpoint, bound lazily on first HTTP/3 connection.
pub(crate) fn client_endpoint() -> Result<quinn::Endpoint, Error> {
    let bind: SocketAddr = "[::]:0".parse().expect("literal addr parses");
    match quinn::Endpoint::client(bind) {
        Ok(endpoint) => Ok(endpoint),
        Err(_) => {
            // v6 sockets may be unavailable; retry on v4.
            let bind: SocketAddr = "0.0.0.0:0".parse().expect("literal addr parses");
            quinn::Endpoint::client(bind).map_err(Error::connect)
        }
    }
}
