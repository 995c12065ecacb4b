//! Connections.
//!
//! A [`Conn`] is one transport (TCP, TLS-over-TCP, or QUIC) plus the
//! protocol state machine negotiated onto it. The pool owns connections;
//! dispatchers borrow them for the lifetime of one request/response (H1) or
//! one stream (H2/H3). All bookkeeping lives behind a short std mutex;
//! I/O happens outside it.

pub(crate) mod http1;
pub(crate) mod http2;
pub(crate) mod http3;

use std::{
    net::{IpAddr, SocketAddr},
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, OnceLock, Weak,
    },
    task::{Context, Poll},
    time::{Duration, Instant},
};

use bytes::{Bytes, BytesMut};
use http::{
    header::{self, HeaderMap},
    Method, StatusCode, Version,
};
use log::{debug, trace};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf},
    net::TcpStream,
    sync::OwnedMutexGuard,
};
use url::Url;

use crate::{
    body::Body,
    dns::{DynResolver, Name},
    error::Error,
    keepalive::KeepalivePolicy,
    origin::{Origin, Scheme},
    pool::PerOriginPool,
    proxy::ProxyScheme,
    tls::{handshake_error, AlpnProtos, TlsConfig},
};

use http1::{Framing, Http1Transport, RequestHead};
use http2::Http2Transport;
use http3::{H3RequestStream, Http3Transport};

/// Object-safe transport byte stream.
pub(crate) trait AsyncIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncIo for T {}

pub(crate) type BoxedIo = Box<dyn AsyncIo>;

/// A request failure plus whether it is known to have died before the
/// server processed it (connection refused, GOAWAY, REFUSED_STREAM), which
/// makes it safe to replay even for non-idempotent requests.
pub(crate) struct SendFailure {
    pub(crate) error: Error,
    pub(crate) retryable_presend: bool,
}

/// The wire protocol a connection speaks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Protocol {
    H1,
    H2,
    H3,
}

impl Protocol {
    pub(crate) fn is_multiplexed(&self) -> bool {
        !matches!(self, Protocol::H1)
    }
}

/// Why a connection stopped being usable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum CloseReason {
    Error,
    PingTimeout,
    Retired,
    Shutdown,
    Upgraded,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Phase {
    Idle,
    Active,
    Draining,
    Closed(CloseReason),
}

struct State {
    phase: Phase,
    in_flight: u32,
    reused: bool,
    last_activity: Instant,
    last_ping: Option<Instant>,
}

enum Transport {
    H1(Arc<tokio::sync::Mutex<Option<Http1Transport>>>),
    H2(Http2Transport),
    H3(Http3Transport),
}

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) struct Conn {
    id: u64,
    origin: Origin,
    protocol: Protocol,
    created_at: Instant,
    retire_at: Option<Instant>,
    max_streams: u32,
    transport: Transport,
    state: Mutex<State>,
    pool: OnceLock<Weak<PerOriginPool>>,
    keepalive: Mutex<Option<tokio::task::AbortHandle>>,
}

// ===== impl Conn =====

impl Conn {
    fn new(
        origin: Origin,
        protocol: Protocol,
        transport: Transport,
        max_streams: u32,
        lifetime: Option<Duration>,
    ) -> Arc<Conn> {
        let now = Instant::now();
        Arc::new(Conn {
            id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            origin,
            protocol,
            created_at: now,
            retire_at: lifetime.map(|d| now + d),
            max_streams,
            transport,
            state: Mutex::new(State {
                phase: Phase::Idle,
                in_flight: 0,
                reused: false,
                last_activity: now,
                last_ping: None,
            }),
            pool: OnceLock::new(),
            keepalive: Mutex::new(None),
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn origin(&self) -> &Origin {
        &self.origin
    }

    pub(crate) fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub(crate) fn is_multiplexed(&self) -> bool {
        self.protocol.is_multiplexed()
    }

    pub(crate) fn attach_pool(&self, pool: &Arc<PerOriginPool>) {
        let _ = self.pool.set(Arc::downgrade(pool));
    }

    pub(crate) fn pool(&self) -> Option<Arc<PerOriginPool>> {
        self.pool.get().and_then(Weak::upgrade)
    }

    fn transport_open(&self) -> bool {
        match &self.transport {
            // An H1 transport's death is only observable by using it.
            Transport::H1(slot) => slot.try_lock().map(|g| g.is_some()).unwrap_or(true),
            Transport::H2(t) => t.is_open(),
            Transport::H3(t) => t.is_open(),
        }
    }

    /// Streams that could still be opened on this connection right now.
    pub(crate) fn available_streams(&self) -> u32 {
        let state = self.state.lock().expect("conn state poisoned");
        match state.phase {
            Phase::Idle | Phase::Active => {}
            Phase::Draining | Phase::Closed(_) => return 0,
        }
        if self.past_retirement() || !self.transport_open() {
            return 0;
        }
        self.max_streams.saturating_sub(state.in_flight)
    }

    pub(crate) fn in_flight(&self) -> u32 {
        self.state.lock().expect("conn state poisoned").in_flight
    }

    pub(crate) fn is_open(&self) -> bool {
        let state = self.state.lock().expect("conn state poisoned");
        matches!(state.phase, Phase::Idle | Phase::Active) && self.transport_open()
    }

    pub(crate) fn is_closed(&self) -> bool {
        matches!(
            self.state.lock().expect("conn state poisoned").phase,
            Phase::Closed(_)
        )
    }

    pub(crate) fn last_activity(&self) -> Instant {
        self.state.lock().expect("conn state poisoned").last_activity
    }

    pub(crate) fn touch(&self) {
        self.state.lock().expect("conn state poisoned").last_activity = Instant::now();
    }

    pub(crate) fn record_ping(&self) {
        let mut state = self.state.lock().expect("conn state poisoned");
        state.last_ping = Some(Instant::now());
    }

    pub(crate) fn last_ping(&self) -> Option<Instant> {
        self.state.lock().expect("conn state poisoned").last_ping
    }

    pub(crate) fn past_retirement(&self) -> bool {
        self.retire_at.is_some_and(|at| Instant::now() >= at)
    }

    pub(crate) fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Called by the pool when handing the connection to a borrower.
    pub(crate) fn begin_stream(&self, reused: bool) {
        let mut state = self.state.lock().expect("conn state poisoned");
        state.in_flight += 1;
        state.reused = reused;
        if state.phase == Phase::Idle {
            state.phase = Phase::Active;
        }
        drop(state);
        self.cancel_keepalive();
    }

    /// Called when a borrow ends; returns the number still in flight.
    pub(crate) fn end_stream(&self) -> u32 {
        let mut state = self.state.lock().expect("conn state poisoned");
        state.in_flight = state.in_flight.saturating_sub(1);
        if state.in_flight == 0 && state.phase == Phase::Active {
            state.phase = Phase::Idle;
        }
        state.in_flight
    }

    fn is_reused(&self) -> bool {
        self.state.lock().expect("conn state poisoned").reused
    }

    /// No new streams; in-flight work finishes, then the connection closes.
    pub(crate) fn drain(&self) {
        let mut state = self.state.lock().expect("conn state poisoned");
        match state.phase {
            Phase::Closed(_) | Phase::Draining => return,
            _ => {}
        }
        if state.in_flight == 0 {
            drop(state);
            self.close(CloseReason::Shutdown);
        } else {
            trace!("conn {} draining with {} in flight", self.id, state.in_flight);
            state.phase = Phase::Draining;
        }
    }

    pub(crate) fn is_draining(&self) -> bool {
        self.state.lock().expect("conn state poisoned").phase == Phase::Draining
    }

    pub(crate) fn close(&self, reason: CloseReason) {
        {
            let mut state = self.state.lock().expect("conn state poisoned");
            if matches!(state.phase, Phase::Closed(_)) {
                return;
            }
            state.phase = Phase::Closed(reason);
        }
        trace!("conn {} closed: {:?}", self.id, reason);
        self.cancel_keepalive();
        match &self.transport {
            Transport::H1(slot) => {
                if let Ok(mut guard) = slot.try_lock() {
                    // Dropping the io closes the socket.
                    *guard = None;
                }
            }
            // The h2 driver shuts down once all handles drop with the Conn.
            Transport::H2(_) => {}
            Transport::H3(t) => t.close(),
        }
    }

    pub(crate) fn set_keepalive_task(&self, handle: tokio::task::AbortHandle) {
        let mut slot = self.keepalive.lock().expect("keepalive slot poisoned");
        if let Some(old) = slot.replace(handle) {
            old.abort();
        }
    }

    pub(crate) fn cancel_keepalive(&self) {
        if let Some(handle) = self
            .keepalive
            .lock()
            .expect("keepalive slot poisoned")
            .take()
        {
            handle.abort();
        }
    }

    /// Sends a PING on a multiplexed connection and waits for the ACK.
    pub(crate) async fn ping(&self) -> Result<(), Error> {
        self.record_ping();
        match &self.transport {
            Transport::H2(t) => t.ping().await,
            // QUIC probes liveness at the transport layer.
            Transport::H3(_) | Transport::H1(_) => Ok(()),
        }
    }

    /// Writes the request and reads the response head.
    pub(crate) async fn send(
        self: &Arc<Self>,
        request: OutboundRequest,
    ) -> Result<TransportResponse, SendFailure> {
        self.touch();
        let result = match &self.transport {
            Transport::H1(slot) => self.send_h1(slot.clone(), request).await,
            Transport::H2(_) => self.send_h2(request).await,
            Transport::H3(_) => self.send_h3(request).await,
        };
        self.touch();
        result
    }

    async fn send_h1(
        self: &Arc<Self>,
        slot: Arc<tokio::sync::Mutex<Option<Http1Transport>>>,
        request: OutboundRequest,
    ) -> Result<TransportResponse, SendFailure> {
        let mut guard = slot.lock_owned().await;
        if guard.is_none() {
            return Err(SendFailure {
                error: Error::read(std::io::Error::from(std::io::ErrorKind::NotConnected)),
                retryable_presend: true,
            });
        }

        // Plaintext forward proxies receive the absolute form.
        let target = if self.origin.is_proxied() && !self.origin.is_tls() {
            request.url[..url::Position::AfterQuery].to_string()
        } else {
            origin_form(&request.url)
        };

        let head = RequestHead {
            method: request.method.clone(),
            target,
            headers: request.headers,
        };

        let transport = guard.as_mut().expect("checked above");
        match transport
            .send_request(&head, request.body, request.expect_100_timeout)
            .await
        {
            Ok((head, framing)) => Ok(TransportResponse {
                status: head.status,
                version: head.version,
                headers: head.headers,
                body: IncomingBody::H1 { guard, framing },
            }),
            Err(error) => {
                // A pooled connection the server already closed fails on
                // first use; that attempt never reached the application.
                let retryable_presend =
                    self.is_reused() && (error.is_read() || error.is_write());
                self.close(CloseReason::Error);
                Err(SendFailure {
                    error,
                    retryable_presend,
                })
            }
        }
    }

    async fn send_h2(
        self: &Arc<Self>,
        request: OutboundRequest,
    ) -> Result<TransportResponse, SendFailure> {
        let Transport::H2(transport) = &self.transport else {
            unreachable!("send_h2 on non-h2 conn");
        };

        let req = build_stream_request(&request, Version::HTTP_2)?;
        match transport.send_request(req, request.body).await {
            Ok(response) => {
                let (parts, recv) = response.into_parts();
                Ok(TransportResponse {
                    status: parts.status,
                    version: Version::HTTP_2,
                    headers: parts.headers,
                    body: IncomingBody::H2 { recv },
                })
            }
            Err(failure) => {
                if !transport.is_open() {
                    self.close(CloseReason::Error);
                } else if failure.retryable_presend {
                    // GOAWAY: finish in-flight streams, accept no more.
                    self.drain();
                }
                Err(failure)
            }
        }
    }

    async fn send_h3(
        self: &Arc<Self>,
        request: OutboundRequest,
    ) -> Result<TransportResponse, SendFailure> {
        let Transport::H3(transport) = &self.transport else {
            unreachable!("send_h3 on non-h3 conn");
        };

        let req = build_stream_request(&request, Version::HTTP_3)?;
        match transport.send_request(req, request.body).await {
            Ok((response, stream)) => {
                let (parts, ()) = response.into_parts();
                Ok(TransportResponse {
                    status: parts.status,
                    version: Version::HTTP_3,
                    headers: parts.headers,
                    body: IncomingBody::H3 { stream },
                })
            }
            Err(failure) => {
                if !transport.is_open() {
                    self.close(CloseReason::Error);
                }
                Err(failure)
            }
        }
    }

    /// RFC 8441 extended CONNECT for WebSocket over HTTP/2.
    pub(crate) async fn extended_connect(
        self: &Arc<Self>,
        request: OutboundRequest,
    ) -> Result<(StatusCode, HeaderMap, http2::H2StreamIo), Error> {
        let Transport::H2(transport) = &self.transport else {
            return Err(Error::upgrade(ExtendedConnectUnsupported));
        };

        let mut req = build_stream_request(&request, Version::HTTP_2)
            .map_err(|f| f.error)?;
        *req.method_mut() = Method::CONNECT;
        req.extensions_mut()
            .insert(h2::ext::Protocol::from_static("websocket"));

        let (response, send) = transport.extended_connect(req).await?;
        let (parts, recv) = response.into_parts();
        Ok((
            parts.status,
            parts.headers,
            http2::H2StreamIo::new(recv, send),
        ))
    }
}

#[cfg(test)]
impl Conn {
    pub(crate) fn test_h1(origin: Origin, io: BoxedIo) -> Arc<Conn> {
        Conn::new(
            origin,
            Protocol::H1,
            Transport::H1(Arc::new(tokio::sync::Mutex::new(Some(
                Http1Transport::new(io),
            )))),
            1,
            None,
        )
    }

    pub(crate) fn test_h2(
        origin: Origin,
        transport: Http2Transport,
        max_streams: u32,
    ) -> Arc<Conn> {
        Conn::new(origin, Protocol::H2, Transport::H2(transport), max_streams, None)
    }
}

impl std::fmt::Debug for Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn")
            .field("id", &self.id)
            .field("origin", &self.origin)
            .field("protocol", &self.protocol)
            .finish()
    }
}

#[derive(Debug)]
struct ExtendedConnectUnsupported;

impl std::fmt::Display for ExtendedConnectUnsupported {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("extended CONNECT requires an HTTP/2 connection")
    }
}

impl std::error::Error for ExtendedConnectUnsupported {}

/// A prepared request handed to the connection layer.
pub(crate) struct OutboundRequest {
    pub(crate) method: Method,
    pub(crate) url: Url,
    pub(crate) headers: HeaderMap,
    pub(crate) body: Option<Body>,
    pub(crate) expect_100_timeout: Duration,
}

/// Response head plus the protocol-specific body source.
pub(crate) struct TransportResponse {
    pub(crate) status: StatusCode,
    pub(crate) version: Version,
    pub(crate) headers: HeaderMap,
    pub(crate) body: IncomingBody,
}

pub(crate) enum IncomingBody {
    /// Exclusive hold on the H1 transport until the body is drained (or the
    /// exchange is abandoned, which closes the connection).
    H1 {
        guard: OwnedMutexGuard<Option<Http1Transport>>,
        framing: Framing,
    },
    H2 {
        recv: h2::RecvStream,
    },
    H3 {
        stream: H3RequestStream,
    },
}

/// Builds the `http::Request` for a multiplexed stream, mapping websocket
/// schemes onto http(s) and dropping H1 connection-level headers.
fn build_stream_request(
    request: &OutboundRequest,
    version: Version,
) -> Result<http::Request<()>, SendFailure> {
    let scheme = match request.url.scheme() {
        "ws" | "ws+rfc8441" => "http",
        "wss" | "wss+rfc8441" => "https",
        other => other,
    };
    let authority = crate::origin::authority_of(&request.url);
    let path = origin_form(&request.url);

    let uri = http::Uri::builder()
        .scheme(scheme)
        .authority(authority)
        .path_and_query(path)
        .build()
        .map_err(|e| SendFailure {
            error: Error::builder(e),
            retryable_presend: false,
        })?;

    let mut builder = http::Request::builder()
        .method(request.method.clone())
        .uri(uri)
        .version(version);

    if let Some(headers) = builder.headers_mut() {
        for (name, value) in &request.headers {
            if is_h1_only_header(name) {
                continue;
            }
            headers.append(name.clone(), value.clone());
        }
    }

    builder.body(()).map_err(|e| SendFailure {
        error: Error::builder(e),
        retryable_presend: false,
    })
}

fn is_h1_only_header(name: &header::HeaderName) -> bool {
    matches!(
        *name,
        header::HOST
            | header::CONNECTION
            | header::TRANSFER_ENCODING
            | header::UPGRADE
    ) || name.as_str() == "keep-alive"
        || name.as_str() == "proxy-connection"
}

/// origin-form request target: path plus query, never empty.
fn origin_form(url: &Url) -> String {
    let target = &url[url::Position::BeforePath..url::Position::AfterQuery];
    if target.is_empty() {
        "/".to_string()
    } else {
        target.to_string()
    }
}

// ===== Connector =====

/// How protocol selection is decided before ALPN gets a say.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum VersionPref {
    /// ALPN decides between h2 and http/1.1 on TLS; plaintext is HTTP/1.1.
    Auto,
    Http1Only,
    /// Plaintext connections speak HTTP/2 without upgrade.
    Http2PriorKnowledge,
    /// QUIC + HTTP/3.
    Http3,
}

/// Opens connections: resolve, dial, tunnel, TLS, protocol handshake.
pub(crate) struct Connector {
    resolver: DynResolver,
    tls: TlsConfig,
    version: VersionPref,
    nodelay: bool,
    max_streams: u32,
    lifetime: Option<Duration>,
    keepalive: KeepalivePolicy,
    h3_endpoint: OnceLock<quinn::Endpoint>,
}

impl Connector {
    pub(crate) fn new(
        resolver: DynResolver,
        tls: TlsConfig,
        version: VersionPref,
        nodelay: bool,
        max_streams: u32,
        lifetime: Option<Duration>,
        keepalive: KeepalivePolicy,
    ) -> Connector {
        Connector {
            resolver,
            tls,
            version,
            nodelay,
            max_streams,
            lifetime,
            keepalive,
            h3_endpoint: OnceLock::new(),
        }
    }

    /// Opens a connection for `origin`, negotiating the protocol.
    pub(crate) async fn connect(
        &self,
        origin: &Origin,
        proxy: Option<&ProxyScheme>,
    ) -> Result<Arc<Conn>, Error> {
        debug!("connecting to {:?}", origin);

        if self.version == VersionPref::Http3 {
            return self.connect_h3(origin, proxy).await;
        }

        let io = self.dial(origin, proxy).await?;

        let scheme = origin.scheme();
        let (io, negotiated_h2) = if scheme.is_tls() {
            let alpn = self.alpn_for(scheme);
            let config = self.tls.build(alpn)?;
            let connector = tokio_rustls::TlsConnector::from(config);
            let server_name = server_name(origin.host())?;

            let tls = connector
                .connect(server_name, io)
                .await
                .map_err(handshake_error)?;

            // Unknown or absent ALPN falls back to HTTP/1.1.
            let is_h2 = tls.get_ref().1.alpn_protocol() == Some(b"h2");
            if scheme.is_extended_connect() && !is_h2 {
                return Err(Error::upgrade(ExtendedConnectUnsupported));
            }
            (Box::new(tls) as BoxedIo, is_h2)
        } else {
            (io, self.version == VersionPref::Http2PriorKnowledge)
        };

        let conn = if negotiated_h2 {
            let transport = Http2Transport::handshake(io).await?;
            Conn::new(
                origin.clone(),
                Protocol::H2,
                Transport::H2(transport),
                self.max_streams,
                self.lifetime,
            )
        } else {
            Conn::new(
                origin.clone(),
                Protocol::H1,
                Transport::H1(Arc::new(tokio::sync::Mutex::new(Some(
                    Http1Transport::new(io),
                )))),
                1,
                self.lifetime,
            )
        };

        debug!("conn {} established ({:?})", conn.id(), conn.protocol());
        Ok(conn)
    }

    async fn connect_h3(
        &self,
        origin: &Origin,
        proxy: Option<&ProxyScheme>,
    ) -> Result<Arc<Conn>, Error> {
        if !origin.is_tls() {
            return Err(Error::builder(H3RequiresTls));
        }
        if proxy.is_some() {
            return Err(Error::builder(H3ProxyUnsupported));
        }
        if origin.scheme().is_websocket() {
            // No finalized WebSocket-over-HTTP/3 standard to speak.
            return Err(Error::builder(H3WebSocketUnsupported));
        }

        let addr = self.resolve_one(origin.host(), origin.port()).await?;
        let endpoint = match self.h3_endpoint.get() {
            Some(endpoint) => endpoint,
            None => {
                let endpoint = http3::client_endpoint()?;
                self.h3_endpoint.get_or_init(|| endpoint)
            }
        };

        let tls = self.tls.build(AlpnProtos::Http3)?;
        let transport = Http3Transport::handshake(
            endpoint,
            tls,
            addr,
            origin.host(),
            self.keepalive.quic_interval(),
        )
        .await?;

        let conn = Conn::new(
            origin.clone(),
            Protocol::H3,
            Transport::H3(transport),
            self.max_streams,
            self.lifetime,
        );
        debug!("conn {} established (H3)", conn.id());
        Ok(conn)
    }

    fn alpn_for(&self, scheme: Scheme) -> AlpnProtos {
        if scheme.is_extended_connect() {
            return AlpnProtos::Http2;
        }
        if scheme.is_websocket() {
            // A classic upgrade needs HTTP/1.1 on a fresh connection.
            return AlpnProtos::Http1;
        }
        match self.version {
            VersionPref::Auto => AlpnProtos::All,
            VersionPref::Http1Only => AlpnProtos::Http1,
            VersionPref::Http2PriorKnowledge => AlpnProtos::Http2,
            VersionPref::Http3 => AlpnProtos::Http3,
        }
    }

    /// TCP to the origin, or to the proxy with a CONNECT tunnel for TLS
    /// origins.
    async fn dial(
        &self,
        origin: &Origin,
        proxy: Option<&ProxyScheme>,
    ) -> Result<BoxedIo, Error> {
        match proxy {
            None => self.tcp_connect(origin.host(), origin.port()).await,
            Some(proxy) => {
                let mut io = self.tcp_connect(proxy.host(), proxy.port()).await?;
                if proxy.is_tls() {
                    let config = self.tls.build(AlpnProtos::Http1)?;
                    let connector = tokio_rustls::TlsConnector::from(config);
                    let name = server_name(proxy.host())?;
                    let tls = connector
                        .connect(name, io)
                        .await
                        .map_err(handshake_error)?;
                    io = Box::new(tls);
                }
                if origin.is_tls() || origin.scheme().is_websocket() {
                    tunnel(io, origin.host(), origin.port(), proxy.auth()).await
                } else {
                    Ok(io)
                }
            }
        }
    }

    async fn tcp_connect(&self, host: &str, port: u16) -> Result<BoxedIo, Error> {
        let addrs = self.resolve(host, port).await?;

        let mut last_err = None;
        for addr in addrs {
            trace!("dialing {addr}");
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    if self.nodelay {
                        let _ = stream.set_nodelay(true);
                    }
                    return Ok(Box::new(stream));
                }
                Err(e) => last_err = Some(e),
            }
        }

        Err(match last_err {
            Some(e) => Error::connect(e),
            None => Error::connect(NoAddresses),
        })
    }

    async fn resolve(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>, Error> {
        let bare = host.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = bare.parse::<IpAddr>() {
            return Ok(vec![SocketAddr::new(ip, port)]);
        }

        let addrs = self
            .resolver
            .resolve(Name::from(host))
            .await
            .map_err(Error::connect)?;
        let addrs: Vec<SocketAddr> = addrs
            .map(|mut addr| {
                addr.set_port(port);
                addr
            })
            .collect();
        if addrs.is_empty() {
            return Err(Error::connect(NoAddresses));
        }
        Ok(addrs)
    }

    async fn resolve_one(&self, host: &str, port: u16) -> Result<SocketAddr, Error> {
        Ok(self.resolve(host, port).await?[0])
    }
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("version", &self.version)
            .finish()
    }
}

/// Establishes a CONNECT tunnel through a forward proxy.
async fn tunnel(
    mut io: BoxedIo,
    host: &str,
    port: u16,
    auth: Option<&http::HeaderValue>,
) -> Result<BoxedIo, Error> {
    let mut request = format!(
        "CONNECT {host}:{port} HTTP/1.1\r\nhost: {host}:{port}\r\n"
    );
    if let Some(auth) = auth {
        request.push_str("proxy-authorization: ");
        request.push_str(auth.to_str().map_err(Error::builder)?);
        request.push_str("\r\n");
    }
    request.push_str("\r\n");

    io.write_all(request.as_bytes()).await.map_err(Error::connect)?;

    let mut buf = BytesMut::with_capacity(1024);
    loop {
        if io.read_buf(&mut buf).await.map_err(Error::connect)? == 0 {
            return Err(Error::connect(TunnelFailed));
        }
        if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = &buf[..end];
            if head.starts_with(b"HTTP/1.1 200") || head.starts_with(b"HTTP/1.0 200") {
                // Anything past the head belongs to the tunneled protocol.
                let leftover = buf.split_off(end + 4).freeze();
                return Ok(Box::new(Rewind::new(leftover, io)));
            }
            return Err(Error::connect(TunnelFailed));
        }
        if buf.len() > 16 * 1024 {
            return Err(Error::connect(TunnelFailed));
        }
    }
}

fn server_name(host: &str) -> Result<rustls::pki_types::ServerName<'static>, Error> {
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    rustls::pki_types::ServerName::try_from(bare.to_string()).map_err(Error::tls)
}

#[derive(Debug)]
struct NoAddresses;

impl std::fmt::Display for NoAddresses {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dns resolution returned no addresses")
    }
}

impl std::error::Error for NoAddresses {}

#[derive(Debug)]
struct TunnelFailed;

impl std::fmt::Display for TunnelFailed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("proxy CONNECT tunnel was refused")
    }
}

impl std::error::Error for TunnelFailed {}

#[derive(Debug)]
struct H3RequiresTls;

impl std::fmt::Display for H3RequiresTls {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("HTTP/3 requires a TLS scheme")
    }
}

impl std::error::Error for H3RequiresTls {}

#[derive(Debug)]
struct H3ProxyUnsupported;

impl std::fmt::Display for H3ProxyUnsupported {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("HTTP/3 cannot be routed through a proxy")
    }
}

impl std::error::Error for H3ProxyUnsupported {}

#[derive(Debug)]
struct H3WebSocketUnsupported;

impl std::fmt::Display for H3WebSocketUnsupported {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("WebSocket over HTTP/3 is not standardized")
    }
}

impl std::error::Error for H3WebSocketUnsupported {}

/// Replays buffered bytes before reading the inner transport; used when a
/// protocol switch leaves parsed-but-unconsumed bytes behind, and after
/// CONNECT tunnels.
pub(crate) struct Rewind {
    pre: Bytes,
    io: BoxedIo,
}

impl Rewind {
    pub(crate) fn new(pre: impl Into<Bytes>, io: BoxedIo) -> Rewind {
        Rewind {
            pre: pre.into(),
            io,
        }
    }
}

impl AsyncRead for Rewind {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if !self.pre.is_empty() {
            let n = self.pre.len().min(buf.remaining());
            buf.put_slice(&self.pre.split_to(n));
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for Rewind {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}
