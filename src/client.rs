//! The client and its request dispatcher.
//!
//! `Client` is cheap to clone and cloning is the recommended way to share
//! it; the pool manager and connector behind it are shared. The dispatcher
//! runs one logical request: normalize, acquire a connection, send, then
//! consult the retry and redirect controllers on the outcome and loop until
//! something is worth returning.

use std::{
    collections::HashMap,
    net::SocketAddr,
    path::Path,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use http::{
    header::{self, HeaderMap, HeaderName, HeaderValue},
    Method, StatusCode, Version,
};
use log::{debug, trace};
use once_cell::sync::Lazy;
use url::Url;

use crate::{
    body::Body,
    conn::{Connector, OutboundRequest, Protocol, VersionPref},
    dns::{gai::GaiResolver, DnsResolverWithOverrides, DynResolver, Resolve},
    error::{Error, TimedOut},
    into_url::{self, IntoUrl},
    keepalive::KeepalivePolicy,
    origin::{Origin, Scheme},
    pool::{Acquired, PerOriginPool, PoolConfig, PoolManager, ReleaseOutcome},
    proxy::{Proxy, ProxyScheme},
    redirect,
    request::{Request, RequestBuilder},
    response::{spawn_body, BodyStream, Response},
    retry::{self, Charge, Decision},
    tls::{CaSource, TlsConfig, TlsProfileId},
    ws::{self, WebSocket, WsIo},
};

/// An asynchronous `Client` to make requests with.
///
/// The client pools connections per origin over HTTP/1.1, HTTP/2 and
/// HTTP/3, retries per its retry policy, follows redirects, and upgrades
/// `ws`-family URLs to WebSocket.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientRef>,
}

struct ClientRef {
    default_headers: HeaderMap,
    https_only: bool,
    decode_content: bool,
    expect_100_timeout: Duration,
    connect_timeout: Option<Duration>,
    read_timeout: Option<Duration>,
    total_timeout: Option<Duration>,
    retry: retry::Policy,
    scrub_headers: Vec<HeaderName>,
    proxies: Vec<Proxy>,
    tls_profile: TlsProfileId,
    connector: Connector,
    pool: PoolManager,
}

/// A builder to configure a [`Client`].
#[must_use]
pub struct ClientBuilder {
    headers: HeaderMap,
    user_agent: Option<HeaderValue>,
    https_only: bool,
    decode_content: bool,
    nodelay: bool,
    connect_timeout: Option<Duration>,
    read_timeout: Option<Duration>,
    total_timeout: Option<Duration>,
    expect_100_timeout: Duration,
    retry: retry::Policy,
    scrub_headers: Vec<HeaderName>,
    proxies: Vec<Proxy>,
    system_proxies: bool,
    tls: TlsConfig,
    version: VersionPref,
    pool: PoolConfig,
    keepalive: KeepalivePolicy,
    max_concurrent_streams: u32,
    connection_lifetime: Option<Duration>,
    dns_overrides: HashMap<Box<str>, Vec<SocketAddr>>,
    resolver: Option<Arc<dyn Resolve>>,
}

impl Default for ClientBuilder {
    fn default() -> ClientBuilder {
        ClientBuilder::new()
    }
}

impl std::fmt::Debug for ClientBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientBuilder")
            .field("version", &self.version)
            .field("pool", &self.pool)
            .field("retry", &self.retry)
            .finish()
    }
}

impl ClientBuilder {
    /// Constructs a new `ClientBuilder` with the defaults.
    pub fn new() -> ClientBuilder {
        let mut headers = HeaderMap::new();
        headers.insert(header::ACCEPT, HeaderValue::from_static("*/*"));
        ClientBuilder {
            headers,
            user_agent: None,
            https_only: false,
            decode_content: true,
            nodelay: true,
            connect_timeout: None,
            read_timeout: None,
            total_timeout: None,
            expect_100_timeout: Duration::from_secs(1),
            retry: retry::Policy::default(),
            scrub_headers: Vec::new(),
            proxies: Vec::new(),
            system_proxies: true,
            tls: TlsConfig::default(),
            version: VersionPref::Auto,
            pool: PoolConfig::default(),
            keepalive: KeepalivePolicy::default(),
            max_concurrent_streams: 100,
            connection_lifetime: None,
            dns_overrides: HashMap::new(),
            resolver: None,
        }
    }

    /// Sets the `User-Agent` header used by this client.
    pub fn user_agent<V>(mut self, value: V) -> ClientBuilder
    where
        HeaderValue: TryFrom<V>,
    {
        self.user_agent = HeaderValue::try_from(value).ok();
        self
    }

    /// Headers added to every request unless overridden per request.
    pub fn default_headers(mut self, headers: HeaderMap) -> ClientBuilder {
        for (key, value) in headers.iter() {
            self.headers.insert(key, value.clone());
        }
        self
    }

    /// Total timeout from dispatch until the response head, covering every
    /// retry and redirect. Zero fails immediately.
    pub fn timeout(mut self, timeout: Duration) -> ClientBuilder {
        self.total_timeout = Some(timeout);
        self
    }

    /// Timeout for acquiring a connection: pool wait, DNS, dial, TLS.
    /// Applied per attempt.
    pub fn connect_timeout(mut self, timeout: Duration) -> ClientBuilder {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Timeout for each read while waiting on response bytes. Applied per
    /// attempt.
    pub fn read_timeout(mut self, timeout: Duration) -> ClientBuilder {
        self.read_timeout = Some(timeout);
        self
    }

    /// The retry policy (which also carries the redirect hop budget).
    pub fn retries(mut self, policy: retry::Policy) -> ClientBuilder {
        self.retry = policy;
        self
    }

    /// Extra headers scrubbed when a redirect crosses origins, in addition
    /// to the credential headers that are always scrubbed.
    pub fn remove_headers_on_redirect<I>(mut self, headers: I) -> ClientBuilder
    where
        I: IntoIterator<Item = HeaderName>,
    {
        self.scrub_headers = headers.into_iter().collect();
        self
    }

    /// Add a proxy rule. The first matching rule wins; system proxies
    /// remain as fallback unless [`no_proxy`](ClientBuilder::no_proxy) is
    /// called.
    pub fn proxy(mut self, proxy: Proxy) -> ClientBuilder {
        self.proxies.push(proxy);
        self
    }

    /// Disables proxies, including the ones from environment variables.
    pub fn no_proxy(mut self) -> ClientBuilder {
        self.proxies.clear();
        self.system_proxies = false;
        self
    }

    /// Refuse to dispatch to plaintext origins.
    pub fn https_only(mut self, enabled: bool) -> ClientBuilder {
        self.https_only = enabled;
        self
    }

    /// Transparently decode gzip response bodies (and advertise
    /// `Accept-Encoding: gzip`). On by default.
    pub fn decode_content(mut self, enabled: bool) -> ClientBuilder {
        self.decode_content = enabled;
        self
    }

    /// Accept any TLS certificate. This makes connections vulnerable to
    /// active attackers; only for testing.
    pub fn danger_accept_invalid_certs(mut self, accept: bool) -> ClientBuilder {
        self.tls.verify = !accept;
        self
    }

    /// Trust the roots from a PEM bundle file instead of the built-in set.
    pub fn ca_bundle<P: AsRef<Path>>(mut self, path: P) -> ClientBuilder {
        self.tls.ca = CaSource::File(path.as_ref().to_path_buf());
        self
    }

    /// Trust the roots from PEM bytes instead of the built-in set.
    pub fn ca_pem(mut self, pem: Vec<u8>) -> ClientBuilder {
        self.tls.ca = CaSource::Pem(pem);
        self
    }

    /// Only speak HTTP/1.1, even when ALPN could negotiate more.
    pub fn http1_only(mut self) -> ClientBuilder {
        self.version = VersionPref::Http1Only;
        self
    }

    /// Speak HTTP/2 on plaintext connections without upgrade, and insist on
    /// `h2` over TLS.
    pub fn http2_prior_knowledge(mut self) -> ClientBuilder {
        self.version = VersionPref::Http2PriorKnowledge;
        self
    }

    /// Dial origins over QUIC and speak HTTP/3.
    pub fn http3_prior_knowledge(mut self) -> ClientBuilder {
        self.version = VersionPref::Http3;
        self
    }

    /// Client-side cap on concurrent streams per multiplexed connection.
    pub fn max_concurrent_streams(mut self, max: u32) -> ClientBuilder {
        self.max_concurrent_streams = max.max(1);
        self
    }

    /// Cap on connections per origin (idle plus in use).
    pub fn pool_max_per_origin(mut self, max: usize) -> ClientBuilder {
        self.pool.max_per_origin = max.max(1);
        self
    }

    /// Idle HTTP/1.1 connections kept per origin.
    pub fn pool_max_idle_per_origin(mut self, max: usize) -> ClientBuilder {
        self.pool.max_idle_per_origin = max;
        self
    }

    /// Per-origin pools kept before cold empty pools are evicted.
    pub fn pool_num_pools(mut self, max: usize) -> ClientBuilder {
        self.pool.num_pools = max.max(1);
        self
    }

    /// Whether an at-capacity pool queues the acquire (default) or fails
    /// fast with a pool-full error.
    pub fn pool_block_if_full(mut self, block: bool) -> ClientBuilder {
        self.pool.block_if_full = block;
        self
    }

    /// Keepalive probing policy for idle multiplexed connections.
    pub fn keepalive(mut self, policy: KeepalivePolicy) -> ClientBuilder {
        self.keepalive = policy;
        self
    }

    /// Retire connections after this age: they drain and close instead of
    /// being reused.
    pub fn connection_lifetime(mut self, lifetime: Duration) -> ClientBuilder {
        self.connection_lifetime = Some(lifetime);
        self
    }

    /// Set `TCP_NODELAY` on sockets (default true).
    pub fn tcp_nodelay(mut self, enabled: bool) -> ClientBuilder {
        self.nodelay = enabled;
        self
    }

    /// Pins a hostname to fixed socket addresses, bypassing DNS.
    pub fn resolve(mut self, host: &str, addrs: &[SocketAddr]) -> ClientBuilder {
        self.dns_overrides.insert(host.into(), addrs.to_vec());
        self
    }

    /// Replaces the DNS resolver.
    pub fn dns_resolver<R: Resolve + 'static>(mut self, resolver: R) -> ClientBuilder {
        self.resolver = Some(Arc::new(resolver));
        self
    }

    /// Builds the `Client`.
    pub fn build(self) -> Result<Client, Error> {
        let mut headers = self.headers;
        let user_agent = self.user_agent.unwrap_or_else(|| {
            HeaderValue::from_static(concat!("weft/", env!("CARGO_PKG_VERSION")))
        });
        headers
            .entry(header::USER_AGENT)
            .or_insert(user_agent);

        let mut proxies = self.proxies;
        if self.system_proxies {
            proxies.extend(Proxy::system());
        }

        let base: Arc<dyn Resolve> = match self.resolver {
            Some(resolver) => resolver,
            None => Arc::new(GaiResolver::new()),
        };
        let resolver: Arc<dyn Resolve> = if self.dns_overrides.is_empty() {
            base
        } else {
            Arc::new(DnsResolverWithOverrides::new(base, self.dns_overrides))
        };

        let tls_profile = self.tls.profile_id();
        let connector = Connector::new(
            DynResolver::new(resolver),
            self.tls,
            self.version,
            self.nodelay,
            self.max_concurrent_streams,
            self.connection_lifetime,
            self.keepalive.clone(),
        );
        let pool = PoolManager::new(self.pool, self.keepalive);

        Ok(Client {
            inner: Arc::new(ClientRef {
                default_headers: headers,
                https_only: self.https_only,
                decode_content: self.decode_content,
                expect_100_timeout: self.expect_100_timeout,
                connect_timeout: self.connect_timeout,
                read_timeout: self.read_timeout,
                total_timeout: self.total_timeout,
                retry: self.retry,
                scrub_headers: self.scrub_headers,
                proxies,
                tls_profile,
                connector,
                pool,
            }),
        })
    }
}

// ===== impl Client =====

impl Default for Client {
    fn default() -> Client {
        Client::new()
    }
}

impl Client {
    /// Constructs a new `Client` with the default configuration.
    ///
    /// # Panics
    ///
    /// This method panics if the default configuration cannot be loaded;
    /// use [`Client::builder()`] to handle the failure.
    pub fn new() -> Client {
        Client::builder().build().expect("Client::new()")
    }

    /// Creates a [`ClientBuilder`] to configure a `Client`.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Convenience method to make a `GET` request to a URL.
    pub fn get<U: IntoUrl>(&self, url: U) -> RequestBuilder {
        self.request(Method::GET, url)
    }

    /// Convenience method to make a `POST` request to a URL.
    pub fn post<U: IntoUrl>(&self, url: U) -> RequestBuilder {
        self.request(Method::POST, url)
    }

    /// Convenience method to make a `PUT` request to a URL.
    pub fn put<U: IntoUrl>(&self, url: U) -> RequestBuilder {
        self.request(Method::PUT, url)
    }

    /// Convenience method to make a `PATCH` request to a URL.
    pub fn patch<U: IntoUrl>(&self, url: U) -> RequestBuilder {
        self.request(Method::PATCH, url)
    }

    /// Convenience method to make a `DELETE` request to a URL.
    pub fn delete<U: IntoUrl>(&self, url: U) -> RequestBuilder {
        self.request(Method::DELETE, url)
    }

    /// Convenience method to make a `HEAD` request to a URL.
    pub fn head<U: IntoUrl>(&self, url: U) -> RequestBuilder {
        self.request(Method::HEAD, url)
    }

    /// Starts building a request with the given method and URL.
    pub fn request<U: IntoUrl>(&self, method: Method, url: U) -> RequestBuilder {
        let request = url.into_url().map(|url| Request::new(method, url));
        RequestBuilder::new(self.clone(), request)
    }

    /// Alias of [`request`](Client::request): the returned response's body
    /// is always left unread for the caller to stream.
    pub fn open<U: IntoUrl>(&self, method: Method, url: U) -> RequestBuilder {
        self.request(method, url)
    }

    /// Starts building a WebSocket handshake for a `ws`/`wss` (or RFC 8441
    /// `ws+rfc8441`/`wss+rfc8441`) URL; on success the response carries the
    /// extension.
    pub fn websocket<U: IntoUrl>(&self, url: U) -> RequestBuilder {
        self.request(Method::GET, url)
    }

    /// Closes all pools. In-flight requests finish; idle connections close
    /// now; subsequent requests fail with a pool error.
    pub fn close(&self) {
        self.inner.pool.shutdown();
    }

    /// Executes a `Request`.
    pub async fn execute(&self, request: Request) -> Result<Response, Error> {
        let url = request.url().clone();
        let total = request.timeout().copied().or(self.inner.total_timeout);
        match total {
            None => self.dispatch(request).await,
            Some(d) if d.is_zero() => Err(Error::timeout(TimedOut::Total).with_url(url)),
            Some(d) => match tokio::time::timeout(d, self.dispatch(request)).await {
                Ok(result) => result,
                Err(_elapsed) => Err(Error::timeout(TimedOut::Total).with_url(url)),
            },
        }
    }

    /// The redirect/retry loop around individual attempts.
    async fn dispatch(&self, mut request: Request) -> Result<Response, Error> {
        let inner = &self.inner;

        let mut url = request.url().clone();
        into_url::normalize(&mut url);
        let scheme =
            Scheme::parse(url.scheme()).ok_or_else(|| Error::url_bad_scheme(url.clone()))?;
        if inner.https_only && !scheme.is_tls() {
            return Err(Error::url_bad_scheme(url));
        }

        // WebSocket handshakes are always GET.
        let mut method = if scheme.is_websocket() {
            Method::GET
        } else {
            request.method().clone()
        };

        let mut headers = inner.default_headers.clone();
        replace_headers(&mut headers, request.headers());

        let idempotent = request.is_idempotent();
        let read_timeout = request.read_timeout().or(inner.read_timeout);
        let protocols = request.protocols().to_vec();
        let mut retry_policy = request
            .retry_policy()
            .cloned()
            .unwrap_or_else(|| inner.retry.clone());
        let mut body = request.take_body();
        let mut one_shot_spent = false;

        if inner.decode_content
            && !scheme.is_websocket()
            && !headers.contains_key(header::ACCEPT_ENCODING)
        {
            headers.insert(
                header::ACCEPT_ENCODING,
                HeaderValue::from_static("gzip"),
            );
        }

        loop {
            let scheme = Scheme::parse(url.scheme())
                .ok_or_else(|| Error::url_bad_scheme(url.clone()))?;

            let attempt_body = match &body {
                None => None,
                Some(b) => match b.try_clone() {
                    Some(clone) => Some(clone),
                    None => {
                        one_shot_spent = true;
                        body.take()
                    }
                },
            };

            let outcome = self
                .attempt(
                    &url,
                    scheme,
                    &method,
                    &headers,
                    attempt_body,
                    read_timeout,
                    &protocols,
                )
                .await;

            match outcome {
                Ok(response) => {
                    if retry_policy.retries_status(response.status()) {
                        match retry_policy.charge(
                            Charge::Status,
                            idempotent,
                            &method,
                            Some(response.headers()),
                        ) {
                            Decision::Retry { next, delay } if !one_shot_spent => {
                                debug!(
                                    "retrying {url} on status {} after {delay:?}",
                                    response.status()
                                );
                                response.release_conn();
                                tokio::time::sleep(delay).await;
                                retry_policy = next;
                                continue;
                            }
                            Decision::Retry { .. } | Decision::Surface => {
                                return Ok(response);
                            }
                            Decision::Exhausted => {
                                return if retry_policy.raises_on_status() {
                                    let cause =
                                        Error::status_code(url.clone(), response.status());
                                    Err(Error::max_retry(cause, url))
                                } else {
                                    Ok(response)
                                };
                            }
                        }
                    }

                    if redirect::is_redirect(response.status()) {
                        if let Some(follow) = redirect::follow_up(
                            response.status(),
                            response.headers(),
                            &url,
                            &method,
                        )? {
                            match retry_policy.charge(Charge::Redirect, idempotent, &method, None)
                            {
                                Decision::Retry { next, .. } => {
                                    retry_policy = next;
                                    redirect::remove_sensitive_headers(
                                        &mut headers,
                                        &follow.url,
                                        &url,
                                        &inner.scrub_headers,
                                    );
                                    if !follow.keep_body {
                                        body = None;
                                        redirect::remove_content_headers(&mut headers);
                                    } else if one_shot_spent {
                                        return Err(Error::redirect(NonReplayableBody, url));
                                    }
                                    debug!("redirecting {} -> {}", url, follow.url);
                                    response.release_conn();
                                    method = follow.method;
                                    url = follow.url;
                                    continue;
                                }
                                Decision::Surface | Decision::Exhausted => {
                                    return if retry_policy.raises_on_redirect() {
                                        Err(Error::too_many_redirects(url))
                                    } else {
                                        Ok(response)
                                    };
                                }
                            }
                        }
                    }

                    return Ok(response);
                }
                Err(failure) => {
                    let Some(charge) = failure.charge else {
                        return Err(failure.error);
                    };
                    if one_shot_spent {
                        // The streaming body is gone; a replay would send a
                        // different request.
                        return Err(failure.error);
                    }
                    match retry_policy.charge(charge, idempotent, &method, None) {
                        Decision::Retry { next, delay } => {
                            debug!("retrying {url} after {:?}: {}", delay, failure.error);
                            tokio::time::sleep(delay).await;
                            retry_policy = next;
                            continue;
                        }
                        Decision::Surface => return Err(failure.error),
                        Decision::Exhausted => {
                            return Err(Error::max_retry(failure.error, url))
                        }
                    }
                }
            }
        }
    }

    /// One acquire + send. Failures carry the retry charge class, or `None`
    /// when the error must surface untouched.
    async fn attempt(
        &self,
        url: &Url,
        scheme: Scheme,
        method: &Method,
        base_headers: &HeaderMap,
        body: Option<Body>,
        read_timeout: Option<Duration>,
        protocols: &[String],
    ) -> Result<Response, AttemptFailure> {
        let inner = &self.inner;

        let proxy = inner.proxies.iter().find_map(|p| p.intercept(url));
        let origin = Origin::from_url(url, inner.tls_profile, proxy.as_ref())
            .map_err(AttemptFailure::surface)?;
        let pool = inner
            .pool
            .pool_for(&origin)
            .map_err(|e| AttemptFailure::surface(e.with_url(url.clone())))?;

        if inner.connect_timeout == Some(Duration::ZERO) {
            return Err(AttemptFailure {
                error: Error::timeout(TimedOut::Connect).with_url(url.clone()),
                charge: Some(Charge::Connect),
            });
        }
        let deadline = inner.connect_timeout.map(|d| Instant::now() + d);

        let acquired = pool.acquire(deadline).await.map_err(|e| {
            let charge = e.is_timeout().then_some(Charge::Connect);
            AttemptFailure {
                error: e.with_url(url.clone()),
                charge,
            }
        })?;

        let conn = match acquired {
            Acquired::Reused(conn) => conn,
            Acquired::ToOpen(permit) => {
                let connect = inner.connector.connect(&origin, proxy.as_ref());
                let result = match inner.connect_timeout {
                    Some(d) => tokio::time::timeout(d, connect)
                        .await
                        .unwrap_or_else(|_| Err(Error::timeout(TimedOut::Connect))),
                    None => connect.await,
                };
                match result {
                    Ok(conn) => {
                        permit.fulfill(&conn);
                        conn
                    }
                    Err(e) => {
                        drop(permit);
                        return Err(AttemptFailure {
                            error: e.with_url(url.clone()),
                            charge: Some(Charge::Connect),
                        });
                    }
                }
            }
        };
        let borrow = Borrow::new(pool, conn);

        let mut headers = base_headers.clone();
        self.prepare_headers(&mut headers, borrow.conn(), url, method, &body, &proxy, scheme);

        if scheme.is_websocket() {
            return self
                .attempt_ws(borrow, url, scheme, headers, protocols, read_timeout)
                .await
                .map_err(AttemptFailure::surface);
        }

        let outbound = OutboundRequest {
            method: method.clone(),
            url: url.clone(),
            headers,
            body,
            expect_100_timeout: inner.expect_100_timeout,
        };

        let conn = borrow.conn().clone();
        let send = conn.send(outbound);
        let result = match read_timeout {
            Some(d) => match tokio::time::timeout(d, send).await {
                Ok(result) => result,
                Err(_elapsed) => Err(crate::conn::SendFailure {
                    error: Error::timeout(TimedOut::Read),
                    retryable_presend: false,
                }),
            },
            None => send.await,
        };

        match result {
            Ok(transported) => {
                if transported.status == StatusCode::SWITCHING_PROTOCOLS {
                    // Nothing asked for an upgrade; the framing after 101
                    // is unknowable, so the connection goes.
                    drop(transported.body);
                    borrow.release(ReleaseOutcome::Broken);
                    return Ok(Response::new(
                        transported.status,
                        transported.version,
                        transported.headers,
                        url.clone(),
                        BodyStream::Empty,
                        Arc::new(Mutex::new(None)),
                    ));
                }

                let gzip = inner.decode_content
                    && *method != Method::HEAD
                    && transported
                        .headers
                        .get(header::CONTENT_ENCODING)
                        .is_some_and(|v| v.as_bytes().eq_ignore_ascii_case(b"gzip"));

                trace!(
                    "response {} from {:?} over conn {}",
                    transported.status,
                    origin,
                    conn.id()
                );
                // The body pump owns the release hook from here.
                let (stream, trailers) =
                    spawn_body(borrow.take(), transported.body, read_timeout, gzip);
                Ok(Response::new(
                    transported.status,
                    transported.version,
                    transported.headers,
                    url.clone(),
                    stream,
                    trailers,
                ))
            }
            Err(failure) => {
                // The conn layer already marked the connection state; the
                // pool just needs the borrow returned.
                if conn.is_multiplexed() {
                    borrow.release(ReleaseOutcome::Ok);
                } else {
                    borrow.release(ReleaseOutcome::Broken);
                }

                let charge = if failure.retryable_presend {
                    Some(Charge::PreSend)
                } else if failure.error.is_timeout() || failure.error.is_read() {
                    Some(Charge::Read)
                } else {
                    // Write and protocol failures surface.
                    None
                };
                Err(AttemptFailure {
                    error: failure.error.with_url(url.clone()),
                    charge,
                })
            }
        }
    }

    /// Finishes a WebSocket handshake on a borrowed connection.
    async fn attempt_ws(
        &self,
        borrow: Borrow,
        url: &Url,
        scheme: Scheme,
        mut headers: HeaderMap,
        protocols: &[String],
        read_timeout: Option<Duration>,
    ) -> Result<Response, Error> {
        let inner = &self.inner;
        let conn = borrow.conn().clone();

        if scheme.is_extended_connect() && conn.protocol() != Protocol::H2 {
            // RFC 8441 only exists for HTTP/2.
            borrow.release(ReleaseOutcome::Ok);
            return Err(Error::upgrade(ExtendedConnectNeedsH2).with_url(url.clone()));
        }

        if conn.protocol() == Protocol::H2 {
            // RFC 8441 extended CONNECT: the upgrade rides one stream.
            if let Err(e) = ws::prepare_rfc8441(&mut headers, protocols) {
                borrow.release(ReleaseOutcome::Ok);
                return Err(e);
            }
            let outbound = OutboundRequest {
                method: Method::GET,
                url: url.clone(),
                headers,
                body: None,
                expect_100_timeout: inner.expect_100_timeout,
            };
            let result = conn.extended_connect(outbound).await;
            let (status, resp_headers, io) = match result {
                Ok(parts) => parts,
                Err(e) => {
                    borrow.release(ReleaseOutcome::Ok);
                    return Err(e.with_url(url.clone()));
                }
            };

            let protocol = match ws::verify_rfc8441(status, &resp_headers, protocols) {
                Ok(protocol) => protocol,
                Err(e) => {
                    borrow.release(ReleaseOutcome::Ok);
                    return Err(e.with_url(url.clone()));
                }
            };

            // The stream guard owns the release from here.
            let guard = ws::StreamGuard::new(borrow.take());
            let websocket =
                WebSocket::from_io(WsIo::H2 { io, _guard: guard }, protocol).await;
            return Ok(Response::new(
                status,
                Version::HTTP_2,
                resp_headers,
                url.clone(),
                BodyStream::Empty,
                Arc::new(Mutex::new(None)),
            )
            .with_extension(websocket));
        }

        // Classic HTTP/1.1 upgrade.
        let nonce = match ws::prepare_h1(&mut headers, protocols) {
            Ok(nonce) => nonce,
            Err(e) => {
                borrow.release(ReleaseOutcome::Ok);
                return Err(e);
            }
        };
        let outbound = OutboundRequest {
            method: Method::GET,
            url: url.clone(),
            headers,
            body: None,
            expect_100_timeout: inner.expect_100_timeout,
        };

        let send = conn.send(outbound);
        let result = match read_timeout {
            Some(d) => match tokio::time::timeout(d, send).await {
                Ok(result) => result,
                Err(_elapsed) => {
                    borrow.release(ReleaseOutcome::Broken);
                    return Err(Error::timeout(TimedOut::Read).with_url(url.clone()));
                }
            },
            None => send.await,
        };

        let transported = match result {
            Ok(t) => t,
            Err(failure) => {
                borrow.release(ReleaseOutcome::Broken);
                return Err(failure.error.with_url(url.clone()));
            }
        };

        let protocol =
            match ws::verify_h1(transported.status, &transported.headers, &nonce, protocols) {
                Ok(protocol) => protocol,
                Err(e) => {
                    drop(transported.body);
                    borrow.release(ReleaseOutcome::Broken);
                    return Err(e.with_url(url.clone()));
                }
            };

        let crate::conn::IncomingBody::H1 { mut guard, .. } = transported.body else {
            borrow.release(ReleaseOutcome::Broken);
            return Err(Error::upgrade(UpgradeLost).with_url(url.clone()));
        };
        let Some(transport) = guard.take() else {
            borrow.release(ReleaseOutcome::Broken);
            return Err(Error::upgrade(UpgradeLost).with_url(url.clone()));
        };
        drop(guard);
        let (io, leftover) = transport.into_io();
        let pool = borrow.pool.clone();
        pool.dedicate(&borrow.take());

        let websocket = WebSocket::from_io(
            WsIo::H1(crate::conn::Rewind::new(leftover.freeze(), io)),
            protocol,
        )
        .await;
        Ok(Response::new(
            transported.status,
            transported.version,
            transported.headers,
            url.clone(),
            BodyStream::Empty,
            Arc::new(Mutex::new(None)),
        )
        .with_extension(websocket))
    }

    #[allow(clippy::too_many_arguments)]
    fn prepare_headers(
        &self,
        headers: &mut HeaderMap,
        conn: &Arc<crate::conn::Conn>,
        url: &Url,
        method: &Method,
        body: &Option<Body>,
        proxy: &Option<ProxyScheme>,
        scheme: Scheme,
    ) {
        if conn.protocol() == Protocol::H1 && !headers.contains_key(header::HOST) {
            if let Ok(host) = HeaderValue::try_from(crate::origin::authority_of(url)) {
                headers.insert(header::HOST, host);
            }
        }

        match body {
            Some(body) => match body.content_length() {
                Some(len) => {
                    if !headers.contains_key(header::CONTENT_LENGTH)
                        && !headers.contains_key(header::TRANSFER_ENCODING)
                    {
                        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
                    }
                }
                None => {
                    if conn.protocol() == Protocol::H1
                        && !headers.contains_key(header::TRANSFER_ENCODING)
                    {
                        headers.insert(
                            header::TRANSFER_ENCODING,
                            HeaderValue::from_static("chunked"),
                        );
                    }
                }
            },
            None => {
                // Methods that normally carry a body advertise an empty one.
                if matches!(*method, Method::POST | Method::PUT | Method::PATCH)
                    && !headers.contains_key(header::CONTENT_LENGTH)
                {
                    headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("0"));
                }
            }
        }

        // For tunneled origins the credentials went out with CONNECT.
        if conn.origin().is_proxied() && !scheme.is_tls() && !scheme.is_websocket() {
            if let Some(auth) = proxy.as_ref().and_then(|p| p.auth()) {
                headers.insert(header::PROXY_AUTHORIZATION, auth.clone());
            }
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("pool", &self.inner.pool)
            .finish()
    }
}

/// A connection borrowed from its pool for one attempt. Ensures the borrow
/// is returned even when the attempt future is dropped mid-I/O (total
/// deadline, caller cancellation): an abandoned HTTP/1.1 exchange kills the
/// connection, an abandoned stream just returns its slot.
struct Borrow {
    pool: Arc<PerOriginPool>,
    conn: Option<Arc<crate::conn::Conn>>,
}

impl Borrow {
    fn new(pool: Arc<PerOriginPool>, conn: Arc<crate::conn::Conn>) -> Borrow {
        Borrow {
            pool,
            conn: Some(conn),
        }
    }

    fn conn(&self) -> &Arc<crate::conn::Conn> {
        self.conn.as_ref().expect("borrow already released")
    }

    /// Ends the borrow with an explicit outcome.
    fn release(mut self, outcome: ReleaseOutcome) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(&conn, outcome);
        }
    }

    /// Transfers release responsibility to another owner (body pump,
    /// stream guard, or dedication).
    fn take(mut self) -> Arc<crate::conn::Conn> {
        self.conn.take().expect("borrow already released")
    }
}

impl Drop for Borrow {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            let outcome = if conn.is_multiplexed() {
                ReleaseOutcome::Ok
            } else {
                ReleaseOutcome::Broken
            };
            self.pool.release(&conn, outcome);
        }
    }
}

struct AttemptFailure {
    error: Error,
    charge: Option<Charge>,
}

impl AttemptFailure {
    fn surface(error: Error) -> AttemptFailure {
        AttemptFailure {
            error,
            charge: None,
        }
    }
}

#[derive(Debug)]
struct NonReplayableBody;

impl std::fmt::Display for NonReplayableBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("redirect requires resending a non-rewindable body")
    }
}

impl std::error::Error for NonReplayableBody {}

#[derive(Debug)]
struct ExtendedConnectNeedsH2;

impl std::fmt::Display for ExtendedConnectNeedsH2 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("rfc8441 websocket schemes require an HTTP/2 connection")
    }
}

impl std::error::Error for ExtendedConnectNeedsH2 {}

#[derive(Debug)]
struct UpgradeLost;

impl std::fmt::Display for UpgradeLost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("upgrade transport was no longer available")
    }
}

impl std::error::Error for UpgradeLost {}

/// Request headers override same-named defaults entirely, keeping the
/// request's own value order for repeated names.
fn replace_headers(dst: &mut HeaderMap, src: &HeaderMap) {
    let mut prev: Option<HeaderName> = None;
    for (name, value) in src.iter() {
        if prev.as_ref() != Some(name) {
            dst.remove(name);
            prev = Some(name.clone());
        }
        dst.append(name.clone(), value.clone());
    }
}

// ===== module-level convenience =====

static DEFAULT_CLIENT: Lazy<Mutex<Option<Client>>> = Lazy::new(|| Mutex::new(None));

fn default_client() -> Client {
    DEFAULT_CLIENT
        .lock()
        .expect("default client lock poisoned")
        .get_or_insert_with(Client::new)
        .clone()
}

/// Shorthand for a `GET` on a lazily-initialized process-wide [`Client`].
///
/// For repeated requests, build and reuse your own [`Client`].
pub async fn get<U: IntoUrl>(url: U) -> Result<Response, Error> {
    default_client().get(url).send().await
}

/// Starts a request on the process-wide [`Client`].
pub fn request<U: IntoUrl>(method: Method, url: U) -> RequestBuilder {
    default_client().request(method, url)
}

/// Drops the process-wide client (closing its pools); the next use builds a
/// fresh one. Intended for tests.
pub fn reset_default_client() {
    let mut slot = DEFAULT_CLIENT
        .lock()
        .expect("default client lock poisoned");
    if let Some(client) = slot.take() {
        client.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replace_headers_overrides_defaults() {
        let mut defaults = HeaderMap::new();
        defaults.insert(header::ACCEPT, HeaderValue::from_static("*/*"));
        defaults.insert(header::USER_AGENT, HeaderValue::from_static("weft"));

        let mut request = HeaderMap::new();
        request.append(header::ACCEPT, HeaderValue::from_static("text/html"));
        request.append(header::ACCEPT, HeaderValue::from_static("application/json"));

        replace_headers(&mut defaults, &request);
        let accepts: Vec<_> = defaults.get_all(header::ACCEPT).iter().collect();
        assert_eq!(accepts, ["text/html", "application/json"]);
        assert_eq!(defaults.get(header::USER_AGENT).unwrap(), "weft");
    }

    #[test]
    fn builder_rejects_nothing_by_default() {
        let client = Client::builder().build().unwrap();
        let req = client.get("http://example.local/").build().unwrap();
        assert_eq!(req.method(), Method::GET);
    }

    #[tokio::test]
    async fn https_only_rejects_plaintext() {
        let client = Client::builder().https_only(true).no_proxy().build().unwrap();
        let err = client
            .get("http://example.local/")
            .send()
            .await
            .unwrap_err();
        assert!(err.is_builder());
    }

    #[tokio::test]
    async fn zero_total_timeout_fails_immediately() {
        let client = Client::builder().no_proxy().build().unwrap();
        let err = client
            .get("http://example.local/")
            .timeout(Duration::ZERO)
            .send()
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn unknown_scheme_is_a_builder_error() {
        let client = Client::builder().no_proxy().build().unwrap();
        let err = client.get("ftp://example.local/").send().await.unwrap_err();
        assert!(err.is_builder());
    }
}
