use std::{error::Error as StdError, fmt, io};

use http::StatusCode;
use url::Url;

/// A `Result` alias where the `Err` case is `weft::Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// A boxed error type that can be used for dynamic error handling.
pub type BoxError = Box<dyn StdError + Send + Sync>;

/// The errors that may occur when processing a request.
///
/// Note: errors may include the full URL used to make the request. If the URL
/// contains sensitive information (e.g. an API key as a query parameter), be
/// sure to remove it ([`without_url`](Error::without_url)).
pub struct Error {
    inner: Box<Inner>,
}

struct Inner {
    kind: Kind,
    source: Option<BoxError>,
    url: Option<Url>,
}

impl Error {
    pub(crate) fn new<E>(kind: Kind, source: Option<E>) -> Error
    where
        E: Into<BoxError>,
    {
        Error {
            inner: Box::new(Inner {
                kind,
                source: source.map(Into::into),
                url: None,
            }),
        }
    }

    pub(crate) fn builder<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Builder, Some(e))
    }

    pub(crate) fn connect<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Connect, Some(e))
    }

    pub(crate) fn tls<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Tls, Some(e))
    }

    pub(crate) fn read<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Read, Some(e))
    }

    pub(crate) fn write<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Write, Some(e))
    }

    pub(crate) fn protocol<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Protocol, Some(e))
    }

    pub(crate) fn pool_full() -> Error {
        Error::new(Kind::Pool, Some(PoolFull))
    }

    pub(crate) fn pool_closed() -> Error {
        Error::new(Kind::Pool, Some(PoolClosed))
    }

    pub(crate) fn body<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Body, Some(e))
    }

    pub(crate) fn decode<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Decode, Some(e))
    }

    pub(crate) fn redirect<E: Into<BoxError>>(e: E, url: Url) -> Error {
        Error::new(Kind::Redirect, Some(e)).with_url(url)
    }

    pub(crate) fn upgrade<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Upgrade, Some(e))
    }

    pub(crate) fn timeout(which: TimedOut) -> Error {
        Error::new(Kind::Timeout, Some(which))
    }

    /// Retries exhausted; wraps the last underlying failure.
    pub(crate) fn max_retry(last: Error, url: Url) -> Error {
        Error::new(Kind::Retry, Some(last)).with_url(url)
    }

    pub(crate) fn too_many_redirects(url: Url) -> Error {
        Error::new(Kind::Retry, Some(TooManyRedirects)).with_url(url)
    }

    pub(crate) fn status_code(url: Url, status: StatusCode) -> Error {
        Error::new(Kind::Status(status), None::<Error>).with_url(url)
    }

    pub(crate) fn url_bad_scheme(url: Url) -> Error {
        Error::new(Kind::Builder, Some(BadScheme)).with_url(url)
    }
}

impl Error {
    /// Returns a possible URL related to this error.
    pub fn url(&self) -> Option<&Url> {
        self.inner.url.as_ref()
    }

    /// Returns a mutable reference to the URL related to this error.
    ///
    /// This is useful if you need to remove sensitive information from the
    /// URL (e.g. an API key in the query), but do not want to remove the URL
    /// entirely.
    pub fn url_mut(&mut self) -> Option<&mut Url> {
        self.inner.url.as_mut()
    }

    /// Add a URL related to this error (overwriting any existing).
    pub fn with_url(mut self, url: Url) -> Self {
        self.inner.url = Some(url);
        self
    }

    /// Strip the related URL from this error.
    pub fn without_url(mut self) -> Self {
        self.inner.url = None;
        self
    }

    /// Returns true if the error originated while building the request.
    pub fn is_builder(&self) -> bool {
        matches!(self.inner.kind, Kind::Builder)
    }

    /// Returns true if the error occurred before the request was sent:
    /// DNS resolution, TCP/UDP connect, or the TLS handshake.
    pub fn is_connect(&self) -> bool {
        matches!(self.inner.kind, Kind::Connect | Kind::Tls)
    }

    /// Returns true if the error is a TLS failure (certificate verification,
    /// hostname mismatch, handshake).
    pub fn is_tls(&self) -> bool {
        matches!(self.inner.kind, Kind::Tls)
    }

    /// Returns true if the error occurred while reading the response.
    pub fn is_read(&self) -> bool {
        matches!(self.inner.kind, Kind::Read)
    }

    /// Returns true if the error occurred while sending the request body.
    pub fn is_write(&self) -> bool {
        matches!(self.inner.kind, Kind::Write)
    }

    /// Returns true for malformed framing, illegal headers, and other
    /// protocol-level violations.
    pub fn is_protocol(&self) -> bool {
        matches!(self.inner.kind, Kind::Protocol)
    }

    /// Returns true if the error came from pool state (full or shut down)
    /// rather than from a connection.
    pub fn is_pool(&self) -> bool {
        matches!(self.inner.kind, Kind::Pool)
    }

    /// Returns true if the pool was at capacity in non-blocking mode.
    pub fn is_pool_full(&self) -> bool {
        self.chain_contains::<PoolFull>()
    }

    /// Returns true if retries were exhausted. The last underlying failure
    /// is available through [`source`](StdError::source).
    pub fn is_retry_exhausted(&self) -> bool {
        matches!(self.inner.kind, Kind::Retry)
    }

    /// Returns true if the redirect hop limit was reached.
    pub fn is_too_many_redirects(&self) -> bool {
        self.chain_contains::<TooManyRedirects>()
    }

    /// Returns true if the error is from a redirect policy decision.
    pub fn is_redirect(&self) -> bool {
        matches!(self.inner.kind, Kind::Redirect)
    }

    /// Returns true if the error is related to a timeout.
    pub fn is_timeout(&self) -> bool {
        if matches!(self.inner.kind, Kind::Timeout) {
            return true;
        }

        let mut source = self.source();
        while let Some(err) = source {
            if err.is::<TimedOut>() {
                return true;
            }
            if let Some(io) = err.downcast_ref::<io::Error>() {
                if io.kind() == io::ErrorKind::TimedOut {
                    return true;
                }
            }
            source = err.source();
        }

        false
    }

    /// Returns true if the error is related to decoding the response body.
    pub fn is_decode(&self) -> bool {
        matches!(self.inner.kind, Kind::Decode)
    }

    /// Returns true if the error is related to upgrading the connection.
    pub fn is_upgrade(&self) -> bool {
        matches!(self.inner.kind, Kind::Upgrade)
    }

    /// Returns true if the error is from `Response::error_for_status`.
    pub fn is_status(&self) -> bool {
        matches!(self.inner.kind, Kind::Status(_))
    }

    /// Returns true if the error is related to the request or response body.
    pub fn is_body(&self) -> bool {
        matches!(self.inner.kind, Kind::Body)
    }

    /// Returns the status code, if the error was generated from a response.
    pub fn status(&self) -> Option<StatusCode> {
        match self.inner.kind {
            Kind::Status(code) => Some(code),
            _ => None,
        }
    }

    fn chain_contains<T: StdError + 'static>(&self) -> bool {
        let mut source = self.inner.source.as_deref().map(|e| e as &dyn StdError);
        while let Some(err) = source {
            if err.is::<T>() {
                return true;
            }
            source = err.source();
        }
        false
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut builder = f.debug_struct("weft::Error");

        builder.field("kind", &self.inner.kind);

        if let Some(ref url) = self.inner.url {
            builder.field("url", url);
        }

        if let Some(ref source) = self.inner.source {
            builder.field("source", source);
        }

        builder.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.inner.kind {
            Kind::Builder => f.write_str("builder error")?,
            Kind::Connect => f.write_str("error connecting")?,
            Kind::Tls => f.write_str("tls error")?,
            Kind::Read => f.write_str("error reading response")?,
            Kind::Write => f.write_str("error sending request")?,
            Kind::Protocol => f.write_str("protocol error")?,
            Kind::Pool => f.write_str("connection pool error")?,
            Kind::Retry => f.write_str("retries exhausted")?,
            Kind::Redirect => f.write_str("error following redirect")?,
            Kind::Timeout => f.write_str("operation timed out")?,
            Kind::Decode => f.write_str("error decoding response body")?,
            Kind::Upgrade => f.write_str("error upgrading connection")?,
            Kind::Body => f.write_str("request or response body error")?,
            Kind::Status(code) => {
                let prefix = if code.is_client_error() {
                    "HTTP status client error"
                } else {
                    "HTTP status server error"
                };
                write!(f, "{prefix} ({code})")?;
            }
        };

        if let Some(url) = &self.inner.url {
            write!(f, " for url ({url})")?;
        }

        if let Some(e) = &self.inner.source {
            write!(f, ": {e}")?;
        }

        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner.source.as_ref().map(|e| &**e as _)
    }
}

#[derive(Debug)]
pub(crate) enum Kind {
    Builder,
    Connect,
    Tls,
    Read,
    Write,
    Protocol,
    Pool,
    Retry,
    Redirect,
    Timeout,
    Decode,
    Upgrade,
    Body,
    Status(StatusCode),
}

/// Marker for a deadline that elapsed; names which deadline.
#[derive(Debug)]
pub(crate) enum TimedOut {
    Connect,
    Read,
    Total,
}

impl fmt::Display for TimedOut {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            TimedOut::Connect => "connect deadline elapsed",
            TimedOut::Read => "read deadline elapsed",
            TimedOut::Total => "total deadline elapsed",
        })
    }
}

impl StdError for TimedOut {}

#[derive(Debug)]
pub(crate) struct BadScheme;

impl fmt::Display for BadScheme {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("URL scheme is not allowed")
    }
}

impl StdError for BadScheme {}

#[derive(Debug)]
pub(crate) struct TooManyRedirects;

impl fmt::Display for TooManyRedirects {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("too many redirects")
    }
}

impl StdError for TooManyRedirects {}

#[derive(Debug)]
pub(crate) struct PoolFull;

impl fmt::Display for PoolFull {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("connection pool is at capacity")
    }
}

impl StdError for PoolFull {}

#[derive(Debug)]
pub(crate) struct PoolClosed;

impl fmt::Display for PoolClosed {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("connection pool was shut down")
    }
}

impl StdError for PoolClosed {}
