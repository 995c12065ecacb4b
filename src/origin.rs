//! Origin keys.
//!
//! An [`Origin`] is the canonical identity a connection is pooled under:
//! scheme, host, port, the TLS profile it was (or would be) opened with, and
//! the proxy it is routed through. Two requests with equal origins are
//! poolable onto the same connections; everything else about a request is
//! irrelevant to pooling.

use std::fmt;

use url::Url;

use crate::{
    error::Error,
    into_url::default_port,
    proxy::ProxyScheme,
    tls::TlsProfileId,
};

/// The URL schemes this client recognizes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Scheme {
    /// Plaintext HTTP.
    Http,
    /// HTTP over TLS.
    Https,
    /// WebSocket over a plaintext HTTP/1.1 upgrade.
    Ws,
    /// WebSocket over TLS.
    Wss,
    /// WebSocket as an RFC 8441 extended CONNECT stream (plaintext).
    WsExtendedConnect,
    /// WebSocket as an RFC 8441 extended CONNECT stream over TLS.
    WssExtendedConnect,
}

impl Scheme {
    pub(crate) fn parse(s: &str) -> Option<Scheme> {
        match s {
            "http" => Some(Scheme::Http),
            "https" => Some(Scheme::Https),
            "ws" => Some(Scheme::Ws),
            "wss" => Some(Scheme::Wss),
            "ws+rfc8441" => Some(Scheme::WsExtendedConnect),
            "wss+rfc8441" => Some(Scheme::WssExtendedConnect),
            _ => None,
        }
    }

    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
            Scheme::Ws => "ws",
            Scheme::Wss => "wss",
            Scheme::WsExtendedConnect => "ws+rfc8441",
            Scheme::WssExtendedConnect => "wss+rfc8441",
        }
    }

    /// Whether connections for this scheme perform a TLS handshake.
    pub(crate) fn is_tls(&self) -> bool {
        matches!(
            self,
            Scheme::Https | Scheme::Wss | Scheme::WssExtendedConnect
        )
    }

    /// Whether this scheme requests a WebSocket upgrade.
    pub(crate) fn is_websocket(&self) -> bool {
        !matches!(self, Scheme::Http | Scheme::Https)
    }

    /// Whether the upgrade must ride an RFC 8441 extended CONNECT stream.
    pub(crate) fn is_extended_connect(&self) -> bool {
        matches!(
            self,
            Scheme::WsExtendedConnect | Scheme::WssExtendedConnect
        )
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The pooling key: `(scheme, host, port, tls-profile, proxy)`.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Origin {
    scheme: Scheme,
    host: Box<str>,
    port: u16,
    tls_profile: TlsProfileId,
    // Tunneled and forwarded connections must not be shared with direct
    // ones, so the proxy endpoint is part of the key.
    proxy: Option<Box<str>>,
}

impl Origin {
    pub(crate) fn from_url(
        url: &Url,
        tls_profile: TlsProfileId,
        proxy: Option<&ProxyScheme>,
    ) -> Result<Origin, Error> {
        let scheme = Scheme::parse(url.scheme())
            .ok_or_else(|| Error::url_bad_scheme(url.clone()))?;
        let host = url
            .host_str()
            .ok_or_else(|| Error::url_bad_scheme(url.clone()))?;
        let port = url
            .port()
            .or_else(|| default_port(url.scheme()))
            .ok_or_else(|| Error::url_bad_scheme(url.clone()))?;

        Ok(Origin {
            scheme,
            // `Url` lowercases registered names while parsing; IPv6
            // literals come back bracketed, which is fine for a key.
            host: host.into(),
            port,
            tls_profile,
            proxy: proxy.map(|p| p.key()),
        })
    }

    pub(crate) fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub(crate) fn host(&self) -> &str {
        &self.host
    }

    pub(crate) fn port(&self) -> u16 {
        self.port
    }

    pub(crate) fn is_tls(&self) -> bool {
        self.scheme.is_tls()
    }

    pub(crate) fn is_proxied(&self) -> bool {
        self.proxy.is_some()
    }
}

/// The authority (`host[:port]`) of a URL, omitting default ports, for
/// `Host` headers and `:authority` pseudo-headers.
pub(crate) fn authority_of(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port().filter(|p| Some(*p) != default_port(url.scheme())) {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

impl fmt::Debug for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)?;
        if let Some(proxy) = &self.proxy {
            write!(f, " via {proxy}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn origin(s: &str) -> Origin {
        let url: Url = s.parse().unwrap();
        Origin::from_url(&url, TlsProfileId::default(), None).unwrap()
    }

    #[test]
    fn explicit_default_port_keys_identically() {
        assert_eq!(origin("https://example.com/"), origin("https://example.com:443/x?y=z"));
        assert_eq!(origin("ws://example.com/"), origin("ws://example.com:80/chat"));
    }

    #[test]
    fn host_case_is_canonicalized() {
        assert_eq!(origin("http://EXAMPLE.com/"), origin("http://example.com/"));
    }

    #[test]
    fn scheme_and_port_separate_pools() {
        assert_ne!(origin("http://example.com/"), origin("https://example.com/"));
        assert_ne!(origin("https://example.com/"), origin("https://example.com:8443/"));
        assert_ne!(origin("ws://example.com/"), origin("http://example.com/"));
    }

    #[test]
    fn tls_profile_separates_pools() {
        let url: Url = "https://example.com/".parse().unwrap();
        let a = Origin::from_url(&url, TlsProfileId::from_raw(1), None).unwrap();
        let b = Origin::from_url(&url, TlsProfileId::from_raw(2), None).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn rejects_unknown_scheme() {
        let url: Url = "ftp://example.com/".parse().unwrap();
        assert!(Origin::from_url(&url, TlsProfileId::default(), None)
            .unwrap_err()
            .is_builder());
    }

    #[test]
    fn authority_omits_default_port() {
        let url: Url = "https://example.com/".parse().unwrap();
        assert_eq!(authority_of(&url), "example.com");
        let url: Url = "https://example.com:8443/".parse().unwrap();
        assert_eq!(authority_of(&url), "example.com:8443");
        let url: Url = "wss+rfc8441://example.com:443/".parse().unwrap();
        assert_eq!(authority_of(&url), "example.com");
    }
}
