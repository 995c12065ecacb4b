use std::borrow::Cow;

use url::Url;

/// A trait to try to convert some type into a `Url`.
///
/// This trait is "sealed", such that only types within weft can
/// implement it.
pub trait IntoUrl: IntoUrlSealed {}

impl IntoUrl for Url {}
impl IntoUrl for String {}
impl IntoUrl for &Url {}
impl IntoUrl for &str {}
impl IntoUrl for &String {}
impl IntoUrl for Cow<'_, str> {}

pub trait IntoUrlSealed {
    // Besides parsing as a valid `Url`, the `Url` must have a host, in that
    // it makes sense to use in a network request.
    fn into_url(self) -> crate::Result<Url>;

    fn as_str(&self) -> &str;
}

impl IntoUrlSealed for Url {
    fn into_url(self) -> crate::Result<Url> {
        if self.has_host() {
            Ok(self)
        } else {
            Err(crate::error::Error::url_bad_scheme(self))
        }
    }

    fn as_str(&self) -> &str {
        self.as_ref()
    }
}

impl IntoUrlSealed for &Url {
    fn into_url(self) -> crate::Result<Url> {
        self.clone().into_url()
    }

    fn as_str(&self) -> &str {
        self.as_ref()
    }
}

impl IntoUrlSealed for &str {
    fn into_url(self) -> crate::Result<Url> {
        Url::parse(self)
            .map_err(crate::error::Error::builder)?
            .into_url()
    }

    fn as_str(&self) -> &str {
        self
    }
}

impl IntoUrlSealed for &String {
    fn into_url(self) -> crate::Result<Url> {
        (&**self).into_url()
    }

    fn as_str(&self) -> &str {
        self.as_ref()
    }
}

impl IntoUrlSealed for String {
    fn into_url(self) -> crate::Result<Url> {
        (&*self).into_url()
    }

    fn as_str(&self) -> &str {
        self.as_ref()
    }
}

impl IntoUrlSealed for Cow<'_, str> {
    fn into_url(self) -> crate::Result<Url> {
        (&*self).into_url()
    }

    fn as_str(&self) -> &str {
        self
    }
}

/// Strips an explicit default port so equivalent URLs key the same pool.
///
/// `Url` already lowercases the host and percent-encodes components while
/// parsing, which makes the whole normalization idempotent.
pub(crate) fn normalize(url: &mut Url) {
    if let (Some(port), Some(default)) = (url.port(), default_port(url.scheme())) {
        if port == default {
            // Infallible for URLs that have a host.
            let _ = url.set_port(None);
        }
    }
}

/// The conventional port for the schemes this client recognizes.
///
/// `Url::port_or_known_default` only knows the special schemes, so the
/// websocket variants are spelled out here.
pub(crate) fn default_port(scheme: &str) -> Option<u16> {
    match scheme {
        "http" | "ws" | "ws+rfc8441" => Some(80),
        "https" | "wss" | "wss+rfc8441" => Some(443),
        _ => None,
    }
}
