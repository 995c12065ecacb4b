//! Redirect handling.
//!
//! The redirect hop budget lives in the retry policy (it is one of its
//! counter slots); this module owns the mechanics of a single hop: resolving
//! `Location`, rewriting the method per RFC 9110 §15.4, deciding whether the
//! body must be replayed, and scrubbing sensitive headers when the hop
//! crosses an origin boundary.

use http::{
    header::{HeaderMap, HeaderName, AUTHORIZATION, COOKIE, LOCATION, PROXY_AUTHORIZATION},
    Method, StatusCode,
};
use url::Url;

use crate::error::Error;

/// Whether `status` is a redirect this client follows when a `Location`
/// header is present.
pub(crate) fn is_redirect(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::MOVED_PERMANENTLY
            | StatusCode::FOUND
            | StatusCode::SEE_OTHER
            | StatusCode::TEMPORARY_REDIRECT
            | StatusCode::PERMANENT_REDIRECT
    )
}

/// The rewritten request for one redirect hop.
#[derive(Debug)]
pub(crate) struct FollowUp {
    pub(crate) url: Url,
    pub(crate) method: Method,
    /// False means the body (and its `Content-*` headers) are dropped.
    pub(crate) keep_body: bool,
}

/// Computes the follow-up request for a 3xx response, or `None` when the
/// response carries no usable `Location`.
pub(crate) fn follow_up(
    status: StatusCode,
    headers: &HeaderMap,
    current: &Url,
    method: &Method,
) -> Result<Option<FollowUp>, Error> {
    let Some(location) = headers.get(LOCATION) else {
        return Ok(None);
    };
    let location = location
        .to_str()
        .map_err(|e| Error::redirect(e, current.clone()))?;

    // Location may be relative; resolve against the current URL.
    let url = current
        .join(location)
        .map_err(|e| Error::redirect(e, current.clone()))?;

    let (method, keep_body) = match status {
        // 303 always switches to GET (HEAD stays HEAD).
        StatusCode::SEE_OTHER if *method != Method::HEAD => (Method::GET, false),
        // Historic client behavior for 301/302: non-safe methods become GET
        // and the body is dropped.
        StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND
            if *method != Method::GET && *method != Method::HEAD =>
        {
            (Method::GET, false)
        }
        // 307/308 (and safe methods elsewhere) preserve method and body.
        _ => (method.clone(), true),
    };

    Ok(Some(FollowUp {
        url,
        method,
        keep_body,
    }))
}

/// Strips credentials when a hop leaves the previous origin.
///
/// `extra` is the caller-configured `remove_headers_on_redirect` set, which
/// is scrubbed in addition to the built-ins.
pub(crate) fn remove_sensitive_headers(
    headers: &mut HeaderMap,
    next: &Url,
    previous: &Url,
    extra: &[HeaderName],
) {
    let cross_origin = next.host_str() != previous.host_str()
        || next.port_or_known_default() != previous.port_or_known_default()
        || next.scheme() != previous.scheme();
    if cross_origin {
        headers.remove(AUTHORIZATION);
        headers.remove(COOKIE);
        headers.remove("cookie2");
        headers.remove(PROXY_AUTHORIZATION);
        for name in extra {
            headers.remove(name);
        }
    }
}

/// Drops the entity headers that described a body that is no longer sent.
pub(crate) fn remove_content_headers(headers: &mut HeaderMap) {
    let content: Vec<HeaderName> = headers
        .keys()
        .filter(|name| name.as_str().starts_with("content-"))
        .cloned()
        .collect();
    for name in content {
        headers.remove(name);
    }
    headers.remove(http::header::TRANSFER_ENCODING);
}
