//! Retry policies.
//!
//! A [`Policy`] carries granular retry counters for each failure class:
//! connection establishment, reads, retry-worthy status codes, and redirect
//! hops, all bounded by a `total` budget. Counters only ever decrement; when
//! one reaches zero the next failure of that class surfaces to the caller as
//! a retries-exhausted error wrapping the underlying cause.
//!
//! **Requests are not retried after their bytes hit the wire unless they are
//! idempotent.** Idempotency is derived from the method (GET, HEAD, OPTIONS,
//! PUT, DELETE and TRACE qualify) and can be overridden per request with
//! [`RequestBuilder::idempotent`](crate::RequestBuilder::idempotent) when
//! the server is known to handle replays safely.

use std::{collections::HashSet, time::Duration, time::SystemTime};

use http::{HeaderMap, Method, StatusCode};

/// A retry policy.
///
/// The default allows 3 attempts overall, 10 redirect hops, no status-code
/// retries, and no backoff; see the builder methods for tuning.
#[derive(Clone, Debug)]
pub struct Policy {
    total: Option<u32>,
    connect: Option<u32>,
    read: Option<u32>,
    status: Option<u32>,
    redirect: Option<u32>,
    status_forcelist: HashSet<u16>,
    allowed_methods: AllowedMethods,
    backoff_factor: f64,
    backoff_max: Duration,
    respect_retry_after: bool,
    raise_on_status: bool,
    raise_on_redirect: bool,
    // How many attempts this policy has already absorbed; drives the
    // backoff exponent.
    attempt: u32,
}

/// Which methods may be retried after a response status hit the forcelist.
#[derive(Clone, Debug)]
pub enum AllowedMethods {
    /// The idempotent set: GET, HEAD, OPTIONS, PUT, DELETE, TRACE.
    Idempotent,
    /// Any method, including POST and PATCH.
    Any,
    /// An explicit set.
    Set(HashSet<Method>),
}

/// The failure class being charged against the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Charge {
    /// Failed before any request byte was written (DNS, TCP, TLS).
    Connect,
    /// Transport died before the request was sent; always safe to retry.
    PreSend,
    /// Transport died after the request was sent.
    Read,
    /// A response status in the forcelist.
    Status,
    /// A 3xx hop.
    Redirect,
}

/// Outcome of charging a failure against the policy.
pub(crate) enum Decision {
    /// Retry after waiting `delay`, continuing with the decremented policy.
    Retry { next: Policy, delay: Duration },
    /// This failure class is not retryable for this request; surface the
    /// underlying error as-is.
    Surface,
    /// A counter hit zero; surface a retries-exhausted error wrapping the
    /// underlying cause.
    Exhausted,
}

impl Policy {
    /// A policy allowing `total` attempts beyond the first.
    pub fn new(total: u32) -> Policy {
        Policy {
            total: Some(total),
            ..Policy::default()
        }
    }

    /// Never retry and fail on the first redirect.
    pub fn none() -> Policy {
        Policy {
            total: Some(0),
            redirect: Some(0),
            ..Policy::default()
        }
    }

    /// Cap on connection-establishment retries.
    pub fn connect(mut self, max: u32) -> Policy {
        self.connect = Some(max);
        self
    }

    /// Cap on read retries (transport lost after the request was sent).
    pub fn read(mut self, max: u32) -> Policy {
        self.read = Some(max);
        self
    }

    /// Cap on status-forcelist retries.
    pub fn status(mut self, max: u32) -> Policy {
        self.status = Some(max);
        self
    }

    /// Cap on redirect hops followed within one logical request.
    pub fn redirect(mut self, max: u32) -> Policy {
        self.redirect = Some(max);
        self
    }

    /// Status codes that are retried as if they were transport failures,
    /// subject to [`allowed_methods`](Policy::allowed_methods).
    pub fn status_forcelist<I: IntoIterator<Item = u16>>(mut self, codes: I) -> Policy {
        self.status_forcelist = codes.into_iter().collect();
        self
    }

    /// Which methods may be retried on a forcelist status.
    pub fn allowed_methods(mut self, methods: AllowedMethods) -> Policy {
        self.allowed_methods = methods;
        self
    }

    /// Exponential backoff factor; `0.0` disables backoff.
    pub fn backoff_factor(mut self, factor: f64) -> Policy {
        self.backoff_factor = factor;
        self
    }

    /// Upper bound on a single backoff sleep.
    pub fn backoff_max(mut self, max: Duration) -> Policy {
        self.backoff_max = max;
        self
    }

    /// Whether a server `Retry-After` lengthens the backoff sleep.
    pub fn respect_retry_after(mut self, respect: bool) -> Policy {
        self.respect_retry_after = respect;
        self
    }

    /// When false, an exhausted status counter returns the last response
    /// instead of a retries-exhausted error.
    pub fn raise_on_status(mut self, raise: bool) -> Policy {
        self.raise_on_status = raise;
        self
    }

    /// When false, exceeding the redirect cap returns the last 3xx response
    /// instead of an error.
    pub fn raise_on_redirect(mut self, raise: bool) -> Policy {
        self.raise_on_redirect = raise;
        self
    }

    pub(crate) fn raises_on_status(&self) -> bool {
        self.raise_on_status
    }

    pub(crate) fn raises_on_redirect(&self) -> bool {
        self.raise_on_redirect
    }

    pub(crate) fn retries_status(&self, status: StatusCode) -> bool {
        self.status_forcelist.contains(&status.as_u16())
    }

    pub(crate) fn method_allowed(&self, method: &Method) -> bool {
        match &self.allowed_methods {
            AllowedMethods::Idempotent => is_idempotent_method(method),
            AllowedMethods::Any => true,
            AllowedMethods::Set(set) => set.contains(method),
        }
    }

    /// Applies one row of the retry decision table.
    ///
    /// `idempotent` is the request's effective idempotency (method-derived
    /// or caller override); `headers` are the response headers when the
    /// charge came from a status code, for `Retry-After`.
    pub(crate) fn charge(
        &self,
        charge: Charge,
        idempotent: bool,
        method: &Method,
        headers: Option<&HeaderMap>,
    ) -> Decision {
        match charge {
            Charge::Connect | Charge::PreSend | Charge::Redirect => {}
            // A request that already went out is only replayed when that
            // is known to be safe (RFC 9110 §9.2.2).
            Charge::Read => {
                if !idempotent {
                    return Decision::Surface;
                }
            }
            Charge::Status => {
                if !idempotent && !self.method_allowed(method) {
                    return Decision::Surface;
                }
            }
        }

        let mut next = self.clone();
        next.attempt += 1;

        let specific_ok = match charge {
            Charge::Connect => decrement(&mut next.connect),
            Charge::Read => decrement(&mut next.read),
            Charge::Status => decrement(&mut next.status),
            Charge::Redirect => decrement(&mut next.redirect),
            // Pre-send failures have no dedicated counter; only `total`
            // bounds them.
            Charge::PreSend => true,
        };
        if !specific_ok {
            return Decision::Exhausted;
        }
        // Redirects consume only their own slot.
        if charge != Charge::Redirect && !decrement(&mut next.total) {
            return Decision::Exhausted;
        }

        let mut delay = next.backoff();
        if self.respect_retry_after {
            if let Some(retry_after) = headers.and_then(retry_after) {
                delay = delay.max(retry_after);
            }
        }

        Decision::Retry { next, delay }
    }

    /// `min(backoff_max, backoff_factor * 2^(attempt - 1))`, zero before the
    /// second attempt.
    fn backoff(&self) -> Duration {
        if self.backoff_factor <= 0.0 || self.attempt <= 1 {
            return Duration::ZERO;
        }
        let exp = (self.attempt - 1).min(32);
        let secs = self.backoff_factor * (1u64 << exp) as f64;
        Duration::from_secs_f64(secs).min(self.backoff_max)
    }
}

impl Default for Policy {
    fn default() -> Policy {
        Policy {
            total: Some(3),
            connect: None,
            read: None,
            status: None,
            redirect: Some(10),
            status_forcelist: HashSet::new(),
            allowed_methods: AllowedMethods::Idempotent,
            backoff_factor: 0.0,
            backoff_max: Duration::from_secs(120),
            respect_retry_after: true,
            raise_on_status: true,
            raise_on_redirect: true,
            attempt: 0,
        }
    }
}

/// `None` counters defer to `total`; `Some(0)` means the budget is spent.
fn decrement(counter: &mut Option<u32>) -> bool {
    match counter {
        None => true,
        Some(0) => false,
        Some(n) => {
            *n -= 1;
            true
        }
    }
}

pub(crate) fn is_idempotent_method(method: &Method) -> bool {
    matches!(
        *method,
        Method::GET | Method::HEAD | Method::OPTIONS | Method::PUT | Method::DELETE | Method::TRACE
    )
}

/// Parses `Retry-After`, accepting delay-seconds or an HTTP-date.
pub(crate) fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(http::header::RETRY_AFTER)?.to_str().ok()?;

    if let Ok(secs) = value.trim().parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    let date = parse_http_date(value)?;
    date.duration_since(SystemTime::now()).ok()
}

/// Minimal IMF-fixdate parser ("Sun, 06 Nov 1994 08:49:37 GMT").
fn parse_http_date(s: &str) -> Option<SystemTime> {
    let s = s.trim();
    // Strip "Day, " — the weekday is redundant.
    let rest = s.split_once(", ").map(|(_, r)| r).unwrap_or(s);
    let mut parts = rest.split_ascii_whitespace();

    let day: u64 = parts.next()?.parse().ok()?;
    let month = match parts.next()? {
        "Jan" => 1,
        "Feb" => 2,
        "Mar" => 3,
        "Apr" => 4,
        "May" => 5,
        "Jun" => 6,
        "Jul" => 7,
        "Aug" => 8,
        "Sep" => 9,
        "Oct" => 10,
        "Nov" => 11,
        "Dec" => 12,
        _ => return None,
    };
    let year: i64 = parts.next()?.parse().ok()?;
    let mut hms = parts.next()?.split(':');
    let hour: u64 = hms.next()?.parse().ok()?;
    let min: u64 = hms.next()?.parse().ok()?;
    let sec: u64 = hms.next()?.parse().ok()?;
    if parts.next() != Some("GMT") {
        return None;
    }

    let days = days_from_civil(year, month, day as i64)?;
    let secs = days.checked_mul(86_400)? as u64 + hour * 3600 + min * 60 + sec;
    Some(SystemTime::UNIX_EPOCH + Duration::from_secs(secs))
}

/// Days since 1970-01-01 (Howard Hinnant's civil-days algorithm), for dates
/// at or after the epoch.
fn days_from_civil(y: i64, m: i64, d: i64) -> Option<i64> {
    let y = if m <= 2 { y - 1 } else { y };
    let era = y.div_euclid(400);
    let yoe = y - era * 400;
    let doy = (153 * (if m > 2 { m - 3 } else { m + 9 }) + 2) / 5 + d - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    let days = era * 146_097 + doe - 719_468;
    (days >= 0).then_some(days)
}
