//! Requests.

use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine};
use http::{header, HeaderMap, HeaderName, HeaderValue, Method};
use serde::Serialize;
use url::Url;

use crate::{body::Body, client::Client, error::Error, response::Response, retry};

/// A request which can be executed with `Client::execute()`.
pub struct Request {
    method: Method,
    url: Url,
    headers: HeaderMap,
    body: Option<Body>,
    timeout: Option<Duration>,
    read_timeout: Option<Duration>,
    idempotency: Option<bool>,
    retry: Option<retry::Policy>,
    protocols: Vec<String>,
}

impl Request {
    /// Constructs a new request.
    #[inline]
    pub fn new(method: Method, url: Url) -> Self {
        Request {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
            timeout: None,
            read_timeout: None,
            idempotency: None,
            retry: None,
            protocols: Vec::new(),
        }
    }

    /// Get the method.
    #[inline]
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Get a mutable reference to the method.
    #[inline]
    pub fn method_mut(&mut self) -> &mut Method {
        &mut self.method
    }

    /// Get the url.
    #[inline]
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Get a mutable reference to the url.
    #[inline]
    pub fn url_mut(&mut self) -> &mut Url {
        &mut self.url
    }

    /// Get the headers.
    #[inline]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Get a mutable reference to the headers.
    #[inline]
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Get the body.
    #[inline]
    pub fn body(&self) -> Option<&Body> {
        self.body.as_ref()
    }

    /// Get a mutable reference to the body.
    #[inline]
    pub fn body_mut(&mut self) -> &mut Option<Body> {
        &mut self.body
    }

    /// Get the total timeout.
    #[inline]
    pub fn timeout(&self) -> Option<&Duration> {
        self.timeout.as_ref()
    }

    /// Whether this request is safe to replay after a partial send:
    /// the caller's override, or derived from the method.
    pub fn is_idempotent(&self) -> bool {
        self.idempotency
            .unwrap_or_else(|| retry::is_idempotent_method(&self.method))
    }

    pub(crate) fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout
    }

    pub(crate) fn retry_policy(&self) -> Option<&retry::Policy> {
        self.retry.as_ref()
    }

    pub(crate) fn protocols(&self) -> &[String] {
        &self.protocols
    }

    pub(crate) fn take_body(&mut self) -> Option<Body> {
        self.body.take()
    }

    /// Attempts to clone the request, failing on streaming bodies.
    pub fn try_clone(&self) -> Option<Request> {
        let body = match &self.body {
            Some(body) => Some(body.try_clone()?),
            None => None,
        };
        Some(Request {
            method: self.method.clone(),
            url: self.url.clone(),
            headers: self.headers.clone(),
            body,
            timeout: self.timeout,
            read_timeout: self.read_timeout,
            idempotency: self.idempotency,
            retry: self.retry.clone(),
            protocols: self.protocols.clone(),
        })
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("url", &self.url.as_str())
            .field("headers", &self.headers)
            .finish()
    }
}

/// A builder to construct the properties of a `Request`.
#[must_use = "RequestBuilder does nothing until you 'send' it"]
pub struct RequestBuilder {
    client: Client,
    request: Result<Request, Error>,
}

impl RequestBuilder {
    pub(crate) fn new(client: Client, request: Result<Request, Error>) -> RequestBuilder {
        RequestBuilder { client, request }
    }

    /// Add a header to this request.
    pub fn header<K, V>(mut self, key: K, value: V) -> RequestBuilder
    where
        HeaderName: TryFrom<K>,
        <HeaderName as TryFrom<K>>::Error: Into<http::Error>,
        HeaderValue: TryFrom<V>,
        <HeaderValue as TryFrom<V>>::Error: Into<http::Error>,
    {
        let mut error = None;
        if let Ok(ref mut req) = self.request {
            match <HeaderName as TryFrom<K>>::try_from(key) {
                Ok(key) => match <HeaderValue as TryFrom<V>>::try_from(value) {
                    Ok(value) => {
                        req.headers_mut().append(key, value);
                    }
                    Err(e) => error = Some(Error::builder(e.into())),
                },
                Err(e) => error = Some(Error::builder(e.into())),
            };
        }
        if let Some(err) = error {
            self.request = Err(err);
        }
        self
    }

    /// Add a set of headers to the existing ones on this request.
    pub fn headers(mut self, headers: HeaderMap) -> RequestBuilder {
        if let Ok(ref mut req) = self.request {
            for (key, value) in headers {
                if let Some(key) = key {
                    req.headers_mut().append(key, value);
                }
            }
        }
        self
    }

    /// Enable HTTP basic authentication.
    pub fn basic_auth<U>(self, username: U, password: Option<&str>) -> RequestBuilder
    where
        U: std::fmt::Display,
    {
        let encoded = STANDARD.encode(format!(
            "{username}:{password}",
            password = password.unwrap_or("")
        ));
        let mut header = HeaderValue::try_from(format!("Basic {encoded}"))
            .expect("base64 is always a valid header value");
        header.set_sensitive(true);
        self.header(header::AUTHORIZATION, header)
    }

    /// Enable HTTP bearer authentication.
    pub fn bearer_auth<T>(self, token: T) -> RequestBuilder
    where
        T: std::fmt::Display,
    {
        self.header(header::AUTHORIZATION, format!("Bearer {token}"))
    }

    /// Set the request body.
    pub fn body<T: Into<Body>>(mut self, body: T) -> RequestBuilder {
        if let Ok(ref mut req) = self.request {
            *req.body_mut() = Some(body.into());
        }
        self
    }

    /// Modify the query string of the URL, serializing `query` as
    /// urlencoded pairs and appending them.
    pub fn query<T: Serialize + ?Sized>(mut self, query: &T) -> RequestBuilder {
        let mut error = None;
        if let Ok(ref mut req) = self.request {
            let url = req.url_mut();
            let mut pairs = url.query_pairs_mut();
            let serializer = serde_urlencoded::Serializer::new(&mut pairs);
            if let Err(err) = query.serialize(serializer) {
                error = Some(Error::builder(err));
            }
        }
        if let Ok(ref mut req) = self.request {
            if let Some("") = req.url().query() {
                req.url_mut().set_query(None);
            }
        }
        if let Some(err) = error {
            self.request = Err(err);
        }
        self
    }

    /// Send a form body, urlencoded.
    pub fn form<T: Serialize + ?Sized>(mut self, form: &T) -> RequestBuilder {
        let mut error = None;
        if let Ok(ref mut req) = self.request {
            match serde_urlencoded::to_string(form) {
                Ok(body) => {
                    req.headers_mut().entry(header::CONTENT_TYPE).or_insert(
                        HeaderValue::from_static("application/x-www-form-urlencoded"),
                    );
                    *req.body_mut() = Some(body.into());
                }
                Err(err) => error = Some(Error::builder(err)),
            }
        }
        if let Some(err) = error {
            self.request = Err(err);
        }
        self
    }

    /// Send a JSON body.
    pub fn json<T: Serialize + ?Sized>(mut self, json: &T) -> RequestBuilder {
        let mut error = None;
        if let Ok(ref mut req) = self.request {
            match serde_json::to_vec(json) {
                Ok(body) => {
                    req.headers_mut()
                        .entry(header::CONTENT_TYPE)
                        .or_insert(HeaderValue::from_static("application/json"));
                    *req.body_mut() = Some(body.into());
                }
                Err(err) => error = Some(Error::builder(err)),
            }
        }
        if let Some(err) = error {
            self.request = Err(err);
        }
        self
    }

    /// Enables a total timeout for this request, from dispatch until the
    /// response head. It overrides the client-level timeout.
    pub fn timeout(mut self, timeout: Duration) -> RequestBuilder {
        if let Ok(ref mut req) = self.request {
            req.timeout = Some(timeout);
        }
        self
    }

    /// Per-read timeout while receiving the response.
    pub fn read_timeout(mut self, timeout: Duration) -> RequestBuilder {
        if let Ok(ref mut req) = self.request {
            req.read_timeout = Some(timeout);
        }
        self
    }

    /// Overrides the method-derived idempotency, allowing (or forbidding)
    /// replays of this request after a partial send.
    pub fn idempotent(mut self, idempotent: bool) -> RequestBuilder {
        if let Ok(ref mut req) = self.request {
            req.idempotency = Some(idempotent);
        }
        self
    }

    /// Overrides the client's retry policy for this request.
    pub fn retries(mut self, policy: retry::Policy) -> RequestBuilder {
        if let Ok(ref mut req) = self.request {
            req.retry = Some(policy);
        }
        self
    }

    /// Sets the WebSocket subprotocols to request (only meaningful for
    /// `ws`-family URLs).
    pub fn protocols<I, S>(mut self, protocols: I) -> RequestBuilder
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if let Ok(ref mut req) = self.request {
            req.protocols = protocols.into_iter().map(Into::into).collect();
        }
        self
    }

    /// Build a `Request`.
    pub fn build(self) -> Result<Request, Error> {
        self.request
    }

    /// Constructs the `Request` and sends it to the target URL, returning a
    /// future `Response`.
    ///
    /// # Example
    ///
    /// ```no_run
    /// # async fn run() -> Result<(), weft::Error> {
    /// let response = weft::Client::new()
    ///     .get("https://hyper.rs")
    ///     .send()
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn send(self) -> Result<Response, Error> {
        match self.request {
            Ok(req) => self.client.execute(req).await,
            Err(err) => Err(err),
        }
    }

    /// Attempt to clone the `RequestBuilder`, failing on streaming bodies.
    pub fn try_clone(&self) -> Option<RequestBuilder> {
        self.request
            .as_ref()
            .ok()
            .and_then(|req| req.try_clone())
            .map(|req| RequestBuilder {
                client: self.client.clone(),
                request: Ok(req),
            })
    }
}

impl std::fmt::Debug for RequestBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut builder = f.debug_struct("RequestBuilder");
        match &self.request {
            Ok(req) => builder
                .field("method", req.method())
                .field("url", &req.url().as_str())
                .finish(),
            Err(err) => builder.field("error", err).finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Client;

    fn builder(url: &str) -> RequestBuilder {
        Client::new().get(url)
    }

    #[test]
    fn query_appends_pairs() {
        let req = builder("http://example.local/search?q=1")
            .query(&[("page", "2"), ("per", "10")])
            .build()
            .unwrap();
        assert_eq!(req.url().query(), Some("q=1&page=2&per=10"));
    }

    #[test]
    fn form_sets_content_type_and_body() {
        let req = builder("http://example.local/")
            .form(&[("a", "1"), ("b", "2 3")])
            .build()
            .unwrap();
        assert_eq!(
            req.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/x-www-form-urlencoded"
        );
        assert_eq!(req.body().unwrap().as_bytes().unwrap(), b"a=1&b=2+3");
    }

    #[test]
    fn form_round_trips() {
        use std::collections::BTreeMap;
        let mut fields = BTreeMap::new();
        fields.insert("name".to_string(), "weft client".to_string());
        fields.insert("tag".to_string(), "a&b=c".to_string());

        let req = builder("http://example.local/")
            .form(&fields)
            .build()
            .unwrap();
        let encoded = req.body().unwrap().as_bytes().unwrap();
        let decoded: BTreeMap<String, String> =
            serde_urlencoded::from_bytes(encoded).unwrap();
        assert_eq!(decoded, fields);
    }

    #[test]
    fn json_sets_content_type() {
        let req = builder("http://example.local/")
            .json(&serde_json::json!({"k": "v"}))
            .build()
            .unwrap();
        assert_eq!(
            req.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
        assert_eq!(req.body().unwrap().as_bytes().unwrap(), br#"{"k":"v"}"#);
    }

    #[test]
    fn basic_auth_is_sensitive() {
        let req = builder("http://example.local/")
            .basic_auth("user", Some("pass"))
            .build()
            .unwrap();
        let auth = req.headers().get(header::AUTHORIZATION).unwrap();
        assert_eq!(auth.to_str().unwrap(), "Basic dXNlcjpwYXNz");
        assert!(auth.is_sensitive());
    }

    #[test]
    fn idempotency_defaults_follow_method() {
        let get = builder("http://example.local/").build().unwrap();
        assert!(get.is_idempotent());

        let post = Client::new()
            .post("http://example.local/")
            .build()
            .unwrap();
        assert!(!post.is_idempotent());

        let hinted = Client::new()
            .post("http://example.local/")
            .idempotent(true)
            .build()
            .unwrap();
        assert!(hinted.is_idempotent());
    }

    #[test]
    fn try_clone_fails_on_streaming_body() {
        let chunks: Vec<Result<_, std::io::Error>> = vec![Ok("x")];
        let req = builder("http://example.local/")
            .body(Body::wrap_stream(futures_util::stream::iter(chunks)))
            .build()
            .unwrap();
        assert!(req.try_clone().is_none());
    }

    #[test]
    fn header_casing_preserved_on_values() {
        let req = builder("http://example.local/")
            .header("x-custom", "MiXeD")
            .header("X-CUSTOM", "second")
            .build()
            .unwrap();
        let values: Vec<_> = req.headers().get_all("x-custom").iter().collect();
        assert_eq!(values, ["MiXeD", "second"]);
    }
}
