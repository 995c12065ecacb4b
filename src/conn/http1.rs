//! HTTP/1.1 connection state machine.
//!
//! One transport, strictly one request/response exchange at a time. The
//! response head is surfaced as soon as the status line and headers parse;
//! body bytes are pulled on demand with the framing tracked here
//! (`Content-Length`, chunked, or read-to-EOF). Trailers of a chunked body
//! are captured after the terminal chunk.

use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use http::{
    header::{self, HeaderMap, HeaderName, HeaderValue},
    Method, StatusCode, Version,
};
use futures_util::StreamExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::{
    body::Body,
    conn::BoxedIo,
    error::Error,
};

const MAX_HEADERS: usize = 100;
const INIT_BUF_CAPACITY: usize = 8 * 1024;
// An 8 MiB head is far past anything legitimate.
const MAX_HEAD_SIZE: usize = 8 * 1024 * 1024;

/// The request line and headers, ready to encode.
pub(crate) struct RequestHead {
    pub(crate) method: Method,
    /// origin-form (`/path?query`) or absolute-form for plain proxies.
    pub(crate) target: String,
    pub(crate) headers: HeaderMap,
}

/// Parsed status line and headers of a response.
pub(crate) struct ResponseHead {
    pub(crate) status: StatusCode,
    pub(crate) version: Version,
    pub(crate) headers: HeaderMap,
}

/// How the remainder of the response body is delimited.
#[derive(Debug)]
pub(crate) enum Framing {
    /// No body bytes follow (1xx/204/304, or a HEAD response).
    Empty,
    ContentLength(u64),
    Chunked(ChunkState),
    /// Delimited by connection close; such a connection is never reused.
    Eof,
}

#[derive(Debug)]
pub(crate) enum ChunkState {
    Size,
    Data { remaining: u64 },
    DataEnd,
    Trailers,
    Done(HeaderMap),
}

impl Framing {
    pub(crate) fn is_complete(&self) -> bool {
        matches!(
            self,
            Framing::Empty | Framing::ContentLength(0) | Framing::Chunked(ChunkState::Done(_))
        )
    }

    pub(crate) fn trailers(&mut self) -> Option<HeaderMap> {
        match self {
            Framing::Chunked(ChunkState::Done(trailers)) if !trailers.is_empty() => {
                Some(std::mem::take(trailers))
            }
            _ => None,
        }
    }
}

pub(crate) struct Http1Transport {
    io: BoxedIo,
    buf: BytesMut,
    reusable: bool,
}

impl Http1Transport {
    pub(crate) fn new(io: BoxedIo) -> Http1Transport {
        Http1Transport {
            io,
            buf: BytesMut::with_capacity(INIT_BUF_CAPACITY),
            reusable: true,
        }
    }

    /// Whether the exchange left the connection in a keep-alive state.
    pub(crate) fn is_reusable(&self) -> bool {
        self.reusable
    }

    /// Surrenders the transport for a protocol switch. The returned buffer
    /// holds bytes that arrived after the response head (e.g. the first
    /// WebSocket frames) and must be replayed before reading the socket.
    pub(crate) fn into_io(self) -> (BoxedIo, BytesMut) {
        (self.io, self.buf)
    }

    /// Writes a request and reads the response head.
    ///
    /// `Expect: 100-continue` is honored when the header is present: the
    /// body is withheld until the interim response, up to `expect_timeout`,
    /// after which it is sent anyway.
    pub(crate) async fn send_request(
        &mut self,
        head: &RequestHead,
        body: Option<Body>,
        expect_timeout: Duration,
    ) -> Result<(ResponseHead, Framing), Error> {
        let is_head = head.method == Method::HEAD;
        let wants_continue = head
            .headers
            .get(header::EXPECT)
            .is_some_and(|v| v.as_bytes().eq_ignore_ascii_case(b"100-continue"));
        let chunked = head
            .headers
            .get(header::TRANSFER_ENCODING)
            .is_some_and(|v| v.as_bytes().eq_ignore_ascii_case(b"chunked"));
        if head
            .headers
            .get(header::CONNECTION)
            .is_some_and(|v| v.as_bytes().eq_ignore_ascii_case(b"close"))
        {
            self.reusable = false;
        }

        self.write_head(head).await?;

        let response = if wants_continue && body.is_some() {
            match tokio::time::timeout(expect_timeout, self.read_head()).await {
                // No interim response in time: send the body anyway.
                Err(_elapsed) => {
                    self.write_body(body, chunked).await?;
                    self.read_head().await?
                }
                Ok(head) => {
                    let head = head?;
                    if head.status == StatusCode::CONTINUE {
                        self.write_body(body, chunked).await?;
                        self.read_head().await?
                    } else {
                        // Final status without the body having been sent:
                        // the advertised framing was never completed, so
                        // the connection cannot be reused.
                        self.reusable = false;
                        head
                    }
                }
            }
        } else {
            self.write_body(body, chunked).await?;
            self.read_head().await?
        };

        if response.status == StatusCode::CONTINUE {
            // Unsolicited interim; the real head follows.
            let response = self.read_head().await?;
            let framing = self.framing_for(&response, is_head);
            return Ok((response, framing));
        }

        let framing = self.framing_for(&response, is_head);
        Ok((response, framing))
    }

    async fn write_head(&mut self, head: &RequestHead) -> Result<(), Error> {
        let mut out = BytesMut::with_capacity(256);
        out.put_slice(head.method.as_str().as_bytes());
        out.put_u8(b' ');
        out.put_slice(head.target.as_bytes());
        out.put_slice(b" HTTP/1.1\r\n");
        for (name, value) in &head.headers {
            out.put_slice(name.as_str().as_bytes());
            out.put_slice(b": ");
            out.put_slice(value.as_bytes());
            out.put_slice(b"\r\n");
        }
        out.put_slice(b"\r\n");

        self.io.write_all(&out).await.map_err(Error::write)?;
        self.io.flush().await.map_err(Error::write)
    }

    async fn write_body(&mut self, body: Option<Body>, chunked: bool) -> Result<(), Error> {
        let Some(body) = body else { return Ok(()) };

        let mut data = body.into_data_stream();
        while let Some(chunk) = data.next().await {
            let chunk = chunk.map_err(Error::write)?;
            if chunk.is_empty() {
                continue;
            }
            if chunked {
                let size = format!("{:x}\r\n", chunk.len());
                self.io
                    .write_all(size.as_bytes())
                    .await
                    .map_err(Error::write)?;
                self.io.write_all(&chunk).await.map_err(Error::write)?;
                self.io.write_all(b"\r\n").await.map_err(Error::write)?;
            } else {
                self.io.write_all(&chunk).await.map_err(Error::write)?;
            }
        }
        if chunked {
            self.io
                .write_all(b"0\r\n\r\n")
                .await
                .map_err(Error::write)?;
        }
        self.io.flush().await.map_err(Error::write)
    }

    async fn read_head(&mut self) -> Result<ResponseHead, Error> {
        loop {
            if let Some(head) = self.parse_head()? {
                // Interim responses other than 100 (handled by the continue
                // dance) and 101 (a successful switch) are skipped.
                if head.status.is_informational()
                    && head.status != StatusCode::CONTINUE
                    && head.status != StatusCode::SWITCHING_PROTOCOLS
                {
                    continue;
                }
                return Ok(head);
            }
            if self.buf.len() > MAX_HEAD_SIZE {
                self.reusable = false;
                return Err(Error::protocol(OversizedHead));
            }
            if self.fill_buf().await? == 0 {
                self.reusable = false;
                return Err(Error::read(std::io::Error::from(
                    std::io::ErrorKind::UnexpectedEof,
                )));
            }
        }
    }

    fn parse_head(&mut self) -> Result<Option<ResponseHead>, Error> {
        let mut parsed = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut response = httparse::Response::new(&mut parsed);

        let len = match response.parse(&self.buf) {
            Ok(httparse::Status::Complete(len)) => len,
            Ok(httparse::Status::Partial) => return Ok(None),
            Err(e) => {
                self.reusable = false;
                return Err(Error::protocol(e));
            }
        };

        let status = StatusCode::from_u16(response.code.expect("complete response has code"))
            .map_err(Error::protocol)?;
        let version = match response.version.expect("complete response has version") {
            0 => {
                // HTTP/1.0 peers do not keep the connection alive unless
                // they opt in, which this client does not negotiate.
                self.reusable = false;
                Version::HTTP_10
            }
            _ => Version::HTTP_11,
        };

        let mut headers = HeaderMap::with_capacity(response.headers.len());
        for h in response.headers.iter() {
            let name = HeaderName::from_bytes(h.name.as_bytes()).map_err(Error::protocol)?;
            let value = HeaderValue::from_bytes(h.value).map_err(Error::protocol)?;
            headers.append(name, value);
        }

        if headers
            .get(header::CONNECTION)
            .is_some_and(|v| v.as_bytes().eq_ignore_ascii_case(b"close"))
        {
            self.reusable = false;
        }

        self.buf.advance(len);
        Ok(Some(ResponseHead {
            status,
            version,
            headers,
        }))
    }

    fn framing_for(&mut self, head: &ResponseHead, is_head: bool) -> Framing {
        if is_head
            || head.status.is_informational()
            || head.status == StatusCode::NO_CONTENT
            || head.status == StatusCode::NOT_MODIFIED
        {
            return Framing::Empty;
        }

        let chunked = head
            .headers
            .get_all(header::TRANSFER_ENCODING)
            .iter()
            .any(|v| {
                v.to_str()
                    .map(|s| s.split(',').any(|p| p.trim().eq_ignore_ascii_case("chunked")))
                    .unwrap_or(false)
            });
        if chunked {
            return Framing::Chunked(ChunkState::Size);
        }

        if let Some(len) = head
            .headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok())
        {
            return Framing::ContentLength(len);
        }

        self.reusable = false;
        Framing::Eof
    }

    /// Pulls the next body chunk; `None` once the framing says the body is
    /// complete.
    pub(crate) async fn read_body_data(
        &mut self,
        framing: &mut Framing,
    ) -> Result<Option<Bytes>, Error> {
        loop {
            match framing {
                Framing::Empty => return Ok(None),
                Framing::ContentLength(0) => return Ok(None),
                Framing::ContentLength(remaining) => {
                    if !self.buf.is_empty() {
                        let take = (*remaining).min(self.buf.len() as u64) as usize;
                        *remaining -= take as u64;
                        return Ok(Some(self.buf.split_to(take).freeze()));
                    }
                    if self.fill_buf().await? == 0 {
                        self.reusable = false;
                        return Err(Error::read(std::io::Error::from(
                            std::io::ErrorKind::UnexpectedEof,
                        )));
                    }
                }
                Framing::Eof => {
                    if !self.buf.is_empty() {
                        let all = self.buf.split().freeze();
                        return Ok(Some(all));
                    }
                    if self.fill_buf().await? == 0 {
                        return Ok(None);
                    }
                }
                Framing::Chunked(state) => {
                    match state {
                        ChunkState::Done(_) => return Ok(None),
                        ChunkState::Size => {
                            let Some(line) = self.take_line()? else {
                                self.require_more().await?;
                                continue;
                            };
                            // Chunk extensions after ';' are ignored.
                            let size_str = line
                                .split(|&b| b == b';')
                                .next()
                                .unwrap_or(&[]);
                            let size_str =
                                std::str::from_utf8(size_str).map_err(Error::protocol)?;
                            let size = u64::from_str_radix(size_str.trim(), 16)
                                .map_err(Error::protocol)?;
                            *state = if size == 0 {
                                ChunkState::Trailers
                            } else {
                                ChunkState::Data { remaining: size }
                            };
                        }
                        ChunkState::Data { remaining } => {
                            if !self.buf.is_empty() {
                                let take = (*remaining).min(self.buf.len() as u64) as usize;
                                *remaining -= take as u64;
                                if *remaining == 0 {
                                    *state = ChunkState::DataEnd;
                                }
                                return Ok(Some(self.buf.split_to(take).freeze()));
                            }
                            self.require_more().await?;
                        }
                        ChunkState::DataEnd => {
                            if self.buf.len() < 2 {
                                self.require_more().await?;
                                continue;
                            }
                            if &self.buf[..2] != b"\r\n" {
                                self.reusable = false;
                                return Err(Error::protocol(MalformedChunk));
                            }
                            self.buf.advance(2);
                            *state = ChunkState::Size;
                        }
                        ChunkState::Trailers => {
                            let trailers = match self.parse_trailers()? {
                                Some(trailers) => trailers,
                                None => {
                                    self.require_more().await?;
                                    continue;
                                }
                            };
                            *state = ChunkState::Done(trailers);
                            return Ok(None);
                        }
                    }
                }
            }
        }
    }

    /// Takes one CRLF-terminated line out of the buffer, or `None` if a
    /// full line has not arrived yet.
    fn take_line(&mut self) -> Result<Option<Vec<u8>>, Error> {
        let Some(pos) = self.buf.windows(2).position(|w| w == b"\r\n") else {
            if self.buf.len() > MAX_HEAD_SIZE {
                return Err(Error::protocol(OversizedHead));
            }
            return Ok(None);
        };
        let line = self.buf.split_to(pos).to_vec();
        self.buf.advance(2);
        Ok(Some(line))
    }

    /// Parses the trailer section if it is fully buffered.
    fn parse_trailers(&mut self) -> Result<Option<HeaderMap>, Error> {
        // Find the end of the trailer section without consuming, so a
        // partial read leaves the buffer intact.
        let mut trailers = HeaderMap::new();
        let mut offset = 0usize;
        loop {
            let rest = &self.buf[offset..];
            let Some(pos) = rest.windows(2).position(|w| w == b"\r\n") else {
                return Ok(None);
            };
            let line = &rest[..pos];
            if line.is_empty() {
                self.buf.advance(offset + 2);
                return Ok(Some(trailers));
            }
            let Some(colon) = line.iter().position(|&b| b == b':') else {
                return Err(Error::protocol(MalformedChunk));
            };
            let name = HeaderName::from_bytes(&line[..colon]).map_err(Error::protocol)?;
            let mut value = &line[colon + 1..];
            while value.first() == Some(&b' ') || value.first() == Some(&b'\t') {
                value = &value[1..];
            }
            let value = HeaderValue::from_bytes(value).map_err(Error::protocol)?;
            trailers.append(name, value);
            offset += pos + 2;
        }
    }

    async fn require_more(&mut self) -> Result<(), Error> {
        if self.fill_buf().await? == 0 {
            self.reusable = false;
            return Err(Error::read(std::io::Error::from(
                std::io::ErrorKind::UnexpectedEof,
            )));
        }
        Ok(())
    }

    async fn fill_buf(&mut self) -> Result<usize, Error> {
        self.io.read_buf(&mut self.buf).await.map_err(Error::read)
    }
}

#[derive(Debug)]
struct OversizedHead;

impl std::fmt::Display for OversizedHead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("response head exceeded the size limit")
    }
}

impl std::error::Error for OversizedHead {}

#[derive(Debug)]
struct MalformedChunk;

impl std::fmt::Display for MalformedChunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("malformed chunked encoding")
    }
}

impl std::error::Error for MalformedChunk {}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt as _;

    fn head(method: Method, target: &str) -> RequestHead {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("test.local"));
        RequestHead {
            method,
            target: target.to_string(),
            headers,
        }
    }

    async fn transport_with_response(
        response: &'static [u8],
    ) -> (Http1Transport, tokio::io::DuplexStream) {
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        server.write_all(response).await.unwrap();
        (Http1Transport::new(Box::new(client)), server)
    }

    #[tokio::test]
    async fn content_length_response() {
        let (mut t, _server) =
            transport_with_response(b"HTTP/1.1 200 OK\r\ncontent-length: 5\r\n\r\nhello").await;

        let (resp, mut framing) = t
            .send_request(&head(Method::GET, "/"), None, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(resp.status, StatusCode::OK);
        assert_eq!(resp.version, Version::HTTP_11);

        let data = t.read_body_data(&mut framing).await.unwrap().unwrap();
        assert_eq!(&data[..], b"hello");
        assert!(t.read_body_data(&mut framing).await.unwrap().is_none());
        assert!(framing.is_complete());
        assert!(t.is_reusable());
    }

    #[tokio::test]
    async fn chunked_response_with_trailers() {
        let (mut t, _server) = transport_with_response(
            b"HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\n\
              4\r\nwiki\r\n5\r\npedia\r\n0\r\nx-checksum: abc\r\n\r\n",
        )
        .await;

        let (_resp, mut framing) = t
            .send_request(&head(Method::GET, "/"), None, Duration::from_secs(1))
            .await
            .unwrap();

        let mut collected = Vec::new();
        while let Some(chunk) = t.read_body_data(&mut framing).await.unwrap() {
            collected.extend_from_slice(&chunk);
        }
        assert_eq!(collected, b"wikipedia");

        let trailers = framing.trailers().unwrap();
        assert_eq!(trailers.get("x-checksum").unwrap(), "abc");
        assert!(t.is_reusable());
    }

    #[tokio::test]
    async fn head_response_has_no_body() {
        let (mut t, _server) =
            transport_with_response(b"HTTP/1.1 200 OK\r\ncontent-length: 100\r\n\r\n").await;

        let (_resp, mut framing) = t
            .send_request(&head(Method::HEAD, "/"), None, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(matches!(framing, Framing::Empty));
        assert!(t.read_body_data(&mut framing).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn connection_close_marks_not_reusable() {
        let (mut t, _server) = transport_with_response(
            b"HTTP/1.1 200 OK\r\nconnection: close\r\ncontent-length: 0\r\n\r\n",
        )
        .await;

        let (_resp, _framing) = t
            .send_request(&head(Method::GET, "/"), None, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(!t.is_reusable());
    }

    #[tokio::test]
    async fn eof_framing_reads_until_close() {
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        server
            .write_all(b"HTTP/1.1 200 OK\r\n\r\nstream until close")
            .await
            .unwrap();
        // Half-close: the response side ends while the request side stays
        // writable.
        server.shutdown().await.unwrap();

        let mut t = Http1Transport::new(Box::new(client));
        let (_resp, mut framing) = t
            .send_request(&head(Method::GET, "/"), None, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(matches!(framing, Framing::Eof));

        let mut collected = Vec::new();
        while let Some(chunk) = t.read_body_data(&mut framing).await.unwrap() {
            collected.extend_from_slice(&chunk);
        }
        assert_eq!(collected, b"stream until close");
        assert!(!t.is_reusable());
    }

    #[tokio::test]
    async fn expect_continue_waits_for_interim() {
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        server
            .write_all(
                b"HTTP/1.1 100 Continue\r\n\r\n\
                  HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nok",
            )
            .await
            .unwrap();

        let mut t = Http1Transport::new(Box::new(client));
        let mut h = head(Method::POST, "/upload");
        h.headers
            .insert(header::EXPECT, HeaderValue::from_static("100-continue"));
        h.headers
            .insert(header::CONTENT_LENGTH, HeaderValue::from_static("4"));

        let (resp, mut framing) = t
            .send_request(&h, Some("data".into()), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(resp.status, StatusCode::OK);
        let data = t.read_body_data(&mut framing).await.unwrap().unwrap();
        assert_eq!(&data[..], b"ok");
    }

    #[tokio::test]
    async fn expect_continue_final_status_skips_body() {
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        server
            .write_all(b"HTTP/1.1 417 Expectation Failed\r\ncontent-length: 0\r\n\r\n")
            .await
            .unwrap();

        let mut t = Http1Transport::new(Box::new(client));
        let mut h = head(Method::POST, "/upload");
        h.headers
            .insert(header::EXPECT, HeaderValue::from_static("100-continue"));
        h.headers
            .insert(header::CONTENT_LENGTH, HeaderValue::from_static("4"));

        let (resp, _framing) = t
            .send_request(&h, Some("data".into()), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(resp.status, StatusCode::EXPECTATION_FAILED);
        // Body never went out; the advertised framing is broken.
        assert!(!t.is_reusable());
    }

    #[tokio::test]
    async fn chunked_request_body_encoding() {
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        server
            .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n")
            .await
            .unwrap();

        let mut t = Http1Transport::new(Box::new(client));
        let mut h = head(Method::POST, "/");
        h.headers.insert(
            header::TRANSFER_ENCODING,
            HeaderValue::from_static("chunked"),
        );

        let chunks: Vec<Result<_, std::io::Error>> = vec![Ok("ab"), Ok("c")];
        let body = Body::wrap_stream(futures_util::stream::iter(chunks));
        t.send_request(&h, Some(body), Duration::from_secs(1))
            .await
            .unwrap();

        let mut written = vec![0u8; 1024];
        let n = tokio::io::AsyncReadExt::read(&mut server, &mut written)
            .await
            .unwrap();
        let written = String::from_utf8_lossy(&written[..n]);
        assert!(written.ends_with("2\r\nab\r\n1\r\nc\r\n0\r\n\r\n"), "{written}");
    }
}
