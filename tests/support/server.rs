#![allow(dead_code)]

use std::{
    future::Future,
    net,
    pin::Pin,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    task::{Context, Poll},
    thread,
    time::Duration,
};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf},
    net::TcpStream,
    runtime,
    sync::oneshot,
};

/// A test server running on its own runtime thread.
pub struct Server {
    addr: net::SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    connections: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl Server {
    pub fn addr(&self) -> net::SocketAddr {
        self.addr
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Connections accepted so far.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Raw bytes of each request received (head plus body), in order.
    pub fn requests(&self) -> Vec<Vec<u8>> {
        self.requests.lock().unwrap().clone()
    }

    /// The request line + headers of request `i`, as a string.
    pub fn request_str(&self, i: usize) -> String {
        String::from_utf8_lossy(&self.requests()[i]).into_owned()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// What to do with one received request.
pub enum Script {
    /// Write the bytes and keep the connection open.
    Respond(Vec<u8>),
    /// Write the bytes, then close the connection.
    RespondAndClose(Vec<u8>),
    /// Wait, then write the bytes.
    DelayRespond(Duration, Vec<u8>),
    /// Close the connection without responding.
    Close,
    /// Never respond (until the client goes away).
    Hang,
}

/// Formats a simple response with a body and optional extra header lines.
pub fn response(status: u16, reason: &str, extra_headers: &[&str], body: &[u8]) -> Vec<u8> {
    let mut out = format!("HTTP/1.1 {status} {reason}\r\n");
    for header in extra_headers {
        out.push_str(header);
        out.push_str("\r\n");
    }
    out.push_str(&format!("content-length: {}\r\n\r\n", body.len()));
    let mut bytes = out.into_bytes();
    bytes.extend_from_slice(body);
    bytes
}

/// Spawns a scripted HTTP/1.1 server. The closure receives the global
/// request serial (0-based, across connections) and the raw request bytes,
/// and decides the response.
pub fn low_level<F>(script: F) -> Server
where
    F: Fn(usize, &[u8]) -> Script + Send + Sync + 'static,
{
    let script = Arc::new(script);
    let connections = Arc::new(AtomicUsize::new(0));
    let requests: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    let serial = Arc::new(AtomicUsize::new(0));

    // A separate runtime thread avoids entangling with the test's reactor.
    let (addr_tx, addr_rx) = std::sync::mpsc::channel();
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

    let conn_count = connections.clone();
    let request_log = requests.clone();
    thread::spawn(move || {
        let rt = runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("test server runtime");
        rt.block_on(async move {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            addr_tx.send(listener.local_addr().unwrap()).unwrap();

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    accepted = listener.accept() => {
                        let Ok((socket, _)) = accepted else { break };
                        conn_count.fetch_add(1, Ordering::SeqCst);
                        let script = script.clone();
                        let serial = serial.clone();
                        let request_log = request_log.clone();
                        tokio::spawn(async move {
                            serve_scripted(socket, script, serial, request_log).await;
                        });
                    }
                }
            }
        });
    });

    Server {
        addr: addr_rx.recv().expect("server addr"),
        shutdown_tx: Some(shutdown_tx),
        connections,
        requests,
    }
}

async fn serve_scripted<F>(
    mut socket: TcpStream,
    script: Arc<F>,
    serial: Arc<AtomicUsize>,
    request_log: Arc<Mutex<Vec<Vec<u8>>>>,
) where
    F: Fn(usize, &[u8]) -> Script + Send + Sync + 'static,
{
    loop {
        let Some(request) = read_request(&mut socket).await else {
            return;
        };
        let index = serial.fetch_add(1, Ordering::SeqCst);
        request_log.lock().unwrap().push(request.clone());

        match script(index, &request) {
            Script::Respond(bytes) => {
                if socket.write_all(&bytes).await.is_err() {
                    return;
                }
            }
            Script::RespondAndClose(bytes) => {
                let _ = socket.write_all(&bytes).await;
                return;
            }
            Script::DelayRespond(delay, bytes) => {
                tokio::time::sleep(delay).await;
                if socket.write_all(&bytes).await.is_err() {
                    return;
                }
            }
            Script::Close => return,
            Script::Hang => {
                // Park until the client hangs up.
                let mut sink = [0u8; 256];
                while matches!(socket.read(&mut sink).await, Ok(n) if n > 0) {}
                return;
            }
        }
    }
}

/// Reads one request: head plus any `Content-Length` or chunked body.
/// Returns `None` on a cleanly closed connection.
async fn read_request(socket: &mut TcpStream) -> Option<Vec<u8>> {
    let mut buf = Vec::new();
    let head_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        let mut chunk = [0u8; 4096];
        match socket.read(&mut chunk).await {
            Ok(0) | Err(_) => {
                return if buf.is_empty() { None } else { Some(buf) };
            }
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).into_owned();
    let head_lower = head.to_ascii_lowercase();

    if let Some(len) = header_value(&head_lower, "content-length") {
        let len: usize = len.trim().parse().unwrap_or(0);
        while buf.len() < head_end + len {
            let mut chunk = [0u8; 4096];
            match socket.read(&mut chunk).await {
                Ok(0) | Err(_) => return Some(buf),
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
            }
        }
    } else if header_value(&head_lower, "transfer-encoding")
        .is_some_and(|v| v.contains("chunked"))
    {
        while !buf[head_end..].windows(5).any(|w| w == b"0\r\n\r\n") {
            let mut chunk = [0u8; 4096];
            match socket.read(&mut chunk).await {
                Ok(0) | Err(_) => return Some(buf),
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
            }
        }
    }

    Some(buf)
}

fn header_value<'a>(head_lower: &'a str, name: &str) -> Option<&'a str> {
    for line in head_lower.lines() {
        if let Some(rest) = line.strip_prefix(name) {
            if let Some(value) = rest.strip_prefix(':') {
                return Some(value.trim());
            }
        }
    }
    None
}

// ===== HTTP/2 test server =====

pub type H2Handler = Arc<
    dyn Fn(
            usize,
            http::Request<h2::RecvStream>,
        ) -> Pin<Box<dyn Future<Output = (http::Response<()>, Vec<u8>)> + Send>>
        + Send
        + Sync,
>;

/// Spawns a plaintext (prior-knowledge) HTTP/2 server. The handler receives
/// the global request serial and the request, and returns the response head
/// plus body bytes.
pub fn h2_server<F, Fut>(handler: F) -> Server
where
    F: Fn(usize, http::Request<h2::RecvStream>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = (http::Response<()>, Vec<u8>)> + Send + 'static,
{
    let handler: H2Handler = Arc::new(move |serial, req| Box::pin(handler(serial, req)));
    h2_server_inner(handler, false, None)
}

/// Like [`h2_server`], but binds to a specific address (e.g. to take over a
/// port a previous server instance held).
pub fn h2_server_on<F, Fut>(addr: net::SocketAddr, handler: F) -> Server
where
    F: Fn(usize, http::Request<h2::RecvStream>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = (http::Response<()>, Vec<u8>)> + Send + 'static,
{
    let handler: H2Handler = Arc::new(move |serial, req| Box::pin(handler(serial, req)));
    h2_server_inner(handler, false, Some(addr))
}

/// Like [`h2_server`], but advertises `SETTINGS_ENABLE_CONNECT_PROTOCOL`
/// and echoes WebSocket frames on accepted extended CONNECT streams.
pub fn h2_ws_echo_server() -> Server {
    let handler: H2Handler = Arc::new(|_, _| {
        Box::pin(async {
            let response = http::Response::builder().status(200).body(()).unwrap();
            (response, b"plain".to_vec())
        })
    });
    h2_server_inner(handler, true, None)
}

fn h2_server_inner(
    handler: H2Handler,
    extended_connect: bool,
    addr: Option<net::SocketAddr>,
) -> Server {
    let connections = Arc::new(AtomicUsize::new(0));
    let requests: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    let serial = Arc::new(AtomicUsize::new(0));

    let (addr_tx, addr_rx) = std::sync::mpsc::channel();
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

    let conn_count = connections.clone();
    thread::spawn(move || {
        let rt = runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("test server runtime");
        rt.block_on(async move {
            let bind = addr.unwrap_or_else(|| "127.0.0.1:0".parse().unwrap());
            let listener = tokio::net::TcpListener::bind(bind).await.unwrap();
            addr_tx.send(listener.local_addr().unwrap()).unwrap();

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    accepted = listener.accept() => {
                        let Ok((socket, _)) = accepted else { break };
                        conn_count.fetch_add(1, Ordering::SeqCst);
                        let handler = handler.clone();
                        let serial = serial.clone();
                        tokio::spawn(async move {
                            serve_h2(socket, handler, serial, extended_connect).await;
                        });
                    }
                }
            }
        });
    });

    Server {
        addr: addr_rx.recv().expect("server addr"),
        shutdown_tx: Some(shutdown_tx),
        connections,
        requests,
    }
}

async fn serve_h2(
    socket: TcpStream,
    handler: H2Handler,
    serial: Arc<AtomicUsize>,
    extended_connect: bool,
) {
    let mut builder = h2::server::Builder::new();
    if extended_connect {
        builder.enable_connect_protocol();
    }
    let Ok(mut conn) = builder.handshake::<_, bytes::Bytes>(socket).await else {
        return;
    };

    while let Some(accepted) = conn.accept().await {
        let Ok((request, mut respond)) = accepted else { return };
        let index = serial.fetch_add(1, Ordering::SeqCst);

        if extended_connect && request.method() == http::Method::CONNECT {
            tokio::spawn(async move {
                let (parts, recv) = request.into_parts();
                assert_eq!(
                    parts.extensions.get::<h2::ext::Protocol>().map(|p| p.as_str()),
                    Some("websocket")
                );
                let response = http::Response::builder().status(200).body(()).unwrap();
                let send = respond.send_response(response, false).unwrap();
                ws_echo_on_h2(recv, send).await;
            });
            continue;
        }

        let handler = handler.clone();
        tokio::spawn(async move {
            let (response, body) = handler(index, request).await;
            if let Ok(mut stream) = respond.send_response(response, body.is_empty()) {
                if !body.is_empty() {
                    let _ = stream.send_data(bytes::Bytes::from(body), true);
                }
            }
        });
    }
}

/// Echoes WebSocket frames over one extended-CONNECT h2 stream.
async fn ws_echo_on_h2(recv: h2::RecvStream, send: h2::SendStream<bytes::Bytes>) {
    use futures_util::{SinkExt, StreamExt};
    use tokio_util::compat::TokioAsyncReadCompatExt;

    let io = H2ServerIo {
        recv,
        send,
        leftover: bytes::Bytes::new(),
    };
    let mut ws = async_tungstenite::WebSocketStream::from_raw_socket(
        io.compat(),
        tungstenite::protocol::Role::Server,
        None,
    )
    .await;

    while let Some(Ok(message)) = ws.next().await {
        match message {
            tungstenite::Message::Text(_) | tungstenite::Message::Binary(_) => {
                if ws.send(message).await.is_err() {
                    break;
                }
            }
            tungstenite::Message::Close(_) => break,
            _ => {}
        }
    }
}

/// Server-side adapter: one h2 stream as a byte pipe.
struct H2ServerIo {
    recv: h2::RecvStream,
    send: h2::SendStream<bytes::Bytes>,
    leftover: bytes::Bytes,
}

impl AsyncRead for H2ServerIo {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if self.leftover.is_empty() {
            match self.recv.poll_data(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Ready(Some(Err(e))) => {
                    return Poll::Ready(Err(std::io::Error::other(e)))
                }
                Poll::Ready(Some(Ok(chunk))) => {
                    let _ = self.recv.flow_control().release_capacity(chunk.len());
                    self.leftover = chunk;
                }
            }
        }
        let n = self.leftover.len().min(buf.remaining());
        let chunk = self.leftover.split_to(n);
        buf.put_slice(&chunk);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for H2ServerIo {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        self.send.reserve_capacity(buf.len());
        match self.send.poll_capacity(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(None) => Poll::Ready(Err(std::io::ErrorKind::BrokenPipe.into())),
            Poll::Ready(Some(Err(e))) => Poll::Ready(Err(std::io::Error::other(e))),
            Poll::Ready(Some(Ok(granted))) => {
                let n = granted.min(buf.len());
                self.send
                    .send_data(bytes::Bytes::copy_from_slice(&buf[..n]), false)
                    .map_err(std::io::Error::other)?;
                Poll::Ready(Ok(n))
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        self.send
            .send_data(bytes::Bytes::new(), true)
            .map_err(std::io::Error::other)?;
        Poll::Ready(Ok(()))
    }
}

// ===== WebSocket echo server (HTTP/1.1 upgrade) =====

/// Spawns a blocking tungstenite echo server; `protocol` is echoed back as
/// the accepted subprotocol when a client offers it.
pub fn ws_echo(protocol: Option<&'static str>) -> Server {
    let connections = Arc::new(AtomicUsize::new(0));
    let requests: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));

    let listener = net::TcpListener::bind("127.0.0.1:0").expect("ws listener");
    let addr = listener.local_addr().unwrap();
    let (shutdown_tx, _shutdown_rx) = oneshot::channel::<()>();

    let conn_count = connections.clone();
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(stream) = stream else { break };
            conn_count.fetch_add(1, Ordering::SeqCst);
            thread::spawn(move || {
                let callback = move |req: &tungstenite::handshake::server::Request,
                                     mut resp: tungstenite::handshake::server::Response| {
                    if let Some(protocol) = protocol {
                        let offered = req
                            .headers()
                            .get("sec-websocket-protocol")
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or("");
                        if offered.split(',').any(|p| p.trim() == protocol) {
                            resp.headers_mut().insert(
                                "sec-websocket-protocol",
                                protocol.parse().unwrap(),
                            );
                        }
                    }
                    Ok(resp)
                };
                let Ok(mut ws) = tungstenite::accept_hdr(stream, callback) else {
                    return;
                };
                loop {
                    match ws.read() {
                        Ok(
                            msg @ tungstenite::Message::Text(_)
                            | msg @ tungstenite::Message::Binary(_),
                        ) => {
                            if ws.send(msg).is_err() {
                                break;
                            }
                        }
                        Ok(tungstenite::Message::Close(_)) | Err(_) => break,
                        Ok(_) => {}
                    }
                }
            });
        }
    });

    Server {
        addr,
        shutdown_tx: Some(shutdown_tx),
        connections,
        requests,
    }
}
