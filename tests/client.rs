mod support;

use support::server::{self, Script};

#[tokio::test]
async fn happy_get() {
    let _ = env_logger::try_init();

    let server = server::low_level(|_, _| {
        Script::Respond(server::response(200, "OK", &[], b"hello, pool"))
    });

    let client = weft::Client::builder().no_proxy().build().unwrap();
    let url = server.url("/robots.txt");

    let resp = client.get(&url).send().await.unwrap();
    assert_eq!(resp.status(), weft::StatusCode::OK);
    assert_eq!(resp.version(), weft::Version::HTTP_11);
    assert_eq!(resp.content_length(), Some(11));
    assert_eq!(resp.url().as_str(), url);

    let body = resp.text().await.unwrap();
    assert_eq!(body, "hello, pool");
    assert_eq!(server.connections(), 1);
}

#[tokio::test]
async fn connection_is_reused_after_body_read() {
    let _ = env_logger::try_init();

    let server = server::low_level(|i, _| {
        Script::Respond(server::response(200, "OK", &[], format!("resp {i}").as_bytes()))
    });

    let client = weft::Client::builder().no_proxy().build().unwrap();

    for i in 0..3 {
        let body = client
            .get(server.url("/"))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(body, format!("resp {i}"));
    }

    assert_eq!(server.connections(), 1, "keep-alive must reuse the socket");
}

#[tokio::test]
async fn sends_host_and_user_agent() {
    let _ = env_logger::try_init();

    let server =
        server::low_level(|_, _| Script::Respond(server::response(200, "OK", &[], b"")));

    let client = weft::Client::builder()
        .no_proxy()
        .user_agent("weft-test/1")
        .build()
        .unwrap();
    client
        .get(server.url("/path?q=1"))
        .send()
        .await
        .unwrap();

    let req = server.request_str(0);
    assert!(req.starts_with("GET /path?q=1 HTTP/1.1\r\n"), "{req}");
    let lower = req.to_ascii_lowercase();
    assert!(lower.contains(&format!("host: {}", server.addr())), "{req}");
    assert!(lower.contains("user-agent: weft-test/1"), "{req}");
}

#[tokio::test]
async fn request_headers_override_defaults() {
    let _ = env_logger::try_init();

    let server =
        server::low_level(|_, _| Script::Respond(server::response(200, "OK", &[], b"")));

    let client = weft::Client::builder().no_proxy().build().unwrap();
    client
        .get(server.url("/"))
        .header("accept", "application/json")
        .send()
        .await
        .unwrap();

    let req = server.request_str(0).to_ascii_lowercase();
    assert!(req.contains("accept: application/json"), "{req}");
    assert!(!req.contains("accept: */*"), "{req}");
}

#[tokio::test]
async fn post_json_round_trips_through_echo() {
    let _ = env_logger::try_init();

    let server = server::low_level(|_, raw| {
        let body_start = raw.windows(4).position(|w| w == b"\r\n\r\n").unwrap() + 4;
        Script::Respond(server::response(
            200,
            "OK",
            &["content-type: application/json"],
            &raw[body_start..],
        ))
    });

    let sent = serde_json::json!({
        "name": "weft",
        "count": 3,
        "ratio": 0.5,
        "ok": true,
        "tags": ["a", "b"],
    });

    let client = weft::Client::builder().no_proxy().build().unwrap();
    let echoed: serde_json::Value = client
        .post(server.url("/echo"))
        .json(&sent)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(echoed, sent);
    let req = server.request_str(0).to_ascii_lowercase();
    assert!(req.contains("content-type: application/json"), "{req}");
}

#[tokio::test]
async fn chunked_response_with_trailers() {
    let _ = env_logger::try_init();

    let server = server::low_level(|_, _| {
        Script::Respond(
            b"HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\n\
              6\r\nstream\r\n3\r\ned!\r\n0\r\nx-digest: abc123\r\n\r\n"
                .to_vec(),
        )
    });

    let client = weft::Client::builder().no_proxy().build().unwrap();
    let mut resp = client.get(server.url("/")).send().await.unwrap();
    let mut body = Vec::new();
    while let Some(chunk) = resp.chunk().await.unwrap() {
        body.extend_from_slice(&chunk);
    }
    assert_eq!(body, b"streamed!");

    let trailers = resp.trailers().expect("trailers after full body");
    assert_eq!(trailers.get("x-digest").unwrap(), "abc123");
}

#[tokio::test]
async fn gzip_body_is_decoded() {
    let _ = env_logger::try_init();

    let original = "a gzipped payload that should round trip";
    let compressed = {
        use std::io::Write;
        let mut enc =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(original.as_bytes()).unwrap();
        enc.finish().unwrap()
    };

    let server = server::low_level(move |_, _| {
        Script::Respond(server::response(
            200,
            "OK",
            &["content-encoding: gzip"],
            &compressed,
        ))
    });

    let client = weft::Client::builder().no_proxy().build().unwrap();
    let text = client
        .get(server.url("/"))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(text, original);

    let req = server.request_str(0).to_ascii_lowercase();
    assert!(req.contains("accept-encoding: gzip"), "{req}");
}

#[tokio::test]
async fn head_has_no_body() {
    let _ = env_logger::try_init();

    let server = server::low_level(|_, _| {
        Script::Respond(b"HTTP/1.1 200 OK\r\ncontent-length: 100\r\n\r\n".to_vec())
    });

    let client = weft::Client::builder().no_proxy().build().unwrap();
    let resp = client.head(server.url("/")).send().await.unwrap();
    assert_eq!(resp.content_length(), Some(100));
    let body = resp.bytes().await.unwrap();
    assert!(body.is_empty());
}

#[tokio::test]
async fn error_for_status() {
    let _ = env_logger::try_init();

    let server = server::low_level(|_, _| {
        Script::Respond(server::response(404, "Not Found", &[], b"nope"))
    });

    let client = weft::Client::builder().no_proxy().build().unwrap();
    let err = client
        .get(server.url("/missing"))
        .send()
        .await
        .unwrap()
        .error_for_status()
        .unwrap_err();

    assert!(err.is_status());
    assert_eq!(err.status(), Some(weft::StatusCode::NOT_FOUND));
}

// The scripted server only answers after reading the full request, so the
// client's continue wait must elapse and the body go out anyway.
#[tokio::test]
async fn expect_100_timeout_sends_body_anyway() {
    let _ = env_logger::try_init();

    let server = server::low_level(|_, raw| {
        let head = String::from_utf8_lossy(raw).to_ascii_lowercase();
        assert!(head.contains("expect: 100-continue"), "{head}");
        let mut bytes = b"HTTP/1.1 100 Continue\r\n\r\n".to_vec();
        bytes.extend_from_slice(&server::response(200, "OK", &[], b"accepted"));
        Script::Respond(bytes)
    });

    let client = weft::Client::builder().no_proxy().build().unwrap();
    let body = client
        .post(server.url("/upload"))
        .header("expect", "100-continue")
        .body("the payload")
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "accepted");
}

#[tokio::test]
async fn client_close_fails_new_requests() {
    let _ = env_logger::try_init();

    let server =
        server::low_level(|_, _| Script::Respond(server::response(200, "OK", &[], b"")));

    let client = weft::Client::builder().no_proxy().build().unwrap();
    client.get(server.url("/")).send().await.unwrap();

    client.close();
    let err = client.get(server.url("/")).send().await.unwrap_err();
    assert!(err.is_pool());
}
