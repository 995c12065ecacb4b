mod support;

use std::time::Duration;

use support::server::{self, Script};

#[tokio::test]
async fn client_total_timeout() {
    let _ = env_logger::try_init();

    let server = server::low_level(|_, _| Script::Hang);

    let client = weft::Client::builder()
        .no_proxy()
        .timeout(Duration::from_millis(200))
        .build()
        .unwrap();

    let url = server.url("/slow");
    let err = client.get(&url).send().await.unwrap_err();

    assert!(err.is_timeout());
    assert_eq!(err.url().map(|u| u.as_str()), Some(url.as_str()));
}

#[tokio::test]
async fn request_timeout_overrides_client() {
    let _ = env_logger::try_init();

    let server = server::low_level(|_, _| {
        Script::DelayRespond(
            Duration::from_millis(400),
            server::response(200, "OK", &[], b"late"),
        )
    });

    // Client-wide timeout is generous; the per-request one must win.
    let client = weft::Client::builder()
        .no_proxy()
        .timeout(Duration::from_secs(5))
        .build()
        .unwrap();

    let err = client
        .get(server.url("/slow"))
        .timeout(Duration::from_millis(100))
        .send()
        .await
        .unwrap_err();
    assert!(err.is_timeout());
}

#[tokio::test]
async fn zero_timeout_fails_immediately() {
    let _ = env_logger::try_init();

    let server = server::low_level(|_, _| Script::Hang);

    let client = weft::Client::builder().no_proxy().build().unwrap();
    let err = client
        .get(server.url("/"))
        .timeout(Duration::ZERO)
        .send()
        .await
        .unwrap_err();

    assert!(err.is_timeout());
    // Nothing should have gone on the wire.
    assert_eq!(server.requests().len(), 0);
}

#[tokio::test]
async fn zero_connect_timeout_fails_immediately() {
    let _ = env_logger::try_init();

    let client = weft::Client::builder()
        .no_proxy()
        .connect_timeout(Duration::ZERO)
        .retries(weft::retry::Policy::none())
        .build()
        .unwrap();

    let err = client
        .get("http://192.0.2.1/") // never dialed
        .send()
        .await
        .unwrap_err();
    assert!(err.is_timeout());
}

#[tokio::test]
async fn read_timeout_applies_to_head() {
    let _ = env_logger::try_init();

    let server = server::low_level(|_, _| Script::Hang);

    let client = weft::Client::builder()
        .no_proxy()
        .read_timeout(Duration::from_millis(150))
        .retries(weft::retry::Policy::none())
        .build()
        .unwrap();

    let err = client.get(server.url("/slow")).send().await.unwrap_err();
    assert!(err.is_timeout());
}

#[tokio::test]
async fn read_timeout_applies_to_body() {
    let _ = env_logger::try_init();

    // Head arrives promptly, the body never does.
    let server = server::low_level(|_, _| {
        Script::Respond(b"HTTP/1.1 200 OK\r\ncontent-length: 100\r\n\r\npartial".to_vec())
    });

    let client = weft::Client::builder()
        .no_proxy()
        .read_timeout(Duration::from_millis(150))
        .build()
        .unwrap();

    let mut resp = client.get(server.url("/")).send().await.unwrap();
    assert_eq!(resp.status(), weft::StatusCode::OK);

    let mut seen = Vec::new();
    let err = loop {
        match resp.chunk().await {
            Ok(Some(chunk)) => seen.extend_from_slice(&chunk),
            Ok(None) => panic!("body cannot complete"),
            Err(e) => break e,
        }
    };
    assert_eq!(seen, b"partial");
    assert!(err.is_timeout());
}

// Retried attempts each get their own read deadline rather than sharing
// one, so two slow-but-under-deadline attempts both get their full window.
#[tokio::test]
async fn read_deadline_is_per_attempt() {
    let _ = env_logger::try_init();

    let server = server::low_level(|i, _| match i {
        0 => Script::Close,
        _ => Script::DelayRespond(
            Duration::from_millis(200),
            server::response(200, "OK", &[], b"slow but fine"),
        ),
    });

    let client = weft::Client::builder()
        .no_proxy()
        .read_timeout(Duration::from_millis(350))
        .build()
        .unwrap();

    let body = client
        .get(server.url("/"))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "slow but fine");
}
