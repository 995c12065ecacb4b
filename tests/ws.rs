mod support;

use support::server;
use weft::Message;

#[tokio::test]
async fn websocket_echo_over_h1_upgrade() {
    let _ = env_logger::try_init();

    let server = server::ws_echo(None);

    let client = weft::Client::builder().no_proxy().build().unwrap();
    let resp = client
        .websocket(format!("ws://{}/", server.addr()))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), weft::StatusCode::SWITCHING_PROTOCOLS);
    assert!(resp.has_extension());

    let mut ws = resp.into_websocket().unwrap();
    ws.send(Message::text("hi")).await.unwrap();
    let echoed = ws.recv().await.unwrap().unwrap();
    assert_eq!(echoed, Message::text("hi"));

    ws.send(Message::Binary(vec![1, 2, 3])).await.unwrap();
    let echoed = ws.recv().await.unwrap().unwrap();
    assert_eq!(echoed, Message::Binary(vec![1, 2, 3]));

    ws.close().await.unwrap();
}

#[tokio::test]
async fn websocket_subprotocol_negotiation() {
    let _ = env_logger::try_init();

    let server = server::ws_echo(Some("chat"));

    let client = weft::Client::builder().no_proxy().build().unwrap();
    let ws = client
        .websocket(format!("ws://{}/", server.addr()))
        .protocols(["chat"])
        .send()
        .await
        .unwrap()
        .into_websocket()
        .unwrap();

    assert_eq!(ws.protocol(), Some("chat"));
}

#[tokio::test]
async fn websocket_handshake_failure_is_an_upgrade_error() {
    let _ = env_logger::try_init();

    // A plain HTTP server that answers 200 instead of 101.
    let server = server::low_level(|_, _| {
        server::Script::Respond(server::response(200, "OK", &[], b"not a websocket"))
    });

    let client = weft::Client::builder().no_proxy().build().unwrap();
    let err = client
        .websocket(format!("ws://{}/", server.addr()))
        .send()
        .await
        .unwrap_err();
    assert!(err.is_upgrade());
}

// RFC 8441: the WebSocket rides one stream of a shared HTTP/2 connection,
// which keeps serving plain requests alongside it.
#[tokio::test]
async fn websocket_extended_connect_over_h2() {
    let _ = env_logger::try_init();

    let server = server::h2_ws_echo_server();

    let client = weft::Client::builder()
        .no_proxy()
        .http2_prior_knowledge()
        .build()
        .unwrap();

    let resp = client
        .websocket(format!("ws+rfc8441://{}/chat", server.addr()))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), weft::StatusCode::OK);
    assert_eq!(resp.version(), weft::Version::HTTP_2);

    let mut ws = resp.into_websocket().unwrap();
    ws.send(Message::text("over h2")).await.unwrap();
    let echoed = ws.recv().await.unwrap().unwrap();
    assert_eq!(echoed, Message::text("over h2"));

    ws.close().await.unwrap();
    assert_eq!(server.connections(), 1);
}
