mod support;

use std::time::Duration;

use support::server::{self, Script};

// Four concurrent requests against a two-connection bound: every request
// succeeds and the server never sees a third socket.
#[tokio::test]
async fn per_origin_bound_is_respected_under_concurrency() {
    let _ = env_logger::try_init();

    let server = server::low_level(|i, _| {
        Script::DelayRespond(
            Duration::from_millis(150),
            server::response(200, "OK", &[], format!("body {i}").as_bytes()),
        )
    });

    let client = weft::Client::builder()
        .no_proxy()
        .pool_max_per_origin(2)
        .build()
        .unwrap();

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let client = client.clone();
        let url = server.url("/");
        tasks.push(tokio::spawn(async move {
            client.get(url).send().await.unwrap().text().await.unwrap()
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert!(
        server.connections() <= 2,
        "bound of 2 exceeded: {} connections",
        server.connections()
    );
    assert_eq!(server.requests().len(), 4);
}

#[tokio::test]
async fn non_blocking_pool_fails_fast_when_full() {
    let _ = env_logger::try_init();

    let server = server::low_level(|_, _| {
        Script::DelayRespond(
            Duration::from_millis(500),
            server::response(200, "OK", &[], b"slow"),
        )
    });

    let client = weft::Client::builder()
        .no_proxy()
        .pool_max_per_origin(1)
        .pool_block_if_full(false)
        .build()
        .unwrap();

    let first = {
        let client = client.clone();
        let url = server.url("/");
        tokio::spawn(async move { client.get(url).send().await.unwrap().text().await })
    };
    // Let the first request claim the only slot.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let err = client.get(server.url("/")).send().await.unwrap_err();
    assert!(err.is_pool());
    assert!(err.is_pool_full());

    first.await.unwrap().unwrap();
}

#[tokio::test]
async fn blocking_pool_queues_until_release() {
    let _ = env_logger::try_init();

    let server = server::low_level(|i, _| {
        Script::DelayRespond(
            Duration::from_millis(100),
            server::response(200, "OK", &[], format!("{i}").as_bytes()),
        )
    });

    let client = weft::Client::builder()
        .no_proxy()
        .pool_max_per_origin(1)
        .build()
        .unwrap();

    let mut tasks = Vec::new();
    for _ in 0..3 {
        let client = client.clone();
        let url = server.url("/");
        tasks.push(tokio::spawn(async move {
            client.get(url).send().await.unwrap().text().await.unwrap()
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    // All three were strictly serialized over one socket.
    assert_eq!(server.connections(), 1);
    assert_eq!(server.requests().len(), 3);
}

#[tokio::test]
async fn broken_connection_is_discarded_not_reused() {
    let _ = env_logger::try_init();

    let server = server::low_level(|i, _| match i {
        // Serve one response, then kill the socket under the idle pool.
        0 => Script::RespondAndClose(server::response(200, "OK", &[], b"one")),
        _ => Script::Respond(server::response(200, "OK", &[], b"two")),
    });

    let client = weft::Client::builder().no_proxy().build().unwrap();

    let body = client
        .get(server.url("/"))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "one");

    // Give the close time to land.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let body = client
        .get(server.url("/"))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "two");
    assert_eq!(server.connections(), 2);
}

// An abandoned half-read HTTP/1.1 body forfeits its connection; the next
// request gets a fresh one.
#[tokio::test]
async fn unread_body_closes_h1_connection() {
    let _ = env_logger::try_init();

    let big = vec![b'x'; 4 * 1024 * 1024];
    let server = server::low_level(move |_, _| {
        Script::Respond(server::response(200, "OK", &[], &big))
    });

    let client = weft::Client::builder().no_proxy().build().unwrap();

    let resp = client.get(server.url("/big")).send().await.unwrap();
    assert_eq!(resp.status(), weft::StatusCode::OK);
    resp.release_conn();

    let resp = client.get(server.url("/big")).send().await.unwrap();
    let body = resp.bytes().await.unwrap();
    assert_eq!(body.len(), 4 * 1024 * 1024);
    assert_eq!(server.connections(), 2, "half-read socket must not be reused");
}

#[tokio::test]
async fn distinct_ports_use_distinct_pools() {
    let _ = env_logger::try_init();

    let a = server::low_level(|_, _| Script::Respond(server::response(200, "OK", &[], b"a")));
    let b = server::low_level(|_, _| Script::Respond(server::response(200, "OK", &[], b"b")));

    let client = weft::Client::builder().no_proxy().build().unwrap();
    assert_eq!(
        client.get(a.url("/")).send().await.unwrap().text().await.unwrap(),
        "a"
    );
    assert_eq!(
        client.get(b.url("/")).send().await.unwrap().text().await.unwrap(),
        "b"
    );

    assert_eq!(a.connections(), 1);
    assert_eq!(b.connections(), 1);
}
