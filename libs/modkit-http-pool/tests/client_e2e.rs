//! End-to-end tests for the pooled client against local servers.
//!
//! Covers request building (query, JSON, form), default and trace headers,
//! status handling, retries on connections closed without a response, and
//! pool exhaustion.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use httpmock::Method::HEAD;
use httpmock::prelude::*;
use modkit_http_pool::{
    DEFAULT_USER_AGENT, FailureKind, HttpClient, HttpError, PoolConfig, RETRY_ATTEMPT_HEADER,
    TraceContext,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

#[derive(Serialize)]
struct Filter {
    owner: Owner,
    tags: Vec<&'static str>,
    cursor: Option<String>,
}

#[derive(Serialize)]
struct Owner {
    id: u32,
}

#[derive(Debug, Deserialize, PartialEq)]
struct Created {
    id: u64,
    name: String,
}

fn init_tracing() {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter("modkit_http_pool=debug")
        .with_test_writer();
    if subscriber.try_init().is_err() {
        // another test installed it first
    }
}

fn client() -> HttpClient {
    HttpClient::builder().build().unwrap()
}

/// Read one request head from `socket`; returns it lower-cased.
async fn read_head(socket: &mut tokio::net::TcpStream) -> String {
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        match socket.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => head.extend_from_slice(&buf[..n]),
        }
    }
    String::from_utf8_lossy(&head).to_lowercase()
}

#[tokio::test]
async fn get_with_flattened_query() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(GET)
            .path("/items")
            .query_param("owner.id", "7")
            .query_param("tags", "a")
            .query_param("tags", "b")
            .header("user-agent", DEFAULT_USER_AGENT);
        then.status(200)
            .header("content-type", "application/json")
            .body(r#"{"id":1,"name":"first"}"#);
    });

    let client = client();
    let resp = client
        .get(&server.url("/items"))
        .query(&Filter {
            owner: Owner { id: 7 },
            tags: vec!["a", "b"],
            cursor: None,
        })
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
    let body: Created = resp.json().unwrap();
    assert_eq!(
        body,
        Created {
            id: 1,
            name: "first".to_owned()
        }
    );
    mock.assert();
    client.close();
}

#[tokio::test]
async fn post_json_and_form() {
    let server = MockServer::start();
    let json_mock = server.mock(|when, then| {
        when.method(POST)
            .path("/users")
            .header("content-type", "application/json")
            .json_body(json!({"name": "Alice"}));
        then.status(201).body(r#"{"id":42,"name":"Alice"}"#);
    });
    let form_mock = server.mock(|when, then| {
        when.method(POST)
            .path("/token")
            .header("content-type", "application/x-www-form-urlencoded")
            .body("grant_type=client_credentials&scope.read=true");
        then.status(200).body("ok");
    });

    let client = client();
    let created: Created = client
        .post(&server.url("/users"))
        .json(&json!({"name": "Alice"}))
        .unwrap()
        .send()
        .await
        .unwrap()
        .json()
        .unwrap();
    assert_eq!(created.id, 42);

    let text = client
        .post(&server.url("/token"))
        .form(&json!({"grant_type": "client_credentials", "scope": {"read": true}}))
        .unwrap()
        .send()
        .await
        .unwrap()
        .text()
        .unwrap();
    assert_eq!(text, "ok");

    json_mock.assert();
    form_mock.assert();
}

#[tokio::test]
async fn every_verb_reaches_the_server() {
    let server = MockServer::start();
    let mocks = [PUT, PATCH, DELETE, HEAD, OPTIONS].map(|method| {
        server.mock(|when, then| {
            when.method(method).path("/resource");
            then.status(204);
        })
    });

    let client = client();
    let url = server.url("/resource");
    let requests = [
        client.put(&url),
        client.patch(&url),
        client.delete(&url),
        client.head(&url),
        client.options(&url),
    ];
    for request in requests {
        let resp = request.send().await.unwrap();
        assert_eq!(resp.status(), 204);
    }

    for mock in &mocks {
        mock.assert();
    }
    let stats = client.pool_stats().unwrap();
    assert_eq!(stats.leased, 0);
}

#[tokio::test]
async fn trace_headers_follow_the_scope() {
    let server = MockServer::start();
    let traced = server.mock(|when, then| {
        when.method(GET)
            .path("/traced")
            .header("x-b3-traceid", "463ac35c9f6413ad")
            .header("x-b3-spanid", "a2fb4a1d1a96d312")
            .header("x-b3-sampled", "1");
        then.status(200);
    });

    let client = client();
    let ctx = TraceContext::new("463ac35c9f6413ad", "a2fb4a1d1a96d312").with_sampled(true);
    let url = server.url("/traced");
    let resp = TraceContext::scope(ctx, client.get(&url).send())
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
    traced.assert();
}

#[tokio::test]
async fn status_errors_carry_a_preview() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/missing");
        then.status(404)
            .header("content-type", "text/plain")
            .body("no such thing");
    });

    let resp = client().get(&server.url("/missing")).send().await.unwrap();
    assert_eq!(resp.status(), 404);

    match resp.text() {
        Err(HttpError::HttpStatus {
            status,
            body_preview,
            content_type,
        }) => {
            assert_eq!(status, 404);
            assert_eq!(body_preview, "no such thing");
            assert_eq!(content_type.as_deref(), Some("text/plain"));
        }
        other => panic!("expected HttpStatus, got {other:?}"),
    }
}

#[tokio::test]
async fn peer_close_is_retried_with_attempt_header() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let heads = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&heads);

    tokio::spawn(async move {
        // First connection: read the request, then hang up without answering.
        let (mut socket, _) = listener.accept().await.unwrap();
        let head = read_head(&mut socket).await;
        seen.lock().unwrap().push(head);
        drop(socket);

        let (mut socket, _) = listener.accept().await.unwrap();
        let head = read_head(&mut socket).await;
        seen.lock().unwrap().push(head);
        socket
            .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nok")
            .await
            .unwrap();
        let mut rest = [0u8; 64];
        socket.read(&mut rest).await.ok();
    });

    let client = client();
    let resp = client
        .get(&format!("http://127.0.0.1:{port}/flaky"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.bytes(), "ok");

    let heads = heads.lock().unwrap();
    assert_eq!(heads.len(), 2);
    let header = RETRY_ATTEMPT_HEADER.to_lowercase();
    assert!(!heads[0].contains(&header));
    assert!(heads[1].contains(&format!("{header}: 1")));
}

/// Serve every request with a head and a cut-off body, counting requests.
async fn truncating_server() -> (u16, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let served = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&served);

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            read_head(&mut socket).await;
            counter.fetch_add(1, Ordering::SeqCst);
            socket
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 100\r\n\r\nab")
                .await
                .ok();
        }
    });

    (port, served)
}

#[tokio::test]
async fn truncated_body_does_not_resend_post() {
    let (port, served) = truncating_server().await;

    let client = client();
    let err = client
        .post(&format!("http://127.0.0.1:{port}/orders"))
        .body_string("{\"qty\":1}".to_owned())
        .send()
        .await
        .unwrap_err();

    assert_eq!(err.failure_kind(), Some(FailureKind::Io), "{err:?}");
    assert_eq!(served.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn truncated_body_retries_get() {
    let (port, served) = truncating_server().await;

    let client = client();
    let err = client
        .get(&format!("http://127.0.0.1:{port}/orders"))
        .send()
        .await
        .unwrap_err();

    assert_eq!(err.failure_kind(), Some(FailureKind::Io), "{err:?}");
    assert_eq!(served.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn unpooled_client_does_not_retry() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        read_head(&mut socket).await;
    });

    let client = HttpClient::builder().unpooled().build().unwrap();
    let err = client
        .get(&format!("http://127.0.0.1:{port}/once"))
        .send()
        .await
        .unwrap_err();
    assert!(err.failure_kind().is_some(), "{err:?}");
}

#[tokio::test]
async fn pool_exhaustion_is_reported() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                read_head(&mut socket).await;
                tokio::time::sleep(Duration::from_millis(500)).await;
                socket
                    .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n")
                    .await
                    .ok();
            });
        }
    });

    let client = HttpClient::builder()
        .pool(
            PoolConfig::default()
                .with_max_per_destination(1)
                .with_acquire_timeout_ms(100),
        )
        .build()
        .unwrap();
    let url = format!("http://127.0.0.1:{port}/slow");

    let slow = tokio::spawn({
        let client = client.clone();
        let url = url.clone();
        async move { client.get(&url).send().await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = client.get(&url).send().await.unwrap_err();
    assert!(
        matches!(err, HttpError::PoolExhausted { .. }),
        "expected PoolExhausted, got {err:?}"
    );

    let resp = slow.await.unwrap().unwrap();
    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn closed_client_rejects_requests() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(GET).path("/after-close");
        then.status(200);
    });

    let client = client();
    let other = client.clone();
    client.close();

    let err = other.get(&server.url("/after-close")).send().await.unwrap_err();
    assert!(matches!(err, HttpError::PoolClosed));
    mock.assert_calls(0);
}
