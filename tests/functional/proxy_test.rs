//! Functional tests for request proxying

mod common;

use axum::{
    body::{Body, Bytes},
    http::{header::CONTENT_TYPE, Request, StatusCode},
    routing::post,
    Router,
};
use common::{app_with, body_string, closed_port, get, test_settings};
use futures::StreamExt;
use llamafile_proxy::gateway::load_balancer::LoadBalancingStrategy;
use std::collections::HashMap;
use std::convert::Infallible;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Notify};
use tower::ServiceExt;
use wiremock::matchers::{body_string as body_is, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn backend_replying(text: &str) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/models"))
        .respond_with(ResponseTemplate::new(200).set_body_string(text))
        .mount(&server)
        .await;
    server
}

/// Event-stream backend that sends one chunk, waits for `release`, then
/// sends two more and closes.
async fn spawn_sse_backend(release: Arc<Notify>) -> u16 {
    let app = Router::new().route(
        "/v1/chat/completions",
        post(move || {
            let release = release.clone();
            async move {
                let (tx, rx) = mpsc::channel::<Result<Bytes, Infallible>>(4);
                tokio::spawn(async move {
                    let _ = tx.send(Ok(Bytes::from("data: one\n\n"))).await;
                    release.notified().await;
                    let _ = tx.send(Ok(Bytes::from("data: two\n\n"))).await;
                    let _ = tx.send(Ok(Bytes::from("data: three\n\n"))).await;
                });

                let stream = futures::stream::unfold(rx, |mut rx| async move {
                    rx.recv().await.map(|item| (item, rx))
                });

                ([(CONTENT_TYPE, "text/event-stream")], Body::from_stream(stream))
            }
        }),
    );

    serve_backend(app).await
}

/// Event-stream backend that sends one chunk, waits for `release`, then
/// aborts the connection mid-body.
async fn spawn_interrupted_backend(release: Arc<Notify>) -> u16 {
    let app = Router::new().route(
        "/v1/chat/completions",
        post(move || {
            let release = release.clone();
            async move {
                let (tx, rx) = mpsc::channel::<Result<Bytes, io::Error>>(4);
                tokio::spawn(async move {
                    let _ = tx.send(Ok(Bytes::from("data: one\n\n"))).await;
                    release.notified().await;
                    let _ = tx
                        .send(Err(io::Error::new(io::ErrorKind::BrokenPipe, "model crashed")))
                        .await;
                });

                let stream = futures::stream::unfold(rx, |mut rx| async move {
                    rx.recv().await.map(|item| (item, rx))
                });

                ([(CONTENT_TYPE, "text/event-stream")], Body::from_stream(stream))
            }
        }),
    );

    serve_backend(app).await
}

/// Event-stream backend that sends one chunk and then keep-alive comments
/// until its client goes away, at which point it notifies `client_gone`.
async fn spawn_heartbeat_backend(client_gone: Arc<Notify>) -> u16 {
    let app = Router::new().route(
        "/v1/chat/completions",
        post(move || {
            let client_gone = client_gone.clone();
            async move {
                let (tx, rx) = mpsc::channel::<Result<Bytes, Infallible>>(4);
                tokio::spawn(async move {
                    let _ = tx.send(Ok(Bytes::from("data: one\n\n"))).await;
                    loop {
                        tokio::time::sleep(Duration::from_millis(25)).await;
                        if tx.send(Ok(Bytes::from(": keep-alive\n\n"))).await.is_err() {
                            client_gone.notify_one();
                            break;
                        }
                    }
                });

                let stream = futures::stream::unfold(rx, |mut rx| async move {
                    rx.recv().await.map(|item| (item, rx))
                });

                ([(CONTENT_TYPE, "text/event-stream")], Body::from_stream(stream))
            }
        }),
    );

    serve_backend(app).await
}

async fn serve_backend(app: Router) -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    port
}

fn chat_request() -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json")
        .body(Body::from(r#"{"stream":true}"#))
        .unwrap()
}

#[tokio::test]
async fn test_buffered_response_is_relayed_unaltered() {
    let backend = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/completions"))
        .and(query_param("n", "2"))
        .and(header("x-custom", "abc"))
        .and(body_is(r#"{"prompt":"hi"}"#))
        .respond_with(
            ResponseTemplate::new(201)
                .insert_header("x-backend", "one")
                .set_body_raw(r#"{"content":"hello"}"#, "application/json"),
        )
        .expect(1)
        .mount(&backend)
        .await;

    let app = app_with(test_settings(), &[backend.address().port()]);

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/completions?n=2")
                .header("x-custom", "abc")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"prompt":"hi"}"#))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(response.headers().get("x-backend").unwrap(), "one");
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "application/json"
    );
    assert_eq!(body_string(response).await, r#"{"content":"hello"}"#);
}

#[tokio::test]
async fn test_backend_error_status_passes_through() {
    let backend = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404).set_body_string("no such route"))
        .mount(&backend)
        .await;

    let app = app_with(test_settings(), &[backend.address().port()]);
    let response = app.oneshot(get("/missing")).await.unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_string(response).await, "no such route");
}

#[tokio::test]
async fn test_redirect_is_returned_not_followed() {
    let backend = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/old"))
        .respond_with(ResponseTemplate::new(302).insert_header("location", "/new"))
        .expect(1)
        .mount(&backend)
        .await;
    Mock::given(path("/new"))
        .respond_with(ResponseTemplate::new(200).set_body_string("followed"))
        .expect(0)
        .mount(&backend)
        .await;

    let app = app_with(test_settings(), &[backend.address().port()]);
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/old")
                .body(Body::from("payload"))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(response.headers().get("location").unwrap(), "/new");
    assert_ne!(body_string(response).await, "followed");
}

#[tokio::test]
async fn test_round_robin_alternates_between_instances() {
    let first = backend_replying("first").await;
    let second = backend_replying("second").await;

    let app = app_with(
        test_settings(),
        &[first.address().port(), second.address().port()],
    );

    let mut seen = Vec::new();
    for _ in 0..4 {
        let response = app.clone().oneshot(get("/v1/models")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        seen.push(body_string(response).await);
    }

    assert_eq!(seen, vec!["first", "second", "first", "second"]);
}

#[tokio::test]
async fn test_request_hash_is_sticky_per_session_header() {
    let first = backend_replying("first").await;
    let second = backend_replying("second").await;

    let mut settings = test_settings();
    settings.balancer.strategy = LoadBalancingStrategy::RequestHash;
    let app = app_with(settings, &[first.address().port(), second.address().port()]);

    let mut counts: HashMap<String, usize> = HashMap::new();
    for _ in 0..6 {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/v1/models")
                    .header("x-session-id", "user-7")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        *counts.entry(body_string(response).await).or_default() += 1;
    }

    assert_eq!(counts.len(), 1, "{:?}", counts);
}

#[tokio::test]
async fn test_unreachable_backend_returns_503_quickly() {
    let app = app_with(test_settings(), &[closed_port()]);

    let start = Instant::now();
    let response = app.oneshot(get("/v1/models")).await.unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert!(start.elapsed() < Duration::from_secs(5));

    let body = body_string(response).await;
    assert!(body.starts_with("Service Unavailable"), "{}", body);
}

#[tokio::test]
async fn test_oversized_body_rejected() {
    let backend = backend_replying("unused").await;
    let mut settings = test_settings();
    settings.proxy.max_body_bytes = Some(8);
    let app = app_with(settings, &[backend.address().port()]);

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/completions")
                .body(Body::from("this body is too long"))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert!(backend.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_event_stream_relayed_before_backend_completes() {
    let release = Arc::new(Notify::new());
    let port = spawn_sse_backend(release.clone()).await;
    let app = app_with(test_settings(), &[port]);

    let response = app.oneshot(chat_request()).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "text/event-stream"
    );

    let mut stream = response.into_body().into_data_stream();

    // The backend is still holding the rest of its body at this point
    let first = tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .expect("first chunk should arrive before the backend finishes")
        .unwrap()
        .unwrap();
    assert_eq!(first, Bytes::from("data: one\n\n"));

    release.notify_one();

    let mut rest = Vec::new();
    while let Some(chunk) = tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .unwrap()
    {
        rest.extend_from_slice(&chunk.unwrap());
    }

    assert_eq!(rest, b"data: two\n\ndata: three\n\n");
}

#[tokio::test]
async fn test_backend_failure_mid_stream_ends_client_body_with_error() {
    let release = Arc::new(Notify::new());
    let port = spawn_interrupted_backend(release.clone()).await;
    let app = app_with(test_settings(), &[port]);

    let response = app.oneshot(chat_request()).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let mut stream = response.into_body().into_data_stream();
    let first = tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(first, Bytes::from("data: one\n\n"));

    release.notify_one();

    let next = tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .expect("body should end instead of hanging");
    assert!(matches!(next, Some(Err(_))), "{:?}", next);
}

#[tokio::test]
async fn test_client_disconnect_closes_backend_stream() {
    let client_gone = Arc::new(Notify::new());
    let port = spawn_heartbeat_backend(client_gone.clone()).await;
    let app = app_with(test_settings(), &[port]);

    let response = app.oneshot(chat_request()).await.unwrap();
    let mut stream = response.into_body().into_data_stream();

    let first = tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(first.starts_with(b"data: one"));

    drop(stream);

    tokio::time::timeout(Duration::from_secs(5), client_gone.notified())
        .await
        .expect("backend should see the connection close");
}
