//! End-to-end stream behaviour: publish/subscribe ordering, the monotonic
//! timestamp invariant, file persistence round-trips, and the HTTP surface.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use tokio_stream::StreamExt;
use tower::ServiceExt;

use karl::stream::http::{STREAM_SIZE_HEADER, SUBSCRIPTION_ID_HEADER, stream_router};
use karl::stream::Persister;
use karl::test_harness::{TestClock, entry_collector};
use karl::time::wall_clock;
use karl::{Entry, IdxTs, Stream, StreamError};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

#[test]
fn basic_publish_subscribe() {
    let stream = Stream::<String>::memory(wall_clock());
    let (collector, entries) = entry_collector::<String>();
    let scope = stream.subscribe(collector).unwrap();

    stream.publish_at("A".to_string(), 100).unwrap();
    stream.publish_at("B".to_string(), 200).unwrap();
    stream.publish_at("C".to_string(), 300).unwrap();

    let seen: Vec<Entry<String>> = (0..3)
        .map(|_| entries.recv_timeout(RECV_TIMEOUT).unwrap())
        .collect();
    drop(scope);

    assert_eq!(
        seen,
        vec![
            Entry { index: 1, us: 100, entry: "A".to_string() },
            Entry { index: 2, us: 200, entry: "B".to_string() },
            Entry { index: 3, us: 300, entry: "C".to_string() },
        ]
    );
}

#[test]
fn non_monotonic_timestamp_is_refused() {
    let stream = Stream::<String>::memory(wall_clock());
    stream.publish_at("X".to_string(), 500).unwrap();
    let err = stream.publish_at("Y".to_string(), 400).unwrap_err();
    assert!(matches!(err, StreamError::Persist(_)));
    assert_eq!(stream.size(), 1);
}

#[test]
fn file_backed_stream_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("f");

    {
        let stream = Stream::<String>::file(&path, wall_clock()).unwrap();
        stream.publish_at("one".to_string(), 10).unwrap();
        stream.publish_at("two".to_string(), 20).unwrap();
        stream.publish_at("three".to_string(), 30).unwrap();
    }

    let reopened = Stream::<String>::file(&path, wall_clock()).unwrap();
    assert_eq!(reopened.size(), 3);
    assert_eq!(
        reopened.last_published(),
        Some(IdxTs { index: 3, us: 30 })
    );

    let replayed: Vec<Entry<String>> = reopened
        .with_persister_read(|p| p.iterate_all().collect::<Result<Vec<_>, _>>())
        .unwrap();
    assert_eq!(
        replayed,
        vec![
            Entry { index: 1, us: 10, entry: "one".to_string() },
            Entry { index: 2, us: 20, entry: "two".to_string() },
            Entry { index: 3, us: 30, entry: "three".to_string() },
        ]
    );
}

#[test]
fn sequential_publishes_get_dense_indices_and_increasing_timestamps() {
    let stream = Stream::<u64>::memory(Arc::new(TestClock::new(7)));
    let first = stream.publish(1).unwrap();
    let second = stream.publish(2).unwrap();
    assert_eq!(first.index + 1, second.index);
    assert!(first.us < second.us);
}

#[test]
fn concurrent_publishers_are_serialised_without_loss() {
    let stream = Stream::<u64>::memory(wall_clock());
    std::thread::scope(|scope| {
        for worker in 0..4u64 {
            let stream = &stream;
            scope.spawn(move || {
                for i in 0..100 {
                    stream.publish(worker * 1000 + i).unwrap();
                }
            });
        }
    });
    assert_eq!(stream.size(), 400);

    let entries: Vec<Entry<u64>> = stream
        .with_persister_read(|p| p.iterate_all().collect::<Result<Vec<_>, _>>())
        .unwrap();
    for (position, entry) in entries.iter().enumerate() {
        assert_eq!(entry.index, position as u64 + 1);
    }
    for pair in entries.windows(2) {
        assert!(pair[0].us < pair[1].us);
    }
}

async fn body_text(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
        .await
        .unwrap();
    String::from_utf8_lossy(&bytes).into_owned()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn sizeonly_and_head_report_the_count() {
    let stream = Stream::<String>::memory(wall_clock());
    stream.publish_at("a".to_string(), 1).unwrap();
    stream.publish_at("b".to_string(), 2).unwrap();
    let app = stream_router(stream.handle());

    let response = app.clone().oneshot(get("/?sizeonly")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "2\n");

    let head = Request::builder()
        .method("HEAD")
        .uri("/")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(head).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[STREAM_SIZE_HEADER].to_str().unwrap(),
        "2"
    );
    assert_eq!(body_text(response).await, "");
}

#[tokio::test]
async fn nowait_on_an_empty_stream_returns_immediately() {
    let stream = Stream::<String>::memory(wall_clock());
    let app = stream_router(stream.handle());
    let response = app.oneshot(get("/?nowait")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "");
}

async fn read_frames(body: &mut axum::body::BodyDataStream, buffer: &mut String, lines: usize) {
    while buffer.lines().count() < lines {
        let chunk = body.next().await.expect("body ended early").unwrap();
        buffer.push_str(&String::from_utf8_lossy(&chunk));
    }
}

#[tokio::test]
async fn nowait_on_a_non_empty_stream_subscribes_indefinitely() {
    let stream = Stream::<String>::memory(wall_clock());
    stream.publish_at("first".to_string(), 1).unwrap();
    stream.publish_at("second".to_string(), 2).unwrap();
    let app = stream_router(stream.handle());

    let response = app.clone().oneshot(get("/?nowait")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let id = response.headers()[SUBSCRIPTION_ID_HEADER]
        .to_str()
        .unwrap()
        .to_string();

    let mut body = response.into_body().into_data_stream();
    let mut buffer = String::new();
    read_frames(&mut body, &mut buffer, 2).await;
    let backlog: Vec<Entry<String>> = buffer
        .lines()
        .take(2)
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(backlog[0].entry, "first");
    assert_eq!(backlog[1].entry, "second");

    // The subscription outlives the pre-subscribe backlog.
    stream.publish_at("third".to_string(), 3).unwrap();
    read_frames(&mut body, &mut buffer, 3).await;
    let third: Entry<String> =
        serde_json::from_str(buffer.lines().nth(2).unwrap()).unwrap();
    assert_eq!(third.entry, "third");

    // Only out-of-band termination ends it.
    let response = app
        .clone()
        .oneshot(get(&format!("/?terminate={id}")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    while let Some(chunk) = body.next().await {
        chunk.unwrap();
    }
}

#[tokio::test]
async fn schema_endpoints_advertise_the_entry_type() {
    let stream = Stream::<String>::memory(wall_clock());
    let app = stream_router(stream.handle());

    let response = app.clone().oneshot(get("/?schema")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let schema: serde_json::Value =
        serde_json::from_str(&body_text(response).await).unwrap();
    assert_eq!(schema["type_name"], "String");

    let response = app.clone().oneshot(get("/schema.rust")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "String");

    let response = app.clone().oneshot(get("/schema.cobol")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let error: serde_json::Value =
        serde_json::from_str(&body_text(response).await).unwrap();
    assert_eq!(error["unsupported_format_requested"], "cobol");
}

#[tokio::test]
async fn terminating_an_unknown_subscription_is_404() {
    let stream = Stream::<String>::memory(wall_clock());
    let app = stream_router(stream.handle());
    let response = app.oneshot(get("/?terminate=nope")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn endpoints_fail_closed_once_the_stream_is_gone() {
    let stream = Stream::<String>::memory(wall_clock());
    let app = stream_router(stream.handle());
    drop(stream);
    let response = app.oneshot(get("/?sizeonly")).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn disallowed_methods_are_rejected() {
    let stream = Stream::<String>::memory(wall_clock());
    let app = stream_router(stream.handle());
    let request = Request::builder()
        .method("POST")
        .uri("/")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
}
