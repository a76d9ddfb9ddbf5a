//! HTTP surface of a stream: chunked subscriptions, size probes, schema.
//!
//! The router holds a weak [`StreamHandle`]; once the stream is dropped every
//! endpoint answers `503`. Chunked subscribers are ordinary stream
//! subscribers whose worker threads feed a bounded channel drained by the
//! response body.

use std::convert::Infallible;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::{Path, RawQuery, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use super::{
    Entry, EntryResponse, IdxTs, SchemaFormatNotFound, StreamCore, StreamEntry, StreamError,
    StreamHandle, StreamSubscriber, TerminationResponse,
};
use crate::query::parse_query;

/// Header carrying the stream size on `HEAD` and subscription responses.
pub const STREAM_SIZE_HEADER: &str = "x-current-stream-size";
/// Header carrying the id a chunked subscription can be terminated with.
pub const SUBSCRIPTION_ID_HEADER: &str = "x-stream-subscription-id";

/// Builds the router serving one stream, mountable wherever the owner wants.
pub fn stream_router<E: StreamEntry>(handle: StreamHandle<E>) -> Router {
    Router::new()
        .route("/", get(serve_get::<E>).head(serve_head::<E>))
        .route("/schema.{language}", get(serve_schema_path::<E>))
        .with_state(handle)
}

async fn serve_head<E: StreamEntry>(State(handle): State<StreamHandle<E>>) -> Response {
    let Some(core) = handle.upgrade() else {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    };
    (
        StatusCode::OK,
        [(STREAM_SIZE_HEADER, core.size().to_string())],
    )
        .into_response()
}

async fn serve_schema_path<E: StreamEntry>(
    State(handle): State<StreamHandle<E>>,
    Path(language): Path<String>,
) -> Response {
    let Some(core) = handle.upgrade() else {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    };
    schema_response(&core, &language)
}

async fn serve_get<E: StreamEntry>(
    State(handle): State<StreamHandle<E>>,
    RawQuery(raw_query): RawQuery,
) -> Response {
    let Some(core) = handle.upgrade() else {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    };
    let query = parse_query(raw_query.as_deref().unwrap_or(""));

    if let Some(id) = query.get("terminate") {
        let target = Arc::clone(&core);
        let id = id.clone();
        let found = tokio::task::spawn_blocking(move || target.terminate_http_subscription(&id))
            .await
            .unwrap_or(false);
        return if found {
            StatusCode::OK.into_response()
        } else {
            StatusCode::NOT_FOUND.into_response()
        };
    }

    if let Some(language) = query.get("schema") {
        return if language.is_empty() {
            json_ok(core.schema())
        } else {
            schema_response(&core, language)
        };
    }

    let count = core.size();
    if query.contains_key("sizeonly") {
        return (StatusCode::OK, format!("{count}\n")).into_response();
    }
    if count == 0 && query.contains_key("nowait") {
        return StatusCode::OK.into_response();
    }

    subscribe_chunked(&core)
}

fn schema_response<E: StreamEntry>(core: &Arc<StreamCore<E>>, language: &str) -> Response {
    match core.schema().for_language(language) {
        Some(description) => (StatusCode::OK, description.to_string()).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            [(header::CONTENT_TYPE, "application/json")],
            serde_json::to_string(&SchemaFormatNotFound::new(language)).unwrap_or_default(),
        )
            .into_response(),
    }
}

fn json_ok<T: serde::Serialize>(value: &T) -> Response {
    match serde_json::to_string(value) {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            body,
        )
            .into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    }
}

/// Streams one framed JSON entry per chunk into the response body.
struct ChunkedSubscriber {
    tx: tokio::sync::mpsc::Sender<String>,
}

impl<E: StreamEntry> StreamSubscriber<E> for ChunkedSubscriber {
    fn on_entry(&mut self, entry: Entry<E>, _last: IdxTs) -> EntryResponse {
        let frame = match serde_json::to_string(&entry) {
            Ok(json) => json + "\n",
            Err(err) => {
                tracing::warn!(error = %err, "dropping unencodable stream entry");
                return EntryResponse::More;
            }
        };
        if self.tx.blocking_send(frame).is_err() {
            // The HTTP client went away.
            return EntryResponse::Done;
        }
        EntryResponse::More
    }

    fn on_terminate(&mut self) -> TerminationResponse {
        TerminationResponse::Terminate
    }
}

fn subscribe_chunked<E: StreamEntry>(core: &Arc<StreamCore<E>>) -> Response {
    let id = Uuid::new_v4().simple().to_string();
    let count = core.size();
    let (tx, rx) = tokio::sync::mpsc::channel::<String>(64);
    let subscriber = ChunkedSubscriber { tx };

    // Completion removes the registration from inside the worker's own
    // done-callback, under the subscription map mutex.
    let done_core = Arc::downgrade(core);
    let done_id = id.clone();
    let scope = core.subscribe_impl(
        subscriber,
        Some(Box::new(move || {
            if let Some(core) = done_core.upgrade() {
                core.terminate_http_subscription(&done_id);
            }
        })),
    );

    match scope {
        Ok(scope) => {
            core.register_http_subscription(id.clone(), scope);
            let body = Body::from_stream(
                ReceiverStream::new(rx).map(Ok::<String, Infallible>),
            );
            Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "application/json")
                .header(STREAM_SIZE_HEADER, count.to_string())
                .header(SUBSCRIPTION_ID_HEADER, id)
                .body(body)
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
        Err(StreamError::ShuttingDown) => StatusCode::SERVICE_UNAVAILABLE.into_response(),
        Err(err) => {
            tracing::error!(error = %err, "chunked subscription failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
