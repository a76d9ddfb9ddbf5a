//! The orchestrator's HTTP surface: keepalive ingest, status, build and
//! snapshot lookups. Routers are explicit values; the launcher decides where
//! they mount and owns the listener.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::body::to_bytes;
use axum::extract::{ConnectInfo, Path, RawQuery, Request, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use rand::Rng;

use super::KarlInner;
use super::ingest::{self, IngestError};
use super::schema::{ErrorResponse, SnapshotOfKeepalive};
use super::status::{self, ResponseFormat};
use crate::query::parse_query;
use crate::stream::Persister;
use crate::sync_util::lock;

const MAX_BODY_BYTES: usize = 1 << 20;

/// 1x1 transparent PNG.
const FAVICON_PNG: &[u8] = &[
    0x89, 0x50, 0x4e, 0x47, 0x0d, 0x0a, 0x1a, 0x0a, 0x00, 0x00, 0x00, 0x0d, 0x49, 0x48, 0x44,
    0x52, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00, 0x1f,
    0x15, 0xc4, 0x89, 0x00, 0x00, 0x00, 0x0a, 0x49, 0x44, 0x41, 0x54, 0x78, 0x9c, 0x63, 0x00,
    0x01, 0x00, 0x00, 0x05, 0x00, 0x01, 0x0d, 0x0a, 0x2d, 0xb4, 0x00, 0x00, 0x00, 0x00, 0x49,
    0x45, 0x4e, 0x44, 0xae, 0x42, 0x60, 0x82,
];

pub(crate) fn build_router(inner: Arc<KarlInner>) -> Router {
    let routes = Router::new()
        .route(
            "/",
            get(serve_status).post(serve_keepalive).delete(serve_deregister),
        )
        .route("/build/{codename}", get(serve_build))
        .route("/snapshot/{codename}", get(serve_snapshot))
        .route("/favicon.png", get(serve_favicon))
        .with_state(inner.clone());

    let prefix = inner.params.url.trim_end_matches('/');
    if prefix.is_empty() {
        routes
    } else {
        Router::new().nest(prefix, routes)
    }
}

fn text(status: StatusCode, body: impl Into<String>) -> Response {
    (status, body.into()).into_response()
}

fn json_response<T: serde::Serialize>(status: StatusCode, value: &T) -> Response {
    match serde_json::to_string(value) {
        Ok(body) => (
            status,
            [(header::CONTENT_TYPE, "application/json")],
            body,
        )
            .into_response(),
        Err(err) => text(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

async fn serve_favicon() -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "image/png")],
        FAVICON_PNG,
    )
        .into_response()
}

async fn serve_status(
    State(inner): State<Arc<KarlInner>>,
    RawQuery(raw_query): RawQuery,
    headers: HeaderMap,
) -> Response {
    let query = parse_query(raw_query.as_deref().unwrap_or(""));
    let accept = headers
        .get(header::ACCEPT)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let parsed = status::parse_status_query(&query, accept.as_deref(), inner.clock.now_us());

    let worker = inner.clone();
    let status_query = parsed.clone();
    let report = match tokio::task::spawn_blocking(move || {
        status::build_status(&worker, &status_query)
    })
    .await
    {
        Ok(report) => report,
        Err(err) => {
            tracing::error!(error = %err, "status aggregation panicked");
            return text(StatusCode::INTERNAL_SERVER_ERROR, "Karl status error.\n");
        }
    };

    match parsed.format {
        ResponseFormat::JsonFull => match serde_json::to_string_pretty(&report) {
            Ok(body) => (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "application/json")],
                body,
            )
                .into_response(),
            Err(err) => text(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
        },
        ResponseFormat::JsonMinimal => json_response(StatusCode::OK, &report),
        ResponseFormat::Dot => text(
            StatusCode::OK,
            inner
                .renderer
                .as_dot(&report, &inner.params.svg_name, &inner.params.github_repo_url),
        ),
        ResponseFormat::Html => {
            let svg = inner.renderer.as_svg(
                &report,
                &inner.params.svg_name,
                &inner.params.github_repo_url,
            );
            (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "text/html")],
                format!(
                    "<!doctype html>\
                     <head><link rel='icon' href='./favicon.png'></head>\
                     <body>{svg}</body>"
                ),
            )
                .into_response()
        }
    }
}

async fn serve_keepalive(State(inner): State<Arc<KarlInner>>, request: Request) -> Response {
    let remote_ip = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip().to_string())
        .unwrap_or_else(|| "127.0.0.1".to_string());
    let query = parse_query(request.uri().query().unwrap_or(""));

    let body = match to_bytes(request.into_body(), MAX_BODY_BYTES).await {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(_) => return text(StatusCode::BAD_REQUEST, "Unreadable body.\n"),
    };

    // With `confirm` + `port`, fetch the status page back from the reporting
    // machine instead of trusting the inline body: proves reverse
    // reachability before the service is registered.
    let json = if query.contains_key("confirm") && query.contains_key("port") {
        let port = query.get("port").cloned().unwrap_or_default();
        let rnd: u32 = rand::thread_rng().gen_range(1_000_000_000..2_000_000_000);
        let url = format!("http://{remote_ip}:{port}/.current?all&rnd={rnd}");
        let fetched = match reqwest::get(&url).await {
            Ok(response) => response.text().await.map_err(|err| err.to_string()),
            Err(err) => Err(err.to_string()),
        };
        match fetched {
            Ok(body) => body,
            Err(reason) => {
                tracing::warn!(ip = %remote_ip, port = %port, %reason, "confirmation callback failed");
                return ingest_error_response(IngestError::Callback { reason });
            }
        }
    } else {
        body
    };

    let codename_hint = query.get("codename").cloned();
    let port_hint = query.get("port").cloned();
    let worker = inner.clone();
    let outcome = tokio::task::spawn_blocking(move || {
        ingest::process_keepalive(
            &worker,
            &remote_ip,
            codename_hint.as_deref(),
            port_hint.as_deref(),
            &json,
        )
    })
    .await;

    match outcome {
        Ok(Ok(())) => text(StatusCode::OK, "OK\n"),
        Ok(Err(err)) => ingest_error_response(err),
        Err(join_err) => {
            tracing::error!(error = %join_err, "keepalive ingest panicked");
            text(StatusCode::INTERNAL_SERVER_ERROR, "Karl registration error.\n")
        }
    }
}

fn ingest_error_response(err: IngestError) -> Response {
    match err {
        IngestError::Json(_) => text(StatusCode::BAD_REQUEST, "JSON parse error.\n"),
        IngestError::InconsistentParameters => {
            text(StatusCode::BAD_REQUEST, "Inconsistent URL/body parameters.\n")
        }
        IngestError::Callback { .. } => text(StatusCode::BAD_REQUEST, "Callback error.\n"),
        IngestError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE.into_response(),
        IngestError::Store(err) => {
            tracing::error!(error = %err, "keepalive store transaction failed");
            text(StatusCode::INTERNAL_SERVER_ERROR, "Karl registration error.\n")
        }
        IngestError::Stream(err) => {
            tracing::error!(error = %err, "keepalive publish failed");
            text(StatusCode::INTERNAL_SERVER_ERROR, "Karl registration error.\n")
        }
    }
}

async fn serve_deregister(
    State(inner): State<Arc<KarlInner>>,
    RawQuery(raw_query): RawQuery,
) -> Response {
    let query = parse_query(raw_query.as_deref().unwrap_or(""));
    let Some(codename) = query.get("codename").cloned() else {
        return text(StatusCode::OK, "NOP\n");
    };
    let worker = inner.clone();
    let outcome =
        tokio::task::spawn_blocking(move || ingest::deregister(&worker, &codename)).await;
    match outcome {
        Ok(Ok(())) => text(StatusCode::OK, "OK\n"),
        Ok(Err(err)) => {
            tracing::error!(error = %err, "deregistration failed");
            text(StatusCode::INTERNAL_SERVER_ERROR, "Karl deregistration error.\n")
        }
        Err(join_err) => {
            tracing::error!(error = %join_err, "deregistration panicked");
            text(StatusCode::INTERNAL_SERVER_ERROR, "Karl deregistration error.\n")
        }
    }
}

async fn serve_build(
    State(inner): State<Arc<KarlInner>>,
    Path(codename): Path<String>,
) -> Response {
    let build = inner
        .store
        .read_only(|fields| fields.builds.get(&codename).cloned());
    match build {
        Some(build) => json_response(StatusCode::OK, &build),
        None => json_response(
            StatusCode::NOT_FOUND,
            &ErrorResponse::new(format!("Codename '{codename}' not found.")),
        ),
    }
}

async fn serve_snapshot(
    State(inner): State<Arc<KarlInner>>,
    Path(codename): Path<String>,
    RawQuery(raw_query): RawQuery,
) -> Response {
    let query = parse_query(raw_query.as_deref().unwrap_or(""));
    let nobuild = query.contains_key("nobuild");
    let worker = inner.clone();
    let lookup = codename.clone();
    let outcome =
        tokio::task::spawn_blocking(move || snapshot_of(&worker, &lookup, nobuild)).await;
    match outcome {
        Ok(Some(snapshot)) => json_response(StatusCode::OK, &snapshot),
        Ok(None) => json_response(
            StatusCode::NOT_FOUND,
            &ErrorResponse::new(format!(
                "No keepalives from '{codename}' have been received."
            )),
        ),
        Err(join_err) => {
            tracing::error!(error = %join_err, "snapshot lookup panicked");
            text(StatusCode::INTERNAL_SERVER_ERROR, "Karl snapshot error.\n")
        }
    }
}

/// The latest persisted keepalive of one codename, served from the index
/// cache with a full-log scan fallback.
fn snapshot_of(inner: &KarlInner, codename: &str, nobuild: bool) -> Option<SnapshotOfKeepalive> {
    let cached = {
        let latest = lock(&inner.latest_keepalive_index);
        latest.get(codename).copied().unwrap_or(0)
    };
    let index = if cached != 0 {
        cached
    } else {
        let found = inner.keepalives.with_persister_read(|persister| {
            let mut found = 0;
            for entry in persister.iterate_all() {
                if let Ok(entry) = entry
                    && entry.entry.keepalive.status.codename == codename
                {
                    found = entry.index;
                }
            }
            found
        });
        if found != 0 {
            let mut latest = lock(&inner.latest_keepalive_index);
            let slot = latest.entry(codename.to_string()).or_insert(0);
            *slot = (*slot).max(found);
        }
        found
    };
    if index == 0 {
        return None;
    }

    let entry = inner
        .keepalives
        .with_persister_read(|persister| persister.iterate(index - 1, index).next())?
        .ok()?;
    let mut keepalive = entry.entry.keepalive;
    if nobuild {
        keepalive.status.build = None;
    }
    Some(SnapshotOfKeepalive {
        age_us: entry.us as i64 - inner.clock.now_us() as i64,
        keepalive,
    })
}
