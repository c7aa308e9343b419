//! HTTP transport.
//!
//! Every request falls through to a single handler that picks the project,
//! hands the request to the [`MockEngine`] and writes back what it rendered.

use crate::engine::{DispatchError, MockEngine, MockRequest, MockResponse};
use crate::matcher::percent_decode;
use crate::store::StoreError;
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::time::Instant;
use tracing::{info, warn};

/// Shared state of the HTTP handler.
pub struct AppState {
    pub engine: MockEngine,
    /// When set, every request goes to this project and the full path is
    /// matched against its rules.
    pub project: Option<String>,
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

/// Build the router serving mock responses.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new().fallback(handle_request).with_state(state)
}

/// Serve until `shutdown` completes.
pub async fn serve(
    listener: TcpListener,
    state: Arc<AppState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("Mock server listening on http://{}", addr);
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn handle_request(
    State(state): State<Arc<AppState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let arrival = Instant::now();

    let (project, path) = match &state.project {
        Some(project) => (project.clone(), uri.path().to_string()),
        None => match split_project(uri.path()) {
            Some(split) => split,
            None => {
                return error_response(
                    StatusCode::NOT_FOUND,
                    "not_found",
                    "Request path does not name a project".to_string(),
                )
            }
        },
    };

    let request = MockRequest {
        method: method.as_str().to_string(),
        path,
        query: uri.query().map(str::to_string),
        headers: headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_string(), value.to_string()))
            })
            .collect(),
        body: body.to_vec(),
    };

    match state.engine.dispatch(&project, &request, arrival).await {
        Ok(response) => into_http(response),
        Err(e) => dispatch_error_response(&e),
    }
}

/// `/shop/users/1` names project `shop` and rule path `/users/1`.
fn split_project(path: &str) -> Option<(String, String)> {
    let rest = path.strip_prefix('/').unwrap_or(path);
    let (project, remainder) = match rest.split_once('/') {
        Some((project, remainder)) => (project, format!("/{}", remainder)),
        None => (rest, "/".to_string()),
    };
    if project.is_empty() {
        return None;
    }
    Some((percent_decode(project), remainder))
}

fn into_http(mock: MockResponse) -> Response {
    let mut builder = Response::builder();
    if let Some(content_type) = &mock.content_type {
        match HeaderValue::from_str(content_type) {
            Ok(value) => builder = builder.header(header::CONTENT_TYPE, value),
            Err(_) => warn!(content_type = %content_type, "Dropping invalid content type"),
        }
    }
    builder = builder.status(mock.status);

    for (name, value) in &mock.headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => builder = builder.header(name, value),
            _ => warn!(header = %name, "Dropping invalid response header"),
        }
    }
    for cookie in &mock.cookies {
        match HeaderValue::from_str(cookie) {
            Ok(value) => builder = builder.header(header::SET_COOKIE, value),
            Err(_) => warn!(cookie = %cookie, "Dropping invalid cookie"),
        }
    }

    let body = mock.body.map(Body::from).unwrap_or_else(Body::empty);
    builder.body(body).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to build response");
        StatusCode::INTERNAL_SERVER_ERROR.into_response()
    })
}

fn dispatch_error_response(error: &DispatchError) -> Response {
    match error {
        e if e.is_not_found() => error_response(StatusCode::NOT_FOUND, "not_found", e.to_string()),
        DispatchError::Store(StoreError::Load(message)) => error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "unavailable",
            format!("Rules failed to load: {}", message),
        ),
        e => error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal", e.to_string()),
    }
}

fn error_response(status: StatusCode, error: &'static str, message: String) -> Response {
    (status, Json(ErrorBody { error, message })).into_response()
}
