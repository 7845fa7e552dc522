//! HTTP surface: pod lookup, liveness and readiness.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, Request, State};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{on, MethodFilter};
use axum::{Json, Router};
use podindex_api::{Health, PodApi, Readiness};
use podindex_core::PodRecord;
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::auth::{require_basic_auth, BasicAuth};
use crate::error::HttpError;

pub type SharedApi = Arc<dyn PodApi>;

#[derive(Serialize)]
struct HealthBody {
    status: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ReadyBody {
    status: &'static str,
    pod_count: usize,
}

async fn get_pod(
    State(api): State<SharedApi>,
    params: Result<Query<Vec<(String, String)>>, QueryRejection>,
) -> Result<Json<Arc<PodRecord>>, HttpError> {
    // first `uid` wins when repeated; an unparseable query counts as a missing uid
    let uid = params
        .ok()
        .and_then(|Query(pairs)| pairs.into_iter().find(|(k, _)| k == "uid").map(|(_, v)| v))
        .unwrap_or_default();
    Ok(Json(api.lookup_by_id(&uid)?))
}

async fn health(State(api): State<SharedApi>) -> Json<HealthBody> {
    match api.liveness() {
        Health::Healthy => Json(HealthBody { status: "healthy" }),
    }
}

async fn ready(State(api): State<SharedApi>) -> Result<Json<ReadyBody>, HttpError> {
    match api.readiness() {
        Readiness::Ready { pod_count } => Ok(Json(ReadyBody { status: "ready", pod_count })),
        Readiness::NotReady => Err(HttpError::NotReady),
    }
}

async fn method_not_allowed() -> HttpError { HttpError::MethodNotAllowed }

async fn not_found() -> HttpError { HttpError::RouteNotFound }

/// Answer 408 when the inner service takes longer than `limit`.
pub async fn enforce_timeout(State(limit): State<Duration>, req: Request, next: Next) -> Response {
    let path = req.uri().path().to_string();
    match tokio::time::timeout(limit, next.run(req)).await {
        Ok(resp) => resp,
        Err(_) => {
            warn!(path = %path, timeout_ms = limit.as_millis() as u64, "request timed out");
            HttpError::Timeout.into_response()
        }
    }
}

/// Build the service router.
///
/// Routes accept GET only; HEAD and everything else fall through to 405. The credential
/// gate is layered on the lookup route's method router, so it also covers that route's
/// 405 fallback: a wrong method without credentials gets 401.
pub fn router(api: SharedApi, auth: BasicAuth, request_timeout: Duration) -> Router {
    let lookup = on(MethodFilter::GET, get_pod)
        .fallback(method_not_allowed)
        .layer(middleware::from_fn_with_state(auth, require_basic_auth));

    Router::new()
        .route("/api/v1/pod", lookup)
        .route("/health", on(MethodFilter::GET, health).fallback(method_not_allowed))
        .route("/ready", on(MethodFilter::GET, ready).fallback(method_not_allowed))
        .fallback(not_found)
        .layer(middleware::from_fn_with_state(request_timeout, enforce_timeout))
        .layer(TraceLayer::new_for_http())
        .with_state(api)
}
