use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{HeaderMap, HeaderName, HeaderValue, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde_json::json;
use std::{net::SocketAddr, sync::Arc};
use tracing::{error, warn};

use crate::{
    cache::CacheService,
    config::Settings,
    limiter::{AdmissionDecision, AdmissionService},
    metrics::Metrics,
    store::StoreClient,
    utils::{client_identity, format_deadline},
};

pub const HEADER_LIMIT: &str = "x-ratelimit-limit";
pub const HEADER_REMAINING: &str = "x-ratelimit-remaining";
pub const HEADER_RESET: &str = "x-ratelimit-reset";

/// Shared handles for request handlers
#[derive(Clone)]
pub struct AppState {
    pub store: StoreClient,
    pub cache: Arc<CacheService>,
    pub admission: Arc<AdmissionService>,
    pub metrics: Arc<Metrics>,
}

impl AppState {
    /// Build both services over one store client
    pub fn new(store: StoreClient, settings: &Settings, metrics: Arc<Metrics>) -> Self {
        let cache = CacheService::new(store.clone(), settings.cache.clone(), metrics.clone());
        let admission =
            AdmissionService::new(store.clone(), settings.rate_limit.clone(), metrics.clone());
        Self {
            store,
            cache: Arc::new(cache),
            admission: Arc::new(admission),
            metrics,
        }
    }
}

/// Build the router. Routes under `/api` pass through the admission gate;
/// health, metrics and status inspection do not consume quota. Quota resets
/// are an operator action through [`AdmissionService::reset`] and have no
/// public route.
pub fn router(state: AppState) -> Router {
    let governed = Router::new()
        .route("/api/cache/metrics", get(cache_metrics))
        .route_layer(middleware::from_fn_with_state(state.clone(), admission_gate));

    Router::new()
        .route("/healthcheck", get(health_check))
        .route("/metrics", get(metrics_handler))
        .route("/rate-limit/status", get(rate_limit_status))
        .merge(governed)
        .with_state(state)
}

fn peer_address(req: &Request<Body>) -> Option<SocketAddr> {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr)
}

fn set_header(headers: &mut HeaderMap, name: &'static str, value: String) {
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(HeaderName::from_static(name), value);
    }
}

fn rate_limit_headers(headers: &mut HeaderMap, decision: &AdmissionDecision) {
    set_header(headers, HEADER_LIMIT, decision.limit.to_string());
    set_header(headers, HEADER_REMAINING, decision.remaining.to_string());
    set_header(headers, HEADER_RESET, format_deadline(decision.reset_at));
}

fn rejection(decision: &AdmissionDecision) -> Response {
    let mut body = json!({
        "error": "rate_limit_exceeded",
        "message": "Request limit exceeded. Try again later.",
        "limit": decision.limit,
        "retry_after": decision.retry_after,
    });
    if let Some(until) = decision.banned_until {
        body["banned_until"] = json!(until.to_rfc3339());
    }

    let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    set_header(
        response.headers_mut(),
        "retry-after",
        decision.retry_after.to_string(),
    );
    response
}

/// Admission middleware: consume quota for the caller before the handler
/// runs and short-circuit with 429 when rejected.
pub async fn admission_gate(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let _timer = state.metrics.start_request_timer();
    let identity = client_identity(req.headers(), peer_address(&req));
    let decision = state.admission.check_limit(&identity, false).await;

    let mut response = if decision.allowed {
        next.run(req).await
    } else {
        warn!(
            identity = %identity,
            path = %req.uri().path(),
            retry_after = decision.retry_after,
            "request blocked by rate limiter"
        );
        rejection(&decision)
    };

    rate_limit_headers(response.headers_mut(), &decision);
    response
}

async fn rate_limit_status(State(state): State<AppState>, req: Request<Body>) -> Response {
    let identity = client_identity(req.headers(), peer_address(&req));

    match state.admission.get_status(&identity, false).await {
        Ok(status) => {
            let mut body = json!({
                "ip": identity,
                "limit": status.limit,
                "remaining": status.remaining,
                "reset_at": format_deadline(status.reset_at),
                "is_banned": status.banned_until.is_some(),
            });
            if let Some(until) = status.banned_until {
                body["banned_until"] = json!(until.to_rfc3339());
                body["retry_after"] = json!(status.retry_after);
            }
            Json(body).into_response()
        }
        Err(e) => {
            error!(identity = %identity, error = %e, "failed to read rate limit status");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"error": "store_unavailable"})),
            )
                .into_response()
        }
    }
}

async fn cache_metrics(State(state): State<AppState>) -> Response {
    Json(state.cache.metrics().await).into_response()
}

async fn health_check(State(state): State<AppState>) -> Result<Json<serde_json::Value>, StatusCode> {
    match state.store.health_check().await {
        Ok(()) => Ok(Json(json!({
            "status": "healthy",
            "store": state.store.backend_name(),
            "timestamp": chrono::Utc::now().to_rfc3339()
        }))),
        Err(e) => {
            warn!(error = %e, "health check failed");
            Err(StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}

async fn metrics_handler(State(state): State<AppState>) -> Result<String, StatusCode> {
    state
        .metrics
        .render()
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}
