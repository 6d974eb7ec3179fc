use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{Extensions, HeaderMap, HeaderValue, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use castgate_protocol::{BrokerConfig, OtpResponse};
use serde::Deserialize;
use serde_json::json;
use tower_http::limit::RequestBodyLimitLayer;

use crate::access::{AccessProvider, StaticAccessProvider};
use crate::audit::TracingAuditSink;
use crate::auth;
use crate::broker::{Broker, Requester};
use crate::caster::CasterService;
use crate::directory::SessionDirectory;
use crate::hub::ConnectionHub;
use crate::prejoin::PrejoinQueue;
use crate::signaling;

/// Max size of an HTTP request body or a WebSocket message.
const MAX_MESSAGE_BYTES: usize = 65_536;

/// Shared application state.
pub struct AppState {
    pub config: BrokerConfig,
    pub broker: Arc<Broker>,
    pub casters: Arc<CasterService>,
    pub hub: Arc<ConnectionHub>,
    pub directory: Arc<SessionDirectory>,
    pub access: Arc<StaticAccessProvider>,
    pub jwt_secret: String,
    pub started_at: Instant,
}

impl AppState {
    /// Wire the broker's services together from a loaded config.
    pub fn new(config: BrokerConfig, jwt_secret: String) -> Self {
        let hub = Arc::new(ConnectionHub::new());
        let directory = Arc::new(SessionDirectory::new());
        let prejoin = Arc::new(PrejoinQueue::new());
        let access = Arc::new(StaticAccessProvider::from_config(&config));

        let broker = Broker::new(
            Arc::clone(&directory),
            Arc::clone(&prejoin),
            Arc::clone(&hub),
            access.clone(),
            Arc::new(TracingAuditSink),
            config.remote_control.clone(),
        );
        let casters = CasterService::new(Arc::clone(&directory), prejoin, Arc::clone(&hub));

        Self {
            config,
            broker: Arc::new(broker),
            casters: Arc::new(casters),
            hub,
            directory,
            access,
            jwt_secret,
            started_at: Instant::now(),
        }
    }
}

/// Middleware that adds security headers to every response.
async fn security_headers(
    request: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();

    headers.insert(
        "strict-transport-security",
        HeaderValue::from_static("max-age=63072000; includeSubDomains"),
    );
    headers.insert(
        "x-content-type-options",
        HeaderValue::from_static("nosniff"),
    );
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert("referrer-policy", HeaderValue::from_static("no-referrer"));
    headers.insert(
        "content-security-policy",
        HeaderValue::from_static("default-src 'none'; frame-ancestors 'none'"),
    );

    response
}

/// Build the Axum router with all routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws/viewer", get(viewer_ws_upgrade))
        .route("/ws/caster", get(caster_ws_upgrade))
        .route("/ws/agent", get(agent_ws_upgrade))
        .route("/api/devices/{id}/otp", post(issue_otp))
        .route("/api/sessions", get(list_sessions))
        .route("/api/health", get(health_check))
        .route("/api/health/detailed", get(health_check_detailed))
        .layer(RequestBodyLimitLayer::new(MAX_MESSAGE_BYTES))
        .layer(axum::middleware::from_fn(security_headers))
        .with_state(state)
}

/// Token query parameter, accepted where a header cannot be set (browsers
/// opening a WebSocket).
#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

fn bearer_token<'a>(headers: &'a HeaderMap, query: &'a TokenQuery) -> Option<&'a str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .or(query.token.as_deref())
}

/// Extract and validate JWT from Authorization header or query parameter.
/// Prefers the Authorization header (Bearer token) when available.
fn extract_claims_from_headers(
    headers: &HeaderMap,
    query: &TokenQuery,
    jwt_secret: &str,
) -> Result<auth::Claims, (StatusCode, String)> {
    let token = bearer_token(headers, query)
        .ok_or_else(|| (StatusCode::UNAUTHORIZED, "Missing token".to_string()))?;

    auth::validate_jwt(token, jwt_secret).map_err(|e| {
        tracing::warn!("Invalid JWT: {e}");
        (
            StatusCode::UNAUTHORIZED,
            "Invalid or expired token".to_string(),
        )
    })
}

/// Viewers may connect anonymously. A token that is present must be valid.
fn viewer_requester(
    headers: &HeaderMap,
    query: &TokenQuery,
    extensions: &Extensions,
    jwt_secret: &str,
) -> Result<Requester, (StatusCode, String)> {
    let user_id = match bearer_token(headers, query) {
        Some(_) => Some(extract_claims_from_headers(headers, query, jwt_secret)?.sub),
        None => None,
    };
    let remote_addr = extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    Ok(Requester {
        user_id,
        remote_addr,
    })
}

/// Casters and agents present the shared device token when one is configured.
fn check_device_token(config: &BrokerConfig, query: &TokenQuery) -> Result<(), StatusCode> {
    let Some(expected) = config.server.device_token.as_deref() else {
        return Ok(());
    };
    match query.token.as_deref() {
        Some(t) if auth::constant_time_eq(t.as_bytes(), expected.as_bytes()) => Ok(()),
        _ => Err(StatusCode::UNAUTHORIZED),
    }
}

/// GET /ws/viewer - viewer signaling connection (JWT optional)
async fn viewer_ws_upgrade(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    extensions: Extensions,
    Query(query): Query<TokenQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let requester = match viewer_requester(&headers, &query, &extensions, &state.jwt_secret) {
        Ok(r) => r,
        Err((status, msg)) => return (status, msg).into_response(),
    };

    let broker = Arc::clone(&state.broker);
    let hub = Arc::clone(&state.hub);
    ws.max_message_size(MAX_MESSAGE_BYTES)
        .on_upgrade(move |socket| signaling::handle_viewer_ws(socket, broker, hub, requester))
        .into_response()
}

/// GET /ws/caster - caster connection (device token)
async fn caster_ws_upgrade(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TokenQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    if let Err(status) = check_device_token(&state.config, &query) {
        tracing::warn!("Invalid device token on caster upgrade");
        return (status, "Invalid device token").into_response();
    }

    let casters = Arc::clone(&state.casters);
    let hub = Arc::clone(&state.hub);
    ws.max_message_size(MAX_MESSAGE_BYTES)
        .on_upgrade(move |socket| signaling::handle_caster_ws(socket, casters, hub))
        .into_response()
}

/// GET /ws/agent - service agent connection (device token)
async fn agent_ws_upgrade(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TokenQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    if let Err(status) = check_device_token(&state.config, &query) {
        tracing::warn!("Invalid device token on agent upgrade");
        return (status, "Invalid device token").into_response();
    }

    let hub = Arc::clone(&state.hub);
    ws.max_message_size(MAX_MESSAGE_BYTES)
        .on_upgrade(move |socket| signaling::handle_agent_ws(socket, hub))
        .into_response()
}

/// POST /api/devices/:id/otp - issue a one-time password for unattended
/// access (requires JWT + device access)
async fn issue_otp(
    State(state): State<Arc<AppState>>,
    Path(device_id): Path<String>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
) -> impl IntoResponse {
    let claims = match extract_claims_from_headers(&headers, &query, &state.jwt_secret) {
        Ok(c) => c,
        Err((status, msg)) => {
            return (status, Json(json!({ "error": msg }))).into_response();
        }
    };

    if state.access.device_name(&device_id).is_none() {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "Device not found" })),
        )
            .into_response();
    }

    if !state
        .access
        .user_has_device_access(&device_id, &claims.sub)
        .await
    {
        tracing::warn!(user = %claims.sub, %device_id, "OTP requested without device access");
        return (
            StatusCode::FORBIDDEN,
            Json(json!({ "error": "Access denied" })),
        )
            .into_response();
    }

    let otps = state.access.otps();
    let otp = otps.issue(&device_id);
    tracing::info!(
        target: "audit",
        event = "otp_issued",
        user_id = %claims.sub,
        %device_id,
        "One-time password issued"
    );
    Json(OtpResponse {
        otp,
        expires_in: otps.ttl().as_secs(),
    })
    .into_response()
}

/// GET /api/sessions - requires JWT auth (sessions on the caller's
/// organization's devices)
async fn list_sessions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
) -> impl IntoResponse {
    let claims = match extract_claims_from_headers(&headers, &query, &state.jwt_secret) {
        Ok(c) => c,
        Err((status, msg)) => {
            return (status, Json(json!({ "error": msg }))).into_response();
        }
    };

    let Some(user) = state.access.get_user(&claims.sub).await else {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({ "error": "Unknown user" })),
        )
            .into_response();
    };

    let list: Vec<_> = state
        .directory
        .snapshot()
        .into_iter()
        .filter(|s| {
            state.access.device_organization(&s.device_id) == Some(user.organization_id.as_str())
                || s.organization_id.as_deref() == Some(user.organization_id.as_str())
        })
        .collect();
    Json(list).into_response()
}

/// GET /api/health - liveness for load balancers (no auth, minimal info)
async fn health_check() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// GET /api/health/detailed - requires JWT auth
async fn health_check_detailed(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
) -> impl IntoResponse {
    if let Err((status, msg)) = extract_claims_from_headers(&headers, &query, &state.jwt_secret) {
        return (status, Json(json!({ "error": msg }))).into_response();
    }

    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "sessions": state.directory.len(),
        "connections": state.hub.connection_count(),
    }))
    .into_response()
}
