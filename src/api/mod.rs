use std::sync::Arc;

use axum::{
    async_trait,
    extract::{FromRequestParts, Request, State},
    http::{request::Parts, StatusCode, Uri},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use subtle::ConstantTimeEq;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::errors::ApprovalError;
use crate::middleware::rbac::{Actor, Role};
use crate::AppState;

pub mod handlers;

pub const ACTOR_ID_HEADER: &str = "x-actor-id";
pub const ACTOR_NAME_HEADER: &str = "x-actor-name";
pub const ACTOR_ROLE_HEADER: &str = "x-actor-role";

/// The full HTTP application: health probe plus the API under `/api/v1`.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .nest("/api/v1", api_router(state.clone()))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Build the approvals API router.
/// All routes are relative; the caller mounts this under `/api/v1`.
pub fn api_router(state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/requests", post(handlers::create_request))
        .route("/requests/pending", get(handlers::list_pending_requests))
        .route("/requests/mine", get(handlers::list_my_requests))
        .route("/requests/expire", post(handlers::expire_old_requests))
        .route("/requests/:id", get(handlers::get_request))
        .route("/requests/:id/approve", post(handlers::approve_request))
        .route("/requests/:id/reject", post(handlers::reject_request))
        .route("/requests/:id/cancel", post(handlers::cancel_request))
        .route("/requests/:id/execute", post(handlers::execute_request))
        .route("/policies", get(handlers::list_policies))
        .route("/history", get(handlers::get_approval_history))
        .route("/stats", get(handlers::get_approval_stats))
        .layer(middleware::from_fn_with_state(state, api_key_auth))
        .layer(TraceLayer::new_for_http())
        .fallback(fallback_404)
}

async fn fallback_404(uri: Uri) -> ApprovalError {
    ApprovalError::NotFound(format!("no route for {}", uri.path()))
}

fn unauthorized(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({
            "error": {
                "message": message,
                "type": "authentication_error",
                "code": "unauthorized",
            }
        })),
    )
        .into_response()
}

/// Middleware: validates `X-Api-Key` (or a bearer token) against the
/// configured key. A server without a key skips the check.
async fn api_key_auth(State(state): State<Arc<AppState>>, req: Request, next: Next) -> Response {
    let Some(expected) = state.api_key.as_deref() else {
        return next.run(req).await;
    };

    let provided_key = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .or_else(|| {
            req.headers()
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
                .map(|t| t.trim())
        });

    match provided_key {
        Some(k) if bool::from(k.as_bytes().ct_eq(expected.as_bytes())) => next.run(req).await,
        Some(_) => {
            // Never log either key.
            tracing::warn!("approvals API: invalid api key");
            unauthorized("invalid api key")
        }
        None => {
            tracing::warn!("approvals API: missing X-Api-Key header");
            unauthorized("missing api key")
        }
    }
}

/// Actor identity asserted by the authenticating proxy in front of us.
pub struct CurrentActor(pub Actor);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for CurrentActor {
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
        };

        let Some(id) = header(ACTOR_ID_HEADER) else {
            return Err(unauthorized("missing X-Actor-Id header"));
        };
        let Some(role) = header(ACTOR_ROLE_HEADER) else {
            return Err(unauthorized("missing X-Actor-Role header"));
        };
        let name = header(ACTOR_NAME_HEADER).unwrap_or(id);

        let role = Role::parse(role);
        if role == Role::System {
            // The sweep's identity is never accepted from outside.
            return Err(unauthorized("reserved actor role"));
        }

        Ok(CurrentActor(Actor::new(id, name, role)))
    }
}
