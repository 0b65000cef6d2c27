use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::CurrentActor;
use crate::errors::ApprovalError;
use crate::middleware::rbac::{enforce, Permission};
use crate::models::analytics::ApprovalStats;
use crate::models::approval::{
    ApprovalRequest, ApprovalStatus, CreatedRequest, DecisionOutcome, Page, PageRequest,
    RequestDetail, RequestFilter,
};
use crate::models::audit::{AuditAction, HistoryFilter, HistoryRow};
use crate::models::policy::ApprovalPolicy;
use crate::AppState;

// ── Request / Response DTOs ──────────────────────────────────

#[derive(Deserialize)]
pub struct CreateRequestBody {
    pub request_type: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub reason: String,
}

#[derive(Deserialize)]
pub struct ApproveBody {
    pub comment: Option<String>,
}

#[derive(Deserialize)]
pub struct RejectBody {
    pub reason: String,
    #[serde(default)]
    pub emergency: bool,
}

#[derive(Deserialize, Default)]
pub struct ListParams {
    pub request_type: Option<String>,
    pub status: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub page: Option<i64>,
    pub per_page: Option<i64>,
}

impl ListParams {
    fn split(self) -> Result<(RequestFilter, PageRequest), ApprovalError> {
        let status = self
            .status
            .as_deref()
            .map(str::parse::<ApprovalStatus>)
            .transpose()
            .map_err(ApprovalError::Validation)?;
        Ok((
            RequestFilter {
                request_type: self.request_type,
                status,
                requester_id: None,
                created_from: self.from,
                created_to: self.to,
            },
            PageRequest::new(self.page, self.per_page),
        ))
    }
}

#[derive(Deserialize, Default)]
pub struct HistoryParams {
    pub request_id: Option<Uuid>,
    pub actor_id: Option<String>,
    pub action: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub page: Option<i64>,
    pub per_page: Option<i64>,
}

#[derive(Deserialize, Default)]
pub struct StatsParams {
    pub period: Option<String>,
}

#[derive(Serialize)]
pub struct ExpireResponse {
    pub expired: u64,
}

fn parse_id(id: &str) -> Result<Uuid, ApprovalError> {
    Uuid::parse_str(id).map_err(|_| {
        tracing::warn!("invalid request id: {}", id);
        ApprovalError::Validation(format!("invalid request id '{}'", id))
    })
}

// ── Commands ─────────────────────────────────────────────────

/// POST /api/v1/requests
pub async fn create_request(
    State(state): State<Arc<AppState>>,
    CurrentActor(actor): CurrentActor,
    Json(body): Json<CreateRequestBody>,
) -> Result<(StatusCode, Json<CreatedRequest>), ApprovalError> {
    let created = state
        .service
        .create_request(&actor, body.request_type.trim(), body.payload, &body.reason)
        .await?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// POST /api/v1/requests/:id/approve
pub async fn approve_request(
    State(state): State<Arc<AppState>>,
    CurrentActor(actor): CurrentActor,
    Path(id): Path<String>,
    body: Option<Json<ApproveBody>>,
) -> Result<Json<DecisionOutcome>, ApprovalError> {
    let id = parse_id(&id)?;
    let comment = body.and_then(|Json(b)| b.comment);
    let outcome = state
        .service
        .approve_request(id, &actor, comment.as_deref())
        .await?;
    Ok(Json(outcome))
}

/// POST /api/v1/requests/:id/reject
pub async fn reject_request(
    State(state): State<Arc<AppState>>,
    CurrentActor(actor): CurrentActor,
    Path(id): Path<String>,
    Json(body): Json<RejectBody>,
) -> Result<Json<DecisionOutcome>, ApprovalError> {
    let id = parse_id(&id)?;
    let outcome = state
        .service
        .reject_request(id, &actor, &body.reason, body.emergency)
        .await?;
    Ok(Json(outcome))
}

/// POST /api/v1/requests/:id/cancel
pub async fn cancel_request(
    State(state): State<Arc<AppState>>,
    CurrentActor(actor): CurrentActor,
    Path(id): Path<String>,
) -> Result<Json<DecisionOutcome>, ApprovalError> {
    let id = parse_id(&id)?;
    Ok(Json(state.service.cancel_request(id, &actor).await?))
}

/// POST /api/v1/requests/:id/execute
pub async fn execute_request(
    State(state): State<Arc<AppState>>,
    CurrentActor(actor): CurrentActor,
    Path(id): Path<String>,
) -> Result<Json<DecisionOutcome>, ApprovalError> {
    let id = parse_id(&id)?;
    Ok(Json(state.service.execute_request(id, &actor).await?))
}

/// POST /api/v1/requests/expire: run the expiry sweep now (admin only).
pub async fn expire_old_requests(
    State(state): State<Arc<AppState>>,
    CurrentActor(actor): CurrentActor,
) -> Result<Json<ExpireResponse>, ApprovalError> {
    enforce(&actor, Permission::Administer, "run the expiry sweep")?;
    let expired = state.service.expire_old_requests().await?;
    Ok(Json(ExpireResponse { expired }))
}

// ── Queries ──────────────────────────────────────────────────

/// GET /api/v1/requests/:id
pub async fn get_request(
    State(state): State<Arc<AppState>>,
    CurrentActor(actor): CurrentActor,
    Path(id): Path<String>,
) -> Result<Json<RequestDetail>, ApprovalError> {
    let id = parse_id(&id)?;
    Ok(Json(state.service.get_request(id, &actor).await?))
}

/// GET /api/v1/requests/pending
pub async fn list_pending_requests(
    State(state): State<Arc<AppState>>,
    CurrentActor(actor): CurrentActor,
    Query(params): Query<ListParams>,
) -> Result<Json<Page<ApprovalRequest>>, ApprovalError> {
    enforce(&actor, Permission::ViewAll, "list pending requests")?;
    let (filter, page) = params.split()?;
    Ok(Json(state.service.list_pending_requests(filter, page).await?))
}

/// GET /api/v1/requests/mine
pub async fn list_my_requests(
    State(state): State<Arc<AppState>>,
    CurrentActor(actor): CurrentActor,
    Query(params): Query<ListParams>,
) -> Result<Json<Page<ApprovalRequest>>, ApprovalError> {
    let (filter, page) = params.split()?;
    Ok(Json(
        state.service.list_my_requests(&actor.id, filter, page).await?,
    ))
}

/// GET /api/v1/policies
pub async fn list_policies(
    State(state): State<Arc<AppState>>,
    CurrentActor(_actor): CurrentActor,
) -> Json<Vec<ApprovalPolicy>> {
    Json(state.service.list_policies())
}

/// GET /api/v1/history
pub async fn get_approval_history(
    State(state): State<Arc<AppState>>,
    CurrentActor(actor): CurrentActor,
    Query(params): Query<HistoryParams>,
) -> Result<Json<Page<HistoryRow>>, ApprovalError> {
    enforce(&actor, Permission::ViewAll, "read approval history")?;
    let action = params
        .action
        .as_deref()
        .map(str::parse::<AuditAction>)
        .transpose()
        .map_err(ApprovalError::Validation)?;
    let filter = HistoryFilter {
        approval_request_id: params.request_id,
        actor_id: params.actor_id,
        action,
        from: params.from,
        to: params.to,
    };
    let page = PageRequest::new(params.page, params.per_page);
    Ok(Json(state.service.get_approval_history(filter, page).await?))
}

/// GET /api/v1/stats?period=7d|30d|90d|all
pub async fn get_approval_stats(
    State(state): State<Arc<AppState>>,
    CurrentActor(actor): CurrentActor,
    Query(params): Query<StatsParams>,
) -> Result<Json<ApprovalStats>, ApprovalError> {
    enforce(&actor, Permission::ViewAll, "read approval statistics")?;
    let period = params.period.unwrap_or_default();
    Ok(Json(state.service.get_approval_stats(&period).await?))
}
