pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::analytics::StatusCounts;
use crate::models::approval::{ApprovalRequest, RequestFilter, Transition};
use crate::models::audit::{AuditEntry, HistoryFilter, HistoryRecord};

/// Durable storage for approval requests and their audit trail.
///
/// Every write pairs a request mutation with its audit entry and commits both
/// or neither. Transitions are conditional on the row's current status.
/// Implementations: [`postgres::PgStore`], [`memory::MemoryStore`].
#[async_trait]
pub trait ApprovalStore: Send + Sync {
    /// Insert a new request together with its `created` entry.
    async fn insert_request(
        &self,
        request: &ApprovalRequest,
        entry: &AuditEntry,
    ) -> anyhow::Result<()>;

    /// Apply `transition` only if the row is still in `transition.from`.
    ///
    /// Returns `false` (and writes nothing) when zero rows matched.
    async fn transition(&self, transition: &Transition, entry: &AuditEntry)
        -> anyhow::Result<bool>;

    async fn get_request(&self, id: Uuid) -> anyhow::Result<Option<ApprovalRequest>>;

    /// Newest first. Returns the page and the total matching count.
    async fn list_requests(
        &self,
        filter: &RequestFilter,
        limit: i64,
        offset: i64,
    ) -> anyhow::Result<(Vec<ApprovalRequest>, i64)>;

    /// Ids of pending requests with `expires_at < now`, oldest first.
    async fn list_overdue(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<Uuid>>;

    /// Oldest first. Returns the page and the total matching count.
    async fn list_history(
        &self,
        filter: &HistoryFilter,
        limit: i64,
        offset: i64,
    ) -> anyhow::Result<(Vec<HistoryRecord>, i64)>;

    /// Status counts for requests created at or after `since`.
    async fn count_by_status(&self, since: Option<DateTime<Utc>>) -> anyhow::Result<StatusCounts>;
}
