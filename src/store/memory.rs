//! In-process store for tests and `HOSTGATE_STORE=memory` development runs.
//!
//! One lock guards both tables, so a transition and its audit entry become
//! visible together and the status check-and-set cannot interleave.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::ApprovalStore;
use crate::models::analytics::StatusCounts;
use crate::models::approval::{ApprovalRequest, ApprovalStatus, RequestFilter, Transition};
use crate::models::audit::{AuditEntry, HistoryFilter, HistoryRecord};

#[derive(Default)]
struct Tables {
    requests: HashMap<Uuid, ApprovalRequest>,
    history: Vec<AuditEntry>,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rewrite the `details` of a stored audit row in place, bypassing the
    /// engine. Used to exercise tamper detection; returns `false` if no row
    /// has that id. Only compiled for tests or with `--features test-hooks`.
    #[cfg(any(test, feature = "test-hooks"))]
    pub async fn overwrite_history_details(&self, entry_id: Uuid, details: serde_json::Value) -> bool {
        let mut tables = self.tables.write().await;
        match tables.history.iter_mut().find(|e| e.id == entry_id) {
            Some(entry) => {
                entry.details = details;
                true
            }
            None => false,
        }
    }
}

fn matches_request(r: &ApprovalRequest, f: &RequestFilter) -> bool {
    f.request_type.as_deref().map_or(true, |t| r.request_type == t)
        && f.status.map_or(true, |s| r.status == s)
        && f.requester_id.as_deref().map_or(true, |id| r.requester_id == id)
        && f.created_from.map_or(true, |from| r.created_at >= from)
        && f.created_to.map_or(true, |to| r.created_at <= to)
}

fn matches_entry(e: &AuditEntry, f: &HistoryFilter) -> bool {
    f.approval_request_id.map_or(true, |id| e.approval_request_id == id)
        && f.actor_id.as_deref().map_or(true, |id| e.actor_id == id)
        && f.action.map_or(true, |a| e.action == a)
        && f.from.map_or(true, |from| e.timestamp >= from)
        && f.to.map_or(true, |to| e.timestamp <= to)
}

fn page<T>(items: Vec<T>, limit: i64, offset: i64) -> Vec<T> {
    let offset = usize::try_from(offset).unwrap_or(0);
    let limit = usize::try_from(limit).unwrap_or(0);
    items.into_iter().skip(offset).take(limit).collect()
}

#[async_trait]
impl ApprovalStore for MemoryStore {
    async fn insert_request(
        &self,
        request: &ApprovalRequest,
        entry: &AuditEntry,
    ) -> anyhow::Result<()> {
        let mut tables = self.tables.write().await;
        if tables.requests.contains_key(&request.id) {
            anyhow::bail!("duplicate approval request id {}", request.id);
        }
        tables.requests.insert(request.id, request.clone());
        tables.history.push(entry.clone());
        Ok(())
    }

    async fn transition(
        &self,
        transition: &Transition,
        entry: &AuditEntry,
    ) -> anyhow::Result<bool> {
        let mut tables = self.tables.write().await;
        let Some(row) = tables.requests.get_mut(&transition.request_id) else {
            return Ok(false);
        };
        if row.status != transition.from {
            return Ok(false);
        }
        row.status = transition.to;
        if transition.to == ApprovalStatus::Executed {
            row.executed_at = Some(transition.at);
        } else {
            row.decided_at = Some(transition.at);
            row.decided_by = transition.actor_id.clone();
        }
        tables.history.push(entry.clone());
        Ok(true)
    }

    async fn get_request(&self, id: Uuid) -> anyhow::Result<Option<ApprovalRequest>> {
        Ok(self.tables.read().await.requests.get(&id).cloned())
    }

    async fn list_requests(
        &self,
        filter: &RequestFilter,
        limit: i64,
        offset: i64,
    ) -> anyhow::Result<(Vec<ApprovalRequest>, i64)> {
        let tables = self.tables.read().await;
        let mut rows: Vec<ApprovalRequest> = tables
            .requests
            .values()
            .filter(|r| matches_request(r, filter))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        let total = rows.len() as i64;
        Ok((page(rows, limit, offset), total))
    }

    async fn list_overdue(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<Uuid>> {
        let tables = self.tables.read().await;
        let mut rows: Vec<&ApprovalRequest> = tables
            .requests
            .values()
            .filter(|r| r.is_overdue(now))
            .collect();
        rows.sort_by_key(|r| r.expires_at);
        Ok(rows.into_iter().map(|r| r.id).collect())
    }

    async fn list_history(
        &self,
        filter: &HistoryFilter,
        limit: i64,
        offset: i64,
    ) -> anyhow::Result<(Vec<HistoryRecord>, i64)> {
        let tables = self.tables.read().await;
        let rows: Vec<HistoryRecord> = tables
            .history
            .iter()
            .filter(|e| matches_entry(e, filter))
            .filter_map(|e| {
                let req = tables.requests.get(&e.approval_request_id)?;
                Some(HistoryRecord {
                    entry: e.clone(),
                    request_type: req.request_type.clone(),
                    requester_id: req.requester_id.clone(),
                })
            })
            .collect();
        let total = rows.len() as i64;
        Ok((page(rows, limit, offset), total))
    }

    async fn count_by_status(&self, since: Option<DateTime<Utc>>) -> anyhow::Result<StatusCounts> {
        let tables = self.tables.read().await;
        let mut counts = StatusCounts::default();
        for r in tables
            .requests
            .values()
            .filter(|r| since.map_or(true, |s| r.created_at >= s))
        {
            match r.status {
                ApprovalStatus::Pending => counts.pending += 1,
                ApprovalStatus::Approved => counts.approved += 1,
                ApprovalStatus::Rejected => counts.rejected += 1,
                ApprovalStatus::Cancelled => counts.cancelled += 1,
                ApprovalStatus::Expired => counts.expired += 1,
                ApprovalStatus::Executed => counts.executed += 1,
            }
        }
        Ok(counts)
    }
}
