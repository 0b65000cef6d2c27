use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A proposed privileged action awaiting (or having received) a decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ApprovalRequest {
    pub id: Uuid,
    pub requester_id: String,
    pub request_type: String,
    pub payload: serde_json::Value,
    pub reason: String,
    pub status: ApprovalStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
    pub decided_by: Option<String>,
    pub executed_at: Option<DateTime<Utc>>,
}

impl ApprovalRequest {
    /// A still-pending request whose TTL has run out. The row only becomes
    /// `expired` once the sweep reaches it.
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.status == ApprovalStatus::Pending && self.expires_at < now
    }
}

#[derive(Debug, Serialize, Deserialize, sqlx::Type, PartialEq, Eq, Clone, Copy, Hash)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Cancelled,
    Expired,
    Executed,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Rejected => "rejected",
            ApprovalStatus::Cancelled => "cancelled",
            ApprovalStatus::Expired => "expired",
            ApprovalStatus::Executed => "executed",
        }
    }

    /// Whether `self -> next` is an edge of the request state machine.
    pub fn can_transition_to(&self, next: ApprovalStatus) -> bool {
        matches!(
            (self, next),
            (
                ApprovalStatus::Pending,
                ApprovalStatus::Approved
                    | ApprovalStatus::Rejected
                    | ApprovalStatus::Cancelled
                    | ApprovalStatus::Expired
            ) | (ApprovalStatus::Approved, ApprovalStatus::Executed)
        )
    }
}

impl fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApprovalStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Ok(ApprovalStatus::Pending),
            "approved" => Ok(ApprovalStatus::Approved),
            "rejected" => Ok(ApprovalStatus::Rejected),
            "cancelled" | "canceled" => Ok(ApprovalStatus::Cancelled),
            "expired" => Ok(ApprovalStatus::Expired),
            "executed" => Ok(ApprovalStatus::Executed),
            other => Err(format!("unknown approval status '{}'", other)),
        }
    }
}

/// A conditional status change: applied only while the row is still in `from`.
#[derive(Debug, Clone)]
pub struct Transition {
    pub request_id: Uuid,
    pub from: ApprovalStatus,
    pub to: ApprovalStatus,
    /// Recorded as `decided_by` for decisions; ignored for `executed`.
    pub actor_id: Option<String>,
    pub at: DateTime<Utc>,
}

/// Returned from `create_request`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatedRequest {
    pub id: Uuid,
    pub status: ApprovalStatus,
    pub expires_at: DateTime<Utc>,
}

/// Returned from approve/reject/cancel/execute.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionOutcome {
    pub id: Uuid,
    pub status: ApprovalStatus,
    pub decided_by: Option<String>,
    pub decided_at: Option<DateTime<Utc>>,
    pub executed_at: Option<DateTime<Utc>>,
    /// Set when an approval dispatched to the executor in the same call.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution: Option<ExecutionReport>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub succeeded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Returned from `get_request`: the row, what its policy says it is, and the
/// verified audit trail in chronological order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestDetail {
    #[serde(flatten)]
    pub request: ApprovalRequest,
    pub policy_description: Option<String>,
    pub history: Vec<super::audit::HistoryRow>,
}

// ── Listing ──────────────────────────────────────────────────

/// Hard ceiling on page size for every paginated query.
pub const MAX_PER_PAGE: i64 = 100;
pub const DEFAULT_PER_PAGE: i64 = 20;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestFilter {
    pub request_type: Option<String>,
    pub status: Option<ApprovalStatus>,
    pub requester_id: Option<String>,
    pub created_from: Option<DateTime<Utc>>,
    pub created_to: Option<DateTime<Utc>>,
}

/// Page/per_page after clamping; never rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub page: i64,
    pub per_page: i64,
}

impl PageRequest {
    pub fn new(page: Option<i64>, per_page: Option<i64>) -> Self {
        Self {
            page: page.unwrap_or(1).max(1),
            per_page: per_page.unwrap_or(DEFAULT_PER_PAGE).clamp(1, MAX_PER_PAGE),
        }
    }

    pub fn limit(&self) -> i64 {
        self.per_page
    }

    pub fn offset(&self) -> i64 {
        (self.page - 1).saturating_mul(self.per_page)
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::new(None, None)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pagination {
    pub page: i64,
    pub per_page: i64,
    pub total: i64,
    pub total_pages: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub pagination: Pagination,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, page: PageRequest, total: i64) -> Self {
        let total_pages = if total == 0 {
            0
        } else {
            (total + page.per_page - 1) / page.per_page
        };
        Self {
            items,
            pagination: Pagination {
                page: page.page,
                per_page: page.per_page,
                total,
                total_pages,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_parse_and_display_agree() {
        for s in [
            ApprovalStatus::Pending,
            ApprovalStatus::Approved,
            ApprovalStatus::Rejected,
            ApprovalStatus::Cancelled,
            ApprovalStatus::Expired,
            ApprovalStatus::Executed,
        ] {
            assert_eq!(s.to_string().parse::<ApprovalStatus>().unwrap(), s);
        }
        assert_eq!("Canceled".parse::<ApprovalStatus>().unwrap(), ApprovalStatus::Cancelled);
        assert!("done".parse::<ApprovalStatus>().is_err());
    }

    #[test]
    fn test_state_machine_edges() {
        use ApprovalStatus::*;
        assert!(Pending.can_transition_to(Approved));
        assert!(Pending.can_transition_to(Expired));
        assert!(Approved.can_transition_to(Executed));
        assert!(!Pending.can_transition_to(Executed));
        assert!(!Rejected.can_transition_to(Approved));
        assert!(!Executed.can_transition_to(Approved));
        assert!(!Expired.can_transition_to(Pending));
        assert!(!Approved.can_transition_to(Rejected));
    }

    #[test]
    fn test_page_request_clamps_instead_of_rejecting() {
        let p = PageRequest::new(Some(0), Some(200));
        assert_eq!(p.page, 1);
        assert_eq!(p.per_page, MAX_PER_PAGE);

        let p = PageRequest::new(Some(3), Some(-5));
        assert_eq!(p.per_page, 1);
        assert_eq!(p.offset(), 2);

        let p = PageRequest::new(None, None);
        assert_eq!(p.per_page, DEFAULT_PER_PAGE);
        assert_eq!(p.offset(), 0);
    }

    #[test]
    fn test_page_total_pages() {
        let p = PageRequest::new(Some(1), Some(10));
        assert_eq!(Page::<u8>::new(vec![], p, 0).pagination.total_pages, 0);
        assert_eq!(Page::<u8>::new(vec![], p, 10).pagination.total_pages, 1);
        assert_eq!(Page::<u8>::new(vec![], p, 11).pagination.total_pages, 2);
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_string(&ApprovalStatus::Cancelled).unwrap();
        assert_eq!(json, "\"cancelled\"");
    }
}
