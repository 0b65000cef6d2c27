use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::approval::ApprovalStatus;

/// One immutable record per state transition.
///
/// `signature` is an HMAC over the other fields; validity is never stored,
/// see [`crate::middleware::audit::AuditSigner::verify`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct AuditEntry {
    pub id: Uuid,
    pub approval_request_id: Uuid,
    pub action: AuditAction,
    pub actor_id: String,
    pub actor_name: String,
    pub actor_role: String,
    pub timestamp: DateTime<Utc>,
    pub previous_status: Option<ApprovalStatus>,
    pub new_status: ApprovalStatus,
    pub details: serde_json::Value,
    pub signature: String,
}

#[derive(Debug, Serialize, Deserialize, sqlx::Type, PartialEq, Eq, Clone, Copy, Hash)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
pub enum AuditAction {
    Created,
    Approved,
    Rejected,
    Cancelled,
    Expired,
    Executed,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Created => "created",
            AuditAction::Approved => "approved",
            AuditAction::Rejected => "rejected",
            AuditAction::Cancelled => "cancelled",
            AuditAction::Expired => "expired",
            AuditAction::Executed => "executed",
        }
    }

    /// The action recorded when a request enters `status`.
    pub fn for_status(status: ApprovalStatus) -> Self {
        match status {
            ApprovalStatus::Pending => AuditAction::Created,
            ApprovalStatus::Approved => AuditAction::Approved,
            ApprovalStatus::Rejected => AuditAction::Rejected,
            ApprovalStatus::Cancelled => AuditAction::Cancelled,
            ApprovalStatus::Expired => AuditAction::Expired,
            ApprovalStatus::Executed => AuditAction::Executed,
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "created" => Ok(AuditAction::Created),
            "approved" => Ok(AuditAction::Approved),
            "rejected" => Ok(AuditAction::Rejected),
            "cancelled" | "canceled" => Ok(AuditAction::Cancelled),
            "expired" => Ok(AuditAction::Expired),
            "executed" => Ok(AuditAction::Executed),
            other => Err(format!("unknown audit action '{}'", other)),
        }
    }
}

/// An audit entry joined with the request it belongs to, as stored.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct HistoryRecord {
    #[sqlx(flatten)]
    pub entry: AuditEntry,
    pub request_type: String,
    pub requester_id: String,
}

/// What the history endpoints return: the record plus a freshly
/// recomputed signature check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRow {
    #[serde(flatten)]
    pub entry: AuditEntry,
    pub request_type: String,
    pub requester_id: String,
    pub signature_valid: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoryFilter {
    pub approval_request_id: Option<Uuid>,
    pub actor_id: Option<String>,
    pub action: Option<AuditAction>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_for_status() {
        assert_eq!(AuditAction::for_status(ApprovalStatus::Pending), AuditAction::Created);
        assert_eq!(AuditAction::for_status(ApprovalStatus::Expired), AuditAction::Expired);
        assert_eq!(AuditAction::for_status(ApprovalStatus::Executed), AuditAction::Executed);
    }

    #[test]
    fn test_history_row_flattens_entry() {
        let row = HistoryRow {
            entry: AuditEntry {
                id: Uuid::nil(),
                approval_request_id: Uuid::nil(),
                action: AuditAction::Approved,
                actor_id: "bob".into(),
                actor_name: "Bob".into(),
                actor_role: "approver".into(),
                timestamp: Utc::now(),
                previous_status: Some(ApprovalStatus::Pending),
                new_status: ApprovalStatus::Approved,
                details: serde_json::json!({"comment": "ok"}),
                signature: "abc".into(),
            },
            request_type: "firewall_modify".into(),
            requester_id: "alice".into(),
            signature_valid: true,
        };
        let json = serde_json::to_value(&row).unwrap();
        assert_eq!(json["action"], "approved");
        assert_eq!(json["previous_status"], "pending");
        assert_eq!(json["request_type"], "firewall_modify");
        assert_eq!(json["signature_valid"], true);
    }
}
