use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Reporting window for `get_approval_stats`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatsPeriod {
    #[serde(rename = "7d")]
    Days7,
    #[serde(rename = "30d")]
    Days30,
    #[serde(rename = "90d")]
    Days90,
    #[serde(rename = "all")]
    All,
}

impl StatsPeriod {
    /// Unrecognized values fall back to 30 days instead of erroring.
    pub fn parse_lenient(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "7d" => StatsPeriod::Days7,
            "30d" => StatsPeriod::Days30,
            "90d" => StatsPeriod::Days90,
            "all" => StatsPeriod::All,
            _ => StatsPeriod::Days30,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StatsPeriod::Days7 => "7d",
            StatsPeriod::Days30 => "30d",
            StatsPeriod::Days90 => "90d",
            StatsPeriod::All => "all",
        }
    }

    /// Lower bound on `created_at`, or `None` for all time.
    pub fn since(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let days = match self {
            StatsPeriod::Days7 => 7,
            StatsPeriod::Days30 => 30,
            StatsPeriod::Days90 => 90,
            StatsPeriod::All => return None,
        };
        Some(now - chrono::Duration::days(days))
    }
}

/// Per-status request counts, as aggregated by the store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct StatusCounts {
    pub pending: i64,
    pub approved: i64,
    pub rejected: i64,
    pub cancelled: i64,
    pub expired: i64,
    pub executed: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalStats {
    pub period: String,
    pub total: i64,
    /// Requests whose decision was approval, including those since executed.
    pub approved: i64,
    pub rejected: i64,
    pub pending: i64,
    pub expired: i64,
    pub cancelled: i64,
    pub executed: i64,
}

impl ApprovalStats {
    pub fn from_counts(period: StatsPeriod, c: StatusCounts) -> Self {
        Self {
            period: period.as_str().to_string(),
            total: c.pending + c.approved + c.rejected + c.cancelled + c.expired + c.executed,
            approved: c.approved + c.executed,
            rejected: c.rejected,
            pending: c.pending,
            expired: c.expired,
            cancelled: c.cancelled,
            executed: c.executed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_period_falls_back_to_30d() {
        assert_eq!(StatsPeriod::parse_lenient("bogus"), StatsPeriod::Days30);
        assert_eq!(StatsPeriod::parse_lenient(""), StatsPeriod::Days30);
        assert_eq!(StatsPeriod::parse_lenient("7D"), StatsPeriod::Days7);
        assert_eq!(StatsPeriod::parse_lenient("all"), StatsPeriod::All);
    }

    #[test]
    fn test_since_window() {
        let now = Utc::now();
        assert_eq!(StatsPeriod::All.since(now), None);
        assert_eq!(StatsPeriod::Days90.since(now), Some(now - chrono::Duration::days(90)));
    }

    #[test]
    fn test_stats_approved_includes_executed() {
        let stats = ApprovalStats::from_counts(
            StatsPeriod::Days7,
            StatusCounts {
                pending: 1,
                approved: 2,
                rejected: 1,
                cancelled: 0,
                expired: 0,
                executed: 1,
            },
        );
        assert_eq!(stats.total, 5);
        assert_eq!(stats.approved, 3);
        assert_eq!(stats.executed, 1);
        assert_eq!(stats.period, "7d");
    }
}
