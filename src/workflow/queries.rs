use chrono::{DateTime, Utc};

use super::ApprovalService;
use crate::errors::ApprovalError;
use crate::middleware::audit::now;
use crate::models::analytics::{ApprovalStats, StatsPeriod};
use crate::models::approval::{ApprovalRequest, ApprovalStatus, Page, PageRequest, RequestFilter};
use crate::models::audit::{HistoryFilter, HistoryRow};
use crate::models::policy::ApprovalPolicy;

fn check_range(
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
) -> Result<(), ApprovalError> {
    match (from, to) {
        (Some(from), Some(to)) if from > to => Err(ApprovalError::Validation(format!(
            "date range start {} is after end {}",
            from, to
        ))),
        _ => Ok(()),
    }
}

impl ApprovalService {
    /// Requests awaiting a decision, newest first.
    ///
    /// The status filter defaults to `pending`; an explicit status widens the
    /// view to that state instead.
    pub async fn list_pending_requests(
        &self,
        mut filter: RequestFilter,
        page: PageRequest,
    ) -> Result<Page<ApprovalRequest>, ApprovalError> {
        check_range(filter.created_from, filter.created_to)?;
        filter.status.get_or_insert(ApprovalStatus::Pending);
        self.list_requests(&filter, page).await
    }

    /// Requests raised by `requester_id`, in any status unless filtered.
    pub async fn list_my_requests(
        &self,
        requester_id: &str,
        mut filter: RequestFilter,
        page: PageRequest,
    ) -> Result<Page<ApprovalRequest>, ApprovalError> {
        check_range(filter.created_from, filter.created_to)?;
        filter.requester_id = Some(requester_id.to_string());
        self.list_requests(&filter, page).await
    }

    async fn list_requests(
        &self,
        filter: &RequestFilter,
        page: PageRequest,
    ) -> Result<Page<ApprovalRequest>, ApprovalError> {
        let (items, total) = self
            .store
            .list_requests(filter, page.limit(), page.offset())
            .await?;
        Ok(Page::new(items, page, total))
    }

    /// Sorted by request type.
    pub fn list_policies(&self) -> Vec<ApprovalPolicy> {
        self.policies.list()
    }

    /// Audit rows joined with their request, oldest first, each re-verified.
    pub async fn get_approval_history(
        &self,
        filter: HistoryFilter,
        page: PageRequest,
    ) -> Result<Page<HistoryRow>, ApprovalError> {
        check_range(filter.from, filter.to)?;
        let (records, total) = self
            .store
            .list_history(&filter, page.limit(), page.offset())
            .await?;
        let rows = records.into_iter().map(|r| self.verified(r)).collect();
        Ok(Page::new(rows, page, total))
    }

    /// Counts over requests created within `period`. Unknown periods are
    /// treated as `30d`.
    pub async fn get_approval_stats(&self, period: &str) -> Result<ApprovalStats, ApprovalError> {
        let period = StatsPeriod::parse_lenient(period);
        let counts = self.store.count_by_status(period.since(now())).await?;
        Ok(ApprovalStats::from_counts(period, counts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_inverted_range_rejected() {
        let t = now();
        assert!(check_range(Some(t), Some(t - Duration::days(1))).is_err());
        assert!(check_range(Some(t - Duration::days(1)), Some(t)).is_ok());
        assert!(check_range(Some(t), Some(t)).is_ok());
        assert!(check_range(None, Some(t)).is_ok());
    }
}
