//! The approval workflow engine.
//!
//! [`ApprovalService`] owns every state change of an approval request. Each
//! change is a conditional write on the row's current status paired with a
//! signed audit entry in the same store transaction, so racing callers see
//! exactly one winner and the history never disagrees with the row.

pub mod queries;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashSet;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::errors::ApprovalError;
use crate::executor::ExecutorRegistry;
use crate::middleware::audit::{now, AuditSigner};
use crate::middleware::rbac::{enforce, Actor, Permission};
use crate::middleware::sanitize::{check_payload, check_text};
use crate::models::approval::{
    ApprovalRequest, ApprovalStatus, CreatedRequest, DecisionOutcome, ExecutionReport,
    RequestDetail, Transition, MAX_PER_PAGE,
};
use crate::models::audit::{HistoryFilter, HistoryRecord, HistoryRow};
use crate::models::policy::{ApprovalPolicy, PolicyRegistry};
use crate::store::ApprovalStore;

pub struct ApprovalService {
    store: Arc<dyn ApprovalStore>,
    policies: Arc<PolicyRegistry>,
    executors: ExecutorRegistry,
    signer: AuditSigner,
    /// Request ids whose executor is currently running in this process.
    executing: DashSet<Uuid>,
}

/// Released on drop so a failed or panicking execution frees the id.
struct ExecutionClaim<'a> {
    set: &'a DashSet<Uuid>,
    id: Uuid,
}

impl Drop for ExecutionClaim<'_> {
    fn drop(&mut self) {
        self.set.remove(&self.id);
    }
}

impl ApprovalService {
    pub fn new(
        store: Arc<dyn ApprovalStore>,
        policies: Arc<PolicyRegistry>,
        executors: ExecutorRegistry,
        signer: AuditSigner,
    ) -> Self {
        Self {
            store,
            policies,
            executors,
            signer,
            executing: DashSet::new(),
        }
    }

    pub fn policies(&self) -> &PolicyRegistry {
        &self.policies
    }

    pub fn executors(&self) -> &ExecutorRegistry {
        &self.executors
    }

    // ── Create ───────────────────────────────────────────────

    pub async fn create_request(
        &self,
        requester: &Actor,
        request_type: &str,
        payload: Value,
        reason: &str,
    ) -> Result<CreatedRequest, ApprovalError> {
        enforce(requester, Permission::Request, "create approval requests")?;
        let policy = self.policies.get(request_type).ok_or_else(|| {
            ApprovalError::NotFound(format!("request type '{}'", request_type))
        })?;
        check_payload(&payload)?;
        check_text("reason", reason)?;

        let id = Uuid::new_v4();
        let at = now();
        let request = ApprovalRequest {
            id,
            requester_id: requester.id.clone(),
            request_type: policy.request_type.clone(),
            payload,
            reason: reason.to_string(),
            status: ApprovalStatus::Pending,
            created_at: at,
            expires_at: at + policy.ttl(),
            decided_at: None,
            decided_by: None,
            executed_at: None,
        };
        let entry = self.signer.entry(
            id,
            requester,
            None,
            ApprovalStatus::Pending,
            json!({ "request_type": request.request_type, "reason": reason }),
            at,
        );

        self.store.insert_request(&request, &entry).await?;

        info!(
            request_id = %id,
            request_type = %request.request_type,
            requester_id = %requester.id,
            expires_at = %request.expires_at,
            "approval request created"
        );

        Ok(CreatedRequest {
            id,
            status: request.status,
            expires_at: request.expires_at,
        })
    }

    // ── Decide ───────────────────────────────────────────────

    pub async fn approve_request(
        &self,
        id: Uuid,
        actor: &Actor,
        comment: Option<&str>,
    ) -> Result<DecisionOutcome, ApprovalError> {
        enforce(actor, Permission::Decide, "approve requests")?;
        if let Some(comment) = comment {
            check_text("comment", comment)?;
        }

        let request = self.load(id).await?;
        let policy = self.authorize_decision(&request, actor)?;
        let at = self
            .decide(&request, actor, ApprovalStatus::Approved, json!({ "comment": comment }))
            .await?;

        let mut outcome = DecisionOutcome {
            id,
            status: ApprovalStatus::Approved,
            decided_by: Some(actor.id.clone()),
            decided_at: Some(at),
            executed_at: None,
            execution: None,
        };

        if policy.is_some_and(|p| p.auto_execute) {
            match self.execute_request(id, actor).await {
                Ok(executed) => return Ok(executed),
                Err(e) => {
                    warn!(
                        request_id = %id,
                        request_type = %request.request_type,
                        error = %e,
                        "auto-execute after approval failed; request stays approved"
                    );
                    outcome.execution = Some(ExecutionReport {
                        succeeded: false,
                        result: None,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        Ok(outcome)
    }

    /// `emergency` is recorded in the audit entry and changes nothing else.
    pub async fn reject_request(
        &self,
        id: Uuid,
        actor: &Actor,
        reason: &str,
        emergency: bool,
    ) -> Result<DecisionOutcome, ApprovalError> {
        enforce(actor, Permission::Decide, "reject requests")?;
        if reason.trim().is_empty() {
            return Err(ApprovalError::Validation(
                "reason is required when rejecting".into(),
            ));
        }
        check_text("reason", reason)?;

        let request = self.load(id).await?;
        self.authorize_decision(&request, actor)?;
        let at = self
            .decide(
                &request,
                actor,
                ApprovalStatus::Rejected,
                json!({ "reason": reason, "emergency": emergency }),
            )
            .await?;

        Ok(DecisionOutcome {
            id,
            status: ApprovalStatus::Rejected,
            decided_by: Some(actor.id.clone()),
            decided_at: Some(at),
            executed_at: None,
            execution: None,
        })
    }

    pub async fn cancel_request(
        &self,
        id: Uuid,
        actor: &Actor,
    ) -> Result<DecisionOutcome, ApprovalError> {
        let request = self.load(id).await?;
        if request.requester_id != actor.id {
            warn!(request_id = %id, actor_id = %actor.id, "cancel by non-requester refused");
            return Err(ApprovalError::Forbidden(
                "only the requester may cancel a request".into(),
            ));
        }
        let at = self
            .transition(&request, actor, ApprovalStatus::Cancelled, json!({}))
            .await?;

        Ok(DecisionOutcome {
            id,
            status: ApprovalStatus::Cancelled,
            decided_by: Some(actor.id.clone()),
            decided_at: Some(at),
            executed_at: None,
            execution: None,
        })
    }

    // ── Expire ───────────────────────────────────────────────

    /// Move every overdue pending request to `expired`.
    ///
    /// Returns how many rows this call expired. Rows decided between the scan
    /// and the write are skipped, so running it again right away returns 0
    /// unless new rows have crossed their deadline. A store failure on one row
    /// is logged and the sweep moves on; the error is returned only when no
    /// row could be expired.
    pub async fn expire_old_requests(&self) -> Result<u64, ApprovalError> {
        let at = now();
        let overdue = self.store.list_overdue(at).await?;
        let system = Actor::system();
        let mut expired = 0u64;
        let mut first_error = None;

        for id in overdue {
            let transition = Transition {
                request_id: id,
                from: ApprovalStatus::Pending,
                to: ApprovalStatus::Expired,
                actor_id: None,
                at,
            };
            let entry = self.signer.entry(
                id,
                &system,
                Some(ApprovalStatus::Pending),
                ApprovalStatus::Expired,
                json!({ "reason": "ttl elapsed" }),
                at,
            );
            match self.store.transition(&transition, &entry).await {
                Ok(true) => {
                    expired += 1;
                    info!(request_id = %id, "approval request expired");
                }
                Ok(false) => {
                    debug!(request_id = %id, "expiry skipped, request already decided");
                }
                Err(e) => {
                    error!(request_id = %id, error = %e, "failed to expire approval request");
                    first_error.get_or_insert(e);
                }
            }
        }

        if expired > 0 {
            info!(expired, "expiry sweep finished");
        }
        match first_error {
            Some(e) if expired == 0 => Err(e.into()),
            _ => Ok(expired),
        }
    }

    // ── Execute ──────────────────────────────────────────────

    /// Run the executor for an approved request, at most once.
    ///
    /// On executor failure the request stays `approved`, nothing is written,
    /// and the error is returned. The caller decides whether to try again.
    pub async fn execute_request(
        &self,
        id: Uuid,
        actor: &Actor,
    ) -> Result<DecisionOutcome, ApprovalError> {
        if !self.executing.insert(id) {
            return Err(ApprovalError::Conflict(format!(
                "request {} is already being executed",
                id
            )));
        }
        let _claim = ExecutionClaim {
            set: &self.executing,
            id,
        };

        let request = self.load(id).await?;
        match request.status {
            ApprovalStatus::Approved => {}
            ApprovalStatus::Executed => {
                return Err(ApprovalError::Conflict(format!(
                    "request {} was already executed",
                    id
                )))
            }
            other => {
                return Err(ApprovalError::Conflict(format!(
                    "request {} is {}, not approved",
                    id, other
                )))
            }
        }

        let executor = self
            .executors
            .get(&request.request_type)
            .ok_or_else(|| ApprovalError::NotImplemented(request.request_type.clone()))?;

        let result = match executor.execute(&request.payload).await {
            Ok(result) => result,
            Err(e) => {
                error!(
                    request_id = %id,
                    request_type = %request.request_type,
                    actor_id = %actor.id,
                    error = %format!("{:#}", e),
                    "executor failed"
                );
                return Err(ApprovalError::ExecutionFailed {
                    request_type: request.request_type.clone(),
                    message: format!("{:#}", e),
                });
            }
        };

        let at = self
            .transition(
                &request,
                actor,
                ApprovalStatus::Executed,
                json!({ "result": result }),
            )
            .await?;

        Ok(DecisionOutcome {
            id,
            status: ApprovalStatus::Executed,
            decided_by: request.decided_by.clone(),
            decided_at: request.decided_at,
            executed_at: Some(at),
            execution: Some(ExecutionReport {
                succeeded: true,
                result: Some(result),
                error: None,
            }),
        })
    }

    // ── Read ─────────────────────────────────────────────────

    /// The request, its policy description and its verified history.
    /// Visible to the requester and to anyone who may view all requests.
    pub async fn get_request(&self, id: Uuid, actor: &Actor) -> Result<RequestDetail, ApprovalError> {
        let request = self.load(id).await?;
        if request.requester_id != actor.id && !actor.has_permission(&Permission::ViewAll) {
            warn!(request_id = %id, actor_id = %actor.id, "view of foreign request refused");
            return Err(ApprovalError::Forbidden(
                "only the requester or an approver may view this request".into(),
            ));
        }

        let filter = HistoryFilter {
            approval_request_id: Some(id),
            ..Default::default()
        };
        let (records, _) = self.store.list_history(&filter, MAX_PER_PAGE, 0).await?;

        Ok(RequestDetail {
            policy_description: self
                .policies
                .get(&request.request_type)
                .map(|p| p.description.clone()),
            history: records.into_iter().map(|r| self.verified(r)).collect(),
            request,
        })
    }

    // ── Internals ────────────────────────────────────────────

    async fn load(&self, id: Uuid) -> Result<ApprovalRequest, ApprovalError> {
        self.store
            .get_request(id)
            .await?
            .ok_or_else(|| ApprovalError::NotFound(format!("approval request {}", id)))
    }

    fn verified(&self, record: HistoryRecord) -> HistoryRow {
        let signature_valid = self.signer.verify(&record.entry);
        if !signature_valid {
            warn!(
                entry_id = %record.entry.id,
                request_id = %record.entry.approval_request_id,
                "audit entry signature mismatch"
            );
        }
        HistoryRow {
            entry: record.entry,
            request_type: record.request_type,
            requester_id: record.requester_id,
            signature_valid,
        }
    }

    /// Checks shared by approve and reject, all made before any write.
    ///
    /// Returns the request's policy; `None` if its type was since removed
    /// from the registry, in which case only the base role check applies.
    fn authorize_decision(
        &self,
        request: &ApprovalRequest,
        actor: &Actor,
    ) -> Result<Option<&ApprovalPolicy>, ApprovalError> {
        if request.requester_id == actor.id {
            warn!(request_id = %request.id, actor_id = %actor.id, "self-approval refused");
            return Err(ApprovalError::Forbidden(
                "requesters may not decide their own requests".into(),
            ));
        }
        let policy = self.policies.get(&request.request_type);
        if let Some(required) = policy.and_then(|p| p.required_role.as_ref()) {
            if !actor.role.satisfies(required) {
                warn!(
                    request_id = %request.id,
                    actor_id = %actor.id,
                    role = %actor.role,
                    required_role = %required,
                    "decision refused: role does not meet policy"
                );
                return Err(ApprovalError::Forbidden(format!(
                    "deciding '{}' requires role '{}'",
                    request.request_type, required
                )));
            }
        }
        Ok(policy)
    }

    async fn decide(
        &self,
        request: &ApprovalRequest,
        actor: &Actor,
        to: ApprovalStatus,
        details: Value,
    ) -> Result<DateTime<Utc>, ApprovalError> {
        if request.is_overdue(now()) {
            return Err(ApprovalError::Conflict(format!(
                "request {} expired at {}",
                request.id, request.expires_at
            )));
        }
        self.transition(request, actor, to, details).await
    }

    /// Conditionally move `request` from the status it was read in to `to`,
    /// writing the signed audit entry in the same store transaction.
    async fn transition(
        &self,
        request: &ApprovalRequest,
        actor: &Actor,
        to: ApprovalStatus,
        details: Value,
    ) -> Result<DateTime<Utc>, ApprovalError> {
        let from = request.status;
        if !from.can_transition_to(to) {
            return Err(ApprovalError::Conflict(format!(
                "request {} is {}, cannot become {}",
                request.id, from, to
            )));
        }

        let at = now();
        let transition = Transition {
            request_id: request.id,
            from,
            to,
            actor_id: Some(actor.id.clone()),
            at,
        };
        let entry = self
            .signer
            .entry(request.id, actor, Some(from), to, details, at);

        if !self.store.transition(&transition, &entry).await? {
            warn!(
                request_id = %request.id,
                actor_id = %actor.id,
                to = %to,
                "conditional write lost: request changed concurrently"
            );
            return Err(ApprovalError::Conflict(format!(
                "request {} was decided concurrently",
                request.id
            )));
        }

        info!(
            request_id = %request.id,
            request_type = %request.request_type,
            actor_id = %actor.id,
            from = %from,
            to = %to,
            "approval request transitioned"
        );
        Ok(at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::Executor;
    use crate::middleware::rbac::Role;
    use crate::store::memory::MemoryStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct StubExecutor {
        calls: AtomicUsize,
        fail: bool,
        delay: Option<Duration>,
    }

    impl StubExecutor {
        fn ok() -> Arc<Self> {
            Arc::new(Self { calls: AtomicUsize::new(0), fail: false, delay: None })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self { calls: AtomicUsize::new(0), fail: true, delay: None })
        }

        fn slow(delay: Duration) -> Arc<Self> {
            Arc::new(Self { calls: AtomicUsize::new(0), fail: false, delay: Some(delay) })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Executor for StubExecutor {
        async fn execute(&self, payload: &Value) -> anyhow::Result<Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail {
                anyhow::bail!("wrapper exited with status 1");
            }
            Ok(json!({ "applied": payload }))
        }
    }

    fn alice() -> Actor {
        Actor::new("alice", "Alice", Role::Operator)
    }

    fn bob() -> Actor {
        Actor::new("bob", "Bob", Role::Approver)
    }

    fn carol_admin() -> Actor {
        Actor::new("carol", "Carol", Role::Admin)
    }

    fn service_with(
        store: Arc<MemoryStore>,
        policies: PolicyRegistry,
        executors: ExecutorRegistry,
    ) -> ApprovalService {
        ApprovalService::new(
            store,
            Arc::new(policies),
            executors,
            AuditSigner::new("unit-test-secret").unwrap(),
        )
    }

    fn service() -> (ApprovalService, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let svc = service_with(store.clone(), PolicyRegistry::builtin(), ExecutorRegistry::new());
        (svc, store)
    }

    async fn firewall_request(svc: &ApprovalService) -> Uuid {
        svc.create_request(
            &alice(),
            "firewall_modify",
            json!({"port": 8080, "action": "allow"}),
            "open test port",
        )
        .await
        .unwrap()
        .id
    }

    /// Insert a pending request whose deadline has already passed.
    async fn overdue_request(svc: &ApprovalService, store: &MemoryStore) -> Uuid {
        let id = Uuid::new_v4();
        let created = now() - chrono::Duration::hours(2);
        let request = ApprovalRequest {
            id,
            requester_id: "alice".into(),
            request_type: "firewall_modify".into(),
            payload: json!({"port": 22}),
            reason: "stale".into(),
            status: ApprovalStatus::Pending,
            created_at: created,
            expires_at: created + chrono::Duration::hours(1),
            decided_at: None,
            decided_by: None,
            executed_at: None,
        };
        let entry = svc
            .signer
            .entry(id, &alice(), None, ApprovalStatus::Pending, json!({}), created);
        store.insert_request(&request, &entry).await.unwrap();
        id
    }

    #[tokio::test]
    async fn test_create_is_pending_with_future_deadline() {
        let (svc, store) = service();
        let created = svc
            .create_request(&alice(), "service_stop", json!({"service": "nginx"}), "maintenance")
            .await
            .unwrap();
        assert_eq!(created.status, ApprovalStatus::Pending);

        let row = store.get_request(created.id).await.unwrap().unwrap();
        assert!(row.expires_at > row.created_at);
        assert_eq!(row.expires_at - row.created_at, chrono::Duration::hours(4));
        assert_eq!(row.requester_id, "alice");
    }

    #[tokio::test]
    async fn test_create_unknown_type_is_not_found() {
        let (svc, _) = service();
        let err = svc
            .create_request(&alice(), "format_disk", json!({}), "why not")
            .await
            .unwrap_err();
        assert!(matches!(err, ApprovalError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_create_with_forbidden_chars_writes_nothing() {
        let (svc, store) = service();
        let err = svc
            .create_request(&alice(), "user_create", json!({"name": "bob; rm -rf /"}), "new hire")
            .await
            .unwrap_err();
        assert!(matches!(err, ApprovalError::Validation(_)));

        let err = svc
            .create_request(&alice(), "user_create", json!({"name": "bob"}), "new hire $(id)")
            .await
            .unwrap_err();
        assert!(matches!(err, ApprovalError::Validation(_)));

        let (_, total) = store
            .list_requests(&Default::default(), 10, 0)
            .await
            .unwrap();
        assert_eq!(total, 0);
    }

    #[tokio::test]
    async fn test_self_approval_forbidden_for_every_role() {
        let (svc, _) = service();
        let id = firewall_request(&svc).await;
        for role in [Role::Admin, Role::Approver, Role::Operator, Role::Viewer] {
            let me = Actor::new("alice", "Alice", role);
            let err = svc.approve_request(id, &me, None).await.unwrap_err();
            assert!(matches!(err, ApprovalError::Forbidden(_)));
            let err = svc.reject_request(id, &me, "no", false).await.unwrap_err();
            assert!(matches!(err, ApprovalError::Forbidden(_)));
        }
    }

    #[tokio::test]
    async fn test_non_approver_cannot_decide() {
        let (svc, _) = service();
        let id = firewall_request(&svc).await;
        let dave = Actor::new("dave", "Dave", Role::Operator);
        let err = svc.approve_request(id, &dave, None).await.unwrap_err();
        assert!(matches!(err, ApprovalError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_required_role_enforced_and_admin_qualifies() {
        let (svc, _) = service();
        let id = svc
            .create_request(&alice(), "user_delete", json!({"user": "mallory"}), "left the company")
            .await
            .unwrap()
            .id;

        let err = svc.approve_request(id, &bob(), None).await.unwrap_err();
        assert!(matches!(err, ApprovalError::Forbidden(_)));

        let out = svc.approve_request(id, &carol_admin(), Some("confirmed with HR")).await.unwrap();
        assert_eq!(out.status, ApprovalStatus::Approved);
        assert_eq!(out.decided_by.as_deref(), Some("carol"));
    }

    #[tokio::test]
    async fn test_second_decision_conflicts() {
        let (svc, store) = service();
        let id = firewall_request(&svc).await;
        svc.reject_request(id, &bob(), "not this week", false).await.unwrap();

        let err = svc.reject_request(id, &bob(), "again", false).await.unwrap_err();
        assert!(matches!(err, ApprovalError::Conflict(_)));
        let err = svc.approve_request(id, &carol_admin(), None).await.unwrap_err();
        assert!(matches!(err, ApprovalError::Conflict(_)));

        let (_, total) = store
            .list_history(&HistoryFilter { approval_request_id: Some(id), ..Default::default() }, 10, 0)
            .await
            .unwrap();
        assert_eq!(total, 2);
    }

    #[tokio::test]
    async fn test_reject_requires_reason() {
        let (svc, _) = service();
        let id = firewall_request(&svc).await;
        let err = svc.reject_request(id, &bob(), "   ", false).await.unwrap_err();
        assert!(matches!(err, ApprovalError::Validation(_)));
    }

    #[tokio::test]
    async fn test_emergency_reject_is_recorded() {
        let (svc, _) = service();
        let id = firewall_request(&svc).await;
        svc.reject_request(id, &bob(), "incident in progress", true).await.unwrap();

        let detail = svc.get_request(id, &bob()).await.unwrap();
        let last = detail.history.last().unwrap();
        assert_eq!(last.entry.details["emergency"], true);
        assert_eq!(last.entry.details["reason"], "incident in progress");
    }

    #[tokio::test]
    async fn test_cancel_rules() {
        let (svc, _) = service();
        let id = firewall_request(&svc).await;

        let err = svc.cancel_request(id, &bob()).await.unwrap_err();
        assert!(matches!(err, ApprovalError::Forbidden(_)));

        let out = svc.cancel_request(id, &alice()).await.unwrap();
        assert_eq!(out.status, ApprovalStatus::Cancelled);

        let err = svc.cancel_request(id, &alice()).await.unwrap_err();
        assert!(matches!(err, ApprovalError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_overdue_request_cannot_be_decided() {
        let (svc, store) = service();
        let id = overdue_request(&svc, &store).await;
        let err = svc.approve_request(id, &bob(), None).await.unwrap_err();
        assert!(matches!(err, ApprovalError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_expiry_sweep_is_idempotent() {
        let (svc, store) = service();
        let a = overdue_request(&svc, &store).await;
        let b = overdue_request(&svc, &store).await;
        let fresh = firewall_request(&svc).await;

        assert_eq!(svc.expire_old_requests().await.unwrap(), 2);
        assert_eq!(svc.expire_old_requests().await.unwrap(), 0);

        for id in [a, b] {
            let row = store.get_request(id).await.unwrap().unwrap();
            assert_eq!(row.status, ApprovalStatus::Expired);
            assert!(row.decided_by.is_none());
        }
        let row = store.get_request(fresh).await.unwrap().unwrap();
        assert_eq!(row.status, ApprovalStatus::Pending);

        let detail = svc.get_request(a, &bob()).await.unwrap();
        let last = detail.history.last().unwrap();
        assert_eq!(last.entry.actor_id, "system");
        assert!(last.signature_valid);
    }

    /// Fails every transition on one request id; everything else goes to the
    /// wrapped store.
    struct FlakyStore {
        inner: Arc<MemoryStore>,
        broken: std::sync::Mutex<Option<Uuid>>,
    }

    #[async_trait]
    impl ApprovalStore for FlakyStore {
        async fn insert_request(&self, request: &ApprovalRequest, entry: &crate::models::audit::AuditEntry) -> anyhow::Result<()> {
            self.inner.insert_request(request, entry).await
        }

        async fn transition(&self, transition: &Transition, entry: &crate::models::audit::AuditEntry) -> anyhow::Result<bool> {
            if *self.broken.lock().unwrap() == Some(transition.request_id) {
                anyhow::bail!("connection reset by peer");
            }
            self.inner.transition(transition, entry).await
        }

        async fn get_request(&self, id: Uuid) -> anyhow::Result<Option<ApprovalRequest>> {
            self.inner.get_request(id).await
        }

        async fn list_requests(&self, filter: &crate::models::approval::RequestFilter, limit: i64, offset: i64) -> anyhow::Result<(Vec<ApprovalRequest>, i64)> {
            self.inner.list_requests(filter, limit, offset).await
        }

        async fn list_overdue(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<Uuid>> {
            self.inner.list_overdue(now).await
        }

        async fn list_history(&self, filter: &HistoryFilter, limit: i64, offset: i64) -> anyhow::Result<(Vec<HistoryRecord>, i64)> {
            self.inner.list_history(filter, limit, offset).await
        }

        async fn count_by_status(&self, since: Option<DateTime<Utc>>) -> anyhow::Result<crate::models::analytics::StatusCounts> {
            self.inner.count_by_status(since).await
        }
    }

    #[tokio::test]
    async fn test_expiry_sweep_continues_past_store_error() {
        let memory = Arc::new(MemoryStore::new());
        let flaky = Arc::new(FlakyStore { inner: memory.clone(), broken: std::sync::Mutex::new(None) });
        let svc = ApprovalService::new(
            flaky.clone(),
            Arc::new(PolicyRegistry::builtin()),
            ExecutorRegistry::new(),
            AuditSigner::new("unit-test-secret").unwrap(),
        );
        let ids = [
            overdue_request(&svc, &memory).await,
            overdue_request(&svc, &memory).await,
            overdue_request(&svc, &memory).await,
        ];
        *flaky.broken.lock().unwrap() = Some(ids[1]);

        assert_eq!(svc.expire_old_requests().await.unwrap(), 2);
        assert_eq!(memory.get_request(ids[0]).await.unwrap().unwrap().status, ApprovalStatus::Expired);
        assert_eq!(memory.get_request(ids[1]).await.unwrap().unwrap().status, ApprovalStatus::Pending);
        assert_eq!(memory.get_request(ids[2]).await.unwrap().unwrap().status, ApprovalStatus::Expired);

        // Only the broken row is left, so the failure surfaces.
        let err = svc.expire_old_requests().await.unwrap_err();
        assert!(matches!(err, ApprovalError::Unexpected(_)));

        *flaky.broken.lock().unwrap() = None;
        assert_eq!(svc.expire_old_requests().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_execute_requires_approval_and_executor() {
        let (svc, _) = service();
        let id = firewall_request(&svc).await;

        let err = svc.execute_request(id, &alice()).await.unwrap_err();
        assert!(matches!(err, ApprovalError::Conflict(_)));

        svc.approve_request(id, &bob(), None).await.unwrap();
        let err = svc.execute_request(id, &alice()).await.unwrap_err();
        assert!(matches!(err, ApprovalError::NotImplemented(_)));
    }

    #[tokio::test]
    async fn test_execute_success_then_conflict() {
        let store = Arc::new(MemoryStore::new());
        let exec = StubExecutor::ok();
        let svc = service_with(
            store.clone(),
            PolicyRegistry::builtin(),
            ExecutorRegistry::new().with("firewall_modify", exec.clone()),
        );
        let id = firewall_request(&svc).await;
        svc.approve_request(id, &bob(), None).await.unwrap();

        let out = svc.execute_request(id, &alice()).await.unwrap();
        assert_eq!(out.status, ApprovalStatus::Executed);
        assert_eq!(out.decided_by.as_deref(), Some("bob"));
        assert!(out.executed_at.is_some());

        let err = svc.execute_request(id, &alice()).await.unwrap_err();
        assert!(matches!(err, ApprovalError::Conflict(_)));
        assert_eq!(exec.calls(), 1);

        let detail = svc.get_request(id, &alice()).await.unwrap();
        assert_eq!(detail.history.len(), 3);
        assert_eq!(detail.history[2].entry.details["result"]["applied"]["port"], 8080);
    }

    #[tokio::test]
    async fn test_execute_failure_keeps_request_approved() {
        let store = Arc::new(MemoryStore::new());
        let exec = StubExecutor::failing();
        let svc = service_with(
            store.clone(),
            PolicyRegistry::builtin(),
            ExecutorRegistry::new().with("firewall_modify", exec.clone()),
        );
        let id = firewall_request(&svc).await;
        svc.approve_request(id, &bob(), None).await.unwrap();

        let err = svc.execute_request(id, &alice()).await.unwrap_err();
        assert!(matches!(err, ApprovalError::ExecutionFailed { .. }));
        assert_eq!(exec.calls(), 1);

        let row = store.get_request(id).await.unwrap().unwrap();
        assert_eq!(row.status, ApprovalStatus::Approved);
        assert!(row.executed_at.is_none());
        let detail = svc.get_request(id, &alice()).await.unwrap();
        assert_eq!(detail.history.len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_execute_runs_executor_once() {
        let store = Arc::new(MemoryStore::new());
        let exec = StubExecutor::slow(Duration::from_millis(50));
        let svc = service_with(
            store.clone(),
            PolicyRegistry::builtin(),
            ExecutorRegistry::new().with("firewall_modify", exec.clone()),
        );
        let id = firewall_request(&svc).await;
        svc.approve_request(id, &bob(), None).await.unwrap();

        let (alice_a, alice_b) = (alice(), alice());
        let (first, second) = tokio::join!(
            svc.execute_request(id, &alice_a),
            svc.execute_request(id, &alice_b)
        );
        let results = [first, second];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(ApprovalError::Conflict(_)))));
        assert_eq!(exec.calls(), 1);
    }

    #[tokio::test]
    async fn test_auto_execute_on_approval() {
        let store = Arc::new(MemoryStore::new());
        let exec = StubExecutor::ok();
        let policies = PolicyRegistry::new(vec![ApprovalPolicy::new(
            "timezone_change",
            "Change the system timezone",
        )
        .with_auto_execute(true)])
        .unwrap();
        let svc = service_with(
            store.clone(),
            policies,
            ExecutorRegistry::new().with("timezone_change", exec.clone()),
        );
        let id = svc
            .create_request(&alice(), "timezone_change", json!({"tz": "Europe/Berlin"}), "relocation")
            .await
            .unwrap()
            .id;

        let out = svc.approve_request(id, &bob(), Some("ok")).await.unwrap();
        assert_eq!(out.status, ApprovalStatus::Executed);
        assert!(out.execution.as_ref().is_some_and(|r| r.succeeded));
        assert_eq!(exec.calls(), 1);
    }

    #[tokio::test]
    async fn test_auto_execute_failure_still_approves() {
        let store = Arc::new(MemoryStore::new());
        let policies = PolicyRegistry::new(vec![ApprovalPolicy::new("timezone_change", "")
            .with_auto_execute(true)])
        .unwrap();
        let svc = service_with(
            store.clone(),
            policies,
            ExecutorRegistry::new().with("timezone_change", StubExecutor::failing()),
        );
        let id = svc
            .create_request(&alice(), "timezone_change", json!({"tz": "UTC"}), "reset")
            .await
            .unwrap()
            .id;

        let out = svc.approve_request(id, &bob(), None).await.unwrap();
        assert_eq!(out.status, ApprovalStatus::Approved);
        let report = out.execution.unwrap();
        assert!(!report.succeeded);
        assert!(report.error.unwrap().contains("wrapper exited"));
    }

    #[tokio::test]
    async fn test_get_request_visibility() {
        let (svc, _) = service();
        let id = firewall_request(&svc).await;

        let outsider = Actor::new("eve", "Eve", Role::Viewer);
        let err = svc.get_request(id, &outsider).await.unwrap_err();
        assert!(matches!(err, ApprovalError::Forbidden(_)));

        let own = svc.get_request(id, &alice()).await.unwrap();
        assert_eq!(own.policy_description.as_deref(), Some("Add or remove a firewall rule"));
        assert_eq!(own.history.len(), 1);
        assert!(own.history[0].signature_valid);

        assert!(svc.get_request(id, &bob()).await.is_ok());
        let err = svc.get_request(Uuid::new_v4(), &bob()).await.unwrap_err();
        assert!(matches!(err, ApprovalError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_tampered_entry_fails_verification() {
        let (svc, store) = service();
        let id = firewall_request(&svc).await;
        svc.approve_request(id, &bob(), Some("looks fine")).await.unwrap();

        let before = svc.get_request(id, &bob()).await.unwrap();
        assert!(before.history.iter().all(|h| h.signature_valid));

        let approved_entry = before.history[1].entry.id;
        assert!(
            store
                .overwrite_history_details(approved_entry, json!({"comment": "rubber stamp"}))
                .await
        );

        let after = svc.get_request(id, &bob()).await.unwrap();
        assert!(after.history[0].signature_valid);
        assert!(!after.history[1].signature_valid);
    }
}
