//! Audit entry construction and HMAC signing.
//!
//! Canonical form: compact JSON of the immutable fields in declaration order
//! of [`CanonicalEntry`]. Timestamps are RFC 3339 UTC with microsecond
//! precision, `details` keys are sorted (serde_json's default map), and the
//! bytes are UTF-8. Timestamps are truncated to microseconds before signing,
//! which is the resolution Postgres keeps, so a round-trip through the store
//! reproduces the same bytes.

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::middleware::rbac::Actor;
use crate::models::approval::ApprovalStatus;
use crate::models::audit::{AuditAction, AuditEntry};

type HmacSha256 = Hmac<Sha256>;

/// Current time at the resolution the store persists.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

#[derive(Serialize)]
struct CanonicalEntry<'a> {
    id: &'a Uuid,
    approval_request_id: &'a Uuid,
    action: &'a str,
    actor_id: &'a str,
    actor_name: &'a str,
    actor_role: &'a str,
    timestamp: String,
    previous_status: Option<&'a str>,
    new_status: &'a str,
    details: &'a serde_json::Value,
}

fn canonical_bytes(entry: &AuditEntry) -> Vec<u8> {
    let canonical = CanonicalEntry {
        id: &entry.id,
        approval_request_id: &entry.approval_request_id,
        action: entry.action.as_str(),
        actor_id: &entry.actor_id,
        actor_name: &entry.actor_name,
        actor_role: &entry.actor_role,
        timestamp: entry
            .timestamp
            .to_rfc3339_opts(SecondsFormat::Micros, true),
        previous_status: entry.previous_status.map(|s| s.as_str()),
        new_status: entry.new_status.as_str(),
        details: &entry.details,
    };
    // Serializing borrowed strings and a Value cannot fail.
    serde_json::to_vec(&canonical).unwrap_or_default()
}

/// Keyed signer for audit entries. The secret is wiped on drop.
#[derive(Clone)]
pub struct AuditSigner {
    secret: Zeroizing<Vec<u8>>,
}

impl std::fmt::Debug for AuditSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditSigner").finish_non_exhaustive()
    }
}

impl AuditSigner {
    pub fn new(secret: impl AsRef<[u8]>) -> anyhow::Result<Self> {
        let secret = secret.as_ref();
        if secret.is_empty() {
            anyhow::bail!("audit signing secret must not be empty");
        }
        Ok(Self {
            secret: Zeroizing::new(secret.to_vec()),
        })
    }

    fn mac(&self) -> HmacSha256 {
        HmacSha256::new_from_slice(&self.secret).expect("HMAC can take key of any size")
    }

    /// Lowercase hex HMAC-SHA256 over the canonical form.
    pub fn sign(&self, entry: &AuditEntry) -> String {
        let mut mac = self.mac();
        mac.update(&canonical_bytes(entry));
        hex::encode(mac.finalize().into_bytes())
    }

    /// Recompute the signature and compare in constant time.
    pub fn verify(&self, entry: &AuditEntry) -> bool {
        let Ok(expected) = hex::decode(&entry.signature) else {
            return false;
        };
        let mut mac = self.mac();
        mac.update(&canonical_bytes(entry));
        mac.verify_slice(&expected).is_ok()
    }

    /// Build and sign the entry recording `previous -> new_status`.
    pub fn entry(
        &self,
        request_id: Uuid,
        actor: &Actor,
        previous: Option<ApprovalStatus>,
        new_status: ApprovalStatus,
        details: serde_json::Value,
        at: DateTime<Utc>,
    ) -> AuditEntry {
        let mut entry = AuditEntry {
            id: Uuid::new_v4(),
            approval_request_id: request_id,
            action: AuditAction::for_status(new_status),
            actor_id: actor.id.clone(),
            actor_name: actor.name.clone(),
            actor_role: actor.role.to_string(),
            timestamp: at.trunc_subsecs(6),
            previous_status: previous,
            new_status,
            details,
            signature: String::new(),
        };
        entry.signature = self.sign(&entry);
        entry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::rbac::Role;
    use serde_json::json;

    fn signer() -> AuditSigner {
        AuditSigner::new("test-secret").unwrap()
    }

    fn sample(signer: &AuditSigner) -> AuditEntry {
        signer.entry(
            Uuid::new_v4(),
            &Actor::new("bob", "Bob", Role::Approver),
            Some(ApprovalStatus::Pending),
            ApprovalStatus::Approved,
            json!({"comment": "looks fine"}),
            Utc::now(),
        )
    }

    #[test]
    fn test_fresh_entry_verifies() {
        let s = signer();
        let entry = sample(&s);
        assert_eq!(entry.signature.len(), 64);
        assert!(s.verify(&entry));
        assert_eq!(entry.action, AuditAction::Approved);
    }

    #[test]
    fn test_sign_is_deterministic() {
        let s = signer();
        let entry = sample(&s);
        assert_eq!(s.sign(&entry), s.sign(&entry.clone()));
    }

    #[test]
    fn test_tampered_fields_fail_verification() {
        let s = signer();
        let entry = sample(&s);

        let mut e = entry.clone();
        e.details = json!({"comment": "edited"});
        assert!(!s.verify(&e));

        let mut e = entry.clone();
        e.actor_id = "mallory".into();
        assert!(!s.verify(&e));

        let mut e = entry.clone();
        e.new_status = ApprovalStatus::Rejected;
        assert!(!s.verify(&e));

        let mut e = entry.clone();
        e.timestamp = e.timestamp + chrono::Duration::microseconds(1);
        assert!(!s.verify(&e));

        let mut e = entry;
        e.signature = "not-hex".into();
        assert!(!s.verify(&e));
    }

    #[test]
    fn test_other_secret_fails_verification() {
        let entry = sample(&signer());
        let other = AuditSigner::new("other-secret").unwrap();
        assert!(!other.verify(&entry));
    }

    #[test]
    fn test_details_key_order_does_not_matter() {
        let s = signer();
        let mut entry = sample(&s);
        entry.details = serde_json::from_str(r#"{"b": 1, "a": 2}"#).unwrap();
        entry.signature = s.sign(&entry);
        let mut reordered = entry.clone();
        reordered.details = serde_json::from_str(r#"{"a": 2, "b": 1}"#).unwrap();
        assert!(s.verify(&reordered));
    }

    #[test]
    fn test_timestamp_truncated_to_micros() {
        let entry = sample(&signer());
        assert_eq!(entry.timestamp.timestamp_subsec_nanos() % 1_000, 0);
    }

    #[test]
    fn test_empty_secret_rejected() {
        assert!(AuditSigner::new("").is_err());
    }
}
