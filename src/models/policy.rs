use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::middleware::rbac::Role;

/// TTL applied when a policy does not set one.
pub const DEFAULT_TTL_SECS: u64 = 24 * 60 * 60;
/// Upper bound accepted for `ttl_secs` (ten years).
pub const MAX_TTL_SECS: u64 = 10 * 365 * 24 * 60 * 60;

// ── Policy ───────────────────────────────────────────────────

/// Static configuration for one request type.
///
/// Loaded once at startup and handed to the engine by reference; the engine
/// never mutates it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApprovalPolicy {
    pub request_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_approval_required")]
    pub approval_required: bool,
    /// Deciders must hold this role (admins always qualify).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_role: Option<Role>,
    /// Seconds a request may stay pending before it becomes expirable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_secs: Option<u64>,
    /// Dispatch to the executor as part of the approving call.
    #[serde(default)]
    pub auto_execute: bool,
}

fn default_approval_required() -> bool {
    true
}

impl ApprovalPolicy {
    pub fn new(request_type: &str, description: &str) -> Self {
        Self {
            request_type: request_type.to_string(),
            description: description.to_string(),
            approval_required: true,
            required_role: None,
            ttl_secs: None,
            auto_execute: false,
        }
    }

    pub fn with_required_role(mut self, role: Role) -> Self {
        self.required_role = Some(role);
        self
    }

    pub fn with_ttl_secs(mut self, secs: u64) -> Self {
        self.ttl_secs = Some(secs);
        self
    }

    pub fn with_auto_execute(mut self, auto_execute: bool) -> Self {
        self.auto_execute = auto_execute;
        self
    }

    pub fn ttl(&self) -> chrono::Duration {
        let secs = self.ttl_secs.unwrap_or(DEFAULT_TTL_SECS).min(MAX_TTL_SECS);
        chrono::Duration::seconds(secs as i64)
    }
}

// ── Registry ─────────────────────────────────────────────────

/// request_type → policy. Iteration order is sorted by request type.
#[derive(Debug, Clone, Default)]
pub struct PolicyRegistry {
    policies: BTreeMap<String, ApprovalPolicy>,
}

impl PolicyRegistry {
    pub fn new(policies: impl IntoIterator<Item = ApprovalPolicy>) -> anyhow::Result<Self> {
        let mut map = BTreeMap::new();
        for mut policy in policies {
            let key = policy.request_type.trim().to_string();
            if key.is_empty() {
                anyhow::bail!("policy with empty request_type");
            }
            if !key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
            {
                anyhow::bail!("invalid request_type '{}'", key);
            }
            match policy.ttl_secs {
                Some(0) => anyhow::bail!("policy '{}': ttl_secs must be greater than zero", key),
                Some(secs) if secs > MAX_TTL_SECS => {
                    anyhow::bail!("policy '{}': ttl_secs exceeds {}", key, MAX_TTL_SECS)
                }
                _ => {}
            }
            policy.request_type = key.clone();
            if map.insert(key.clone(), policy).is_some() {
                anyhow::bail!("duplicate policy for request_type '{}'", key);
            }
        }
        Ok(Self { policies: map })
    }

    /// Registry covering the privileged operations the admin backend exposes.
    pub fn builtin() -> Self {
        let policies = vec![
            ApprovalPolicy::new("service_stop", "Stop a running system service")
                .with_ttl_secs(4 * 60 * 60),
            ApprovalPolicy::new("firewall_modify", "Add or remove a firewall rule"),
            ApprovalPolicy::new("user_create", "Create a local user account"),
            ApprovalPolicy::new("user_delete", "Delete a local user account")
                .with_required_role(Role::Admin),
            ApprovalPolicy::new("group_modify", "Change local group membership"),
            ApprovalPolicy::new("system_shutdown", "Power off the host")
                .with_required_role(Role::Admin)
                .with_ttl_secs(60 * 60),
            ApprovalPolicy::new("system_reboot", "Reboot the host")
                .with_required_role(Role::Admin)
                .with_ttl_secs(60 * 60),
            ApprovalPolicy::new("timezone_change", "Change the system timezone"),
        ];
        let policies = policies
            .into_iter()
            .map(|p| (p.request_type.clone(), p))
            .collect();
        Self { policies }
    }

    pub fn get(&self, request_type: &str) -> Option<&ApprovalPolicy> {
        self.policies.get(request_type)
    }

    pub fn list(&self) -> Vec<ApprovalPolicy> {
        self.policies.values().cloned().collect()
    }

    pub fn request_types(&self) -> impl Iterator<Item = &str> {
        self.policies.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}
