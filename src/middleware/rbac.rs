use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::errors::ApprovalError;

/// Roles carried by an authenticated actor.
/// The engine only compares roles; it never authenticates.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Role {
    Admin,
    Approver,
    Operator,
    Viewer,
    /// Internal actor used by the expiry sweep.
    System,
    Custom(String),
}

impl Role {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "admin" => Role::Admin,
            "approver" => Role::Approver,
            "operator" => Role::Operator,
            "viewer" => Role::Viewer,
            "system" => Role::System,
            other => Role::Custom(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Role::Admin => "admin",
            Role::Approver => "approver",
            Role::Operator => "operator",
            Role::Viewer => "viewer",
            Role::System => "system",
            Role::Custom(name) => name.as_str(),
        }
    }

    /// Check if this role has the required permission level.
    pub fn has_permission(&self, required: &Permission) -> bool {
        match required {
            Permission::Request => !matches!(self, Role::System),
            Permission::Decide | Permission::ViewAll => {
                matches!(self, Role::Admin | Role::Approver)
            }
            Permission::Administer => matches!(self, Role::Admin),
        }
    }

    /// A policy's `required_role` is met by that exact role, or by admin.
    pub fn satisfies(&self, required: &Role) -> bool {
        self == &Role::Admin || self == required
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Role {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Role {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Role::parse(&s))
    }
}

/// Permission levels for RBAC enforcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    /// Propose, cancel and execute own requests.
    Request,
    /// Approve or reject someone else's request.
    Decide,
    /// Read any request, not just one's own.
    ViewAll,
    Administer,
}

/// Already-authenticated identity handed to every engine entry point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
    pub name: String,
    pub role: Role,
}

impl Actor {
    pub fn new(id: impl Into<String>, name: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            role,
        }
    }

    /// The actor recorded on entries written by the expiry sweep.
    pub fn system() -> Self {
        Self::new("system", "expiry-sweep", Role::System)
    }

    pub fn has_permission(&self, required: &Permission) -> bool {
        self.role.has_permission(required)
    }
}

/// Check `permission` for `actor`, logging and returning Forbidden on failure.
pub fn enforce(actor: &Actor, permission: Permission, action: &str) -> Result<(), ApprovalError> {
    if actor.has_permission(&permission) {
        return Ok(());
    }
    tracing::warn!(
        actor_id = %actor.id,
        role = %actor.role,
        action,
        "RBAC access denied: {:?} required",
        permission
    );
    Err(ApprovalError::Forbidden(format!(
        "role '{}' may not {}",
        actor.role, action
    )))
}

// ── Tests ───────────────────────────────────────────────────────
