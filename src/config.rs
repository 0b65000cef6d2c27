use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Context;
use serde::Deserialize;

use crate::executor::webhook::WebhookExecutor;
use crate::executor::ExecutorRegistry;
use crate::models::policy::{ApprovalPolicy, PolicyRegistry};

const PLACEHOLDER_SECRET: &str = "CHANGE_ME_AUDIT_SECRET";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    Memory,
}

impl FromStr for StoreBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "postgres" | "postgresql" | "pg" => Ok(StoreBackend::Postgres),
            "memory" | "mem" => Ok(StoreBackend::Memory),
            other => anyhow::bail!("unknown HOSTGATE_STORE '{}': expected postgres or memory", other),
        }
    }
}

#[derive(Debug)]
pub struct Config {
    pub port: u16,
    pub database_url: String,
    pub store: StoreBackend,
    /// Required on every `/api/v1` call when set. Unset disables the check.
    pub api_key: Option<String>,
    audit_secret: String,
    production: bool,
    /// YAML file with `policies` and `executors`. Unset means the built-in
    /// policy set with no executors.
    pub policy_file: Option<PathBuf>,
    /// Seconds between expiry sweeps in the server. 0 disables the sweep.
    pub expiry_interval_secs: u64,
}

impl Config {
    /// The HMAC key for audit entries. The placeholder is refused in
    /// production and only warned about elsewhere.
    pub fn audit_secret(&self) -> anyhow::Result<&str> {
        if self.audit_secret == PLACEHOLDER_SECRET {
            if self.production {
                anyhow::bail!(
                    "HOSTGATE_AUDIT_SECRET is still the insecure placeholder. \
                     Set a real signing secret before running in production."
                );
            }
            tracing::warn!(
                "HOSTGATE_AUDIT_SECRET is not set, signing audit entries with an insecure placeholder"
            );
        }
        Ok(&self.audit_secret)
    }

    /// Policy and executor registries as configured.
    pub fn registries(&self) -> anyhow::Result<(PolicyRegistry, ExecutorRegistry)> {
        match &self.policy_file {
            Some(path) => PolicyFile::load(path)?.into_registries(),
            None => Ok((PolicyRegistry::builtin(), ExecutorRegistry::new())),
        }
    }
}

pub fn load() -> anyhow::Result<Config> {
    dotenvy::dotenv().ok();
    from_lookup(|key| std::env::var(key).ok())
}

/// Build a [`Config`] from any key → value source.
pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> anyhow::Result<Config> {
    let audit_secret = get("HOSTGATE_AUDIT_SECRET")
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| PLACEHOLDER_SECRET.into());
    let production = get("HOSTGATE_ENV")
        .or_else(|| get("RUST_ENV"))
        .is_some_and(|mode| mode == "production");

    let store = match get("HOSTGATE_STORE") {
        Some(v) => v.parse()?,
        None => StoreBackend::Postgres,
    };

    Ok(Config {
        port: get("HOSTGATE_PORT")
            .and_then(|v| v.parse().ok())
            .unwrap_or(8080),
        database_url: get("DATABASE_URL")
            .unwrap_or_else(|| "postgres://localhost/hostgate".into()),
        store,
        api_key: get("HOSTGATE_API_KEY").filter(|k| !k.is_empty()),
        audit_secret,
        production,
        policy_file: get("HOSTGATE_POLICY_FILE")
            .filter(|p| !p.is_empty())
            .map(PathBuf::from),
        expiry_interval_secs: get("HOSTGATE_EXPIRY_INTERVAL_SECS")
            .and_then(|v| v.parse().ok())
            .unwrap_or(60),
    })
}

// ── Policy file ──────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyFile {
    /// Empty means the built-in policy set.
    #[serde(default)]
    pub policies: Vec<ApprovalPolicy>,
    #[serde(default)]
    pub executors: BTreeMap<String, ExecutorConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecutorConfig {
    pub url: String,
    /// HMAC key for the request signature header.
    #[serde(default)]
    pub secret: Option<String>,
    /// Name of an environment variable holding the HMAC key.
    #[serde(default)]
    pub secret_env: Option<String>,
}

impl ExecutorConfig {
    fn resolve_secret(&self) -> anyhow::Result<Option<String>> {
        match (&self.secret, &self.secret_env) {
            (Some(_), Some(_)) => anyhow::bail!("set either secret or secret_env, not both"),
            (Some(s), None) => Ok(Some(s.clone())),
            (None, Some(var)) => std::env::var(var)
                .map(Some)
                .with_context(|| format!("environment variable {} is not set", var)),
            (None, None) => Ok(None),
        }
    }
}

impl PolicyFile {
    pub fn from_yaml(text: &str) -> anyhow::Result<Self> {
        serde_yaml::from_str(text).context("invalid policy file")
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read policy file {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("in {}", path.display()))
    }

    /// Validate and build both registries. Every executor must name a
    /// request type that has a policy.
    pub fn into_registries(self) -> anyhow::Result<(PolicyRegistry, ExecutorRegistry)> {
        let policies = if self.policies.is_empty() {
            PolicyRegistry::builtin()
        } else {
            PolicyRegistry::new(self.policies)?
        };

        let mut executors = ExecutorRegistry::new();
        for (request_type, cfg) in self.executors {
            if policies.get(&request_type).is_none() {
                anyhow::bail!("executor configured for unknown request type '{}'", request_type);
            }
            let secret = cfg
                .resolve_secret()
                .with_context(|| format!("executor '{}'", request_type))?;
            let executor = WebhookExecutor::new(cfg.url, secret)
                .with_context(|| format!("executor '{}'", request_type))?;
            executors.register(request_type, Arc::new(executor));
        }

        for policy in policies.list().iter().filter(|p| p.auto_execute) {
            if executors.get(&policy.request_type).is_none() {
                tracing::warn!(
                    request_type = %policy.request_type,
                    "auto_execute is set but no executor is configured"
                );
            }
        }

        Ok((policies, executors))
    }
}
