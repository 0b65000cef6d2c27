//! Human approval gate for privileged host operations.
//!
//! Library crate shared by the `hostgate` binary and the integration tests
//! in `tests/`.

pub mod api;
pub mod config;
pub mod errors;
pub mod executor;
pub mod jobs;
pub mod middleware;
pub mod models;
pub mod store;
pub mod workflow;

use std::sync::Arc;

use workflow::ApprovalService;

/// Shared application state passed to handlers and middleware.
pub struct AppState {
    pub service: Arc<ApprovalService>,
    /// Expected `X-Api-Key`; `None` disables the check.
    pub api_key: Option<String>,
}
