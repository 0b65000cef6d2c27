//! Background job: expire pending approval requests whose TTL has run out.
//!
//! The engine owns no timers; this loop lives in the server binary and just
//! calls [`ApprovalService::expire_old_requests`] on a fixed interval.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use crate::workflow::ApprovalService;

/// Spawn the expiry sweep. Call this once at startup.
pub fn spawn(service: Arc<ApprovalService>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            match service.expire_old_requests().await {
                Ok(0) => {}
                Ok(n) => tracing::debug!(expired = n, "expiry job tick"),
                Err(e) => tracing::error!("expiry job failed: {}", e),
            }
        }
    })
}
