pub mod webhook;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

/// Performs the privileged action behind one request type.
///
/// Implementations are owned by the command-wrapper layer; the engine only
/// looks them up and calls them once a request is approved. Execution is not
/// assumed to be idempotent, so the engine never retries.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, payload: &serde_json::Value) -> anyhow::Result<serde_json::Value>;
}

/// request_type → executor, built once at startup.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn Executor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, request_type: impl Into<String>, executor: Arc<dyn Executor>) {
        self.executors.insert(request_type.into(), executor);
    }

    pub fn with(mut self, request_type: impl Into<String>, executor: Arc<dyn Executor>) -> Self {
        self.register(request_type, executor);
        self
    }

    pub fn get(&self, request_type: &str) -> Option<Arc<dyn Executor>> {
        self.executors.get(request_type).cloned()
    }

    pub fn request_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.executors.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}

impl std::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("request_types", &self.request_types())
            .finish()
    }
}
