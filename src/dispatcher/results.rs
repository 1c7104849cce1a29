use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::dispatcher::job::JobResult;

/// Completed jobs keyed by urn. Entries are never evicted.
#[derive(Debug, Clone, Default)]
pub struct ResultStore {
    results: Arc<RwLock<HashMap<String, JobResult>>>,
}

impl ResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a result, replacing any earlier one for the same urn.
    pub async fn record(&self, result: JobResult) {
        self.results
            .write()
            .await
            .insert(result.urn.clone(), result);
    }

    pub async fn get(&self, urn: &str) -> Option<JobResult> {
        self.results.read().await.get(urn).cloned()
    }

    /// All results in completion order.
    pub async fn list(&self) -> Vec<JobResult> {
        let mut results: Vec<JobResult> = self.results.read().await.values().cloned().collect();
        results.sort_by_key(|r| r.timestamp);
        results
    }

    pub async fn len(&self) -> usize {
        self.results.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.results.read().await.is_empty()
    }
}
