//! Picking an idle worker for a job.
//!
//! [`SmartRouter`] drives a [`DiscoverySequence`] over the directory and
//! health-probes each candidate in turn. The first worker that answers its
//! probe in time and reports `idle` wins. Running out of attempts is an
//! ordinary outcome, [`Route::NoCapacity`], and callers branch on it.
//!
//! There is no reservation between a successful probe and the dispatcher's
//! start command, so two concurrent routing attempts may pick the same worker.

pub mod discovery;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::client::WorkerClient;
use crate::config::DiscoveryConfig;
use crate::directory::{ServiceDirectory, ServiceInstance};
use crate::error::MultigrainError;
use crate::worker::StateName;

pub use discovery::{Backoff, DiscoverySequence, RetryPolicy};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Worker(ServiceInstance),
    NoCapacity,
}

pub struct SmartRouter {
    directory: ServiceDirectory,
    client: Arc<dyn WorkerClient>,
    policy: RetryPolicy,
    probe_timeout: Duration,
}

impl SmartRouter {
    pub fn new(
        directory: ServiceDirectory,
        client: Arc<dyn WorkerClient>,
        config: &DiscoveryConfig,
    ) -> Self {
        Self {
            directory,
            client,
            policy: config.retry_policy(),
            probe_timeout: config.probe_timeout,
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub async fn find_idle_worker(&self, namespace: &str) -> Route {
        self.find_idle_worker_until(namespace, CancellationToken::new())
            .await
    }

    /// Like [`find_idle_worker`](Self::find_idle_worker), giving up as soon as
    /// `cancel` fires.
    pub async fn find_idle_worker_until(
        &self,
        namespace: &str,
        cancel: CancellationToken,
    ) -> Route {
        let snapshot = self.directory.list(namespace).await;
        let candidates = snapshot.len();
        let mut sequence = self.policy.sequence(snapshot).with_cancellation(cancel);

        while let Some(instance) = sequence.next().await {
            tracing::debug!(worker = %instance.name, host = %instance.host, "Querying worker status");
            if self.is_available(&instance).await {
                tracing::info!(worker = %instance.name, host = %instance.host, "Idle worker located");
                return Route::Worker(instance);
            }
        }

        tracing::warn!(
            namespace,
            candidates,
            cycles = sequence.cycles(),
            "No idle worker found"
        );
        Route::NoCapacity
    }

    async fn is_available(&self, instance: &ServiceInstance) -> bool {
        let probe = tokio::time::timeout(self.probe_timeout, self.client.status(instance)).await;
        let result = match probe {
            Ok(result) => result,
            Err(_) => Err(MultigrainError::ProbeTimeout(self.probe_timeout)),
        };

        match result {
            Ok(status) => status.state.name == StateName::Idle,
            Err(e) => {
                tracing::warn!(worker = %instance.name, error = %e, "Status probe failed");
                false
            }
        }
    }
}
