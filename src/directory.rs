use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{MultigrainError, Result};

/// A registered worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInstance {
    pub namespace: String,
    pub host: String,
    pub port: u16,
    pub name: String,
    pub registered_at: DateTime<Utc>,
}

impl ServiceInstance {
    /// `urn:<namespace>:<name>`, accepted by [`ServiceDirectory::deregister`].
    pub fn instance_id(&self) -> String {
        format!("urn:{}:{}", self.namespace, self.name)
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

/// In-memory registry of worker instances, keyed by namespace and host.
///
/// Cloning is cheap and every clone shares the same entries. Writers are
/// serialized by a single lock; the last registration for a host wins.
#[derive(Debug, Clone, Default)]
pub struct ServiceDirectory {
    // Vec keeps registration order, which is the order routing walks.
    entries: Arc<RwLock<HashMap<String, Vec<ServiceInstance>>>>,
}

impl ServiceDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a worker, replacing any entry with the same host in place.
    pub async fn register(
        &self,
        namespace: &str,
        host: &str,
        port: u16,
        name: &str,
    ) -> Result<ServiceInstance> {
        if namespace.is_empty() || host.is_empty() || name.is_empty() {
            return Err(MultigrainError::Registration(
                "namespace, host and name are required".to_string(),
            ));
        }
        if namespace.contains(':') || name.contains(':') {
            return Err(MultigrainError::Registration(
                "namespace and name must not contain ':'".to_string(),
            ));
        }
        if port == 0 {
            return Err(MultigrainError::Registration(
                "port must be non-zero".to_string(),
            ));
        }

        let instance = ServiceInstance {
            namespace: namespace.to_string(),
            host: host.to_string(),
            port,
            name: name.to_string(),
            registered_at: Utc::now(),
        };

        let mut entries = self.entries.write().await;
        let list = entries.entry(namespace.to_string()).or_default();
        match list.iter_mut().find(|existing| existing.host == host) {
            Some(existing) => *existing = instance.clone(),
            None => list.push(instance.clone()),
        }

        tracing::info!(namespace, host, port, name, "Service registered");
        Ok(instance)
    }

    /// Remove every entry in the urn's namespace whose name matches its trailing
    /// segment. Returns the removed instances.
    pub async fn deregister(&self, urn: &str) -> Result<Vec<ServiceInstance>> {
        let (namespace, name) = parse_urn(urn)?;

        let mut entries = self.entries.write().await;
        let list = entries
            .get_mut(namespace)
            .ok_or_else(|| MultigrainError::NotFound(format!("namespace {}", namespace)))?;

        let (removed, kept): (Vec<_>, Vec<_>) =
            list.drain(..).partition(|instance| instance.name == name);
        *list = kept;

        if removed.is_empty() {
            return Err(MultigrainError::NotFound(format!("service {}", urn)));
        }

        tracing::info!(urn, removed = removed.len(), "Service deregistered");
        Ok(removed)
    }

    /// Snapshot of a namespace in registration order. Unknown namespaces are empty.
    pub async fn list(&self, namespace: &str) -> Vec<ServiceInstance> {
        self.entries
            .read()
            .await
            .get(namespace)
            .cloned()
            .unwrap_or_default()
    }
}

/// Split `urn:<namespace>:<name>` (or any `...:<namespace>:<name>`) into its
/// namespace and name.
fn parse_urn(urn: &str) -> Result<(&str, &str)> {
    let mut segments = urn.rsplit(':');
    let name = segments.next().filter(|s| !s.is_empty());
    let namespace = segments.next().filter(|s| !s.is_empty());
    match (namespace, name) {
        (Some(namespace), Some(name)) => Ok((namespace, name)),
        _ => Err(MultigrainError::NotFound(format!("malformed urn {}", urn))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_urn_takes_trailing_segments() {
        assert_eq!(parse_urn("urn:ovens:toaster-1").unwrap(), ("ovens", "toaster-1"));
        assert_eq!(parse_urn("ovens:toaster-1").unwrap(), ("ovens", "toaster-1"));
        assert!(parse_urn("toaster-1").is_err());
        assert!(parse_urn("urn:ovens:").is_err());
    }
}
