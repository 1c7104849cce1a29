use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

use crate::routing::discovery::{Backoff, RetryPolicy};
use crate::worker::settings::{DeviceSettings, SchemaVersion};

/// Namespace workers register under unless told otherwise.
pub const DEFAULT_NAMESPACE: &str = "hypertoast";

/// Topic job submissions are published to and consumed from.
pub const DEFAULT_INGRESS_TOPIC: &str = "ingress";

/// How a routing attempt walks the directory.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Passes over the directory snapshot before giving up
    pub max_cycles: u32,
    /// Base delay between passes; the n-th pass waits `n * base_delay`
    pub base_delay: Duration,
    /// Upper bound on a single status probe
    pub probe_timeout: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            max_cycles: 5,
            base_delay: Duration::from_millis(500),
            probe_timeout: Duration::from_secs(2),
        }
    }
}

impl DiscoveryConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_cycles,
            Backoff::Linear {
                base: self.base_delay,
            },
        )
    }
}

/// Connection settings for the JetStream-backed queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatsConfig {
    pub url: String,
    /// JetStream stream holding every topic
    pub stream: String,
    /// Topics map to subjects `<subject_prefix>.<topic>`
    pub subject_prefix: String,
    pub connect_timeout: Duration,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: "nats://127.0.0.1:4222".to_string(),
            stream: "MULTIGRAIN".to_string(),
            subject_prefix: "multigrain".to_string(),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl NatsConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn with_stream(mut self, stream: impl Into<String>) -> Self {
        self.stream = stream.into();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum QueueBackend {
    #[default]
    Memory,
    Nats(NatsConfig),
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Partitions created for each new topic (memory backend)
    pub partitions: usize,
    /// Records kept per partition once every consumer has read past them.
    /// `None` keeps the whole log.
    pub max_retained: Option<usize>,
    pub backend: QueueBackend,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            partitions: 1,
            max_retained: Some(10_000),
            backend: QueueBackend::Memory,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub listen_addr: SocketAddr,
    pub namespace: String,
    pub ingress_topic: String,
    /// Settings schema version pushed to workers
    pub schema_version: SchemaVersion,
    /// Cook level -> duration in milliseconds, used when a job names a level
    /// instead of carrying a full `cookConfig`
    pub cook_timers: BTreeMap<u32, u64>,
    pub discovery: DiscoveryConfig,
    pub queue: QueueConfig,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 3010)),
            namespace: DEFAULT_NAMESPACE.to_string(),
            ingress_topic: DEFAULT_INGRESS_TOPIC.to_string(),
            schema_version: SchemaVersion::V2,
            cook_timers: BTreeMap::from([(1, 50_000), (2, 120_000)]),
            discovery: DiscoveryConfig::default(),
            queue: QueueConfig::default(),
        }
    }
}

impl DispatcherConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_cook_timer(mut self, level: u32, millis: u64) -> Self {
        self.cook_timers.insert(level, millis);
        self
    }
}

/// Delays driving the automatic transitions of a cook cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleTimings {
    /// starting -> preheating
    pub starting: Duration,
    /// preheating -> cooking
    pub preheating: Duration,
    /// Re-evaluation interval while cooking
    pub cooking_tick: Duration,
}

impl Default for CycleTimings {
    fn default() -> Self {
        Self {
            starting: Duration::from_secs(5),
            preheating: Duration::from_secs(10),
            cooking_tick: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub name: String,
    pub listen_addr: SocketAddr,
    /// Host the dispatcher should use to reach this worker
    pub advertise_host: String,
    pub namespace: String,
    /// Dispatcher to register with on startup, if any
    pub dispatcher_url: Option<String>,
    pub timings: CycleTimings,
    pub initial_settings: DeviceSettings,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "toaster-1".to_string(),
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 3020)),
            advertise_host: "127.0.0.1".to_string(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            dispatcher_url: None,
            timings: CycleTimings::default(),
            initial_settings: DeviceSettings::default(),
        }
    }
}

impl WorkerConfig {
    pub fn new(name: impl Into<String>, listen_addr: SocketAddr) -> Self {
        Self {
            name: name.into(),
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_dispatcher(mut self, url: impl Into<String>) -> Self {
        self.dispatcher_url = Some(url.into());
        self
    }

    pub fn port(&self) -> u16 {
        self.listen_addr.port()
    }
}
