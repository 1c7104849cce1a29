//! Job ingestion and dispatch.
//!
//! `submit_job` publishes an envelope to the ingress topic and returns at once.
//! The dispatcher consumes that topic and, for each record in turn:
//!
//! 1. asks the [`SmartRouter`] for an idle worker
//! 2. pushes the job's settings to it
//! 3. opens the worker's event stream and issues `start`
//! 4. spawns a listener that records a [`JobResult`] when the worker reports
//!    the job's cycle finished
//!
//! Steps 1-4 are awaited before the next record is taken, so one slow routing
//! attempt delays every job behind it on that partition. A job for which no
//! idle worker is found is dropped.

pub mod api;
pub mod job;
pub mod results;

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;

use crate::client::{EventStream, WorkerClient};
use crate::config::DispatcherConfig;
use crate::directory::{ServiceDirectory, ServiceInstance};
use crate::error::{MultigrainError, Result};
use crate::message::{Message, MessageBody, MessageHeader};
use crate::queue::{JobQueue, Record, RecordHandler, Subscription};
use crate::routing::{Route, SmartRouter};
use crate::worker::settings::SSE_TRANSPORT;
use crate::worker::{DeviceSettings, DeviceStatus, SchemaVersion, StateName};

pub use job::{DispatchOutcome, JobRequest, JobResult};
pub use results::ResultStore;

pub struct Dispatcher {
    config: DispatcherConfig,
    directory: ServiceDirectory,
    router: SmartRouter,
    client: Arc<dyn WorkerClient>,
    queue: Arc<dyn JobQueue>,
    results: ResultStore,
    shutdown: CancellationToken,
}

impl Dispatcher {
    pub fn new(
        config: DispatcherConfig,
        directory: ServiceDirectory,
        queue: Arc<dyn JobQueue>,
        client: Arc<dyn WorkerClient>,
        shutdown: CancellationToken,
    ) -> Self {
        let router = SmartRouter::new(directory.clone(), client.clone(), &config.discovery);
        Self {
            config,
            directory,
            router,
            client,
            queue,
            results: ResultStore::new(),
            shutdown,
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn directory(&self) -> &ServiceDirectory {
        &self.directory
    }

    pub fn results(&self) -> &ResultStore {
        &self.results
    }

    /// Begin consuming the ingress topic.
    pub async fn start(self: Arc<Self>) -> Result<Subscription> {
        let topic = self.config.ingress_topic.clone();
        let queue = self.queue.clone();
        queue.subscribe(&topic, self).await
    }

    /// Publish a job and return `{id, urn, ...preferences}` without waiting for
    /// it to be dispatched.
    pub async fn submit_job(&self, preferences: Value) -> Result<Value> {
        let Value::Object(preferences) = preferences else {
            return Err(MultigrainError::InvalidMessage(
                "job preferences must be a JSON object".to_string(),
            ));
        };

        let job = JobRequest::new(preferences);
        let payload = Value::Object(job.payload());
        let header = MessageHeader::new(&job.urn, job::JOB_EVENT_TYPE, job::JOB_EVENT_NAME)?;
        let message = Message::new(header, MessageBody::new(payload.clone()));

        let metadata = self.queue.put(&self.config.ingress_topic, &message).await?;
        tracing::info!(
            job_id = %job.id,
            urn = %job.urn,
            partition = metadata.partition,
            offset = metadata.offset,
            "Job submitted"
        );
        Ok(payload)
    }

    pub async fn handle_record(&self, record: Record) -> Result<DispatchOutcome> {
        let message = Message::from_slice(&record.value)?;
        let job = JobRequest::from_message(&message)?;
        tracing::info!(job_id = %job.id, urn = %job.urn, offset = record.offset, "Dispatching job");

        let route = self
            .router
            .find_idle_worker_until(&self.config.namespace, self.shutdown.clone())
            .await;

        match route {
            Route::Worker(instance) => {
                self.dispatch_to(&job, &instance).await?;
                Ok(DispatchOutcome::Dispatched {
                    worker: instance.name,
                })
            }
            Route::NoCapacity => {
                tracing::warn!(
                    job_id = %job.id,
                    urn = %job.urn,
                    namespace = %self.config.namespace,
                    "No idle worker available, dropping job"
                );
                Ok(DispatchOutcome::Dropped)
            }
        }
    }

    async fn dispatch_to(&self, job: &JobRequest, instance: &ServiceInstance) -> Result<()> {
        let settings = self.device_settings(job);
        self.client.push_settings(instance, &settings).await?;

        // Subscribe before starting so the completion event cannot be missed.
        let events = self.client.events(instance).await?;
        let status = self.client.start(instance).await?;
        if status.state.job_id.as_deref() != Some(job.urn.as_str()) {
            return Err(MultigrainError::Internal(format!(
                "worker {} is running {:?}, not {}",
                instance.name, status.state.job_id, job.urn
            )));
        }

        tracing::info!(job_id = %job.id, worker = %instance.name, "Cook cycle started");
        tokio::spawn(await_completion(
            events,
            job.clone(),
            instance.name.clone(),
            self.results.clone(),
            self.shutdown.clone(),
        ));
        Ok(())
    }

    /// Settings for a job. Preferences that already carry a `cookConfig` pass
    /// through; otherwise `level` selects from the configured timers. Push
    /// notifications are always requested since completion depends on them.
    pub fn device_settings(&self, job: &JobRequest) -> DeviceSettings {
        let version = self.config.schema_version;
        let mut preferences: Map<String, Value> = job.preferences.clone();

        if !preferences.contains_key("cookConfig") {
            let level = preferences.remove("level").unwrap_or_else(|| json!(1));
            let timer: Map<String, Value> = self
                .config
                .cook_timers
                .iter()
                .map(|(level, millis)| (level.to_string(), json!(millis)))
                .collect();
            let level = match version {
                SchemaVersion::V1 => json!([level]),
                SchemaVersion::V2 => level,
            };
            preferences.insert(
                "cookConfig".to_string(),
                json!({ "level": level, "timer": timer }),
            );

            if version == SchemaVersion::V1 {
                if let Some(Value::String(mode)) = preferences.remove("mode") {
                    preferences.insert("mode".to_string(), json!([mode]));
                }
            }
        }

        preferences.insert(
            "notifications".to_string(),
            json!({ "shouldNotify": true, "type": [SSE_TRANSPORT] }),
        );

        DeviceSettings::new(version, Value::Object(preferences)).with_job_id(job.urn.clone())
    }
}

#[async_trait]
impl RecordHandler for Dispatcher {
    async fn handle(&self, record: Record) -> Result<()> {
        self.handle_record(record).await.map(|_| ())
    }
}

/// Wait for the worker's next `idle` event. If it carries this job's urn the
/// cycle completed and a result is stored; any other `idle` means the cycle was
/// interrupted.
async fn await_completion(
    mut events: EventStream,
    job: JobRequest,
    worker: String,
    results: ResultStore,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            event = events.next() => event,
            _ = shutdown.cancelled() => return,
        };

        let envelope = match event {
            Some(Ok(envelope)) => envelope,
            Some(Err(e)) => {
                tracing::warn!(job_id = %job.id, worker = %worker, error = %e, "Undecodable worker event");
                continue;
            }
            None => {
                tracing::warn!(job_id = %job.id, worker = %worker, "Event stream closed before job finished");
                return;
            }
        };

        if envelope.name() != StateName::Idle.as_str() {
            continue;
        }

        let status: DeviceStatus = match serde_json::from_value(envelope.payload) {
            Ok(status) => status,
            Err(e) => {
                tracing::warn!(job_id = %job.id, worker = %worker, error = %e, "Malformed completion payload");
                return;
            }
        };

        if status.state.job_id.as_deref() == Some(job.urn.as_str()) {
            results.record(JobResult::new(&job, status.device_name)).await;
            tracing::info!(job_id = %job.id, urn = %job.urn, worker = %worker, "Job completed");
        } else {
            tracing::warn!(job_id = %job.id, worker = %worker, "Worker returned to idle before job finished");
        }
        return;
    }
}
