use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{MultigrainError, Result};
use crate::message::Message;

pub const JOB_EVENT_TYPE: &str = "create";
pub const JOB_EVENT_NAME: &str = "cook.job";

pub fn job_urn(id: Uuid) -> String {
    format!("urn:multigrain:job:{}", id)
}

/// A job as it travels through the ingress topic.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRequest {
    pub id: Uuid,
    pub urn: String,
    /// Everything in the payload except `id` and `urn`
    pub preferences: Map<String, Value>,
}

impl JobRequest {
    pub fn new(preferences: Map<String, Value>) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            urn: job_urn(id),
            preferences,
        }
    }

    /// The envelope payload: `{id, urn, ...preferences}`.
    pub fn payload(&self) -> Map<String, Value> {
        let mut payload = self.preferences.clone();
        payload.insert("id".to_string(), Value::String(self.id.to_string()));
        payload.insert("urn".to_string(), Value::String(self.urn.clone()));
        payload
    }

    pub fn from_message(message: &Message) -> Result<Self> {
        let Value::Object(mut preferences) = message.payload.clone() else {
            return Err(MultigrainError::InvalidMessage(
                "job payload must be an object".to_string(),
            ));
        };

        let id = preferences
            .remove("id")
            .and_then(|v| v.as_str().and_then(|s| Uuid::parse_str(s).ok()))
            .ok_or_else(|| MultigrainError::InvalidMessage("job payload has no id".to_string()))?;
        let urn = match preferences.remove("urn") {
            Some(Value::String(urn)) => urn,
            _ => message.header.rel.id.clone(),
        };

        Ok(Self {
            id,
            urn,
            preferences,
        })
    }
}

/// Recorded when a worker reports that a job's cycle finished.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResult {
    pub urn: String,
    pub id: Uuid,
    pub device_name: String,
    pub timestamp: DateTime<Utc>,
}

impl JobResult {
    pub fn new(job: &JobRequest, device_name: impl Into<String>) -> Self {
        Self {
            urn: job.urn.clone(),
            id: job.id,
            device_name: device_name.into(),
            timestamp: Utc::now(),
        }
    }
}

/// What happened to one ingress record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Settings pushed, cycle started and a completion listener registered
    Dispatched { worker: String },
    /// No idle worker was found; the job is not retried
    Dropped,
}
