//! Wire envelopes.
//!
//! [`Message`] is the `{header, payload}` object placed on the job queue, one JSON
//! object per record. [`EventEnvelope`] is the smaller `{header, payload}` object a
//! worker pushes on its event stream after each state transition.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{MultigrainError, Result};

/// Link relation carried in every header, pointing at the payload it describes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Relation {
    pub id: String,
    #[serde(rename = "schemaURL")]
    pub schema_url: Option<String>,
    pub next: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageHeader {
    pub event_id: String,
    pub event_type: Vec<String>,
    pub event_name: Vec<String>,
    pub created_timestamp: String,
    pub rel: Relation,
}

impl MessageHeader {
    /// Build a header for payload `id`. A fresh event id and creation timestamp are
    /// generated; all three arguments must be non-empty.
    pub fn new(id: &str, event_type: &str, event_name: &str) -> Result<Self> {
        if id.is_empty() || event_type.is_empty() || event_name.is_empty() {
            return Err(MultigrainError::InvalidMessage(
                "header requires id, eventType and eventName".to_string(),
            ));
        }

        Ok(Self {
            event_id: Uuid::new_v4().to_string(),
            event_type: vec![event_type.to_string()],
            event_name: vec![event_name.to_string()],
            created_timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            rel: Relation {
                id: id.to_string(),
                schema_url: None,
                next: None,
            },
        })
    }

    pub fn with_next(mut self, next: impl Into<String>) -> Self {
        self.rel.next = Some(next.into());
        self
    }

    pub fn with_schema_url(mut self, schema_url: impl Into<String>) -> Self {
        self.rel.schema_url = Some(schema_url.into());
        self
    }

    pub fn value(&self) -> Value {
        // Serializing a struct of strings cannot fail.
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Opaque payload. Validation belongs to whoever consumes it.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageBody(Value);

impl MessageBody {
    pub fn new(payload: Value) -> Self {
        Self(payload)
    }

    pub fn value(&self) -> &Value {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub header: MessageHeader,
    pub payload: Value,
}

impl Message {
    pub fn new(header: MessageHeader, body: MessageBody) -> Self {
        Self {
            header,
            payload: body.0,
        }
    }

    /// The exact JSON shape written to the queue.
    pub fn value(&self) -> Value {
        serde_json::json!({
            "header": self.header.value(),
            "payload": self.payload,
        })
    }

    pub fn to_vec(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| MultigrainError::InvalidMessage(format!("malformed envelope: {}", e)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventHeader {
    pub timestamp: String,
    pub name: String,
    pub id: String,
}

/// One event on a worker's push stream. `header.name` is the state the worker
/// just entered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub header: EventHeader,
    pub payload: Value,
}

impl EventEnvelope {
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        Self {
            header: EventHeader {
                timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
                name: name.into(),
                id: Uuid::new_v4().to_string(),
            },
            payload,
        }
    }

    pub fn name(&self) -> &str {
        &self.header.name
    }
}
