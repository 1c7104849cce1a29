//! Versioned device settings.
//!
//! Settings arrive as `{version, preferences, jobId}`. `preferences` is kept as
//! raw JSON because its shape depends on the schema version; everything the
//! worker needs from it is read through the per-version lookup functions below.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{MultigrainError, Result};
use crate::worker::state::StateName;

/// Transport name that enables the worker's event stream.
pub const SSE_TRANSPORT: &str = "sse";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SchemaVersion {
    /// `cookConfig.level` is an array; the first entry selects the timer.
    #[serde(rename = "0.0.1", alias = "v1", alias = "1")]
    V1,
    /// `cookConfig.level` selects the timer directly.
    #[serde(rename = "0.0.2", alias = "v2", alias = "2")]
    V2,
}

impl SchemaVersion {
    pub const LATEST: SchemaVersion = SchemaVersion::V2;

    pub fn as_str(&self) -> &'static str {
        match self {
            SchemaVersion::V1 => "0.0.1",
            SchemaVersion::V2 => "0.0.2",
        }
    }
}

impl std::fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SchemaVersion {
    type Err = MultigrainError;

    fn from_str(s: &str) -> Result<Self> {
        serde_json::from_value(Value::String(s.to_string()))
            .map_err(|_| MultigrainError::Settings(format!("unknown schema version {}", s)))
    }
}

type CookMillisFn = fn(&Value) -> Option<u64>;

/// Cook duration lookup, one pure function per schema version.
const COOK_DURATIONS: [(SchemaVersion, CookMillisFn); 2] = [
    (SchemaVersion::V1, v1_cook_millis),
    (SchemaVersion::V2, v2_cook_millis),
];

fn v1_cook_millis(preferences: &Value) -> Option<u64> {
    let level = preferences.pointer("/cookConfig/level/0")?;
    timer_millis(preferences, level)
}

fn v2_cook_millis(preferences: &Value) -> Option<u64> {
    let level = preferences.pointer("/cookConfig/level")?;
    timer_millis(preferences, level)
}

fn timer_millis(preferences: &Value, level: &Value) -> Option<u64> {
    let key = match level {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        _ => return None,
    };
    preferences.pointer("/cookConfig/timer")?.get(&key)?.as_u64()
}

pub fn cook_duration(version: SchemaVersion, preferences: &Value) -> Result<Duration> {
    let lookup = COOK_DURATIONS
        .iter()
        .find(|(v, _)| *v == version)
        .map(|(_, f)| *f)
        .ok_or_else(|| MultigrainError::Settings(format!("no duration rule for {}", version)))?;

    lookup(preferences).map(Duration::from_millis).ok_or_else(|| {
        MultigrainError::Settings(format!(
            "cookConfig does not select a timer for schema {}",
            version
        ))
    })
}

/// Human-readable status for a state. Only preheating differs by version.
pub fn status_message(version: SchemaVersion, state: StateName, mode: Option<&str>) -> String {
    match (state, version) {
        (StateName::Idle, _) => "Ready".to_string(),
        (StateName::Starting, _) => "Starting cook cycle".to_string(),
        (StateName::Preheating, SchemaVersion::V1) => "Preheating".to_string(),
        (StateName::Preheating, SchemaVersion::V2) => match mode {
            Some(mode) => format!("Preheating for {}", mode),
            None => "Preheating".to_string(),
        },
        (StateName::Cooking, _) => "Cooking".to_string(),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationPreferences {
    #[serde(default)]
    pub should_notify: bool,
    #[serde(default, rename = "type")]
    pub transports: Vec<String>,
}

impl NotificationPreferences {
    pub fn allows(&self, transport: &str) -> bool {
        self.should_notify && self.transports.iter().any(|t| t == transport)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSettings {
    pub version: SchemaVersion,
    pub preferences: Value,
    /// Correlation id of the job these settings were pushed for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self::preset(SchemaVersion::V1)
    }
}

impl DeviceSettings {
    pub fn new(version: SchemaVersion, preferences: Value) -> Self {
        Self {
            version,
            preferences,
            job_id: None,
        }
    }

    /// Factory program for each schema version.
    pub fn preset(version: SchemaVersion) -> Self {
        let preferences = match version {
            SchemaVersion::V1 => json!({
                "mode": ["bagel"],
                "cookConfig": {
                    "level": [1],
                    "timer": { "1": 50000 }
                }
            }),
            SchemaVersion::V2 => json!({
                "mode": "bagel",
                "cookConfig": {
                    "level": 1,
                    "timer": { "1": 50000, "2": 120000 }
                },
                "notifications": {
                    "shouldNotify": true,
                    "type": [SSE_TRANSPORT]
                }
            }),
        };
        Self::new(version, preferences)
    }

    pub fn with_job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    pub fn cook_duration(&self) -> Result<Duration> {
        cook_duration(self.version, &self.preferences)
    }

    pub fn notifications(&self) -> NotificationPreferences {
        self.preferences
            .get("notifications")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default()
    }

    /// `mode` is a string in v2 and a single-element array in v1.
    pub fn mode(&self) -> Option<&str> {
        match self.preferences.get("mode")? {
            Value::String(mode) => Some(mode.as_str()),
            Value::Array(modes) => modes.first()?.as_str(),
            _ => None,
        }
    }

    pub fn status_message(&self, state: StateName) -> String {
        status_message(self.version, state, self.mode())
    }
}
