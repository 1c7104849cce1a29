use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::worker::settings::DeviceSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateName {
    Idle,
    Starting,
    Preheating,
    Cooking,
}

impl StateName {
    pub fn as_str(&self) -> &'static str {
        match self {
            StateName::Idle => "idle",
            StateName::Starting => "starting",
            StateName::Preheating => "preheating",
            StateName::Cooking => "cooking",
        }
    }
}

impl std::fmt::Display for StateName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of a worker's lifecycle state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerState {
    #[serde(rename = "state")]
    pub name: StateName,
    pub timestamp: DateTime<Utc>,
    pub cook_start_time_millis: Option<i64>,
    pub cook_end_time_millis: Option<i64>,
    pub cook_time_remaining_millis: i64,
    pub cook_in_progress: bool,
    pub status_message: String,
    /// Job the current cycle belongs to. On an idle snapshot this is set only
    /// when the cycle ran to completion.
    pub job_id: Option<String>,
}

impl WorkerState {
    pub fn idle(timestamp: DateTime<Utc>, status_message: String) -> Self {
        Self {
            name: StateName::Idle,
            timestamp,
            cook_start_time_millis: None,
            cook_end_time_millis: None,
            cook_time_remaining_millis: 0,
            cook_in_progress: false,
            status_message,
            job_id: None,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.name == StateName::Idle
    }
}

/// What the status endpoint returns and what every pushed event carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatus {
    pub device_name: String,
    pub application_version: String,
    pub settings: DeviceSettings,
    #[serde(flatten)]
    pub state: WorkerState,
}
