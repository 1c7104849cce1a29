//! Worker device runtime.
//!
//! A worker runs at most one cook cycle at a time:
//!
//! ```text
//! idle --start()--> starting --5s--> preheating --10s--> cooking --deadline--> idle
//!   ^                                                                  |
//!   +---------------------------- stop() from any state ---------------+
//! ```
//!
//! # Components
//!
//! - [`Worker`]: the state machine; owns its settings, its single armed timer
//!   and its observers
//! - [`settings`]: versioned settings and the per-version cook duration rules
//! - [`notifier`]: typed state observers and the push transport behind the
//!   event stream
//! - [`api`]: HTTP surface used by the dispatcher (status, settings, start,
//!   stop, events)

pub mod api;
pub mod clock;
pub mod machine;
pub mod notifier;
pub mod settings;
pub mod state;

pub use machine::{Worker, APPLICATION_VERSION};
pub use settings::{DeviceSettings, SchemaVersion};
pub use state::{DeviceStatus, StateName, WorkerState};
