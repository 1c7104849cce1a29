use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant};

use crate::config::CycleTimings;
use crate::error::Result;
use crate::message::EventEnvelope;
use crate::worker::clock::Clock;
use crate::worker::notifier::{Notifier, PushTransport};
use crate::worker::settings::{DeviceSettings, SSE_TRANSPORT};
use crate::worker::state::{DeviceStatus, StateName, WorkerState};

pub const APPLICATION_VERSION: &str = env!("CARGO_PKG_VERSION");

const EVENT_BUFFER: usize = 64;

struct Machine {
    state: WorkerState,
    settings: DeviceSettings,
    /// Timer armed by the current state, if any
    timer: Option<JoinHandle<()>>,
    /// Bumped on every state entry; timers armed for an older generation are stale
    generation: u64,
}

struct Core {
    name: String,
    timings: CycleTimings,
    clock: Clock,
    machine: Mutex<Machine>,
    notifier: Notifier,
    transport: PushTransport,
}

/// A single-concurrency device running one cook cycle at a time.
///
/// Cloning yields another handle to the same device.
#[derive(Clone)]
pub struct Worker {
    core: Arc<Core>,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("name", &self.core.name)
            .finish_non_exhaustive()
    }
}

impl Worker {
    pub fn new(name: impl Into<String>, settings: DeviceSettings, timings: CycleTimings) -> Self {
        let clock = Clock::new();
        let state = WorkerState::idle(clock.now(), settings.status_message(StateName::Idle));
        Self {
            core: Arc::new(Core {
                name: name.into(),
                timings,
                clock,
                machine: Mutex::new(Machine {
                    state,
                    settings,
                    timer: None,
                    generation: 0,
                }),
                notifier: Notifier::new(),
                transport: PushTransport::new(EVENT_BUFFER),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub async fn status(&self) -> DeviceStatus {
        let machine = self.core.machine.lock().await;
        self.describe(&machine)
    }

    pub async fn settings(&self) -> DeviceSettings {
        self.core.machine.lock().await.settings.clone()
    }

    /// Replace the device settings. A cycle already running keeps the deadline
    /// it was started with.
    pub async fn apply_settings(&self, settings: DeviceSettings) -> DeviceStatus {
        let mut machine = self.core.machine.lock().await;
        tracing::info!(
            worker = %self.core.name,
            version = %settings.version,
            job_id = ?settings.job_id,
            "Settings updated"
        );
        machine.settings = settings;
        self.describe(&machine)
    }

    /// Begin a cook cycle. Ignored unless the worker is idle.
    pub async fn start(&self) -> Result<DeviceStatus> {
        let mut machine = self.core.machine.lock().await;
        if !machine.state.is_idle() {
            tracing::info!(
                worker = %self.core.name,
                state = %machine.state.name,
                "Start ignored, cycle already in progress"
            );
            return Ok(self.describe(&machine));
        }

        let duration = machine.settings.cook_duration()?;
        let now = self.core.clock.now_millis();
        let end = now + duration.as_millis() as i64;
        let state = WorkerState {
            name: StateName::Starting,
            timestamp: self.core.clock.now(),
            cook_start_time_millis: Some(now),
            cook_end_time_millis: Some(end),
            cook_time_remaining_millis: end - now,
            cook_in_progress: true,
            status_message: machine.settings.status_message(StateName::Starting),
            job_id: machine.settings.job_id.clone(),
        };

        tracing::info!(
            worker = %self.core.name,
            job_id = ?state.job_id,
            duration_ms = duration.as_millis() as u64,
            "Cook cycle starting"
        );
        self.enter(&mut machine, state, false);
        Ok(self.announce(&machine).await)
    }

    /// Return to idle immediately, cancelling whatever the current state armed.
    pub async fn stop(&self) -> DeviceStatus {
        let mut machine = self.core.machine.lock().await;
        if machine.state.is_idle() {
            machine.state.timestamp = self.core.clock.now();
            return self.describe(&machine);
        }

        tracing::info!(
            worker = %self.core.name,
            state = %machine.state.name,
            job_id = ?machine.state.job_id,
            "Cook cycle stopped"
        );
        let idle = WorkerState::idle(
            self.core.clock.now(),
            machine.settings.status_message(StateName::Idle),
        );
        self.enter(&mut machine, idle, false);
        self.announce(&machine).await
    }

    pub async fn subscribe<F>(&self, state: StateName, handler: F)
    where
        F: Fn(&DeviceStatus) + Send + Sync + 'static,
    {
        self.core.notifier.subscribe(state, handler).await;
    }

    /// Events forwarded by the push transport. Only snapshots published while
    /// the settings opt into notifications are delivered.
    pub fn events(&self) -> broadcast::Receiver<EventEnvelope> {
        self.core.transport.subscribe()
    }

    pub async fn has_armed_timer(&self) -> bool {
        self.core
            .machine
            .lock()
            .await
            .timer
            .as_ref()
            .is_some_and(|timer| !timer.is_finished())
    }

    fn describe(&self, machine: &Machine) -> DeviceStatus {
        DeviceStatus {
            device_name: self.core.name.clone(),
            application_version: APPLICATION_VERSION.to_string(),
            settings: machine.settings.clone(),
            state: machine.state.clone(),
        }
    }

    /// Switch state and arm the new state's timer. `from_timer` is set when the
    /// caller is the outgoing timer itself, which must not abort its own task.
    fn enter(&self, machine: &mut Machine, state: WorkerState, from_timer: bool) {
        if let Some(timer) = machine.timer.take() {
            if !from_timer {
                timer.abort();
            }
        }
        machine.generation += 1;
        machine.state = state;
        machine.timer = self.arm(machine.state.name, machine.generation);
    }

    fn arm(&self, state: StateName, generation: u64) -> Option<JoinHandle<()>> {
        let worker = self.clone();
        let timings = self.core.timings;
        match state {
            StateName::Idle => None,
            StateName::Starting => Some(tokio::spawn(async move {
                sleep(timings.starting).await;
                worker.advance(generation, StateName::Preheating).await;
            })),
            StateName::Preheating => Some(tokio::spawn(async move {
                sleep(timings.preheating).await;
                worker.advance(generation, StateName::Cooking).await;
            })),
            StateName::Cooking => Some(tokio::spawn(async move {
                let mut ticker =
                    interval_at(Instant::now() + timings.cooking_tick, timings.cooking_tick);
                loop {
                    ticker.tick().await;
                    if !worker.tick(generation).await {
                        break;
                    }
                }
            })),
        }
    }

    async fn advance(&self, generation: u64, next: StateName) {
        let mut machine = self.core.machine.lock().await;
        if machine.generation != generation {
            return;
        }

        let mut state = machine.state.clone();
        state.name = next;
        state.timestamp = self.core.clock.now();
        state.status_message = machine.settings.status_message(next);
        if let Some(end) = state.cook_end_time_millis {
            state.cook_time_remaining_millis = end - self.core.clock.now_millis();
        }

        tracing::debug!(worker = %self.core.name, state = %next, "State transition");
        self.enter(&mut machine, state, true);
        self.announce(&machine).await;
    }

    /// One cooking tick. Returns false once the cycle has finished or the timer
    /// is stale.
    async fn tick(&self, generation: u64) -> bool {
        let mut machine = self.core.machine.lock().await;
        if machine.generation != generation {
            return false;
        }

        let now = self.core.clock.now_millis();
        let remaining = machine
            .state
            .cook_end_time_millis
            .map(|end| end - now)
            .unwrap_or(0);

        if remaining > 0 {
            machine.state.timestamp = self.core.clock.now();
            machine.state.cook_time_remaining_millis = remaining;
            self.announce(&machine).await;
            return true;
        }

        let job_id = machine.state.job_id.clone();
        tracing::info!(worker = %self.core.name, job_id = ?job_id, "Cook cycle complete");
        let mut idle = WorkerState::idle(
            self.core.clock.now(),
            machine.settings.status_message(StateName::Idle),
        );
        idle.job_id = job_id;
        self.enter(&mut machine, idle, true);
        self.announce(&machine).await;
        false
    }

    /// Publish the current snapshot to observers and, if enabled, the push
    /// transport. Called with the machine locked so events keep their order.
    async fn announce(&self, machine: &Machine) -> DeviceStatus {
        let status = self.describe(machine);
        self.core.notifier.publish(&status).await;
        if machine.settings.notifications().allows(SSE_TRANSPORT) {
            self.core.transport.forward(&status);
        }
        status
    }
}
