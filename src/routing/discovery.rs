//! Bounded, retrying enumeration of directory entries.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::directory::ServiceInstance;

/// Delay slept after the n-th (1-based) exhausted pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// `base * cycle`
    Linear { base: Duration },
    Fixed(Duration),
    /// `base * 2^(cycle - 1)`, capped at `max`
    Exponential { base: Duration, max: Duration },
}

impl Backoff {
    pub fn delay(&self, cycle: u32) -> Duration {
        let cycle = cycle.max(1);
        match *self {
            Backoff::Linear { base } => base.saturating_mul(cycle),
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential { base, max } => {
                let factor = 1u32.checked_shl(cycle - 1).unwrap_or(u32::MAX);
                base.saturating_mul(factor).min(max)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_cycles: u32,
    backoff: Backoff,
}

impl RetryPolicy {
    pub fn new(max_cycles: u32, backoff: Backoff) -> Self {
        Self {
            max_cycles,
            backoff,
        }
    }

    pub fn max_cycles(&self) -> u32 {
        self.max_cycles
    }

    pub fn delay(&self, cycle: u32) -> Duration {
        self.backoff.delay(cycle)
    }

    /// Start a sequence over `snapshot` governed by this policy.
    pub fn sequence(&self, snapshot: Vec<ServiceInstance>) -> DiscoverySequence {
        DiscoverySequence::new(snapshot, *self)
    }
}

/// Walks a fixed snapshot in order, sleeping and restarting at the end of each
/// pass until `max_cycles` passes have been exhausted.
///
/// The snapshot is taken once; instances registered afterwards are not seen by
/// this sequence. Once it returns `None` it stays finished.
#[derive(Debug)]
pub struct DiscoverySequence {
    snapshot: Vec<ServiceInstance>,
    policy: RetryPolicy,
    index: usize,
    cycle: u32,
    done: bool,
    cancel: CancellationToken,
    backoff_log: Vec<Duration>,
}

impl DiscoverySequence {
    pub fn new(snapshot: Vec<ServiceInstance>, policy: RetryPolicy) -> Self {
        Self {
            snapshot,
            policy,
            index: 0,
            cycle: 0,
            done: policy.max_cycles == 0,
            cancel: CancellationToken::new(),
            backoff_log: Vec::new(),
        }
    }

    /// End the sequence early when `token` is cancelled, including mid-backoff.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub async fn next(&mut self) -> Option<ServiceInstance> {
        loop {
            if self.done {
                return None;
            }
            if self.cancel.is_cancelled() {
                self.done = true;
                return None;
            }

            if let Some(instance) = self.snapshot.get(self.index) {
                self.index += 1;
                return Some(instance.clone());
            }

            // End of a pass.
            self.cycle += 1;
            let delay = self.policy.delay(self.cycle);
            tracing::debug!(
                cycle = self.cycle,
                max_cycles = self.policy.max_cycles,
                delay_ms = delay.as_millis() as u64,
                "Discovery pass exhausted, backing off"
            );
            self.backoff_log.push(delay);

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.cancel.cancelled() => {
                    self.done = true;
                    return None;
                }
            }

            if self.cycle >= self.policy.max_cycles {
                self.done = true;
                return None;
            }
            self.index = 0;
        }
    }

    /// Passes completed so far.
    pub fn cycles(&self) -> u32 {
        self.cycle
    }

    /// Delays slept so far, in order.
    pub fn backoff_log(&self) -> &[Duration] {
        &self.backoff_log
    }

    pub fn is_done(&self) -> bool {
        self.done
    }
}
