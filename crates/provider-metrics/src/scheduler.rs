//! Named periodic timers sharing one cancellation root.

use std::collections::HashMap;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Longest period a timer may have; larger requests are clamped so deadline
/// arithmetic stays in range.
pub const MAX_PERIOD: Duration = Duration::from_secs(365 * 24 * 60 * 60);

struct Timer {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Owns the periodic tasks of a collector. Dropping it cancels every timer.
pub struct Scheduler {
    root: CancellationToken,
    timers: HashMap<String, Timer>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            root: CancellationToken::new(),
            timers: HashMap::new(),
        }
    }

    /// Runs `tick` every `period`, first after one full period. The timer
    /// stops when `tick` returns `false` or when it is cancelled.
    ///
    /// Registering a name twice cancels the previous timer.
    pub fn every<F>(&mut self, name: impl Into<String>, period: Duration, mut tick: F) -> CancellationToken
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let name = name.into();
        let token = self.root.child_token();
        let period = period.clamp(Duration::from_millis(1), MAX_PERIOD);
        let cancelled = token.clone();
        let label = name.clone();

        let handle = tokio::spawn(async move {
            let mut interval = interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = interval.tick() => {
                        if !tick() {
                            log::debug!("timer '{}' finished", label);
                            break;
                        }
                    }
                }
            }
        });

        if let Some(previous) = self.timers.insert(
            name,
            Timer {
                token: token.clone(),
                handle,
            },
        ) {
            previous.token.cancel();
        }
        token
    }

    pub fn cancel(&mut self, name: &str) -> bool {
        match self.timers.remove(name) {
            Some(timer) => {
                timer.token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn timer_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.timers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.root.clone()
    }

    /// Cancels every timer and waits for their tasks to finish.
    pub async fn shutdown(&mut self) {
        self.root.cancel();
        for (name, timer) in self.timers.drain() {
            if let Err(error) = timer.handle.await {
                log::warn!("timer '{}' ended abnormally: {}", name, error);
            }
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.root.cancel();
    }
}
