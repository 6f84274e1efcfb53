//! Periodic resync of durable subscriptions
//!
//! Every durable subscription gets one task that re-runs its fetch at a fixed
//! interval, as a fallback for pushes the client may have missed. A semaphore
//! bounds how many ticks fire at once across all subscriptions.

use dashmap::DashMap;
use std::future::Future;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::AbortHandle;
use tokio::time::{Instant, MissedTickBehavior};
use xdsync_core::SubscriptionId;

/// Lifecycle of one resync task
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ResyncState {
    /// Waiting for the next tick
    Scheduled,
    /// A fetch is running
    Firing,
    /// The task has stopped and will not fire again
    Terminated,
}

/// Fixed-interval scheduler with a bounded number of concurrent ticks
pub struct ResyncScheduler {
    interval: Duration,

    /// Permits for concurrently firing ticks
    permits: Arc<Semaphore>,

    /// Running tasks
    tasks: DashMap<SubscriptionId, AbortHandle>,

    states: Arc<DashMap<SubscriptionId, ResyncState>>,
}

impl ResyncScheduler {
    pub fn new(interval: Duration, pool_size: usize) -> Self {
        Self {
            interval,
            permits: Arc::new(Semaphore::new(pool_size)),
            tasks: DashMap::new(),
            states: Arc::new(DashMap::new()),
        }
    }

    /// Run `tick` every interval, first one interval from now, until it breaks
    /// or the scheduler shuts down. Must be called within a tokio runtime.
    pub fn schedule<F, Fut>(&self, id: SubscriptionId, mut tick: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ControlFlow<()>> + Send,
    {
        let interval = self.interval;
        let permits = self.permits.clone();
        let states = self.states.clone();
        states.insert(id, ResyncState::Scheduled);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;

                // Closed on shutdown
                let Ok(permit) = permits.clone().acquire_owned().await else {
                    break;
                };

                if !transition(&states, id, ResyncState::Firing) {
                    break;
                }
                let flow = tick().await;
                drop(permit);

                if flow.is_break() || !transition(&states, id, ResyncState::Scheduled) {
                    break;
                }
            }

            states.insert(id, ResyncState::Terminated);
            tracing::debug!(subscription = %id, "Resync task terminated");
        });

        if let Some(previous) = self.tasks.insert(id, handle.abort_handle()) {
            previous.abort();
        }
    }

    pub fn state(&self, id: SubscriptionId) -> Option<ResyncState> {
        self.states.get(&id).map(|s| *s)
    }

    /// Number of tasks that have not terminated
    pub fn active(&self) -> usize {
        self.states
            .iter()
            .filter(|s| *s.value() != ResyncState::Terminated)
            .count()
    }

    /// Stop every task. Ticks already firing are aborted at their next await point.
    pub fn shutdown(&self) {
        self.permits.close();
        for task in self.tasks.iter() {
            task.value().abort();
        }
        self.tasks.clear();
        for mut state in self.states.iter_mut() {
            *state = ResyncState::Terminated;
        }
    }
}

/// Move `id` to `next` unless it has been terminated.
/// Returns false if the task must stop.
fn transition(
    states: &DashMap<SubscriptionId, ResyncState>,
    id: SubscriptionId,
    next: ResyncState,
) -> bool {
    match states.get_mut(&id) {
        Some(mut state) if *state != ResyncState::Terminated => {
            *state = next;
            true
        }
        _ => false,
    }
}

impl Drop for ResyncScheduler {
    fn drop(&mut self) {
        for task in self.tasks.iter() {
            task.value().abort();
        }
    }
}
