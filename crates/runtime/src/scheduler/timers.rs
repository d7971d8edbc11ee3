use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use goalsync_core::Goal;

use super::queue::{PendingTrigger, TriggerQueue, TriggerSource};

#[derive(Debug, Default)]
struct TimerState {
    /// Bumped on every rearm and disarm.  A timer task only enqueues while
    /// the generation it was armed under is still current.
    generation: u64,
    handles: HashMap<String, JoinHandle<()>>,
}

/// One recurring timer per scheduled goal, keyed by slug.
#[derive(Debug, Clone, Default)]
pub struct TimerRegistry {
    state: Arc<Mutex<TimerState>>,
}

impl TimerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace every timer with one per goal that has `auto_submit` and a
    /// non-zero interval.  Returns the number of armed timers.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn rearm(&self, goals: &[Goal], queue: &Arc<TriggerQueue>) -> usize {
        let mut state = self.lock();
        let generation = disarm_locked(&mut state);

        for goal in goals {
            let Some(period) = goal.timer_period() else {
                continue;
            };
            let handle = tokio::spawn(run_timer(
                self.state.clone(),
                generation,
                goal.slug.clone(),
                period,
                queue.clone(),
            ));
            if let Some(previous) = state.handles.insert(goal.slug.clone(), handle) {
                previous.abort();
            }
            info!(slug = %goal.slug, interval = %goal.interval, "timer armed");
        }
        state.handles.len()
    }

    pub fn disarm_all(&self) {
        let mut state = self.lock();
        disarm_locked(&mut state);
    }

    /// Slugs with an armed timer, sorted.
    pub fn armed(&self) -> Vec<String> {
        let state = self.lock();
        let mut slugs: Vec<String> = state.handles.keys().cloned().collect();
        slugs.sort();
        slugs
    }

    pub fn is_armed(&self, slug: &str) -> bool {
        self.lock().handles.contains_key(slug)
    }

    fn lock(&self) -> MutexGuard<'_, TimerState> {
        lock_state(&self.state)
    }
}

fn lock_state(state: &Mutex<TimerState>) -> MutexGuard<'_, TimerState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn disarm_locked(state: &mut TimerState) -> u64 {
    state.generation += 1;
    let count = state.handles.len();
    for (_, handle) in state.handles.drain() {
        handle.abort();
    }
    if count > 0 {
        debug!(count, "timers disarmed");
    }
    state.generation
}

async fn run_timer(
    state: Arc<Mutex<TimerState>>,
    generation: u64,
    slug: String,
    period: std::time::Duration,
    queue: Arc<TriggerQueue>,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        {
            let state = lock_state(&state);
            if state.generation != generation {
                return;
            }
            queue.push(PendingTrigger::new(slug.clone(), TriggerSource::Timer));
        }
        debug!(slug = %slug, "timer fired");
    }
}
