use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use goalsync_core::DayStamp;

use crate::{GoalService, RemoteDatapoint, RemoteError};

/// A request as the in-memory service saw it.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteCall {
    FetchLast { slug: String },
    Create { slug: String, value: f64, daystamp: DayStamp },
    Update { slug: String, id: String, value: f64 },
}

#[derive(Debug, Default)]
struct Ledger {
    series: HashMap<String, Vec<RemoteDatapoint>>,
    calls: Vec<RemoteCall>,
    failures: HashMap<String, RemoteError>,
    next_id: u64,
}

/// In-process goal service.
///
/// Backs `goalsync start --dry-run` and the runtime tests: it records every
/// call, can inject per-goal failures and simulated latency, and tracks how
/// many calls were in flight at once.
#[derive(Debug, Default)]
pub struct InMemoryGoalService {
    ledger: Mutex<Ledger>,
    latency: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

struct InFlight<'a> {
    counter: &'a AtomicUsize,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

impl InMemoryGoalService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call waits this long before touching the ledger.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Append an existing datapoint, as if created by another client.
    pub fn seed(&self, slug: &str, datapoint: RemoteDatapoint) {
        let mut ledger = self.lock();
        ledger.series.entry(slug.to_string()).or_default().push(datapoint);
    }

    /// Delete a datapoint as an edit on the service would.  Returns whether
    /// it existed.
    pub fn remove(&self, slug: &str, id: &str) -> bool {
        let mut ledger = self.lock();
        let Some(points) = ledger.series.get_mut(slug) else {
            return false;
        };
        let before = points.len();
        points.retain(|p| p.id != id);
        points.len() != before
    }

    /// Make every call for `slug` fail with `err` until cleared.
    pub fn fail_with(&self, slug: &str, err: RemoteError) {
        self.lock().failures.insert(slug.to_string(), err);
    }

    pub fn clear_failure(&self, slug: &str) {
        self.lock().failures.remove(slug);
    }

    pub fn calls(&self) -> Vec<RemoteCall> {
        self.lock().calls.clone()
    }

    pub fn datapoints(&self, slug: &str) -> Vec<RemoteDatapoint> {
        self.lock().series.get(slug).cloned().unwrap_or_default()
    }

    /// Highest number of calls observed running at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn enter(&self, call: RemoteCall) -> Result<InFlight<'_>, RemoteError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let guard = InFlight {
            counter: &self.in_flight,
        };

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let mut ledger = self.lock();
        let slug = match &call {
            RemoteCall::FetchLast { slug }
            | RemoteCall::Create { slug, .. }
            | RemoteCall::Update { slug, .. } => slug.clone(),
        };
        ledger.calls.push(call);
        if let Some(err) = ledger.failures.get(&slug) {
            return Err(err.clone());
        }
        Ok(guard)
    }
}

#[async_trait]
impl GoalService for InMemoryGoalService {
    async fn fetch_last(&self, slug: &str) -> Result<RemoteDatapoint, RemoteError> {
        let _guard = self
            .enter(RemoteCall::FetchLast {
                slug: slug.to_string(),
            })
            .await?;
        let ledger = self.lock();
        Ok(ledger
            .series
            .get(slug)
            .and_then(|points| points.last().cloned())
            .unwrap_or_else(RemoteDatapoint::none))
    }

    async fn create(
        &self,
        slug: &str,
        value: f64,
        daystamp: &DayStamp,
        comment: &str,
    ) -> Result<RemoteDatapoint, RemoteError> {
        let _guard = self
            .enter(RemoteCall::Create {
                slug: slug.to_string(),
                value,
                daystamp: *daystamp,
            })
            .await?;
        let mut ledger = self.lock();
        ledger.next_id += 1;
        let datapoint = RemoteDatapoint {
            id: format!("mem-{}", ledger.next_id),
            value,
            daystamp: Some(*daystamp),
            comment: comment.to_string(),
        };
        ledger
            .series
            .entry(slug.to_string())
            .or_default()
            .push(datapoint.clone());
        info!(slug, value, daystamp = %daystamp, "in-memory datapoint created");
        Ok(datapoint)
    }

    async fn update(
        &self,
        slug: &str,
        id: &str,
        value: f64,
        comment: &str,
    ) -> Result<RemoteDatapoint, RemoteError> {
        let _guard = self
            .enter(RemoteCall::Update {
                slug: slug.to_string(),
                id: id.to_string(),
                value,
            })
            .await?;
        let mut ledger = self.lock();
        let point = ledger
            .series
            .get_mut(slug)
            .and_then(|points| points.iter_mut().find(|p| p.id == id))
            .ok_or_else(|| RemoteError::DatapointGone {
                slug: slug.to_string(),
                id: id.to_string(),
            })?;
        point.value = value;
        point.comment = comment.to_string();
        info!(slug, id, value, "in-memory datapoint updated");
        Ok(point.clone())
    }
}
