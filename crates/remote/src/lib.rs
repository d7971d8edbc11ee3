//! Client side of the remote goal-tracking service.
//!
//! [`GoalService`] is the seam the reconciliation engine talks to.
//! [`HttpGoalService`] speaks the real datapoints API; [`InMemoryGoalService`]
//! keeps everything in process for dry runs and tests.

mod http;
mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use goalsync_core::DayStamp;

pub use http::HttpGoalService;
pub use memory::{InMemoryGoalService, RemoteCall};

/// The service's most recent record for a goal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteDatapoint {
    /// Remote identifier.  Empty means no datapoint exists yet.
    pub id: String,
    pub value: f64,
    pub daystamp: Option<DayStamp>,
    #[serde(default)]
    pub comment: String,
}

impl RemoteDatapoint {
    /// Sentinel returned by `fetch_last` for a goal without data.
    pub fn none() -> Self {
        Self {
            id: String::new(),
            value: 0.0,
            daystamp: None,
            comment: String::new(),
        }
    }

    pub fn exists(&self) -> bool {
        !self.id.is_empty()
    }

    /// True when this is a real datapoint recorded for `day`.
    pub fn is_on(&self, day: &DayStamp) -> bool {
        self.exists() && self.daystamp.as_ref() == Some(day)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    #[error("network failure: {0}")]
    Network(String),

    #[error("rate limited by remote service: {0}")]
    RateLimited(String),

    #[error("authentication rejected: {0}")]
    Auth(String),

    #[error("goal '{0}' not found on remote service")]
    NotFound(String),

    /// The datapoint being updated was deleted on the service after it was
    /// fetched.  The goal itself still exists.
    #[error("datapoint {id} of goal '{slug}' no longer exists")]
    DatapointGone { slug: String, id: String },

    #[error("unexpected response: {0}")]
    Protocol(String),
}

/// How the scheduler should treat a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorClass {
    /// Drop the work item; the next trigger retries.
    Transient,
    /// Credentials must be fixed by the user.
    Auth,
    /// The goal slug is wrong; stop reconciling it until reconfigured.
    NotFound,
}

impl RemoteError {
    pub fn class(&self) -> ErrorClass {
        match self {
            RemoteError::Network(_)
            | RemoteError::RateLimited(_)
            | RemoteError::Protocol(_)
            | RemoteError::DatapointGone { .. } => ErrorClass::Transient,
            RemoteError::Auth(_) => ErrorClass::Auth,
            RemoteError::NotFound(_) => ErrorClass::NotFound,
        }
    }
}

#[async_trait]
pub trait GoalService: Send + Sync {
    /// Most recent datapoint, or [`RemoteDatapoint::none`] when the goal has
    /// no data.  Only transport and auth problems are errors.
    async fn fetch_last(&self, slug: &str) -> Result<RemoteDatapoint, RemoteError>;

    async fn create(
        &self,
        slug: &str,
        value: f64,
        daystamp: &DayStamp,
        comment: &str,
    ) -> Result<RemoteDatapoint, RemoteError>;

    /// Overwrite the value of an existing datapoint.  Its day-stamp is kept.
    /// A datapoint deleted since it was fetched is
    /// [`RemoteError::DatapointGone`], not [`RemoteError::NotFound`].
    async fn update(
        &self,
        slug: &str,
        id: &str,
        value: f64,
        comment: &str,
    ) -> Result<RemoteDatapoint, RemoteError>;
}
