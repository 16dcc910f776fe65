//! Wall-clock deadline shared by every step of one invocation.
//!
//! Instead of racing the whole execution against a detached timer, each
//! runtime call is wrapped in [`Deadline::guard`], so provisioning, attach,
//! start, and wait all give up at the same instant.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::ExecutionError;

#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    started: Instant,
    limit: Duration,
}

impl Deadline {
    /// Starts the clock now.
    pub fn after(limit: Duration) -> Self {
        Self {
            started: Instant::now(),
            limit,
        }
    }

    pub fn limit(&self) -> Duration {
        self.limit
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn expires_at(&self) -> Instant {
        self.started + self.limit
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at()
    }

    /// The error reported when this deadline is hit.
    pub fn exceeded(&self) -> ExecutionError {
        ExecutionError::TimeLimitExceeded {
            elapsed: self.elapsed(),
            limit: self.limit,
        }
    }

    /// Runs `fut` until it completes or the deadline passes, whichever
    /// comes first. On expiry `fut` is dropped.
    pub async fn guard<F, T, E>(&self, fut: F) -> Result<T, ExecutionError>
    where
        F: Future<Output = Result<T, E>>,
        E: Into<ExecutionError>,
    {
        match tokio::time::timeout_at(self.expires_at(), fut).await {
            Ok(result) => result.map_err(Into::into),
            Err(_) => Err(self.exceeded()),
        }
    }
}
