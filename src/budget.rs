use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::{Error, Result};

/// Overall deadline and cancellation flag for one operation.
///
/// Checked between stages and between provisioning steps, and used to clip
/// each step's own timeout. Cancellation is cooperative: a command already
/// running on a remote host is not killed there, so cancelling mid-step can
/// leave that command running inside the container.
#[derive(Debug, Clone)]
pub struct OperationBudget {
    deadline: Option<Instant>,
    cancelled: Arc<AtomicBool>,
}

impl OperationBudget {
    pub fn unlimited() -> Self {
        Self {
            deadline: None,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + timeout),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Shares the cancellation flag, e.g. with a Ctrl-C handler.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }

    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancelled = flag;
        self
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn is_expired(&self) -> bool {
        self.remaining().is_some_and(|r| r.is_zero())
    }

    /// Fails once the operation was cancelled or ran out of time.
    pub fn check(&self, before: &str) -> Result<()> {
        if self.is_cancelled() {
            return Err(Error::Cancelled(format!("cancelled before {before}")));
        }
        if self.is_expired() {
            return Err(Error::Cancelled(format!("deadline reached before {before}")));
        }
        Ok(())
    }

    /// `timeout`, shortened to what is left of the budget.
    pub fn clip(&self, timeout: Duration) -> Duration {
        match self.remaining() {
            Some(remaining) => timeout.min(remaining),
            None => timeout,
        }
    }
}

impl Default for OperationBudget {
    fn default() -> Self {
        Self::unlimited()
    }
}
