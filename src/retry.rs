//! Rate-limit aware retry for throttle-prone provider calls.
//!
//! Every provider call that can be throttled (credential grants, review
//! notifications, bulk message deletion) goes through [`Retrier::execute`]
//! instead of handling 429s at the call site.
//!
//! Policy: if the call fails with [`Error::RateLimited`], sleep for the
//! interval the provider asked for and try exactly once more. A second
//! throttle, or a requested wait longer than the budget allows, is
//! surfaced to the caller. Any other error is surfaced immediately.

use crate::error::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Bound on how long a single retried call may sleep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudget {
    /// Longest provider-requested wait that is honoured.
    pub max_wait: Duration,
}

impl Default for RetryBudget {
    fn default() -> Self {
        Self {
            max_wait: Duration::from_secs(10),
        }
    }
}

/// Runs provider calls with a single rate-limit retry.
#[derive(Debug, Clone, Copy, Default)]
pub struct Retrier {
    budget: RetryBudget,
}

impl Retrier {
    /// Create a retrier with the given budget.
    #[must_use]
    pub fn new(budget: RetryBudget) -> Self {
        Self { budget }
    }

    /// The budget applied to each call.
    #[must_use]
    pub fn budget(&self) -> RetryBudget {
        self.budget
    }

    /// Run `action`, retrying once after a rate-limit response.
    ///
    /// `name` only labels log lines.
    ///
    /// # Errors
    ///
    /// Returns the action's error if it is not a rate limit, if the
    /// requested wait exceeds the budget, or if the retry fails too.
    pub async fn execute<F, Fut, T>(&self, name: &str, mut action: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let retry_after = match action().await {
            Ok(value) => return Ok(value),
            Err(e) => match e.retry_after() {
                Some(wait) => wait,
                None => return Err(e),
            },
        };

        if retry_after > self.budget.max_wait {
            warn!(
                "{name}: provider asked to wait {:?}, over budget {:?}",
                retry_after, self.budget.max_wait
            );
            return Err(Error::RateLimited { retry_after });
        }

        debug!("{name}: rate limited, retrying in {:?}", retry_after);
        tokio::time::sleep(retry_after).await;

        let result = action().await;
        if let Err(e) = &result {
            warn!("{name}: failed after rate-limit retry: {e}");
        }
        result
    }
}
