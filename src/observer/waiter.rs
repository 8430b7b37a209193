//! Bounded polling
//!
//! [`PollingWaiter`] polls an async check at a fixed interval until the check
//! reports success or the budget runs out. It is the only place in the crate
//! that loops on external state.

use std::fmt::Debug;
use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::{debug, instrument, warn};

use crate::config::WaitConfig;
use crate::error::{Error, Result};
use crate::metrics::SentinelMetrics;

/// Smallest interval a waiter will sleep between polls.
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Outcome of a single poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation<T> {
    /// Condition met; the value is returned to the caller
    Satisfied(T),
    /// Condition not met yet; the value is kept for the timeout report
    Pending(T),
}

impl<T> Observation<T> {
    /// `Satisfied(value)` if `ok`, otherwise `Pending(value)`.
    pub fn check(ok: bool, value: T) -> Self {
        if ok {
            Observation::Satisfied(value)
        } else {
            Observation::Pending(value)
        }
    }

    pub fn is_satisfied(&self) -> bool {
        matches!(self, Observation::Satisfied(_))
    }
}

/// Polls a condition until it holds or a timeout elapses.
#[derive(Debug, Clone)]
pub struct PollingWaiter {
    timeout: Duration,
    interval: Duration,
    retry_errors: bool,
    metrics: Option<SentinelMetrics>,
}

impl PollingWaiter {
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        Self {
            timeout,
            interval: interval.max(MIN_INTERVAL),
            retry_errors: false,
            metrics: None,
        }
    }

    pub fn from_config(config: &WaitConfig) -> Self {
        Self::new(config.timeout(), config.interval())
    }

    /// Treat check errors as pending polls instead of failing the wait.
    pub fn retry_errors(mut self, retry: bool) -> Self {
        self.retry_errors = retry;
        self
    }

    pub fn with_metrics(mut self, metrics: SentinelMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Same waiter with a different budget.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self {
            timeout,
            ..self.clone()
        }
    }

    /// Same waiter with a different poll interval.
    pub fn with_interval(&self, interval: Duration) -> Self {
        Self {
            interval: interval.max(MIN_INTERVAL),
            ..self.clone()
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Poll `observe` until it returns [`Observation::Satisfied`].
    ///
    /// The first poll happens immediately. After each unsatisfied poll the
    /// waiter fails with [`Error::Timeout`] if `timeout` has elapsed, and
    /// otherwise sleeps `interval`. The timeout is therefore reported at the
    /// first poll at or after `timeout`, never later than `timeout + interval`.
    #[instrument(skip(self, observe), fields(timeout = ?self.timeout, interval = ?self.interval))]
    pub async fn wait_for<T, F, Fut>(&self, what: &str, mut observe: F) -> Result<T>
    where
        T: Debug,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Observation<T>>>,
    {
        let start = Instant::now();
        let mut polls: u64 = 0;

        loop {
            polls += 1;
            if let Some(metrics) = &self.metrics {
                metrics.record_poll();
            }

            let last_observed = match observe().await {
                Ok(Observation::Satisfied(value)) => {
                    let waited = start.elapsed();
                    debug!(polls, ?waited, "{} satisfied", what);
                    if let Some(metrics) = &self.metrics {
                        metrics.record_wait(waited, false);
                    }
                    return Ok(value);
                }
                Ok(Observation::Pending(value)) => format!("{:?}", value),
                Err(e) if self.retry_errors => {
                    debug!(polls, error = %e, "{} check failed, retrying", what);
                    format!("error: {}", e)
                }
                Err(e) => return Err(e),
            };

            let waited = start.elapsed();
            if waited >= self.timeout {
                warn!(polls, ?waited, last = %last_observed, "{} timed out", what);
                if let Some(metrics) = &self.metrics {
                    metrics.record_wait(waited, true);
                }
                return Err(Error::Timeout {
                    what: what.to_string(),
                    waited,
                    last_observed,
                });
            }

            sleep(self.interval).await;
        }
    }

    /// Poll a boolean condition.
    pub async fn wait_until<F, Fut>(&self, what: &str, mut condition: F) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<bool>>,
    {
        self.wait_for(what, || {
            let fut = condition();
            async move { Ok(Observation::check(fut.await?, ())) }
        })
        .await
    }
}

impl Default for PollingWaiter {
    fn default() -> Self {
        Self::from_config(&WaitConfig::default())
    }
}
