//! Bounded poll-until-condition primitive.
//!
//! Some conditions in this system are fulfilled by a later, unrelated
//! inbound packet (a mode change is acknowledged immediately but observed
//! only when the next status report lands). [`wait_for`] checks a predicate
//! on a fixed interval until it holds or an optional timeout elapses. Both
//! resolution paths drop the interval with the future, so no timer lingers.

use std::time::Duration;

use thiserror::Error;

/// Default predicate check interval.
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(50);

/// The condition did not hold within the configured timeout.
#[derive(Debug, Error)]
#[error("condition was not met within {timeout:?}")]
pub struct WaitTimeout {
    /// The timeout that elapsed.
    pub timeout: Duration,
}

/// Options for [`wait_for`].
#[derive(Debug, Clone, Copy)]
pub struct WaitOptions {
    /// Interval between predicate checks.
    pub interval: Duration,
    /// Overall bound; `None` waits indefinitely.
    pub timeout: Option<Duration>,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            timeout: None,
        }
    }
}

impl WaitOptions {
    /// Sets the check interval.
    #[must_use]
    pub const fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Sets the overall timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Polls `condition` every `options.interval` until it returns true.
///
/// The first check fires immediately. With a timeout configured, the wait
/// resolves `Err(WaitTimeout)` once it elapses and performs no further
/// checks.
///
/// # Errors
///
/// Returns [`WaitTimeout`] when the timeout elapses before the condition
/// holds.
pub async fn wait_for<F>(mut condition: F, options: WaitOptions) -> Result<(), WaitTimeout>
where
    F: FnMut() -> bool,
{
    let poll = async {
        let mut ticker = tokio::time::interval(options.interval);
        loop {
            ticker.tick().await;
            if condition() {
                break;
            }
        }
    };

    match options.timeout {
        None => {
            poll.await;
            Ok(())
        }
        Some(timeout) => tokio::time::timeout(timeout, poll)
            .await
            .map_err(|_| WaitTimeout { timeout }),
    }
}
