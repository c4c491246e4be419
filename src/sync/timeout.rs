//! Deadline wrapper for asynchronous operations
//!
//! Every network call races against a timer; whichever side finishes
//! first, the loser is dropped so no stale timer fires later. Callers
//! pick a named tier rather than inventing literal durations.

use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Named timeout tiers, chosen by call-site intent
pub mod tiers {
    use std::time::Duration;

    /// Quick lookups (product detail, profile fetch)
    pub const SHORT: Duration = Duration::from_secs(5);

    /// Standard CRUD calls
    pub const MEDIUM: Duration = Duration::from_secs(10);

    /// List queries and uploads
    pub const LONG: Duration = Duration::from_secs(30);

    /// Checkout and other stored-procedure calls
    pub const VERY_LONG: Duration = Duration::from_secs(60);
}

/// The operation exceeded its deadline
#[derive(Error, Debug)]
#[error("{message} (timed out after {timeout:?})")]
pub struct TimeoutError {
    /// The configured deadline
    pub timeout: Duration,
    /// Caller-supplied context for the failure
    pub message: String,
}

/// Options for [`with_timeout`]
pub struct TimeoutOptions {
    pub timeout: Duration,
    pub error_message: Option<String>,
    /// Invoked once if the timer wins the race
    pub on_timeout: Option<Box<dyn FnOnce() + Send>>,
}

impl TimeoutOptions {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            error_message: None,
            on_timeout: None,
        }
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    pub fn on_timeout(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.on_timeout = Some(Box::new(f));
        self
    }
}

impl From<Duration> for TimeoutOptions {
    fn from(timeout: Duration) -> Self {
        Self::new(timeout)
    }
}

/// Race an operation against a deadline
///
/// Returns the operation's output if it finishes in time, otherwise a
/// [`TimeoutError`] carrying the configured duration. The wrapper never
/// retries; retry policy is layered on by the dispatcher.
pub async fn with_timeout<F>(
    future: F,
    options: impl Into<TimeoutOptions>,
) -> Result<F::Output, TimeoutError>
where
    F: Future,
{
    let options = options.into();
    tokio::select! {
        output = future => Ok(output),
        _ = tokio::time::sleep(options.timeout) => {
            if let Some(on_timeout) = options.on_timeout {
                on_timeout();
            }
            Err(TimeoutError {
                timeout: options.timeout,
                message: options
                    .error_message
                    .unwrap_or_else(|| "operation timed out".to_string()),
            })
        }
    }
}
