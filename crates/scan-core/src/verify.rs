//! Set-and-verify with bounded retries.
//!
//! Both controllers silently drop or ignore commands now and then, so every
//! state-changing setting is confirmed by reading it back:
//!
//! ```text
//! for attempt in 1..=attempts:
//!     apply()              write the set command
//!     sleep(settle)        let the controller act
//!     observe()            query, or read state refreshed by the pump
//!     matches? -> Ok
//!     sleep(backoff)       between attempts only
//! VerificationFailed
//! ```
//!
//! A link that goes down mid-flight ends the loop immediately with
//! [`ScanError::Disconnected`]; a failed write is reported as-is without retry.

use std::fmt::Debug;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::Deserialize;

use crate::error::{ScanError, ScanResult};
use crate::link::LinkStatus;

/// Attempt count and timings for [`set_and_verify`].
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct VerifyPolicy {
    /// Total attempts before giving up
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    /// Delay between writing the setting and reading it back
    pub settle_ms: u64,
    /// Delay between a failed attempt and the next one
    pub backoff_ms: u64,
}

fn default_attempts() -> u32 {
    3
}

impl VerifyPolicy {
    /// Three attempts with the given settle and backoff delays.
    pub fn new(settle: Duration, backoff: Duration) -> Self {
        Self {
            attempts: default_attempts(),
            settle_ms: settle.as_millis() as u64,
            backoff_ms: backoff.as_millis() as u64,
        }
    }

    /// Override the attempt count.
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    /// Settle delay as a `Duration`.
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    /// Backoff delay as a `Duration`.
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    /// Reject a policy that can never succeed.
    pub fn validate(&self) -> ScanResult<()> {
        if self.attempts == 0 {
            return Err(ScanError::Configuration(
                "verify attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Write a setting, read it back, retry until it matches or attempts run out.
///
/// `observe` returns `Ok(None)` when nothing usable was seen (no reply yet,
/// empty status). Observation errors other than link loss count as a mismatch
/// for that attempt.
///
/// Returns the observed value on success.
///
/// # Errors
///
/// - [`ScanError::Disconnected`] as soon as the link is down
/// - any error from `apply` (write failures are never retried)
/// - [`ScanError::VerificationFailed`] after the last attempt
pub async fn set_and_verify<'a, T, A, O>(
    what: &str,
    policy: &VerifyPolicy,
    link: &LinkStatus,
    expected: &T,
    mut apply: A,
    mut observe: O,
) -> ScanResult<T>
where
    T: PartialEq + Debug,
    A: FnMut() -> BoxFuture<'a, ScanResult<()>>,
    O: FnMut() -> BoxFuture<'a, ScanResult<Option<T>>>,
{
    let mut last_observed: Option<T> = None;

    for attempt in 1..=policy.attempts {
        link.ensure_up()?;
        apply().await?;

        tokio::time::sleep(policy.settle()).await;
        link.ensure_up()?;

        match observe().await {
            Ok(Some(observed)) if &observed == expected => {
                tracing::debug!(what, attempt, "Setting verified");
                return Ok(observed);
            }
            Ok(observed) => {
                tracing::debug!(
                    what,
                    attempt,
                    expected = ?expected,
                    observed = ?observed,
                    "Verification mismatch"
                );
                if observed.is_some() {
                    last_observed = observed;
                }
            }
            Err(e) if e.is_link_fatal() => return Err(e),
            Err(e) => {
                tracing::debug!(what, attempt, error = %e, "Read-back failed");
            }
        }

        if attempt < policy.attempts {
            tracing::debug!(what, attempt, attempts = policy.attempts, "Retrying");
            tokio::time::sleep(policy.backoff()).await;
        }
    }

    tracing::warn!(what, attempts = policy.attempts, "Failed to verify setting");
    Err(ScanError::VerificationFailed {
        what: what.to_string(),
        attempts: policy.attempts,
        expected: format!("{:?}", expected),
        observed: last_observed
            .map(|v| format!("{:?}", v))
            .unwrap_or_else(|| "nothing".to_string()),
    })
}
