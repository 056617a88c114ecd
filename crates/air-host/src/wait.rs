//! Wait abstraction
//!
//! Completion is detected by polling shared memory. [`WaitPolicy`] decides
//! how: a burst of tight polls, then polls interleaved with `yield_now`,
//! then sleeps that double up to `max_backoff`. An optional deadline and
//! [`CancelToken`] bound the wait.

use crate::error::{AirError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Shared cancellation flag
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// New, not cancelled
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation of every wait holding this token
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// True once [`CancelToken::cancel`] was called
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// How long and how hard to poll
#[derive(Debug, Clone)]
pub struct WaitPolicy {
    /// Give up after this long; `None` waits forever
    pub timeout: Option<Duration>,
    /// Polls before the first yield
    pub spin_polls: u32,
    /// Yield every N polls after the spin phase; sleeping starts after
    /// `spin_polls + 16 * yield_interval` polls
    pub yield_interval: u32,
    /// Upper bound of the exponential sleep
    pub max_backoff: Duration,
    /// Optional external cancellation
    pub cancel: Option<CancelToken>,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self::indefinite()
    }
}

impl WaitPolicy {
    /// Wait until done, however long it takes
    #[must_use]
    pub const fn indefinite() -> Self {
        Self {
            timeout: None,
            spin_polls: 64,
            yield_interval: 8,
            max_backoff: Duration::from_millis(1),
            cancel: None,
        }
    }

    /// Wait at most `timeout`
    #[must_use]
    pub fn bounded(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Self::indefinite()
        }
    }

    /// Builder: attach a cancellation token
    #[must_use]
    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Poll `probe` until it reports done
    ///
    /// Returns the number of polls taken.
    ///
    /// # Errors
    ///
    /// Returns [`AirError::Timeout`] past the deadline, [`AirError::Cancelled`]
    /// when the token fires, or whatever `probe` returns.
    pub fn poll_until(&self, mut probe: impl FnMut() -> Result<bool>) -> Result<u64> {
        let start = Instant::now();
        let yield_interval = u64::from(self.yield_interval.max(1));
        let spin = u64::from(self.spin_polls);
        let sleep_after = spin + 16 * yield_interval;
        let mut backoff = Duration::from_micros(1);
        let mut polls = 0u64;

        loop {
            polls += 1;
            if probe()? {
                return Ok(polls);
            }
            if self.cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
                tracing::debug!("Wait cancelled after {polls} polls");
                return Err(AirError::Cancelled);
            }
            if let Some(timeout) = self.timeout {
                if start.elapsed() >= timeout {
                    tracing::warn!("Wait timed out after {polls} polls");
                    return Err(AirError::Timeout {
                        duration_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    });
                }
            }

            if polls < spin {
                std::hint::spin_loop();
            } else if polls < sleep_after {
                if (polls - spin) % yield_interval == 0 {
                    std::thread::yield_now();
                }
            } else {
                std::thread::sleep(backoff);
                backoff = (backoff * 2).min(self.max_backoff);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_returns_when_probe_succeeds() {
        let n = Cell::new(0);
        let polls = WaitPolicy::indefinite()
            .poll_until(|| {
                n.set(n.get() + 1);
                Ok(n.get() == 500)
            })
            .unwrap();
        assert_eq!(polls, 500);
    }

    #[test]
    fn test_timeout() {
        let err = WaitPolicy::bounded(Duration::from_millis(20))
            .poll_until(|| Ok(false))
            .unwrap_err();
        assert!(matches!(err, AirError::Timeout { duration_ms: 20 }));
    }

    #[test]
    fn test_cancel_from_other_thread() {
        let token = CancelToken::new();
        let remote = token.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            remote.cancel();
        });
        let err = WaitPolicy::indefinite()
            .with_cancel(token)
            .poll_until(|| Ok(false))
            .unwrap_err();
        handle.join().unwrap();
        assert!(matches!(err, AirError::Cancelled));
    }

    #[test]
    fn test_probe_error_propagates() {
        let err = WaitPolicy::indefinite()
            .poll_until(|| Err(AirError::invalid_state("gone")))
            .unwrap_err();
        assert!(matches!(err, AirError::InvalidState { .. }));
    }
}
