//! Circuit breaker for the push/pull loops.

use crate::config::BreakerConfig;
use crate::error::{EngineError, EngineResult};
use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Normal operation; calls flow through.
    Closed,
    /// Failing fast; no network attempts are made.
    Open,
    /// One trial request is allowed through.
    HalfOpen,
}

#[derive(Debug)]
enum Inner {
    Closed {
        consecutive_failures: u32,
        window_start: Option<Instant>,
    },
    Open {
        since: Instant,
    },
    HalfOpen {
        trial_in_flight: bool,
    },
}

/// Protects a failing remote from being hammered.
///
/// Closed → open after `failure_threshold` consecutive failures within
/// `failure_window`; open → half-open after `reset_timeout`; half-open →
/// closed on trial success, back to open on trial failure. While open,
/// callers get a deterministic time-until-retry instead of a network
/// attempt.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// Creates a closed breaker.
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner::Closed {
                consecutive_failures: 0,
                window_start: None,
            }),
        }
    }

    /// Returns the current state.
    pub fn state(&self) -> BreakerState {
        let mut inner = self.inner.lock();
        self.roll_over(&mut inner);
        match *inner {
            Inner::Closed { .. } => BreakerState::Closed,
            Inner::Open { .. } => BreakerState::Open,
            Inner::HalfOpen { .. } => BreakerState::HalfOpen,
        }
    }

    /// Asks permission to make a network call.
    ///
    /// Returns `BreakerOpen` with the deterministic time until the next
    /// trial when the breaker is open, or when a half-open trial is
    /// already in flight.
    pub fn check(&self) -> EngineResult<()> {
        let mut inner = self.inner.lock();
        self.roll_over(&mut inner);
        match &mut *inner {
            Inner::Closed { .. } => Ok(()),
            Inner::Open { since } => {
                let elapsed = since.elapsed();
                let remaining = self.config.reset_timeout.saturating_sub(elapsed);
                Err(EngineError::BreakerOpen {
                    retry_in_ms: remaining.as_millis() as u64,
                })
            }
            Inner::HalfOpen { trial_in_flight } => {
                if *trial_in_flight {
                    Err(EngineError::BreakerOpen {
                        retry_in_ms: self.config.reset_timeout.as_millis() as u64,
                    })
                } else {
                    *trial_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    /// Records a successful call.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match &*inner {
            Inner::HalfOpen { .. } => {
                debug!("circuit closed after successful trial");
            }
            Inner::Closed { .. } | Inner::Open { .. } => {}
        }
        *inner = Inner::Closed {
            consecutive_failures: 0,
            window_start: None,
        };
    }

    /// Records a failed call.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        match &mut *inner {
            Inner::Closed {
                consecutive_failures,
                window_start,
            } => {
                let now = Instant::now();
                match window_start {
                    Some(start) if now.duration_since(*start) <= self.config.failure_window => {
                        *consecutive_failures += 1;
                    }
                    _ => {
                        *window_start = Some(now);
                        *consecutive_failures = 1;
                    }
                }
                if *consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        failures = *consecutive_failures,
                        "circuit opened after consecutive failures"
                    );
                    *inner = Inner::Open { since: now };
                }
            }
            Inner::HalfOpen { .. } => {
                warn!("circuit reopened after failed trial");
                *inner = Inner::Open {
                    since: Instant::now(),
                };
            }
            Inner::Open { .. } => {}
        }
    }

    /// Deterministic time until the breaker next allows a call.
    pub fn time_until_retry(&self) -> Duration {
        let mut inner = self.inner.lock();
        self.roll_over(&mut inner);
        match &*inner {
            Inner::Open { since } => self.config.reset_timeout.saturating_sub(since.elapsed()),
            Inner::Closed { .. } | Inner::HalfOpen { .. } => Duration::ZERO,
        }
    }

    /// Moves open → half-open once the reset timeout has elapsed.
    fn roll_over(&self, inner: &mut Inner) {
        if let Inner::Open { since } = inner {
            if since.elapsed() >= self.config.reset_timeout {
                *inner = Inner::HalfOpen {
                    trial_in_flight: false,
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_breaker(threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            BreakerConfig::default()
                .with_failure_threshold(threshold)
                .with_reset_timeout(Duration::from_millis(20)),
        )
    }

    #[test]
    fn opens_after_threshold() {
        let breaker = fast_breaker(3);
        assert_eq!(breaker.state(), BreakerState::Closed);

        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.check().is_ok());

        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(matches!(
            breaker.check(),
            Err(EngineError::BreakerOpen { .. })
        ));
    }

    #[test]
    fn success_resets_the_failure_count() {
        let breaker = fast_breaker(3);
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn half_open_allows_exactly_one_trial() {
        let breaker = fast_breaker(1);
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);

        std::thread::sleep(Duration::from_millis(25));
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        assert!(breaker.check().is_ok());
        // Second caller must wait for the trial's outcome
        assert!(breaker.check().is_err());
    }

    #[test]
    fn trial_success_closes() {
        let breaker = fast_breaker(1);
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(25));
        assert!(breaker.check().is_ok());

        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn trial_failure_reopens() {
        let breaker = fast_breaker(1);
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(25));
        assert!(breaker.check().is_ok());

        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[test]
    fn reports_time_until_retry() {
        let breaker = fast_breaker(1);
        assert_eq!(breaker.time_until_retry(), Duration::ZERO);

        breaker.record_failure();
        let remaining = breaker.time_until_retry();
        assert!(remaining > Duration::ZERO);
        assert!(remaining <= Duration::from_millis(20));
    }
}
