//! Three-state circuit breaker guarding upstream calls.
//!
//! Closed passes calls through and counts consecutive failures within a
//! short window. Reaching the threshold opens the circuit until its
//! reset timeout elapses, after which one probe is allowed (half-open);
//! the probe's outcome decides between closing and re-opening. A
//! periodic health check can promote an open breaker to half-open early.

use std::{
    sync::{Arc, RwLock},
    time::Duration,
};

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::errors::Error;

/// Consecutive failures tripping the breaker.
pub const FAILURE_THRESHOLD: u32 = 3;
/// Window within which failures count as consecutive.
pub const FAILURE_WINDOW: Duration = Duration::from_secs(60);
/// Reset timeout for ordinary failures.
pub const RESET_TIMEOUT: Duration = Duration::from_secs(30);
/// Reset timeout when the tripping failure was a rate limit.
pub const RATE_LIMIT_RESET_TIMEOUT: Duration = Duration::from_secs(60 * 60);
/// Interval between upstream health probes.
pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half-open",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
enum Inner {
    Closed {
        consecutive_failures: u32,
        window_start: Option<DateTime<Utc>>,
    },
    Open {
        until: DateTime<Utc>,
    },
    HalfOpen {
        probe_in_flight: bool,
    },
}

impl Inner {
    fn state(&self) -> BreakerState {
        match self {
            Self::Closed { .. } => BreakerState::Closed,
            Self::Open { .. } => BreakerState::Open,
            Self::HalfOpen { .. } => BreakerState::HalfOpen,
        }
    }
}

pub struct CircuitBreaker {
    name: &'static str,
    inner: RwLock<Inner>,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            inner: RwLock::new(Inner::Closed {
                consecutive_failures: 0,
                window_start: None,
            }),
        }
    }

    #[must_use]
    pub fn state(&self) -> BreakerState {
        self.inner.read().unwrap().state()
    }

    /// When the breaker next allows a probe, if it is currently open.
    #[must_use]
    pub fn next_retry_time(&self) -> Option<DateTime<Utc>> {
        match &*self.inner.read().unwrap() {
            Inner::Open { until } => Some(*until),
            Inner::Closed { .. } | Inner::HalfOpen { .. } => None,
        }
    }

    /// Guard for every call through the breaker. An expired open state
    /// transitions to half-open and admits the caller as the probe.
    pub fn can_execute(&self) -> Result<(), Error> {
        let mut inner = self.inner.write().unwrap();

        match &mut *inner {
            Inner::Closed { .. } => Ok(()),
            Inner::Open { until } => {
                let until = *until;

                if Utc::now() >= until {
                    self.transition(&mut inner, Inner::HalfOpen {
                        probe_in_flight: true,
                    });
                    Ok(())
                } else {
                    Err(Error::CircuitOpen { next_retry: until })
                }
            }
            Inner::HalfOpen { probe_in_flight } => {
                if *probe_in_flight {
                    // One probe at a time; everyone else keeps waiting.
                    Err(Error::CircuitOpen {
                        next_retry: Utc::now(),
                    })
                } else {
                    *probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.write().unwrap();

        match &mut *inner {
            Inner::Closed {
                consecutive_failures,
                window_start,
            } => {
                *consecutive_failures = 0;
                *window_start = None;
            }
            Inner::HalfOpen { .. } | Inner::Open { .. } => {
                self.transition(&mut inner, Inner::Closed {
                    consecutive_failures: 0,
                    window_start: None,
                });
            }
        }
    }

    pub fn record_failure(&self, reset_timeout: Duration) {
        let mut inner = self.inner.write().unwrap();
        let now = Utc::now();

        match &mut *inner {
            Inner::Closed {
                consecutive_failures,
                window_start,
            } => {
                let window_expired = window_start.is_some_and(|start| {
                    now - start > chrono::Duration::from_std(FAILURE_WINDOW).unwrap_or_default()
                });

                if window_expired || window_start.is_none() {
                    *window_start = Some(now);
                    *consecutive_failures = 1;
                } else {
                    *consecutive_failures += 1;
                }

                if *consecutive_failures >= FAILURE_THRESHOLD {
                    let until = now
                        + chrono::Duration::from_std(reset_timeout)
                            .unwrap_or_else(|_| chrono::Duration::seconds(30));
                    self.transition(&mut inner, Inner::Open { until });
                } else {
                    debug!(
                        breaker = self.name,
                        failures = *consecutive_failures,
                        "Breaker failure recorded."
                    );
                }
            }
            Inner::HalfOpen { .. } => {
                let until = now
                    + chrono::Duration::from_std(reset_timeout)
                        .unwrap_or_else(|_| chrono::Duration::seconds(30));
                self.transition(&mut inner, Inner::Open { until });
            }
            Inner::Open { .. } => {}
        }
    }

    /// Promotes an open breaker to half-open after a healthy out-of-band
    /// probe.
    pub fn mark_half_open(&self) {
        let mut inner = self.inner.write().unwrap();

        if let Inner::Open { .. } = &*inner {
            self.transition(&mut inner, Inner::HalfOpen {
                probe_in_flight: false,
            });
        }
    }

    fn transition(&self, inner: &mut Inner, next: Inner) {
        let prior = inner.state();
        let new = next.state();
        *inner = next;

        if prior != new {
            info!(
                breaker = self.name,
                prior = %prior,
                next = %new,
                "Breaker state transition."
            );
        }
    }
}

/// Probes upstream health every [`HEALTH_CHECK_INTERVAL`] while the
/// breaker is open; a healthy probe promotes it to half-open.
pub async fn run_health_check<F, Fut>(
    breaker: Arc<CircuitBreaker>,
    probe: F,
    mut exit_receiver: watch::Receiver<bool>,
) where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    loop {
        tokio::select! {
            () = tokio::time::sleep(HEALTH_CHECK_INTERVAL) => {}
            res = exit_receiver.changed() => {
                if res.is_err() {
                    return;
                }

                if *exit_receiver.borrow() {
                    return;
                }

                continue;
            }
        }

        if breaker.state() != BreakerState::Open {
            continue;
        }

        if probe().await {
            info!(breaker = breaker.name, "Health probe succeeded while open.");
            breaker.mark_half_open();
        } else {
            warn!(breaker = breaker.name, "Health probe failed while open.");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tripped() -> CircuitBreaker {
        let breaker = CircuitBreaker::new("test");
        for _ in 0..FAILURE_THRESHOLD {
            breaker.record_failure(RESET_TIMEOUT);
        }
        breaker
    }

    #[test]
    fn threshold_failures_trip_the_breaker() {
        let breaker = CircuitBreaker::new("test");
        assert_eq!(breaker.state(), BreakerState::Closed);

        breaker.record_failure(RESET_TIMEOUT);
        breaker.record_failure(RESET_TIMEOUT);
        assert_eq!(breaker.state(), BreakerState::Closed);

        breaker.record_failure(RESET_TIMEOUT);
        assert_eq!(breaker.state(), BreakerState::Open);

        let err = breaker.can_execute().unwrap_err();
        assert!(matches!(err, Error::CircuitOpen { .. }));
        assert!(breaker.next_retry_time().is_some());
    }

    #[test]
    fn success_resets_the_failure_count() {
        let breaker = CircuitBreaker::new("test");

        breaker.record_failure(RESET_TIMEOUT);
        breaker.record_failure(RESET_TIMEOUT);
        breaker.record_success();
        breaker.record_failure(RESET_TIMEOUT);
        breaker.record_failure(RESET_TIMEOUT);

        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn expired_open_state_admits_one_probe() {
        let breaker = CircuitBreaker::new("test");
        for _ in 0..FAILURE_THRESHOLD {
            breaker.record_failure(Duration::ZERO);
        }

        // Reset timeout of zero: the next caller becomes the probe.
        assert!(breaker.can_execute().is_ok());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        // A second caller is rejected while the probe is in flight.
        assert!(breaker.can_execute().is_err());

        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.can_execute().is_ok());
    }

    #[test]
    fn failed_probe_reopens_the_breaker() {
        let breaker = CircuitBreaker::new("test");
        for _ in 0..FAILURE_THRESHOLD {
            breaker.record_failure(Duration::ZERO);
        }

        assert!(breaker.can_execute().is_ok());
        breaker.record_failure(RESET_TIMEOUT);
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(breaker.can_execute().is_err());
    }

    #[test]
    fn health_probe_promotes_open_to_half_open() {
        let breaker = tripped();
        assert_eq!(breaker.state(), BreakerState::Open);

        breaker.mark_half_open();
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        // The next real call is the probe; success closes the circuit.
        assert!(breaker.can_execute().is_ok());
        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn half_open_promotion_only_applies_to_open() {
        let breaker = CircuitBreaker::new("test");
        breaker.mark_half_open();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }
}
