//! Circuit breaker guarding backend calls
//!
//! Two states only. The breaker opens once the cumulative failure count
//! reaches the threshold and closes again, unconditionally, when the cooldown
//! has elapsed since the last failure. There is no half-open probe and
//! successes do not reset the counter; only the cooldown does.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

/// Current operational mode of the breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitState {
    /// Calls go through to the backend
    Closed,
    /// Calls are short-circuited with the fail-open result
    Open,
}

/// Point-in-time view of the breaker
#[derive(Debug, Clone)]
pub struct CircuitBreakerState {
    pub failure_count: u32,
    pub last_failure_at: Option<Instant>,
    pub is_open: bool,
    pub threshold: u32,
    pub cooldown: Duration,
}

#[derive(Debug, Default)]
struct Counters {
    failure_count: u32,
    last_failure_at: Option<Instant>,
    is_open: bool,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    threshold: u32,
    cooldown: Duration,
    counters: Mutex<Counters>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, threshold: u32, cooldown: Duration) -> Self {
        Self {
            name: name.into(),
            threshold: threshold.max(1),
            cooldown,
            counters: Mutex::new(Counters::default()),
        }
    }

    /// Whether a backend call may proceed. Closes an open breaker whose cooldown has elapsed.
    pub fn should_allow(&self) -> bool {
        let mut c = self.counters.lock();
        if !c.is_open {
            return true;
        }

        let cooled_down = c
            .last_failure_at
            .is_none_or(|at| at.elapsed() >= self.cooldown);
        if cooled_down {
            info!(
                component = %self.name,
                failures = c.failure_count,
                "Circuit breaker cooldown elapsed, closing"
            );
            *c = Counters::default();
        }
        cooled_down
    }

    /// Count a failed backend call, opening the breaker at the threshold
    pub fn record_failure(&self) {
        let mut c = self.counters.lock();
        c.failure_count = c.failure_count.saturating_add(1);
        c.last_failure_at = Some(Instant::now());

        if !c.is_open && c.failure_count >= self.threshold {
            c.is_open = true;
            warn!(
                component = %self.name,
                failures = c.failure_count,
                cooldown_secs = self.cooldown.as_secs(),
                "Circuit breaker opened, backend calls short-circuited"
            );
        }
    }

    /// Current state without applying the cooldown transition
    pub fn state(&self) -> CircuitState {
        if self.counters.lock().is_open {
            CircuitState::Open
        } else {
            CircuitState::Closed
        }
    }

    pub fn snapshot(&self) -> CircuitBreakerState {
        let c = self.counters.lock();
        CircuitBreakerState {
            failure_count: c.failure_count,
            last_failure_at: c.last_failure_at,
            is_open: c.is_open,
            threshold: self.threshold,
            cooldown: self.cooldown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn opens_at_threshold_and_closes_after_cooldown() {
        let cb = CircuitBreaker::new("test", 3, Duration::from_secs(60));

        cb.record_failure();
        cb.record_failure();
        assert!(cb.should_allow());
        assert_eq!(cb.state(), CircuitState::Closed);

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.should_allow());

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(!cb.should_allow());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(cb.should_allow());
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.snapshot().failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_accumulate_without_reset() {
        let cb = CircuitBreaker::new("test", 2, Duration::from_secs(1));
        cb.record_failure();
        // Time alone does not reset a closed breaker
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(cb.should_allow());
        cb.record_failure();
        assert!(cb.snapshot().is_open);
    }
}
