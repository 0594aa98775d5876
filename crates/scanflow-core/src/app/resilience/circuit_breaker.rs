//! Process-local circuit breaker.
//!
//! Closed → (fail_max consecutive failures) → Open → (open_duration) → HalfOpen
//! HalfOpen は試行を 1 件だけ通し、成功で Closed、失敗で Open に戻る。

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    fail_max: u32,
    open_duration: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, fail_max: u32, open_duration: Duration) -> Self {
        Self {
            name: name.into(),
            fail_max: fail_max.max(1),
            open_duration,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitState) {
        if inner.state == to {
            return;
        }
        info!(
            breaker = %self.name,
            from = inner.state.as_str(),
            to = to.as_str(),
            failures = inner.consecutive_failures,
            "circuit breaker state change"
        );
        inner.state = to;
    }

    /// Ask to make a call. `None` means short-circuit: do not touch the network.
    pub fn try_acquire(&self) -> Option<CallPermit<'_>> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Some(CallPermit::new(self, false)),
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(self.open_duration);
                if elapsed < self.open_duration {
                    return None;
                }
                self.transition(&mut inner, CircuitState::HalfOpen);
                inner.trial_in_flight = true;
                Some(CallPermit::new(self, true))
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    return None;
                }
                inner.trial_in_flight = true;
                Some(CallPermit::new(self, true))
            }
        }
    }

    fn on_success(&self, trial: bool) {
        let mut inner = self.lock();
        if trial {
            inner.trial_in_flight = false;
        }
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        self.transition(&mut inner, CircuitState::Closed);
    }

    fn on_failure(&self, trial: bool) {
        let mut inner = self.lock();
        if trial {
            inner.trial_in_flight = false;
        }
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        // opened_at は Open に入るときだけ更新する（遅れて届いた失敗で窓を延ばさない）
        let open = match inner.state {
            CircuitState::Closed => inner.consecutive_failures >= self.fail_max,
            CircuitState::HalfOpen => trial,
            CircuitState::Open => false,
        };
        if open {
            inner.opened_at = Some(Instant::now());
            self.transition(&mut inner, CircuitState::Open);
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    /// Force back to closed with a clean counter.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.trial_in_flight = false;
        self.transition(&mut inner, CircuitState::Closed);
    }
}

/// Admission to make one call. Report the outcome with `success` / `failure`.
///
/// A permit dropped without a verdict counts as a failure, so an abandoned
/// half-open trial cannot wedge the breaker.
#[must_use]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl<'a> CallPermit<'a> {
    fn new(breaker: &'a CircuitBreaker, trial: bool) -> Self {
        Self {
            breaker,
            trial,
            settled: false,
        }
    }

    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.on_success(self.trial);
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.on_failure(self.trial);
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.on_failure(self.trial);
        }
    }
}
