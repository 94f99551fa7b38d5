use std::{
    sync::{Mutex, PoisonError},
    time::Duration,
};

use tokio::time::Instant;

use crate::core::domain::{Outcome, Verdict};

#[derive(Debug, Default)]
struct BreakerState {
    consecutive_faults: u32,
    open_until: Option<Instant>,
}

/// Stops admissions for a while after repeated infrastructure faults.
/// A threshold of zero disables it.
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold,
            cooldown,
            state: Mutex::new(BreakerState::default()),
        }
    }

    pub fn is_open(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match state.open_until {
            Some(until) if Instant::now() < until => true,
            Some(_) => {
                tracing::info!("Circuit breaker cooldown elapsed, admitting submissions again");
                state.open_until = None;
                state.consecutive_faults = 0;
                false
            }
            None => false,
        }
    }

    pub fn record(&self, verdict: &Verdict) {
        if self.threshold == 0 || verdict.outcome == Outcome::Aborted {
            return;
        }

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !verdict.is_infrastructure_fault() {
            state.consecutive_faults = 0;
            return;
        }

        state.consecutive_faults += 1;
        if state.consecutive_faults >= self.threshold && state.open_until.is_none() {
            tracing::error!(
                consecutive_faults = state.consecutive_faults,
                cooldown_ms = self.cooldown.as_millis() as u64,
                "Judge looks unhealthy, rejecting new submissions"
            );
            state.open_until = Some(Instant::now() + self.cooldown);
        }
    }
}
