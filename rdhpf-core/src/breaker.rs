// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The SSH session manager's circuit breaker (spec.md 4.1): stops rebuild
//! storms when the remote is unreachable without ever blocking an
//! explicit `EnsureAlive` call (that decision is the session manager's,
//! this type only tracks and reports state).

use std::time::{Duration, Instant};

use crate::consts;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Whether a probe should actually run or short-circuit to failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeDecision {
    Attempt,
    ShortCircuit,
}

pub struct Breaker {
    state: BreakerState,
    consecutive_failures: u32,
    open_since: Option<Instant>,
    failure_threshold: u32,
    cooldown: Duration,
}

impl Breaker {
    pub fn new() -> Self {
        Breaker::with_params(consts::BREAKER_FAILURE_THRESHOLD, consts::BREAKER_COOLDOWN)
    }

    pub fn with_params(failure_threshold: u32, cooldown: Duration) -> Self {
        Breaker {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            open_since: None,
            failure_threshold,
            cooldown,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    /// Call before running a probe. `Open` transitions to `HalfOpen`
    /// once the cooldown has elapsed, in which case the caller should
    /// actually probe and report the single result via `on_success`/
    /// `on_failure`.
    pub fn decide(&mut self, now: Instant) -> ProbeDecision {
        if self.state == BreakerState::Open {
            let elapsed = self.open_since.map(|t| now.duration_since(t)).unwrap_or(Duration::ZERO);
            if elapsed >= self.cooldown {
                self.state = BreakerState::HalfOpen;
            } else {
                return ProbeDecision::ShortCircuit;
            }
        }
        ProbeDecision::Attempt
    }

    pub fn on_success(&mut self) {
        self.state = BreakerState::Closed;
        self.consecutive_failures = 0;
        self.open_since = None;
    }

    pub fn on_failure(&mut self, now: Instant) {
        match self.state {
            BreakerState::HalfOpen => {
                self.state = BreakerState::Open;
                self.open_since = Some(now);
                // half-open only ever attempts one probe, so the
                // failure streak restarts from here.
                self.consecutive_failures = 1;
            }
            BreakerState::Closed => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.failure_threshold {
                    self.state = BreakerState::Open;
                    self.open_since = Some(now);
                }
            }
            BreakerState::Open => {
                // Shouldn't normally observe a failure while open since
                // decide() short-circuits, but stay defensive.
                self.open_since = Some(now);
            }
        }
    }
}

impl Default for Breaker {
    fn default() -> Self {
        Breaker::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_after_threshold_consecutive_failures() {
        let mut b = Breaker::with_params(3, Duration::from_secs(60));
        let t0 = Instant::now();
        for _ in 0..2 {
            assert_eq!(b.decide(t0), ProbeDecision::Attempt);
            b.on_failure(t0);
        }
        assert_eq!(b.state(), BreakerState::Closed);
        b.on_failure(t0);
        assert_eq!(b.state(), BreakerState::Open);
    }

    #[test]
    fn short_circuits_while_open_until_cooldown() {
        let mut b = Breaker::with_params(1, Duration::from_secs(60));
        let t0 = Instant::now();
        b.on_failure(t0);
        assert_eq!(b.state(), BreakerState::Open);
        assert_eq!(b.decide(t0 + Duration::from_secs(10)), ProbeDecision::ShortCircuit);
        assert_eq!(b.decide(t0 + Duration::from_secs(61)), ProbeDecision::Attempt);
        assert_eq!(b.state(), BreakerState::HalfOpen);
    }

    #[test]
    fn half_open_success_closes_and_resets_counter() {
        let mut b = Breaker::with_params(1, Duration::from_secs(60));
        let t0 = Instant::now();
        b.on_failure(t0);
        b.decide(t0 + Duration::from_secs(61));
        b.on_success();
        assert_eq!(b.state(), BreakerState::Closed);
        // should take a full fresh threshold of failures to reopen
        b.on_failure(t0 + Duration::from_secs(62));
        assert_eq!(b.state(), BreakerState::Open);
    }

    #[test]
    fn half_open_failure_reopens_and_resets_timer() {
        let mut b = Breaker::with_params(1, Duration::from_secs(60));
        let t0 = Instant::now();
        b.on_failure(t0);
        b.decide(t0 + Duration::from_secs(61));
        b.on_failure(t0 + Duration::from_secs(61));
        assert_eq!(b.state(), BreakerState::Open);
        assert_eq!(
            b.decide(t0 + Duration::from_secs(100)),
            ProbeDecision::ShortCircuit,
            "cooldown should restart from the half-open failure, not the original one"
        );
    }

    #[test]
    fn never_prevents_a_caller_from_deciding_to_probe_explicitly() {
        // EnsureAlive always probes regardless of breaker state; this is
        // enforced by the session manager calling Check directly rather
        // than consulting the breaker, so this test just documents that
        // decide() is advisory, not a gate the manager cannot bypass.
        let mut b = Breaker::with_params(1, Duration::from_secs(60));
        let t0 = Instant::now();
        b.on_failure(t0);
        assert_eq!(b.decide(t0), ProbeDecision::ShortCircuit);
        // EnsureAlive in session.rs does not consult `decide` at all.
    }
}
