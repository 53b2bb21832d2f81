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

//! The event watchdog (spec.md 4.7, 9): detects a docker events stream
//! that has gone silent even though ssh itself hasn't reported an exit.
//! A silent stream could mean a healthy idle remote, or a hung pipe --
//! the watchdog can't tell the difference from timing alone, so it
//! nudges the remote (a throwaway container start/stop) and only
//! escalates to fatal if that nudge produces no event either.

use std::time::{Duration, Instant};

use crate::consts;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogAction {
    /// Nothing due yet.
    None,
    /// Silence has crossed the ping threshold: ask the caller to emit a
    /// throwaway container start/stop on the remote to provoke an event.
    Ping,
    /// Silence has crossed the fatal threshold even after a ping: the
    /// event stream is presumed dead and should be restarted.
    Fatal,
}

/// The operator-tunable thresholds behind [`Watchdog`] (spec.md 13:
/// `watchdog_ping_after_secs`, `watchdog_fatal_after_secs`).
#[derive(Debug, Clone, Copy)]
pub struct WatchdogParams {
    pub ping_after: Duration,
    pub fatal_after: Duration,
}

impl Default for WatchdogParams {
    fn default() -> Self {
        WatchdogParams { ping_after: consts::WATCHDOG_PING_AFTER, fatal_after: consts::WATCHDOG_FATAL_AFTER }
    }
}

/// Tracks time since the last observed docker event and decides when to
/// ping the remote or declare the stream dead (spec.md 4.7).
pub struct Watchdog {
    last_event: Instant,
    pinged_since_last_event: bool,
    params: WatchdogParams,
}

impl Watchdog {
    pub fn new(now: Instant) -> Self {
        Self::with_params(now, WatchdogParams::default())
    }

    /// Build a watchdog with thresholds tuned from config rather than
    /// the compiled-in defaults (spec.md 13).
    pub fn with_params(now: Instant, params: WatchdogParams) -> Self {
        Watchdog { last_event: now, pinged_since_last_event: false, params }
    }

    /// Record a real event from the stream, resetting the silence clock.
    pub fn note_event(&mut self, now: Instant) {
        self.last_event = now;
        self.pinged_since_last_event = false;
    }

    /// Call on every watchdog tick (spec.md's `WATCHDOG_TICK_INTERVAL`).
    /// Returns the action the caller should take, if any. Calling this
    /// again before taking the returned action is safe: `Ping` is only
    /// returned once per silence period, after which the watchdog waits
    /// for either a fresh event or the fatal threshold.
    pub fn tick(&mut self, now: Instant) -> WatchdogAction {
        let silence = now.saturating_duration_since(self.last_event);
        if silence >= self.params.fatal_after && self.pinged_since_last_event {
            return WatchdogAction::Fatal;
        }
        if silence >= self.params.ping_after && !self.pinged_since_last_event {
            self.pinged_since_last_event = true;
            return WatchdogAction::Ping;
        }
        WatchdogAction::None
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn at(secs: u64) -> Instant {
        // Instant has no epoch constructor; build a fixed base once and
        // offset from it so the deltas below are exact.
        let base = Instant::now();
        base + Duration::from_secs(secs)
    }

    #[test]
    fn stays_quiet_before_the_ping_threshold() {
        let mut w = Watchdog::new(at(0));
        assert_eq!(w.tick(at(10)), WatchdogAction::None);
        assert_eq!(w.tick(at(29)), WatchdogAction::None);
    }

    #[test]
    fn pings_once_at_the_threshold_then_stays_quiet() {
        let mut w = Watchdog::new(at(0));
        assert_eq!(w.tick(at(31)), WatchdogAction::Ping);
        assert_eq!(w.tick(at(35)), WatchdogAction::None);
    }

    #[test]
    fn escalates_to_fatal_only_after_a_ping_went_unanswered() {
        let mut w = Watchdog::new(at(0));
        assert_eq!(w.tick(at(31)), WatchdogAction::Ping);
        assert_eq!(w.tick(at(61)), WatchdogAction::Fatal);
    }

    #[test]
    fn a_real_event_resets_the_clock_even_after_a_ping() {
        let mut w = Watchdog::new(at(0));
        assert_eq!(w.tick(at(31)), WatchdogAction::Ping);
        w.note_event(at(40));
        assert_eq!(w.tick(at(50)), WatchdogAction::None);
        assert_eq!(w.tick(at(71)), WatchdogAction::Ping);
    }

    #[test]
    fn fatal_does_not_fire_without_a_prior_ping() {
        // can't happen in the real tick cadence (ping fires at 30s,
        // fatal threshold is 60s) but guard the invariant directly.
        let mut w = Watchdog::new(at(0));
        w.pinged_since_last_event = false;
        assert_eq!(w.tick(at(61)), WatchdogAction::Ping);
    }

    #[test]
    fn configured_thresholds_override_the_compiled_in_defaults() {
        let params = WatchdogParams { ping_after: Duration::from_secs(5), fatal_after: Duration::from_secs(10) };
        let mut w = Watchdog::with_params(at(0), params);
        assert_eq!(w.tick(at(6)), WatchdogAction::Ping);
        assert_eq!(w.tick(at(11)), WatchdogAction::Fatal);
    }
}
