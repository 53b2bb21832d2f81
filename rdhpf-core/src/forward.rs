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

//! The session manager's per-forward primitives (spec.md 4.6): add/cancel
//! a loopback forward over the existing multiplexed channel, classify
//! local-bind conflicts out of stderr, and retry those with exponential
//! backoff. Per the data model invariant (spec.md 3), the local and
//! remote ports of a forward are always the same published port `p`, so
//! cancellation only needs that one port number.

use std::{
    fmt, net,
    process::Output,
    time::Duration,
};

use tracing::debug;

use crate::{consts, remote_cmd, session::SessionManager};

#[derive(Debug, Clone)]
pub enum ForwardError {
    /// The remote failed to bind because something already owns the
    /// port locally. Retryable with backoff.
    BindConflict(String),
    /// Any other failure: permissions, unreachable, protocol errors.
    /// Not retried by the reconciler.
    Other(String),
}

impl fmt::Display for ForwardError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForwardError::BindConflict(s) => write!(f, "{}", s),
            ForwardError::Other(s) => write!(f, "{}", s),
        }
    }
}

impl std::error::Error for ForwardError {}

/// Substrings that identify a local-bind conflict in ssh's stderr
/// (spec.md 4.6). Anything else is treated as non-retryable.
const CONFLICT_PATTERNS: &[&str] = &[
    "address already in use",
    "cannot listen to port",
    "remote port forwarding failed",
];

pub fn classify_stderr(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    CONFLICT_PATTERNS.iter().any(|p| lower.contains(p))
}

fn classify_output(op: &str, output: &Output) -> ForwardError {
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    if classify_stderr(&stderr) {
        ForwardError::BindConflict(format!("{}: port already in use ({})", op, stderr.trim()))
    } else {
        ForwardError::Other(format!("{}: {}", op, stderr.trim()))
    }
}

/// The seam the reconciler calls through, so its tests can substitute a
/// fake backend instead of shelling out to a real `ssh` process.
pub trait ForwardBackend: Send + Sync {
    fn add_forward(&self, port: u16) -> Result<(), ForwardError>;
    fn cancel_forward(&self, port: u16) -> Result<(), ForwardError>;
}

impl ForwardBackend for SessionManager {
    fn add_forward(&self, port: u16) -> Result<(), ForwardError> {
        let output = remote_cmd::ssh_forward_command(self.endpoint(), self.control_path(), port, port)
            .output()
            .map_err(|e| ForwardError::Other(format!("spawning ssh -O forward: {}", e)))?;
        if !output.status.success() {
            return Err(classify_output("AddForward", &output));
        }
        if !probe_local_listener(port) {
            return Err(ForwardError::Other(format!(
                "127.0.0.1:{} did not become connectable after AddForward",
                port
            )));
        }
        Ok(())
    }

    fn cancel_forward(&self, port: u16) -> Result<(), ForwardError> {
        let output =
            remote_cmd::ssh_cancel_forward_command(self.endpoint(), self.control_path(), port, port)
                .output()
                .map_err(|e| ForwardError::Other(format!("spawning ssh -O cancel: {}", e)))?;
        if !output.status.success() {
            // TIME_WAIT on the local socket is expected and fine; ssh
            // itself reports success for the cancel request regardless,
            // so a non-zero exit here means the cancel request itself
            // was rejected, not that the port is still bound.
            return Err(classify_output("CancelForward", &output));
        }
        Ok(())
    }
}

fn probe_local_listener(port: u16) -> bool {
    net::TcpStream::connect_timeout(
        &net::SocketAddr::from(([127, 0, 0, 1], port)),
        Duration::from_millis(500),
    )
    .is_ok()
}

/// The operator-tunable knobs behind [`backoff_delay`]/
/// [`add_forward_with_backoff`] (spec.md 13: `forward_backoff_base_ms`,
/// `forward_backoff_cap_ms`, `forward_backoff_max_attempts`).
#[derive(Debug, Clone, Copy)]
pub struct BackoffParams {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl Default for BackoffParams {
    fn default() -> Self {
        BackoffParams {
            base: consts::FORWARD_BACKOFF_BASE,
            cap: consts::FORWARD_BACKOFF_CAP,
            max_attempts: consts::FORWARD_BACKOFF_MAX_ATTEMPTS,
        }
    }
}

/// Compute the exponential backoff delay for the `attempt`'th retry
/// (0-indexed), capped, per spec.md 4.6.
pub fn backoff_delay(attempt: u32, params: &BackoffParams) -> Duration {
    let scaled = params.base.as_millis().saturating_mul(1u128 << attempt.min(30));
    Duration::from_millis(scaled.min(params.cap.as_millis()) as u64)
}

/// Retry `op` (a single AddForward attempt) with exponential backoff,
/// only continuing to retry while the failure classifies as a bind
/// conflict. Returns the last error once the attempt budget is
/// exhausted or a non-conflict error is hit.
pub fn add_forward_with_backoff<B: ForwardBackend + ?Sized>(
    backend: &B,
    port: u16,
    params: &BackoffParams,
    sleep: impl Fn(Duration),
) -> Result<(), (ForwardError, u32)> {
    let mut last_err = None;
    for attempt in 0..params.max_attempts {
        match backend.add_forward(port) {
            Ok(()) => return Ok(()),
            Err(ForwardError::BindConflict(msg)) => {
                debug!(port, attempt, "bind conflict, will retry");
                last_err = Some((ForwardError::BindConflict(msg), attempt + 1));
                if attempt + 1 < params.max_attempts {
                    sleep(backoff_delay(attempt, params));
                }
            }
            Err(other) => return Err((other, attempt + 1)),
        }
    }
    Err(last_err.expect("loop runs at least once since max_attempts > 0"))
}

#[cfg(test)]
mod tests {
    use std::sync::{Mutex, atomic::{AtomicU32, Ordering}};

    use super::*;

    #[test]
    fn classifies_known_conflict_phrasings() {
        assert!(classify_stderr("bind: Address already in use"));
        assert!(classify_stderr("channel_setup_fwd_listener: cannot listen to port: 8080"));
        assert!(classify_stderr("Warning: remote port forwarding failed for listen port 8080"));
    }

    #[test]
    fn does_not_classify_unrelated_errors() {
        assert!(!classify_stderr("Permission denied (publickey)."));
        assert!(!classify_stderr("ssh: connect to host build-box port 22: Connection refused"));
    }

    #[test]
    fn backoff_grows_exponentially_and_caps() {
        let params = BackoffParams::default();
        assert_eq!(backoff_delay(0, &params), Duration::from_millis(100));
        assert_eq!(backoff_delay(1, &params), Duration::from_millis(200));
        assert_eq!(backoff_delay(2, &params), Duration::from_millis(400));
        assert_eq!(backoff_delay(20, &params), Duration::from_secs(10));
    }

    #[test]
    fn backoff_params_are_configurable_independent_of_consts() {
        let params = BackoffParams { base: Duration::from_millis(10), cap: Duration::from_millis(50), max_attempts: 3 };
        assert_eq!(backoff_delay(0, &params), Duration::from_millis(10));
        assert_eq!(backoff_delay(1, &params), Duration::from_millis(20));
        assert_eq!(backoff_delay(5, &params), Duration::from_millis(50));
    }

    struct FlakyBackend {
        fail_times: u32,
        calls: AtomicU32,
    }

    impl ForwardBackend for FlakyBackend {
        fn add_forward(&self, _port: u16) -> Result<(), ForwardError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_times {
                Err(ForwardError::BindConflict("address already in use".to_string()))
            } else {
                Ok(())
            }
        }
        fn cancel_forward(&self, _port: u16) -> Result<(), ForwardError> {
            Ok(())
        }
    }

    #[test]
    fn retries_conflicts_until_success() {
        let backend = FlakyBackend { fail_times: 2, calls: AtomicU32::new(0) };
        let sleeps: Mutex<Vec<Duration>> = Mutex::new(Vec::new());
        let res = add_forward_with_backoff(&backend, 8080, &BackoffParams::default(), |d| {
            sleeps.lock().unwrap().push(d)
        });
        assert!(res.is_ok());
        assert_eq!(sleeps.lock().unwrap().len(), 2);
    }

    struct AlwaysConflict;
    impl ForwardBackend for AlwaysConflict {
        fn add_forward(&self, _port: u16) -> Result<(), ForwardError> {
            Err(ForwardError::BindConflict("address already in use".to_string()))
        }
        fn cancel_forward(&self, _port: u16) -> Result<(), ForwardError> {
            Ok(())
        }
    }

    #[test]
    fn exhausts_attempt_budget_and_reports_count() {
        let params = BackoffParams::default();
        let res = add_forward_with_backoff(&AlwaysConflict, 8080, &params, |_| {});
        let (err, attempts) = res.unwrap_err();
        assert!(matches!(err, ForwardError::BindConflict(_)));
        assert_eq!(attempts, params.max_attempts);
    }

    struct AlwaysOther;
    impl ForwardBackend for AlwaysOther {
        fn add_forward(&self, _port: u16) -> Result<(), ForwardError> {
            Err(ForwardError::Other("permission denied".to_string()))
        }
        fn cancel_forward(&self, _port: u16) -> Result<(), ForwardError> {
            Ok(())
        }
    }

    #[test]
    fn non_conflict_errors_are_not_retried() {
        let res = add_forward_with_backoff(&AlwaysOther, 8080, &BackoffParams::default(), |_| {
            panic!("should not sleep/retry on a non-conflict error")
        });
        let (err, attempts) = res.unwrap_err();
        assert!(matches!(err, ForwardError::Other(_)));
        assert_eq!(attempts, 1);
    }
}
