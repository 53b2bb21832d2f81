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

//! The SSH multiplexed session manager (spec.md 4.1): owns exactly one
//! long-lived ControlMaster channel to the remote host, health-checks
//! it, rebuilds it on failure behind a circuit breaker, and hands other
//! components its control-socket path so they can ride the same
//! multiplexed channel for their own one-shot `ssh` invocations.

use std::{
    env,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use tracing::{debug, info, instrument, warn};

use crate::{
    breaker::{Breaker, BreakerState, ProbeDecision},
    consts, endpoint::RemoteEndpoint, remote_cmd,
};

type RecoveryCallback = Box<dyn Fn() + Send + Sync + 'static>;

struct Inner {
    breaker: Breaker,
    last_healthy: Option<Instant>,
    was_healthy: bool,
}

/// Owns the SSH ControlMaster channel for one `(user, host, port)`
/// endpoint. Cheaply `Clone`-able (an `Arc` internally) so the manager
/// and the health monitor thread can share it.
pub struct SessionManager {
    endpoint: RemoteEndpoint,
    control_path: PathBuf,
    inner: Mutex<Inner>,
    recovery_callback: Mutex<Option<RecoveryCallback>>,
    monitor_stop: Arc<AtomicBool>,
}

impl SessionManager {
    pub fn new(endpoint: RemoteEndpoint) -> Self {
        Self::with_breaker_params(endpoint, consts::BREAKER_FAILURE_THRESHOLD, consts::BREAKER_COOLDOWN)
    }

    /// Build a manager with a breaker tuned from config rather than the
    /// compiled-in defaults (spec.md 13).
    pub fn with_breaker_params(
        endpoint: RemoteEndpoint,
        breaker_failure_threshold: u32,
        breaker_cooldown: Duration,
    ) -> Self {
        let control_path = derive_control_path(&endpoint);
        SessionManager {
            endpoint,
            control_path,
            inner: Mutex::new(Inner {
                breaker: Breaker::with_params(breaker_failure_threshold, breaker_cooldown),
                last_healthy: None,
                was_healthy: false,
            }),
            recovery_callback: Mutex::new(None),
            monitor_stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn endpoint(&self) -> &RemoteEndpoint {
        &self.endpoint
    }

    /// The filesystem handle other components pass to their own `ssh`
    /// invocations to reuse this channel (spec.md Design Notes).
    pub fn control_path(&self) -> &Path {
        &self.control_path
    }

    pub fn set_recovery_callback<F>(&self, f: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.recovery_callback.lock().unwrap() = Some(Box::new(f));
    }

    /// Spawn the ControlMaster in the background and block until a
    /// health probe against it succeeds.
    #[instrument(skip_all, fields(control_path = ?self.control_path))]
    pub fn open(&self) -> anyhow::Result<()> {
        info!(host = %self.endpoint, "opening ssh control channel");
        let status = remote_cmd::ssh_control_master_command(&self.endpoint, &self.control_path)
            .status()
            .context("spawning ssh ControlMaster")?;
        if !status.success() {
            return Err(anyhow!("ssh ControlMaster exited with {}", status));
        }

        // ssh -f returns once authentication completes and it has
        // forked into the background; give the freshly-opened mux
        // socket a few attempts to answer before giving up.
        let mut last_err = None;
        for attempt in 0..5 {
            match self.check() {
                Ok(()) => {
                    self.note_healthy();
                    return Ok(());
                }
                Err(e) => {
                    last_err = Some(e);
                    thread::sleep(Duration::from_millis(100 * (attempt + 1)));
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow!("control channel never became healthy")))
            .context("waiting for freshly opened control channel to become healthy")
    }

    /// Graceful exit plus best-effort socket cleanup. Idempotent.
    #[instrument(skip_all)]
    pub fn close(&self) {
        info!("closing ssh control channel");
        let _ = remote_cmd::ssh_control_command(&self.endpoint, &self.control_path, "exit")
            .status();
        if self.control_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.control_path) {
                warn!(error = %e, "failed to remove stale control socket");
            }
        }
    }

    /// Synchronous health probe against the existing channel.
    #[instrument(skip_all)]
    pub fn check(&self) -> anyhow::Result<()> {
        let status = remote_cmd::ssh_control_command(&self.endpoint, &self.control_path, "check")
            .status()
            .context("running ssh -O check")?;
        if status.success() {
            Ok(())
        } else {
            Err(anyhow!("ssh -O check failed with {}", status))
        }
    }

    /// Probe; on failure, clear any stale control-socket artifact, tear
    /// down, and open again. Always actually probes, regardless of
    /// breaker state -- the breaker only gates the periodic health
    /// monitor's own rebuild attempts, never an explicit caller.
    #[instrument(skip_all)]
    pub fn ensure_alive(&self) -> anyhow::Result<()> {
        if self.check().is_ok() {
            self.note_healthy();
            return Ok(());
        }
        warn!("control channel unhealthy, rebuilding");
        if self.control_path.exists() {
            let _ = std::fs::remove_file(&self.control_path);
        }
        self.open()
    }

    fn note_healthy(&self) {
        let mut inner = self.inner.lock().unwrap();
        let was_failed = !inner.was_healthy;
        inner.was_healthy = true;
        inner.last_healthy = Some(Instant::now());
        inner.breaker.on_success();
        drop(inner);
        if was_failed {
            if let Some(cb) = self.recovery_callback.lock().unwrap().as_ref() {
                debug!("firing recovery callback after failed -> healthy transition");
                cb();
            }
        }
    }

    fn note_failed(&self, now: Instant) {
        let mut inner = self.inner.lock().unwrap();
        inner.was_healthy = false;
        inner.breaker.on_failure(now);
    }

    pub fn breaker_state(&self) -> BreakerState {
        self.inner.lock().unwrap().breaker.state()
    }

    /// Spawn the background health-monitor loop. Ticks on `interval`,
    /// calling `ensure_alive` when the breaker allows it and rolling the
    /// outcome into the breaker / recovery callback.
    pub fn start_health_monitor(self: &Arc<Self>, interval: Duration) {
        let this = Arc::clone(self);
        this.monitor_stop.store(false, Ordering::SeqCst);
        thread::spawn(move || {
            while !this.monitor_stop.load(Ordering::SeqCst) {
                thread::sleep(interval);
                if this.monitor_stop.load(Ordering::SeqCst) {
                    break;
                }
                let now = Instant::now();
                let decide = this.inner.lock().unwrap().breaker.decide(now);
                if decide == ProbeDecision::ShortCircuit {
                    continue;
                }
                match this.ensure_alive() {
                    Ok(()) => {}
                    Err(e) => {
                        warn!(error = %e, "health monitor rebuild attempt failed");
                        this.note_failed(now);
                    }
                }
            }
        });
    }

    pub fn stop_health_monitor(&self) {
        self.monitor_stop.store(true, Ordering::SeqCst);
    }
}

fn derive_control_path(endpoint: &RemoteEndpoint) -> PathBuf {
    env::temp_dir().join(format!("{}{}.sock", consts::CONTROL_SOCKET_PREFIX, endpoint.hash()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_path_is_deterministic_for_the_same_endpoint() {
        let e1 = RemoteEndpoint::parse("ssh://dev@build-box:2222").unwrap();
        let e2 = RemoteEndpoint::parse("dev@build-box:2222").unwrap();
        assert_eq!(derive_control_path(&e1), derive_control_path(&e2));
    }

    #[test]
    fn control_path_differs_across_endpoints() {
        let e1 = RemoteEndpoint::parse("ssh://dev@host-a").unwrap();
        let e2 = RemoteEndpoint::parse("ssh://dev@host-b").unwrap();
        assert_ne!(derive_control_path(&e1), derive_control_path(&e2));
    }

    #[test]
    fn control_path_is_under_the_temp_dir_with_the_documented_prefix() {
        let e = RemoteEndpoint::parse("ssh://dev@host").unwrap();
        let path = derive_control_path(&e);
        assert!(path.starts_with(env::temp_dir()));
        assert!(path.file_name().unwrap().to_string_lossy().starts_with("rdhpf-"));
    }
}
