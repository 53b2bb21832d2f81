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

//! The manager (spec.md 4.7, 4.8): the top-level loop that wires the
//! session, event reader, inspector, reconciler, watchdog, state-file
//! writer and IPC server together and drives their lifecycle.

use std::{
    collections::{BTreeMap, BTreeSet},
    process,
    sync::{atomic::AtomicBool, Arc},
    thread,
    time::{Duration, Instant},
};

use chrono::Utc;
use crossbeam_channel::{select, tick};
use tracing::{error, info, warn};

use crate::{
    config::Config,
    consts,
    endpoint::RemoteEndpoint,
    events::{self, EventKind},
    forward::BackoffParams,
    history::History,
    inspector,
    ipc::IpcServer,
    reconciler::{self, ReconcilePass},
    session::SessionManager,
    state::State,
    statefile,
    watchdog::{Watchdog, WatchdogAction, WatchdogParams},
};

enum LoopExit {
    Shutdown,
    StreamDied(String),
}

fn session_retry_delay(attempt: u32) -> Duration {
    let scaled = consts::SESSION_RETRY_BASE.as_millis().saturating_mul(1u128 << attempt.min(30));
    Duration::from_millis(scaled.min(consts::SESSION_RETRY_CAP.as_millis()) as u64)
}

/// Everything one run of `rdhpf run` needs threaded through its
/// lifetime; owned by `run()`, shared with background threads via `Arc`.
pub struct Manager {
    pub endpoint: RemoteEndpoint,
    pub session: Arc<SessionManager>,
    pub state: Arc<State>,
    pub history: Arc<History>,
    pub config: Config,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

impl Manager {
    pub fn new(endpoint: RemoteEndpoint, config: Config) -> Self {
        let session = Arc::new(SessionManager::with_breaker_params(
            endpoint.clone(),
            config.breaker_failure_threshold,
            Duration::from_secs(config.breaker_cooldown_secs),
        ));
        Manager {
            endpoint,
            session,
            state: Arc::new(State::new()),
            history: Arc::new(History::new()),
            config,
            started_at: Utc::now(),
        }
    }

    fn backoff_params(&self) -> BackoffParams {
        BackoffParams {
            base: Duration::from_millis(self.config.forward_backoff_base_ms),
            cap: Duration::from_millis(self.config.forward_backoff_cap_ms),
            max_attempts: self.config.forward_backoff_max_attempts,
        }
    }

    /// Run the full daemon lifecycle until `shutdown_flag` is set
    /// (spec.md 4.7 startup sequence, 4.8 graceful shutdown).
    pub fn run(&self, shutdown_flag: Arc<AtomicBool>) -> anyhow::Result<()> {
        info!(host = %self.endpoint, "starting up");
        self.session.open()?;
        self.session.start_health_monitor(Duration::from_secs(self.config.health_check_interval_secs));

        {
            let state = Arc::clone(&self.state);
            self.session.set_recovery_callback(move || {
                info!("control channel recovered, marking all active forwards for re-check");
                for container in state.get_all_containers() {
                    for (port, fwd) in state.get_by_container(&container) {
                        if fwd.status == rdhpf_protocol::ForwardStatus::Active {
                            state.mark_pending(&container, port, "recovering after ssh reconnect", Utc::now());
                        }
                    }
                }
            });
        }

        self.sync_from_running_containers()?;

        statefile::ensure_state_dir()?;
        let state_file_path = statefile::state_file_path(&self.endpoint)?;
        let ipc_socket_path = statefile::ipc_socket_path(&self.endpoint)?;

        let ipc_server = {
            let state = Arc::clone(&self.state);
            let history = Arc::clone(&self.history);
            let endpoint = self.endpoint.clone();
            let started_at = self.started_at;
            IpcServer::bind(&ipc_socket_path, move || {
                statefile::build_snapshot(&endpoint, process::id(), started_at, Utc::now(), &state, &history)
            })?
        };

        let result = self.event_loop(&shutdown_flag, &state_file_path);

        info!("shutting down");
        self.session.stop_health_monitor();
        ipc_server.shutdown();
        self.shutdown_all_forwards();
        statefile::remove_if_present(&state_file_path);
        self.session.close();

        result
    }

    /// Enumerate currently-running containers and seed `desired` from
    /// their published ports, skipping test-infrastructure-labeled
    /// containers (spec.md 4.7 startup sync).
    fn sync_from_running_containers(&self) -> anyhow::Result<()> {
        let output = std::process::Command::new("ssh")
            .arg("-S")
            .arg(self.session.control_path())
            .arg("-p")
            .arg(self.endpoint.port.to_string())
            .arg(format!("{}@{}", self.endpoint.user, self.endpoint.host))
            .arg(crate::remote_cmd::shell_wrap(&crate::remote_cmd::enumerate_running_with_labels_inner()))
            .output()?;
        if !output.status.success() {
            warn!("startup container enumeration failed, continuing with empty desired state");
            return Ok(());
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        for line in stdout.lines() {
            let Some((id, labels)) = line.split_once('\t') else { continue };
            if labels.contains(consts::TEST_INFRA_LABEL) {
                continue;
            }
            if let Ok(ports) = inspector::inspect_published_ports(
                &self.endpoint,
                self.session.control_path(),
                id,
                self.config.enable_label_ports,
            ) {
                if !ports.is_empty() {
                    self.state.set_desired(id, ports);
                }
            }
        }
        let actions = reconciler::diff(&self.state, ReconcilePass::Normal);
        reconciler::apply(
            self.session.as_ref(),
            &self.state,
            &self.history,
            &actions,
            Utc::now(),
            &self.backoff_params(),
            thread::sleep,
        );
        Ok(())
    }

    fn shutdown_all_forwards(&self) {
        for container in self.state.get_all_containers() {
            self.state.set_desired(&container, BTreeSet::new());
        }
        let actions = reconciler::diff(&self.state, ReconcilePass::Shutdown);
        reconciler::apply(
            self.session.as_ref(),
            &self.state,
            &self.history,
            &actions,
            Utc::now(),
            &self.backoff_params(),
            thread::sleep,
        );
    }

    /// Drive the event stream until shutdown, transparently restarting
    /// it with backoff if it dies (spec.md 4.7). Gives up and returns an
    /// error only after `SESSION_RETRY_MAX_ATTEMPTS` consecutive restarts.
    fn event_loop(&self, shutdown_flag: &Arc<AtomicBool>, state_file_path: &std::path::Path) -> anyhow::Result<()> {
        let mut attempt = 0u32;
        loop {
            match self.run_event_stream_once(shutdown_flag, state_file_path)? {
                LoopExit::Shutdown => return Ok(()),
                LoopExit::StreamDied(reason) => {
                    attempt += 1;
                    if attempt >= consts::SESSION_RETRY_MAX_ATTEMPTS {
                        return Err(anyhow::anyhow!(
                            "event stream restart budget exhausted after {} attempts: {}",
                            attempt,
                            reason
                        ));
                    }
                    let delay = session_retry_delay(attempt - 1);
                    warn!(attempt, delay_ms = delay.as_millis() as u64, "restarting event stream after backoff");
                    thread::sleep(delay);
                }
            }
        }
    }

    /// Probe-then-start: before spawning the event stream, make sure the
    /// control channel is actually alive and rebuild it if not (spec.md
    /// 4.7). A failed probe is reported through the same `StreamDied`
    /// path as a dead stream, so the caller's single backoff/attempt
    /// budget covers both.
    fn run_event_stream_once(
        &self,
        shutdown_flag: &Arc<AtomicBool>,
        state_file_path: &std::path::Path,
    ) -> anyhow::Result<LoopExit> {
        if let Err(e) = self.session.ensure_alive() {
            return Ok(LoopExit::StreamDied(format!("control channel unhealthy: {}", e)));
        }
        let (events_rx, stream_end_rx) = events::spawn(&self.endpoint, self.session.control_path())?;
        let debounce = Duration::from_millis(self.config.debounce_ms);
        let watchdog_tick = tick(consts::WATCHDOG_TICK_INTERVAL);
        let state_file_tick = tick(consts::STATE_FILE_WRITE_INTERVAL);
        let mut watchdog = Watchdog::with_params(
            Instant::now(),
            WatchdogParams {
                ping_after: Duration::from_secs(self.config.watchdog_ping_after_secs),
                fatal_after: Duration::from_secs(self.config.watchdog_fatal_after_secs),
            },
        );
        let mut pending: BTreeMap<String, EventKind> = BTreeMap::new();
        let mut debounce_deadline: Option<Instant> = None;

        loop {
            if shutdown_flag.load(std::sync::atomic::Ordering::Relaxed) {
                return Ok(LoopExit::Shutdown);
            }

            let timeout = debounce_deadline
                .map(|d| d.saturating_duration_since(Instant::now()))
                .unwrap_or(Duration::from_secs(3600));

            select! {
                recv(events_rx) -> msg => {
                    if let Ok(event) = msg {
                        watchdog.note_event(Instant::now());
                        // last event for a container within one debounce
                        // window wins, matching the reconciler's own
                        // last-event-wins semantics.
                        pending.insert(event.container_id, event.kind);
                        debounce_deadline.get_or_insert(Instant::now() + debounce);
                    }
                }
                recv(stream_end_rx) -> msg => {
                    if let Ok(ended) = msg {
                        error!(reason = %ended.reason, stderr_tail = ?ended.stderr_tail, "event stream ended, restarting");
                        return Ok(LoopExit::StreamDied(ended.reason));
                    }
                }
                recv(watchdog_tick) -> _ => {
                    match watchdog.tick(Instant::now()) {
                        WatchdogAction::None => {}
                        WatchdogAction::Ping => self.ping_remote(),
                        WatchdogAction::Fatal => {
                            error!("event stream appears dead, restarting");
                            return Ok(LoopExit::StreamDied("watchdog fatal timeout".to_string()));
                        }
                    }
                }
                recv(state_file_tick) -> _ => {
                    let snapshot = statefile::build_snapshot(
                        &self.endpoint, process::id(), self.started_at, Utc::now(), &self.state, &self.history,
                    );
                    if let Err(e) = statefile::write_atomically(state_file_path, &snapshot) {
                        warn!(error = %e, "failed to write state file");
                    }
                }
                default(timeout) => {}
            }

            if let Some(deadline) = debounce_deadline {
                if Instant::now() >= deadline && !pending.is_empty() {
                    self.reconcile_containers(&pending);
                    pending.clear();
                    debounce_deadline = None;
                }
            }
        }
    }

    /// Converge desired state for every container that fired an event in
    /// this debounce window (spec.md 4.7). `die`/`stop` unconditionally
    /// clear the container's desired ports -- no inspect round-trip, so a
    /// transient SSH hiccup can never leave a dead container's forwards
    /// stuck in place. `start` looks up the container's current published
    /// ports.
    fn reconcile_containers(&self, containers: &BTreeMap<String, EventKind>) {
        for (container_id, kind) in containers {
            match kind {
                EventKind::Die | EventKind::Stop => {
                    self.state.set_desired(container_id, BTreeSet::new());
                }
                EventKind::Start => match inspector::inspect_published_ports(
                    &self.endpoint,
                    self.session.control_path(),
                    container_id,
                    self.config.enable_label_ports,
                ) {
                    Ok(ports) => self.state.set_desired(container_id, ports),
                    Err(inspector::InspectError::NotFound) => {
                        self.state.set_desired(container_id, BTreeSet::new())
                    }
                    Err(e) => warn!(container_id, error = %e, "inspect failed, leaving desired state unchanged"),
                },
            }
        }
        let actions = reconciler::diff(&self.state, ReconcilePass::Normal);
        reconciler::apply(
            self.session.as_ref(),
            &self.state,
            &self.history,
            &actions,
            Utc::now(),
            &self.backoff_params(),
            thread::sleep,
        );
    }

    fn ping_remote(&self) {
        let name = format!("{}{}", consts::PING_CONTAINER_PREFIX, process::id());
        let output = std::process::Command::new("ssh")
            .arg("-S")
            .arg(self.session.control_path())
            .arg("-p")
            .arg(self.endpoint.port.to_string())
            .arg(format!("{}@{}", self.endpoint.user, self.endpoint.host))
            .arg(crate::remote_cmd::shell_wrap(&crate::remote_cmd::watchdog_ping_inner(&name)))
            .output();
        if let Err(e) = output {
            warn!(error = %e, "watchdog ping failed to spawn");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_retry_delay_grows_exponentially_and_caps() {
        assert_eq!(session_retry_delay(0), Duration::from_secs(1));
        assert_eq!(session_retry_delay(1), Duration::from_secs(2));
        assert_eq!(session_retry_delay(10), Duration::from_secs(30));
    }
}
