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

//! The desired/actual reconciler (spec.md 4.5): computes a minimal,
//! idempotent plan from [`crate::state::State`] alone (never from
//! in-flight flags) and applies it through a [`ForwardBackend`].

use std::{collections::HashMap, time::Duration};

use chrono::{DateTime, Utc};
use rdhpf_protocol::ForwardStatus;
use tracing::warn;

use crate::{
    forward::{add_forward_with_backoff, BackoffParams, ForwardBackend, ForwardError},
    history::{History, HistoryEntry},
    state::State,
    util::short_id,
};

/// Which default applies to a remove action that isn't a port hand-off
/// or a lingering conflict: what context is this reconcile pass running
/// in (spec.md 4.5, 4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcilePass {
    /// A normal pass driven by start/die/stop events or startup sync.
    Normal,
    /// G noticed during a startup/resync sweep that a container vanished
    /// from `docker ps` without ever producing a die/stop event.
    ContainerVanished,
    /// The final pass of graceful shutdown (spec.md 4.8).
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoveReason {
    ContainerStopped,
    ContainerRemoved,
    RdhpfShutdown,
    PortConflict,
    PortClaimedBy(String),
}

impl RemoveReason {
    pub fn describe(&self) -> String {
        match self {
            RemoveReason::ContainerStopped => "container stopped".to_string(),
            RemoveReason::ContainerRemoved => "container removed".to_string(),
            RemoveReason::RdhpfShutdown => "rdhpf shutdown".to_string(),
            RemoveReason::PortConflict => "port conflict".to_string(),
            RemoveReason::PortClaimedBy(c) => format!("port claimed by {}", short_id(c)),
        }
    }

    fn default_for(pass: ReconcilePass) -> RemoveReason {
        match pass {
            ReconcilePass::Normal => RemoveReason::ContainerStopped,
            ReconcilePass::ContainerVanished => RemoveReason::ContainerRemoved,
            ReconcilePass::Shutdown => RemoveReason::RdhpfShutdown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Add { container_id: String, port: u16 },
    Remove { container_id: String, port: u16, reason: RemoveReason },
}

/// Compute the action list to converge actual toward desired
/// (spec.md 4.5). `remove` actions always precede `add` actions.
pub fn diff(state: &State, pass: ReconcilePass) -> Vec<Action> {
    let desired = state.get_desired();
    let actual = state.get_actual();

    let mut owner: HashMap<u16, String> = HashMap::new();
    for (container_id, ports) in &desired {
        for port in ports {
            owner.insert(*port, container_id.clone());
        }
    }

    let default_reason = RemoveReason::default_for(pass);

    let mut removes = Vec::new();
    for ((container_id, port), fwd) in &actual {
        let still_desired = desired.get(container_id).map(|s| s.contains(port)).unwrap_or(false);
        if still_desired {
            continue;
        }
        let reason = match owner.get(port) {
            Some(new_owner) if new_owner != container_id => {
                RemoveReason::PortClaimedBy(new_owner.clone())
            }
            _ if fwd.status == ForwardStatus::Conflict => RemoveReason::PortConflict,
            _ => default_reason.clone(),
        };
        removes.push(Action::Remove { container_id: container_id.clone(), port: *port, reason });
    }
    // deterministic order makes the "two consecutive diffs agree" test
    // meaningful and makes logs easier to read.
    removes.sort_by(|a, b| action_sort_key(a).cmp(&action_sort_key(b)));

    let mut adds = Vec::new();
    for (container_id, ports) in &desired {
        for port in ports {
            let key = (container_id.clone(), *port);
            let is_active =
                actual.get(&key).map(|f| f.status == ForwardStatus::Active).unwrap_or(false);
            if !is_active {
                adds.push(Action::Add { container_id: container_id.clone(), port: *port });
            }
        }
    }
    adds.sort_by(|a, b| action_sort_key(a).cmp(&action_sort_key(b)));

    removes.into_iter().chain(adds).collect()
}

fn action_sort_key(a: &Action) -> (String, u16) {
    match a {
        Action::Add { container_id, port } => (container_id.clone(), *port),
        Action::Remove { container_id, port, .. } => (container_id.clone(), *port),
    }
}

/// Apply a previously computed action list, mirroring every outcome
/// back into `state` and appending a [`HistoryEntry`] for every forward
/// that gets removed (spec.md 4.5).
pub fn apply<B: ForwardBackend + ?Sized>(
    backend: &B,
    state: &State,
    history: &History,
    actions: &[Action],
    now: DateTime<Utc>,
    backoff: &BackoffParams,
    sleep: impl Fn(Duration) + Copy,
) {
    for action in actions {
        match action {
            Action::Remove { container_id, port, reason } => {
                if let Err(e) = backend.cancel_forward(*port) {
                    // TIME_WAIT on the local socket is expected; either
                    // way the next diff will re-converge from current
                    // state, so this is never fatal to the pass.
                    warn!(container_id = %container_id, port, error = %e, "cancel forward failed, proceeding anyway");
                }
                if let Some(prior) = state.clear_port(container_id, *port) {
                    history.add(
                        HistoryEntry {
                            container_id: container_id.clone(),
                            port: *port,
                            started_at: prior.created_at,
                            ended_at: now,
                            end_reason: reason.describe(),
                            final_status: prior.status.into(),
                        },
                        now,
                    );
                }
            }
            Action::Add { container_id, port } => {
                match add_forward_with_backoff(backend, *port, backoff, sleep) {
                    Ok(()) => state.mark_active(container_id, *port, now),
                    Err((ForwardError::BindConflict(_), attempts)) => {
                        state.mark_conflict(
                            container_id,
                            *port,
                            format!("port {} already in use after {} attempts", port, attempts),
                            now,
                        );
                    }
                    Err((ForwardError::Other(msg), _)) => {
                        state.mark_pending(container_id, *port, msg, now);
                    }
                }
            }
        }
    }
}
