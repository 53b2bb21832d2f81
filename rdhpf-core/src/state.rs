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

//! The in-memory desired/actual state (spec.md 3, 4.4): a per-container
//! desired port set and a per-(container, port) actual `ForwardState`.
//! Every public method takes the internal mutex; readers return copies
//! so callers never observe a torn snapshot.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use rdhpf_protocol::ForwardStatus;
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardState {
    pub status: ForwardStatus,
    pub reason: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    desired: HashMap<String, BTreeSet<u16>>,
    actual: HashMap<(String, u16), ForwardState>,
}

/// Concurrency-safe desired/actual state, shared by the manager, the
/// reconciler, the state-file writer, and the IPC server.
#[derive(Default)]
pub struct State {
    inner: Mutex<Inner>,
}

impl State {
    pub fn new() -> Self {
        State::default()
    }

    /// Replace `container_id`'s desired port set wholesale. An empty set
    /// is how callers signal "this container wants nothing forwarded
    /// anymore" (spec.md 3 DesiredSet).
    pub fn set_desired(&self, container_id: &str, ports: BTreeSet<u16>) {
        let mut inner = self.inner.lock().unwrap();
        if ports.is_empty() {
            inner.desired.remove(container_id);
        } else {
            inner.desired.insert(container_id.to_string(), ports);
        }
    }

    /// Upsert the actual forward state for `(container_id, port)`.
    /// Preserves `created_at` across updates to an existing entry;
    /// `updated_at` always advances to `now`.
    pub fn set_actual(
        &self,
        container_id: &str,
        port: u16,
        status: ForwardStatus,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) {
        let mut inner = self.inner.lock().unwrap();
        let key = (container_id.to_string(), port);
        let created_at = inner.actual.get(&key).map(|f| f.created_at).unwrap_or(now);
        inner.actual.insert(
            key,
            ForwardState { status, reason: reason.into(), created_at, updated_at: now },
        );
    }

    pub fn mark_active(&self, container_id: &str, port: u16, now: DateTime<Utc>) {
        self.set_actual(container_id, port, ForwardStatus::Active, "", now);
    }

    pub fn mark_pending(&self, container_id: &str, port: u16, reason: impl Into<String>, now: DateTime<Utc>) {
        self.set_actual(container_id, port, ForwardStatus::Pending, reason, now);
    }

    pub fn mark_conflict(&self, container_id: &str, port: u16, reason: impl Into<String>, now: DateTime<Utc>) {
        self.set_actual(container_id, port, ForwardStatus::Conflict, reason, now);
    }

    /// Remove the actual entry for a single (container, port), returning
    /// it if it existed (the reconciler needs the prior state to build a
    /// history entry).
    pub fn clear_port(&self, container_id: &str, port: u16) -> Option<ForwardState> {
        let mut inner = self.inner.lock().unwrap();
        inner.actual.remove(&(container_id.to_string(), port))
    }

    pub fn get_desired(&self) -> HashMap<String, BTreeSet<u16>> {
        self.inner.lock().unwrap().desired.clone()
    }

    pub fn get_actual(&self) -> HashMap<(String, u16), ForwardState> {
        self.inner.lock().unwrap().actual.clone()
    }

    pub fn get_by_container(&self, container_id: &str) -> Vec<(u16, ForwardState)> {
        self.inner
            .lock()
            .unwrap()
            .actual
            .iter()
            .filter(|((c, _), _)| c == container_id)
            .map(|((_, p), f)| (*p, f.clone()))
            .collect()
    }

    pub fn get_all_containers(&self) -> BTreeSet<String> {
        let inner = self.inner.lock().unwrap();
        inner
            .desired
            .keys()
            .cloned()
            .chain(inner.actual.keys().map(|(c, _)| c.clone()))
            .collect()
    }
}
