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

//! Wire schema shared by the `rdhpf` daemon and its status reader.
//!
//! The daemon writes this schema to a per-host state file and serves it,
//! byte for byte, over a per-host IPC socket: one JSON document per
//! connection, then EOF. Nothing in this crate talks to a socket or a
//! filesystem path directly except [`Client`], which is a thin
//! convenience wrapper for the IPC side.

use std::{fmt, io::Read, os::unix::net::UnixStream, path::Path, time::Duration};

use anyhow::Context;
use serde_derive::{Deserialize, Serialize};

/// The state file / IPC schema version this crate writes.
///
/// Bump only for breaking schema changes. Readers must refuse to parse a
/// document whose major component is newer than they understand (see
/// [`Snapshot::is_supported_version`]).
pub const CURRENT_VERSION: &str = "2.0";

/// Versions this crate knows how to read, oldest first.
pub const SUPPORTED_VERSIONS: &[&str] = &["1.0", "2.0"];

/// How stale `updated_at` may get before a status reader must warn the
/// operator that it's looking at old data.
pub const STALE_AFTER: Duration = Duration::from_secs(10);

/// The status of a single (container, port) forward, mirroring
/// `ForwardState.status` in the core data model.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ForwardStatus {
    /// The local listener is bound and tunneling to the remote.
    Active,
    /// An add or cancel attempt is outstanding or failed non-retryably.
    Pending,
    /// Retries against a local bind conflict were exhausted.
    Conflict,
}

impl fmt::Display for ForwardStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ForwardStatus::Active => "active",
            ForwardStatus::Pending => "pending",
            ForwardStatus::Conflict => "conflict",
        };
        write!(f, "{}", s)
    }
}

/// One entry of `forwards[]` in the wire schema.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ForwardRecord {
    pub container_id: String,
    pub port: u16,
    pub status: ForwardStatus,
    pub reason: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

/// The final status a forward held when it was removed, recorded so
/// history can answer "did this ever come up" distinctly from "why did
/// it go away".
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FinalStatus {
    Active,
    Pending,
    Conflict,
}

impl From<ForwardStatus> for FinalStatus {
    fn from(s: ForwardStatus) -> Self {
        match s {
            ForwardStatus::Active => FinalStatus::Active,
            ForwardStatus::Pending => FinalStatus::Pending,
            ForwardStatus::Conflict => FinalStatus::Conflict,
        }
    }
}

impl fmt::Display for FinalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FinalStatus::Active => "active",
            FinalStatus::Pending => "pending",
            FinalStatus::Conflict => "conflict",
        };
        write!(f, "{}", s)
    }
}

/// One entry of `history[]` in the wire schema.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct HistoryRecord {
    pub container_id: String,
    pub port: u16,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub ended_at: chrono::DateTime<chrono::Utc>,
    pub end_reason: String,
    pub final_status: FinalStatus,
}

/// The full document written to the state file and served over IPC.
///
/// `pid` and `started_at` are present in the state file and also sent
/// over IPC (spec.md notes they're "semantically identical", not that
/// IPC omits them, so this crate serializes one shape for both
/// transports and lets callers that don't care ignore the fields).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub version: String,
    pub host: String,
    pub pid: u32,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    pub forwards: Vec<ForwardRecord>,
    pub history: Vec<HistoryRecord>,
}

impl Snapshot {
    pub fn is_supported_version(version: &str) -> bool {
        SUPPORTED_VERSIONS.contains(&version)
    }

    /// Serialize as the newline-terminated JSON document the wire format
    /// specifies.
    pub fn to_wire_string(&self) -> anyhow::Result<String> {
        let mut s = serde_json::to_string(self).context("serializing snapshot")?;
        s.push('\n');
        Ok(s)
    }

    pub fn from_wire_str(s: &str) -> anyhow::Result<Self> {
        let snap: Snapshot =
            serde_json::from_str(s.trim_end()).context("parsing snapshot document")?;
        if !Snapshot::is_supported_version(&snap.version) {
            anyhow::bail!(
                "state document version '{}' is newer than this build understands \
                 (supports {:?})",
                snap.version,
                SUPPORTED_VERSIONS,
            );
        }
        Ok(snap)
    }

    /// Whether `updated_at` is old enough that a consumer should warn the
    /// operator it might be looking at stale data.
    pub fn is_stale(&self, now: chrono::DateTime<chrono::Utc>) -> bool {
        match (now - self.updated_at).to_std() {
            Ok(age) => age > STALE_AFTER,
            // updated_at is in the future (clock skew): treat as fresh.
            Err(_) => false,
        }
    }
}

/// A client for the IPC side of the wire protocol: connect, read exactly
/// one document, done. There is no request framing to write -- connecting
/// at all is the request.
pub struct Client {
    stream: UnixStream,
}

impl Client {
    pub fn connect(socket: &Path) -> anyhow::Result<Self> {
        let stream = UnixStream::connect(socket)
            .with_context(|| format!("connecting to rdhpf ipc socket at {:?}", socket))?;
        Ok(Client { stream })
    }

    /// Read the single JSON snapshot the daemon writes, then the
    /// connection is expected to hit EOF.
    pub fn read_snapshot(mut self) -> anyhow::Result<Snapshot> {
        let mut buf = String::new();
        self.stream.read_to_string(&mut buf).context("reading ipc snapshot")?;
        Snapshot::from_wire_str(&buf)
    }
}
