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

//! The state file writer (spec.md 4.9): periodically renders the current
//! [`State`]/[`History`] into a [`Snapshot`] and persists it atomically,
//! so a status reader never observes a half-written document.

use std::{
    fs, io::Write as _,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use rdhpf_protocol::{ForwardRecord, HistoryRecord, Snapshot};
use tracing::warn;

use crate::{consts, endpoint::RemoteEndpoint, history::History, state::State};

pub fn state_dir() -> anyhow::Result<PathBuf> {
    let home = dirs_home()?;
    Ok(home.join(consts::RDHPF_DIR_NAME))
}

/// Minimal `$HOME` lookup in the teacher's style: read the env var
/// directly rather than pull in a whole crate for it.
fn dirs_home() -> anyhow::Result<PathBuf> {
    std::env::var("HOME").map(PathBuf::from).map_err(|_| anyhow::anyhow!("HOME is not set"))
}

/// Ensure `~/.rdhpf` exists with `0700` permissions (spec.md 6).
pub fn ensure_state_dir() -> anyhow::Result<PathBuf> {
    let dir = state_dir()?;
    fs::create_dir_all(&dir)?;
    fs::set_permissions(&dir, fs::Permissions::from_mode(0o700))?;
    Ok(dir)
}

pub fn state_file_path(endpoint: &RemoteEndpoint) -> anyhow::Result<PathBuf> {
    Ok(state_dir()?.join(format!("{}.state.json", endpoint.hash())))
}

pub fn ipc_socket_path(endpoint: &RemoteEndpoint) -> anyhow::Result<PathBuf> {
    Ok(state_dir()?.join(format!("{}.sock", endpoint.hash())))
}

pub fn build_snapshot(
    endpoint: &RemoteEndpoint,
    pid: u32,
    started_at: DateTime<Utc>,
    now: DateTime<Utc>,
    state: &State,
    history: &History,
) -> Snapshot {
    let mut forwards = Vec::new();
    for ((container_id, port), fwd) in state.get_actual() {
        forwards.push(ForwardRecord {
            container_id,
            port,
            status: fwd.status,
            reason: fwd.reason,
            created_at: fwd.created_at,
            updated_at: fwd.updated_at,
        });
    }
    forwards.sort_by(|a, b| (a.container_id.clone(), a.port).cmp(&(b.container_id.clone(), b.port)));

    let history_records = history
        .get_all()
        .into_iter()
        .map(|h| HistoryRecord {
            container_id: h.container_id,
            port: h.port,
            started_at: h.started_at,
            ended_at: h.ended_at,
            end_reason: h.end_reason,
            final_status: h.final_status,
        })
        .collect();

    Snapshot {
        version: rdhpf_protocol::CURRENT_VERSION.to_string(),
        host: endpoint.to_url(),
        pid,
        started_at,
        updated_at: now,
        forwards,
        history: history_records,
    }
}

/// Write `snapshot` to `path` atomically: serialize to a temp file in
/// the same directory, then `rename` it over the destination, so a
/// reader never observes a partially-written document (spec.md 4.9).
pub fn write_atomically(path: &Path, snapshot: &Snapshot) -> anyhow::Result<()> {
    let wire = snapshot.to_wire_string()?;
    let dir = path.parent().ok_or_else(|| anyhow::anyhow!("state file path has no parent"))?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(wire.as_bytes())?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| anyhow::anyhow!("persisting state file: {}", e))?;
    Ok(())
}

pub fn remove_if_present(path: &Path) {
    if path.exists() {
        if let Err(e) = fs::remove_file(path) {
            warn!(error = %e, ?path, "failed to remove state file on shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use tempfile::tempdir;

    use super::*;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn sample_snapshot() -> Snapshot {
        Snapshot {
            version: rdhpf_protocol::CURRENT_VERSION.to_string(),
            host: "ssh://dev@build-box".to_string(),
            pid: 1234,
            started_at: t(0),
            updated_at: t(0),
            forwards: vec![],
            history: vec![],
        }
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        write_atomically(&path, &sample_snapshot()).unwrap();
        let read_back = fs::read_to_string(&path).unwrap();
        let snap = Snapshot::from_wire_str(&read_back).unwrap();
        assert_eq!(snap.pid, 1234);
    }

    #[test]
    fn a_second_write_replaces_the_first_without_interleaving() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        write_atomically(&path, &sample_snapshot()).unwrap();
        let mut second = sample_snapshot();
        second.pid = 5678;
        write_atomically(&path, &second).unwrap();
        let snap = Snapshot::from_wire_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(snap.pid, 5678);
    }

    #[test]
    fn remove_if_present_is_idempotent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        write_atomically(&path, &sample_snapshot()).unwrap();
        remove_if_present(&path);
        assert!(!path.exists());
        remove_if_present(&path); // does not panic on a missing file
    }

    #[test]
    fn state_file_path_uses_the_documented_suffix() {
        let dir = tempdir().unwrap();
        std::env::set_var("HOME", dir.path());
        let endpoint = RemoteEndpoint::parse("ssh://dev@build-box").unwrap();
        let path = state_file_path(&endpoint).unwrap();
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.ends_with(".state.json"), "expected *.state.json, got {}", name);
        assert_ne!(path, ipc_socket_path(&endpoint).unwrap());
    }

    #[test]
    fn build_snapshot_sorts_forwards_deterministically() {
        let state = State::new();
        let history = History::new();
        state.mark_active("zeta", 9000, t(0));
        state.mark_active("alpha", 8080, t(0));
        let endpoint = RemoteEndpoint::parse("ssh://dev@build-box").unwrap();
        let snap = build_snapshot(&endpoint, 1, t(0), t(1), &state, &history);
        assert_eq!(snap.forwards[0].container_id, "alpha");
        assert_eq!(snap.forwards[1].container_id, "zeta");
    }
}
