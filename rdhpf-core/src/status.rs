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

//! The `rdhpf status` reader (spec.md 4.9, 6): prefers the live IPC
//! socket, falls back to the last-written state file if the daemon
//! isn't reachable, and tells the operator which source it used.

use std::path::Path;

use chrono::Utc;
use rdhpf_protocol::{Client, Snapshot};

use crate::{endpoint::RemoteEndpoint, statefile};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// Read live off the running daemon's IPC socket.
    Ipc,
    /// The daemon wasn't reachable; this is its last persisted snapshot.
    StateFile,
}

pub struct StatusReport {
    pub source: Source,
    pub snapshot: Snapshot,
    pub stale: bool,
}

/// Resolve the endpoint's state directory and read its current status,
/// trying IPC first and falling back to the state file (spec.md 4.9).
pub fn read_status(endpoint: &RemoteEndpoint) -> anyhow::Result<StatusReport> {
    let socket_path = statefile::ipc_socket_path(endpoint)?;
    if let Ok(report) = try_ipc(&socket_path) {
        return Ok(report);
    }
    read_state_file(endpoint)
}

fn try_ipc(socket_path: &Path) -> anyhow::Result<StatusReport> {
    let snapshot = Client::connect(socket_path)?.read_snapshot()?;
    let stale = snapshot.is_stale(Utc::now());
    Ok(StatusReport { source: Source::Ipc, snapshot, stale })
}

fn read_state_file(endpoint: &RemoteEndpoint) -> anyhow::Result<StatusReport> {
    let path = statefile::state_file_path(endpoint)?;
    let contents = std::fs::read_to_string(&path)
        .map_err(|e| anyhow::anyhow!("no running daemon and no state file at {:?}: {}", path, e))?;
    let snapshot = Snapshot::from_wire_str(&contents)?;
    let stale = snapshot.is_stale(Utc::now());
    Ok(StatusReport { source: Source::StateFile, snapshot, stale })
}

/// Render a human-readable table, most-recently-active forwards first
/// (spec.md 6 `rdhpf status`).
pub fn render_table(report: &StatusReport) -> String {
    let mut forwards = report.snapshot.forwards.clone();
    forwards.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));

    let mut out = String::new();
    match report.source {
        Source::Ipc => out.push_str(&format!("host: {} (live)\n", report.snapshot.host)),
        Source::StateFile => out.push_str(&format!(
            "host: {} (no running daemon; showing last known state)\n",
            report.snapshot.host
        )),
    }
    if report.stale {
        out.push_str(&format!(
            "warning: data may be stale, last updated {}\n",
            report.snapshot.updated_at
        ));
    }
    out.push_str("CONTAINER       PORT   STATUS    REASON\n");
    for f in &forwards {
        out.push_str(&format!(
            "{:<15} {:<6} {:<9} {}\n",
            &f.container_id[..f.container_id.len().min(12)],
            f.port,
            f.status,
            f.reason
        ));
    }
    out
}

/// Render the same report as JSON (`rdhpf status --json`, a supplemented
/// convenience not present in the CLI's plain-table output).
pub fn render_json(report: &StatusReport) -> anyhow::Result<String> {
    Ok(serde_json::to_string_pretty(&report.snapshot)?)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use rdhpf_protocol::{ForwardRecord, ForwardStatus};
    use tempfile::tempdir;

    use super::*;

    fn sample_report(source: Source, stale: bool) -> StatusReport {
        let t0 = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let t1 = Utc.timestamp_opt(1_700_000_010, 0).unwrap();
        StatusReport {
            source,
            stale,
            snapshot: Snapshot {
                version: rdhpf_protocol::CURRENT_VERSION.to_string(),
                host: "ssh://dev@build-box".to_string(),
                pid: 99,
                started_at: t0,
                updated_at: t1,
                forwards: vec![
                    ForwardRecord {
                        container_id: "aaaaaaaaaaaaaaaa".to_string(),
                        port: 5432,
                        status: ForwardStatus::Active,
                        reason: "".to_string(),
                        created_at: t0,
                        updated_at: t0,
                    },
                    ForwardRecord {
                        container_id: "bbbbbbbbbbbbbbbb".to_string(),
                        port: 8080,
                        status: ForwardStatus::Active,
                        reason: "".to_string(),
                        created_at: t0,
                        updated_at: t1,
                    },
                ],
                history: vec![],
            },
        }
    }

    #[test]
    fn table_lists_most_recently_updated_first() {
        let report = sample_report(Source::Ipc, false);
        let table = render_table(&report);
        let b_pos = table.find("bbbbbbbbbbbb").unwrap();
        let a_pos = table.find("aaaaaaaaaaaa").unwrap();
        assert!(b_pos < a_pos);
    }

    #[test]
    fn state_file_source_warns_about_no_running_daemon() {
        let report = sample_report(Source::StateFile, true);
        let table = render_table(&report);
        assert!(table.contains("no running daemon"));
        assert!(table.contains("warning: data may be stale"));
    }

    #[test]
    fn ipc_source_with_fresh_data_has_no_warning() {
        let report = sample_report(Source::Ipc, false);
        let table = render_table(&report);
        assert!(!table.contains("warning"));
    }

    #[test]
    fn json_rendering_round_trips_through_serde() {
        let report = sample_report(Source::Ipc, false);
        let json = render_json(&report).unwrap();
        let parsed: Snapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, report.snapshot);
    }

    #[test]
    fn read_state_file_computes_staleness_from_updated_at_not_source() {
        let dir = tempdir().unwrap();
        std::env::set_var("HOME", dir.path());
        let endpoint = RemoteEndpoint::parse("ssh://dev@build-box").unwrap();
        statefile::ensure_state_dir().unwrap();
        let path = statefile::state_file_path(&endpoint).unwrap();

        let mut snapshot = sample_report(Source::StateFile, true).snapshot;
        snapshot.updated_at = Utc::now();
        statefile::write_atomically(&path, &snapshot).unwrap();

        let report = read_state_file(&endpoint).unwrap();
        assert_eq!(report.source, Source::StateFile);
        assert!(!report.stale, "a freshly written state file must not be reported as stale");
    }
}
