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

//! The event reader (spec.md 4.2): spawns `docker events` on the remote
//! over the multiplexed channel, parses its ndjson stream, and publishes
//! typed events on a channel for the manager to consume. Exits (and
//! reports why) the moment the child's stdout hits EOF -- restart policy
//! lives in the manager, not here.

use std::{
    io::{BufRead, BufReader},
    path::Path,
    process::{Child, Stdio},
    thread,
};

use crossbeam_channel::{unbounded, Receiver};
use serde_derive::Deserialize;
use tracing::{debug, warn};

use crate::{endpoint::RemoteEndpoint, remote_cmd};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Start,
    Die,
    Stop,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerEvent {
    pub kind: EventKind,
    pub container_id: String,
}

/// What the reader hands back when its stream ends, successfully or not.
#[derive(Debug)]
pub struct StreamEnded {
    pub reason: String,
    /// The last few lines of the child's stderr, for diagnostics
    /// (spec.md 4.2: "bounded tail of stdout/stderr on failure").
    pub stderr_tail: Vec<String>,
}

/// Raw shape of one `docker events --format '{{json .}}'` line. Only the
/// fields the reader needs are modeled; everything else is ignored by
/// serde's default "unknown fields are fine" behavior.
#[derive(Deserialize)]
struct RawEvent {
    #[serde(rename = "Type")]
    ty: String,
    #[serde(rename = "Action")]
    action: String,
    #[serde(rename = "Actor")]
    actor: RawActor,
}

#[derive(Deserialize)]
struct RawActor {
    #[serde(rename = "ID")]
    id: String,
}

const STDERR_TAIL_LINES: usize = 20;

fn parse_line(line: &str) -> Option<ContainerEvent> {
    let raw: RawEvent = match serde_json::from_str(line) {
        Ok(r) => r,
        Err(e) => {
            debug!(error = %e, line, "skipping unparseable docker events line");
            return None;
        }
    };
    if raw.ty != "container" {
        return None;
    }
    let kind = match raw.action.as_str() {
        "start" => EventKind::Start,
        "die" => EventKind::Die,
        "stop" => EventKind::Stop,
        _ => return None,
    };
    Some(ContainerEvent { kind, container_id: raw.actor.id })
}

/// Spawn the remote `docker events` stream and return a channel of
/// parsed events plus a channel that receives exactly one [`StreamEnded`]
/// when the stream terminates for any reason.
pub fn spawn(
    endpoint: &RemoteEndpoint,
    control_path: &Path,
) -> anyhow::Result<(Receiver<ContainerEvent>, Receiver<StreamEnded>)> {
    let mut child: Child = remote_cmd::ssh_command(endpoint, control_path, &remote_cmd::event_stream_inner())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let stdout = child.stdout.take().expect("stdout was piped");
    let stderr = child.stderr.take().expect("stderr was piped");

    let (event_tx, event_rx) = unbounded();
    let (end_tx, end_rx) = unbounded();

    let stderr_tail = std::sync::Arc::new(std::sync::Mutex::new(std::collections::VecDeque::with_capacity(
        STDERR_TAIL_LINES,
    )));
    let tail_for_reader = std::sync::Arc::clone(&stderr_tail);
    thread::spawn(move || {
        let reader = BufReader::new(stderr);
        for line in reader.lines().map_while(Result::ok) {
            let mut tail = tail_for_reader.lock().unwrap();
            if tail.len() == STDERR_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }
    });

    thread::spawn(move || {
        let reader = BufReader::new(stdout);
        for line in reader.lines().map_while(Result::ok) {
            if let Some(event) = parse_line(&line) {
                debug!(container_id = %event.container_id, kind = ?event.kind, "docker event");
                if event_tx.send(event).is_err() {
                    break;
                }
            }
        }
        let status = child.wait();
        let reason = match status {
            Ok(s) if s.success() => "event stream closed stdout (ssh exited cleanly)".to_string(),
            Ok(s) => format!("event stream ssh process exited with {}", s),
            Err(e) => format!("event stream ssh process wait failed: {}", e),
        };
        warn!(reason = %reason, "docker events stream ended");
        let _ = end_tx.send(StreamEnded {
            reason,
            stderr_tail: stderr_tail.lock().unwrap().iter().cloned().collect(),
        });
    });

    Ok((event_rx, end_rx))
}
