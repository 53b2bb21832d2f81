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

//! Construction of the `ssh` invocations every component reuses the
//! multiplexed control channel through (spec.md 4, 6, Design Notes).
//!
//! Every remote command is wrapped in a single `sh -c '<inner>'` argument
//! so neither the local shell (there isn't one; we never go through
//! `sh -c` locally) nor the remote shell gets a chance to expand a
//! template literal like `{{.State}}` before the remote daemon sees it.
//! The inner command is built as a single `String` and passed as one
//! `Command` argument -- it is never split on whitespace or otherwise
//! re-tokenized, so embedded quoting survives exec.

use std::{path::Path, process::Command};

use crate::endpoint::RemoteEndpoint;

/// Wrap `inner` (a fully-formed remote shell command, already using
/// single-quoted template literals where needed) as the one argument
/// `sh -c '<inner>'`, with `inner`'s own single quotes escaped so the
/// remote shell can't break out of the wrapper.
pub fn shell_wrap(inner: &str) -> String {
    format!("sh -c {}", shell_single_quote(inner))
}

/// POSIX single-quote a string for use as one shell word: wrap in `'...'`
/// and replace any embedded `'` with `'"'"'` (close quote, literal quote,
/// reopen quote).
pub fn shell_single_quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        if c == '\'' {
            out.push_str("'\"'\"'");
        } else {
            out.push(c);
        }
    }
    out.push('\'');
    out
}

/// Build a `Command` that runs `remote_inner` on `endpoint` over the
/// multiplexed control channel at `control_path`. The whole remote
/// command is passed to `ssh` as a single trailing argument, not split
/// across multiple argv entries, which is what lets `remote_inner`
/// safely contain its own quoting.
pub fn ssh_command(endpoint: &RemoteEndpoint, control_path: &Path, remote_inner: &str) -> Command {
    let mut cmd = Command::new("ssh");
    cmd.arg("-S")
        .arg(control_path)
        .arg("-p")
        .arg(endpoint.port.to_string())
        .arg(format!("{}@{}", endpoint.user, endpoint.host))
        .arg(shell_wrap(remote_inner));
    cmd
}

/// The ControlMaster-opening invocation (spec.md 4.1 Open): background,
/// multiplexed, with keep-alives configured per spec.
pub fn ssh_control_master_command(endpoint: &RemoteEndpoint, control_path: &Path) -> Command {
    let mut cmd = Command::new("ssh");
    cmd.arg("-M")
        .arg("-N")
        .arg("-f")
        .arg("-o")
        .arg("ControlPersist=yes")
        .arg("-o")
        .arg(format!("ServerAliveInterval={}", crate::consts::SSH_KEEPALIVE_INTERVAL_SECS))
        .arg("-o")
        .arg(format!("ServerAliveCountMax={}", crate::consts::SSH_KEEPALIVE_COUNT_MAX))
        .arg("-o")
        .arg("TCPKeepAlive=yes")
        .arg("-S")
        .arg(control_path)
        .arg("-p")
        .arg(endpoint.port.to_string())
        .arg(format!("{}@{}", endpoint.user, endpoint.host));
    cmd
}

/// `ssh -S <control_path> -O check` style control command, used both for
/// health probes and for graceful exit / cancel-forward requests.
pub fn ssh_control_command(
    endpoint: &RemoteEndpoint,
    control_path: &Path,
    control_op: &str,
) -> Command {
    let mut cmd = Command::new("ssh");
    cmd.arg("-S")
        .arg(control_path)
        .arg("-O")
        .arg(control_op)
        .arg("-p")
        .arg(endpoint.port.to_string())
        .arg(format!("{}@{}", endpoint.user, endpoint.host));
    cmd
}

/// Remote command that streams container lifecycle events (start/die/
/// stop) as newline-delimited JSON (spec.md 4.2). Filtered to exactly
/// those event types so the reader never has to filter non-container
/// noise out of the stream itself.
pub fn event_stream_inner() -> String {
    "docker events --format '{{json .}}' \
     --filter 'type=container' \
     --filter 'event=start' \
     --filter 'event=die' \
     --filter 'event=stop'"
        .to_string()
}

/// One-shot remote command returning a container's port bindings as
/// JSON (spec.md 4.3).
pub fn inspect_ports_inner(container_id: &str) -> String {
    format!(
        "docker inspect --format '{{{{json .NetworkSettings.Ports}}}}' {}",
        shell_single_quote(container_id)
    )
}

/// One-shot remote command returning a container's labels as JSON, used
/// by the opt-in label-port fallback (spec.md 4.3).
pub fn inspect_labels_inner(container_id: &str) -> String {
    format!(
        "docker inspect --format '{{{{json .Config.Labels}}}}' {}",
        shell_single_quote(container_id)
    )
}

/// Enumerate running container IDs, for startup reconciliation
/// (spec.md 4.7).
pub fn enumerate_running_inner() -> String {
    "docker ps --format '{{.ID}}'".to_string()
}

/// Enumerate running container IDs together with their labels, so
/// startup reconciliation can skip test-infrastructure-tagged
/// containers without a round trip per container (spec.md 4.7).
pub fn enumerate_running_with_labels_inner() -> String {
    "docker ps --format '{{.ID}}\\t{{.Labels}}'".to_string()
}

/// Health probe: a cheap daemon-version query used both for startup
/// diagnostics and as the session health check body (spec.md 4.1, 6).
pub fn daemon_version_inner() -> String {
    "docker version --format '{{.Server.Version}}'".to_string()
}

/// Request that the existing ControlMaster add a local-to-remote
/// loopback forward (spec.md 4.6 AddForward). No remote command is
/// executed; this only asks the already-authenticated master to bind
/// a new listener.
pub fn ssh_forward_command(
    endpoint: &RemoteEndpoint,
    control_path: &Path,
    local_port: u16,
    remote_port: u16,
) -> Command {
    let mut cmd = Command::new("ssh");
    cmd.arg("-S")
        .arg(control_path)
        .arg("-O")
        .arg("forward")
        .arg("-L")
        .arg(format!("127.0.0.1:{}:127.0.0.1:{}", local_port, remote_port))
        .arg("-p")
        .arg(endpoint.port.to_string())
        .arg(format!("{}@{}", endpoint.user, endpoint.host));
    cmd
}

/// Request that the existing ControlMaster cancel a previously
/// established forward (spec.md 4.6 CancelForward).
pub fn ssh_cancel_forward_command(
    endpoint: &RemoteEndpoint,
    control_path: &Path,
    local_port: u16,
    remote_port: u16,
) -> Command {
    let mut cmd = Command::new("ssh");
    cmd.arg("-S")
        .arg(control_path)
        .arg("-O")
        .arg("cancel")
        .arg("-L")
        .arg(format!("127.0.0.1:{}:127.0.0.1:{}", local_port, remote_port))
        .arg("-p")
        .arg(endpoint.port.to_string())
        .arg(format!("{}@{}", endpoint.user, endpoint.host));
    cmd
}

/// Start a throwaway, self-removing container that will emit a
/// start/die pair on the event stream, used by the watchdog ping
/// (spec.md 4.7, Design Notes).
pub fn watchdog_ping_inner(name: &str) -> String {
    format!(
        "docker run --rm --name {} --label {}=true busybox true",
        shell_single_quote(name),
        crate::consts::TEST_INFRA_LABEL,
    )
}
