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

//! The inspector (spec.md 4.3): given a container ID, asks the remote
//! for its published ports, with an opt-in fallback to a label
//! (`rdhpf.port=<n>` or `rdhpf.port=<n>,<n>,...`) for containers that
//! don't publish ports through the normal Docker mechanism.

use std::{collections::BTreeSet, env, path::Path};

use tracing::debug;

use crate::{consts, endpoint::RemoteEndpoint, remote_cmd};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InspectError {
    /// `docker inspect` reported the container doesn't exist -- a
    /// container that died between the event firing and the inspect
    /// running. Not an error the caller should retry or alarm on.
    NotFound,
    Other(String),
}

impl std::fmt::Display for InspectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InspectError::NotFound => write!(f, "container not found"),
            InspectError::Other(s) => write!(f, "{}", s),
        }
    }
}

impl std::error::Error for InspectError {}

/// Shape of `docker inspect --format '{{json .NetworkSettings.Ports}}'`:
/// a map from `"<port>/tcp"` to either `null` (not published) or a list
/// of host bindings.
type PortsMap = std::collections::HashMap<String, Option<Vec<serde_json::Value>>>;

fn classify_stderr(stderr: &str) -> InspectError {
    let lower = stderr.to_lowercase();
    if lower.contains("no such object") || lower.contains("no such container") {
        InspectError::NotFound
    } else {
        InspectError::Other(stderr.trim().to_string())
    }
}

/// Parse the `NetworkSettings.Ports` JSON into the set of published
/// container ports (spec.md 4.3: only bound, published ports count).
fn parse_published_ports(json: &str) -> BTreeSet<u16> {
    let map: PortsMap = match serde_json::from_str(json.trim()) {
        Ok(m) => m,
        Err(_) => return BTreeSet::new(),
    };
    map.into_iter()
        .filter(|(_, bindings)| bindings.as_ref().is_some_and(|b| !b.is_empty()))
        .filter_map(|(key, _)| key.split('/').next().and_then(|p| p.parse::<u16>().ok()))
        .collect()
}

/// Parse a `rdhpf.port` label value: a single port or a comma-separated
/// list (spec.md 4.3 label-port fallback).
fn parse_label_ports(value: &str) -> BTreeSet<u16> {
    value.split(',').filter_map(|p| p.trim().parse::<u16>().ok()).collect()
}

/// Whether the label-port fallback is enabled: `RDHPF_ENABLE_LABEL_PORTS`
/// is an explicit override of `config.enable_label_ports` when set
/// (spec.md 6, 13), so an operator can flip this on for one invocation
/// without editing their config file.
fn label_ports_enabled(config_enabled: bool) -> bool {
    env::var(consts::ENABLE_LABEL_PORTS_VAR)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(config_enabled)
}

/// Run `docker inspect` over the multiplexed channel and return the
/// container's published ports, falling back to the `rdhpf.port` label
/// when `enable_label_ports` (or its `RDHPF_ENABLE_LABEL_PORTS` override)
/// is set (spec.md 4.3, 6, 13).
pub fn inspect_published_ports(
    endpoint: &RemoteEndpoint,
    control_path: &Path,
    container_id: &str,
    enable_label_ports: bool,
) -> Result<BTreeSet<u16>, InspectError> {
    let output = remote_cmd::ssh_command(endpoint, control_path, &remote_cmd::inspect_ports_inner(container_id))
        .output()
        .map_err(|e| InspectError::Other(format!("spawning docker inspect: {}", e)))?;
    if !output.status.success() {
        return Err(classify_stderr(&String::from_utf8_lossy(&output.stderr)));
    }
    let ports = parse_published_ports(&String::from_utf8_lossy(&output.stdout));
    if !ports.is_empty() || !label_ports_enabled(enable_label_ports) {
        return Ok(ports);
    }

    debug!(container_id, "no published ports, falling back to rdhpf.port label");
    let label_output =
        remote_cmd::ssh_command(endpoint, control_path, &remote_cmd::inspect_labels_inner(container_id))
            .output()
            .map_err(|e| InspectError::Other(format!("spawning docker inspect (labels): {}", e)))?;
    if !label_output.status.success() {
        return Err(classify_stderr(&String::from_utf8_lossy(&label_output.stderr)));
    }
    let labels: std::collections::HashMap<String, String> =
        serde_json::from_str(String::from_utf8_lossy(&label_output.stdout).trim()).unwrap_or_default();
    Ok(labels.get(consts::LABEL_PORT_PREFIX).map(|v| parse_label_ports(v)).unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_single_published_tcp_port() {
        let json = r#"{"8080/tcp":[{"HostIp":"0.0.0.0","HostPort":"8080"}]}"#;
        assert_eq!(parse_published_ports(json), BTreeSet::from([8080]));
    }

    #[test]
    fn unpublished_ports_are_excluded() {
        let json = r#"{"8080/tcp":null,"5432/tcp":[{"HostIp":"0.0.0.0","HostPort":"5432"}]}"#;
        assert_eq!(parse_published_ports(json), BTreeSet::from([5432]));
    }

    #[test]
    fn empty_binding_list_is_treated_as_unpublished() {
        let json = r#"{"8080/tcp":[]}"#;
        assert_eq!(parse_published_ports(json), BTreeSet::new());
    }

    #[test]
    fn malformed_json_yields_an_empty_set_rather_than_panicking() {
        assert_eq!(parse_published_ports("not json"), BTreeSet::new());
    }

    #[test]
    fn classifies_no_such_object_as_not_found() {
        assert_eq!(classify_stderr("Error: No such object: abc123"), InspectError::NotFound);
    }

    #[test]
    fn classifies_other_errors_as_other() {
        assert!(matches!(classify_stderr("permission denied"), InspectError::Other(_)));
    }

    #[test]
    fn parses_a_single_label_port() {
        assert_eq!(parse_label_ports("9000"), BTreeSet::from([9000]));
    }

    #[test]
    fn parses_a_comma_separated_label_port_list() {
        assert_eq!(parse_label_ports("9000, 9001,9002"), BTreeSet::from([9000, 9001, 9002]));
    }

    #[test]
    fn label_ports_enabled_falls_back_to_the_config_value_when_unset() {
        env::remove_var(consts::ENABLE_LABEL_PORTS_VAR);
        assert!(!label_ports_enabled(false));
        assert!(label_ports_enabled(true));
    }

    #[test]
    fn env_var_overrides_the_config_value_either_direction() {
        env::set_var(consts::ENABLE_LABEL_PORTS_VAR, "1");
        assert!(label_ports_enabled(false));
        env::set_var(consts::ENABLE_LABEL_PORTS_VAR, "0");
        assert!(!label_ports_enabled(true));
        env::remove_var(consts::ENABLE_LABEL_PORTS_VAR);
    }
}
