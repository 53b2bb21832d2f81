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

//! Tunables layered defaults < `~/.rdhpf/config.toml` < `--config-file`
//! (spec.md 13). CLI flags and env vars are applied by the caller on top
//! of the `Config` this module produces -- this module only knows about
//! the file-backed layer.

use std::{fs, path::PathBuf};

use anyhow::Context;
use serde_derive::Deserialize;
use tracing::{info, instrument};

use crate::consts;

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct Config {
    pub debounce_ms: u64,
    pub health_check_interval_secs: u64,
    pub breaker_failure_threshold: u32,
    pub breaker_cooldown_secs: u64,
    pub forward_backoff_base_ms: u64,
    pub forward_backoff_cap_ms: u64,
    pub forward_backoff_max_attempts: u32,
    pub watchdog_ping_after_secs: u64,
    pub watchdog_fatal_after_secs: u64,
    pub enable_label_ports: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            debounce_ms: consts::DEBOUNCE_WINDOW.as_millis() as u64,
            health_check_interval_secs: consts::HEALTH_MONITOR_INTERVAL.as_secs(),
            breaker_failure_threshold: consts::BREAKER_FAILURE_THRESHOLD,
            breaker_cooldown_secs: consts::BREAKER_COOLDOWN.as_secs(),
            forward_backoff_base_ms: consts::FORWARD_BACKOFF_BASE.as_millis() as u64,
            forward_backoff_cap_ms: consts::FORWARD_BACKOFF_CAP.as_millis() as u64,
            forward_backoff_max_attempts: consts::FORWARD_BACKOFF_MAX_ATTEMPTS,
            watchdog_ping_after_secs: consts::WATCHDOG_PING_AFTER.as_secs(),
            watchdog_fatal_after_secs: consts::WATCHDOG_FATAL_AFTER.as_secs(),
            enable_label_ports: false,
        }
    }
}

/// Load defaults, then overlay `~/.rdhpf/config.toml` or, if given, the
/// explicitly passed `--config-file` (spec.md 13 precedence order: env
/// vars and CLI flags are applied by callers above this).
#[instrument(skip_all)]
pub fn read_config(config_file: &Option<String>) -> anyhow::Result<Config> {
    let path = match config_file {
        Some(p) => Some(PathBuf::from(p)),
        None => {
            let home = std::env::var("HOME").context("HOME is not set")?;
            let default_path = PathBuf::from(home).join(consts::RDHPF_DIR_NAME).join("config.toml");
            default_path.exists().then_some(default_path)
        }
    };

    let Some(path) = path else {
        return Ok(Config::default());
    };

    info!(?path, "reading config file");
    let contents = fs::read_to_string(&path).with_context(|| format!("reading config file {:?}", path))?;
    toml::from_str(&contents).with_context(|| format!("parsing config file {:?}", path))
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn missing_config_file_yields_defaults() {
        let config = read_config(&None).unwrap();
        assert_eq!(config.debounce_ms, 200);
        assert_eq!(config.breaker_failure_threshold, 5);
    }

    #[test]
    fn explicit_config_file_overrides_only_the_fields_it_sets() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "debounce_ms = 500\nenable_label_ports = true\n").unwrap();
        let config = read_config(&Some(path.to_string_lossy().to_string())).unwrap();
        assert_eq!(config.debounce_ms, 500);
        assert!(config.enable_label_ports);
        // untouched fields keep their defaults
        assert_eq!(config.breaker_failure_threshold, 5);
    }

    #[test]
    fn missing_config_file_path_is_an_error() {
        assert!(read_config(&Some("/nonexistent/path/config.toml".to_string())).is_err());
    }

    #[test]
    fn malformed_toml_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "this is not valid toml {{{").unwrap();
        assert!(read_config(&Some(path.to_string_lossy().to_string())).is_err());
    }
}
