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

use std::time::Duration;

/// SSH ControlMaster keep-alive interval (spec.md 4.1).
pub const SSH_KEEPALIVE_INTERVAL_SECS: u32 = 15;
/// How many missed keep-alive replies the control channel tolerates
/// before ssh itself gives up on the connection.
pub const SSH_KEEPALIVE_COUNT_MAX: u32 = 2;

/// Health monitor ticker interval (spec.md 4.1, 4.7).
pub const HEALTH_MONITOR_INTERVAL: Duration = Duration::from_secs(15);

/// Circuit breaker defaults (spec.md 4.1).
pub const BREAKER_FAILURE_THRESHOLD: u32 = 5;
pub const BREAKER_COOLDOWN: Duration = Duration::from_secs(60);

/// Forward add/cancel backoff defaults (spec.md 4.6).
pub const FORWARD_BACKOFF_BASE: Duration = Duration::from_millis(100);
pub const FORWARD_BACKOFF_CAP: Duration = Duration::from_secs(10);
pub const FORWARD_BACKOFF_MAX_ATTEMPTS: u32 = 5;

/// Reconcile debounce window (spec.md 4.7, 9).
pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(200);

/// Event watchdog thresholds (spec.md 4.7).
pub const WATCHDOG_TICK_INTERVAL: Duration = Duration::from_secs(10);
pub const WATCHDOG_PING_AFTER: Duration = Duration::from_secs(30);
pub const WATCHDOG_FATAL_AFTER: Duration = Duration::from_secs(60);

/// Session rebuild / event-stream restart backoff (spec.md 4.7).
pub const SESSION_RETRY_BASE: Duration = Duration::from_secs(1);
pub const SESSION_RETRY_CAP: Duration = Duration::from_secs(30);
pub const SESSION_RETRY_MAX_ATTEMPTS: u32 = 10;

/// State file write cadence and staleness budget (spec.md 4.9).
pub const STATE_FILE_WRITE_INTERVAL: Duration = Duration::from_secs(2);
pub use rdhpf_protocol::STALE_AFTER as STATE_FILE_STALE_AFTER;

/// Total graceful shutdown budget (spec.md 4.8).
pub const SHUTDOWN_BUDGET: Duration = Duration::from_secs(2);

/// Connectivity probe timeout (spec.md 5).
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Directory under $HOME holding state files, sockets and config, mode
/// 0700 (spec.md 6).
pub const RDHPF_DIR_NAME: &str = ".rdhpf";

/// Prefix used for the SSH ControlMaster socket filename, rooted under
/// the OS temp directory (spec.md 6).
pub const CONTROL_SOCKET_PREFIX: &str = "rdhpf-";

/// History retention caps (spec.md 3).
pub const HISTORY_MAX_ENTRIES: usize = 100;
pub const HISTORY_MAX_AGE: Duration = Duration::from_secs(60 * 60);

/// Env var overrides (spec.md 6).
pub const LOG_LEVEL_VAR: &str = "RDHPF_LOG_LEVEL";
pub const ENABLE_LABEL_PORTS_VAR: &str = "RDHPF_ENABLE_LABEL_PORTS";

/// Label prefix for the opt-in label-port fallback (spec.md 4.3).
pub const LABEL_PORT_PREFIX: &str = "rdhpf.port";

/// Name prefix used for the throwaway watchdog-ping container (spec.md 4.7).
pub const PING_CONTAINER_PREFIX: &str = "rdhpf-ping-";

/// Label applied to containers that should be skipped during startup
/// reconciliation (spec.md 4.7), and to the ping container itself so an
/// operator can tell it apart from real workloads.
pub const TEST_INFRA_LABEL: &str = "rdhpf.test-infrastructure";
