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

//! Signal handling for graceful shutdown (spec.md 4.8): SIGTERM and
//! SIGINT both request the same shutdown path, they just flip a flag
//! the manager's event loop polls rather than unwinding from inside a
//! signal handler.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use signal_hook::{consts::{SIGINT, SIGTERM}, flag};

/// Register SIGTERM/SIGINT to set a shared flag, and hand back an
/// `Arc<AtomicBool>` the caller's event loop can poll each iteration.
pub fn install_shutdown_flag() -> anyhow::Result<Arc<AtomicBool>> {
    let flag = Arc::new(AtomicBool::new(false));
    flag::register(SIGTERM, Arc::clone(&flag))?;
    flag::register(SIGINT, Arc::clone(&flag))?;
    Ok(flag)
}

pub fn shutdown_requested(flag: &Arc<AtomicBool>) -> bool {
    flag.load(Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_starts_false() {
        let flag = install_shutdown_flag().unwrap();
        assert!(!shutdown_requested(&flag));
    }
}
