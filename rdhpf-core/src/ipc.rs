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

//! The IPC server (spec.md 4.9, 6): accepts connections on the per-host
//! Unix socket and writes exactly one JSON [`Snapshot`] document per
//! connection, then closes it. There is no request to parse -- connecting
//! is the request.

use std::{
    fs,
    io::Write as _,
    os::unix::net::{UnixListener, UnixStream},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
};

use rdhpf_protocol::Snapshot;
use tracing::{debug, warn};

/// Owns the listening socket and the accept-loop thread.
pub struct IpcServer {
    socket_path: PathBuf,
    stop: Arc<AtomicBool>,
}

impl IpcServer {
    /// Bind `socket_path`, removing any stale socket left behind by a
    /// prior crashed instance first.
    pub fn bind(
        socket_path: &Path,
        render: impl Fn() -> Snapshot + Send + Sync + 'static,
    ) -> anyhow::Result<Self> {
        if socket_path.exists() {
            fs::remove_file(socket_path)?;
        }
        let listener = UnixListener::bind(socket_path)?;
        let stop = Arc::new(AtomicBool::new(false));
        let stop_for_loop = Arc::clone(&stop);
        let render = Arc::new(render);

        thread::spawn(move || accept_loop(listener, stop_for_loop, render));

        Ok(IpcServer { socket_path: socket_path.to_path_buf(), stop })
    }

    /// Stop the accept loop and unlink the socket (spec.md 4.9: the
    /// socket does not outlive the process).
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::SeqCst);
        // unblock the accept() call so the loop thread notices `stop`
        let _ = UnixStream::connect(&self.socket_path);
        let _ = fs::remove_file(&self.socket_path);
    }
}

fn accept_loop(
    listener: UnixListener,
    stop: Arc<AtomicBool>,
    render: Arc<dyn Fn() -> Snapshot + Send + Sync>,
) {
    for conn in listener.incoming() {
        if stop.load(Ordering::SeqCst) {
            break;
        }
        match conn {
            Ok(stream) => {
                let render = Arc::clone(&render);
                thread::spawn(move || serve_one(stream, render.as_ref()));
            }
            Err(e) => {
                warn!(error = %e, "ipc accept failed");
            }
        }
    }
}

fn serve_one(mut stream: UnixStream, render: &dyn Fn() -> Snapshot) {
    let snapshot = render();
    let wire = match snapshot.to_wire_string() {
        Ok(w) => w,
        Err(e) => {
            warn!(error = %e, "failed to serialize snapshot for an ipc client");
            return;
        }
    };
    if let Err(e) = stream.write_all(wire.as_bytes()) {
        debug!(error = %e, "ipc client disconnected before the snapshot was fully written");
    }
}
