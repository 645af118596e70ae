//! Client half of the control protocol (C5, orchestrator side): encodes
//! `Command`s, hands a compiled-trace file descriptor to the helper for
//! `kCreateFdSession`, and owns the monotonic session-id counter spec.md
//! §4.4 assigns to the orchestrator.
//!
//! `iorap-protocol::fd_channel` is blocking (`nix::sendmsg`/`recvmsg`
//! directly on the raw fd), so every call here runs inside
//! `spawn_blocking` to keep the async worker task from stalling on socket
//! I/O, matching how this lineage isolates blocking syscalls from async
//! executors elsewhere in the workspace.

use iorap_protocol::fd_channel::send_with_fd;
use iorap_protocol::Command;
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

pub struct PrefetchClient {
    socket: Arc<UnixStream>,
    next_session_id: AtomicU32,
}

impl PrefetchClient {
    pub fn connect(socket_path: &Path) -> std::io::Result<Self> {
        let socket = UnixStream::connect(socket_path)?;
        Ok(Self {
            socket: Arc::new(socket),
            next_session_id: AtomicU32::new(0),
        })
    }

    /// Session ids are monotonic for the lifetime of the client; reuse is
    /// forbidden while the old session still exists (spec.md §4.4), which
    /// a pure counter trivially satisfies.
    pub fn allocate_session_id(&self) -> u32 {
        self.next_session_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn send(&self, command: Command) -> std::io::Result<()> {
        let socket = self.socket.clone();
        tokio::task::spawn_blocking(move || {
            let bytes = command.encode();
            send_with_fd(socket.as_ref(), &bytes, None).map(|_| ())
        })
        .await
        .expect("blocking send task panicked")
        .map_err(|e| std::io::Error::from_raw_os_error(e as i32))
    }

    /// Open `compiled_trace_path` and send it to the helper as a
    /// `kCreateFdSession`; this process's copy of the fd is closed
    /// immediately after the send completes (§5 fd-ownership rule).
    pub async fn create_fd_session(
        &self,
        session_id: u32,
        description: String,
        compiled_trace_path: &Path,
    ) -> std::io::Result<()> {
        let file = std::fs::File::open(compiled_trace_path)?;
        let socket = self.socket.clone();
        let command = Command::CreateFdSession {
            session_id,
            description,
            fd: iorap_protocol::OwnedFd(file.as_raw_fd()),
        };
        tokio::task::spawn_blocking(move || {
            let bytes = command.encode();
            let result = send_with_fd(socket.as_ref(), &bytes, Some(file.as_raw_fd()));
            drop(file);
            result.map(|_| ())
        })
        .await
        .expect("blocking send task panicked")
        .map_err(|e| std::io::Error::from_raw_os_error(e as i32))
    }

    pub async fn destroy_session(&self, session_id: u32) -> std::io::Result<()> {
        self.send(Command::DestroySession { session_id }).await
    }

    pub async fn exit(&self) -> std::io::Result<()> {
        self.send(Command::Exit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_ids_are_monotonic_and_never_reused() {
        let (a, _b) = UnixStream::pair().unwrap();
        let client = PrefetchClient {
            socket: Arc::new(a),
            next_session_id: AtomicU32::new(0),
        };
        let first = client.allocate_session_id();
        let second = client.allocate_session_id();
        assert_eq!(first, 0);
        assert_eq!(second, 1);
        assert_ne!(first, second);
    }
}
