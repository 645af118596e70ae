//! Dispatches decoded commands against a [`SessionManager`] and drives the
//! two transports named in §4.5: a pipe (plain byte stream, up to 1 MiB per
//! read) and an `AF_UNIX` socket (same framing, plus `SCM_RIGHTS` fds
//! arriving alongside `CreateFdSession`). Both transports use blocking
//! syscalls on a dedicated OS thread, matching how the rest of this
//! lineage isolates blocking I/O from the async runtime.

use crate::manager::SessionManager;
use iorap_protocol::{Command, Decoder, ReadAheadKind, MAX_PIPE_READ};
use std::io::Read;
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex};

/// Applies one decoded command to `manager`. Returns `false` only for
/// `Command::Exit`, telling the caller's read loop to stop.
fn dispatch(manager: &Mutex<SessionManager>, command: Command) -> bool {
    let mut manager = manager.lock().unwrap();
    match command {
        Command::RegisterFilePath {
            session_id,
            path_id,
            path,
        } => {
            if let Some(session) = manager.get_mut(session_id) {
                session.register_file_path(path_id, path);
            } else {
                log::warn!("RegisterFilePath: no session {session_id}");
            }
        }
        Command::UnregisterFilePath { session_id, path_id } => {
            if let Some(session) = manager.get_mut(session_id) {
                session.unregister_file_path(path_id);
            } else {
                log::warn!("UnregisterFilePath: no session {session_id}");
            }
        }
        Command::ReadAhead {
            session_id,
            path_id,
            kind,
            length,
            offset,
        } => {
            if let Some(session) = manager.get_mut(session_id) {
                session.read_ahead(path_id, kind, length, offset);
            } else {
                log::warn!("ReadAhead: no session {session_id}");
            }
        }
        Command::Exit => return false,
        Command::CreateSession {
            session_id,
            description,
        } => {
            if !manager.create_session(session_id, description) {
                log::warn!("CreateSession: session {session_id} already exists");
            }
        }
        Command::DestroySession { session_id } => {
            manager.destroy_session(session_id);
        }
        Command::DumpSession { session_id } => match manager.dump_session(session_id) {
            Some(text) => log::info!("{text}"),
            None => log::warn!("DumpSession: no session {session_id}"),
        },
        Command::DumpEverything => log::info!("{}", manager.dump_everything()),
        Command::CreateFdSession {
            session_id,
            description,
            fd,
        } => {
            if !manager.create_session(session_id, description) {
                log::warn!("CreateFdSession: session {session_id} already exists");
                return true;
            }
            if let Some(session) = manager.get_mut(session_id) {
                process_fd(session, fd.0);
            }
        }
    }
    true
}

/// `ProcessFd`: read a compiled trace off `fd`, register every indexed path,
/// then issue the playback list in order. Always uses `Fadvise`; the engine
/// doesn't pick a strategy per entry.
fn process_fd(session: &mut crate::session::Session, fd: RawFd) {
    let trace = match iorap_compiler::codec::decode_compiled_trace_from_fd(fd) {
        Ok(trace) => trace,
        Err(e) => {
            log::error!("ProcessFd: failed to decode compiled trace: {e}");
            return;
        }
    };

    for entry in &trace.index {
        if entry.id < 0 {
            log::warn!("ProcessFd: skipping index entry with negative id {}", entry.id);
            continue;
        }
        session.register_file_path(entry.id as u32, entry.file_name.clone());
    }

    for entry in &trace.list {
        if entry.file_length_bytes == 0 {
            continue;
        }
        session.read_ahead(
            entry.index_id as u32,
            ReadAheadKind::Fadvise,
            entry.file_length_bytes,
            entry.file_offset_bytes,
        );
    }
}

/// Runs the pipe transport to completion on the calling thread: read up to
/// `MAX_PIPE_READ` bytes at a time from `reader`, peel off whole commands,
/// dispatch each. Returns when the peer closes the pipe or sends `Exit`.
pub fn run_pipe_transport(mut reader: impl Read, manager: Arc<Mutex<SessionManager>>) {
    let mut decoder = Decoder::new();
    let mut buf = vec![0u8; MAX_PIPE_READ];

    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => {
                log::info!("pipe transport: EOF, exiting");
                return;
            }
            Ok(n) => n,
            Err(e) => {
                log::error!("pipe transport: read failed: {e}");
                return;
            }
        };
        decoder.push_bytes(&buf[..n]);

        loop {
            match decoder.next_command() {
                Ok(Some(command)) => {
                    if !dispatch(&manager, command) {
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    log::error!("pipe transport: {e}, terminating connection");
                    return;
                }
            }
        }
    }
}

/// Runs the socket transport to completion on the calling thread, pulling
/// ancillary fds out of each `recvmsg` alongside the payload.
#[cfg(unix)]
pub fn run_socket_transport(socket: std::os::unix::net::UnixStream, manager: Arc<Mutex<SessionManager>>) {
    let mut decoder = Decoder::new();
    let mut buf = vec![0u8; MAX_PIPE_READ];

    loop {
        let (n, fds) = match iorap_protocol::fd_channel::recv_with_fds(&socket, &mut buf) {
            Ok(result) => result,
            Err(e) => {
                log::error!("socket transport: recvmsg failed: {e}");
                return;
            }
        };
        if n == 0 {
            log::info!("socket transport: peer closed, exiting");
            return;
        }
        decoder.push_bytes(&buf[..n]);
        for fd in fds {
            decoder.push_fd(fd);
        }

        loop {
            match decoder.next_command() {
                Ok(Some(command)) => {
                    if !dispatch(&manager, command) {
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    log::error!("socket transport: {e}, terminating connection");
                    return;
                }
            }
        }
    }
}
