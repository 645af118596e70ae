//! Control protocol between the orchestrator and the prefetch helper (C5):
//! a length-delimited binary command stream carried over a pipe or a
//! `SOCK_STREAM` Unix socket, with file descriptors passed out-of-band via
//! `SCM_RIGHTS`.
//!
//! Wire format: every command starts with a little-endian `u32` tag,
//! followed by its payload (§6). Strings are `lp_string`: a `u32` length
//! followed by that many bytes, no terminator.

use std::collections::VecDeque;
use thiserror::Error;

#[cfg(unix)]
pub mod fd_channel;

pub const TAG_REGISTER_FILE_PATH: u32 = 0;
pub const TAG_UNREGISTER_FILE_PATH: u32 = 1;
pub const TAG_READ_AHEAD: u32 = 2;
pub const TAG_EXIT: u32 = 3;
pub const TAG_CREATE_SESSION: u32 = 4;
pub const TAG_DESTROY_SESSION: u32 = 5;
pub const TAG_DUMP_SESSION: u32 = 6;
pub const TAG_DUMP_EVERYTHING: u32 = 7;
pub const TAG_CREATE_FD_SESSION: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ReadAheadKind {
    Fadvise = 0,
    MmapLocked = 1,
    MmapMlock = 2,
}

impl ReadAheadKind {
    fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(ReadAheadKind::Fadvise),
            1 => Some(ReadAheadKind::MmapLocked),
            2 => Some(ReadAheadKind::MmapMlock),
            _ => None,
        }
    }
}

/// An owned file descriptor carried alongside `CreateFdSession`. The raw fd
/// value is never encoded in the in-band payload (§9 "SCM_RIGHTS fd
/// passing"); it travels over the transport's ancillary channel and is
/// attached here only after decode.
#[derive(Debug)]
pub struct OwnedFd(pub std::os::fd::RawFd);

#[derive(Debug)]
pub enum Command {
    RegisterFilePath {
        session_id: u32,
        path_id: u32,
        path: String,
    },
    UnregisterFilePath {
        session_id: u32,
        path_id: u32,
    },
    ReadAhead {
        session_id: u32,
        path_id: u32,
        kind: ReadAheadKind,
        length: u64,
        offset: u64,
    },
    Exit,
    CreateSession {
        session_id: u32,
        description: String,
    },
    DestroySession {
        session_id: u32,
    },
    DumpSession {
        session_id: u32,
    },
    DumpEverything,
    CreateFdSession {
        session_id: u32,
        description: String,
        fd: OwnedFd,
    },
}

impl Command {
    pub fn tag(&self) -> u32 {
        match self {
            Command::RegisterFilePath { .. } => TAG_REGISTER_FILE_PATH,
            Command::UnregisterFilePath { .. } => TAG_UNREGISTER_FILE_PATH,
            Command::ReadAhead { .. } => TAG_READ_AHEAD,
            Command::Exit => TAG_EXIT,
            Command::CreateSession { .. } => TAG_CREATE_SESSION,
            Command::DestroySession { .. } => TAG_DESTROY_SESSION,
            Command::DumpSession { .. } => TAG_DUMP_SESSION,
            Command::DumpEverything => TAG_DUMP_EVERYTHING,
            Command::CreateFdSession { .. } => TAG_CREATE_FD_SESSION,
        }
    }

    /// True for the one variant whose decode must pop a queued fd.
    pub fn requires_fd(tag: u32) -> bool {
        tag == TAG_CREATE_FD_SESSION
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16);
        buf.extend_from_slice(&self.tag().to_le_bytes());
        match self {
            Command::RegisterFilePath {
                session_id,
                path_id,
                path,
            } => {
                buf.extend_from_slice(&session_id.to_le_bytes());
                buf.extend_from_slice(&path_id.to_le_bytes());
                encode_lp_string(&mut buf, path);
            }
            Command::UnregisterFilePath {
                session_id,
                path_id,
            } => {
                buf.extend_from_slice(&session_id.to_le_bytes());
                buf.extend_from_slice(&path_id.to_le_bytes());
            }
            Command::ReadAhead {
                session_id,
                path_id,
                kind,
                length,
                offset,
            } => {
                buf.extend_from_slice(&session_id.to_le_bytes());
                buf.extend_from_slice(&path_id.to_le_bytes());
                buf.extend_from_slice(&(*kind as u32).to_le_bytes());
                buf.extend_from_slice(&length.to_le_bytes());
                buf.extend_from_slice(&offset.to_le_bytes());
            }
            Command::Exit | Command::DumpEverything => {}
            Command::CreateSession {
                session_id,
                description,
            } => {
                buf.extend_from_slice(&session_id.to_le_bytes());
                encode_lp_string(&mut buf, description);
            }
            Command::DestroySession { session_id } | Command::DumpSession { session_id } => {
                buf.extend_from_slice(&session_id.to_le_bytes());
            }
            Command::CreateFdSession {
                session_id,
                description,
                fd: _,
            } => {
                buf.extend_from_slice(&session_id.to_le_bytes());
                encode_lp_string(&mut buf, description);
                // the fd itself travels out-of-band; nothing more is encoded here.
            }
        }
        buf
    }
}

fn encode_lp_string(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown command tag {0}")]
    UnknownTag(u32),
    #[error("CreateFdSession decoded with no fd available")]
    MissingFd,
}

impl From<ProtocolError> for iorap_core::IorapError {
    fn from(e: ProtocolError) -> Self {
        iorap_core::IorapError::protocol_violation(e.to_string())
    }
}

/// Read one little-endian `u32` from `buf[pos..]`. Returns `None` if there
/// aren't 4 bytes left (the frame is incomplete, not malformed).
fn read_u32(buf: &[u8], pos: &mut usize) -> Option<u32> {
    let bytes = buf.get(*pos..*pos + 4)?;
    *pos += 4;
    Some(u32::from_le_bytes(bytes.try_into().unwrap()))
}

fn read_u64(buf: &[u8], pos: &mut usize) -> Option<u64> {
    let bytes = buf.get(*pos..*pos + 8)?;
    *pos += 8;
    Some(u64::from_le_bytes(bytes.try_into().unwrap()))
}

fn read_lp_string(buf: &[u8], pos: &mut usize) -> Option<String> {
    let len = read_u32(buf, pos)? as usize;
    let bytes = buf.get(*pos..*pos + len)?;
    *pos += len;
    Some(String::from_utf8_lossy(bytes).into_owned())
}

/// Try to decode exactly one command from the front of `buf`, given the
/// queue of fds that arrived out-of-band ahead of it. Returns:
/// - `Ok(Some((command, consumed)))` — a whole command was decoded.
/// - `Ok(None)` — not enough bytes yet; the caller should read more and
///   retry without discarding `buf`.
/// - `Err(_)` — the tag or a `requires_fd` command is malformed; per §9 a
///   tag corruption should terminate the connection.
pub fn try_decode(buf: &[u8], fds: &mut VecDeque<std::os::fd::RawFd>) -> Result<Option<(Command, usize)>, ProtocolError> {
    let mut pos = 0usize;
    let tag = match read_u32(buf, &mut pos) {
        Some(t) => t,
        None => return Ok(None),
    };

    macro_rules! need {
        ($expr:expr) => {
            match $expr {
                Some(v) => v,
                None => return Ok(None),
            }
        };
    }

    let command = match tag {
        TAG_REGISTER_FILE_PATH => {
            let session_id = need!(read_u32(buf, &mut pos));
            let path_id = need!(read_u32(buf, &mut pos));
            let path = need!(read_lp_string(buf, &mut pos));
            Command::RegisterFilePath {
                session_id,
                path_id,
                path,
            }
        }
        TAG_UNREGISTER_FILE_PATH => {
            let session_id = need!(read_u32(buf, &mut pos));
            let path_id = need!(read_u32(buf, &mut pos));
            Command::UnregisterFilePath {
                session_id,
                path_id,
            }
        }
        TAG_READ_AHEAD => {
            let session_id = need!(read_u32(buf, &mut pos));
            let path_id = need!(read_u32(buf, &mut pos));
            let kind_raw = need!(read_u32(buf, &mut pos));
            let length = need!(read_u64(buf, &mut pos));
            let offset = need!(read_u64(buf, &mut pos));
            let kind = ReadAheadKind::from_u32(kind_raw).unwrap_or(ReadAheadKind::Fadvise);
            Command::ReadAhead {
                session_id,
                path_id,
                kind,
                length,
                offset,
            }
        }
        TAG_EXIT => Command::Exit,
        TAG_CREATE_SESSION => {
            let session_id = need!(read_u32(buf, &mut pos));
            let description = need!(read_lp_string(buf, &mut pos));
            Command::CreateSession {
                session_id,
                description,
            }
        }
        TAG_DESTROY_SESSION => {
            let session_id = need!(read_u32(buf, &mut pos));
            Command::DestroySession { session_id }
        }
        TAG_DUMP_SESSION => {
            let session_id = need!(read_u32(buf, &mut pos));
            Command::DumpSession { session_id }
        }
        TAG_DUMP_EVERYTHING => Command::DumpEverything,
        TAG_CREATE_FD_SESSION => {
            let session_id = need!(read_u32(buf, &mut pos));
            let description = need!(read_lp_string(buf, &mut pos));
            let fd = fds.pop_front().ok_or(ProtocolError::MissingFd)?;
            Command::CreateFdSession {
                session_id,
                description,
                fd: OwnedFd(fd),
            }
        }
        other => return Err(ProtocolError::UnknownTag(other)),
    };

    Ok(Some((command, pos)))
}

/// Incremental decoder over an accumulating byte buffer, matching the pipe
/// transport's "read up to 1 MiB, peel off whole commands, leave partial
/// commands buffered" rule (§4.5). The socket transport additionally feeds
/// fds via [`Decoder::push_fd`] as they arrive ahead of the command that
/// will claim them.
#[derive(Default)]
pub struct Decoder {
    buf: Vec<u8>,
    fds: VecDeque<std::os::fd::RawFd>,
}

/// Matches the pipe transport's read-buffer cap (§4.5).
pub const MAX_PIPE_READ: usize = 1024 * 1024;

impl Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn push_fd(&mut self, fd: std::os::fd::RawFd) {
        self.fds.push_back(fd);
    }

    /// Pop one fully-decoded command, if the buffer holds one.
    pub fn next_command(&mut self) -> Result<Option<Command>, ProtocolError> {
        match try_decode(&self.buf, &mut self.fds)? {
            Some((command, consumed)) => {
                self.buf.drain(..consumed);
                Ok(Some(command))
            }
            None => Ok(None),
        }
    }
}
