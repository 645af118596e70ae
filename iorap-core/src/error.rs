//! Error taxonomy shared across the prefetch core.
//!
//! The kinds below are not a grab-bag: call sites dispatch on them. A
//! `StaleReference` is handled by deleting the offending row and reporting
//! success (the goal was reconciliation); a `ProtocolViolation` on a socket
//! terminates the connection; a `ResourceExhaustion` is recorded per-entry
//! and the session keeps going. Collapsing these into one `anyhow::Error`
//! would lose the dispatch the rest of the core relies on.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum IorapError {
    /// A syscall failed with an EAGAIN/EINTR-class error, or a DB lock was
    /// transiently held. Callers may retry with `TEMP_FAILURE_RETRY`-style
    /// loops; otherwise this surfaces.
    #[error("transient I/O error: {0}")]
    TransientIo(#[source] std::io::Error),

    /// Malformed protobuf, a parse error in a textcache line, or invalid
    /// CLI input. The current operation aborts without mutating persistent
    /// state.
    #[error("bad input: {0}")]
    BadInput(String),

    /// An `mmap`/`mlock`/`open` failed for a single entry. Recorded with
    /// `success = false` on that entry; the session continues.
    #[error("resource exhausted: {0}")]
    ResourceExhaustion(String),

    /// An inode failed to verify, or a package no longer exists at its
    /// stored version. The row and its files are deleted; the caller
    /// reports success since the goal was reconciliation.
    #[error("stale reference: {0}")]
    StaleReference(String),

    /// A malformed control-protocol frame, a missing fd for a command that
    /// requires one, or an unknown command tag.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// `fork`/`execve` failed, or the database could not be opened at all.
    /// The enclosing job fails; the daemon process stays alive.
    #[error("fatal system error: {0}")]
    FatalSystem(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl IorapError {
    pub fn is_stale_reference(&self) -> bool {
        matches!(self, IorapError::StaleReference(_))
    }

    pub fn bad_input(msg: impl Into<String>) -> Self {
        IorapError::BadInput(msg.into())
    }

    pub fn protocol_violation(msg: impl Into<String>) -> Self {
        IorapError::ProtocolViolation(msg.into())
    }

    pub fn resource_exhaustion(msg: impl Into<String>) -> Self {
        IorapError::ResourceExhaustion(msg.into())
    }

    pub fn stale_reference(msg: impl Into<String>) -> Self {
        IorapError::StaleReference(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, IorapError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_reference_is_identifiable() {
        let err = IorapError::stale_reference("package gone");
        assert!(err.is_stale_reference());
        let err = IorapError::bad_input("bad arg");
        assert!(!err.is_stale_reference());
    }
}
