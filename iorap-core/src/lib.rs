//! Shared types for the prefetch daemon: inode identity, the compiled-trace
//! model, versioned component naming, configuration, error taxonomy, and
//! the SQLite-backed persistence store.

pub mod component;
pub mod config;
pub mod error;
pub mod inode;
pub mod layout;
pub mod store;
pub mod trace;

pub use component::VersionedComponentName;
pub use config::{ConfigHandle, IorapConfig, ReadaheadStrategy};
pub use error::{IorapError, Result};
pub use inode::{InodeKey, PageCacheFtraceEvent, ResolveErrorKind, ResolveResult};
pub use store::{Store, Temperature};
pub use trace::{CompiledTrace, CompilerEntry};
