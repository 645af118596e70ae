//! System property surface (spec §6), loaded from TOML at startup and
//! reloadable on demand (`dumpsys --refresh-properties`).

use parking_lot::RwLock;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const DEFAULT_CONFIG_PATH: &str = "/etc/iorapd/iorapd.toml";
const ENV_CONFIG_PATH: &str = "IORAPD_CONFIG";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadaheadStrategy {
    Fadvise,
    Mmap,
    Mlock,
}

impl Default for ReadaheadStrategy {
    fn default() -> Self {
        ReadaheadStrategy::Fadvise
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct IorapConfig {
    #[serde(default = "default_true")]
    pub perfetto_enable: bool,
    #[serde(default = "default_true")]
    pub readahead_enable: bool,
    #[serde(default)]
    pub readahead_strategy: ReadaheadStrategy,
    #[serde(default)]
    pub readahead_out_of_process: bool,
    #[serde(default = "default_max_traces")]
    pub perfetto_max_traces: u32,
    #[serde(default = "default_min_traces")]
    pub maintenance_min_traces: u32,
    #[serde(default = "default_compiler_timeout_ms")]
    pub maintenance_compiler_timeout_ms: u64,
    #[serde(default)]
    pub blacklist_packages: String,
    #[serde(default)]
    pub readahead_verbose_ipc: bool,
}

impl Default for IorapConfig {
    fn default() -> Self {
        Self {
            perfetto_enable: default_true(),
            readahead_enable: default_true(),
            readahead_strategy: ReadaheadStrategy::default(),
            readahead_out_of_process: false,
            perfetto_max_traces: default_max_traces(),
            maintenance_min_traces: default_min_traces(),
            maintenance_compiler_timeout_ms: default_compiler_timeout_ms(),
            blacklist_packages: String::new(),
            readahead_verbose_ipc: false,
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_max_traces() -> u32 {
    10
}
fn default_min_traces() -> u32 {
    1
}
fn default_compiler_timeout_ms() -> u64 {
    600_000
}

impl IorapConfig {
    /// Load from the path named by `IORAPD_CONFIG`, falling back to
    /// `/etc/iorapd/iorapd.toml`. A missing file or a parse failure both
    /// degrade to `IorapConfig::default()` rather than failing startup.
    pub fn load() -> Self {
        let path = std::env::var(ENV_CONFIG_PATH).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(Path::new(&path))
    }

    pub fn load_from(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_default(),
            Err(_) => IorapConfig::default(),
        }
    }

    pub fn blacklist(&self) -> Vec<&str> {
        self.blacklist_packages
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect()
    }

    pub fn is_blacklisted(&self, package: &str) -> bool {
        self.blacklist().iter().any(|p| *p == package)
    }
}

/// Shared, reloadable handle to the live configuration. `iorapd` holds one
/// instance and calls `reload` in response to a `dumpsys --refresh-properties`
/// request; readers never block a writer mid-read thanks to `parking_lot`.
#[derive(Clone)]
pub struct ConfigHandle {
    inner: Arc<RwLock<IorapConfig>>,
    path: PathBuf,
}

impl ConfigHandle {
    pub fn new(path: PathBuf) -> Self {
        let cfg = IorapConfig::load_from(&path);
        Self {
            inner: Arc::new(RwLock::new(cfg)),
            path,
        }
    }

    pub fn current(&self) -> IorapConfig {
        self.inner.read().clone()
    }

    pub fn reload(&self) {
        let cfg = IorapConfig::load_from(&self.path);
        *self.inner.write() = cfg;
    }
}
