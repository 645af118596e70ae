//! Orchestrator-level configuration: the on-disk root and sibling-binary
//! paths the daemon needs to find at startup. The property surface that
//! can change at runtime (spec.md §6 "Configuration properties") lives in
//! [`iorap_core::config`]; this module only adds the paths that are
//! fixed for the lifetime of the process.

use iorap_core::ConfigHandle;
use std::path::PathBuf;

const ENV_PROPERTIES_PATH: &str = "IORAPD_CONFIG";
const DEFAULT_PROPERTIES_PATH: &str = "/etc/iorapd/iorapd.toml";

const ENV_ROOT_DIR: &str = "IORAPD_ROOT_DIR";
const DEFAULT_ROOT_DIR: &str = "/data/misc/iorapd";

const ENV_COMPILER_PATH: &str = "IORAPD_COMPILER_PATH";
const DEFAULT_COMPILER_PATH: &str = "/system/bin/iorap.cmd.compiler";

const ENV_PREFETCHERD_PATH: &str = "IORAPD_PREFETCHERD_PATH";
const DEFAULT_PREFETCHERD_PATH: &str = "/system/bin/iorap.prefetcherd";

const ENV_PREFETCHERD_SOCKET: &str = "IORAPD_PREFETCHERD_SOCKET";
const DEFAULT_PREFETCHERD_SOCKET: &str = "/data/misc/iorapd/prefetcherd.sock";

const ENV_DB_PATH: &str = "IORAPD_DB_PATH";
const DEFAULT_DB_PATH: &str = "/data/misc/iorapd/iorapd.db";

pub struct DaemonConfig {
    pub root_dir: PathBuf,
    pub db_path: PathBuf,
    pub compiler_path: PathBuf,
    pub prefetcherd_path: PathBuf,
    pub prefetcherd_socket_path: PathBuf,
    pub properties: ConfigHandle,
}

impl DaemonConfig {
    pub fn load() -> Self {
        let properties_path = env_path(ENV_PROPERTIES_PATH, DEFAULT_PROPERTIES_PATH);
        Self {
            root_dir: env_path(ENV_ROOT_DIR, DEFAULT_ROOT_DIR),
            db_path: env_path(ENV_DB_PATH, DEFAULT_DB_PATH),
            compiler_path: env_path(ENV_COMPILER_PATH, DEFAULT_COMPILER_PATH),
            prefetcherd_path: env_path(ENV_PREFETCHERD_PATH, DEFAULT_PREFETCHERD_PATH),
            prefetcherd_socket_path: env_path(ENV_PREFETCHERD_SOCKET, DEFAULT_PREFETCHERD_SOCKET),
            properties: ConfigHandle::new(properties_path),
        }
    }
}

fn env_path(var: &str, default: &str) -> PathBuf {
    std::env::var(var).map(PathBuf::from).unwrap_or_else(|_| PathBuf::from(default))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_point_under_iorapd_root() {
        std::env::remove_var(ENV_ROOT_DIR);
        std::env::remove_var(ENV_DB_PATH);
        let cfg = DaemonConfig::load();
        assert_eq!(cfg.root_dir, PathBuf::from(DEFAULT_ROOT_DIR));
        assert_eq!(cfg.db_path, PathBuf::from(DEFAULT_DB_PATH));
    }
}
