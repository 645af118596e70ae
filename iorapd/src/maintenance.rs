//! Maintenance controller (C8): refreshes the package-version cache,
//! sweeps stale packages, and forks `iorap-compiler` per versioned
//! component with a compiler-timeout watchdog. Grounded directly on
//! `maintenance/controller.cc`'s fork/exec + `SetTimeoutWatchDog` shape:
//! a polling thread checks `kill(pid, 0)` every 10 ms and `SIGKILL`s the
//! child once it outlives its budget.

use iorap_core::component::VersionedComponentName;
use iorap_core::store::Store;
use iorap_core::ConfigHandle;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use crate::events::PackageManager;
use crate::package_version::PackageVersionMap;

/// The watchdog's poll interval, `kCompilerCheckIntervalMs` in the source.
const COMPILER_CHECK_INTERVAL: Duration = Duration::from_millis(10);

pub struct MaintenanceController {
    store: Arc<Store>,
    config: ConfigHandle,
    package_versions: Arc<PackageVersionMap>,
    root_dir: PathBuf,
    compiler_path: PathBuf,
}

#[derive(Debug, Default)]
pub struct MaintenanceReport {
    pub packages_refreshed: usize,
    pub packages_invalidated: usize,
    pub components_considered: usize,
    pub components_skipped: usize,
    pub components_compiled: usize,
    pub components_failed: usize,
}

impl MaintenanceController {
    pub fn new(
        store: Arc<Store>,
        config: ConfigHandle,
        package_versions: Arc<PackageVersionMap>,
        root_dir: PathBuf,
        compiler_path: PathBuf,
    ) -> Self {
        Self { store, config, package_versions, root_dir, compiler_path }
    }

    /// Run one maintenance pass (§4.8), triggered by a `JobScheduledEvent`
    /// with `sort: IdleMaintenance`.
    pub async fn run(&self) -> MaintenanceReport {
        let mut report = MaintenanceReport::default();

        self.package_versions.refresh().await;
        let live_versions = self.package_versions.snapshot().await;
        report.packages_refreshed = live_versions.len();

        if let Ok(stored) = self.store.select_all_package_versions().await {
            for (name, stored_version) in stored {
                let still_live = live_versions.get(&name) == Some(&stored_version);
                if !still_live {
                    if self.store.delete_stale_package(&name).await.is_ok() {
                        report.packages_invalidated += 1;
                    }
                }
            }
        }

        let components = match self.store.select_all_versioned_components().await {
            Ok(components) => components,
            Err(e) => {
                log::error!("maintenance: failed to enumerate versioned components: {e}");
                return report;
            }
        };
        report.components_considered = components.len();

        for (activity_id, vcn) in components {
            match self.maintain_component(activity_id, &vcn).await {
                Ok(true) => report.components_compiled += 1,
                Ok(false) => report.components_skipped += 1,
                Err(e) => {
                    log::warn!("maintenance: compiling {}/{} failed: {e}", vcn.package, vcn.activity);
                    report.components_failed += 1;
                }
            }
        }

        report
    }

    /// Returns `Ok(true)` if a compile ran and succeeded, `Ok(false)` if
    /// the component was skipped (below `min_traces`, or already
    /// up-to-date).
    async fn maintain_component(&self, activity_id: i64, vcn: &VersionedComponentName) -> anyhow::Result<bool> {
        let cfg = self.config.current();

        let histories = self.store.select_activity_history_for_compile(activity_id).await?;
        if histories.len() < cfg.maintenance_min_traces as usize {
            log::debug!(
                "skipping {}/{}: {} eligible histories < min_traces {}",
                vcn.package,
                vcn.activity,
                histories.len(),
                cfg.maintenance_min_traces
            );
            return Ok(false);
        }

        let compiled_path = vcn.compiled_trace_path(&self.root_dir);
        let has_prefetch_row = self.store.select_prefetch_file(activity_id).await?.is_some();
        if compiled_path.exists() && has_prefetch_row {
            return Ok(false);
        }

        let raw_traces = self.store.select_raw_traces_by_vcn(vcn).await?;
        let mut inputs = Vec::with_capacity(histories.len());
        let mut timestamp_limits = Vec::with_capacity(histories.len());
        for history in &histories {
            let Some(raw_trace) = raw_traces.iter().find(|t| t.history_id == history.id) else {
                continue;
            };
            inputs.push(PathBuf::from(&raw_trace.file_path));
            let limit = history.timestamp_limit_ns().map(|v| v.max(0) as u64).unwrap_or(u64::MAX);
            timestamp_limits.push(limit);
        }
        if inputs.is_empty() {
            log::debug!("skipping {}/{}: no raw traces on disk for eligible histories", vcn.package, vcn.activity);
            return Ok(false);
        }

        iorap_core::layout::ensure_component_dirs(&self.root_dir, vcn)?;
        let succeeded = self
            .fork_compiler(&inputs, &timestamp_limits, &compiled_path, cfg.maintenance_compiler_timeout_ms)
            .await?;
        if !succeeded {
            return Err(anyhow::anyhow!("compiler exited non-zero or was killed"));
        }

        self.store.upsert_prefetch_file(activity_id, compiled_path.to_str().unwrap()).await?;
        Ok(true)
    }

    /// Fork+exec `iorap-compiler`, argv built the way
    /// `maintenance::MakeCompilerParams` does: positional inputs, repeated
    /// `--timestamp_limit_ns`, then `--output-proto`. A watchdog thread
    /// polls the child's liveness and sends `SIGKILL` past the timeout.
    async fn fork_compiler(
        &self,
        inputs: &[PathBuf],
        timestamp_limits: &[u64],
        output_proto: &Path,
        timeout_ms: u64,
    ) -> anyhow::Result<bool> {
        let mut command = tokio::process::Command::new(&self.compiler_path);
        for input in inputs {
            command.arg(input);
        }
        for limit in timestamp_limits {
            command.arg("--timestamp_limit_ns").arg(limit.to_string());
        }
        command.arg("--output-proto").arg(output_proto);
        command.stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::inherit());

        let mut child = command.spawn()?;
        let pid = child.id().ok_or_else(|| anyhow::anyhow!("compiler child exited before its pid could be read"))?;

        let cancel_watchdog = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let watchdog = spawn_watchdog(pid, timeout_ms, cancel_watchdog.clone());

        let status = child.wait().await?;
        cancel_watchdog.store(true, std::sync::atomic::Ordering::SeqCst);
        let _ = watchdog.join();

        Ok(status.success())
    }
}

/// Spawn the watchdog thread: poll `kill(pid, 0)` (a liveness probe, no
/// signal sent) every `COMPILER_CHECK_INTERVAL`, and `SIGKILL` the child
/// once `timeout_ms` elapses. `cancel` is checked each iteration so the
/// caller can stop polling once the child has already exited on its own.
fn spawn_watchdog(pid: u32, timeout_ms: u64, cancel: Arc<std::sync::atomic::AtomicBool>) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let pid = Pid::from_raw(pid as i32);
        let timeout = Duration::from_millis(timeout_ms);
        let start = std::time::Instant::now();
        loop {
            if cancel.load(std::sync::atomic::Ordering::SeqCst) {
                return;
            }
            if kill(pid, None).is_err() {
                // Process is already gone; nothing left to watch.
                return;
            }
            if start.elapsed() > timeout {
                log::warn!("compiler pid {pid} exceeded {timeout_ms}ms, sending SIGKILL");
                let _ = kill(pid, Signal::SIGKILL);
                return;
            }
            std::thread::sleep(COMPILER_CHECK_INTERVAL);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package_version::PackageVersionMap;
    use iorap_core::store::Temperature;
    use std::collections::HashMap as StdHashMap;

    struct FakePackageManager(StdHashMap<String, i64>);

    #[async_trait::async_trait]
    impl PackageManager for FakePackageManager {
        async fn get_version_code_for_package(&self, name: &str) -> Option<i64> {
            self.0.get(name).copied()
        }
        async fn get_all_packages(&self) -> Vec<String> {
            self.0.keys().cloned().collect()
        }
    }

    async fn setup() -> (MaintenanceController, Arc<Store>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(&dir.path().join("iorapd.db")).await.unwrap());
        let config = ConfigHandle::new(dir.path().join("missing.toml"));
        let pm = Arc::new(FakePackageManager(StdHashMap::from([("com.foo".to_string(), 1)])));
        let package_versions = Arc::new(PackageVersionMap::new(pm));
        let controller = MaintenanceController::new(
            store.clone(),
            config,
            package_versions,
            dir.path().join("root"),
            PathBuf::from("/bin/true"),
        );
        (controller, store, dir)
    }

    #[tokio::test]
    async fn below_min_traces_is_skipped() {
        let (controller, store, _dir) = setup().await;
        let pkg = store.insert_or_get_package("com.foo", 1).await.unwrap();
        let act = store.insert_or_get_activity(pkg, "com.foo.Main").await.unwrap();
        let h1 = store.insert_history(act, Temperature::Cold, true, false, Some(1)).await.unwrap();
        store.insert_raw_trace(h1, "/tmp/a.pb").await.unwrap();
        let h2 = store.insert_history(act, Temperature::Cold, true, false, Some(2)).await.unwrap();
        store.insert_raw_trace(h2, "/tmp/b.pb").await.unwrap();

        let vcn = VersionedComponentName::new("com.foo", "com.foo.Main", 1);
        let controller = MaintenanceController {
            config: {
                let dir = tempfile::tempdir().unwrap();
                let path = dir.path().join("iorapd.toml");
                std::fs::write(&path, "maintenance_min_traces = 3\n").unwrap();
                std::mem::forget(dir);
                ConfigHandle::new(path)
            },
            ..controller
        };
        let compiled = controller.maintain_component(act, &vcn).await.unwrap();
        assert!(!compiled);
        assert!(store.select_prefetch_file(act).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn already_compiled_with_row_is_skipped() {
        let (controller, store, dir) = setup().await;
        let pkg = store.insert_or_get_package("com.foo", 1).await.unwrap();
        let act = store.insert_or_get_activity(pkg, "com.foo.Main").await.unwrap();
        let h1 = store.insert_history(act, Temperature::Cold, true, false, Some(1)).await.unwrap();
        store.insert_raw_trace(h1, "/tmp/a.pb").await.unwrap();

        let vcn = VersionedComponentName::new("com.foo", "com.foo.Main", 1);
        let compiled_path = vcn.compiled_trace_path(&dir.path().join("root"));
        std::fs::create_dir_all(compiled_path.parent().unwrap()).unwrap();
        std::fs::write(&compiled_path, b"x").unwrap();
        store.upsert_prefetch_file(act, compiled_path.to_str().unwrap()).await.unwrap();

        let compiled = controller.maintain_component(act, &vcn).await.unwrap();
        assert!(!compiled);
    }

    #[tokio::test]
    async fn watchdog_kills_long_running_child() {
        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id();
        let cancel = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let watchdog = spawn_watchdog(pid, 20, cancel);
        watchdog.join().unwrap();
        let status = child.wait().unwrap();
        assert!(!status.success());
    }
}
