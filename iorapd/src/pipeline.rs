//! The launch-event pipeline (C7): one single-threaded worker task owning
//! the defender's state and every in-flight launch's scratch data,
//! driving the decision of readahead-vs-trace-vs-neither per spec.md
//! §4.7. Trace-stream writes are handed off to the `io_worker` rather
//! than performed here, matching the two-scheduler model in §5.

use crate::defender::{Decision, Defender, LaunchState};
use crate::events::{
    ActivityTitle, AppLaunchEvent, IntentComponent, LaunchEventKind, PackageChangeEvent, Temperature,
    TraceProducer,
};
use crate::history_cell::HistoryCell;
use crate::io_worker::IoWorker;
use crate::package_version::PackageVersionMap;
use crate::prefetch_client::PrefetchClient;
use iorap_core::component::{prebuilt_trace_path, VersionedComponentName};
use iorap_core::store::Store;
use iorap_core::ConfigHandle;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// The kernel producer's capture window (§4.7 "≈ 10 s").
const TRACE_CAPTURE_WINDOW: Duration = Duration::from_secs(10);

#[derive(Default)]
struct LaunchInfo {
    package: Option<String>,
    activity: Option<String>,
    temperature: Option<Temperature>,
    intent_started_ns: Option<i64>,
    trace_mode: bool,
    readahead_mode: bool,
    session_id: Option<u32>,
    activity_id: Option<i64>,
    vcn: Option<VersionedComponentName>,
    blacklisted: bool,
    history_cell: HistoryCell,
}

pub struct Pipeline {
    store: Arc<Store>,
    config: ConfigHandle,
    root_dir: PathBuf,
    package_versions: Arc<PackageVersionMap>,
    prefetch_client: Option<Arc<PrefetchClient>>,
    trace_producer: Arc<dyn TraceProducer>,
    io_worker: IoWorker,
    defender: Defender,
    launches: HashMap<u64, LaunchInfo>,
    recent_history_id: Option<i64>,
}

impl Pipeline {
    pub fn new(
        store: Arc<Store>,
        config: ConfigHandle,
        root_dir: PathBuf,
        package_versions: Arc<PackageVersionMap>,
        prefetch_client: Option<Arc<PrefetchClient>>,
        trace_producer: Arc<dyn TraceProducer>,
    ) -> Self {
        let io_worker = IoWorker::spawn(store.clone(), config.clone(), root_dir.clone());
        Self {
            store,
            config,
            root_dir,
            package_versions,
            prefetch_client,
            trace_producer,
            io_worker,
            defender: Defender::new(),
            launches: HashMap::new(),
            recent_history_id: None,
        }
    }

    pub async fn handle_launch_event(&mut self, event: AppLaunchEvent) {
        let seq = event.sequence_id;
        let ts_ns = event.timestamp_nanos;
        let decision = self.defender.apply(seq, &event.kind);
        let effective_kind = match decision {
            Decision::Reject => return,
            Decision::Accept(_) => event.kind,
            Decision::Rewrite(LaunchState::IntentFailed) => LaunchEventKind::IntentFailed,
            Decision::Rewrite(LaunchState::ActivityLaunchCancelled) => LaunchEventKind::ActivityLaunchCancelled,
            Decision::Rewrite(other) => {
                log::error!("defender produced an unexpected rewrite target {other:?}");
                return;
            }
        };

        match effective_kind {
            LaunchEventKind::IntentStarted { component } => self.on_intent_started(seq, ts_ns, component).await,
            LaunchEventKind::IntentFailed => self.on_aborted(seq).await,
            LaunchEventKind::ActivityLaunched { title, temperature } => {
                self.on_activity_launched(seq, title, temperature).await
            }
            LaunchEventKind::ActivityLaunchFinished => self.on_activity_launch_finished(seq, ts_ns).await,
            LaunchEventKind::ActivityLaunchCancelled => self.on_aborted(seq).await,
            LaunchEventKind::ReportFullyDrawn => self.on_report_fully_drawn(ts_ns).await,
        }
    }

    /// §6 "Package-change events": isDeleted is left for maintenance to
    /// sweep; an update that keeps the same version still invalidates any
    /// existing plan since a same-version rebuild can change file layout.
    pub async fn handle_package_change(&mut self, event: PackageChangeEvent) {
        if event.is_deleted {
            return;
        }
        let previous = self.package_versions.find(&event.package_name).await;
        self.package_versions.update(&event.package_name, event.version).await;
        if previous == Some(event.version) {
            if let Err(e) = self.store.delete_package_version(&event.package_name, event.version).await {
                log::warn!("failed to invalidate rebuilt package {}: {e}", event.package_name);
            }
        }
    }

    async fn on_intent_started(&mut self, seq: u64, ts_ns: i64, component: Option<IntentComponent>) {
        let (package, activity) = match component {
            Some(c) => {
                let activity = VersionedComponentName::canonicalize_activity(&c.package_name, &c.class_name);
                (Some(c.package_name), Some(activity))
            }
            None => (None, None),
        };

        if let Some(pkg) = &package {
            if self.config.current().is_blacklisted(pkg) {
                self.launches.insert(seq, LaunchInfo { blacklisted: true, ..Default::default() });
                return;
            }
        }

        let mut info = LaunchInfo {
            intent_started_ns: Some(ts_ns),
            package: package.clone(),
            activity: activity.clone(),
            ..Default::default()
        };

        if let (Some(package), Some(activity)) = (package, activity) {
            self.begin_decision(seq, &mut info, &package, &activity).await;
        }

        self.launches.insert(seq, info);
    }

    async fn on_activity_launched(&mut self, seq: u64, title: ActivityTitle, temperature: Temperature) {
        let Some(mut info) = self.launches.remove(&seq) else { return };
        if info.blacklisted {
            self.launches.insert(seq, info);
            return;
        }

        if info.package.is_none() {
            info.package = Some(title.package_name);
            info.activity = Some(title.activity_name);
        }
        info.temperature = Some(temperature);

        if let Some(pkg) = info.package.clone() {
            if self.config.current().is_blacklisted(&pkg) {
                info.blacklisted = true;
                self.abort_trace(&mut info);
                self.abort_readahead(&mut info).await;
                self.launches.insert(seq, info);
                return;
            }
        }

        if temperature != Temperature::Cold {
            self.abort_trace(&mut info);
            self.abort_readahead(&mut info).await;
        } else if !info.trace_mode && !info.readahead_mode {
            if let (Some(package), Some(activity)) = (info.package.clone(), info.activity.clone()) {
                self.begin_decision(seq, &mut info, &package, &activity).await;
            }
        }

        self.launches.insert(seq, info);
    }

    async fn on_activity_launch_finished(&mut self, seq: u64, ts_ns: i64) {
        let Some(mut info) = self.launches.remove(&seq) else { return };
        if info.blacklisted {
            return;
        }

        if info.activity_id.is_none() {
            if let (Some(package), Some(activity)) = (info.package.clone(), info.activity.clone()) {
                self.ensure_ids(&mut info, &package, &activity).await;
            }
        }
        let Some(activity_id) = info.activity_id else {
            log::warn!("ActivityLaunchFinished with no resolvable component for sequence {seq}");
            return;
        };

        let temperature = match info.temperature.unwrap_or(Temperature::Cold) {
            Temperature::Cold => iorap_core::store::Temperature::Cold,
            Temperature::Warm => iorap_core::store::Temperature::Warm,
            Temperature::Hot => iorap_core::store::Temperature::Hot,
        };

        match self
            .store
            .insert_history(activity_id, temperature, info.trace_mode, info.readahead_mode, info.intent_started_ns)
            .await
        {
            Ok(history_id) => {
                if let Err(e) = self.store.update_total_time(history_id, ts_ns).await {
                    log::warn!("failed to record total_time_ns: {e}");
                }
                info.history_cell.resolve(history_id);
                self.recent_history_id = Some(history_id);
            }
            Err(e) => log::warn!("failed to insert launch history row: {e}"),
        }
    }

    async fn on_report_fully_drawn(&mut self, ts_ns: i64) {
        let Some(history_id) = self.recent_history_id.take() else {
            log::warn!("dangling ReportFullyDrawn event with no preceding ActivityLaunchFinished");
            return;
        };
        if let Err(e) = self.store.update_report_fully_drawn(history_id, ts_ns).await {
            log::warn!("failed to record report_fully_drawn_ns: {e}");
        }
    }

    async fn on_aborted(&mut self, seq: u64) {
        if let Some(mut info) = self.launches.remove(&seq) {
            self.abort_trace(&mut info);
            self.abort_readahead(&mut info).await;
        }
    }

    fn abort_trace(&self, info: &mut LaunchInfo) {
        if info.trace_mode {
            info.history_cell.poison();
            info.trace_mode = false;
        }
    }

    async fn abort_readahead(&self, info: &mut LaunchInfo) {
        if let Some(session_id) = info.session_id.take() {
            if let Some(client) = &self.prefetch_client {
                if let Err(e) = client.destroy_session(session_id).await {
                    log::warn!("failed to destroy readahead session {session_id}: {e}");
                }
            }
        }
        info.readahead_mode = false;
    }

    async fn ensure_ids(&self, info: &mut LaunchInfo, package: &str, activity: &str) {
        let version = self.package_versions.get_or_query_package_version(package).await.unwrap_or(-1);
        match self.store.insert_or_get_package(package, version).await {
            Ok(package_id) => match self.store.insert_or_get_activity(package_id, activity).await {
                Ok(activity_id) => {
                    info.activity_id = Some(activity_id);
                    info.vcn = Some(VersionedComponentName::new(package, activity, version));
                }
                Err(e) => log::warn!("failed to resolve activity id for {package}/{activity}: {e}"),
            },
            Err(e) => log::warn!("failed to resolve package id for {package}: {e}"),
        }
    }

    /// The optimistic decision from §4.7: DB-registered compiled trace
    /// first, prebuilt-on-disk fallback second; readahead wins over
    /// tracing whenever a usable compiled trace exists.
    async fn begin_decision(&self, seq: u64, info: &mut LaunchInfo, package: &str, activity: &str) {
        self.ensure_ids(info, package, activity).await;
        let cfg = self.config.current();

        let mut compiled_path = None;
        if cfg.readahead_enable {
            if let Some(activity_id) = info.activity_id {
                match self.store.select_live_prefetch_file(activity_id).await {
                    Ok(Some(row)) => compiled_path = Some(PathBuf::from(row.file_path)),
                    Ok(None) => {}
                    Err(e) => log::warn!("failed to query prefetch file for {package}/{activity}: {e}"),
                }
            }
            if compiled_path.is_none() {
                let prebuilt = prebuilt_trace_path(package);
                if prebuilt.exists() {
                    compiled_path = Some(prebuilt);
                }
            }
        }

        if let (Some(path), Some(client)) = (&compiled_path, &self.prefetch_client) {
            let session_id = client.allocate_session_id();
            let description = format!("{package}/{activity}");
            match client.create_fd_session(session_id, description, path).await {
                Ok(()) => {
                    info.readahead_mode = true;
                    info.session_id = Some(session_id);
                }
                Err(e) => log::warn!("failed to start readahead session for {package}/{activity}: {e}"),
            }
        } else if cfg.perfetto_enable && !info.readahead_mode {
            if let Some(vcn) = &info.vcn {
                info.trace_mode = true;
                self.io_worker.spawn_capture(
                    self.trace_producer.clone(),
                    seq,
                    TRACE_CAPTURE_WINDOW,
                    vcn.clone(),
                    info.history_cell.clone(),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{IntentComponent, LaunchEventKind};
    use async_trait::async_trait;

    struct NoTrace;
    #[async_trait]
    impl TraceProducer for NoTrace {
        async fn capture(&self, _sequence_id: u64, _window: Duration) -> Option<Vec<u8>> {
            None
        }
    }

    struct NoPackageManager;
    #[async_trait::async_trait]
    impl crate::events::PackageManager for NoPackageManager {
        async fn get_version_code_for_package(&self, _name: &str) -> Option<i64> {
            None
        }
        async fn get_all_packages(&self) -> Vec<String> {
            Vec::new()
        }
    }

    async fn test_pipeline() -> (Pipeline, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(&dir.path().join("iorapd.db")).await.unwrap());
        let config = ConfigHandle::new(dir.path().join("missing.toml"));
        let package_versions = Arc::new(PackageVersionMap::new(Arc::new(NoPackageManager)));
        let pipeline = Pipeline::new(
            store,
            config,
            dir.path().join("root"),
            package_versions,
            None,
            Arc::new(NoTrace),
        );
        (pipeline, dir)
    }

    fn intent_started(seq: u64, ts: i64, package: &str, class: &str) -> AppLaunchEvent {
        AppLaunchEvent {
            sequence_id: seq,
            timestamp_nanos: ts,
            kind: LaunchEventKind::IntentStarted {
                component: Some(IntentComponent {
                    package_name: package.to_string(),
                    class_name: class.to_string(),
                }),
            },
        }
    }

    fn activity_launched(seq: u64, ts: i64, package: &str, activity: &str, temperature: Temperature) -> AppLaunchEvent {
        AppLaunchEvent {
            sequence_id: seq,
            timestamp_nanos: ts,
            kind: LaunchEventKind::ActivityLaunched {
                title: ActivityTitle { package_name: package.to_string(), activity_name: activity.to_string() },
                temperature,
            },
        }
    }

    fn finished(seq: u64, ts: i64) -> AppLaunchEvent {
        AppLaunchEvent { sequence_id: seq, timestamp_nanos: ts, kind: LaunchEventKind::ActivityLaunchFinished }
    }

    #[tokio::test]
    async fn full_cold_launch_inserts_history_row() {
        let (mut pipeline, _dir) = test_pipeline().await;
        pipeline.handle_launch_event(intent_started(1, 100, "com.foo", ".Main")).await;
        pipeline
            .handle_launch_event(activity_launched(1, 150, "com.foo", "com.foo.Main", Temperature::Cold))
            .await;
        pipeline.handle_launch_event(finished(1, 300)).await;

        let pkg_id = pipeline.store.insert_or_get_package("com.foo", -1).await.unwrap();
        let act_id = pipeline.store.insert_or_get_activity(pkg_id, "com.foo.Main").await.unwrap();
        let rows = pipeline.store.select_activity_history_for_compile(act_id).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].intent_started_ns, Some(100));
    }

    #[tokio::test]
    async fn warm_launch_still_inserts_a_row_but_is_not_compilable() {
        let (mut pipeline, _dir) = test_pipeline().await;
        pipeline.handle_launch_event(intent_started(2, 10, "com.bar", ".Main")).await;
        pipeline
            .handle_launch_event(activity_launched(2, 20, "com.bar", "com.bar.Main", Temperature::Warm))
            .await;
        pipeline.handle_launch_event(finished(2, 40)).await;

        let pkg_id = pipeline.store.insert_or_get_package("com.bar", -1).await.unwrap();
        let act_id = pipeline.store.insert_or_get_activity(pkg_id, "com.bar.Main").await.unwrap();
        let compilable = pipeline.store.select_activity_history_for_compile(act_id).await.unwrap();
        assert!(compilable.is_empty());
    }

    #[tokio::test]
    async fn blacklisted_package_produces_no_row() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(&dir.path().join("iorapd.db")).await.unwrap());
        let config_path = dir.path().join("iorapd.toml");
        std::fs::write(&config_path, "blacklist_packages = \"com.blocked\"\n").unwrap();
        let config = ConfigHandle::new(config_path);
        let package_versions = Arc::new(PackageVersionMap::new(Arc::new(NoPackageManager)));
        let mut pipeline = Pipeline::new(store.clone(), config, dir.path().join("root"), package_versions, None, Arc::new(NoTrace));

        pipeline.handle_launch_event(intent_started(3, 1, "com.blocked", ".Main")).await;
        pipeline
            .handle_launch_event(activity_launched(3, 2, "com.blocked", "com.blocked.Main", Temperature::Cold))
            .await;
        pipeline.handle_launch_event(finished(3, 3)).await;

        let pkg_id = store.insert_or_get_package("com.blocked", -1).await.unwrap();
        let act_id = store.insert_or_get_activity(pkg_id, "com.blocked.Main").await.unwrap();
        assert!(store.select_activity_history_for_compile(act_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn report_fully_drawn_without_finish_warns_and_is_noop() {
        let (mut pipeline, _dir) = test_pipeline().await;
        pipeline
            .handle_launch_event(AppLaunchEvent { sequence_id: 9, timestamp_nanos: 1, kind: LaunchEventKind::ReportFullyDrawn })
            .await;
        assert!(pipeline.recent_history_id.is_none());
    }
}
