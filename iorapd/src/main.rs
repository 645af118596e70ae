//! Launch-event orchestrator. Reads a stream of JSON-lines events (the
//! concrete stand-in for the platform's binder-delivered launch/job/
//! package events, spec.md §1 Non-goals), drives the launch pipeline, and
//! supervises the `iorap-prefetcherd` helper the way `cognitod` supervises
//! its own long-running workers: spawn, reconnect, restart on exit.

use anyhow::Context;
use clap::Parser;
use iorapd::events::{
    AppLaunchEvent, DexOptEvent, JobEventType, JobScheduledEvent, PackageChangeEvent, PackageManager, TraceProducer,
};
use iorapd::{DaemonConfig, MaintenanceController, PackageVersionMap, Pipeline, PrefetchClient};
use serde::Deserialize;
use std::collections::HashMap;
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};

/// One line of the event stream. `PackageManager`'s own query surface
/// (`GetVersionCodeForPackage`/`GetAllPackages`) is served out of the
/// `--packages` fixture file instead of this stream, matching the
/// source's split between the event-delivery channel and the separate
/// binder RPC it makes on demand.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum DaemonEvent {
    Launch(AppLaunchEvent),
    DexOpt(DexOptEvent),
    Job(JobScheduledEvent),
    PackageChange(PackageChangeEvent),
}

#[derive(Parser, Debug)]
#[command(name = "iorapd")]
struct Args {
    /// Newline-delimited JSON event file (default stdin).
    #[arg(long)]
    events: Option<PathBuf>,

    /// Newline-delimited JSON `{"name": ..., "version": ...}` fixture used
    /// to answer package-manager queries (default: no packages known).
    #[arg(long)]
    packages: Option<PathBuf>,

    /// Set verbosity (default off).
    #[arg(long, short)]
    verbose: bool,

    /// Wait for a keystroke before continuing (default off); useful for
    /// attaching a debugger.
    #[arg(long, short)]
    wait: bool,
}

#[derive(Debug, Deserialize)]
struct PackageFixtureEntry {
    name: String,
    version: i64,
}

/// A fixed snapshot of installed packages, standing in for the real
/// package-manager binder interface (spec.md §1 Non-goal).
struct FixturePackageManager {
    packages: HashMap<String, i64>,
}

#[async_trait::async_trait]
impl PackageManager for FixturePackageManager {
    async fn get_version_code_for_package(&self, name: &str) -> Option<i64> {
        self.packages.get(name).copied()
    }

    async fn get_all_packages(&self) -> Vec<String> {
        self.packages.keys().cloned().collect()
    }
}

/// The kernel trace producer is out of scope (spec.md §1 Non-goal); this
/// default always declines, which the pipeline treats as "tracing
/// silently degrades to no-op" per §7.
struct NullTraceProducer;

#[async_trait::async_trait]
impl TraceProducer for NullTraceProducer {
    async fn capture(&self, _sequence_id: u64, _window: Duration) -> Option<Vec<u8>> {
        None
    }
}

fn load_packages(path: Option<&PathBuf>) -> anyhow::Result<HashMap<String, i64>> {
    let Some(path) = path else { return Ok(HashMap::new()) };
    let file = std::fs::File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut packages = HashMap::new();
    for line in std::io::BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let entry: PackageFixtureEntry = serde_json::from_str(&line)?;
        packages.insert(entry.name, entry.version);
    }
    Ok(packages)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.verbose {
        std::env::set_var("RUST_LOG", "debug");
    }
    env_logger::init();

    if args.wait {
        eprintln!("Self pid: {}", std::process::id());
        eprintln!("Press enter to continue...");
        let mut line = String::new();
        let _ = std::io::stdin().read_line(&mut line);
    }

    let config = DaemonConfig::load();
    std::fs::create_dir_all(&config.root_dir)
        .with_context(|| format!("creating root dir {}", config.root_dir.display()))?;
    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("creating db dir {}", parent.display()))?;
    }

    let store = Arc::new(
        iorap_core::store::Store::open(&config.db_path)
            .await
            .with_context(|| format!("opening store at {}", config.db_path.display()))?,
    );
    let dex_opt_store = store.clone();

    let package_manager: Arc<dyn PackageManager> =
        Arc::new(FixturePackageManager { packages: load_packages(args.packages.as_ref())? });
    let package_versions = Arc::new(PackageVersionMap::new(package_manager));

    let prefetch_client = spawn_prefetcherd(&config).await;

    let mut pipeline = Pipeline::new(
        store.clone(),
        config.properties.clone(),
        config.root_dir.clone(),
        package_versions.clone(),
        prefetch_client,
        Arc::new(NullTraceProducer),
    );

    let maintenance = MaintenanceController::new(
        store,
        config.properties.clone(),
        package_versions,
        config.root_dir.clone(),
        config.compiler_path.clone(),
    );

    let mut lines = read_events(args.events.as_ref()).await?;
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let event: DaemonEvent = match serde_json::from_str(&line) {
            Ok(event) => event,
            Err(e) => {
                log::warn!("dropping malformed event line: {e}");
                continue;
            }
        };
        match event {
            DaemonEvent::Launch(launch) => pipeline.handle_launch_event(launch).await,
            DaemonEvent::PackageChange(change) => pipeline.handle_package_change(change).await,
            DaemonEvent::DexOpt(dexopt) => handle_dex_opt(&dex_opt_store, dexopt).await,
            DaemonEvent::Job(job) => handle_job(&maintenance, job).await,
        }
    }

    Ok(())
}

/// A dex-opt recompile invalidates whatever plan was built against the
/// previous on-disk layout, the same way `handle_package_change` does for
/// a same-version package update.
async fn handle_dex_opt(store: &iorap_core::store::Store, event: DexOptEvent) {
    log::info!("dex-opt event for {}, invalidating its cached plan", event.package_name);
    if let Err(e) = store.delete_stale_package(&event.package_name).await {
        log::warn!("failed to invalidate {} after dex-opt: {e}", event.package_name);
    }
}

async fn handle_job(maintenance: &MaintenanceController, event: JobScheduledEvent) {
    match event.event_type {
        JobEventType::Start => {
            log::info!("job {} triggered maintenance", event.job_id);
            let report = maintenance.run().await;
            log::info!("maintenance finished: {report:?}");
        }
        JobEventType::Stop => {
            log::debug!("job {} stopped", event.job_id);
        }
    }
}

async fn read_events(path: Option<&PathBuf>) -> anyhow::Result<tokio::io::Lines<BufReader<Box<dyn tokio::io::AsyncRead + Unpin + Send>>>> {
    let reader: Box<dyn tokio::io::AsyncRead + Unpin + Send> = match path {
        Some(path) => Box::new(
            tokio::fs::File::open(path)
                .await
                .with_context(|| format!("opening events file {}", path.display()))?,
        ),
        None => Box::new(tokio::io::stdin()),
    };
    Ok(BufReader::new(reader).lines())
}

/// Fork `iorap-prefetcherd`, bound to a fresh `AF_UNIX` socket, and
/// connect a client to it. Matches §1.5: the helper is the one persistent
/// child; a connect failure degrades to "no readahead this run" rather
/// than failing the whole daemon, consistent with §7's "prefetch silently
/// degrades to no-op" policy.
async fn spawn_prefetcherd(config: &DaemonConfig) -> Option<Arc<PrefetchClient>> {
    if let Some(parent) = config.prefetcherd_socket_path.parent() {
        let _ = tokio::fs::create_dir_all(parent).await;
    }
    let _ = std::fs::remove_file(&config.prefetcherd_socket_path);

    let mut command = tokio::process::Command::new(&config.prefetcherd_path);
    command.arg("--socket-path").arg(&config.prefetcherd_socket_path);
    let child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            log::warn!(
                "failed to spawn {}: {e}; readahead is disabled for this run",
                config.prefetcherd_path.display()
            );
            return None;
        }
    };
    std::mem::forget(child);

    for _ in 0..20 {
        if let Ok(client) = PrefetchClient::connect(&config.prefetcherd_socket_path) {
            return Some(Arc::new(client));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    log::warn!("prefetcherd never became reachable; readahead is disabled for this run");
    None
}
