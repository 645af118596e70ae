//! Wire-level shapes for the four external event sources this daemon
//! reacts to (§6): launch events from the OS, dex-opt events, job-scheduler
//! events, and package-change events. These are plain data; the state
//! machine that interprets them lives in `defender`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Temperature {
    Cold,
    Warm,
    Hot,
}

/// `(package_name, class_name)` as carried by an intent, before
/// canonicalization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntentComponent {
    pub package_name: String,
    pub class_name: String,
}

/// The realized component title an `ActivityLaunched` event carries, already
/// fully-qualified by the platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityTitle {
    pub package_name: String,
    pub activity_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LaunchEventKind {
    IntentStarted { component: Option<IntentComponent> },
    IntentFailed,
    ActivityLaunched { title: ActivityTitle, temperature: Temperature },
    ActivityLaunchFinished,
    ActivityLaunchCancelled,
    ReportFullyDrawn,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppLaunchEvent {
    pub sequence_id: u64,
    pub timestamp_nanos: i64,
    pub kind: LaunchEventKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DexOptEvent {
    pub package_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobEventType {
    Start,
    Stop,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobScheduledEvent {
    pub event_type: JobEventType,
    pub job_id: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageChangeEvent {
    pub package_name: String,
    pub version: i64,
    pub is_deleted: bool,
    pub last_update_time_millis: i64,
}

/// Anything that can hand the pipeline a stream of platform events. The
/// real platform binder interface is out of scope (spec.md §1 Non-goals);
/// this trait is the seam a test double or a future binder client plugs
/// into, matching the source lineage's preference for trait objects at
/// process boundaries rather than a concrete socket type baked into the
/// pipeline.
#[async_trait::async_trait]
pub trait LaunchEventSource: Send + Sync {
    async fn next_launch_event(&self) -> Option<AppLaunchEvent>;
}

/// The kernel trace producer, abstracted to "subscribe for a window,
/// produce raw trace bytes". `iorapd` never talks BPF directly (C2's BPF
/// data source is out of scope per spec.md §4.2); it only needs this
/// narrow contract to drive C7's trace-mode branch.
#[async_trait::async_trait]
pub trait TraceProducer: Send + Sync {
    /// Begin a capture window for `sequence_id`; returns the raw trace
    /// bytes once the window elapses or the subscription is cancelled
    /// early. `None` means the producer rejected the request (e.g. kernel
    /// tracing unsupported) and the caller must silently degrade to no-op.
    async fn capture(&self, sequence_id: u64, window: std::time::Duration) -> Option<Vec<u8>>;
}

/// The real package manager binder interface (spec.md §1 Non-goal); this
/// trait is the narrow contract `PackageVersionMap` queries through.
#[async_trait::async_trait]
pub trait PackageManager: Send + Sync {
    async fn get_version_code_for_package(&self, name: &str) -> Option<i64>;
    async fn get_all_packages(&self) -> Vec<String>;
}
