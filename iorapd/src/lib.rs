//! Launch-event orchestrator: the defender state machine, the trace/
//! readahead decision pipeline, the maintenance controller, and the glue
//! that spawns `iorap-compiler` and `iorap-prefetcherd` as children.

pub mod config;
pub mod defender;
pub mod events;
pub mod history_cell;
pub mod io_worker;
pub mod maintenance;
pub mod package_version;
pub mod pipeline;
pub mod prefetch_client;

pub use config::DaemonConfig;
pub use defender::{Decision, Defender, LaunchState};
pub use events::{
    ActivityTitle, AppLaunchEvent, DexOptEvent, IntentComponent, JobEventType, JobScheduledEvent,
    LaunchEventKind, LaunchEventSource, PackageChangeEvent, PackageManager, Temperature, TraceProducer,
};
pub use history_cell::{HistoryCell, HistoryOutcome};
pub use maintenance::{MaintenanceController, MaintenanceReport};
pub use package_version::PackageVersionMap;
pub use pipeline::Pipeline;
pub use prefetch_client::PrefetchClient;
