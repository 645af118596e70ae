//! The "io" scheduler from spec.md §4.7/§5: a single task that serializes
//! trace-stream writes and raw-trace file installation, fed by
//! short-lived capture tasks. Capturing a trace (the kernel producer's
//! ~10s window) and writing the resulting bytes to disk are kept on
//! separate tasks on purpose: concurrent launches must be able to capture
//! in parallel, but the actual file + DB write is what the spec calls out
//! as needing to be serialized onto one worker.

use crate::history_cell::{HistoryCell, HistoryOutcome};
use iorap_core::component::VersionedComponentName;
use iorap_core::store::Store;
use iorap_core::ConfigHandle;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::events::TraceProducer;

enum IoJob {
    WriteRawTrace {
        vcn: VersionedComponentName,
        bytes: Vec<u8>,
        history_cell: HistoryCell,
    },
}

#[derive(Clone)]
pub struct IoWorker {
    tx: mpsc::UnboundedSender<IoJob>,
}

impl IoWorker {
    pub fn spawn(store: Arc<Store>, config: ConfigHandle, root_dir: PathBuf) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<IoJob>();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                match job {
                    IoJob::WriteRawTrace { vcn, bytes, history_cell } => {
                        let history_id = match history_cell.wait().await {
                            HistoryOutcome::Resolved(id) => id,
                            HistoryOutcome::Poisoned => continue,
                        };
                        let max_traces = config.current().perfetto_max_traces as usize;
                        if let Err(e) = install_raw_trace(&store, &root_dir, &vcn, history_id, &bytes, max_traces).await {
                            log::warn!(
                                "failed to install raw trace for {}/{}: {e}",
                                vcn.package,
                                vcn.activity
                            );
                        }
                    }
                }
            }
        });
        Self { tx }
    }

    /// Begin a capture window for `sequence_id`. If `history_cell` is
    /// poisoned before the producer yields bytes, the capture future is
    /// dropped and nothing is ever written — this is the "unsubscribing
    /// drops the buffer" cancellation path from §5. If bytes arrive
    /// first, they're handed to the serialized writer, which itself waits
    /// for (or accepts an already-settled) resolution before touching
    /// disk.
    pub fn spawn_capture(
        &self,
        producer: Arc<dyn TraceProducer>,
        sequence_id: u64,
        window: Duration,
        vcn: VersionedComponentName,
        history_cell: HistoryCell,
    ) {
        let tx = self.tx.clone();
        let cancel_on = history_cell.clone();
        tokio::spawn(async move {
            let bytes = tokio::select! {
                _ = wait_for_poison(&cancel_on) => return,
                bytes = producer.capture(sequence_id, window) => bytes,
            };
            let Some(bytes) = bytes else {
                log::debug!("trace producer declined capture for sequence {sequence_id}");
                return;
            };
            let _ = tx.send(IoJob::WriteRawTrace { vcn, bytes, history_cell });
        });
    }
}

/// Resolves only on poisoning; a resolved cell blocks forever here so the
/// `select!` in `spawn_capture` never mistakes a normal finish for a
/// cancellation.
async fn wait_for_poison(cell: &HistoryCell) {
    loop {
        match cell.wait().await {
            HistoryOutcome::Poisoned => return,
            HistoryOutcome::Resolved(_) => std::future::pending::<()>().await,
        }
    }
}

async fn install_raw_trace(
    store: &Store,
    root_dir: &std::path::Path,
    vcn: &VersionedComponentName,
    history_id: i64,
    bytes: &[u8],
    max_traces: usize,
) -> anyhow::Result<()> {
    use anyhow::Context;

    let timestamp_ns = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .context("system clock before epoch")?
        .as_nanos() as u64;

    iorap_core::layout::ensure_component_dirs(root_dir, vcn).context("creating component directories")?;
    let path = vcn.raw_trace_path(root_dir, timestamp_ns);
    std::fs::write(&path, bytes).with_context(|| format!("writing raw trace to {}", path.display()))?;

    store
        .insert_raw_trace(history_id, path.to_str().context("non-utf8 raw trace path")?)
        .await
        .context("inserting raw_trace row")?;
    store
        .delete_older_raw_traces(vcn, max_traces)
        .await
        .context("pruning older raw traces")?;
    Ok(())
}
