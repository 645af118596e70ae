//! The "history-id subject" from spec.md §4.7/§9: a hot, single-value
//! deferred stream that `IntentStarted` opens, `ActivityLaunchFinished`
//! resolves with the freshly-inserted history row id, and
//! `IntentFailed`/`ActivityLaunchCancelled` poison instead. Any in-flight
//! trace writer awaiting the id sees either the resolved value or the
//! poison, and terminates accordingly without leaving an orphan file.
//!
//! Modeled as a one-shot cell rather than a generic broadcast channel:
//! exactly one resolver and at most a handful of awaiters (the io worker)
//! per launch sequence, so `tokio::sync::Notify` plus a `Mutex`-guarded
//! outcome slot is simpler than pulling in a full oneshot-per-clone
//! broadcast primitive.

use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryOutcome {
    Resolved(i64),
    Poisoned,
}

struct Inner {
    outcome: parking_lot::Mutex<Option<HistoryOutcome>>,
    notify: Notify,
}

/// A clonable handle to one launch sequence's deferred history id. Cloning
/// shares the same underlying cell; every clone observes the same
/// resolution.
#[derive(Clone)]
pub struct HistoryCell {
    inner: Arc<Inner>,
}

impl HistoryCell {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                outcome: parking_lot::Mutex::new(None),
                notify: Notify::new(),
            }),
        }
    }

    /// Resolve the cell with the launch's history row id. A cell can only
    /// be resolved once; subsequent calls are no-ops (mirrors a replay(1)
    /// subject, which ignores re-emission after its single value lands).
    pub fn resolve(&self, history_id: i64) {
        let mut guard = self.inner.outcome.lock();
        if guard.is_none() {
            *guard = Some(HistoryOutcome::Resolved(history_id));
            self.inner.notify.notify_waiters();
        }
    }

    /// Poison the cell: any current or future awaiter sees `Poisoned` and
    /// must abandon its in-flight work without writing a row.
    pub fn poison(&self) {
        let mut guard = self.inner.outcome.lock();
        if guard.is_none() {
            *guard = Some(HistoryOutcome::Poisoned);
            self.inner.notify.notify_waiters();
        }
    }

    /// Wait for resolution or poisoning. Returns immediately if the cell
    /// was already settled before this call (replay semantics).
    pub async fn wait(&self) -> HistoryOutcome {
        loop {
            if let Some(outcome) = *self.inner.outcome.lock() {
                return outcome;
            }
            let notified = self.inner.notify.notified();
            if let Some(outcome) = *self.inner.outcome.lock() {
                return outcome;
            }
            notified.await;
        }
    }
}

impl Default for HistoryCell {
    fn default() -> Self {
        Self::new()
    }
}
