//! Per-launch-sequence state machine (§4.7). Illegal transitions are
//! rewritten rather than merely rejected, matching the source's
//! `EventManager::OnIntentStarted`/etc. "defender" naming: the defender's
//! job is to keep the rest of the pipeline from ever observing an
//! impossible sequence, not to bounce bad input back to the caller.

use crate::events::LaunchEventKind;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchState {
    Uninitialized,
    IntentStarted,
    ActivityLaunched,
    ActivityLaunchFinished,
    IntentFailed,
    ActivityLaunchCancelled,
    ReportFullyDrawn,
}

/// What the defender decided to do with an incoming event kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Accept the event as-is; the new state is the event's own kind.
    Accept(LaunchState),
    /// Silently rewrite the event to a different kind before the pipeline
    /// sees it (body untouched, only the "as-if" kind changes).
    Rewrite(LaunchState),
    /// Drop the event entirely; state is unchanged.
    Reject,
}

fn kind_state(kind: &LaunchEventKind) -> LaunchState {
    match kind {
        LaunchEventKind::IntentStarted { .. } => LaunchState::IntentStarted,
        LaunchEventKind::IntentFailed => LaunchState::IntentFailed,
        LaunchEventKind::ActivityLaunched { .. } => LaunchState::ActivityLaunched,
        LaunchEventKind::ActivityLaunchFinished => LaunchState::ActivityLaunchFinished,
        LaunchEventKind::ActivityLaunchCancelled => LaunchState::ActivityLaunchCancelled,
        LaunchEventKind::ReportFullyDrawn => LaunchState::ReportFullyDrawn,
    }
}

/// Apply the transition table in spec.md §4.7 against `current` for an
/// incoming event of kind `next`. Returns the decision; callers advance
/// their stored `LaunchState` to whatever `Decision` carries (or leave it
/// alone on `Reject`).
pub fn transition(current: LaunchState, next: &LaunchEventKind) -> Decision {
    let incoming = kind_state(next);
    use LaunchState::*;
    match current {
        Uninitialized | IntentFailed | ActivityLaunchCancelled | ReportFullyDrawn => {
            if incoming == IntentStarted {
                Decision::Accept(IntentStarted)
            } else {
                Decision::Reject
            }
        }
        IntentStarted => match incoming {
            IntentFailed => Decision::Accept(IntentFailed),
            ActivityLaunched => Decision::Accept(ActivityLaunched),
            _ => Decision::Rewrite(IntentFailed),
        },
        ActivityLaunched => match incoming {
            ActivityLaunchFinished => Decision::Accept(ActivityLaunchFinished),
            ActivityLaunchCancelled => Decision::Accept(ActivityLaunchCancelled),
            _ => Decision::Rewrite(ActivityLaunchCancelled),
        },
        ActivityLaunchFinished => match incoming {
            IntentStarted => Decision::Accept(IntentStarted),
            ReportFullyDrawn => Decision::Accept(ReportFullyDrawn),
            _ => Decision::Reject,
        },
    }
}

/// Per-`sequence_id` state, owned by the worker task. A plain `HashMap`
/// rather than the source's global static, per the "global mutable state"
/// guidance in spec.md §9: the defender's memory is an explicit object the
/// pipeline owns, not a process-wide singleton.
#[derive(Debug, Default)]
pub struct Defender {
    states: HashMap<u64, LaunchState>,
}

impl Defender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state_of(&self, sequence_id: u64) -> LaunchState {
        self.states.get(&sequence_id).copied().unwrap_or(LaunchState::Uninitialized)
    }

    /// Run `kind` through the transition table for `sequence_id`, update
    /// the stored state, and return the decision so the caller knows
    /// whether (and as what) to act on the event.
    pub fn apply(&mut self, sequence_id: u64, kind: &LaunchEventKind) -> Decision {
        let current = self.state_of(sequence_id);
        let decision = transition(current, kind);
        match &decision {
            Decision::Accept(s) | Decision::Rewrite(s) => {
                self.states.insert(sequence_id, *s);
            }
            Decision::Reject => {}
        }
        decision
    }

    /// A finished launch sequence no longer needs its state tracked;
    /// called once the pipeline has fully retired a sequence_id (after
    /// `ActivityLaunchFinished`'s trace/history work completes, or on
    /// terminal cancellation).
    pub fn forget(&mut self, sequence_id: u64) {
        self.states.remove(&sequence_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{ActivityTitle, Temperature};

    fn launched() -> LaunchEventKind {
        LaunchEventKind::ActivityLaunched {
            title: ActivityTitle { package_name: "com.foo".into(), activity_name: "com.foo.Main".into() },
            temperature: Temperature::Cold,
        }
    }

    #[test]
    fn double_intent_started_rewrites_to_intent_failed() {
        let mut d = Defender::new();
        assert_eq!(
            d.apply(1, &LaunchEventKind::IntentStarted { component: None }),
            Decision::Accept(LaunchState::IntentStarted)
        );
        assert_eq!(
            d.apply(1, &LaunchEventKind::IntentStarted { component: None }),
            Decision::Rewrite(LaunchState::IntentFailed)
        );
        assert_eq!(d.state_of(1), LaunchState::IntentFailed);
    }

    #[test]
    fn uninitialized_rejects_everything_but_intent_started() {
        let mut d = Defender::new();
        assert_eq!(d.apply(1, &LaunchEventKind::ActivityLaunchFinished), Decision::Reject);
        assert_eq!(d.state_of(1), LaunchState::Uninitialized);
    }

    #[test]
    fn happy_path_runs_to_report_fully_drawn() {
        let mut d = Defender::new();
        assert!(matches!(d.apply(1, &LaunchEventKind::IntentStarted { component: None }), Decision::Accept(_)));
        assert!(matches!(d.apply(1, &launched()), Decision::Accept(_)));
        assert!(matches!(d.apply(1, &LaunchEventKind::ActivityLaunchFinished), Decision::Accept(_)));
        assert!(matches!(d.apply(1, &LaunchEventKind::ReportFullyDrawn), Decision::Accept(_)));
        assert_eq!(d.state_of(1), LaunchState::ReportFullyDrawn);
    }

    #[test]
    fn activity_launched_other_than_finish_or_cancel_rewrites_to_cancelled() {
        let mut d = Defender::new();
        d.apply(1, &LaunchEventKind::IntentStarted { component: None });
        d.apply(1, &launched());
        assert_eq!(
            d.apply(1, &LaunchEventKind::ReportFullyDrawn),
            Decision::Rewrite(LaunchState::ActivityLaunchCancelled)
        );
    }

    #[test]
    fn finished_sequence_can_restart() {
        let mut d = Defender::new();
        d.apply(1, &LaunchEventKind::IntentStarted { component: None });
        d.apply(1, &launched());
        d.apply(1, &LaunchEventKind::ActivityLaunchFinished);
        assert_eq!(
            d.apply(1, &LaunchEventKind::IntentStarted { component: None }),
            Decision::Accept(LaunchState::IntentStarted)
        );
    }

    #[test]
    fn forget_resets_to_uninitialized() {
        let mut d = Defender::new();
        d.apply(1, &LaunchEventKind::IntentStarted { component: None });
        d.forget(1);
        assert_eq!(d.state_of(1), LaunchState::Uninitialized);
    }
}
