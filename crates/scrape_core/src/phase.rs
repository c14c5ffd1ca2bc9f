use serde::{Deserialize, Serialize};

/// Lifecycle of one orchestration run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    #[default]
    Init,
    Dispatch,
    Iterating,
    Aggregating,
    Done,
    Failed,
}

impl RunPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunPhase::Done | RunPhase::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunEvent {
    /// Request passed validation.
    Validated,
    /// A configuration-level error; only legal before iterating starts.
    Rejected,
    /// Acquisition path chosen and targets vetted.
    Dispatched,
    IterationsFinished,
    /// Aggregated records handed off (or the empty set acknowledged).
    Exported,
}

/// Pure transition function. Events that do not apply to the current phase
/// leave it unchanged.
pub fn advance(phase: RunPhase, event: RunEvent) -> RunPhase {
    match (phase, event) {
        (RunPhase::Init, RunEvent::Validated) => RunPhase::Dispatch,
        (RunPhase::Init | RunPhase::Dispatch, RunEvent::Rejected) => RunPhase::Failed,
        (RunPhase::Dispatch, RunEvent::Dispatched) => RunPhase::Iterating,
        (RunPhase::Iterating, RunEvent::IterationsFinished) => RunPhase::Aggregating,
        (RunPhase::Aggregating, RunEvent::Exported) => RunPhase::Done,
        (current, _) => current,
    }
}
