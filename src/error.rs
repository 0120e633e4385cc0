use std::time::Duration;

use crate::phase::PhaseStatus;

/// Every failure the engine can report.
///
/// Per-request failures (`Timeout`) stay inside the request/session boundary and only show
/// up in statistics. Systemic ones (`PoolStartup`, `SchedulingAnomaly`) reach the runner's
/// error handler so an operator can decide what to do.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("phase {phase} cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        phase: String,
        from: PhaseStatus,
        to: PhaseStatus,
    },

    #[error("unknown phase: {0}")]
    UnknownPhase(String),

    #[error("connection pool {pool} failed to start: {reason}")]
    PoolStartup { pool: String, reason: String },

    #[error(
        "jitter watchdog was not invoked for {} ms (threshold is {} ms); check GC/CPU settings",
        delay.as_millis(),
        threshold.as_millis()
    )]
    SchedulingAnomaly { delay: Duration, threshold: Duration },

    #[error("request timed out")]
    Timeout,

    #[error("session #{0} is not bound to any phase")]
    SessionNotBound(usize),

    #[error("task was dropped before completing, the event loop is probably shut down")]
    TaskDropped,

    #[error("step error: {0}")]
    Step(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
