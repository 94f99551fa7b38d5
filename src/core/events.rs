use std::{fmt, time::Duration};

use crate::core::domain::{Outcome, SubmissionId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Stage {
    Queued,
    Admitted,
    Provisioned,
    Executed,
    Evaluated,
    Released,
    Completed,
    Rejected,
    Aborted,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Queued => "queued",
            Stage::Admitted => "admitted",
            Stage::Provisioned => "provisioned",
            Stage::Executed => "executed",
            Stage::Evaluated => "evaluated",
            Stage::Released => "released",
            Stage::Completed => "completed",
            Stage::Rejected => "rejected",
            Stage::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JudgeEvent {
    pub submission_id: SubmissionId,
    pub stage: Stage,
    pub outcome: Option<Outcome>,
    /// Time spent in the stage that just finished.
    pub duration: Duration,
}

impl JudgeEvent {
    pub fn new(submission_id: SubmissionId, stage: Stage, duration: Duration) -> Self {
        Self {
            submission_id,
            stage,
            outcome: None,
            duration,
        }
    }

    pub fn with_outcome(self, outcome: Outcome) -> Self {
        Self {
            outcome: Some(outcome),
            ..self
        }
    }
}

/// Receives structured pipeline events. The format of whatever sits behind
/// it (logs, metrics) is up to the implementation.
pub trait EventSink: std::fmt::Debug + Send + Sync {
    fn emit(&self, event: JudgeEvent);
}

/// Emits every event as a structured tracing record.
#[derive(Debug, Clone, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: JudgeEvent) {
        tracing::info!(
            submission_id = %event.submission_id,
            stage = %event.stage,
            outcome = ?event.outcome,
            duration_ms = event.duration.as_millis() as u64,
            "judge event"
        );
    }
}
