//! Bus topics, their payloads, queue names and key-value key layout.
//!
//! Topics:
//! - `new-submission`     a submission was queued for the coordinator
//! - `new-work-item`      an issue exists and wants candidate solutions
//! - `solution-generated` one solver's candidate for one issue
//! - `result-available`   a submission's analysis finished

use serde::{Deserialize, Serialize};

use crate::model::{AnalysisResult, Candidate, ChangeSubmission, TrackingId};
use crate::substrate::Event;

/// Durable queue of pending submissions, consumed only by the coordinator.
pub const SUBMISSION_QUEUE: &str = "submission-queue";

/// Work that exhausted its retry ceiling.
pub const DEAD_LETTER_QUEUE: &str = "dead-letter";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewSubmission {
    pub tracking_id: TrackingId,
}

impl Event for NewSubmission {
    const TOPIC: &'static str = "new-submission";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewWorkItem {
    pub issue_key: String,
    /// Absent when the evaluator re-requests solving.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracking_id: Option<TrackingId>,
}

impl Event for NewWorkItem {
    const TOPIC: &'static str = "new-work-item";
}

/// Payload of `solution-generated`.
pub type SolutionGenerated = Candidate;

impl Event for Candidate {
    const TOPIC: &'static str = "solution-generated";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultAvailable {
    pub tracking_id: TrackingId,
    pub result: AnalysisResult,
}

impl Event for ResultAvailable {
    const TOPIC: &'static str = "result-available";
}

/// Queue item: the original submission plus how many times it has been tried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryEnvelope {
    pub tracking_id: TrackingId,
    pub submission: ChangeSubmission,
    #[serde(default)]
    pub attempt: u32,
}

impl RetryEnvelope {
    pub fn first(tracking_id: TrackingId, submission: ChangeSubmission) -> Self {
        Self {
            tracking_id,
            submission,
            attempt: 0,
        }
    }

    /// Same payload, one more attempt on the clock.
    pub fn next_attempt(&self) -> Self {
        Self {
            attempt: self.attempt + 1,
            ..self.clone()
        }
    }
}

/// What ends up on the dead-letter queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeadLetter {
    Submission { envelope: RetryEnvelope, error: String },
    Evaluation { issue_key: String, attempts: u64 },
    /// Queue item that is not a valid envelope.
    Undecodable { payload: String },
}

/// Key-value key layout.
pub mod keys {
    use crate::model::TrackingId;

    /// Solver marker: this style already handled this issue.
    pub fn solver_marker(style: &str, issue_key: &str) -> String {
        format!("marker:{style}:{issue_key}")
    }

    /// Coordinator marker: this submission was (or is being) processed.
    pub fn submission_marker(tracking_id: &TrackingId) -> String {
        format!("marker:doc:{tracking_id}")
    }

    /// Candidate map for one issue, field = style.
    pub fn solution_set(issue_key: &str) -> String {
        format!("solutionset:{issue_key}")
    }

    /// Candidate map for one re-solve round. Round 0 is [`solution_set`].
    pub fn solution_set_round(issue_key: &str, round: u64) -> String {
        match round {
            0 => solution_set(issue_key),
            n => format!("solutionset:{issue_key}:round:{n}"),
        }
    }

    /// Held while one evaluator judges a complete set for this issue.
    pub fn evaluating(issue_key: &str) -> String {
        format!("evaluating:{issue_key}")
    }

    /// Malformed-judge re-solve counter for one issue. Its value is also the
    /// current round.
    pub fn judge_attempts(issue_key: &str) -> String {
        format!("judge-attempts:{issue_key}")
    }

    /// Cached serialized result for gateway lookups.
    pub fn result(tracking_id: &TrackingId) -> String {
        format!("result:{tracking_id}")
    }
}
