//! Solver Pool worker.
//!
//! One worker per style. A worker takes the `(style, issue_key)` marker
//! before any work, so concurrent or repeated deliveries of the same work
//! item cost at most one generation per style. Failures release the marker
//! and drop the event.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tracing::{debug, info, warn};

use crate::events::{keys, NewWorkItem};
use crate::llm::{GenerateRequest, LanguageService};
use crate::model::Candidate;
use crate::substrate::{Substrate, SubstrateError};
use crate::telemetry;
use crate::tracker::{IssueSnapshot, TicketingService};

const DEFAULT_TEMPERATURE: f32 = 0.6;

const SOLVER_SYSTEM: &str = "You are an experienced software engineer. Given a work item, \
describe how to implement it: the approach, the code changes and how to verify them.";

/// How a style shapes generation.
#[derive(Debug, Clone, PartialEq)]
pub struct StyleProfile {
    pub instruction: String,
    pub temperature: f32,
}

impl StyleProfile {
    pub fn for_style(style: &str) -> Self {
        let (instruction, temperature) = match style {
            "balanced" => (
                "Balance completeness and brevity. Cover the main steps and the key risks.",
                0.6,
            ),
            "terse" => (
                "Be as short as possible. Give only the essential steps, no commentary.",
                0.3,
            ),
            "thorough" => (
                "Be exhaustive. Cover edge cases, migration steps, tests and rollout.",
                0.8,
            ),
            other => (other, DEFAULT_TEMPERATURE),
        };
        Self {
            instruction: instruction.to_string(),
            temperature,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SolverOptions {
    pub style: String,
    pub marker_ttl: Duration,
}

impl SolverOptions {
    pub fn new(style: impl Into<String>) -> Self {
        Self {
            style: style.into(),
            marker_ttl: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolveOutcome {
    Published,
    /// This style already holds the marker for the issue.
    AlreadyHandled,
    MissingIssue,
    Failed,
}

pub struct Solver {
    substrate: Substrate,
    llm: Arc<dyn LanguageService>,
    tracker: Arc<dyn TicketingService>,
    options: SolverOptions,
    profile: StyleProfile,
}

impl Solver {
    pub fn new(
        substrate: Substrate,
        llm: Arc<dyn LanguageService>,
        tracker: Arc<dyn TicketingService>,
        options: SolverOptions,
    ) -> Self {
        let profile = StyleProfile::for_style(&options.style);
        Self {
            substrate,
            llm,
            tracker,
            options,
            profile,
        }
    }

    pub fn style(&self) -> &str {
        &self.options.style
    }

    pub async fn run(&self) -> Result<(), SubstrateError> {
        let mut items = self.substrate.bus.subscribe::<NewWorkItem>().await?;
        info!(style = %self.options.style, "solver running");
        while let Some(item) = items.next().await {
            if let Err(e) = self.handle(&item).await {
                warn!(style = %self.options.style, issue_key = %item.issue_key, error = %e, "solver error");
            }
        }
        warn!(style = %self.options.style, "work item subscription closed");
        Ok(())
    }

    pub async fn handle(&self, item: &NewWorkItem) -> Result<SolveOutcome, SubstrateError> {
        let style = self.options.style.as_str();
        let issue_key = item.issue_key.as_str();
        let marker = keys::solver_marker(style, issue_key);
        let guard = self.substrate.guard();

        if !guard.try_acquire(&marker, self.options.marker_ttl).await? {
            debug!(style, issue_key, "already handled by this style");
            return Ok(SolveOutcome::AlreadyHandled);
        }

        let issue = match self.tracker.get_issue(issue_key).await {
            Ok(Some(issue)) => issue,
            Ok(None) => {
                warn!(style, issue_key, "issue not found");
                guard.release(&marker).await?;
                return Ok(SolveOutcome::MissingIssue);
            }
            Err(e) => {
                warn!(style, issue_key, error = %e, "could not fetch issue");
                guard.release(&marker).await?;
                counter!(telemetry::SOLVER_FAILURES).increment(1);
                return Ok(SolveOutcome::Failed);
            }
        };

        let solution_text = match self.llm.generate(self.request(&issue)).await {
            Ok(text) => text,
            Err(e) => {
                warn!(style, issue_key, error = %e, "generation failed, releasing marker");
                guard.release(&marker).await?;
                counter!(telemetry::SOLVER_FAILURES).increment(1);
                return Ok(SolveOutcome::Failed);
            }
        };

        let candidate = Candidate {
            issue_key: issue_key.to_string(),
            style: style.to_string(),
            solution_text,
        };
        if let Err(e) = self.substrate.bus.publish(&candidate).await {
            guard.release(&marker).await?;
            return Err(e);
        }
        counter!(telemetry::CANDIDATES_PUBLISHED).increment(1);
        info!(style, issue_key, "candidate published");
        Ok(SolveOutcome::Published)
    }

    fn request(&self, issue: &IssueSnapshot) -> GenerateRequest {
        let prompt = format!(
            "Work item {}: {}\n\n{}\n\nStyle: {}",
            issue.key, issue.title, issue.description, self.profile.instruction
        );
        GenerateRequest::new("solve", prompt)
            .with_system(SOLVER_SYSTEM)
            .with_temperature(self.profile.temperature)
    }
}
