//! Fan-in Evaluator.
//!
//! Candidates for one issue accumulate in `solutionset:{issue_key}`, a map
//! keyed by style. The insert is atomic and reports the new cardinality, so
//! exactly one insert observes the set reaching the expected solver count and
//! that insert runs the judge. There is no timer.
//!
//! A redelivered candidate that lands on an already complete set judges it
//! again, so a set kept after a failed update can still be applied. The
//! `evaluating:{issue_key}` marker keeps that to one judge at a time.
//!
//! A malformed verdict starts a new round: the solver markers of the stale
//! set are released, fresh candidates collect under
//! `solutionset:{issue_key}:round:{n}` and the stale set is left to expire.
//! Sets are deleted only after the tracker accepts the chosen solution.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use schemars::JsonSchema;
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use crate::events::{keys, DeadLetter, NewWorkItem, DEAD_LETTER_QUEUE};
use crate::llm::structured::generate_json;
use crate::llm::{GenerateRequest, LanguageService};
use crate::model::Candidate;
use crate::substrate::{Substrate, SubstrateError};
use crate::telemetry;
use crate::tracker::{IssueSnapshot, TicketingService};

const EVALUATION_LOCK_TTL: Duration = Duration::from_secs(300);

const JUDGE_SYSTEM: &str = "You are a principal engineer reviewing competing implementation \
proposals for the same work item. Pick the best one, or merge them into a better one.";

#[derive(Debug, Clone)]
pub struct EvaluatorOptions {
    pub expected_solvers: usize,
    pub solution_set_ttl: Duration,
    /// Malformed-judge re-solves per issue; 0 re-solves forever.
    pub max_judge_attempts: u32,
}

impl EvaluatorOptions {
    pub fn new(expected_solvers: usize) -> Self {
        Self {
            expected_solvers,
            solution_set_ttl: Duration::from_secs(3600),
            max_judge_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvalOutcome {
    /// This style already has a candidate in the set.
    Duplicate,
    Waiting { have: usize, need: usize },
    /// More styles than expected reported in; nothing to do.
    Overfull(usize),
    Applied,
    /// The tracker refused the update; the set is kept.
    UpdateRejected,
    IssueUnavailable,
    /// Another delivery is judging this issue right now.
    InProgress,
    /// The judge reply was unusable; solving was requested again.
    Resolving { attempt: u64 },
    DeadLettered,
}

/// The judge's structured reply.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct Verdict {
    /// Full text of the chosen (or merged) solution.
    pub solution: String,
    pub justification: String,
}

pub struct Evaluator {
    substrate: Substrate,
    llm: Arc<dyn LanguageService>,
    tracker: Arc<dyn TicketingService>,
    options: EvaluatorOptions,
}

impl Evaluator {
    pub fn new(
        substrate: Substrate,
        llm: Arc<dyn LanguageService>,
        tracker: Arc<dyn TicketingService>,
        options: EvaluatorOptions,
    ) -> Self {
        Self {
            substrate,
            llm,
            tracker,
            options,
        }
    }

    pub async fn run(&self) -> Result<(), SubstrateError> {
        let mut candidates = self.substrate.bus.subscribe::<Candidate>().await?;
        info!(expected = self.options.expected_solvers, "evaluator running");
        while let Some(candidate) = candidates.next().await {
            if let Err(e) = self.handle(&candidate).await {
                warn!(issue_key = %candidate.issue_key, style = %candidate.style, error = %e, "evaluator error");
            }
        }
        warn!("candidate subscription closed");
        Ok(())
    }

    pub async fn handle(&self, candidate: &Candidate) -> Result<EvalOutcome, SubstrateError> {
        let issue_key = candidate.issue_key.as_str();
        let round = self.current_round(issue_key).await?;
        let set_key = keys::solution_set_round(issue_key, round);
        let inserted = self
            .substrate
            .kv
            .insert_field_if_absent(
                &set_key,
                &candidate.style,
                &serde_json::to_string(candidate)?,
                self.options.solution_set_ttl,
            )
            .await?;

        let need = self.options.expected_solvers;
        match inserted {
            None => {
                let have = self.substrate.kv.fields(&set_key).await?.len();
                if have == need {
                    debug!(issue_key, style = %candidate.style, "duplicate on a complete set, judging again");
                    return self.evaluate_once(issue_key, round).await;
                }
                debug!(issue_key, style = %candidate.style, "duplicate style, dropping candidate");
                Ok(EvalOutcome::Duplicate)
            }
            Some(have) if have < need => {
                debug!(issue_key, have, need, "waiting for more candidates");
                Ok(EvalOutcome::Waiting { have, need })
            }
            Some(have) if have > need => {
                warn!(issue_key, have, need, "more candidates than solvers");
                Ok(EvalOutcome::Overfull(have))
            }
            Some(_) => self.evaluate_once(issue_key, round).await,
        }
    }

    /// Re-solve round the issue is in: the number of malformed verdicts so far.
    async fn current_round(&self, issue_key: &str) -> Result<u64, SubstrateError> {
        let raw = self.substrate.kv.get(&keys::judge_attempts(issue_key)).await?;
        Ok(raw.and_then(|v| v.parse().ok()).unwrap_or(0))
    }

    async fn evaluate_once(&self, issue_key: &str, round: u64) -> Result<EvalOutcome, SubstrateError> {
        let lock = keys::evaluating(issue_key);
        let guard = self.substrate.guard();
        if !guard.try_acquire(&lock, EVALUATION_LOCK_TTL).await? {
            debug!(issue_key, "evaluation already running");
            return Ok(EvalOutcome::InProgress);
        }
        let outcome = self.evaluate(issue_key, round).await;
        if let Err(e) = guard.release(&lock).await {
            warn!(issue_key, error = %e, "could not release evaluation marker");
        }
        outcome
    }

    async fn evaluate(&self, issue_key: &str, round: u64) -> Result<EvalOutcome, SubstrateError> {
        let set_key = keys::solution_set_round(issue_key, round);
        let mut styles = Vec::new();
        let mut candidates: Vec<Candidate> = Vec::new();
        for (style, raw) in self.substrate.kv.fields(&set_key).await? {
            match serde_json::from_str(&raw) {
                Ok(c) => candidates.push(c),
                Err(e) => warn!(issue_key, %style, error = %e, "skipping undecodable candidate"),
            }
            styles.push(style);
        }
        candidates.sort_by(|a, b| a.style.cmp(&b.style));

        let issue = match self.tracker.get_issue(issue_key).await {
            Ok(Some(issue)) => issue,
            Ok(None) => {
                warn!(issue_key, "issue vanished before evaluation");
                return Ok(EvalOutcome::IssueUnavailable);
            }
            Err(e) => {
                warn!(issue_key, error = %e, "could not fetch issue for evaluation");
                return Ok(EvalOutcome::IssueUnavailable);
            }
        };

        info!(issue_key, round, candidates = candidates.len(), "judging candidates");
        let verdict = match generate_json::<Verdict>(self.llm.as_ref(), judge_request(&issue, &candidates)).await {
            Ok(verdict) => verdict,
            Err(e) => {
                warn!(issue_key, error = %e, "judge failed");
                counter!(telemetry::EVALUATIONS_FAILED).increment(1);
                return self.request_resolve(issue_key, &styles).await;
            }
        };
        debug!(issue_key, justification = %verdict.justification, "verdict");

        let description = if issue.description.trim().is_empty() {
            verdict.solution
        } else {
            format!("{}\n\n{}", issue.description, verdict.solution)
        };
        match self.tracker.update_issue(issue_key, &description).await {
            Ok(true) => {
                for r in 0..=round {
                    self.substrate.kv.delete(&keys::solution_set_round(issue_key, r)).await?;
                }
                self.substrate.kv.delete(&keys::judge_attempts(issue_key)).await?;
                counter!(telemetry::EVALUATIONS_APPLIED).increment(1);
                info!(issue_key, "solution applied");
                Ok(EvalOutcome::Applied)
            }
            Ok(false) => {
                warn!(issue_key, "tracker rejected update, keeping solution set");
                Ok(EvalOutcome::UpdateRejected)
            }
            Err(e) => {
                warn!(issue_key, error = %e, "update failed, keeping solution set");
                Ok(EvalOutcome::UpdateRejected)
            }
        }
    }

    /// Ask `styles` for fresh candidates in the next round, unless the issue
    /// is out of judge attempts. The stale set stays until it expires.
    async fn request_resolve(&self, issue_key: &str, styles: &[String]) -> Result<EvalOutcome, SubstrateError> {
        let attempt = self
            .substrate
            .kv
            .increment(&keys::judge_attempts(issue_key), self.options.solution_set_ttl)
            .await?;
        let max = u64::from(self.options.max_judge_attempts);
        if max != 0 && attempt > max {
            error!(issue_key, attempts = attempt, "judge retry ceiling reached, dead-lettering");
            let letter = DeadLetter::Evaluation {
                issue_key: issue_key.to_string(),
                attempts: attempt,
            };
            self.substrate
                .queue
                .push(DEAD_LETTER_QUEUE, serde_json::to_string(&letter)?)
                .await?;
            counter!(telemetry::DEAD_LETTERS).increment(1);
            return Ok(EvalOutcome::DeadLettered);
        }

        let guard = self.substrate.guard();
        for style in styles {
            guard.release(&keys::solver_marker(style, issue_key)).await?;
        }
        self.substrate
            .bus
            .publish(&NewWorkItem {
                issue_key: issue_key.to_string(),
                tracking_id: None,
            })
            .await?;
        info!(issue_key, attempt, "re-solve requested");
        Ok(EvalOutcome::Resolving { attempt })
    }
}

fn judge_request(issue: &IssueSnapshot, candidates: &[Candidate]) -> GenerateRequest {
    let mut prompt = format!(
        "Work item {}: {}\n\n{}\n\nProposals:\n",
        issue.key, issue.title, issue.description
    );
    for (i, c) in candidates.iter().enumerate() {
        prompt.push_str(&format!("\n--- Proposal {} ({}) ---\n{}\n", i + 1, c.style, c.solution_text));
    }
    prompt.push_str("\nReturn the winning solution text and a one-sentence justification.");
    GenerateRequest::new("judge", prompt)
        .with_system(JUDGE_SYSTEM)
        .with_temperature(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeTracker, ScriptedLanguage};

    const VERDICT: &str = r#"{"solution":"Use TOTP with SMS fallback.","justification":"Covers outages."}"#;

    fn candidate(key: &str, style: &str) -> Candidate {
        Candidate {
            issue_key: key.into(),
            style: style.into(),
            solution_text: format!("{style} proposal for {key}"),
        }
    }

    fn evaluator(
        substrate: &Substrate,
        llm: &Arc<ScriptedLanguage>,
        tracker: &Arc<FakeTracker>,
        options: EvaluatorOptions,
    ) -> Evaluator {
        Evaluator::new(substrate.clone(), llm.clone(), tracker.clone(), options)
    }

    async fn fill(e: &Evaluator, key: &str) -> Vec<EvalOutcome> {
        let mut out = Vec::new();
        for style in ["balanced", "terse", "thorough"] {
            out.push(e.handle(&candidate(key, style)).await.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn third_candidate_triggers_single_judge_and_clears_set() {
        let substrate = Substrate::in_memory();
        let llm = Arc::new(ScriptedLanguage::new().answer("judge", VERDICT));
        let tracker = Arc::new(FakeTracker::new().with_issue("Q-1", "Add MFA", "Second factor"));
        let e = evaluator(&substrate, &llm, &tracker, EvaluatorOptions::new(3));

        let outcomes = fill(&e, "Q-1").await;
        assert_eq!(outcomes[0], EvalOutcome::Waiting { have: 1, need: 3 });
        assert_eq!(outcomes[1], EvalOutcome::Waiting { have: 2, need: 3 });
        assert_eq!(outcomes[2], EvalOutcome::Applied);

        assert_eq!(llm.calls("judge"), 1);
        let judge = llm.last_request("judge").unwrap();
        assert_eq!(judge.temperature, Some(0.0));
        assert!(judge.prompt.contains("terse proposal for Q-1"));

        assert!(!substrate.kv.exists("solutionset:Q-1").await.unwrap());
        assert_eq!(
            tracker.description("Q-1").unwrap(),
            "Second factor\n\nUse TOTP with SMS fallback."
        );
    }

    #[tokio::test]
    async fn malformed_verdict_requests_resolve_and_keeps_set() {
        let substrate = Substrate::in_memory();
        let llm = Arc::new(ScriptedLanguage::new().answer("judge", "I like the second one best."));
        let tracker = Arc::new(FakeTracker::new().with_issue("Q-2", "t", "d"));
        let e = evaluator(&substrate, &llm, &tracker, EvaluatorOptions::new(3));
        let mut items = substrate.bus.subscribe::<NewWorkItem>().await.unwrap();

        let outcomes = fill(&e, "Q-2").await;
        assert_eq!(outcomes[2], EvalOutcome::Resolving { attempt: 1 });

        let item = items.next().await.unwrap();
        assert_eq!(item.issue_key, "Q-2");
        assert!(item.tracking_id.is_none());

        let fields = substrate.kv.fields("solutionset:Q-2").await.unwrap();
        assert_eq!(fields.len(), 3);
        for (style, raw) in fields {
            let c: Candidate = serde_json::from_str(&raw).unwrap();
            assert_eq!(c, candidate("Q-2", &style));
        }
        assert!(tracker.updates().is_empty());
    }

    #[tokio::test]
    async fn rejected_update_preserves_set_exactly() {
        let substrate = Substrate::in_memory();
        let llm = Arc::new(ScriptedLanguage::new().answer("judge", VERDICT));
        let tracker = Arc::new(FakeTracker::new().with_issue("Q-3", "t", "d"));
        tracker.set_reject_updates(true);
        let e = evaluator(&substrate, &llm, &tracker, EvaluatorOptions::new(3));

        let mut expected: Vec<(String, String)> = ["balanced", "terse", "thorough"]
            .iter()
            .map(|s| (s.to_string(), serde_json::to_string(&candidate("Q-3", s)).unwrap()))
            .collect();

        let outcomes = fill(&e, "Q-3").await;
        assert_eq!(outcomes[2], EvalOutcome::UpdateRejected);

        let mut fields = substrate.kv.fields("solutionset:Q-3").await.unwrap();
        fields.sort();
        expected.sort();
        assert_eq!(fields, expected);
        assert_eq!(tracker.description("Q-3").unwrap(), "d");
    }

    #[tokio::test]
    async fn redelivery_rejudges_kept_set_once_update_succeeds() {
        let substrate = Substrate::in_memory();
        let llm = Arc::new(ScriptedLanguage::new().answer("judge", VERDICT));
        let tracker = Arc::new(FakeTracker::new().with_issue("Q-4", "t", "d"));
        tracker.set_reject_updates(true);
        let e = evaluator(&substrate, &llm, &tracker, EvaluatorOptions::new(3));

        assert_eq!(fill(&e, "Q-4").await[2], EvalOutcome::UpdateRejected);

        tracker.set_reject_updates(false);
        assert_eq!(
            e.handle(&candidate("Q-4", "terse")).await.unwrap(),
            EvalOutcome::Applied
        );
        assert_eq!(llm.calls("judge"), 2);
        assert!(!substrate.kv.exists("solutionset:Q-4").await.unwrap());
        assert_eq!(
            tracker.description("Q-4").unwrap(),
            "d\n\nUse TOTP with SMS fallback."
        );
    }

    #[tokio::test]
    async fn held_evaluation_marker_skips_judging() {
        let substrate = Substrate::in_memory();
        let llm = Arc::new(ScriptedLanguage::new().answer("judge", VERDICT));
        let tracker = Arc::new(FakeTracker::new().with_issue("Q-9", "t", "d"));
        let e = evaluator(&substrate, &llm, &tracker, EvaluatorOptions::new(3));
        substrate
            .guard()
            .try_acquire(&keys::evaluating("Q-9"), Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(fill(&e, "Q-9").await[2], EvalOutcome::InProgress);
        assert_eq!(llm.calls("judge"), 0);
        assert_eq!(substrate.kv.fields("solutionset:Q-9").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn partial_set_duplicate_does_not_judge() {
        let substrate = Substrate::in_memory();
        let llm = Arc::new(ScriptedLanguage::new().answer("judge", VERDICT));
        let tracker = Arc::new(FakeTracker::new().with_issue("Q-10", "t", "d"));
        let e = evaluator(&substrate, &llm, &tracker, EvaluatorOptions::new(3));

        e.handle(&candidate("Q-10", "terse")).await.unwrap();
        assert_eq!(
            e.handle(&candidate("Q-10", "terse")).await.unwrap(),
            EvalOutcome::Duplicate
        );
        assert_eq!(llm.calls("judge"), 0);
    }

    #[tokio::test]
    async fn duplicate_style_is_dropped() {
        let substrate = Substrate::in_memory();
        let llm = Arc::new(ScriptedLanguage::new().answer("judge", VERDICT));
        let tracker = Arc::new(FakeTracker::new().with_issue("Q-5", "t", "d"));
        let e = evaluator(&substrate, &llm, &tracker, EvaluatorOptions::new(3));

        e.handle(&candidate("Q-5", "terse")).await.unwrap();
        let mut changed = candidate("Q-5", "terse");
        changed.solution_text = "another take".into();
        assert_eq!(e.handle(&changed).await.unwrap(), EvalOutcome::Duplicate);

        let fields = substrate.kv.fields("solutionset:Q-5").await.unwrap();
        assert_eq!(fields.len(), 1);
        assert!(fields[0].1.contains("terse proposal"));
    }

    #[tokio::test]
    async fn judge_ceiling_dead_letters() {
        let substrate = Substrate::in_memory();
        let llm = Arc::new(ScriptedLanguage::new().answer("judge", "{}"));
        let tracker = Arc::new(FakeTracker::new().with_issue("Q-6", "t", "d"));
        let options = EvaluatorOptions {
            max_judge_attempts: 2,
            ..EvaluatorOptions::new(3)
        };
        let e = evaluator(&substrate, &llm, &tracker, options);
        let ttl = Duration::from_secs(60);
        substrate.kv.increment("judge-attempts:Q-6", ttl).await.unwrap();
        substrate.kv.increment("judge-attempts:Q-6", ttl).await.unwrap();

        let outcomes = fill(&e, "Q-6").await;
        assert_eq!(outcomes[2], EvalOutcome::DeadLettered);

        let raw = substrate.queue.pop(DEAD_LETTER_QUEUE).await.unwrap().unwrap();
        assert_eq!(
            serde_json::from_str::<DeadLetter>(&raw).unwrap(),
            DeadLetter::Evaluation {
                issue_key: "Q-6".into(),
                attempts: 3
            }
        );
        assert!(substrate.kv.exists("solutionset:Q-6:round:2").await.unwrap());
    }

    #[tokio::test]
    async fn malformed_verdicts_resolve_through_solvers_until_dead_letter() {
        use crate::solver::{SolveOutcome, Solver, SolverOptions};

        let substrate = Substrate::in_memory();
        let llm = Arc::new(
            ScriptedLanguage::new()
                .answer("solve", "proposal")
                .answer("judge", "not json"),
        );
        let tracker = Arc::new(FakeTracker::new().with_issue("Q-11", "t", "d"));
        let options = EvaluatorOptions {
            max_judge_attempts: 2,
            ..EvaluatorOptions::new(3)
        };
        let e = evaluator(&substrate, &llm, &tracker, options);
        let solvers: Vec<Solver> = ["balanced", "terse", "thorough"]
            .into_iter()
            .map(|style| {
                Solver::new(
                    substrate.clone(),
                    llm.clone(),
                    tracker.clone(),
                    SolverOptions::new(style),
                )
            })
            .collect();
        let mut candidates = substrate.bus.subscribe::<Candidate>().await.unwrap();
        let item = NewWorkItem {
            issue_key: "Q-11".into(),
            tracking_id: None,
        };

        let mut decisions = Vec::new();
        for _ in 0..3 {
            for s in &solvers {
                assert_eq!(s.handle(&item).await.unwrap(), SolveOutcome::Published);
            }
            for _ in 0..3 {
                let c = candidates.next().await.unwrap();
                match e.handle(&c).await.unwrap() {
                    EvalOutcome::Waiting { .. } => {}
                    other => decisions.push(other),
                }
            }
        }

        assert_eq!(
            decisions,
            vec![
                EvalOutcome::Resolving { attempt: 1 },
                EvalOutcome::Resolving { attempt: 2 },
                EvalOutcome::DeadLettered,
            ]
        );
        assert_eq!(llm.calls("solve"), 9);
        assert_eq!(llm.calls("judge"), 3);
        let raw = substrate.queue.pop(DEAD_LETTER_QUEUE).await.unwrap().unwrap();
        assert_eq!(
            serde_json::from_str::<DeadLetter>(&raw).unwrap(),
            DeadLetter::Evaluation {
                issue_key: "Q-11".into(),
                attempts: 3
            }
        );
        assert!(substrate.kv.exists("solutionset:Q-11").await.unwrap());
    }

    #[tokio::test]
    async fn extra_candidates_past_expected_count_are_ignored() {
        let substrate = Substrate::in_memory();
        let llm = Arc::new(ScriptedLanguage::new().answer("judge", VERDICT));
        let tracker = Arc::new(FakeTracker::new().with_issue("Q-7", "t", "d"));
        tracker.set_reject_updates(true);
        let e = evaluator(&substrate, &llm, &tracker, EvaluatorOptions::new(2));

        let outcomes = fill(&e, "Q-7").await;
        assert_eq!(outcomes[1], EvalOutcome::UpdateRejected);
        assert_eq!(outcomes[2], EvalOutcome::Overfull(3));
        assert_eq!(llm.calls("judge"), 1);
    }

    #[tokio::test]
    async fn missing_issue_keeps_set() {
        let substrate = Substrate::in_memory();
        let llm = Arc::new(ScriptedLanguage::new().answer("judge", VERDICT));
        let tracker = Arc::new(FakeTracker::new());
        let e = evaluator(&substrate, &llm, &tracker, EvaluatorOptions::new(3));

        let outcomes = fill(&e, "Q-8").await;
        assert_eq!(outcomes[2], EvalOutcome::IssueUnavailable);
        assert_eq!(llm.total_calls(), 0);
        assert_eq!(substrate.kv.fields("solutionset:Q-8").await.unwrap().len(), 3);
    }
}
