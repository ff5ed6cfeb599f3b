//! Change Ingestion Coordinator.
//!
//! `submit` only enqueues. The drain loop pops one [`RetryEnvelope`] at a
//! time and runs the stages strictly in order:
//!
//! 1. change analysis (+ keywords, non-fatal)
//! 2. task generation per affected component
//! 3. risk analysis over the whole task set
//! 4. narrative description
//! 5. issue creation, publishing a work item as soon as each issue exists
//!
//! Any failure releases the submission marker and requeues the envelope with
//! its attempt counter bumped, until the ceiling sends it to the dead-letter
//! queue.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tracing::{debug, error, info, warn};

use crate::analysis;
use crate::archive::{Archive, ArchiveError};
use crate::events::{
    keys, DeadLetter, NewSubmission, NewWorkItem, ResultAvailable, RetryEnvelope,
    DEAD_LETTER_QUEUE, SUBMISSION_QUEUE,
};
use crate::llm::{LanguageService, LlmError};
use crate::model::{AnalysisResult, ChangeSubmission, Metrics, TrackingId};
use crate::substrate::{Substrate, SubstrateError};
use crate::telemetry;
use crate::tracker::{TicketingService, TrackerError};

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Substrate(#[from] SubstrateError),

    #[error("language service: {0}")]
    Llm(#[from] LlmError),

    #[error("ticketing: {0}")]
    Tracker(#[from] TrackerError),

    #[error("archive: {0}")]
    Archive(#[from] ArchiveError),

    #[error("{failed} of {total} issues could not be created: {first}")]
    IssueCreation {
        failed: usize,
        total: usize,
        first: TrackerError,
    },
}

#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    pub poll_interval: Duration,
    /// Total attempts per submission; 0 retries forever.
    pub max_attempts: u32,
    pub marker_ttl: Duration,
    pub result_ttl: Duration,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1000),
            max_attempts: 5,
            marker_ttl: Duration::from_secs(3600),
            result_ttl: Duration::from_secs(3600),
        }
    }
}

/// What one `drain_once` call did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
    Empty,
    Completed(TrackingId),
    /// Marker already held; the envelope was dropped.
    Duplicate(TrackingId),
    Requeued { tracking_id: TrackingId, attempt: u32 },
    DeadLettered(TrackingId),
    Undecodable,
}

/// Queue a submission for whichever coordinator drains `substrate`.
pub async fn enqueue(
    substrate: &Substrate,
    submission: ChangeSubmission,
) -> Result<TrackingId, SubstrateError> {
    let tracking_id = TrackingId::generate();
    let envelope = RetryEnvelope::first(tracking_id.clone(), submission);
    substrate
        .queue
        .push(SUBMISSION_QUEUE, serde_json::to_string(&envelope)?)
        .await?;
    substrate
        .bus
        .publish(&NewSubmission {
            tracking_id: tracking_id.clone(),
        })
        .await?;
    info!(%tracking_id, "submission queued");
    Ok(tracking_id)
}

pub struct Coordinator {
    substrate: Substrate,
    llm: Arc<dyn LanguageService>,
    tracker: Arc<dyn TicketingService>,
    archive: Arc<dyn Archive>,
    options: CoordinatorOptions,
}

impl Coordinator {
    pub fn new(
        substrate: Substrate,
        llm: Arc<dyn LanguageService>,
        tracker: Arc<dyn TicketingService>,
        archive: Arc<dyn Archive>,
        options: CoordinatorOptions,
    ) -> Self {
        Self {
            substrate,
            llm,
            tracker,
            archive,
            options,
        }
    }

    /// Enqueue a submission and return its tracking id. Does no analysis.
    pub async fn submit(&self, submission: ChangeSubmission) -> Result<TrackingId, SubstrateError> {
        enqueue(&self.substrate, submission).await
    }

    /// React to `new-submission` events, and poll the queue as a fallback.
    /// Returns when the bus subscription ends.
    pub async fn run(&self) -> Result<(), SubstrateError> {
        let mut events = self.substrate.bus.subscribe::<NewSubmission>().await?;
        let mut tick = tokio::time::interval(self.options.poll_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(poll_ms = self.options.poll_interval.as_millis() as u64, "coordinator running");

        loop {
            tokio::select! {
                event = events.next() => match event {
                    Some(event) => {
                        debug!(tracking_id = %event.tracking_id, "new submission event");
                        self.drain_logged().await;
                    }
                    None => {
                        warn!("submission subscription closed");
                        return Ok(());
                    }
                },
                _ = tick.tick() => self.drain_pending().await,
            }
        }
    }

    /// Drain until the queue is empty or an item goes back on it.
    async fn drain_pending(&self) {
        loop {
            match self.drain_logged().await {
                Some(DrainOutcome::Empty) | Some(DrainOutcome::Requeued { .. }) | None => break,
                Some(_) => {}
            }
        }
    }

    async fn drain_logged(&self) -> Option<DrainOutcome> {
        match self.drain_once().await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                error!(error = %e, "drain failed");
                None
            }
        }
    }

    /// Pop one envelope and run it through the pipeline.
    pub async fn drain_once(&self) -> Result<DrainOutcome, SubstrateError> {
        let Some(raw) = self.substrate.queue.pop(SUBMISSION_QUEUE).await? else {
            return Ok(DrainOutcome::Empty);
        };
        let envelope: RetryEnvelope = match serde_json::from_str(&raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                error!(error = %e, "undecodable queue item, dead-lettering");
                self.dead_letter(&DeadLetter::Undecodable { payload: raw }).await?;
                return Ok(DrainOutcome::Undecodable);
            }
        };

        let tracking_id = envelope.tracking_id.clone();
        let marker = keys::submission_marker(&tracking_id);
        let guard = self.substrate.guard();
        if !guard.try_acquire(&marker, self.options.marker_ttl).await? {
            info!(%tracking_id, "submission already handled, dropping");
            return Ok(DrainOutcome::Duplicate(tracking_id));
        }

        info!(%tracking_id, attempt = envelope.attempt, "processing submission");
        let outcome = match self.process(&envelope).await {
            Ok(result) => self.finish(&tracking_id, result).await.map_err(PipelineError::from),
            Err(e) => Err(e),
        };
        match outcome {
            Ok(()) => Ok(DrainOutcome::Completed(tracking_id)),
            Err(e) => {
                warn!(%tracking_id, attempt = envelope.attempt, error = %e, "pipeline failed");
                // The envelope is already off the queue; requeue it regardless.
                if let Err(release) = guard.release(&marker).await {
                    error!(%tracking_id, error = %release, "could not release submission marker");
                }
                self.retry_or_dead_letter(envelope, e).await
            }
        }
    }

    async fn retry_or_dead_letter(
        &self,
        envelope: RetryEnvelope,
        cause: PipelineError,
    ) -> Result<DrainOutcome, SubstrateError> {
        let attempts_made = envelope.attempt + 1;
        let max = self.options.max_attempts;
        if max != 0 && attempts_made >= max {
            error!(
                tracking_id = %envelope.tracking_id,
                attempts = attempts_made,
                "retry ceiling reached, dead-lettering submission"
            );
            let tracking_id = envelope.tracking_id.clone();
            self.dead_letter(&DeadLetter::Submission {
                envelope,
                error: cause.to_string(),
            })
            .await?;
            return Ok(DrainOutcome::DeadLettered(tracking_id));
        }

        let next = envelope.next_attempt();
        self.substrate
            .queue
            .push(SUBMISSION_QUEUE, serde_json::to_string(&next)?)
            .await?;
        counter!(telemetry::SUBMISSIONS_REQUEUED).increment(1);
        info!(tracking_id = %next.tracking_id, attempt = next.attempt, "submission requeued");
        Ok(DrainOutcome::Requeued {
            tracking_id: next.tracking_id,
            attempt: next.attempt,
        })
    }

    async fn dead_letter(&self, letter: &DeadLetter) -> Result<(), SubstrateError> {
        self.substrate
            .queue
            .push(DEAD_LETTER_QUEUE, serde_json::to_string(letter)?)
            .await?;
        counter!(telemetry::DEAD_LETTERS).increment(1);
        Ok(())
    }

    async fn process(&self, envelope: &RetryEnvelope) -> Result<AnalysisResult, PipelineError> {
        let llm = self.llm.as_ref();
        let submission = &envelope.submission;

        let change = analysis::analyze(llm, submission).await?;
        let keywords = analysis::extract_keywords(llm, submission).await;
        let components = change.components();
        debug!(components = ?components, keywords = keywords.keywords.len(), "change analysed");

        let mut tasks = Vec::new();
        for component in &components {
            tasks.extend(analysis::generate_tasks(llm, &change.summary, component, &keywords).await?);
        }
        let risks = analysis::analyze_risks(llm, &tasks).await?;
        let overall_description = analysis::describe(llm, &change.summary, &tasks, &risks).await?;

        let tracker_ids = self.create_issues(&envelope.tracking_id, &tasks).await?;

        let metrics = Metrics::compute(&tasks, &risks, &keywords);
        Ok(AnalysisResult {
            change_summary: change.summary,
            affected_components: components,
            tasks,
            risks,
            keywords,
            overall_description,
            tracker_ids,
            metrics,
        })
    }

    /// Create every issue, publishing each work item right after its issue
    /// exists. Creation errors do not stop the loop; they fail the run after it.
    async fn create_issues(
        &self,
        tracking_id: &TrackingId,
        tasks: &[crate::model::Task],
    ) -> Result<Vec<String>, PipelineError> {
        let mut keys = Vec::with_capacity(tasks.len());
        let mut failures = Vec::new();

        for task in tasks {
            match self.tracker.create_issue(task).await {
                Ok(Some(issue_key)) => {
                    self.substrate
                        .bus
                        .publish(&NewWorkItem {
                            issue_key: issue_key.clone(),
                            tracking_id: Some(tracking_id.clone()),
                        })
                        .await?;
                    counter!(telemetry::WORK_ITEMS_PUBLISHED).increment(1);
                    debug!(%tracking_id, %issue_key, "work item published");
                    keys.push(issue_key);
                }
                Ok(None) => warn!(%tracking_id, title = %task.title, "no issue created, skipping"),
                Err(e) => {
                    warn!(%tracking_id, title = %task.title, error = %e, "issue creation failed");
                    failures.push(e);
                }
            }
        }

        let failed = failures.len();
        match failures.into_iter().next() {
            Some(first) => Err(PipelineError::IssueCreation {
                failed,
                total: tasks.len(),
                first,
            }),
            None => Ok(keys),
        }
    }

    async fn finish(&self, tracking_id: &TrackingId, result: AnalysisResult) -> Result<(), SubstrateError> {
        if let Err(e) = self.archive.store(tracking_id, &result) {
            error!(%tracking_id, error = %e, "failed to archive result");
        }
        self.substrate
            .kv
            .set(
                &keys::result(tracking_id),
                &serde_json::to_string(&result)?,
                self.options.result_ttl,
            )
            .await?;
        let tasks = result.tasks.len();
        self.substrate
            .bus
            .publish(&ResultAvailable {
                tracking_id: tracking_id.clone(),
                result,
            })
            .await?;
        counter!(telemetry::SUBMISSIONS_COMPLETED).increment(1);
        info!(%tracking_id, tasks, "submission completed");
        Ok(())
    }
}
