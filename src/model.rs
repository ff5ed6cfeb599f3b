//! Domain types shared by every stage: submissions, tasks, risks, results.
//!
//! Types that the language service produces directly (`TaskDraft`, `Risk`,
//! `Keywords`) derive `JsonSchema` so their schema can be sent along with the
//! prompt and used to validate the reply.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A raw documentation change as submitted by a caller. Immutable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSubmission {
    pub old_text: String,
    pub new_text: String,
    #[serde(default, alias = "comments", skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl ChangeSubmission {
    pub fn new(old_text: impl Into<String>, new_text: impl Into<String>) -> Self {
        Self {
            old_text: old_text.into(),
            new_text: new_text.into(),
            comment: None,
        }
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }
}

/// Correlates one submission with its eventual result.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrackingId(String);

impl TrackingId {
    /// Fresh random identifier.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for TrackingId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for TrackingId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for TrackingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of work a task represents.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    #[serde(alias = "Development")]
    Development,
    #[serde(alias = "Refactoring", alias = "refactoring")]
    Refactor,
    #[serde(alias = "Testing", alias = "testing")]
    Test,
    #[serde(alias = "Documentation", alias = "documentation")]
    Doc,
    #[serde(alias = "Bugfix")]
    Bugfix,
}

impl TaskKind {
    /// Issue type understood by the ticketing service.
    pub fn tracker_type(&self) -> &'static str {
        match self {
            TaskKind::Development | TaskKind::Refactor | TaskKind::Doc => "task",
            TaskKind::Test => "test",
            TaskKind::Bugfix => "bug",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKind::Development => write!(f, "development"),
            TaskKind::Refactor => write!(f, "refactor"),
            TaskKind::Test => write!(f, "test"),
            TaskKind::Doc => write!(f, "doc"),
            TaskKind::Bugfix => write!(f, "bugfix"),
        }
    }
}

/// Three-step scale used for priorities, probabilities and impacts.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    JsonSchema,
)]
pub enum Level {
    Low,
    #[default]
    Medium,
    High,
}

impl Level {
    pub fn as_lowercase(&self) -> &'static str {
        match self {
            Level::Low => "low",
            Level::Medium => "medium",
            Level::High => "high",
        }
    }
}

pub type Priority = Level;

/// A task as returned by the language service, before it gets an id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct TaskDraft {
    pub title: String,
    pub description: String,
    pub kind: TaskKind,
    pub acceptance_criteria: Vec<String>,
    pub priority: Priority,
}

/// A unit of work created by the analysis stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub description: String,
    #[serde(alias = "task_type")]
    pub kind: TaskKind,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub priority: Priority,
}

impl From<TaskDraft> for Task {
    fn from(draft: TaskDraft) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            title: draft.title,
            description: draft.description,
            kind: draft.kind,
            acceptance_criteria: draft.acceptance_criteria,
            priority: draft.priority,
        }
    }
}

/// A risk attached to the whole task set of one submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Risk {
    pub category: String,
    pub description: String,
    pub probability: Level,
    pub impact: Level,
    pub mitigation: Vec<String>,
}

/// Terms extracted from the change text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct Keywords {
    pub keywords: Vec<String>,
    pub technical_terms: Vec<String>,
    pub components: Vec<String>,
    pub abbreviations: BTreeMap<String, String>,
}

impl Keywords {
    /// Flattened hint list: keywords, then terms, then components.
    pub fn hint_terms(&self, limit: usize) -> Vec<&str> {
        self.keywords
            .iter()
            .chain(&self.technical_terms)
            .chain(&self.components)
            .map(String::as_str)
            .take(limit)
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.keywords.is_empty()
            && self.technical_terms.is_empty()
            && self.components.is_empty()
            && self.abbreviations.is_empty()
    }
}

/// Locally computed figures about one analysis.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metrics {
    pub tasks_generated: usize,
    pub high_impact_risks: usize,
    pub task_kinds: Vec<TaskKind>,
    pub keywords_count: usize,
    pub risk_distribution: BTreeMap<String, usize>,
}

impl Metrics {
    pub fn compute(tasks: &[Task], risks: &[Risk], keywords: &Keywords) -> Self {
        let task_kinds: BTreeSet<TaskKind> = tasks.iter().map(|t| t.kind).collect();
        let mut risk_distribution = BTreeMap::new();
        for risk in risks {
            *risk_distribution
                .entry(risk.category.to_lowercase())
                .or_insert(0) += 1;
        }

        Self {
            tasks_generated: tasks.len(),
            high_impact_risks: risks.iter().filter(|r| r.impact == Level::High).count(),
            task_kinds: task_kinds.into_iter().collect(),
            keywords_count: keywords.keywords.len() + keywords.technical_terms.len(),
            risk_distribution,
        }
    }
}

/// Aggregate outcome of one submission's pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub change_summary: String,
    #[serde(default)]
    pub affected_components: Vec<String>,
    pub tasks: Vec<Task>,
    pub risks: Vec<Risk>,
    #[serde(default)]
    pub keywords: Keywords,
    pub overall_description: String,
    /// Ticketing keys of the tasks that were created, in task order.
    #[serde(default)]
    pub tracker_ids: Vec<String>,
    #[serde(default)]
    pub metrics: Metrics,
}

/// One solver's proposal for one issue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub issue_key: String,
    pub style: String,
    #[serde(alias = "solution")]
    pub solution_text: String,
}
