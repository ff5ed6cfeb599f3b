//! Language stages of the ingestion pipeline.
//!
//! Each stage is one call to the language service. Stages are plain async
//! functions; the coordinator decides ordering and failure handling. Only
//! keyword extraction degrades instead of failing.

pub mod prompts;

use schemars::JsonSchema;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::llm::structured::generate_json;
use crate::llm::{GenerateRequest, LanguageService, LlmError};
use crate::model::{ChangeSubmission, Keywords, Risk, Task, TaskDraft};

/// Upper bound on keyword hints forwarded to task generation.
pub const MAX_HINT_TERMS: usize = 50;

/// Component used when the analysis names none.
pub const FALLBACK_COMPONENT: &str = "general";

const KEYWORD_TEMPERATURE: f32 = 0.2;

/// Output of the first stage.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, JsonSchema)]
pub struct ChangeAnalysis {
    pub summary: String,
    #[serde(default)]
    pub affected_components: Vec<String>,
}

impl ChangeAnalysis {
    /// Components to plan for, never empty.
    pub fn components(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for c in &self.affected_components {
            let c = c.trim();
            if !c.is_empty() && !out.iter().any(|seen| seen == c) {
                out.push(c.to_string());
            }
        }
        if out.is_empty() {
            out.push(FALLBACK_COMPONENT.to_string());
        }
        out
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
struct TaskList {
    tasks: Vec<TaskDraft>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct RiskList {
    risks: Vec<Risk>,
}

pub async fn analyze(
    llm: &dyn LanguageService,
    submission: &ChangeSubmission,
) -> Result<ChangeAnalysis, LlmError> {
    let request = GenerateRequest::new("analyze", prompts::analyze(submission))
        .with_system(prompts::ANALYST_SYSTEM);
    generate_json(llm, request).await
}

/// Never fails; an unusable reply yields empty keywords.
pub async fn extract_keywords(llm: &dyn LanguageService, submission: &ChangeSubmission) -> Keywords {
    let request = GenerateRequest::new("keywords", prompts::keywords(submission))
        .with_system(prompts::ANALYST_SYSTEM)
        .with_temperature(KEYWORD_TEMPERATURE);
    match generate_json::<Keywords>(llm, request).await {
        Ok(keywords) => keywords,
        Err(e) => {
            warn!(error = %e, "keyword extraction failed, continuing without keywords");
            Keywords::default()
        }
    }
}

pub async fn generate_tasks(
    llm: &dyn LanguageService,
    summary: &str,
    component: &str,
    keywords: &Keywords,
) -> Result<Vec<Task>, LlmError> {
    let hints = keywords.hint_terms(MAX_HINT_TERMS);
    let request = GenerateRequest::new("tasks", prompts::tasks(summary, component, &hints))
        .with_system(prompts::PLANNER_SYSTEM);
    let list: TaskList = generate_json(llm, request).await?;
    debug!(component, count = list.tasks.len(), "tasks generated");
    Ok(list.tasks.into_iter().map(Task::from).collect())
}

pub async fn analyze_risks(llm: &dyn LanguageService, tasks: &[Task]) -> Result<Vec<Risk>, LlmError> {
    let request =
        GenerateRequest::new("risks", prompts::risks(tasks)).with_system(prompts::RISK_SYSTEM);
    let list: RiskList = generate_json(llm, request).await?;
    Ok(list.risks)
}

pub async fn describe(
    llm: &dyn LanguageService,
    summary: &str,
    tasks: &[Task],
    risks: &[Risk],
) -> Result<String, LlmError> {
    let request = GenerateRequest::new("describe", prompts::describe(summary, tasks, risks))
        .with_system(prompts::WRITER_SYSTEM);
    llm.generate(request).await
}
