//! Prompt text for the analysis stages.

use crate::model::{ChangeSubmission, Risk, Task};

pub const ANALYST_SYSTEM: &str = "You are a senior software analyst. You read changes to \
product documentation and work out what they mean for the codebase.";

pub const PLANNER_SYSTEM: &str = "You are a technical lead who breaks documentation changes \
into concrete, independently deliverable engineering tasks.";

pub const RISK_SYSTEM: &str = "You are a delivery risk reviewer. You look at a planned task \
set and name what could go wrong and how to prevent it.";

pub const WRITER_SYSTEM: &str = "You are a technical writer. You produce a short plain-text \
overview for engineers and managers.";

fn change_block(submission: &ChangeSubmission) -> String {
    let mut out = format!(
        "<old_text>\n{}\n</old_text>\n\n<new_text>\n{}\n</new_text>",
        submission.old_text, submission.new_text
    );
    if let Some(comment) = submission.comment.as_deref().filter(|c| !c.trim().is_empty()) {
        out.push_str(&format!("\n\n<author_comment>\n{comment}\n</author_comment>"));
    }
    out
}

pub fn analyze(submission: &ChangeSubmission) -> String {
    format!(
        "Compare the old and new versions of this document.\n\n{}\n\n\
         Summarize what changed and list the software components the change affects. \
         Use short component names.",
        change_block(submission)
    )
}

pub fn keywords(submission: &ChangeSubmission) -> String {
    format!(
        "Extract search terms from this documentation change.\n\n{}\n\n\
         Return plain keywords, technical terms, component names, and any abbreviations \
         together with their expansions.",
        change_block(submission)
    )
}

pub fn tasks(summary: &str, component: &str, hints: &[&str]) -> String {
    let mut out = format!(
        "Change summary:\n{summary}\n\nComponent: {component}\n\n\
         List the engineering tasks this component needs. Each task gets a title, a \
         description, a kind (development, refactor, test, doc or bugfix), acceptance \
         criteria and a priority (Low, Medium or High)."
    );
    if !hints.is_empty() {
        out.push_str(&format!("\n\nRelevant terms: {}", hints.join(", ")));
    }
    out
}

fn task_lines(tasks: &[Task]) -> String {
    tasks
        .iter()
        .map(|t| format!("- [{}/{}] {}: {}", t.kind, t.priority.as_lowercase(), t.title, t.description))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn risks(tasks: &[Task]) -> String {
    format!(
        "Planned tasks:\n{}\n\nIdentify the risks of delivering this task set. For each, give \
         a category, a description, probability and impact (Low, Medium or High) and \
         mitigation steps.",
        task_lines(tasks)
    )
}

pub fn describe(summary: &str, tasks: &[Task], risks: &[Risk]) -> String {
    let risk_lines = risks
        .iter()
        .map(|r| format!("- {} (impact {}): {}", r.category, r.impact.as_lowercase(), r.description))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "Change summary:\n{summary}\n\nTasks:\n{}\n\nRisks:\n{risk_lines}\n\n\
         Write a concise overall description of the work in plain text.",
        task_lines(tasks)
    )
}
