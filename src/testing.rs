//! Scripted collaborators for component tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::{GenerateRequest, LanguageService, LlmError};
use crate::model::Task;
use crate::tracker::{IssueSnapshot, TicketingService, TrackerError};

enum Reply {
    Text(String),
    Fail(String),
}

/// Language service that answers by request label.
///
/// Each label has a queue of replies; the last one repeats forever.
#[derive(Default)]
pub struct ScriptedLanguage {
    replies: Mutex<HashMap<String, VecDeque<Reply>>>,
    requests: Mutex<Vec<GenerateRequest>>,
}

impl ScriptedLanguage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn answer(self, label: &str, text: &str) -> Self {
        self.push(label, Reply::Text(text.to_string()))
    }

    pub fn fail(self, label: &str, message: &str) -> Self {
        self.push(label, Reply::Fail(message.to_string()))
    }

    fn push(self, label: &str, reply: Reply) -> Self {
        self.replies
            .lock()
            .unwrap()
            .entry(label.to_string())
            .or_default()
            .push_back(reply);
        self
    }

    pub fn calls(&self, label: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.label == label)
            .count()
    }

    pub fn total_calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn last_request(&self, label: &str) -> Option<GenerateRequest> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|r| r.label == label)
            .cloned()
    }
}

#[async_trait]
impl LanguageService for ScriptedLanguage {
    async fn generate(&self, request: GenerateRequest) -> Result<String, LlmError> {
        let label = request.label.clone();
        self.requests.lock().unwrap().push(request);

        let mut replies = self.replies.lock().unwrap();
        let queue = replies
            .get_mut(&label)
            .ok_or_else(|| LlmError::InvalidResponse(format!("no scripted reply for {label}")))?;
        let reply = if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().map(|r| match r {
                Reply::Text(t) => Reply::Text(t.clone()),
                Reply::Fail(m) => Reply::Fail(m.clone()),
            })
        };
        match reply {
            Some(Reply::Text(text)) => Ok(text),
            Some(Reply::Fail(message)) => Err(LlmError::ApiError {
                status: 503,
                message,
            }),
            None => Err(LlmError::InvalidResponse(format!("no scripted reply for {label}"))),
        }
    }
}

/// In-memory ticketing service.
#[derive(Default)]
pub struct FakeTracker {
    state: Mutex<TrackerState>,
}

#[derive(Default)]
struct TrackerState {
    next_key: usize,
    issues: HashMap<String, IssueSnapshot>,
    created: Vec<Task>,
    failing_titles: Vec<String>,
    declined_titles: Vec<String>,
    reject_updates: bool,
    updates: Vec<(String, String)>,
}

impl FakeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// `create_issue` errors for tasks with this title.
    pub fn failing_on(self, title: &str) -> Self {
        self.state.lock().unwrap().failing_titles.push(title.to_string());
        self
    }

    /// `create_issue` returns no key for tasks with this title.
    pub fn declining(self, title: &str) -> Self {
        self.state.lock().unwrap().declined_titles.push(title.to_string());
        self
    }

    pub fn with_issue(self, key: &str, title: &str, description: &str) -> Self {
        self.state.lock().unwrap().issues.insert(
            key.to_string(),
            IssueSnapshot {
                key: key.to_string(),
                title: title.to_string(),
                description: description.to_string(),
            },
        );
        self
    }

    pub fn set_reject_updates(&self, reject: bool) {
        self.state.lock().unwrap().reject_updates = reject;
    }

    pub fn created_titles(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .created
            .iter()
            .map(|t| t.title.clone())
            .collect()
    }

    pub fn updates(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().updates.clone()
    }

    pub fn description(&self, key: &str) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .issues
            .get(key)
            .map(|i| i.description.clone())
    }
}

#[async_trait]
impl TicketingService for FakeTracker {
    async fn create_issue(&self, task: &Task) -> Result<Option<String>, TrackerError> {
        let mut state = self.state.lock().unwrap();
        if state.failing_titles.contains(&task.title) {
            return Err(TrackerError::Api {
                status: 500,
                message: format!("cannot create {}", task.title),
            });
        }
        if state.declined_titles.contains(&task.title) {
            return Ok(None);
        }
        state.next_key += 1;
        let key = format!("Q-{}", state.next_key);
        state.issues.insert(
            key.clone(),
            IssueSnapshot {
                key: key.clone(),
                title: task.title.clone(),
                description: task.description.clone(),
            },
        );
        state.created.push(task.clone());
        Ok(Some(key))
    }

    async fn get_issue(&self, key: &str) -> Result<Option<IssueSnapshot>, TrackerError> {
        Ok(self.state.lock().unwrap().issues.get(key).cloned())
    }

    async fn update_issue(&self, key: &str, description: &str) -> Result<bool, TrackerError> {
        let mut state = self.state.lock().unwrap();
        if state.reject_updates {
            return Ok(false);
        }
        let Some(issue) = state.issues.get_mut(key) else {
            return Ok(false);
        };
        issue.description = description.to_string();
        state.updates.push((key.to_string(), description.to_string()));
        Ok(true)
    }
}
