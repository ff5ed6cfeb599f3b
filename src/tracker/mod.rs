//! Ticketing collaborator: creates, reads and updates issues.
//!
//! [`HttpTracker`] speaks a Yandex-Tracker-shaped REST API:
//! - `POST   {base}/issues/`       create, 201 with `{"key": ...}`
//! - `GET    {base}/issues/{key}`  read, 404 when missing
//! - `PATCH  {base}/issues/{key}`  update description

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::model::Task;

#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("tracker API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("missing credentials: {0}")]
    MissingCredentials(String),
}

/// Current state of an issue as the tracker reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueSnapshot {
    pub key: String,
    #[serde(alias = "summary")]
    pub title: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub description: String,
}

fn null_as_empty<'de, D: serde::Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    Ok(Option::<String>::deserialize(d)?.unwrap_or_default())
}

#[async_trait]
pub trait TicketingService: Send + Sync {
    /// `Ok(None)` means the tracker declined to create the issue.
    async fn create_issue(&self, task: &Task) -> Result<Option<String>, TrackerError>;

    async fn get_issue(&self, key: &str) -> Result<Option<IssueSnapshot>, TrackerError>;

    /// `Ok(false)` means the tracker rejected the update.
    async fn update_issue(&self, key: &str, description: &str) -> Result<bool, TrackerError>;
}

#[derive(Debug, Clone)]
pub struct HttpTracker {
    http: Client,
    base_url: String,
    queue: String,
    oauth_token: String,
    org_id: String,
}

#[derive(Debug, Serialize)]
struct CreateIssue<'a> {
    summary: &'a str,
    queue: &'a str,
    description: &'a str,
    #[serde(rename = "type")]
    issue_type: &'a str,
    priority: &'a str,
}

#[derive(Debug, Deserialize)]
struct Created {
    key: Option<String>,
}

impl HttpTracker {
    pub fn new(base_url: &str, queue: &str, oauth_token: String, org_id: String) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            queue: queue.to_string(),
            oauth_token,
            org_id,
        }
    }

    /// Reads `TRACKER_OAUTH_TOKEN` and `TRACKER_ORG_ID`.
    pub fn from_env(base_url: &str, queue: &str) -> Result<Self, TrackerError> {
        let token = std::env::var("TRACKER_OAUTH_TOKEN")
            .map_err(|_| TrackerError::MissingCredentials("TRACKER_OAUTH_TOKEN not set".into()))?;
        let org = std::env::var("TRACKER_ORG_ID")
            .map_err(|_| TrackerError::MissingCredentials("TRACKER_ORG_ID not set".into()))?;
        Ok(Self::new(base_url, queue, token, org))
    }

    fn issue_url(&self, key: &str) -> String {
        format!("{}/issues/{}", self.base_url, urlencoding::encode(key))
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .header("Authorization", format!("OAuth {}", self.oauth_token))
            .header("X-Org-ID", &self.org_id)
    }
}

#[async_trait]
impl TicketingService for HttpTracker {
    async fn create_issue(&self, task: &Task) -> Result<Option<String>, TrackerError> {
        let body = CreateIssue {
            summary: &task.title,
            queue: &self.queue,
            description: &task.description,
            issue_type: task.kind.tracker_type(),
            priority: task.priority.as_lowercase(),
        };
        let url = format!("{}/issues/", self.base_url);
        let response = self
            .authorized(self.http.post(&url))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::CREATED {
            let message = response.text().await.unwrap_or_default();
            warn!(task_id = %task.id, status = status.as_u16(), %message, "issue creation declined");
            return Ok(None);
        }

        let created: Created = response.json().await?;
        if let Some(key) = &created.key {
            info!(task_id = %task.id, issue_key = %key, "issue created");
        }
        Ok(created.key)
    }

    async fn get_issue(&self, key: &str) -> Result<Option<IssueSnapshot>, TrackerError> {
        let response = self
            .authorized(self.http.get(self.issue_url(key)))
            .send()
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => Ok(Some(response.json().await?)),
            s => Err(TrackerError::Api {
                status: s.as_u16(),
                message: response.text().await.unwrap_or_default(),
            }),
        }
    }

    async fn update_issue(&self, key: &str, description: &str) -> Result<bool, TrackerError> {
        let response = self
            .authorized(self.http.patch(self.issue_url(key)))
            .json(&serde_json::json!({ "description": description }))
            .send()
            .await?;

        let ok = response.status().is_success();
        debug!(issue_key = key, status = response.status().as_u16(), "issue update");
        Ok(ok)
    }
}
