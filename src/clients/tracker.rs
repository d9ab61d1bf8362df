//! Work tracker client
//!
//! Typed facade over the external issue tracker's HTTP API. Claim atomicity
//! lives on the tracker side: a 409 means another node holds the claim and
//! this node must abandon the item.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::tasks::{Repository, WorkItem};

#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("tracker network error: {0}")]
    Network(String),

    #[error("tracker returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("tracker response decode failed: {0}")]
    Decode(String),
}

/// Outcome of an atomic claim attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The tracker assigned the item to this node.
    Accepted,
    /// Another node already holds the claim.
    Conflict,
}

/// Contract for the external work tracker.
#[async_trait]
pub trait WorkTracker: Send + Sync {
    async fn active_repositories(&self) -> Result<Vec<Repository>, TrackerError>;

    async fn candidate_items(&self, project_id: i64) -> Result<Vec<WorkItem>, TrackerError>;

    /// Attempt the exclusive claim. Must be atomic at the tracker.
    async fn claim_item(
        &self,
        project_id: i64,
        item_id: i64,
        claimant: &str,
    ) -> Result<ClaimOutcome, TrackerError>;

    async fn update_item_status(
        &self,
        project_id: i64,
        item_id: i64,
        status: &str,
        results: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> Result<(), TrackerError>;

    async fn health(&self) -> Result<(), TrackerError>;
}

#[derive(Debug, Deserialize)]
struct ActiveRepositoriesResponse {
    repositories: Vec<Repository>,
}

#[derive(Debug, Serialize)]
struct ClaimRequest<'a> {
    task_number: i64,
    agent_id: &'a str,
    claimed_at: i64,
}

#[derive(Debug, Serialize)]
struct StatusUpdate<'a> {
    status: &'a str,
    updated_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    results: Option<serde_json::Map<String, serde_json::Value>>,
    task_number: i64,
}

/// HTTP implementation of [`WorkTracker`].
pub struct TrackerClient {
    base_url: String,
    api_key: Option<String>,
    http: reqwest::Client,
    timeout: Duration,
}

impl TrackerClient {
    pub fn new(base_url: &str, api_key: Option<String>, timeout: Duration) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            http: reqwest::Client::new(),
            timeout,
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .http
            .request(method, format!("{}{}", self.base_url, path))
            .timeout(self.timeout);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        builder
    }
}

async fn error_for(response: reqwest::Response) -> TrackerError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    TrackerError::Http { status, body }
}

#[async_trait]
impl WorkTracker for TrackerClient {
    async fn active_repositories(&self) -> Result<Vec<Repository>, TrackerError> {
        let response = self
            .request(reqwest::Method::GET, "/active-repos")
            .send()
            .await
            .map_err(|e| TrackerError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(error_for(response).await);
        }

        let decoded: ActiveRepositoriesResponse = response
            .json()
            .await
            .map_err(|e| TrackerError::Decode(e.to_string()))?;
        Ok(decoded.repositories)
    }

    async fn candidate_items(&self, project_id: i64) -> Result<Vec<WorkItem>, TrackerError> {
        let response = self
            .request(
                reqwest::Method::GET,
                &format!("/projects/{}/tasks", project_id),
            )
            .send()
            .await
            .map_err(|e| TrackerError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(error_for(response).await);
        }

        response
            .json()
            .await
            .map_err(|e| TrackerError::Decode(e.to_string()))
    }

    async fn claim_item(
        &self,
        project_id: i64,
        item_id: i64,
        claimant: &str,
    ) -> Result<ClaimOutcome, TrackerError> {
        let request = ClaimRequest {
            task_number: item_id,
            agent_id: claimant,
            claimed_at: Utc::now().timestamp(),
        };

        let response = self
            .request(
                reqwest::Method::POST,
                &format!("/projects/{}/claim", project_id),
            )
            .json(&request)
            .send()
            .await
            .map_err(|e| TrackerError::Network(e.to_string()))?;

        match response.status() {
            StatusCode::OK | StatusCode::CREATED => Ok(ClaimOutcome::Accepted),
            StatusCode::CONFLICT => Ok(ClaimOutcome::Conflict),
            _ => Err(error_for(response).await),
        }
    }

    async fn update_item_status(
        &self,
        project_id: i64,
        item_id: i64,
        status: &str,
        results: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> Result<(), TrackerError> {
        let update = StatusUpdate {
            status,
            updated_at: Utc::now().timestamp(),
            results,
            task_number: item_id,
        };

        let response = self
            .request(
                reqwest::Method::PUT,
                &format!("/projects/{}/status", project_id),
            )
            .json(&update)
            .send()
            .await
            .map_err(|e| TrackerError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(error_for(response).await);
        }
        Ok(())
    }

    async fn health(&self) -> Result<(), TrackerError> {
        let response = self
            .request(reqwest::Method::GET, "/health")
            .send()
            .await
            .map_err(|e| TrackerError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(error_for(response).await);
        }
        Ok(())
    }
}
