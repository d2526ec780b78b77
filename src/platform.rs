//! REST collaborator seam for the source-control platform.
//!
//! The pipeline only needs three synchronous call/result operations from the
//! platform: credential validation, posting a comment or threaded reply, and
//! opening a merge request. Everything else about the platform API stays
//! behind this trait.

use async_trait::async_trait;
use serde_json::json;
use tracing::info;

use crate::error::{GatewayError, Result};

/// What a comment should be attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Noteable {
    Issue(i64),
    MergeRequest(i64),
}

#[async_trait]
pub trait PlatformClient: Send + Sync {
    /// Check a token against the platform's identity endpoint.
    async fn validate_credentials(&self, base_url: &str, token: &str) -> Result<bool>;

    /// Post a comment, or a threaded reply when `discussion_id` is given.
    async fn post_comment(
        &self,
        base_url: &str,
        token: &str,
        project_id: i64,
        target: Noteable,
        discussion_id: Option<&str>,
        body: &str,
    ) -> Result<()>;

    /// Open a merge request from `source_branch` into `target_branch`.
    async fn create_merge_request(
        &self,
        base_url: &str,
        token: &str,
        project_id: i64,
        source_branch: &str,
        target_branch: &str,
        title: &str,
        description: &str,
    ) -> Result<()>;
}

/// GitLab-shaped REST implementation.
pub struct RestPlatformClient {
    http: reqwest::Client,
}

impl RestPlatformClient {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }

    fn api(base_url: &str, path: &str) -> String {
        format!("{}/api/v4/{}", base_url.trim_end_matches('/'), path)
    }
}

impl Default for RestPlatformClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PlatformClient for RestPlatformClient {
    async fn validate_credentials(&self, base_url: &str, token: &str) -> Result<bool> {
        let response = self
            .http
            .get(Self::api(base_url, "user"))
            .header("PRIVATE-TOKEN", token)
            .send()
            .await
            .map_err(|e| GatewayError::Platform(format!("identity check failed: {}", e)))?;
        Ok(response.status().is_success())
    }

    async fn post_comment(
        &self,
        base_url: &str,
        token: &str,
        project_id: i64,
        target: Noteable,
        discussion_id: Option<&str>,
        body: &str,
    ) -> Result<()> {
        let (kind, iid) = match target {
            Noteable::Issue(iid) => ("issues", iid),
            Noteable::MergeRequest(iid) => ("merge_requests", iid),
        };
        // Threaded replies go through the discussion endpoint, plain comments
        // through notes.
        let path = match discussion_id {
            Some(discussion_id) => format!(
                "projects/{}/{}/{}/discussions/{}/notes",
                project_id, kind, iid, discussion_id
            ),
            None => format!("projects/{}/{}/{}/notes", project_id, kind, iid),
        };

        let response = self
            .http
            .post(Self::api(base_url, &path))
            .header("PRIVATE-TOKEN", token)
            .json(&json!({ "body": body }))
            .send()
            .await
            .map_err(|e| GatewayError::Platform(format!("comment post failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(GatewayError::Platform(format!(
                "comment post returned status {}",
                response.status()
            )));
        }
        info!("Posted comment on {} {} in project {}", kind, iid, project_id);
        Ok(())
    }

    async fn create_merge_request(
        &self,
        base_url: &str,
        token: &str,
        project_id: i64,
        source_branch: &str,
        target_branch: &str,
        title: &str,
        description: &str,
    ) -> Result<()> {
        let path = format!("projects/{}/merge_requests", project_id);
        let response = self
            .http
            .post(Self::api(base_url, &path))
            .header("PRIVATE-TOKEN", token)
            .json(&json!({
                "source_branch": source_branch,
                "target_branch": target_branch,
                "title": title,
                "description": description,
            }))
            .send()
            .await
            .map_err(|e| GatewayError::Platform(format!("MR creation failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(GatewayError::Platform(format!(
                "MR creation returned status {}",
                response.status()
            )));
        }
        info!(
            "Opened merge request {} -> {} in project {}",
            source_branch, target_branch, project_id
        );
        Ok(())
    }
}
