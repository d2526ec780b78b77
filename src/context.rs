//! Execution context assembly.
//!
//! The execution unit consumes a flat, string-valued map. The map is only
//! built through mode-typed constructors, so every field a mode requires is
//! present by construction; a missing field is a build-time error here, never
//! a runtime surprise in the unit.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::classify::{Classification, ProcessingMode};
use crate::envelope::{CodeAnchor, CommentTarget, EventKind, WebhookEnvelope};
use crate::error::{GatewayError, Result};
use crate::store::CredentialStore;

/// The flattened execution context handed to the execution unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessingContext {
    values: BTreeMap<String, String>,
}

/// Fields shared by every processing mode.
pub struct CommonFields<'a> {
    pub base_url: &'a str,
    pub token: &'a str,
    pub agent_token: &'a str,
    pub project_id: i64,
    pub project_namespace: &'a str,
    pub clone_url: &'a str,
    pub actor_handle: &'a str,
}

impl ProcessingContext {
    fn common(mode: ProcessingMode, fields: &CommonFields<'_>) -> Self {
        let mut values = BTreeMap::new();
        values.insert("mode".to_string(), mode.as_str().to_string());
        values.insert("base_url".to_string(), fields.base_url.to_string());
        values.insert("token".to_string(), fields.token.to_string());
        values.insert("agent_token".to_string(), fields.agent_token.to_string());
        values.insert("project_id".to_string(), fields.project_id.to_string());
        values.insert(
            "project_namespace".to_string(),
            fields.project_namespace.to_string(),
        );
        values.insert("clone_url".to_string(), fields.clone_url.to_string());
        values.insert("actor_handle".to_string(), fields.actor_handle.to_string());
        Self { values }
    }

    fn set(&mut self, key: &str, value: impl Into<String>) {
        self.values.insert(key.to_string(), value.into());
    }

    fn set_anchor(&mut self, anchor: &CodeAnchor) {
        self.set("file_path", anchor.path.clone());
        self.set("file_line", anchor.line.to_string());
        self.set("base_sha", anchor.base_sha.clone());
        if let Some(start_sha) = &anchor.start_sha {
            self.set("start_sha", start_sha.clone());
        }
        self.set("head_sha", anchor.head_sha.clone());
    }

    pub fn for_issue(
        fields: &CommonFields<'_>,
        iid: i64,
        title: &str,
        description: &str,
    ) -> Self {
        let mut ctx = Self::common(ProcessingMode::Issue, fields);
        ctx.set("issue_iid", iid.to_string());
        ctx.set("issue_title", title);
        ctx.set("issue_description", description);
        ctx
    }

    pub fn for_issue_comment(
        fields: &CommonFields<'_>,
        issue_iid: i64,
        comment_id: i64,
        discussion_id: Option<&str>,
        prompt: &str,
    ) -> Self {
        let mut ctx = Self::common(ProcessingMode::IssueComment, fields);
        ctx.set("issue_iid", issue_iid.to_string());
        ctx.set("comment_id", comment_id.to_string());
        if let Some(discussion_id) = discussion_id {
            ctx.set("discussion_id", discussion_id);
        }
        ctx.set("prompt", prompt);
        ctx
    }

    #[allow(clippy::too_many_arguments)]
    pub fn for_mr_comment(
        fields: &CommonFields<'_>,
        mr_iid: i64,
        comment_id: i64,
        discussion_id: Option<&str>,
        prompt: &str,
        source_branch: &str,
        target_branch: &str,
        anchor: Option<&CodeAnchor>,
    ) -> Self {
        let mut ctx = Self::common(ProcessingMode::MrComment, fields);
        ctx.set("mr_iid", mr_iid.to_string());
        ctx.set("comment_id", comment_id.to_string());
        if let Some(discussion_id) = discussion_id {
            ctx.set("discussion_id", discussion_id);
        }
        ctx.set("prompt", prompt);
        ctx.set("source_branch", source_branch);
        ctx.set("target_branch", target_branch);
        if let Some(anchor) = anchor {
            ctx.set_anchor(anchor);
        }
        ctx
    }

    #[allow(clippy::too_many_arguments)]
    pub fn for_mr_creation(
        fields: &CommonFields<'_>,
        mr_iid: i64,
        title: &str,
        description: &str,
        source_branch: &str,
        target_branch: &str,
        prompt: &str,
    ) -> Self {
        let mut ctx = Self::common(ProcessingMode::MrCreation, fields);
        ctx.set("mr_iid", mr_iid.to_string());
        ctx.set("mr_title", title);
        ctx.set("mr_description", description);
        ctx.set("source_branch", source_branch);
        ctx.set("target_branch", target_branch);
        ctx.set("prompt", prompt);
        ctx
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Field access on the consuming side; missing keys become execution
    /// failures with the field name in the message.
    pub fn require(&self, key: &str) -> Result<&str> {
        self.get(key)
            .ok_or_else(|| GatewayError::ExecutionFailed(format!("context field '{}' missing", key)))
    }

    pub fn mode(&self) -> Option<&str> {
        self.get("mode")
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.values.iter()
    }
}

/// Combines a classification with credentials and project metadata.
pub struct ContextBuilder<'a> {
    store: &'a CredentialStore,
}

impl<'a> ContextBuilder<'a> {
    pub fn new(store: &'a CredentialStore) -> Self {
        Self { store }
    }

    /// Build the full context or fail without partially populating anything.
    pub async fn build(
        &self,
        classification: &Classification,
        envelope: &WebhookEnvelope,
    ) -> Result<ProcessingContext> {
        let project = &envelope.project;
        let record = self
            .store
            .resolve(project.id, &project.namespace)
            .await?
            .ok_or_else(|| GatewayError::NotConfigured(project.namespace.clone()))?;

        let agent_token = self
            .store
            .agent_secret()
            .await?
            .ok_or(GatewayError::AgentNotConfigured)?;

        let fields = CommonFields {
            base_url: &record.base_url,
            token: &record.token,
            agent_token: &agent_token,
            project_id: project.id,
            project_namespace: &project.namespace,
            clone_url: &project.clone_url,
            actor_handle: &envelope.actor.handle,
        };
        let prompt = classification.prompt.as_deref().unwrap_or_default();

        let context = match (classification.mode, &envelope.kind) {
            (
                ProcessingMode::Issue,
                EventKind::Issue {
                    iid,
                    title,
                    description,
                },
            ) => ProcessingContext::for_issue(&fields, *iid, title, description),
            (
                ProcessingMode::IssueComment,
                EventKind::Comment {
                    note_id,
                    discussion_id,
                    target: CommentTarget::Issue { iid },
                    ..
                },
            ) => ProcessingContext::for_issue_comment(
                &fields,
                *iid,
                *note_id,
                discussion_id.as_deref(),
                prompt,
            ),
            (
                ProcessingMode::MrComment,
                EventKind::Comment {
                    note_id,
                    discussion_id,
                    target:
                        CommentTarget::MergeRequest {
                            iid,
                            source_branch,
                            target_branch,
                        },
                    ..
                },
            ) => ProcessingContext::for_mr_comment(
                &fields,
                *iid,
                *note_id,
                discussion_id.as_deref(),
                prompt,
                source_branch,
                target_branch,
                classification.anchor.as_ref(),
            ),
            (
                ProcessingMode::MrCreation,
                EventKind::MergeRequest {
                    iid,
                    title,
                    description,
                    source_branch,
                    target_branch,
                },
            ) => ProcessingContext::for_mr_creation(
                &fields,
                *iid,
                title,
                description,
                source_branch,
                target_branch,
                prompt,
            ),
            (mode, _) => {
                return Err(GatewayError::BadEvent(format!(
                    "classification mode '{}' does not match the event payload",
                    mode.as_str()
                )));
            }
        };
        Ok(context)
    }
}
