//! Inbound event envelopes.
//!
//! Raw platform payloads are duck-shaped JSON; everything downstream works on
//! the normalized [`WebhookEnvelope`] tagged union instead. An envelope is
//! immutable once parsed and lives for exactly one dispatch attempt.

use serde::Deserialize;

use crate::error::{GatewayError, Result};

/// Source platform, decided from the inbound header pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    GitLab,
    GitHub,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::GitLab => "gitlab",
            Platform::GitHub => "github",
        }
    }
}

/// The triggering actor, flattened to the capabilities the classifier needs.
#[derive(Debug, Clone, PartialEq)]
pub struct Actor {
    pub id: i64,
    pub handle: String,
    pub is_bot: bool,
    pub is_system: bool,
}

/// The owning project.
#[derive(Debug, Clone, PartialEq)]
pub struct Project {
    pub id: i64,
    pub namespace: String,
    pub clone_url: String,
}

/// File/line anchor on a line-anchored comment, carried through verbatim.
#[derive(Debug, Clone, PartialEq)]
pub struct CodeAnchor {
    pub path: String,
    pub line: i64,
    pub base_sha: String,
    pub start_sha: Option<String>,
    pub head_sha: String,
}

/// What a comment is attached to.
#[derive(Debug, Clone, PartialEq)]
pub enum CommentTarget {
    Issue {
        iid: i64,
    },
    MergeRequest {
        iid: i64,
        source_branch: String,
        target_branch: String,
    },
    /// Commit and snippet notes, which the pipeline does not handle.
    Other(String),
}

/// Event payload variants, tagged by kind.
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    Issue {
        iid: i64,
        title: String,
        description: String,
    },
    Comment {
        note_id: i64,
        discussion_id: Option<String>,
        body: String,
        target: CommentTarget,
        anchor: Option<CodeAnchor>,
    },
    MergeRequest {
        iid: i64,
        title: String,
        description: String,
        source_branch: String,
        target_branch: String,
    },
    Other(String),
}

/// One parsed inbound event.
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookEnvelope {
    pub platform: Platform,
    /// Normalized action: GitLab's `open` becomes `opened` so both platforms
    /// read the same downstream.
    pub action: String,
    pub actor: Actor,
    pub project: Project,
    pub kind: EventKind,
}

impl WebhookEnvelope {
    /// Stable per-event identity used for dispatch addressing.
    pub fn event_id(&self) -> String {
        match &self.kind {
            EventKind::Issue { iid, .. } => format!("issue-{}", iid),
            EventKind::Comment { note_id, .. } => format!("note-{}", note_id),
            EventKind::MergeRequest { iid, .. } => format!("mr-{}", iid),
            EventKind::Other(kind) => format!("other-{}", kind),
        }
    }

    /// Parse a raw webhook body into an envelope.
    ///
    /// `event_header` is the platform's event-kind header value
    /// (`X-Gitlab-Event` / `X-GitHub-Event`). GitLab carries the kind in the
    /// body as well (`object_kind`); GitHub only in the header.
    pub fn parse(platform: Platform, event_header: &str, body: &[u8]) -> Result<Self> {
        match platform {
            Platform::GitLab => parse_gitlab(body),
            Platform::GitHub => parse_github(event_header, body),
        }
    }
}

fn normalize_action(action: &str) -> String {
    match action {
        "open" => "opened".to_string(),
        "close" => "closed".to_string(),
        "reopen" => "reopened".to_string(),
        "update" => "updated".to_string(),
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// GitLab payload shapes
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct GitLabPayload {
    object_kind: String,
    user: Option<GitLabUser>,
    project: Option<GitLabProject>,
    object_attributes: Option<GitLabObjectAttributes>,
    merge_request: Option<GitLabMergeRequestRef>,
    issue: Option<GitLabIssueRef>,
}

#[derive(Deserialize)]
struct GitLabUser {
    id: i64,
    username: String,
    #[serde(default)]
    bot: bool,
}

#[derive(Deserialize)]
struct GitLabProject {
    id: i64,
    path_with_namespace: String,
    git_http_url: String,
}

#[derive(Deserialize)]
struct GitLabObjectAttributes {
    id: Option<i64>,
    iid: Option<i64>,
    action: Option<String>,
    title: Option<String>,
    description: Option<String>,
    note: Option<String>,
    noteable_type: Option<String>,
    discussion_id: Option<String>,
    #[serde(default)]
    system: bool,
    source_branch: Option<String>,
    target_branch: Option<String>,
    position: Option<GitLabPosition>,
}

#[derive(Deserialize)]
struct GitLabPosition {
    new_path: Option<String>,
    old_path: Option<String>,
    new_line: Option<i64>,
    old_line: Option<i64>,
    base_sha: Option<String>,
    start_sha: Option<String>,
    head_sha: Option<String>,
}

#[derive(Deserialize)]
struct GitLabMergeRequestRef {
    iid: i64,
    source_branch: String,
    target_branch: String,
}

#[derive(Deserialize)]
struct GitLabIssueRef {
    iid: i64,
}

fn parse_gitlab(body: &[u8]) -> Result<WebhookEnvelope> {
    let payload: GitLabPayload = serde_json::from_slice(body)
        .map_err(|e| GatewayError::BadEvent(format!("unparseable GitLab payload: {}", e)))?;

    let user = payload
        .user
        .ok_or_else(|| GatewayError::BadEvent("missing user".to_string()))?;
    let project = payload
        .project
        .ok_or_else(|| GatewayError::BadEvent("missing project".to_string()))?;
    let attrs = payload
        .object_attributes
        .ok_or_else(|| GatewayError::BadEvent("missing object_attributes".to_string()))?;

    let actor = Actor {
        id: user.id,
        handle: user.username,
        is_bot: user.bot,
        // System-generated notes carry object_attributes.system; other event
        // kinds are always user-initiated on GitLab.
        is_system: attrs.system,
    };
    let project = Project {
        id: project.id,
        namespace: project.path_with_namespace,
        clone_url: project.git_http_url,
    };
    let action = normalize_action(attrs.action.as_deref().unwrap_or_default());

    let kind = match payload.object_kind.as_str() {
        "issue" => EventKind::Issue {
            iid: attrs
                .iid
                .ok_or_else(|| GatewayError::BadEvent("issue event without iid".to_string()))?,
            title: attrs.title.unwrap_or_default(),
            description: attrs.description.unwrap_or_default(),
        },
        "note" => {
            let target = match attrs.noteable_type.as_deref() {
                Some("Issue") => {
                    let issue = payload.issue.ok_or_else(|| {
                        GatewayError::BadEvent("issue note without issue".to_string())
                    })?;
                    CommentTarget::Issue { iid: issue.iid }
                }
                Some("MergeRequest") => {
                    let mr = payload.merge_request.ok_or_else(|| {
                        GatewayError::BadEvent("MR note without merge_request".to_string())
                    })?;
                    CommentTarget::MergeRequest {
                        iid: mr.iid,
                        source_branch: mr.source_branch,
                        target_branch: mr.target_branch,
                    }
                }
                other => CommentTarget::Other(other.unwrap_or("unknown").to_string()),
            };
            EventKind::Comment {
                note_id: attrs
                    .id
                    .ok_or_else(|| GatewayError::BadEvent("note event without id".to_string()))?,
                discussion_id: attrs.discussion_id,
                body: attrs.note.unwrap_or_default(),
                target,
                anchor: attrs.position.and_then(position_to_anchor),
            }
        }
        "merge_request" => EventKind::MergeRequest {
            iid: attrs
                .iid
                .ok_or_else(|| GatewayError::BadEvent("MR event without iid".to_string()))?,
            title: attrs.title.unwrap_or_default(),
            description: attrs.description.unwrap_or_default(),
            source_branch: attrs.source_branch.unwrap_or_default(),
            target_branch: attrs.target_branch.unwrap_or_default(),
        },
        other => EventKind::Other(other.to_string()),
    };

    Ok(WebhookEnvelope {
        platform: Platform::GitLab,
        action,
        actor,
        project,
        kind,
    })
}

fn position_to_anchor(pos: GitLabPosition) -> Option<CodeAnchor> {
    // A position is only usable as an anchor when it names a file, a line
    // and the SHAs that pin the diff.
    let path = pos.new_path.or(pos.old_path)?;
    let line = pos.new_line.or(pos.old_line)?;
    Some(CodeAnchor {
        path,
        line,
        base_sha: pos.base_sha?,
        start_sha: pos.start_sha,
        head_sha: pos.head_sha?,
    })
}

// ---------------------------------------------------------------------------
// GitHub payload shapes
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct GitHubPayload {
    action: Option<String>,
    sender: Option<GitHubUser>,
    repository: Option<GitHubRepository>,
    issue: Option<GitHubIssue>,
    comment: Option<GitHubComment>,
    pull_request: Option<GitHubPullRequest>,
}

#[derive(Deserialize)]
struct GitHubUser {
    id: i64,
    login: String,
    #[serde(rename = "type")]
    user_type: Option<String>,
}

#[derive(Deserialize)]
struct GitHubRepository {
    id: i64,
    full_name: String,
    clone_url: String,
}

#[derive(Deserialize)]
struct GitHubIssue {
    number: i64,
    title: Option<String>,
    body: Option<String>,
    pull_request: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct GitHubComment {
    id: i64,
    body: String,
}

#[derive(Deserialize)]
struct GitHubPullRequest {
    number: i64,
    title: Option<String>,
    body: Option<String>,
    head: GitHubBranchRef,
    base: GitHubBranchRef,
}

#[derive(Deserialize)]
struct GitHubBranchRef {
    #[serde(rename = "ref")]
    ref_name: String,
}

fn parse_github(event_header: &str, body: &[u8]) -> Result<WebhookEnvelope> {
    let payload: GitHubPayload = serde_json::from_slice(body)
        .map_err(|e| GatewayError::BadEvent(format!("unparseable GitHub payload: {}", e)))?;

    let sender = payload
        .sender
        .ok_or_else(|| GatewayError::BadEvent("missing sender".to_string()))?;
    let repository = payload
        .repository
        .ok_or_else(|| GatewayError::BadEvent("missing repository".to_string()))?;

    let actor = Actor {
        id: sender.id,
        handle: sender.login.clone(),
        is_bot: sender.user_type.as_deref() == Some("Bot"),
        is_system: false,
    };
    let project = Project {
        id: repository.id,
        namespace: repository.full_name,
        clone_url: repository.clone_url,
    };
    let action = normalize_action(payload.action.as_deref().unwrap_or_default());

    let kind = match event_header {
        "issues" => {
            let issue = payload
                .issue
                .ok_or_else(|| GatewayError::BadEvent("issues event without issue".to_string()))?;
            EventKind::Issue {
                iid: issue.number,
                title: issue.title.unwrap_or_default(),
                description: issue.body.unwrap_or_default(),
            }
        }
        "issue_comment" => {
            let issue = payload.issue.ok_or_else(|| {
                GatewayError::BadEvent("issue_comment event without issue".to_string())
            })?;
            let comment = payload.comment.ok_or_else(|| {
                GatewayError::BadEvent("issue_comment event without comment".to_string())
            })?;
            // GitHub routes PR conversation comments through issue_comment;
            // the pipeline needs branch data it does not carry, so those are
            // targeted as plain issues only when no PR link is present.
            let target = if issue.pull_request.is_some() {
                CommentTarget::Other("pull_request_conversation".to_string())
            } else {
                CommentTarget::Issue { iid: issue.number }
            };
            EventKind::Comment {
                note_id: comment.id,
                discussion_id: None,
                body: comment.body,
                target,
                anchor: None,
            }
        }
        "pull_request" => {
            let pr = payload.pull_request.ok_or_else(|| {
                GatewayError::BadEvent("pull_request event without pull_request".to_string())
            })?;
            EventKind::MergeRequest {
                iid: pr.number,
                title: pr.title.unwrap_or_default(),
                description: pr.body.unwrap_or_default(),
                source_branch: pr.head.ref_name,
                target_branch: pr.base.ref_name,
            }
        }
        other => EventKind::Other(other.to_string()),
    };

    Ok(WebhookEnvelope {
        platform: Platform::GitHub,
        action,
        actor,
        project,
        kind,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn gitlab_note_payload() -> serde_json::Value {
        json!({
            "object_kind": "note",
            "user": { "id": 7, "username": "dev" },
            "project": {
                "id": 42,
                "path_with_namespace": "acme/app",
                "git_http_url": "https://gitlab.example.com/acme/app.git"
            },
            "object_attributes": {
                "id": 1001,
                "note": "@agent take a look",
                "noteable_type": "MergeRequest",
                "discussion_id": "abc123",
                "system": false,
                "position": {
                    "new_path": "src/main.rs",
                    "new_line": 14,
                    "base_sha": "aaa",
                    "start_sha": "bbb",
                    "head_sha": "ccc"
                }
            },
            "merge_request": {
                "iid": 5,
                "source_branch": "feature",
                "target_branch": "main"
            }
        })
    }

    #[test]
    fn parses_gitlab_mr_note_with_anchor() {
        let body = serde_json::to_vec(&gitlab_note_payload()).unwrap();
        let envelope = WebhookEnvelope::parse(Platform::GitLab, "Note Hook", &body).unwrap();

        assert_eq!(envelope.actor.handle, "dev");
        assert_eq!(envelope.project.namespace, "acme/app");
        match &envelope.kind {
            EventKind::Comment {
                note_id,
                discussion_id,
                target,
                anchor,
                ..
            } => {
                assert_eq!(*note_id, 1001);
                assert_eq!(discussion_id.as_deref(), Some("abc123"));
                assert!(matches!(target, CommentTarget::MergeRequest { iid: 5, .. }));
                let anchor = anchor.as_ref().unwrap();
                assert_eq!(anchor.path, "src/main.rs");
                assert_eq!(anchor.line, 14);
                assert_eq!(anchor.base_sha, "aaa");
                assert_eq!(anchor.start_sha.as_deref(), Some("bbb"));
                assert_eq!(anchor.head_sha, "ccc");
            }
            other => panic!("expected comment, got {:?}", other),
        }
        assert_eq!(envelope.event_id(), "note-1001");
    }

    #[test]
    fn gitlab_open_action_is_normalized_to_opened() {
        let body = serde_json::to_vec(&json!({
            "object_kind": "issue",
            "user": { "id": 7, "username": "dev" },
            "project": {
                "id": 42,
                "path_with_namespace": "acme/app",
                "git_http_url": "https://gitlab.example.com/acme/app.git"
            },
            "object_attributes": {
                "iid": 3,
                "action": "open",
                "title": "Crash on startup",
                "description": "Stack trace attached"
            }
        }))
        .unwrap();

        let envelope = WebhookEnvelope::parse(Platform::GitLab, "Issue Hook", &body).unwrap();
        assert_eq!(envelope.action, "opened");
        assert!(matches!(envelope.kind, EventKind::Issue { iid: 3, .. }));
    }

    #[test]
    fn unknown_object_kind_becomes_other() {
        let body = serde_json::to_vec(&json!({
            "object_kind": "pipeline",
            "user": { "id": 7, "username": "dev" },
            "project": {
                "id": 42,
                "path_with_namespace": "acme/app",
                "git_http_url": "https://gitlab.example.com/acme/app.git"
            },
            "object_attributes": {}
        }))
        .unwrap();

        let envelope = WebhookEnvelope::parse(Platform::GitLab, "Pipeline Hook", &body).unwrap();
        assert_eq!(envelope.kind, EventKind::Other("pipeline".to_string()));
    }

    #[test]
    fn position_without_shas_is_not_an_anchor() {
        let mut payload = gitlab_note_payload();
        payload["object_attributes"]["position"] = json!({
            "new_path": "src/main.rs",
            "new_line": 14
        });
        let body = serde_json::to_vec(&payload).unwrap();

        let envelope = WebhookEnvelope::parse(Platform::GitLab, "Note Hook", &body).unwrap();
        match envelope.kind {
            EventKind::Comment { anchor, .. } => assert!(anchor.is_none()),
            other => panic!("expected comment, got {:?}", other),
        }
    }

    #[test]
    fn unparseable_body_is_a_bad_event() {
        let err = WebhookEnvelope::parse(Platform::GitLab, "Issue Hook", b"not json").unwrap_err();
        assert!(matches!(err, GatewayError::BadEvent(_)));
    }

    #[test]
    fn parses_github_issue_event() {
        let body = serde_json::to_vec(&json!({
            "action": "opened",
            "sender": { "id": 9, "login": "dev", "type": "User" },
            "repository": {
                "id": 77,
                "full_name": "acme/app",
                "clone_url": "https://github.com/acme/app.git"
            },
            "issue": { "number": 12, "title": "Bug", "body": "Details" }
        }))
        .unwrap();

        let envelope = WebhookEnvelope::parse(Platform::GitHub, "issues", &body).unwrap();
        assert_eq!(envelope.action, "opened");
        assert!(!envelope.actor.is_bot);
        assert!(matches!(envelope.kind, EventKind::Issue { iid: 12, .. }));
    }

    #[test]
    fn github_bot_sender_is_flagged() {
        let body = serde_json::to_vec(&json!({
            "action": "created",
            "sender": { "id": 9, "login": "dependabot[bot]", "type": "Bot" },
            "repository": {
                "id": 77,
                "full_name": "acme/app",
                "clone_url": "https://github.com/acme/app.git"
            },
            "issue": { "number": 12 },
            "comment": { "id": 5001, "body": "bump" }
        }))
        .unwrap();

        let envelope = WebhookEnvelope::parse(Platform::GitHub, "issue_comment", &body).unwrap();
        assert!(envelope.actor.is_bot);
    }
}
