//! Inbound webhook pipeline handler.
//!
//! One request walks the whole pipeline: platform detection, envelope
//! parsing, credential resolution, proof-of-origin check, classification,
//! context build, dispatch. Drops acknowledge with 200 so the platform does
//! not retry intentionally ignored events.

use axum::{
    Json,
    body::Bytes,
    extract::State as AxumState,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::SharedState;
use crate::auth;
use crate::classify::{Decision, ProcessingMode, classify};
use crate::context::ContextBuilder;
use crate::dispatch::derive_address;
use crate::envelope::{CommentTarget, EventKind, Platform, WebhookEnvelope};
use crate::error::GatewayError;
use crate::platform::Noteable;
use crate::store::CredentialRecord;
use crate::{AppState, PipelineCounters};

const GITLAB_EVENT_HEADER: &str = "X-Gitlab-Event";
const GITHUB_EVENT_HEADER: &str = "X-GitHub-Event";

fn detect_platform(headers: &HeaderMap) -> Option<(Platform, String)> {
    if let Some(event) = headers.get(GITLAB_EVENT_HEADER).and_then(|v| v.to_str().ok()) {
        return Some((Platform::GitLab, event.to_string()));
    }
    if let Some(event) = headers.get(GITHUB_EVENT_HEADER).and_then(|v| v.to_str().ok()) {
        return Some((Platform::GitHub, event.to_string()));
    }
    None
}

fn error_response(err: &GatewayError) -> Response {
    (err.status(), Json(json!({ "error": err.to_string() }))).into_response()
}

/// Handles the webhook POST request from the source platform.
pub async fn handle_webhook(
    AxumState(state): AxumState<SharedState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    PipelineCounters::bump(&state.counters.received);
    let correlation_id = Uuid::now_v7();

    let Some((platform, event_header)) = detect_platform(&headers) else {
        warn!("[{}] Webhook without a platform event header", correlation_id);
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "missing event header" })),
        )
            .into_response();
    };

    let envelope = match WebhookEnvelope::parse(platform, &event_header, &body) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!("Could not parse {} payload: {}", platform.as_str(), e);
            return error_response(&e);
        }
    };
    let project = &envelope.project;

    // The webhook secret lives in the credential record, so resolution comes
    // before the authentication gate.
    let record = match state.store.resolve(project.id, &project.namespace).await {
        Ok(Some(record)) => record,
        Ok(None) => {
            warn!("No credentials configured for project '{}'", project.namespace);
            return error_response(&GatewayError::NotConfigured(project.namespace.clone()));
        }
        Err(e) => {
            error!("Credential lookup failed: {}", e);
            return error_response(&e);
        }
    };

    if !auth::authenticate(platform, &headers, &body, &record.webhook_secret) {
        warn!(
            "Proof-of-origin check failed for project '{}' ({})",
            project.namespace,
            platform.as_str()
        );
        return error_response(&GatewayError::Authentication(
            "invalid proof-of-origin".to_string(),
        ));
    }

    let classification = match classify(&envelope, &state.config.trigger_token) {
        Decision::Ignore { reason } => {
            info!(
                "Ignoring {} event for '{}': {}",
                platform.as_str(),
                project.namespace,
                reason
            );
            PipelineCounters::bump(&state.counters.ignored);
            return (
                StatusCode::OK,
                Json(json!({ "status": "ignored", "reason": reason })),
            )
                .into_response();
        }
        Decision::Process(classification) => classification,
    };

    let context = match ContextBuilder::new(&state.store)
        .build(&classification, &envelope)
        .await
    {
        Ok(context) => context,
        Err(e) => {
            error!("Context build failed for '{}': {}", project.namespace, e);
            return error_response(&e);
        }
    };

    let address = derive_address(
        platform.as_str(),
        classification.mode.as_str(),
        &envelope.event_id(),
    );
    info!(
        "[{}] Dispatching '{}' event for '{}' as unit '{}'",
        correlation_id,
        classification.mode.as_str(),
        project.namespace,
        address
    );

    match state.router.dispatch(&context, &address).await {
        Ok(outcome) if outcome.success => {
            PipelineCounters::bump(&state.counters.dispatched);
            (
                StatusCode::OK,
                Json(json!({
                    "status": "processed",
                    "message": outcome.message,
                    "actions": outcome.actions.unwrap_or_default(),
                })),
            )
                .into_response()
        }
        Ok(outcome) => {
            PipelineCounters::bump(&state.counters.failed);
            let detail = outcome.error.unwrap_or_else(|| outcome.message.clone());
            mirror_failure(&state, &record, &envelope, classification.mode, &detail).await;
            error_response(&GatewayError::ExecutionFailed(detail))
        }
        Err(e) => {
            PipelineCounters::bump(&state.counters.failed);
            error_response(&e)
        }
    }
}

/// Best-effort: surface an execution failure back into the originating
/// thread so a human sees it without reading gateway logs.
async fn mirror_failure(
    state: &AppState,
    record: &CredentialRecord,
    envelope: &WebhookEnvelope,
    mode: ProcessingMode,
    detail: &str,
) {
    let EventKind::Comment {
        discussion_id,
        target,
        ..
    } = &envelope.kind
    else {
        return;
    };
    let noteable = match target {
        CommentTarget::Issue { iid } => Noteable::Issue(*iid),
        CommentTarget::MergeRequest { iid, .. } => Noteable::MergeRequest(*iid),
        CommentTarget::Other(_) => return,
    };

    let body = format!(
        "The automated agent could not complete this {} request:\n\n```\n{}\n```",
        mode.as_str(),
        detail
    );
    if let Err(e) = state
        .platform_client
        .post_comment(
            &record.base_url,
            &record.token,
            envelope.project.id,
            noteable,
            discussion_id.as_deref(),
            &body,
        )
        .await
    {
        warn!("Could not mirror failure back to the platform: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::DispatchRouter;
    use crate::error::Result;
    use crate::platform::PlatformClient;
    use crate::store::{CredentialScope, CredentialStore, GroupMatch};
    use crate::{GatewayConfig, PipelineCounters};
    use async_trait::async_trait;
    use axum::http::HeaderValue;
    use chrono::Utc;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::sync::Arc;
    use std::time::Instant;

    struct NoopPlatform;

    #[async_trait]
    impl PlatformClient for NoopPlatform {
        async fn validate_credentials(&self, _: &str, _: &str) -> Result<bool> {
            Ok(true)
        }
        async fn post_comment(
            &self,
            _: &str,
            _: &str,
            _: i64,
            _: Noteable,
            _: Option<&str>,
            _: &str,
        ) -> Result<()> {
            Ok(())
        }
        async fn create_merge_request(
            &self,
            _: &str,
            _: &str,
            _: i64,
            _: &str,
            _: &str,
            _: &str,
            _: &str,
        ) -> Result<()> {
            Ok(())
        }
    }

    async fn shared_state(unit_base_url: &str) -> SharedState {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        let store = CredentialStore::new(pool, "test-app-secret", GroupMatch::Prefix);
        store
            .put(&CredentialRecord {
                owner_key: "42".to_string(),
                scope: CredentialScope::Project,
                base_url: "https://gitlab.example.com".to_string(),
                token: "glpat-abc".to_string(),
                webhook_secret: "hook-secret".to_string(),
                auto_discover: false,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            })
            .await
            .unwrap();
        store.put_agent_secret("sk-agent").await.unwrap();

        Arc::new(AppState {
            config: GatewayConfig {
                database_path: ":memory:".to_string(),
                app_secret: "test-app-secret".to_string(),
                unit_base_url: unit_base_url.to_string(),
                trigger_token: "@agent".to_string(),
                group_match: GroupMatch::Prefix,
                validate_credentials: false,
            },
            store,
            router: DispatchRouter::new(unit_base_url.to_string()),
            platform_client: Arc::new(NoopPlatform),
            counters: PipelineCounters::default(),
            start_time: Instant::now(),
            started_at: Utc::now(),
        })
    }

    fn gitlab_headers(event: &str, token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(GITLAB_EVENT_HEADER, HeaderValue::from_str(event).unwrap());
        headers.insert("X-Gitlab-Token", HeaderValue::from_str(token).unwrap());
        headers
    }

    fn issue_opened_body() -> Bytes {
        Bytes::from(
            serde_json::to_vec(&json!({
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
                    "title": "Crash",
                    "description": "Trace"
                }
            }))
            .unwrap(),
        )
    }

    fn comment_body(note: &str) -> Bytes {
        Bytes::from(
            serde_json::to_vec(&json!({
                "object_kind": "note",
                "user": { "id": 7, "username": "dev" },
                "project": {
                    "id": 42,
                    "path_with_namespace": "acme/app",
                    "git_http_url": "https://gitlab.example.com/acme/app.git"
                },
                "object_attributes": {
                    "id": 1001,
                    "note": note,
                    "noteable_type": "Issue"
                },
                "issue": { "iid": 3 }
            }))
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn missing_event_header_is_bad_request() {
        let state = shared_state("http://127.0.0.1:1").await;
        let response = handle_webhook(
            AxumState(state),
            HeaderMap::new(),
            issue_opened_body(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn invalid_token_is_unauthorized_and_nothing_dispatches() {
        let state = shared_state("http://127.0.0.1:1").await;
        let response = handle_webhook(
            AxumState(state.clone()),
            gitlab_headers("Issue Hook", "wrong-secret"),
            issue_opened_body(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(PipelineCounters::read(&state.counters.dispatched), 0);
        assert_eq!(PipelineCounters::read(&state.counters.failed), 0);
    }

    #[tokio::test]
    async fn unconfigured_project_is_not_found() {
        let state = shared_state("http://127.0.0.1:1").await;
        let body = Bytes::from(
            serde_json::to_vec(&json!({
                "object_kind": "issue",
                "user": { "id": 7, "username": "dev" },
                "project": {
                    "id": 999,
                    "path_with_namespace": "unknown/app",
                    "git_http_url": "https://gitlab.example.com/unknown/app.git"
                },
                "object_attributes": { "iid": 1, "action": "open" }
            }))
            .unwrap(),
        );
        let response = handle_webhook(
            AxumState(state),
            gitlab_headers("Issue Hook", "hook-secret"),
            body,
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn untriggered_comment_is_acknowledged_and_ignored() {
        let state = shared_state("http://127.0.0.1:1").await;
        let response = handle_webhook(
            AxumState(state.clone()),
            gitlab_headers("Note Hook", "hook-secret"),
            comment_body("please fix this"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(PipelineCounters::read(&state.counters.ignored), 1);
        assert_eq!(PipelineCounters::read(&state.counters.dispatched), 0);
    }

    #[tokio::test]
    async fn triggered_comment_with_unreachable_unit_is_a_500() {
        // Dispatch is attempted (the pipeline got past auth, classification
        // and context build) but the unit tier is down.
        let state = shared_state("http://127.0.0.1:1").await;
        let response = handle_webhook(
            AxumState(state.clone()),
            gitlab_headers("Note Hook", "hook-secret"),
            comment_body("@agent review this diff"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(PipelineCounters::read(&state.counters.failed), 1);
    }

    #[tokio::test]
    async fn issue_opened_end_to_end_against_a_live_unit() {
        use crate::agent::AgentRuntime;
        use crate::dispatch::DispatchOutcome;
        use crate::host::Host;

        struct StubRuntime;
        #[async_trait]
        impl AgentRuntime for StubRuntime {
            async fn process(
                &self,
                context: &crate::context::ProcessingContext,
            ) -> DispatchOutcome {
                assert_eq!(context.mode(), Some("issue"));
                assert_eq!(context.get("issue_iid"), Some("3"));
                assert_eq!(context.get("token"), Some("glpat-abc"));
                DispatchOutcome::ok("issue handled").with_actions(vec!["comment posted".into()])
            }
        }

        let host = Host::bind("127.0.0.1:0").await.unwrap();
        let addr = host.local_addr().unwrap();
        host.start_init(async { Ok(Arc::new(StubRuntime) as Arc<dyn AgentRuntime>) });
        tokio::spawn(host.serve());
        // Let the stub runtime swap in before dispatching.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let state = shared_state(&format!("http://{}", addr)).await;
        let response = handle_webhook(
            AxumState(state.clone()),
            gitlab_headers("Issue Hook", "hook-secret"),
            issue_opened_body(),
        )
        .await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(PipelineCounters::read(&state.counters.dispatched), 1);
    }

    #[tokio::test]
    async fn failing_unit_surfaces_the_error_message() {
        use crate::agent::AgentRuntime;
        use crate::dispatch::DispatchOutcome;
        use crate::host::Host;

        struct FailingRuntime;
        #[async_trait]
        impl AgentRuntime for FailingRuntime {
            async fn process(
                &self,
                _: &crate::context::ProcessingContext,
            ) -> DispatchOutcome {
                DispatchOutcome::failed("agent run failed", "exit status 1")
            }
        }

        let host = Host::bind("127.0.0.1:0").await.unwrap();
        let addr = host.local_addr().unwrap();
        host.start_init(async { Ok(Arc::new(FailingRuntime) as Arc<dyn AgentRuntime>) });
        tokio::spawn(host.serve());
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let state = shared_state(&format!("http://{}", addr)).await;
        let response = handle_webhook(
            AxumState(state.clone()),
            gitlab_headers("Note Hook", "hook-secret"),
            comment_body("@agent review this diff"),
        )
        .await;

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(json["error"].as_str().unwrap().contains("exit status 1"));
        assert_eq!(PipelineCounters::read(&state.counters.failed), 1);
    }
}
