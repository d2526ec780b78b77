//! Administrative credential endpoints.
//!
//! The dispatch pipeline only reads what these endpoints write. Secret
//! material goes in and never comes back out; reads return a redacted view.

use axum::{
    Json,
    extract::{Path, State as AxumState},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info, warn};

use crate::SharedState;
use crate::store::{CredentialRecord, CredentialScope};

/// Request body for PUT /api/credentials
#[derive(Debug, Deserialize)]
pub struct PutCredentialRequest {
    pub scope: CredentialScope,
    pub owner_key: String,
    pub base_url: String,
    pub token: String,
    pub webhook_secret: String,
    pub auto_discover: Option<bool>,
}

/// Redacted view returned by GET /api/credentials/{owner_key}
#[derive(Debug, Serialize)]
pub struct CredentialView {
    pub owner_key: String,
    pub scope: CredentialScope,
    pub base_url: String,
    pub auto_discover: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct PutAgentSecretRequest {
    pub secret: String,
}

/// PUT /api/credentials - Store or replace a credential record
pub async fn put_credentials(
    AxumState(state): AxumState<SharedState>,
    Json(request): Json<PutCredentialRequest>,
) -> impl IntoResponse {
    if request.owner_key.is_empty() || request.token.is_empty() || request.webhook_secret.is_empty()
    {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "owner_key, token and webhook_secret are required" })),
        )
            .into_response();
    }

    // Check the token against the platform before persisting a record the
    // pipeline would then fail with on every event.
    if state.config.validate_credentials {
        match state
            .platform_client
            .validate_credentials(&request.base_url, &request.token)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                warn!("Rejected credential write for '{}': token invalid", request.owner_key);
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({ "error": "token rejected by the platform identity endpoint" })),
                )
                    .into_response();
            }
            Err(e) => {
                error!("Credential validation call failed: {}", e);
                return (e.status(), Json(json!({ "error": e.to_string() }))).into_response();
            }
        }
    }

    let now = Utc::now();
    let record = CredentialRecord {
        owner_key: request.owner_key,
        scope: request.scope,
        base_url: request.base_url,
        token: request.token,
        webhook_secret: request.webhook_secret,
        auto_discover: request.auto_discover.unwrap_or(request.scope == CredentialScope::Group),
        created_at: now,
        updated_at: now,
    };

    match state.store.put(&record).await {
        Ok(()) => {
            info!("Credential record stored for '{}'", record.owner_key);
            Json(json!({ "status": "stored", "owner_key": record.owner_key })).into_response()
        }
        Err(e) => {
            error!("Credential write failed: {}", e);
            (e.status(), Json(json!({ "error": e.to_string() }))).into_response()
        }
    }
}

/// GET /api/credentials/{owner_key} - Redacted record metadata
pub async fn get_credentials(
    AxumState(state): AxumState<SharedState>,
    Path(owner_key): Path<String>,
) -> impl IntoResponse {
    match state.store.get(&owner_key).await {
        Ok(Some(record)) => Json(CredentialView {
            owner_key: record.owner_key,
            scope: record.scope,
            base_url: record.base_url,
            auto_discover: record.auto_discover,
            created_at: record.created_at,
            updated_at: record.updated_at,
        })
        .into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "not configured" })),
        )
            .into_response(),
        Err(e) => {
            error!("Credential read failed: {}", e);
            (e.status(), Json(json!({ "error": e.to_string() }))).into_response()
        }
    }
}

/// PUT /api/agent-secret - Store the execution agent's access secret
pub async fn put_agent_secret(
    AxumState(state): AxumState<SharedState>,
    Json(request): Json<PutAgentSecretRequest>,
) -> impl IntoResponse {
    if request.secret.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "secret must not be empty" })),
        )
            .into_response();
    }

    match state.store.put_agent_secret(&request.secret).await {
        Ok(()) => Json(json!({ "status": "stored" })).into_response(),
        Err(e) => {
            error!("Agent secret write failed: {}", e);
            (e.status(), Json(json!({ "error": e.to_string() }))).into_response()
        }
    }
}
