//! Encrypted credential persistence.
//!
//! One SQLite database holds two tables: `credentials` (project- and
//! group-scoped integration records) and `agent_secret` (the execution
//! agent's own access secret, never project-scoped). Secret material is
//! sealed with AES-256-GCM before it touches the database; only the owner
//! key, scope and timestamps are stored in the clear.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::{FromRow, Row};
use std::path::Path;
use tracing::{info, warn};

pub mod crypto;

use crate::error::{GatewayError, Result};
use crypto::SealedBox;

/// Who a credential record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialScope {
    /// Owner key is a project id rendered as a string.
    Project,
    /// Owner key is a group namespace path, e.g. `acme` or `acme/platform`.
    Group,
}

impl CredentialScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialScope::Project => "project",
            CredentialScope::Group => "group",
        }
    }

    fn from_db(s: &str) -> Result<Self> {
        match s {
            "project" => Ok(CredentialScope::Project),
            "group" => Ok(CredentialScope::Group),
            other => Err(GatewayError::Config(format!(
                "Unknown credential scope '{}' in database",
                other
            ))),
        }
    }
}

/// One integration credential bundle. Always written and read whole; there
/// are no partial updates.
#[derive(Debug, Clone, PartialEq)]
pub struct CredentialRecord {
    pub owner_key: String,
    pub scope: CredentialScope,
    pub base_url: String,
    pub token: String,
    pub webhook_secret: String,
    /// Group records only: whether projects under the namespace resolve to
    /// this record without their own project-scoped entry.
    pub auto_discover: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The secret fields, serialized to JSON and sealed as one blob.
#[derive(Serialize, Deserialize)]
struct SealedFields {
    base_url: String,
    token: String,
    webhook_secret: String,
    auto_discover: bool,
}

/// How a group owner key is matched against a project namespace during
/// fallback resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupMatch {
    /// Namespace must equal the group key.
    Exact,
    /// Namespace equals the group key or sits underneath it (`"{key}/..."`).
    #[default]
    Prefix,
}

impl GroupMatch {
    /// Case-sensitive; a trailing slash on the stored key is trimmed on write,
    /// so only clean paths reach this check.
    pub fn covers(&self, group_key: &str, namespace: &str) -> bool {
        match self {
            GroupMatch::Exact => namespace == group_key,
            GroupMatch::Prefix => {
                namespace == group_key
                    || namespace
                        .strip_prefix(group_key)
                        .is_some_and(|rest| rest.starts_with('/'))
            }
        }
    }
}

#[derive(FromRow)]
struct CredentialRow {
    owner_key: String,
    scope: String,
    sealed: Vec<u8>,
    created_at: String,
    updated_at: String,
}

fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

/// Initialize the SQLite database connection pool and run migrations
pub async fn init_db(db_path: impl AsRef<Path>) -> Result<SqlitePool> {
    let db_path = db_path.as_ref();
    let db_path_str = db_path.to_string_lossy();

    // Ensure the database file exists or create it
    if !db_path.exists() {
        info!("Database file not found at {}, creating...", db_path_str);
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                GatewayError::Config(format!("Failed to create database directory: {}", e))
            })?;
        }
        std::fs::File::create(db_path).map_err(|e| {
            GatewayError::Config(format!("Failed to create database file: {}", e))
        })?;
    }

    let db_url = format!("sqlite:{}", db_path_str);
    info!("Connecting to database at {}", db_url);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&db_url)
        .await
        .map_err(|e| GatewayError::Config(format!("Failed to connect to database: {}", e)))?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .map_err(|e| GatewayError::Config(format!("Failed to run migrations: {}", e)))?;

    info!("Database initialized successfully");
    Ok(pool)
}

/// Keyed, encrypted store for credential records.
#[derive(Clone)]
pub struct CredentialStore {
    pool: SqlitePool,
    sealer: SealedBox,
    group_match: GroupMatch,
}

impl CredentialStore {
    pub fn new(pool: SqlitePool, app_secret: &str, group_match: GroupMatch) -> Self {
        Self {
            pool,
            sealer: SealedBox::new(app_secret),
            group_match,
        }
    }

    /// Owner key for a project-scoped record.
    pub fn project_key(project_id: i64) -> String {
        project_id.to_string()
    }

    /// Replace the stored record for the record's owner key. A trailing
    /// slash on a group key is trimmed so resolution sees clean paths.
    pub async fn put(&self, record: &CredentialRecord) -> Result<()> {
        let owner_key = match record.scope {
            CredentialScope::Group => record.owner_key.trim_end_matches('/').to_string(),
            CredentialScope::Project => record.owner_key.clone(),
        };

        let fields = SealedFields {
            base_url: record.base_url.clone(),
            token: record.token.clone(),
            webhook_secret: record.webhook_secret.clone(),
            auto_discover: record.auto_discover,
        };
        let plaintext = serde_json::to_vec(&fields)
            .map_err(|e| GatewayError::Crypto(format!("serialization failed: {}", e)))?;
        let sealed = self.sealer.seal(&plaintext)?;

        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"
            INSERT INTO credentials (owner_key, scope, sealed, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(owner_key) DO UPDATE SET
                scope = excluded.scope,
                sealed = excluded.sealed,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&owner_key)
        .bind(record.scope.as_str())
        .bind(&sealed)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        info!(
            "Stored {} credential record for '{}'",
            record.scope.as_str(),
            owner_key
        );
        Ok(())
    }

    /// Fetch and decrypt one record. A record whose seal does not verify is
    /// reported as absent; the integrity warning is the only trace it leaves.
    pub async fn get(&self, owner_key: &str) -> Result<Option<CredentialRecord>> {
        let row: Option<CredentialRow> =
            sqlx::query_as("SELECT owner_key, scope, sealed, created_at, updated_at FROM credentials WHERE owner_key = ?")
                .bind(owner_key)
                .fetch_optional(&self.pool)
                .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(self.unseal_row(row))
    }

    /// Fallback chain: project record first, then group records whose
    /// namespace covers the project and have auto-discovery enabled.
    pub async fn resolve(
        &self,
        project_id: i64,
        project_namespace: &str,
    ) -> Result<Option<CredentialRecord>> {
        if let Some(record) = self.get(&Self::project_key(project_id)).await? {
            return Ok(Some(record));
        }

        let rows: Vec<CredentialRow> = sqlx::query_as(
            "SELECT owner_key, scope, sealed, created_at, updated_at FROM credentials WHERE scope = 'group'",
        )
        .fetch_all(&self.pool)
        .await?;

        // Most specific (longest) group key wins when several cover the
        // namespace, e.g. `acme/platform` over `acme`.
        let mut best: Option<CredentialRecord> = None;
        for row in rows {
            if !self.group_match.covers(&row.owner_key, project_namespace) {
                continue;
            }
            let Some(record) = self.unseal_row(row) else {
                continue;
            };
            if !record.auto_discover {
                continue;
            }
            match &best {
                Some(current) if current.owner_key.len() >= record.owner_key.len() => {}
                _ => best = Some(record),
            }
        }
        Ok(best)
    }

    /// Store the execution agent's access secret (project-independent).
    pub async fn put_agent_secret(&self, secret: &str) -> Result<()> {
        let sealed = self.sealer.seal(secret.as_bytes())?;
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"
            INSERT INTO agent_secret (id, sealed, updated_at)
            VALUES (1, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                sealed = excluded.sealed,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&sealed)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        info!("Stored agent access secret");
        Ok(())
    }

    /// Fetch the execution agent's access secret, if configured.
    pub async fn agent_secret(&self) -> Result<Option<String>> {
        let row = sqlx::query("SELECT sealed FROM agent_secret WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let sealed: Vec<u8> = row.get("sealed");
        match self.sealer.open(&sealed) {
            Some(plaintext) => Ok(String::from_utf8(plaintext).ok()),
            None => {
                warn!("Agent secret failed integrity check; treating as not configured");
                Ok(None)
            }
        }
    }

    fn unseal_row(&self, row: CredentialRow) -> Option<CredentialRecord> {
        let Some(plaintext) = self.sealer.open(&row.sealed) else {
            warn!(
                "Credential record '{}' failed integrity check; treating as not configured",
                row.owner_key
            );
            return None;
        };
        let fields: SealedFields = match serde_json::from_slice(&plaintext) {
            Ok(f) => f,
            Err(e) => {
                warn!(
                    "Credential record '{}' has unreadable sealed fields: {}",
                    row.owner_key, e
                );
                return None;
            }
        };
        let scope = CredentialScope::from_db(&row.scope).ok()?;

        Some(CredentialRecord {
            owner_key: row.owner_key,
            scope,
            base_url: fields.base_url,
            token: fields.token,
            webhook_secret: fields.webhook_secret,
            auto_discover: fields.auto_discover,
            created_at: parse_timestamp(&row.created_at),
            updated_at: parse_timestamp(&row.updated_at),
        })
    }
}
