pub mod agent;
pub mod api;
pub mod auth;
pub mod classify;
pub mod context;
pub mod dispatch;
pub mod envelope;
pub mod error;
pub mod host;
pub mod platform;
pub mod store;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::dispatch::DispatchRouter;
use crate::error::{GatewayError, Result};
use crate::platform::PlatformClient;
use crate::store::{CredentialStore, GroupMatch};

fn default_trigger_token() -> String {
    "@agent".to_string()
}

fn default_validate() -> bool {
    true
}

/// Gateway configuration, loaded from TOML with environment overrides and
/// threaded explicitly into every component that needs it.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// SQLite database file for the credential store.
    pub database_path: String,
    /// Application secret the store key is derived from.
    pub app_secret: String,
    /// Base URL of the execution unit tier, e.g. `http://agent-host:8900`.
    pub unit_base_url: String,
    /// The `@handle` literal that authorizes processing of free text.
    #[serde(default = "default_trigger_token")]
    pub trigger_token: String,
    /// How group credentials cover project namespaces during fallback.
    #[serde(default)]
    pub group_match: GroupMatch,
    /// Whether credential writes are checked against the platform's identity
    /// endpoint before being stored.
    #[serde(default = "default_validate")]
    pub validate_credentials: bool,
}

impl GatewayConfig {
    pub fn validate(&self) -> Result<()> {
        if self.app_secret.is_empty() {
            return Err(GatewayError::Config("app_secret must not be empty".to_string()));
        }
        if self.unit_base_url.is_empty() {
            return Err(GatewayError::Config("unit_base_url must not be empty".to_string()));
        }
        if !self.trigger_token.starts_with('@') || self.trigger_token.len() < 2 {
            return Err(GatewayError::Config(format!(
                "trigger_token '{}' must be an @handle literal",
                self.trigger_token
            )));
        }
        Ok(())
    }
}

/// Execution host configuration, read from the environment by the host
/// binary and threaded explicitly from there.
#[derive(Debug, Clone)]
pub struct HostConfig {
    pub bind_address: String,
    /// Command line that runs the agent, split on whitespace.
    pub agent_command: String,
    /// Exclusive working directory for this unit's runs.
    pub workdir: String,
}

/// Monotonic counters surfaced by the stats endpoint.
#[derive(Debug, Default)]
pub struct PipelineCounters {
    pub received: AtomicU64,
    pub ignored: AtomicU64,
    pub dispatched: AtomicU64,
    pub failed: AtomicU64,
}

impl PipelineCounters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn read(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

pub struct AppState {
    pub config: GatewayConfig,
    pub store: CredentialStore,
    pub router: DispatchRouter,
    pub platform_client: Arc<dyn PlatformClient>,
    pub counters: PipelineCounters,
    pub start_time: Instant,
    pub started_at: DateTime<Utc>,
}

pub type SharedState = Arc<AppState>;
