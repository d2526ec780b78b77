//! Dispatch of execution contexts to execution units.
//!
//! Every distinct event id maps to one stable unit address; re-delivery of
//! the same event converges on the same handle and serializes behind its
//! in-flight lock instead of spawning a duplicate run. There is exactly one
//! outbound attempt per delivery; the source platform is the retry authority.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{error, info};

use crate::context::ProcessingContext;
use crate::error::{GatewayError, Result};

/// Header naming the target unit, so a fronting orchestrator can route the
/// call to (or cold-start) the per-event instance.
pub const UNIT_ADDRESS_HEADER: &str = "X-Unit-Address";

/// Result of one dispatch, produced by the execution unit and consumed once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchOutcome {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Side effects the unit performed (comment posted, branch created, ...).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actions: Option<Vec<String>>,
}

impl DispatchOutcome {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            error: None,
            actions: None,
        }
    }

    pub fn failed(message: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            error: Some(error.into()),
            actions: None,
        }
    }

    pub fn with_actions(mut self, actions: Vec<String>) -> Self {
        self.actions = Some(actions);
        self
    }
}

/// Stable unit address for an event identity. Identical inputs yield the
/// identical address; any differing component yields a different one.
pub fn derive_address(platform: &str, mode: &str, event_id: &str) -> String {
    format!("{}-{}-{}", platform, mode, event_id)
}

struct UnitHandle {
    in_flight: tokio::sync::Mutex<()>,
}

/// Routes contexts to execution units over HTTP.
pub struct DispatchRouter {
    http: reqwest::Client,
    unit_base_url: String,
    units: Mutex<HashMap<String, Arc<UnitHandle>>>,
}

impl DispatchRouter {
    pub fn new(unit_base_url: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            unit_base_url: unit_base_url.trim_end_matches('/').to_string(),
            units: Mutex::new(HashMap::new()),
        }
    }

    /// Issue one outbound call for this context. No retries: a transport
    /// failure surfaces as an error and the platform redelivers if it wants.
    pub async fn dispatch(
        &self,
        context: &ProcessingContext,
        address: &str,
    ) -> Result<DispatchOutcome> {
        let handle = self.handle_for(address);

        let outcome = {
            let _in_flight = handle.in_flight.lock().await;
            info!("Dispatching to execution unit '{}'", address);
            self.call_unit(context, address).await
        };

        self.prune(address, &handle);
        outcome
    }

    fn handle_for(&self, address: &str) -> Arc<UnitHandle> {
        let mut units = self.units.lock().unwrap();
        units
            .entry(address.to_string())
            .or_insert_with(|| {
                Arc::new(UnitHandle {
                    in_flight: tokio::sync::Mutex::new(()),
                })
            })
            .clone()
    }

    /// Drop the map entry once nobody else is waiting on the handle. A
    /// concurrent redelivery still holds its own Arc and keeps serializing
    /// on the same lock.
    fn prune(&self, address: &str, handle: &Arc<UnitHandle>) {
        let mut units = self.units.lock().unwrap();
        if let Some(stored) = units.get(address) {
            if Arc::ptr_eq(stored, handle) && Arc::strong_count(stored) == 2 {
                units.remove(address);
            }
        }
    }

    async fn call_unit(
        &self,
        context: &ProcessingContext,
        address: &str,
    ) -> Result<DispatchOutcome> {
        let url = format!("{}/process", self.unit_base_url);
        let response = self
            .http
            .post(&url)
            .header(UNIT_ADDRESS_HEADER, address)
            .json(context)
            .send()
            .await
            .map_err(|e| {
                error!("Execution unit '{}' unreachable: {}", address, e);
                GatewayError::DispatchTransport(format!("unit unreachable: {}", e))
            })?;

        let status = response.status();
        let body = response.bytes().await.map_err(|e| {
            GatewayError::DispatchTransport(format!("failed to read unit response: {}", e))
        })?;

        // Both 200 and 500 carry a DispatchOutcome body; anything else, or an
        // unparseable body, counts as a malformed unit.
        match serde_json::from_slice::<DispatchOutcome>(&body) {
            Ok(outcome) if status.is_success() || status.is_server_error() => {
                if outcome.success {
                    info!("Execution unit '{}' succeeded: {}", address, outcome.message);
                } else {
                    error!(
                        "Execution unit '{}' reported failure: {}",
                        address,
                        outcome.error.as_deref().unwrap_or(&outcome.message)
                    );
                }
                Ok(outcome)
            }
            _ => {
                error!(
                    "Execution unit '{}' returned malformed response (status {})",
                    address, status
                );
                Err(GatewayError::DispatchTransport(format!(
                    "malformed unit response with status {}",
                    status
                )))
            }
        }
    }
}
