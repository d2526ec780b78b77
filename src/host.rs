//! Execution host bootstrap.
//!
//! The orchestrator fronting the execution unit probes the TCP port on a
//! deadline of a few hundred milliseconds. Binding after full initialization
//! races that deadline, so the listener is bound and serving before the agent
//! runtime is even constructed: every request gets a 503 with a retry hint
//! until a background task finishes initialization and swaps the runtime in.
//! The phase transition is one-way; there is no path back to initializing.

use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tracing::{error, info};

use crate::HostConfig;
use crate::agent::{AgentRuntime, CommandRuntime};
use crate::context::ProcessingContext;
use crate::error::Result;

/// Shared host state: `None` while initializing, `Some` once ready.
pub struct HostState {
    runtime: RwLock<Option<Arc<dyn AgentRuntime>>>,
}

/// A bound-but-not-yet-initialized execution host.
pub struct Host {
    listener: TcpListener,
    state: Arc<HostState>,
}

impl Host {
    /// Bind the listener. Nothing expensive happens before this returns.
    pub async fn bind(bind_address: &str) -> Result<Self> {
        let listener = TcpListener::bind(bind_address).await?;
        info!("Execution host listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            state: Arc::new(HostState {
                runtime: RwLock::new(None),
            }),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Kick off background initialization. When the future resolves the real
    /// handler is swapped in atomically; on error the host stays in the
    /// initializing phase and keeps answering 503.
    pub fn start_init<F>(&self, init: F)
    where
        F: Future<Output = Result<Arc<dyn AgentRuntime>>> + Send + 'static,
    {
        let state = self.state.clone();
        tokio::spawn(async move {
            match init.await {
                Ok(runtime) => {
                    *state.runtime.write().await = Some(runtime);
                    info!("Execution host initialization complete, now ready");
                }
                Err(e) => {
                    error!("Execution host initialization failed: {}", e);
                }
            }
        });
    }

    /// Serve until the process is stopped.
    pub async fn serve(self) -> Result<()> {
        let app = Router::new()
            .route("/process", post(process))
            .route("/healthz", get(healthz))
            .with_state(self.state);
        axum::serve(self.listener, app).await?;
        Ok(())
    }
}

/// Bind, initialize in the background, serve. The order is the point.
pub async fn run(config: HostConfig) -> Result<()> {
    let host = Host::bind(&config.bind_address).await?;
    let init_config = config.clone();
    host.start_init(async move {
        let runtime = CommandRuntime::load(&init_config).await?;
        Ok(Arc::new(runtime) as Arc<dyn AgentRuntime>)
    });
    host.serve().await
}

/// Answers as soon as the socket is bound, in both phases.
async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn process(
    State(state): State<Arc<HostState>>,
    Json(context): Json<ProcessingContext>,
) -> Response {
    let runtime = state.runtime.read().await.clone();
    let Some(runtime) = runtime else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::RETRY_AFTER, "1")],
            Json(json!({
                "error": "initializing",
                "message": "execution host is still starting, retry shortly"
            })),
        )
            .into_response();
    };

    let outcome = runtime.process(&context).await;
    let status = if outcome.success {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (status, Json(outcome)).into_response()
}
