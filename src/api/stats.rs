//! Stats API endpoint

use axum::{Json, extract::State as AxumState};
use serde::Serialize;

use crate::{PipelineCounters, SharedState};

/// Server statistics
#[derive(Debug, Serialize)]
pub struct ServerStats {
    pub name: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub started_at: String,
}

/// Pipeline counters since startup
#[derive(Debug, Serialize)]
pub struct PipelineStats {
    pub received: u64,
    pub ignored: u64,
    pub dispatched: u64,
    pub failed: u64,
}

/// Combined stats response
#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub server: ServerStats,
    pub pipeline: PipelineStats,
}

/// GET /api/stats - Get server and pipeline statistics
pub async fn get_stats(AxumState(state): AxumState<SharedState>) -> Json<StatsResponse> {
    let server = ServerStats {
        name: "agent_gateway".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        started_at: state.started_at.to_rfc3339(),
    };

    let pipeline = PipelineStats {
        received: PipelineCounters::read(&state.counters.received),
        ignored: PipelineCounters::read(&state.counters.ignored),
        dispatched: PipelineCounters::read(&state.counters.dispatched),
        failed: PipelineCounters::read(&state.counters.failed),
    };

    Json(StatsResponse { server, pipeline })
}
