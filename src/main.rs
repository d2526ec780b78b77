use agent_gateway::api::{
    get_credentials, get_stats, handle_webhook, put_agent_secret, put_credentials,
};
use agent_gateway::dispatch::DispatchRouter;
use agent_gateway::error::{GatewayError, Result};
use agent_gateway::platform::RestPlatformClient;
use agent_gateway::store::{self, CredentialStore};
use agent_gateway::{AppState, GatewayConfig, PipelineCounters};
use axum::{Router, routing};
use chrono::Utc;
use std::fs;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1:8880";
const DEFAULT_CONFIG_PATH: &str = "gateway_config.toml";

/// Load and parse the configuration file
fn load_config(path: &str) -> Result<GatewayConfig> {
    let config_str = fs::read_to_string(path).map_err(|e| {
        GatewayError::Config(format!("Failed to read config file '{}': {}", path, e))
    })?;

    let config: GatewayConfig = toml::from_str(&config_str).map_err(|e| {
        GatewayError::Config(format!("Failed to parse config file '{}': {}", path, e))
    })?;

    // The app secret is too sensitive for the config file; the environment
    // wins when both are set.
    let config = GatewayConfig {
        app_secret: std::env::var("APP_SECRET").unwrap_or(config.app_secret),
        ..config
    };
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let bind_address =
        std::env::var("BIND_ADDRESS").unwrap_or_else(|_| DEFAULT_BIND_ADDRESS.to_string());
    let config_path =
        std::env::var("GATEWAY_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());

    let config = match load_config(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    let pool = match store::init_db(&config.database_path).await {
        Ok(pool) => pool,
        Err(e) => {
            eprintln!("Database error: {}", e);
            std::process::exit(1);
        }
    };

    let store = CredentialStore::new(pool, &config.app_secret, config.group_match);
    let router = DispatchRouter::new(config.unit_base_url.clone());

    let state = Arc::new(AppState {
        store,
        router,
        platform_client: Arc::new(RestPlatformClient::new()),
        counters: PipelineCounters::default(),
        start_time: Instant::now(),
        started_at: Utc::now(),
        config,
    });

    let app = Router::new()
        .route("/webhook", routing::post(handle_webhook))
        .route("/api/credentials", routing::put(put_credentials))
        .route("/api/credentials/{owner_key}", routing::get(get_credentials))
        .route("/api/agent-secret", routing::put(put_agent_secret))
        .route("/api/stats", routing::get(get_stats))
        .with_state(state);

    info!("Listening on {}", bind_address);
    info!("Using config at {:?}", config_path);
    let listener = tokio::net::TcpListener::bind(bind_address).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}
