//! Execution host binary. Binds its listener before touching anything
//! expensive; see `agent_gateway::host` for the bootstrap itself.

use agent_gateway::HostConfig;
use agent_gateway::host;
use tracing_subscriber::EnvFilter;

const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1:8900";
const DEFAULT_WORKDIR: &str = ".";

fn config_from_env() -> HostConfig {
    HostConfig {
        bind_address: std::env::var("HOST_BIND_ADDRESS")
            .unwrap_or_else(|_| DEFAULT_BIND_ADDRESS.to_string()),
        agent_command: std::env::var("AGENT_COMMAND").unwrap_or_default(),
        workdir: std::env::var("AGENT_WORKDIR").unwrap_or_else(|_| DEFAULT_WORKDIR.to_string()),
    }
}

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = config_from_env();
    if let Err(e) = host::run(config).await {
        eprintln!("Execution host error: {}", e);
        std::process::exit(1);
    }
}
