//! API module for all HTTP handlers

pub mod config;
pub mod stats;
pub mod webhook;

// Re-export handlers
pub use config::{get_credentials, put_agent_secret, put_credentials};
pub use stats::get_stats;
pub use webhook::handle_webhook;
