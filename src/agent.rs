//! The agent runtime behind the execution host.
//!
//! The real coding agent is a black box to this crate; the host only needs
//! something that turns a [`ProcessingContext`] into a [`DispatchOutcome`].
//! [`CommandRuntime`] is the provided implementation: it hands the context to
//! a configured command as environment variables, the same way a CI runner
//! hands build metadata to user scripts.

use async_trait::async_trait;
use std::path::PathBuf;
use tracing::{error, info};

use crate::HostConfig;
use crate::context::ProcessingContext;
use crate::dispatch::DispatchOutcome;
use crate::error::{GatewayError, Result};

/// Fallback instruction when a trigger carried no prompt text.
const DEFAULT_PROMPT: &str = "Read the referenced item and take the appropriate action.";

/// Maximum size for captured agent output before truncation (1MB)
const MAX_OUTPUT_SIZE: usize = 1024 * 1024;

#[async_trait]
pub trait AgentRuntime: Send + Sync {
    /// Run the agent for one context. Failures are reported in the outcome,
    /// not as errors; the gateway relays them verbatim.
    async fn process(&self, context: &ProcessingContext) -> DispatchOutcome;
}

/// Runs a configured command with the context exported as `AGENT_*` env vars.
#[derive(Debug)]
pub struct CommandRuntime {
    command: String,
    args: Vec<String>,
    workdir: PathBuf,
}

impl CommandRuntime {
    /// Construct and validate the runtime. This is the expensive part of host
    /// startup and runs behind the bootstrap's initialization phase.
    pub async fn load(config: &HostConfig) -> Result<Self> {
        let mut parts = config.agent_command.split_whitespace();
        let command = parts
            .next()
            .ok_or_else(|| GatewayError::Config("AGENT_COMMAND is empty".to_string()))?
            .to_string();
        let args: Vec<String> = parts.map(str::to_string).collect();

        let workdir = PathBuf::from(&config.workdir);
        if !workdir.is_dir() {
            return Err(GatewayError::Config(format!(
                "Agent working directory '{}' does not exist",
                workdir.display()
            )));
        }

        // Fail at startup, not on the first event, if the command is missing.
        let probe = tokio::process::Command::new(&command)
            .arg("--version")
            .current_dir(&workdir)
            .output()
            .await;
        if let Err(e) = probe {
            return Err(GatewayError::Config(format!(
                "Agent command '{}' failed to start: {}",
                command, e
            )));
        }

        info!("Agent runtime ready: {} ({})", command, workdir.display());
        Ok(Self {
            command,
            args,
            workdir,
        })
    }
}

fn env_key(key: &str) -> String {
    format!("AGENT_{}", key.to_ascii_uppercase())
}

#[async_trait]
impl AgentRuntime for CommandRuntime {
    async fn process(&self, context: &ProcessingContext) -> DispatchOutcome {
        let mode = match context.mode() {
            Some(mode) => mode.to_string(),
            None => {
                return DispatchOutcome::failed(
                    "context rejected",
                    "context field 'mode' missing",
                );
            }
        };

        let mut command = tokio::process::Command::new(&self.command);
        command.args(&self.args).current_dir(&self.workdir);
        for (key, value) in context.iter() {
            command.env(env_key(key), value);
        }
        if context.get("prompt").is_none_or(str::is_empty) {
            command.env("AGENT_PROMPT", DEFAULT_PROMPT);
        }

        info!("Running agent command for mode '{}'", mode);
        let output = match command.output().await {
            Ok(output) => output,
            Err(e) => {
                error!("Agent command failed to start: {}", e);
                return DispatchOutcome::failed(
                    "agent command failed to start",
                    e.to_string(),
                );
            }
        };

        if output.status.success() {
            let mut stdout = String::from_utf8_lossy(&output.stdout).into_owned();
            if stdout.len() > MAX_OUTPUT_SIZE {
                stdout.truncate(MAX_OUTPUT_SIZE);
                stdout.push_str("\n... (output truncated)");
            }
            info!("Agent run for mode '{}' completed", mode);
            DispatchOutcome::ok(format!("agent completed for mode '{}'", mode))
                .with_actions(parse_actions(&stdout))
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            error!("Agent run for mode '{}' failed: {}", mode, stderr);
            DispatchOutcome::failed(
                format!("agent run failed for mode '{}'", mode),
                format!("{}: {}", output.status, stderr.trim()),
            )
        }
    }
}

/// The agent reports side effects as `action: <text>` lines on stdout.
fn parse_actions(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .filter_map(|line| line.strip_prefix("action:"))
        .map(|action| action.trim().to_string())
        .filter(|action| !action.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::CommonFields;

    fn test_context() -> ProcessingContext {
        let fields = CommonFields {
            base_url: "https://gitlab.example.com",
            token: "glpat-abc",
            agent_token: "sk-agent",
            project_id: 42,
            project_namespace: "acme/app",
            clone_url: "https://gitlab.example.com/acme/app.git",
            actor_handle: "dev",
        };
        ProcessingContext::for_issue(&fields, 3, "Crash", "Trace")
    }

    fn runtime(command: &str, workdir: &std::path::Path) -> CommandRuntime {
        let mut parts = command.split_whitespace();
        CommandRuntime {
            command: parts.next().unwrap().to_string(),
            args: parts.map(str::to_string).collect(),
            workdir: workdir.to_path_buf(),
        }
    }

    #[test]
    fn env_keys_are_prefixed_and_uppercased() {
        assert_eq!(env_key("mode"), "AGENT_MODE");
        assert_eq!(env_key("issue_iid"), "AGENT_ISSUE_IID");
    }

    #[test]
    fn actions_are_parsed_from_stdout() {
        let stdout = "log line\naction: comment posted\naction:   branch created\naction:\n";
        assert_eq!(
            parse_actions(stdout),
            vec!["comment posted".to_string(), "branch created".to_string()]
        );
    }

    #[tokio::test]
    async fn successful_command_yields_a_success_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let rt = runtime("sh -c true", dir.path());

        let outcome = rt.process(&test_context()).await;
        assert!(outcome.success);
    }

    #[tokio::test]
    async fn failing_command_reports_failure_with_detail() {
        let dir = tempfile::tempdir().unwrap();
        let rt = runtime("sh -c false", dir.path());

        let outcome = rt.process(&test_context()).await;
        assert!(!outcome.success);
        assert!(outcome.error.is_some());
    }

    #[tokio::test]
    async fn context_is_exported_as_agent_env() {
        // The command string splits on whitespace, so the assertion script
        // lives in a file.
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("check.sh");
        std::fs::write(
            &script,
            "#!/bin/sh\ntest \"$AGENT_MODE\" = issue && test \"$AGENT_ISSUE_IID\" = 3 && test -n \"$AGENT_PROMPT\"\n",
        )
        .unwrap();
        let rt = runtime(&format!("sh {}", script.display()), dir.path());

        let outcome = rt.process(&test_context()).await;
        assert!(outcome.success, "{:?}", outcome);
    }

    #[tokio::test]
    async fn load_rejects_missing_workdir() {
        let config = HostConfig {
            bind_address: "127.0.0.1:0".to_string(),
            agent_command: "sh -c true".to_string(),
            workdir: "/definitely/not/a/real/path".to_string(),
        };
        let err = CommandRuntime::load(&config).await.unwrap_err();
        assert!(matches!(err, GatewayError::Config(_)));
    }

    #[tokio::test]
    async fn load_rejects_empty_command() {
        let dir = tempfile::tempdir().unwrap();
        let config = HostConfig {
            bind_address: "127.0.0.1:0".to_string(),
            agent_command: "   ".to_string(),
            workdir: dir.path().to_string_lossy().into_owned(),
        };
        let err = CommandRuntime::load(&config).await.unwrap_err();
        assert!(matches!(err, GatewayError::Config(_)));
    }
}
