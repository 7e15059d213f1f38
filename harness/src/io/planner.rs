//! Planner transport.
//!
//! The [`Planner`] trait decouples the turn cycle from the model backend.
//! [`CommandPlanner`] talks to any program that reads a [`DecisionRequest`]
//! as JSON on stdin and prints its reply on stdout. Tests use scripted
//! planners that return canned replies without spawning processes.

use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};

use crate::core::types::PromptMessage;
use crate::io::config::PlannerConfig;
use crate::io::process::run_command_with_timeout;

/// A tool the planner may choose.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON Schema of the tool's arguments.
    pub parameters: Value,
}

/// Tools offered each turn. The procedure tools are optional.
pub fn tool_catalog(procedures_enabled: bool) -> Vec<ToolSpec> {
    let mut tools = vec![
        ToolSpec {
            name: "run_code".to_string(),
            description: "Run a Rhai script against the capability API.".to_string(),
            parameters: json!({
                "type": "object",
                "required": ["code"],
                "properties": { "code": { "type": "string" } }
            }),
        },
        ToolSpec {
            name: "view_state".to_string(),
            description: "Show the full current environment state.".to_string(),
            parameters: json!({ "type": "object", "properties": {} }),
        },
    ];
    if procedures_enabled {
        tools.push(ToolSpec {
            name: "define_procedure".to_string(),
            description: "Save a reusable script defining `fn <name>(params)`.".to_string(),
            parameters: json!({
                "type": "object",
                "required": ["name", "code"],
                "properties": {
                    "name": { "type": "string", "pattern": "^[a-z_][a-z0-9_]*$" },
                    "code": { "type": "string" }
                }
            }),
        });
        tools.push(ToolSpec {
            name: "invoke_procedure".to_string(),
            description: "Run a saved procedure with `params` bound to `args`.".to_string(),
            parameters: json!({
                "type": "object",
                "required": ["name"],
                "properties": {
                    "name": { "type": "string" },
                    "args": { "type": "object" }
                }
            }),
        });
    }
    tools
}

/// Everything the planner needs to choose the next action.
#[derive(Debug, Clone, Serialize)]
pub struct DecisionRequest {
    pub episode_id: String,
    pub sequence: u64,
    pub messages: Vec<PromptMessage>,
    pub tools: Vec<ToolSpec>,
    #[serde(skip)]
    pub timeout: Duration,
}

/// The planner's raw reply text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannerReply {
    pub content: String,
}

/// Abstraction over planner backends.
pub trait Planner {
    /// Produce one reply. Errors are transport failures; a malformed reply is
    /// still `Ok` and is rejected later by the parser.
    fn decide(&self, request: &DecisionRequest) -> Result<PlannerReply>;
}

/// Planner that runs a configured command per decision.
#[derive(Debug, Clone)]
pub struct CommandPlanner {
    command: Vec<String>,
    output_limit_bytes: usize,
}

impl CommandPlanner {
    pub fn new(config: &PlannerConfig) -> Result<Self> {
        if config.command.is_empty() {
            return Err(anyhow!("planner.command is not configured"));
        }
        Ok(Self {
            command: config.command.clone(),
            output_limit_bytes: config.output_limit_bytes,
        })
    }
}

impl Planner for CommandPlanner {
    #[instrument(skip_all, fields(sequence = request.sequence, timeout_secs = request.timeout.as_secs()))]
    fn decide(&self, request: &DecisionRequest) -> Result<PlannerReply> {
        let payload = serde_json::to_vec(request).context("serialize decision request")?;
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("planner.command is not configured"))?;
        let mut cmd = Command::new(program);
        cmd.args(args);

        info!(program = %program, "requesting planner decision");
        let output = run_command_with_timeout(
            cmd,
            Some(&payload),
            request.timeout,
            self.output_limit_bytes,
        )
        .with_context(|| format!("run planner {program}"))?;

        if output.timed_out {
            warn!("planner timed out");
            return Err(anyhow!("planner timed out after {:?}", request.timeout));
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "planner failed");
            return Err(anyhow!(
                "planner exited with status {:?}: {}",
                output.status.code(),
                output.stderr_tail(500)
            ));
        }
        if output.stdout_truncated > 0 {
            warn!(truncated = output.stdout_truncated, "planner reply truncated");
        }

        debug!(bytes = output.stdout.len(), "planner replied");
        Ok(PlannerReply {
            content: output.stdout_text(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::PromptRole;

    fn request(timeout: Duration) -> DecisionRequest {
        DecisionRequest {
            episode_id: "ep-1".to_string(),
            sequence: 1,
            messages: vec![PromptMessage {
                role: PromptRole::User,
                content: "Turn 1".to_string(),
            }],
            tools: tool_catalog(false),
            timeout,
        }
    }

    fn planner(script: &str) -> CommandPlanner {
        CommandPlanner::new(&PlannerConfig {
            command: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            ..PlannerConfig::default()
        })
        .expect("planner")
    }

    /// Verifies the catalog grows only when procedures are enabled.
    #[test]
    fn catalog_respects_procedure_flag() {
        let names = |tools: Vec<ToolSpec>| tools.into_iter().map(|t| t.name).collect::<Vec<_>>();
        assert_eq!(names(tool_catalog(false)), vec!["run_code", "view_state"]);
        assert_eq!(tool_catalog(true).len(), 4);
    }

    /// Verifies the request is serialized without the timeout.
    #[test]
    fn request_json_shape() {
        let value = serde_json::to_value(request(Duration::from_secs(1))).expect("json");
        assert_eq!(value["messages"][0]["role"], "user");
        assert!(value.get("timeout").is_none());
    }

    /// Verifies an unconfigured command is an error.
    #[test]
    fn requires_command() {
        assert!(CommandPlanner::new(&PlannerConfig::default()).is_err());
    }

    #[cfg(unix)]
    /// Verifies the command receives the request and its stdout is the reply.
    #[test]
    fn command_round_trip() {
        let planner = planner("grep -q '\"sequence\":1' && echo '{\"action\":\"view_state\"}'");
        let reply = planner
            .decide(&request(Duration::from_secs(5)))
            .expect("decide");
        assert_eq!(reply.content.trim(), "{\"action\":\"view_state\"}");
    }

    #[cfg(unix)]
    /// Verifies non-zero exits and timeouts are transport errors.
    #[test]
    fn failures_are_errors() {
        let err = planner("cat >/dev/null; echo boom >&2; exit 2")
            .decide(&request(Duration::from_secs(5)))
            .expect_err("exit");
        assert!(format!("{err:#}").contains("boom"));

        let err = planner("exec sleep 10")
            .decide(&request(Duration::from_millis(100)))
            .expect_err("timeout");
        assert!(format!("{err:#}").contains("timed out"));
    }
}
