//! Planner reply parsing.
//!
//! Replies are a single JSON object naming one tool. Models often wrap that
//! object in prose or a fenced block, and sometimes put the script in its own
//! fenced `rhai` block; both shapes are recovered before schema validation.

use std::fmt;
use std::sync::LazyLock;

use anyhow::{Context, Result, anyhow};
use jsonschema::{Validator, validator_for};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

pub const DECISION_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/../schemas/planner_decision/v1.schema.json"
));

static JSON_FENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```json\s*\n(.*?)```").expect("valid json fence regex")
});

static CODE_FENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```rhai\s*\n(.*?)```").expect("valid code fence regex")
});

/// The tool a planner chose, with its arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ToolInvocation {
    RunCode {
        code: String,
    },
    ViewState,
    DefineProcedure {
        name: String,
        code: String,
    },
    InvokeProcedure {
        name: String,
        #[serde(default)]
        args: Map<String, Value>,
    },
}

impl ToolInvocation {
    pub fn name(&self) -> &'static str {
        match self {
            ToolInvocation::RunCode { .. } => "run_code",
            ToolInvocation::ViewState => "view_state",
            ToolInvocation::DefineProcedure { .. } => "define_procedure",
            ToolInvocation::InvokeProcedure { .. } => "invoke_procedure",
        }
    }

    pub fn arguments(&self) -> Value {
        match self {
            ToolInvocation::RunCode { code } => json!({ "code": code }),
            ToolInvocation::ViewState => json!({}),
            ToolInvocation::DefineProcedure { name, code } => json!({ "name": name, "code": code }),
            ToolInvocation::InvokeProcedure { name, args } => json!({ "name": name, "args": args }),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlannerDecision {
    pub reasoning: String,
    pub action: ToolInvocation,
}

/// Why a reply could not be turned into a decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseFailure {
    pub message: String,
}

impl ParseFailure {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for ParseFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ParseFailure {}

pub struct DecisionParser {
    validator: Validator,
}

impl DecisionParser {
    pub fn new() -> Result<Self> {
        let schema: Value =
            serde_json::from_str(DECISION_SCHEMA).context("parse planner decision schema")?;
        let validator =
            validator_for(&schema).map_err(|err| anyhow!("invalid decision schema: {}", err))?;
        Ok(Self { validator })
    }

    pub fn parse(&self, reply: &str) -> Result<PlannerDecision, ParseFailure> {
        let mut object = extract_object(reply)
            .ok_or_else(|| ParseFailure::new("reply contains no JSON object"))?;

        let needs_code = matches!(
            object.get("action").and_then(Value::as_str),
            Some("run_code" | "define_procedure")
        );
        if needs_code
            && !object.contains_key("code")
            && let Some(code) = fenced(&CODE_FENCE, reply)
        {
            object.insert("code".to_string(), Value::String(code));
        }

        let value = Value::Object(object);
        if !self.validator.is_valid(&value) {
            let messages = self
                .validator
                .iter_errors(&value)
                .map(|err| err.to_string())
                .collect::<Vec<_>>();
            return Err(ParseFailure::new(format!(
                "reply does not match the decision schema: {}",
                messages.join("; ")
            )));
        }

        let reasoning = value
            .get("reasoning")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let action: ToolInvocation = serde_json::from_value(value)
            .map_err(|err| ParseFailure::new(format!("invalid tool arguments: {err}")))?;
        Ok(PlannerDecision { reasoning, action })
    }
}

/// Bare JSON first, then a fenced `json` block, then the outermost braces.
fn extract_object(reply: &str) -> Option<Map<String, Value>> {
    let trimmed = reply.trim();
    let outer = match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if start < end => Some(trimmed[start..=end].to_string()),
        _ => None,
    };
    std::iter::once(Some(trimmed.to_string()))
        .chain(std::iter::once(fenced(&JSON_FENCE, reply)))
        .chain(std::iter::once(outer))
        .flatten()
        .find_map(|candidate| match serde_json::from_str::<Value>(&candidate) {
            Ok(Value::Object(map)) => Some(map),
            _ => None,
        })
}

fn fenced(pattern: &Regex, reply: &str) -> Option<String> {
    pattern
        .captures(reply)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|body| !body.is_empty())
}
