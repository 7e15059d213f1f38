//! Renders compressed history into provider-agnostic prompt messages.

use anyhow::Result;
use minijinja::{Environment, context};
use serde_json::{Map, Value};

use crate::capability::{ACTION_FUNCTIONS, Direction, QUERY_FUNCTIONS};
use crate::core::compressor::COMPACTED;
use crate::core::types::{
    ConversationMessage, EnvironmentTurn, MessageBody, PlannerTurn, PromptMessage, PromptRole,
};
use crate::io::planner::ToolSpec;

const SYSTEM_TEMPLATE: &str = include_str!("prompts/system.md");
const TURN_TEMPLATE: &str = include_str!("prompts/turn.md");

/// Per-request inputs to the system prompt.
#[derive(Debug, Clone, Copy)]
pub struct PromptContext<'a> {
    pub tools: &'a [ToolSpec],
    pub procedures: &'a [String],
    pub allowed_modules: &'a [String],
}

/// Template engine wrapper around minijinja.
pub struct PromptRenderer {
    env: Environment<'static>,
}

impl PromptRenderer {
    pub fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("system", SYSTEM_TEMPLATE)?;
        env.add_template("turn", TURN_TEMPLATE)?;
        Ok(Self { env })
    }

    /// System prompt followed by one message per history entry, using the
    /// compressed body wherever one exists.
    pub fn render(
        &self,
        history: &[ConversationMessage],
        prompt: &PromptContext<'_>,
    ) -> Result<Vec<PromptMessage>> {
        let mut messages = Vec::with_capacity(history.len() + 1);
        messages.push(PromptMessage {
            role: PromptRole::System,
            content: self.render_system(prompt)?,
        });
        for message in history {
            messages.push(match message.effective() {
                MessageBody::Environment(turn) => PromptMessage {
                    role: PromptRole::User,
                    content: self.render_turn(turn)?,
                },
                MessageBody::Planner(turn) => PromptMessage {
                    role: PromptRole::Assistant,
                    content: render_planner(turn),
                },
                MessageBody::Elided { turns } => PromptMessage {
                    role: PromptRole::User,
                    content: format!("[{turns} earlier turns omitted]"),
                },
            });
        }
        Ok(messages)
    }

    fn render_system(&self, prompt: &PromptContext<'_>) -> Result<String> {
        let directions: Vec<&str> = Direction::ALL
            .iter()
            .map(|dir| dir.constant_name())
            .collect();
        let template = self.env.get_template("system")?;
        let rendered = template.render(context! {
            tools => prompt.tools,
            queries => QUERY_FUNCTIONS,
            actions => ACTION_FUNCTIONS,
            directions => directions,
            modules => prompt.allowed_modules,
            procedures => prompt.procedures,
        })?;
        Ok(rendered.trim().to_string())
    }

    fn render_turn(&self, turn: &EnvironmentTurn) -> Result<String> {
        let template = self.env.get_template("turn")?;
        let rendered = template.render(context! {
            sequence => turn.sequence,
            previous => turn.previous.as_ref().map(|summary| summary.lines()),
            state => turn.state.as_deref().map(str::trim_end),
        })?;
        Ok(rendered.trim().to_string())
    }
}

/// The planner's own reply, re-encoded as the JSON object it produced.
fn render_planner(turn: &PlannerTurn) -> String {
    let mut object = Map::new();
    object.insert("reasoning".to_string(), Value::String(turn.reasoning.clone()));
    object.insert("action".to_string(), Value::String(turn.tool.clone()));
    match &turn.arguments {
        Some(Value::Object(arguments)) => {
            object.extend(arguments.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        Some(other) => {
            object.insert("arguments".to_string(), other.clone());
        }
        None => {
            object.insert("arguments".to_string(), Value::String(COMPACTED.to_string()));
        }
    }
    Value::Object(object).to_string()
}
