//! Shared data model for turns, outcomes, and planner history.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::capability::EnvironmentSnapshot;
use crate::core::decision::{PlannerDecision, ToolInvocation};
use crate::core::dedup::{Repeated, collapse, merge};
use crate::core::tracker::render_calls;

/// Author of a history entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Harness-authored markers (e.g. elided history).
    System,
    Environment,
    Planner,
}

/// One logical entry in the planner history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub ordinal: u64,
    pub role: Role,
    pub content: MessageBody,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compressed: Option<MessageBody>,
}

impl ConversationMessage {
    pub fn environment(ordinal: u64, turn: EnvironmentTurn) -> Self {
        Self {
            ordinal,
            role: Role::Environment,
            content: MessageBody::Environment(turn),
            compressed: None,
        }
    }

    pub fn planner(ordinal: u64, turn: PlannerTurn) -> Self {
        Self {
            ordinal,
            role: Role::Planner,
            content: MessageBody::Planner(turn),
            compressed: None,
        }
    }

    pub fn elided(ordinal: u64, turns: u64) -> Self {
        Self {
            ordinal,
            role: Role::System,
            content: MessageBody::Elided { turns },
            compressed: None,
        }
    }

    /// The body the planner sees: compressed when available, full otherwise.
    pub fn effective(&self) -> &MessageBody {
        self.compressed.as_ref().unwrap_or(&self.content)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageBody {
    Environment(EnvironmentTurn),
    Planner(PlannerTurn),
    Elided { turns: u64 },
}

/// Environment-authored turn message: the previous outcome plus the current state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentTurn {
    pub sequence: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<OutcomeSummary>,
    /// Full state rendering; `None` once compressed away.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
}

/// Planner-authored turn message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannerTurn {
    pub reasoning: String,
    pub tool: String,
    /// Tool arguments; `None` once compacted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
}

impl PlannerTurn {
    pub fn from_decision(decision: &PlannerDecision) -> Self {
        Self {
            reasoning: decision.reasoning.clone(),
            tool: decision.action.name().to_string(),
            arguments: Some(decision.action.arguments()),
        }
    }
}

/// Classified result of one turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Success,
    ParseFailure,
    PlannerFailure,
    ValidationFailure,
    ExecutionTimeout,
    ExecutionFault,
    Cancelled,
}

impl OutcomeStatus {
    pub fn is_failure(self) -> bool {
        self != OutcomeStatus::Success
    }

    pub fn label(self) -> &'static str {
        match self {
            OutcomeStatus::Success => "Success",
            OutcomeStatus::ParseFailure => "ParseFailure",
            OutcomeStatus::PlannerFailure => "PlannerFailure",
            OutcomeStatus::ValidationFailure => "ValidationFailure",
            OutcomeStatus::ExecutionTimeout => "ExecutionTimeout",
            OutcomeStatus::ExecutionFault => "ExecutionFault",
            OutcomeStatus::Cancelled => "Cancelled",
        }
    }
}

impl fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Static-analysis rule that rejected a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Rule {
    Syntax,
    Import,
    ForbiddenCall,
    Introspection,
    UnknownIdentifier,
    ReservedName,
    ProcedureSignature,
}

impl Rule {
    pub fn as_str(self) -> &'static str {
        match self {
            Rule::Syntax => "syntax",
            Rule::Import => "import",
            Rule::ForbiddenCall => "forbidden-call",
            Rule::Introspection => "introspection",
            Rule::UnknownIdentifier => "unknown-identifier",
            Rule::ReservedName => "reserved-name",
            Rule::ProcedureSignature => "procedure-signature",
        }
    }
}

/// One rejection reason with its source location (1-based).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub rule: Rule,
    pub line: u32,
    pub column: u32,
    pub detail: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}:{}: {}",
            self.rule.as_str(),
            self.line,
            self.column,
            self.detail
        )
    }
}

/// One capability invocation made by a sandboxed script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallRecord {
    pub method: String,
    pub args: Vec<String>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl CallRecord {
    pub fn signature(&self) -> String {
        format!("{}({})", self.method, self.args.join(", "))
    }

    /// One-line rendering: signature plus outcome.
    pub fn render(&self) -> String {
        if self.success {
            return format!("{} ok", self.signature());
        }
        let mut line = format!(
            "{} failed: {}",
            self.signature(),
            self.error.as_deref().unwrap_or("unknown error")
        );
        if let Some(hint) = &self.hint {
            line.push_str(&format!(" (hint: {hint})"));
        }
        line
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Timeout,
    Fault,
    Cancelled,
}

/// Terminal error of a sandbox run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionError {
    pub class: ErrorClass,
    pub detail: String,
}

impl ExecutionError {
    pub fn new(class: ErrorClass, detail: impl Into<String>) -> Self {
        Self {
            class,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self.class {
            ErrorClass::Timeout => "ExecutionTimeout",
            ErrorClass::Fault => "ExecutionFault",
            ErrorClass::Cancelled => "Cancelled",
        };
        write!(f, "{label}: {}", self.detail)
    }
}

/// Outcome of one (possibly rejected) sandbox submission.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub violations: Vec<Violation>,
    pub success: bool,
    #[serde(default)]
    pub messages: Vec<String>,
    #[serde(default)]
    pub messages_dropped: usize,
    #[serde(default)]
    pub output: Vec<String>,
    #[serde(default)]
    pub calls: Vec<CallRecord>,
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_value: Option<String>,
}

impl ExecutionResult {
    /// Result for code the validation policy refused; nothing ran.
    pub fn rejected(violations: Vec<Violation>) -> Self {
        Self {
            accepted: false,
            violations,
            ..Self::default()
        }
    }

    pub fn status(&self) -> OutcomeStatus {
        if !self.accepted {
            return OutcomeStatus::ValidationFailure;
        }
        match self.error.as_ref().map(|err| err.class) {
            None => OutcomeStatus::Success,
            Some(ErrorClass::Timeout) => OutcomeStatus::ExecutionTimeout,
            Some(ErrorClass::Fault) => OutcomeStatus::ExecutionFault,
            Some(ErrorClass::Cancelled) => OutcomeStatus::Cancelled,
        }
    }

    pub fn failed_calls(&self) -> impl Iterator<Item = &CallRecord> {
        self.calls.iter().filter(|call| !call.success)
    }
}

/// Everything the harness learned from one turn's chosen action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnOutcome {
    pub status: OutcomeStatus,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution: Option<ExecutionResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observation: Option<String>,
}

impl TurnOutcome {
    pub fn failure(status: OutcomeStatus, action: &str, detail: impl Into<String>) -> Self {
        Self {
            status,
            action: action.to_string(),
            detail: Some(detail.into()),
            execution: None,
            observation: None,
        }
    }

    pub fn success(action: &str, detail: impl Into<String>) -> Self {
        Self {
            status: OutcomeStatus::Success,
            action: action.to_string(),
            detail: Some(detail.into()),
            execution: None,
            observation: None,
        }
    }

    pub fn observed(action: &str, observation: String) -> Self {
        Self {
            status: OutcomeStatus::Success,
            action: action.to_string(),
            detail: None,
            execution: None,
            observation: Some(observation),
        }
    }

    pub fn executed(action: &str, result: ExecutionResult) -> Self {
        let detail = if result.accepted {
            result.error.as_ref().map(ToString::to_string)
        } else {
            Some(format!(
                "rejected with {} violation(s)",
                result.violations.len()
            ))
        };
        Self {
            status: result.status(),
            action: action.to_string(),
            detail,
            execution: Some(result),
            observation: None,
        }
    }

    /// Planner-facing summary with repeats collapsed.
    pub fn summary(&self) -> OutcomeSummary {
        let execution = self.execution.as_ref();
        OutcomeSummary {
            status: self.status,
            action: self.action.clone(),
            detail: self.detail.clone(),
            violations: execution.map(|e| e.violations.clone()).unwrap_or_default(),
            messages: execution
                .map(|e| collapse(e.messages.iter().cloned()))
                .unwrap_or_default(),
            messages_dropped: execution.map(|e| e.messages_dropped).unwrap_or_default(),
            calls: execution.map(|e| render_calls(&e.calls)).unwrap_or_default(),
            output: execution
                .map(|e| collapse(e.output.iter().cloned()))
                .unwrap_or_default(),
            return_value: execution.and_then(|e| e.return_value.clone()),
            observation: self.observation.clone(),
        }
    }
}

/// Compact rendering of a turn outcome carried into the next environment message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeSummary {
    pub status: OutcomeStatus,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub violations: Vec<Violation>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<Repeated<String>>,
    #[serde(default)]
    pub messages_dropped: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub calls: Vec<Repeated<String>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output: Vec<Repeated<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observation: Option<String>,
}

impl OutcomeSummary {
    /// Merge adjacent repeats and drop the state observation.
    pub fn condensed(&self) -> Self {
        Self {
            messages: merge(self.messages.iter().cloned()),
            calls: merge(self.calls.iter().cloned()),
            output: merge(self.output.iter().cloned()),
            observation: None,
            ..self.clone()
        }
    }

    /// Text lines used by prompt templates.
    pub fn lines(&self) -> Vec<String> {
        let mut lines = vec![format!("{} -> {}", self.action, self.status)];
        if let Some(detail) = &self.detail {
            lines.push(format!("detail: {detail}"));
        }
        lines.extend(self.violations.iter().map(|v| format!("violation {v}")));
        lines.extend(self.calls.iter().map(|c| format!("call {c}")));
        lines.extend(self.messages.iter().map(|m| format!("message {m}")));
        if self.messages_dropped > 0 {
            lines.push(format!("({} earlier messages dropped)", self.messages_dropped));
        }
        lines.extend(self.output.iter().map(|o| format!("print {o}")));
        if let Some(value) = &self.return_value {
            lines.push(format!("returned {value}"));
        }
        lines
    }
}

/// Why an episode stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum StopReason {
    ConsecutiveFailures { count: u32, threshold: u32 },
    Cancelled,
    TurnLimit { max_turns: u64 },
    EnvironmentFinished,
}

impl StopReason {
    /// True when the stop is an `EpisodeAborted` condition.
    pub fn is_abort(&self) -> bool {
        matches!(
            self,
            StopReason::ConsecutiveFailures { .. } | StopReason::Cancelled
        )
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::ConsecutiveFailures { count, threshold } => write!(
                f,
                "episode aborted: {count} consecutive failures (threshold {threshold})"
            ),
            StopReason::Cancelled => f.write_str("episode aborted: cancelled"),
            StopReason::TurnLimit { max_turns } => write!(f, "turn limit of {max_turns} reached"),
            StopReason::EnvironmentFinished => f.write_str("environment finished"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptRole {
    System,
    User,
    Assistant,
}

/// Provider-agnostic prompt message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptMessage {
    pub role: PromptRole,
    pub content: String,
}

/// The planner's reply as received and, when well-formed, as parsed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannerResponse {
    pub raw: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<ToolInvocation>,
}

impl PlannerResponse {
    pub fn parsed(raw: String, decision: &PlannerDecision) -> Self {
        Self {
            raw,
            reasoning: Some(decision.reasoning.clone()),
            action: Some(decision.action.clone()),
        }
    }

    pub fn unparsed(raw: String) -> Self {
        Self {
            raw,
            reasoning: None,
            action: None,
        }
    }
}

/// One persisted decision cycle. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub episode_id: String,
    pub sequence: u64,
    pub timestamp: String,
    pub snapshot: EnvironmentSnapshot,
    pub request: Vec<PromptMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<PlannerResponse>,
    pub outcome: TurnOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<StopReason>,
}

/// Final record of an episode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpisodeSummary {
    pub episode_id: String,
    pub started_at: String,
    pub ended_at: String,
    pub total_turns: u64,
    pub stop: StopReason,
    pub aborted: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(method: &str, success: bool) -> CallRecord {
        CallRecord {
            method: method.to_string(),
            args: vec!["EAST".to_string()],
            success,
            error: (!success).then(|| "blocked".to_string()),
            hint: None,
        }
    }

    /// Verifies rejected results classify as validation failures.
    #[test]
    fn rejected_result_status() {
        let result = ExecutionResult::rejected(vec![Violation {
            rule: Rule::Import,
            line: 1,
            column: 1,
            detail: "module `os` is not allowed".to_string(),
        }]);
        assert_eq!(result.status(), OutcomeStatus::ValidationFailure);
        assert!(result.calls.is_empty());
    }

    /// Verifies the summary collapses repeated messages and calls.
    #[test]
    fn summary_collapses_repeats() {
        let result = ExecutionResult {
            accepted: true,
            success: true,
            messages: vec!["You hit it.".into(), "You hit it.".into(), "It dies.".into()],
            calls: vec![call("attack", true), call("attack", true), call("move", false)],
            ..ExecutionResult::default()
        };
        let summary = TurnOutcome::executed("run_code", result).summary();
        let messages: Vec<String> = summary.messages.iter().map(ToString::to_string).collect();
        assert_eq!(messages, vec!["You hit it. (x2)", "It dies."]);
        let calls: Vec<String> = summary.calls.iter().map(ToString::to_string).collect();
        assert_eq!(
            calls,
            vec!["attack(EAST) ok (x2)", "move(EAST) failed: blocked"]
        );
    }

    /// Verifies condensing drops observations and is stable.
    #[test]
    fn condensed_is_stable() {
        let outcome = TurnOutcome::observed("view_state", "big map".to_string());
        let once = outcome.summary().condensed();
        assert_eq!(once.observation, None);
        assert_eq!(once.condensed(), once);
    }

    /// Verifies which stop reasons are aborts.
    #[test]
    fn abort_classification() {
        assert!(StopReason::Cancelled.is_abort());
        assert!(
            StopReason::ConsecutiveFailures {
                count: 5,
                threshold: 5
            }
            .is_abort()
        );
        assert!(!StopReason::TurnLimit { max_turns: 3 }.is_abort());
        assert!(!StopReason::EnvironmentFinished.is_abort());
    }
}
