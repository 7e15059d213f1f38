//! Episode driver.
//!
//! [`Episode::run_turn`] performs one decision cycle: build context, ask the
//! planner, validate, execute, record. Phases advance only along the legal
//! transitions of [`Phase`]; a failed turn is recorded like any other and
//! only the stop conditions end the episode.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value, json};
use tracing::{debug, info, instrument, warn};

use crate::capability::{CapabilityApi, EnvironmentSnapshot};
use crate::core::compressor::{CompressionConfig, compress};
use crate::core::decision::{DecisionParser, ToolInvocation};
use crate::core::policy::ValidationPolicy;
use crate::core::state_machine::{CancelToken, EpisodeLimits, EpisodeState, Phase};
use crate::core::types::{
    ConversationMessage, EnvironmentTurn, EpisodeSummary, ExecutionResult, OutcomeStatus,
    OutcomeSummary, PlannerResponse, PlannerTurn, PromptMessage, StopReason, Turn, TurnOutcome,
};
use crate::core::validation::Verdict;
use crate::io::config::HarnessConfig;
use crate::io::planner::{DecisionRequest, Planner, ToolSpec, tool_catalog};
use crate::io::procedures::{ProcedureLibrary, check_name};
use crate::io::prompt::{PromptContext, PromptRenderer};
use crate::io::turn_store::TurnRepository;
use crate::sandbox::{Execution, Sandbox};

/// Action label for turns where the planner produced nothing.
const NO_ACTION: &str = "none";
const UNPARSED: &str = "unparsed";
/// Characters of an unparseable reply kept in history.
const RAW_REPLY_LIMIT: usize = 2_000;

/// What one turn did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnReport {
    pub sequence: u64,
    pub status: OutcomeStatus,
    pub action: String,
    pub stop: Option<StopReason>,
}

/// Summary of a `run` invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpisodeOutcome {
    pub episode_id: String,
    pub turns_executed: u64,
    pub stop: StopReason,
}

pub struct Episode<P: Planner, R: TurnRepository> {
    id: String,
    limits: EpisodeLimits,
    compression: CompressionConfig,
    policy: ValidationPolicy,
    sandbox: Sandbox,
    parser: DecisionParser,
    prompts: PromptRenderer,
    tools: Vec<ToolSpec>,
    procedures_enabled: bool,
    allowed_modules: Vec<String>,
    decision_timeout: Duration,
    planner: P,
    environment: Rc<RefCell<dyn CapabilityApi>>,
    repository: R,
    procedures: ProcedureLibrary,
    history: Vec<ConversationMessage>,
    next_ordinal: u64,
    phase: Phase,
    state: EpisodeState,
    cancel: CancelToken,
    last_outcome: Option<OutcomeSummary>,
    started_at: String,
}

impl<P: Planner, R: TurnRepository> Episode<P, R> {
    pub fn new<E: CapabilityApi + 'static>(
        id: impl Into<String>,
        config: &HarnessConfig,
        planner: P,
        environment: Rc<RefCell<E>>,
        repository: R,
    ) -> Result<Self> {
        config.validate()?;
        let environment: Rc<RefCell<dyn CapabilityApi>> = environment;
        Ok(Self {
            id: id.into(),
            limits: config.episode,
            compression: config.context,
            policy: config.validation_policy()?,
            sandbox: config.sandbox(),
            parser: DecisionParser::new()?,
            prompts: PromptRenderer::new()?,
            tools: tool_catalog(config.planner.procedures_enabled),
            procedures_enabled: config.planner.procedures_enabled,
            allowed_modules: config.policy.allowed_modules.clone(),
            decision_timeout: Duration::from_secs(config.planner.decision_timeout_secs),
            planner,
            environment,
            repository,
            procedures: ProcedureLibrary::in_memory(),
            history: Vec::new(),
            next_ordinal: 0,
            phase: Phase::BuildingContext,
            state: EpisodeState::default(),
            cancel: CancelToken::new(),
            last_outcome: None,
            started_at: timestamp(),
        })
    }

    pub fn with_procedures(mut self, procedures: ProcedureLibrary) -> Self {
        self.procedures = procedures;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// A handle that stops the episode from another thread.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn state(&self) -> &EpisodeState {
        &self.state
    }

    /// History as of the last compression; elided turns are replaced by a single marker.
    pub fn history(&self) -> &[ConversationMessage] {
        &self.history
    }

    pub fn procedures(&self) -> &ProcedureLibrary {
        &self.procedures
    }

    pub fn planner(&self) -> &P {
        &self.planner
    }

    pub fn repository(&self) -> &R {
        &self.repository
    }

    /// Run turns until a stop condition holds.
    pub fn run<F: FnMut(&TurnReport)>(&mut self, mut on_turn: F) -> Result<EpisodeOutcome> {
        let mut turns_executed = 0u64;
        loop {
            let report = self.run_turn()?;
            turns_executed += 1;
            on_turn(&report);
            if let Some(stop) = report.stop {
                return Ok(EpisodeOutcome {
                    episode_id: self.id.clone(),
                    turns_executed,
                    stop,
                });
            }
        }
    }

    /// Perform one full decision cycle.
    ///
    /// Errors are reserved for the harness itself (rendering, persistence) and
    /// stop the episode; planner, parse, validation, and execution failures
    /// are recorded outcomes.
    #[instrument(skip_all, fields(episode = %self.id, sequence = self.state.total_turns + 1))]
    pub fn run_turn(&mut self) -> Result<TurnReport> {
        if self.phase == Phase::Stopped {
            return Err(anyhow!("episode {} has already stopped", self.id));
        }
        match self.cycle() {
            Ok(report) => Ok(report),
            Err(err) => {
                let detail = format!("{err:#}");
                warn!(err = %detail, phase = ?self.phase, "turn failed; stopping episode");
                self.phase = Phase::Stopped;
                Err(err)
            }
        }
    }

    fn cycle(&mut self) -> Result<TurnReport> {
        let sequence = self.state.total_turns + 1;

        let snapshot = self.environment.borrow_mut().snapshot();
        let environment_turn = EnvironmentTurn {
            sequence,
            previous: self.last_outcome.take(),
            state: Some(snapshot.render()),
        };
        self.push(|ordinal| ConversationMessage::environment(ordinal, environment_turn));
        self.history = compress(&self.history, &self.compression);
        let procedures = self.procedures.names();
        let messages = self.prompts.render(
            &self.history,
            &PromptContext {
                tools: &self.tools,
                procedures: &procedures,
                allowed_modules: &self.allowed_modules,
            },
        )?;
        let request = DecisionRequest {
            episode_id: self.id.clone(),
            sequence,
            messages,
            tools: self.tools.clone(),
            timeout: self.decision_timeout,
        };

        self.transition(Phase::AwaitingPlanner)?;
        let (response, planner_turn, outcome) = match self.planner.decide(&request) {
            Err(err) => {
                let detail = format!("{err:#}");
                warn!(err = %detail, "planner failed");
                let outcome =
                    TurnOutcome::failure(OutcomeStatus::PlannerFailure, NO_ACTION, detail);
                (None, None, outcome)
            }
            Ok(reply) => match self.parser.parse(&reply.content) {
                Err(failure) => {
                    debug!(reason = %failure, "unparseable planner reply");
                    let turn = PlannerTurn {
                        reasoning: String::new(),
                        tool: UNPARSED.to_string(),
                        arguments: Some(json!({ "raw": truncate(&reply.content, RAW_REPLY_LIMIT) })),
                    };
                    let outcome =
                        TurnOutcome::failure(OutcomeStatus::ParseFailure, UNPARSED, failure.message);
                    (Some(PlannerResponse::unparsed(reply.content)), Some(turn), outcome)
                }
                Ok(decision) => {
                    debug!(tool = decision.action.name(), "planner decided");
                    let outcome = self.dispatch(&decision.action)?;
                    let turn = PlannerTurn::from_decision(&decision);
                    (
                        Some(PlannerResponse::parsed(reply.content, &decision)),
                        Some(turn),
                        outcome,
                    )
                }
            },
        };

        self.record(RecordedTurn {
            sequence,
            snapshot,
            request: request.messages,
            response,
            planner_turn,
            outcome,
        })
    }

    fn dispatch(&mut self, action: &ToolInvocation) -> Result<TurnOutcome> {
        match action {
            ToolInvocation::ViewState => {
                let snapshot = self.environment.borrow_mut().snapshot();
                Ok(TurnOutcome::observed(action.name(), snapshot.render()))
            }
            ToolInvocation::RunCode { code } => {
                self.transition(Phase::Validating)?;
                let verdict = self.policy.evaluate(code);
                self.execute_checked(action.name(), verdict, code, None)
            }
            ToolInvocation::DefineProcedure { name, code } => self.define_procedure(name, code),
            ToolInvocation::InvokeProcedure { name, args } => self.invoke_procedure(name, args),
        }
    }

    fn define_procedure(&mut self, name: &str, code: &str) -> Result<TurnOutcome> {
        const TOOL: &str = "define_procedure";
        if !self.procedures_enabled {
            return Ok(procedures_disabled(TOOL));
        }
        self.transition(Phase::Validating)?;
        if let Err(reason) = check_name(name) {
            return Ok(TurnOutcome::failure(
                OutcomeStatus::ValidationFailure,
                TOOL,
                reason,
            ));
        }
        if let Verdict::Rejected(violations) = self.policy.evaluate_procedure(name, code) {
            return Ok(TurnOutcome::executed(
                TOOL,
                ExecutionResult::rejected(violations),
            ));
        }
        if let Err(err) = self.procedures.define(name, code) {
            return Ok(TurnOutcome::failure(
                OutcomeStatus::ExecutionFault,
                TOOL,
                format!("save procedure `{name}`: {err:#}"),
            ));
        }
        info!(procedure = name, "procedure defined");
        Ok(TurnOutcome::success(TOOL, format!("procedure `{name}` saved")))
    }

    fn invoke_procedure(&mut self, name: &str, args: &Map<String, Value>) -> Result<TurnOutcome> {
        const TOOL: &str = "invoke_procedure";
        if !self.procedures_enabled {
            return Ok(procedures_disabled(TOOL));
        }
        let (Some(body), Some(invocation)) = (
            self.procedures.get(name).map(str::to_string),
            self.procedures.invocation_source(name),
        ) else {
            return Ok(TurnOutcome::failure(
                OutcomeStatus::ExecutionFault,
                TOOL,
                format!("unknown procedure `{name}`"),
            ));
        };
        self.transition(Phase::Validating)?;
        let verdict = self.policy.evaluate_procedure(name, &body);
        self.execute_checked(TOOL, verdict, &invocation, Some(args))
    }

    fn execute_checked(
        &mut self,
        tool: &str,
        verdict: Verdict,
        source: &str,
        params: Option<&Map<String, Value>>,
    ) -> Result<TurnOutcome> {
        if let Verdict::Rejected(violations) = verdict {
            debug!(violations = violations.len(), "submission rejected");
            return Ok(TurnOutcome::executed(
                tool,
                ExecutionResult::rejected(violations),
            ));
        }
        self.transition(Phase::Executing)?;
        let execution = Execution {
            source,
            params,
            timeout: self.policy.timeout(),
            cancel: Some(&self.cancel),
        };
        let result = self.sandbox.execute(&execution, &self.environment);
        Ok(TurnOutcome::executed(tool, result))
    }

    fn record(&mut self, recorded: RecordedTurn) -> Result<TurnReport> {
        self.transition(Phase::Recording)?;
        let RecordedTurn {
            sequence,
            snapshot,
            request,
            response,
            planner_turn,
            outcome,
        } = recorded;
        if let Some(turn) = planner_turn {
            self.push(|ordinal| ConversationMessage::planner(ordinal, turn));
        }

        self.state.record(outcome.status, &self.limits);
        if self.cancel.is_cancelled() {
            self.state.mark_cancelled();
        }
        let finished = self.environment.borrow().is_finished();
        let stop = self.state.stop_reason(&self.limits, finished);

        let turn = Turn {
            episode_id: self.id.clone(),
            sequence,
            timestamp: timestamp(),
            snapshot,
            request,
            response,
            outcome,
            stop: stop.clone(),
        };
        self.repository.append_turn(&turn)?;
        info!(
            status = %turn.outcome.status,
            action = %turn.outcome.action,
            consecutive_failures = self.state.consecutive_failures,
            "turn recorded"
        );
        self.last_outcome = Some(turn.outcome.summary());

        match &stop {
            Some(reason) => {
                self.transition(Phase::Stopped)?;
                self.repository.close_episode(&EpisodeSummary {
                    episode_id: self.id.clone(),
                    started_at: self.started_at.clone(),
                    ended_at: timestamp(),
                    total_turns: self.state.total_turns,
                    stop: reason.clone(),
                    aborted: reason.is_abort(),
                })?;
                if reason.is_abort() {
                    warn!(%reason, "episode aborted");
                } else {
                    info!(%reason, "episode stopped");
                }
            }
            None => self.transition(Phase::BuildingContext)?,
        }

        Ok(TurnReport {
            sequence,
            status: turn.outcome.status,
            action: turn.outcome.action,
            stop,
        })
    }

    fn push(&mut self, build: impl FnOnce(u64) -> ConversationMessage) {
        let ordinal = self.next_ordinal;
        self.next_ordinal += 1;
        self.history.push(build(ordinal));
    }

    fn transition(&mut self, next: Phase) -> Result<()> {
        if !self.phase.can_transition_to(next) {
            return Err(anyhow!(
                "illegal phase transition {:?} -> {:?}",
                self.phase,
                next
            ));
        }
        debug!(from = ?self.phase, to = ?next, "phase transition");
        self.phase = next;
        Ok(())
    }
}

/// Inputs to the Recording phase.
struct RecordedTurn {
    sequence: u64,
    snapshot: EnvironmentSnapshot,
    request: Vec<PromptMessage>,
    response: Option<PlannerResponse>,
    planner_turn: Option<PlannerTurn>,
    outcome: TurnOutcome,
}

fn procedures_disabled(tool: &str) -> TurnOutcome {
    TurnOutcome::failure(
        OutcomeStatus::ValidationFailure,
        tool,
        format!("tool `{tool}` is not enabled"),
    )
}

fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{
        MemoryTurnStore, ScriptedEnvironment, ScriptedPlanner, run_code_reply, test_config,
        view_state_reply,
    };

    fn episode(
        replies: Vec<Result<String, String>>,
        env: &Rc<RefCell<ScriptedEnvironment>>,
    ) -> Episode<ScriptedPlanner, MemoryTurnStore> {
        Episode::new(
            "unit",
            &test_config(),
            ScriptedPlanner::new(replies),
            Rc::clone(env),
            MemoryTurnStore::default(),
        )
        .expect("episode")
    }

    /// Verifies a successful turn returns to BuildingContext and records one turn.
    #[test]
    fn successful_turn_cycles_phases() {
        let env = ScriptedEnvironment::new().shared();
        let mut episode = episode(vec![Ok(run_code_reply("search();"))], &env);
        assert_eq!(episode.phase(), Phase::BuildingContext);

        let report = episode.run_turn().expect("turn");
        assert_eq!(report.status, OutcomeStatus::Success);
        assert_eq!(report.stop, None);
        assert_eq!(episode.phase(), Phase::BuildingContext);
        assert_eq!(episode.repository().turns.len(), 1);
        assert_eq!(episode.history().len(), 2);
    }

    /// Verifies the next environment message carries the previous outcome.
    #[test]
    fn previous_outcome_is_carried_forward() {
        let env = ScriptedEnvironment::new().shared();
        let mut episode = episode(
            vec![Ok(run_code_reply("search();")), Ok(view_state_reply())],
            &env,
        );
        episode.run_turn().expect("turn 1");
        episode.run_turn().expect("turn 2");

        let requests = episode.planner().requests();
        let last = requests[1].messages.last().expect("message");
        assert!(last.content.contains("run_code -> Success"));
        assert!(last.content.contains("call search() ok"));
    }

    /// Verifies a stopped episode refuses further turns.
    #[test]
    fn stopped_episode_rejects_turns() {
        let env = ScriptedEnvironment::new().finished().shared();
        let mut episode = episode(vec![Ok(view_state_reply())], &env);
        let report = episode.run_turn().expect("turn");
        assert_eq!(report.stop, Some(StopReason::EnvironmentFinished));
        assert_eq!(episode.phase(), Phase::Stopped);
        assert!(episode.run_turn().is_err());
        assert_eq!(episode.repository().summaries.len(), 1);
    }

    /// Verifies a persistence failure stops the episode instead of wedging its phase.
    #[test]
    fn harness_error_stops_episode() {
        let env = ScriptedEnvironment::new().shared();
        let mut episode = Episode::new(
            "unit",
            &test_config(),
            ScriptedPlanner::replying([view_state_reply(), view_state_reply()]),
            Rc::clone(&env),
            MemoryTurnStore::failing_appends(1),
        )
        .expect("episode");

        let err = episode.run_turn().expect_err("append fails");
        assert!(format!("{err:#}").contains("disk full"));
        assert_eq!(episode.phase(), Phase::Stopped);

        let err = episode.run_turn().expect_err("stopped");
        assert!(err.to_string().contains("already stopped"));
        assert_eq!(episode.planner().remaining(), 1);
    }

    /// Verifies long replies are shortened in history only.
    #[test]
    fn truncates_on_char_boundary() {
        assert_eq!(truncate("héllo", 2), "hé...");
        assert_eq!(truncate("hi", 5), "hi");
    }
}
