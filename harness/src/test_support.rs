//! Deterministic fakes for tests: a scripted environment, a scripted planner,
//! an in-memory turn repository, and a temporary workspace.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use anyhow::{Result, anyhow};
use serde_json::{Value, json};
use tempfile::TempDir;

use crate::capability::{
    Action, ActionResult, CapabilityApi, CapabilityError, Direction, EnvironmentSnapshot,
    Position, Query,
};
use crate::core::types::{EpisodeSummary, Turn};
use crate::io::config::{CONFIG_PATH, HarnessConfig, write_config};
use crate::io::planner::{DecisionRequest, Planner, PlannerReply};
use crate::io::turn_store::{FileTurnStore, TurnRepository};

/// Grid environment driven entirely by its builder settings.
#[derive(Debug, Clone)]
pub struct ScriptedEnvironment {
    pub position: Position,
    pub turn: u64,
    /// Every action performed, in order.
    pub actions: Vec<Action>,
    pub queries: Vec<Query>,
    blocked: BTreeSet<Position>,
    monsters: BTreeSet<Position>,
    errors: BTreeMap<String, String>,
    panic_on: Option<String>,
    finished: bool,
    finish_after_actions: Option<usize>,
}

impl Default for ScriptedEnvironment {
    fn default() -> Self {
        Self {
            position: Position::new(5, 5),
            turn: 1,
            actions: Vec::new(),
            queries: Vec::new(),
            blocked: BTreeSet::new(),
            monsters: BTreeSet::new(),
            errors: BTreeMap::new(),
            panic_on: None,
            finished: false,
            finish_after_actions: None,
        }
    }
}

impl ScriptedEnvironment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Place a newt next to the starting position.
    pub fn with_monster(mut self, direction: Direction) -> Self {
        self.monsters.insert(self.position.offset(direction));
        self
    }

    /// Wall off the square next to the starting position.
    pub fn with_blocked(mut self, direction: Direction) -> Self {
        self.blocked.insert(self.position.offset(direction));
        self
    }

    /// Make `method` fail with a capability error.
    pub fn with_error(mut self, method: &str, message: &str) -> Self {
        self.errors.insert(method.to_string(), message.to_string());
        self
    }

    pub fn panicking_on(mut self, method: &str) -> Self {
        self.panic_on = Some(method.to_string());
        self
    }

    pub fn finished(mut self) -> Self {
        self.finished = true;
        self
    }

    /// Report the environment finished once `count` actions were performed.
    pub fn finishing_after(mut self, count: usize) -> Self {
        self.finish_after_actions = Some(count);
        self
    }

    pub fn shared(self) -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(self))
    }

    fn check(&self, method: &str) -> Result<(), CapabilityError> {
        if self.panic_on.as_deref() == Some(method) {
            panic!("scripted panic in {method}");
        }
        match self.errors.get(method) {
            Some(message) => Err(CapabilityError::new(message.clone())),
            None => Ok(()),
        }
    }

    fn step(&mut self, direction: Direction) -> ActionResult {
        let target = self.position.offset(direction);
        if self.blocked.contains(&target) {
            return ActionResult::failed("You can't move there.");
        }
        if self.monsters.contains(&target) {
            return ActionResult::failed("There is a newt in the way.");
        }
        self.position = target;
        ActionResult::ok(Vec::new())
    }
}

impl CapabilityApi for ScriptedEnvironment {
    fn snapshot(&mut self) -> EnvironmentSnapshot {
        EnvironmentSnapshot {
            turn: self.turn,
            position: self.position,
            status: "HP:12(12)".to_string(),
            message: String::new(),
            screen: "..@..".to_string(),
            inventory: vec!["a - a long sword".to_string()],
        }
    }

    fn query(&mut self, query: Query) -> Result<Value, CapabilityError> {
        self.check(query.name())?;
        self.queries.push(query);
        Ok(match query {
            Query::Position => json!({ "x": self.position.x, "y": self.position.y }),
            Query::Stats => json!({ "hp": 12, "max_hp": 12 }),
            Query::Screen => json!("..@.."),
            Query::Message => json!(""),
            Query::Inventory => json!(["a - a long sword"]),
            Query::VisibleMonsters => {
                let monsters: Vec<Value> = self
                    .monsters
                    .iter()
                    .map(|pos| json!({ "name": "newt", "x": pos.x, "y": pos.y }))
                    .collect();
                Value::Array(monsters)
            }
            Query::ItemsHere => json!([]),
            Query::Turn => json!(self.turn),
        })
    }

    fn perform(&mut self, action: &Action) -> Result<ActionResult, CapabilityError> {
        self.check(action.name())?;
        self.actions.push(action.clone());
        let result = match action {
            Action::Move(direction) => self.step(*direction),
            Action::Attack(direction) => {
                if self.monsters.remove(&self.position.offset(*direction)) {
                    ActionResult::ok(vec!["You kill the newt!".to_string()])
                } else {
                    ActionResult::ok(vec!["You attack thin air.".to_string()])
                }
            }
            Action::MoveTo(target) => {
                if self.blocked.contains(target) {
                    ActionResult::failed("You can't move there.")
                } else {
                    self.position = *target;
                    ActionResult::ok(Vec::new())
                }
            }
            Action::Search => ActionResult::ok(vec!["You find nothing.".to_string()]),
            _ => ActionResult::ok(Vec::new()),
        };
        if result.turn_elapsed {
            self.turn += 1;
        }
        Ok(result)
    }

    fn is_finished(&self) -> bool {
        self.finished
            || self
                .finish_after_actions
                .is_some_and(|count| self.actions.len() >= count)
    }
}

/// Planner that replays canned replies; `Err` entries are transport failures.
#[derive(Debug, Default)]
pub struct ScriptedPlanner {
    replies: RefCell<VecDeque<Result<String, String>>>,
    requests: RefCell<Vec<DecisionRequest>>,
}

impl ScriptedPlanner {
    pub fn new(replies: Vec<Result<String, String>>) -> Self {
        Self {
            replies: RefCell::new(replies.into()),
            requests: RefCell::new(Vec::new()),
        }
    }

    /// A planner that only ever sends successful replies.
    pub fn replying<I: IntoIterator<Item = String>>(replies: I) -> Self {
        Self::new(replies.into_iter().map(Ok).collect())
    }

    /// Requests received so far.
    pub fn requests(&self) -> Vec<DecisionRequest> {
        self.requests.borrow().clone()
    }

    pub fn remaining(&self) -> usize {
        self.replies.borrow().len()
    }
}

impl Planner for ScriptedPlanner {
    fn decide(&self, request: &DecisionRequest) -> Result<PlannerReply> {
        self.requests.borrow_mut().push(request.clone());
        match self.replies.borrow_mut().pop_front() {
            Some(Ok(content)) => Ok(PlannerReply { content }),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Err(anyhow!("scripted planner has no replies left")),
        }
    }
}

pub fn run_code_reply(code: &str) -> String {
    json!({ "reasoning": "scripted", "action": "run_code", "code": code }).to_string()
}

pub fn view_state_reply() -> String {
    json!({ "reasoning": "look around", "action": "view_state" }).to_string()
}

pub fn define_procedure_reply(name: &str, code: &str) -> String {
    json!({ "reasoning": "reuse", "action": "define_procedure", "name": name, "code": code })
        .to_string()
}

pub fn invoke_procedure_reply(name: &str, args: Value) -> String {
    json!({ "reasoning": "reuse", "action": "invoke_procedure", "name": name, "args": args })
        .to_string()
}

/// Repository that keeps everything in memory.
#[derive(Debug, Default)]
pub struct MemoryTurnStore {
    pub turns: Vec<Turn>,
    pub summaries: Vec<EpisodeSummary>,
    fail_appends: usize,
}

impl MemoryTurnStore {
    /// A store whose first `count` appends fail.
    pub fn failing_appends(count: usize) -> Self {
        Self {
            fail_appends: count,
            ..Self::default()
        }
    }
}

impl TurnRepository for MemoryTurnStore {
    fn append_turn(&mut self, turn: &Turn) -> Result<()> {
        if self.fail_appends > 0 {
            self.fail_appends -= 1;
            return Err(anyhow!("disk full"));
        }
        let latest = self
            .turns
            .iter()
            .filter(|t| t.episode_id == turn.episode_id)
            .map(|t| t.sequence)
            .max();
        if latest.is_some_and(|latest| turn.sequence <= latest) {
            return Err(anyhow!("turn {} recorded out of order", turn.sequence));
        }
        self.turns.push(turn.clone());
        Ok(())
    }

    fn latest_turn(&self, episode_id: &str) -> Result<Option<Turn>> {
        Ok(self
            .turns
            .iter()
            .rev()
            .find(|t| t.episode_id == episode_id)
            .cloned())
    }

    fn close_episode(&mut self, summary: &EpisodeSummary) -> Result<()> {
        self.summaries.push(summary.clone());
        Ok(())
    }
}

/// Configuration with short timeouts and procedures enabled.
pub fn test_config() -> HarnessConfig {
    let mut config = HarnessConfig::default();
    config.sandbox.timeout_ms = 2_000;
    config.planner.decision_timeout_secs = 5;
    config.planner.procedures_enabled = true;
    config
}

/// A temporary harness root.
pub struct TestWorkspace {
    dir: TempDir,
}

impl TestWorkspace {
    pub fn new() -> Result<Self> {
        Ok(Self {
            dir: tempfile::tempdir()?,
        })
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn config_path(&self) -> PathBuf {
        self.root().join(CONFIG_PATH)
    }

    pub fn write_config(&self, config: &HarnessConfig) -> Result<()> {
        write_config(&self.config_path(), config)
    }

    /// File store rooted at the configured storage directory.
    pub fn store(&self, config: &HarnessConfig) -> FileTurnStore {
        FileTurnStore::new(self.root().join(&config.storage.dir))
    }
}
