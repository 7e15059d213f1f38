//! Rhai execution sandbox.
//!
//! Every run gets a fresh [`Engine`] that knows only the capability
//! functions, the value types, and the builtin packages. A progress hook
//! enforces the wall-clock deadline, the operation budget, and cancellation
//! independently of what the script does. Runtime errors and panics are
//! contained and classified; the tracker's call log survives all of them.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::time::{Duration, Instant};

use rhai::module_resolvers::StaticModuleResolver;
use rhai::{Array, Dynamic, Engine, EvalAltResult, ImmutableString, Map as ScriptMap, Module, Scope};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, instrument, warn};

use crate::capability::{Action, ActionResult, CapabilityApi, Direction, Position, Query};
use crate::core::state_machine::CancelToken;
use crate::core::tracker::CallTracker;
use crate::core::types::{ErrorClass, ExecutionError, ExecutionResult};

type ScriptResult<T> = Result<T, Box<EvalAltResult>>;

/// Resource limits for one run (`[sandbox]`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub timeout_ms: u64,
    pub max_operations: u64,
    pub max_call_depth: usize,
    pub max_expr_depth: usize,
    pub max_string_bytes: usize,
    pub max_array_len: usize,
    pub max_map_len: usize,
    /// Environment messages kept per run; older ones are dropped and counted.
    pub max_messages: usize,
    pub max_output_lines: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            max_operations: 50_000_000,
            max_call_depth: 32,
            max_expr_depth: 64,
            max_string_bytes: 65_536,
            max_array_len: 10_000,
            max_map_len: 10_000,
            max_messages: 200,
            max_output_lines: 200,
        }
    }
}

impl SandboxConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// One submission to run.
#[derive(Debug, Clone, Copy)]
pub struct Execution<'a> {
    pub source: &'a str,
    /// Bound to the `params` constant when present.
    pub params: Option<&'a Map<String, Value>>,
    pub timeout: Duration,
    pub cancel: Option<&'a CancelToken>,
}

impl<'a> Execution<'a> {
    pub fn script(source: &'a str, timeout: Duration) -> Self {
        Self {
            source,
            params: None,
            timeout,
            cancel: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interrupt {
    Deadline,
    OperationBudget,
    Cancelled,
}

impl fmt::Display for Interrupt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Interrupt::Deadline => "wall-clock deadline exceeded",
            Interrupt::OperationBudget => "operation budget exhausted",
            Interrupt::Cancelled => "run cancelled",
        })
    }
}

/// Bounded log that keeps the newest lines.
#[derive(Debug, Default)]
struct CappedLog {
    lines: VecDeque<String>,
    cap: usize,
    dropped: usize,
}

impl CappedLog {
    fn new(cap: usize) -> Self {
        Self {
            cap,
            ..Self::default()
        }
    }

    fn push(&mut self, line: String) {
        if self.cap == 0 {
            self.dropped += 1;
            return;
        }
        if self.lines.len() == self.cap {
            self.lines.pop_front();
            self.dropped += 1;
        }
        self.lines.push_back(line);
    }

    fn take(&mut self) -> Vec<String> {
        self.lines.drain(..).collect()
    }
}

/// Per-run state shared by every capability closure.
struct RunContext {
    api: Rc<RefCell<dyn CapabilityApi>>,
    tracker: CallTracker,
    messages: CappedLog,
}

impl RunContext {
    fn query(&mut self, query: Query) -> ScriptResult<Dynamic> {
        self.tracker.begin(query.name(), Vec::new());
        let answered = self.api.borrow_mut().query(query);
        match answered {
            Ok(value) => {
                self.tracker.succeed();
                query_value(query, value)
            }
            Err(err) => {
                self.tracker.fail(err.message.clone());
                Err(err.message.into())
            }
        }
    }

    fn perform(&mut self, action: Action) -> ScriptResult<ScriptMap> {
        self.tracker.begin(action.name(), action.arguments());
        let performed = self.api.borrow_mut().perform(&action);
        match performed {
            Ok(result) => {
                if result.success {
                    self.tracker.succeed();
                } else {
                    let error = result.error.as_deref().unwrap_or("action failed");
                    self.tracker.fail(error);
                }
                for message in &result.messages {
                    self.messages.push(message.clone());
                }
                Ok(result_map(&result))
            }
            Err(err) => {
                self.tracker.fail(err.message.clone());
                Err(err.message.into())
            }
        }
    }

    /// Record a call whose arguments could not be interpreted.
    fn reject(&mut self, method: &str, raw: &str, error: &str) -> Box<EvalAltResult> {
        self.tracker.begin(method, vec![format!("{raw:?}")]);
        self.tracker.fail(error);
        error.into()
    }
}

fn query_value(query: Query, value: Value) -> ScriptResult<Dynamic> {
    if query == Query::Position
        && let Ok(position) = serde_json::from_value::<Position>(value.clone())
    {
        return Ok(Dynamic::from(position));
    }
    rhai::serde::to_dynamic(&value)
}

fn result_map(result: &ActionResult) -> ScriptMap {
    let messages: Array = result.messages.iter().cloned().map(Dynamic::from).collect();
    let mut map = ScriptMap::new();
    map.insert("success".into(), Dynamic::from(result.success));
    map.insert("messages".into(), Dynamic::from(messages));
    map.insert("turn_elapsed".into(), Dynamic::from(result.turn_elapsed));
    map.insert(
        "error".into(),
        result.error.clone().map_or(Dynamic::UNIT, Dynamic::from),
    );
    map
}

fn item_letter(raw: &str) -> Option<char> {
    let mut chars = raw.chars();
    match (chars.next(), chars.next()) {
        (Some(letter), None) => Some(letter),
        _ => None,
    }
}

const ITEM_LETTER_ERROR: &str = "item letter must be a single character";

#[derive(Debug, Clone)]
pub struct Sandbox {
    config: SandboxConfig,
    allowed_modules: Vec<String>,
}

impl Sandbox {
    pub fn new<I, S>(config: SandboxConfig, allowed_modules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            config,
            allowed_modules: allowed_modules.into_iter().map(Into::into).collect(),
        }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Run `source` against `api`, bounded by `timeout`.
    pub fn run(
        &self,
        source: &str,
        api: &Rc<RefCell<dyn CapabilityApi>>,
        timeout: Duration,
    ) -> ExecutionResult {
        self.execute(&Execution::script(source, timeout), api)
    }

    #[instrument(skip_all, fields(timeout_ms = execution.timeout.as_millis() as u64))]
    pub fn execute(
        &self,
        execution: &Execution<'_>,
        api: &Rc<RefCell<dyn CapabilityApi>>,
    ) -> ExecutionResult {
        let started = Instant::now();
        let context = Rc::new(RefCell::new(RunContext {
            api: Rc::clone(api),
            tracker: CallTracker::new(),
            messages: CappedLog::new(self.config.max_messages),
        }));
        let output = Rc::new(RefCell::new(CappedLog::new(self.config.max_output_lines)));
        let interrupt = Rc::new(Cell::new(None));

        let engine = self.build_engine(
            &context,
            &output,
            &interrupt,
            started + execution.timeout,
            execution.cancel.cloned(),
        );
        let mut scope = Scope::new();
        let evaluated = match execution.params.map(rhai::serde::to_dynamic).transpose() {
            Ok(params) => {
                if let Some(params) = params {
                    scope.push_constant("params", params);
                }
                panic::catch_unwind(AssertUnwindSafe(|| {
                    engine.eval_with_scope::<Dynamic>(&mut scope, execution.source)
                }))
            }
            Err(err) => Ok(Err(err)),
        };
        drop(engine);

        let (return_value, error) = match evaluated {
            Ok(Ok(value)) => ((!value.is_unit()).then(|| value.to_string()), None),
            Ok(Err(err)) => (None, Some(classify(*err, interrupt.get()))),
            Err(payload) => (
                None,
                Some(ExecutionError::new(
                    ErrorClass::Fault,
                    format!("panic: {}", panic_message(payload.as_ref())),
                )),
            ),
        };

        let mut run = context.borrow_mut();
        if let Some(err) = &error {
            run.tracker.interrupt(&err.detail);
        }
        let calls = std::mem::take(&mut run.tracker).into_records();
        let messages = run.messages.take();
        let mut output = output.borrow_mut();
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        match &error {
            Some(err) => warn!(error = %err, calls = calls.len(), elapsed_ms, "script run failed"),
            None => debug!(calls = calls.len(), elapsed_ms, "script run finished"),
        }

        ExecutionResult {
            accepted: true,
            violations: Vec::new(),
            success: error.is_none(),
            messages,
            messages_dropped: run.messages.dropped,
            output: output.take(),
            calls,
            elapsed_ms,
            error,
            return_value,
        }
    }

    fn build_engine(
        &self,
        context: &Rc<RefCell<RunContext>>,
        output: &Rc<RefCell<CappedLog>>,
        interrupt: &Rc<Cell<Option<Interrupt>>>,
        deadline: Instant,
        cancel: Option<CancelToken>,
    ) -> Engine {
        let config = &self.config;
        let mut engine = Engine::new();
        engine
            .set_max_call_levels(config.max_call_depth)
            .set_max_expr_depths(config.max_expr_depth, config.max_expr_depth)
            .set_max_string_size(config.max_string_bytes)
            .set_max_array_size(config.max_array_len)
            .set_max_map_size(config.max_map_len)
            .set_max_modules(self.allowed_modules.len())
            .set_max_operations(config.max_operations.saturating_add(1))
            .disable_symbol("eval");

        let flag = Rc::clone(interrupt);
        let budget = config.max_operations;
        engine.on_progress(move |operations| {
            let reason = if cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
                Interrupt::Cancelled
            } else if operations > budget {
                Interrupt::OperationBudget
            } else if Instant::now() >= deadline {
                Interrupt::Deadline
            } else {
                return None;
            };
            flag.set(Some(reason));
            Some(Dynamic::from(reason.to_string()))
        });

        let printed = Rc::clone(output);
        engine.on_print(move |text| printed.borrow_mut().push(text.to_string()));
        let debugged = Rc::clone(output);
        engine.on_debug(move |text, _, _| debugged.borrow_mut().push(format!("[debug] {text}")));

        let mut resolver = StaticModuleResolver::new();
        for name in &self.allowed_modules {
            if let Some(module) = pure_module(name, config.max_string_bytes) {
                resolver.insert(name.as_str(), module);
            }
        }
        engine.set_module_resolver(resolver);

        register_values(&mut engine);
        register_queries(&mut engine, context);
        register_actions(&mut engine, context);
        engine
    }
}

fn classify(err: EvalAltResult, interrupt: Option<Interrupt>) -> ExecutionError {
    match interrupt {
        Some(Interrupt::Cancelled) => {
            return ExecutionError::new(ErrorClass::Cancelled, Interrupt::Cancelled.to_string());
        }
        Some(reason) => return ExecutionError::new(ErrorClass::Timeout, reason.to_string()),
        None => {}
    }
    match err {
        EvalAltResult::ErrorTooManyOperations(_) => ExecutionError::new(
            ErrorClass::Timeout,
            Interrupt::OperationBudget.to_string(),
        ),
        other => ExecutionError::new(ErrorClass::Fault, other.to_string()),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Modules an allow-listed `import` may resolve. None of them touch the environment.
fn pure_module(name: &str, max_string_bytes: usize) -> Option<Module> {
    let mut module = Module::new();
    match name {
        "math" => {
            module.set_native_fn(
                "clamp",
                |value: i64, low: i64, high: i64| -> ScriptResult<i64> {
                    Ok(value.max(low).min(high))
                },
            );
            module.set_native_fn("chebyshev", |dx: i64, dy: i64| -> ScriptResult<i64> {
                Ok(dx.saturating_abs().max(dy.saturating_abs()))
            });
            module.set_native_fn("manhattan", |dx: i64, dy: i64| -> ScriptResult<i64> {
                Ok(dx.saturating_abs().saturating_add(dy.saturating_abs()))
            });
        }
        "text" => {
            module.set_native_fn("repeat", move |text: ImmutableString, times: i64| -> ScriptResult<String> {
                let times = usize::try_from(times).unwrap_or(0);
                if text.len().saturating_mul(times) > max_string_bytes {
                    return Err("repeated string exceeds the size limit".into());
                }
                Ok(text.repeat(times))
            });
            module.set_native_fn("lines", |text: ImmutableString| -> ScriptResult<Array> {
                Ok(text
                    .lines()
                    .map(|line| Dynamic::from(line.to_string()))
                    .collect())
            });
        }
        _ => return None,
    }
    Some(module)
}

fn register_values(engine: &mut Engine) {
    engine
        .register_type_with_name::<Direction>("Direction")
        .register_fn("to_string", |dir: &mut Direction| dir.to_string())
        .register_fn("to_debug", |dir: &mut Direction| dir.to_string())
        .register_fn("==", |a: Direction, b: Direction| a == b)
        .register_fn("!=", |a: Direction, b: Direction| a != b);

    engine
        .register_type_with_name::<Position>("Position")
        .register_fn("Position", Position::new)
        .register_get("x", |pos: &mut Position| pos.x)
        .register_get("y", |pos: &mut Position| pos.y)
        .register_fn("to_string", |pos: &mut Position| pos.to_string())
        .register_fn("to_debug", |pos: &mut Position| pos.to_string())
        .register_fn("==", |a: Position, b: Position| a == b)
        .register_fn("!=", |a: Position, b: Position| a != b)
        .register_fn("offset", |pos: Position, dir: Direction| pos.offset(dir))
        .register_fn("distance", |a: Position, b: Position| a.distance(b))
        .register_fn("direction_to", |a: Position, b: Position| {
            a.direction_to(b).map_or(Dynamic::UNIT, Dynamic::from)
        });

    let mut directions = Module::new();
    for dir in Direction::ALL {
        directions.set_var(dir.short_name(), dir);
    }
    engine.register_static_module("Direction", directions.into());

    // Resolved on every variable access, so script functions see them too.
    // Bindings in scope win; validation already rejects rebinding these names.
    #[allow(deprecated)]
    engine.on_var(|name, _, context| {
        if context.scope().contains(name) {
            return Ok(None);
        }
        Ok(Direction::ALL
            .into_iter()
            .find(|dir| dir.constant_name() == name)
            .map(Dynamic::from))
    });
}

fn register_queries(engine: &mut Engine, context: &Rc<RefCell<RunContext>>) {
    for query in Query::ALL {
        let run = Rc::clone(context);
        engine.register_fn(query.name(), move || -> ScriptResult<Dynamic> {
            run.borrow_mut().query(query)
        });
    }
}

fn register_actions(engine: &mut Engine, context: &Rc<RefCell<RunContext>>) {
    let directional: [(&'static str, fn(Direction) -> Action); 4] = [
        ("move", Action::Move),
        ("attack", Action::Attack),
        ("kick", Action::Kick),
        ("open_door", Action::OpenDoor),
    ];
    for (name, build) in directional {
        let run = Rc::clone(context);
        engine.register_fn(name, move |dir: Direction| run.borrow_mut().perform(build(dir)));
        let run = Rc::clone(context);
        engine.register_fn(name, move |raw: &str| {
            let mut run = run.borrow_mut();
            match Direction::parse(raw) {
                Some(dir) => run.perform(build(dir)),
                None => Err(run.reject(name, raw, &format!("unknown direction {raw:?}"))),
            }
        });
    }

    let simple = [
        ("wait", Action::Wait),
        ("search", Action::Search),
        ("go_up", Action::GoUp),
        ("go_down", Action::GoDown),
        ("pray", Action::Pray),
    ];
    for (name, action) in simple {
        let run = Rc::clone(context);
        engine.register_fn(name, move || run.borrow_mut().perform(action.clone()));
    }

    let optional_item: [(&'static str, fn(Option<char>) -> Action); 2] =
        [("pickup", Action::Pickup), ("eat", Action::Eat)];
    for (name, build) in optional_item {
        let run = Rc::clone(context);
        engine.register_fn(name, move || run.borrow_mut().perform(build(None)));
        let run = Rc::clone(context);
        engine.register_fn(name, move |raw: &str| {
            let mut run = run.borrow_mut();
            match item_letter(raw) {
                Some(letter) => run.perform(build(Some(letter))),
                None => Err(run.reject(name, raw, ITEM_LETTER_ERROR)),
            }
        });
    }

    let item: [(&'static str, fn(char) -> Action); 5] = [
        ("drop", Action::Drop),
        ("quaff", Action::Quaff),
        ("read", Action::Read),
        ("wear", Action::Wear),
        ("wield", Action::Wield),
    ];
    for (name, build) in item {
        let run = Rc::clone(context);
        engine.register_fn(name, move |raw: &str| {
            let mut run = run.borrow_mut();
            match item_letter(raw) {
                Some(letter) => run.perform(build(letter)),
                None => Err(run.reject(name, raw, ITEM_LETTER_ERROR)),
            }
        });
    }

    let run = Rc::clone(context);
    engine.register_fn("engrave", move |text: &str| {
        run.borrow_mut().perform(Action::Engrave(text.to_string()))
    });
    let run = Rc::clone(context);
    engine.register_fn("move_to", move |x: i64, y: i64| {
        run.borrow_mut().perform(Action::MoveTo(Position::new(x, y)))
    });
    let run = Rc::clone(context);
    engine.register_fn("move_to", move |target: Position| {
        run.borrow_mut().perform(Action::MoveTo(target))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::Direction;
    use crate::test_support::ScriptedEnvironment;

    fn sandbox() -> Sandbox {
        Sandbox::new(SandboxConfig::default(), ["math", "text"])
    }

    fn run(env: &Rc<RefCell<ScriptedEnvironment>>, source: &str) -> ExecutionResult {
        let api: Rc<RefCell<dyn CapabilityApi>> = env.clone();
        sandbox().run(source, &api, Duration::from_secs(5))
    }

    /// Verifies capability calls reach the environment and are tracked in order.
    #[test]
    fn records_capability_calls() {
        let env = ScriptedEnvironment::new()
            .with_monster(Direction::East)
            .shared();
        let result = run(&env, "attack(EAST);\nmove(EAST);");
        assert!(result.success, "{:?}", result.error);
        let calls: Vec<String> = result.calls.iter().map(|c| c.render()).collect();
        assert_eq!(calls, vec!["attack(EAST) ok", "move(EAST) ok"]);
        assert_eq!(result.messages, vec!["You kill the newt!"]);
        assert_eq!(env.borrow().actions.len(), 2);
    }

    /// Verifies an unbounded loop ends as a timeout near the deadline.
    #[test]
    fn infinite_loop_times_out() {
        let env = ScriptedEnvironment::new().shared();
        let api: Rc<RefCell<dyn CapabilityApi>> = env.clone();
        let started = Instant::now();
        let result = sandbox().run("loop { }", &api, Duration::from_millis(200));
        assert_eq!(
            result.error.as_ref().map(|e| e.class),
            Some(ErrorClass::Timeout)
        );
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    /// Verifies the operation budget is enforced independently of the clock.
    #[test]
    fn operation_budget_times_out() {
        let env = ScriptedEnvironment::new().shared();
        let api: Rc<RefCell<dyn CapabilityApi>> = env.clone();
        let config = SandboxConfig {
            max_operations: 1_000,
            ..SandboxConfig::default()
        };
        let result = Sandbox::new(config, ["math"]).run("loop { }", &api, Duration::from_secs(60));
        let error = result.error.expect("error");
        assert_eq!(error.class, ErrorClass::Timeout);
        assert_eq!(error.detail, "operation budget exhausted");
    }

    /// Verifies runtime errors are faults and keep earlier calls.
    #[test]
    fn runtime_error_is_fault() {
        let env = ScriptedEnvironment::new().shared();
        let result = run(&env, "search();\nlet x = 1 / 0;");
        assert_eq!(
            result.error.as_ref().map(|e| e.class),
            Some(ErrorClass::Fault)
        );
        assert_eq!(result.calls.len(), 1);
        assert!(result.calls[0].success);
    }

    /// Verifies environment argument errors fault the run and are tracked.
    #[test]
    fn capability_error_is_fault() {
        let env = ScriptedEnvironment::new()
            .with_error("search", "search is unavailable")
            .shared();
        let result = run(&env, "search();\nmove(EAST);");
        assert_eq!(
            result.error.as_ref().map(|e| e.class),
            Some(ErrorClass::Fault)
        );
        assert_eq!(result.calls.len(), 1);
        assert_eq!(
            result.calls[0].error.as_deref(),
            Some("search is unavailable")
        );
    }

    /// Verifies an unsuccessful action is returned to the script, not raised.
    #[test]
    fn failed_action_is_observable() {
        let env = ScriptedEnvironment::new()
            .with_blocked(Direction::East)
            .shared();
        let result = run(
            &env,
            "let r = move(EAST);\nif !r.success { move(WEST); }\nr.error",
        );
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.calls.len(), 2);
        assert!(!result.calls[0].success);
        assert!(result.calls[1].success);
        assert_eq!(result.return_value.as_deref(), Some("You can't move there."));
    }

    /// Verifies a panic in the environment is contained and the call finalised.
    #[test]
    fn panic_is_contained() {
        let env = ScriptedEnvironment::new().panicking_on("pray").shared();
        let result = run(&env, "pray();");
        let error = result.error.expect("error");
        assert_eq!(error.class, ErrorClass::Fault);
        assert!(error.detail.starts_with("panic:"));
        assert_eq!(result.calls.len(), 1);
        assert!(
            result.calls[0]
                .error
                .as_deref()
                .is_some_and(|e| e.starts_with("interrupted:"))
        );
    }

    /// Verifies a cancelled token stops an in-flight run.
    #[test]
    fn cancellation_interrupts_run() {
        let env = ScriptedEnvironment::new().shared();
        let api: Rc<RefCell<dyn CapabilityApi>> = env.clone();
        let token = CancelToken::new();
        token.cancel();
        let execution = Execution {
            cancel: Some(&token),
            ..Execution::script("loop { search(); }", Duration::from_secs(60))
        };
        let result = sandbox().execute(&execution, &api);
        assert_eq!(
            result.error.as_ref().map(|e| e.class),
            Some(ErrorClass::Cancelled)
        );
    }

    /// Verifies environment messages are capped to the newest entries.
    #[test]
    fn messages_are_capped() {
        let env = ScriptedEnvironment::new().shared();
        let api: Rc<RefCell<dyn CapabilityApi>> = env.clone();
        let config = SandboxConfig {
            max_messages: 2,
            ..SandboxConfig::default()
        };
        let result = Sandbox::new(config, ["math"]).run(
            "for i in 0..5 { search(); }",
            &api,
            Duration::from_secs(5),
        );
        assert_eq!(result.messages.len(), 2);
        assert_eq!(result.messages_dropped, 3);
        assert_eq!(result.calls.len(), 5);
    }

    /// Verifies print output and the final value are captured.
    #[test]
    fn captures_output_and_return_value() {
        let env = ScriptedEnvironment::new().shared();
        let result = run(&env, "print(\"hello\");\n40 + 2");
        assert_eq!(result.output, vec!["hello"]);
        assert_eq!(result.return_value.as_deref(), Some("42"));
    }

    /// Verifies value types, the direction module, and constants inside functions.
    #[test]
    fn value_types_and_constants() {
        let env = ScriptedEnvironment::new().shared();
        let source = r#"
            fn step_east() { move(EAST) }
            let here = position();
            let target = here.offset(Direction::E).offset(Direction::E);
            step_east();
            move_to(target);
            here.distance(position())
        "#;
        let result = run(&env, source);
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.return_value.as_deref(), Some("2"));
    }

    /// Verifies only allow-listed pure modules resolve.
    #[test]
    fn imports_resolve_only_allowed_modules() {
        let env = ScriptedEnvironment::new().shared();
        let result = run(&env, "import \"math\" as m;\nm::clamp(15, 0, 10)");
        assert_eq!(result.return_value.as_deref(), Some("10"));

        let result = run(&env, "import \"os\" as os;\n1");
        assert_eq!(
            result.error.as_ref().map(|e| e.class),
            Some(ErrorClass::Fault)
        );
    }

    /// Verifies distance helpers saturate instead of overflowing.
    #[test]
    fn math_helpers_saturate() {
        let env = ScriptedEnvironment::new().shared();
        let max = i64::MAX;
        let result = run(&env, &format!("import \"math\" as m;\nm::manhattan({max}, {max})"));
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.return_value, Some(max.to_string()));

        let result = run(&env, &format!("Position({max}, 0).offset(EAST).x"));
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.return_value, Some(max.to_string()));
    }

    /// Verifies a binding in scope takes precedence over a direction constant.
    #[test]
    fn scope_bindings_shadow_constants() {
        let env = ScriptedEnvironment::new().shared();
        let result = run(&env, "let UP = 3;\nUP + 1");
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.return_value.as_deref(), Some("4"));

        let result = run(&env, "fn pick() { UP }\npick() == UP");
        assert_eq!(result.return_value.as_deref(), Some("true"));
    }

    /// Verifies eval is unavailable even if static checks were bypassed.
    #[test]
    fn eval_is_disabled() {
        let env = ScriptedEnvironment::new().shared();
        let result = run(&env, "eval(\"move(EAST)\")");
        assert!(!result.success);
        assert!(env.borrow().actions.is_empty());
    }

    /// Verifies params are bound for procedure invocations.
    #[test]
    fn binds_params() {
        let env = ScriptedEnvironment::new().shared();
        let api: Rc<RefCell<dyn CapabilityApi>> = env.clone();
        let params = serde_json::json!({ "steps": 3 });
        let execution = Execution {
            params: params.as_object(),
            ..Execution::script("for i in 0..params.steps { search(); }", Duration::from_secs(5))
        };
        let result = sandbox().execute(&execution, &api);
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.calls.len(), 3);
    }

    /// Verifies malformed item letters fault with a hint.
    #[test]
    fn bad_item_letter_has_hint() {
        let env = ScriptedEnvironment::new().shared();
        let result = run(&env, "drop(\"ab\");");
        assert_eq!(
            result.error.as_ref().map(|e| e.class),
            Some(ErrorClass::Fault)
        );
        assert!(result.calls[0].hint.is_some());
        assert!(env.borrow().actions.is_empty());
    }
}
