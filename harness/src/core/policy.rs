//! Validation policy: what submitted scripts may reference.

use std::collections::BTreeSet;
use std::time::Duration;

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::capability::{Direction, INJECTED_MODULES, injected_names};

/// Policy lists as written in configuration (`[policy]`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PolicyRules {
    /// Modules that `import "<name>"` may name. Only pure modules are resolvable.
    pub allowed_modules: Vec<String>,
    /// Names that may not appear anywhere, called or referenced.
    pub forbidden_calls: Vec<String>,
    /// Regexes matched against property and method names after `.`.
    pub forbidden_attributes: Vec<String>,
    /// Free identifiers scripts may use beyond injected and locally declared names.
    pub builtins: Vec<String>,
}

impl Default for PolicyRules {
    fn default() -> Self {
        Self {
            allowed_modules: vec!["math".to_string(), "text".to_string()],
            forbidden_calls: [
                "eval",
                "Fn",
                "call",
                "curry",
                "is_def_fn",
                "is_def_var",
                "is_shared",
                "exit",
                "sleep",
                "open",
                "read_file",
                "write_file",
                "system",
                "spawn",
            ]
            .map(String::from)
            .to_vec(),
            forbidden_attributes: [
                "^__",
                "^tag$",
                "^set_tag$",
                "^fn_name$",
                "^is_anonymous$",
                "^source$",
                "^position$",
            ]
            .map(String::from)
            .to_vec(),
            builtins: DEFAULT_BUILTINS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

const DEFAULT_BUILTINS: &[&str] = &[
    "print",
    "debug",
    "type_of",
    "len",
    "range",
    "abs",
    "min",
    "max",
    "sign",
    "floor",
    "ceiling",
    "round",
    "sqrt",
    "to_int",
    "to_float",
    "to_string",
    "to_char",
    "parse_int",
    "parse_float",
    "is_empty",
    "contains",
    "keys",
    "values",
    "push",
    "pop",
    "shift",
    "insert",
    "remove",
    "clear",
    "sort",
    "reverse",
    "filter",
    "map",
    "reduce",
    "some",
    "all",
    "index_of",
    "split",
    "trim",
    "sub_string",
    "to_upper",
    "to_lower",
    "starts_with",
    "ends_with",
    "chars",
];

/// Language keywords that never count as identifier references.
pub const KEYWORDS: &[&str] = &[
    "true", "false", "let", "const", "if", "else", "switch", "do", "while", "until", "loop", "for",
    "in", "continue", "break", "return", "throw", "try", "catch", "fn", "private", "import",
    "export", "as", "this", "global", "_",
];

/// Immutable, compiled policy used for every submission in a run.
#[derive(Debug, Clone)]
pub struct ValidationPolicy {
    allowed_modules: BTreeSet<String>,
    forbidden_calls: BTreeSet<String>,
    forbidden_attributes: Vec<Regex>,
    builtins: BTreeSet<String>,
    injected: BTreeSet<String>,
    namespaces: BTreeSet<String>,
    timeout: Duration,
}

impl ValidationPolicy {
    pub fn compile(rules: &PolicyRules, timeout: Duration) -> Result<Self> {
        let forbidden_attributes = rules
            .forbidden_attributes
            .iter()
            .map(|pattern| {
                Regex::new(pattern)
                    .with_context(|| format!("compile forbidden attribute pattern {pattern:?}"))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            allowed_modules: rules.allowed_modules.iter().cloned().collect(),
            forbidden_calls: rules.forbidden_calls.iter().cloned().collect(),
            forbidden_attributes,
            builtins: rules.builtins.iter().cloned().collect(),
            injected: injected_names().map(String::from).collect(),
            namespaces: INJECTED_MODULES
                .iter()
                .map(|s| s.to_string())
                .chain(std::iter::once("global".to_string()))
                .collect(),
            timeout,
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn allows_module(&self, name: &str) -> bool {
        self.allowed_modules.contains(name)
    }

    pub fn is_forbidden_call(&self, name: &str) -> bool {
        self.forbidden_calls.contains(name)
    }

    pub fn is_forbidden_attribute(&self, name: &str) -> bool {
        self.forbidden_attributes.iter().any(|re| re.is_match(name))
    }

    /// Whether a free identifier is available without a local declaration.
    pub fn is_known_identifier(&self, name: &str) -> bool {
        KEYWORDS.contains(&name) || self.builtins.contains(name) || self.injected.contains(name)
    }

    /// Whether the sandbox provides `name` itself.
    pub fn is_injected(&self, name: &str) -> bool {
        self.injected.contains(name)
    }

    /// Whether `name` is one of the injected direction constants.
    pub fn is_injected_constant(&self, name: &str) -> bool {
        Direction::ALL.iter().any(|dir| dir.constant_name() == name)
    }

    pub fn is_injected_namespace(&self, name: &str) -> bool {
        self.namespaces.contains(name)
    }

    pub fn allowed_modules(&self) -> impl Iterator<Item = &str> {
        self.allowed_modules.iter().map(String::as_str)
    }
}
