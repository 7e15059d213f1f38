//! Planner-defined procedures, optionally persisted as `<name>.rhai` files.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;
use tracing::{debug, warn};

use crate::capability::injected_names;
use crate::core::policy::{KEYWORDS, ValidationPolicy};
use crate::io::config::write_atomic;

static PROCEDURE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z_][a-z0-9_]*$").expect("valid procedure name regex"));

/// Why a name cannot be used for a procedure, if it cannot.
pub fn check_name(name: &str) -> Result<(), String> {
    if !PROCEDURE_NAME.is_match(name) {
        return Err(format!("procedure name {name:?} must match ^[a-z_][a-z0-9_]*$"));
    }
    if KEYWORDS.contains(&name) || injected_names().any(|injected| injected == name) {
        return Err(format!("procedure name {name:?} shadows a built-in name"));
    }
    Ok(())
}

#[derive(Debug, Clone, Default)]
pub struct ProcedureLibrary {
    procedures: BTreeMap<String, String>,
    dir: Option<PathBuf>,
}

impl ProcedureLibrary {
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load every valid `<name>.rhai` in `dir`; new definitions are written there.
    ///
    /// Files that fail validation are skipped with a warning.
    pub fn open(dir: &Path, policy: &ValidationPolicy) -> Result<Self> {
        fs::create_dir_all(dir).with_context(|| format!("create directory {}", dir.display()))?;
        let mut procedures = BTreeMap::new();
        for entry in fs::read_dir(dir).with_context(|| format!("read {}", dir.display()))? {
            let path = entry
                .with_context(|| format!("read entry in {}", dir.display()))?
                .path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("rhai") {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            if let Err(reason) = check_name(name) {
                warn!(path = %path.display(), reason = %reason, "skipping procedure file");
                continue;
            }
            let source = fs::read_to_string(&path)
                .with_context(|| format!("read {}", path.display()))?;
            let verdict = policy.evaluate_procedure(name, &source);
            if !verdict.is_accepted() {
                warn!(
                    path = %path.display(),
                    violations = verdict.violations().len(),
                    "skipping invalid procedure"
                );
                continue;
            }
            procedures.insert(name.to_string(), source);
        }
        debug!(count = procedures.len(), dir = %dir.display(), "procedures loaded");
        Ok(Self {
            procedures,
            dir: Some(dir.to_path_buf()),
        })
    }

    /// Store an already validated procedure, replacing any previous definition.
    pub fn define(&mut self, name: &str, source: &str) -> Result<()> {
        check_name(name).map_err(anyhow::Error::msg)?;
        if let Some(dir) = &self.dir {
            write_atomic(&dir.join(format!("{name}.rhai")), source)?;
        }
        self.procedures.insert(name.to_string(), source.to_string());
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.procedures.get(name).map(String::as_str)
    }

    pub fn names(&self) -> Vec<String> {
        self.procedures.keys().cloned().collect()
    }

    /// Source that defines the procedure and calls it with the bound `params`.
    pub fn invocation_source(&self, name: &str) -> Option<String> {
        self.get(name)
            .map(|source| format!("{}\n{name}(params)\n", source.trim_end()))
    }
}
