//! Harness configuration stored under `.harness/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::compressor::CompressionConfig;
use crate::core::policy::{PolicyRules, ValidationPolicy};
use crate::core::state_machine::EpisodeLimits;
use crate::sandbox::{Sandbox, SandboxConfig};

/// Config location relative to the harness root.
pub const CONFIG_PATH: &str = ".harness/config.toml";

/// Harness configuration (TOML).
///
/// Every section is optional; missing fields take the defaults below.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HarnessConfig {
    pub episode: EpisodeLimits,
    pub context: CompressionConfig,
    pub sandbox: SandboxConfig,
    pub policy: PolicyRules,
    pub planner: PlannerConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PlannerConfig {
    /// Command that answers decision requests (e.g. `["python3", "planner.py"]`).
    pub command: Vec<String>,
    pub decision_timeout_secs: u64,
    /// Planner stdout beyond this many bytes is discarded.
    pub output_limit_bytes: usize,
    /// Offer `define_procedure` and `invoke_procedure` to the planner.
    pub procedures_enabled: bool,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            decision_timeout_secs: 60,
            output_limit_bytes: 1_000_000,
            procedures_enabled: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StorageConfig {
    /// Episode directory, relative to the harness root unless absolute.
    pub dir: PathBuf,
    /// Directory of persisted procedures; in-memory only when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub procedures_dir: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(".harness/episodes"),
            procedures_dir: None,
        }
    }
}

impl HarnessConfig {
    pub fn validate(&self) -> Result<()> {
        if self.episode.max_consecutive_failures == 0 {
            return Err(anyhow!("episode.max_consecutive_failures must be > 0"));
        }
        if self.context.state_window_turns == 0 {
            return Err(anyhow!("context.state_window_turns must be > 0"));
        }
        if self.sandbox.timeout_ms == 0 {
            return Err(anyhow!("sandbox.timeout_ms must be > 0"));
        }
        if self.sandbox.max_operations == 0 {
            return Err(anyhow!("sandbox.max_operations must be > 0"));
        }
        if self.planner.decision_timeout_secs == 0 {
            return Err(anyhow!("planner.decision_timeout_secs must be > 0"));
        }
        if self.planner.output_limit_bytes == 0 {
            return Err(anyhow!("planner.output_limit_bytes must be > 0"));
        }
        if self
            .planner
            .command
            .first()
            .is_some_and(|program| program.trim().is_empty())
        {
            return Err(anyhow!("planner.command must start with a program"));
        }
        self.validation_policy().context("invalid [policy]")?;
        Ok(())
    }

    /// Compiled policy; the sandbox timeout is the policy's time bound.
    pub fn validation_policy(&self) -> Result<ValidationPolicy> {
        ValidationPolicy::compile(&self.policy, self.sandbox.timeout())
    }

    pub fn sandbox(&self) -> Sandbox {
        Sandbox::new(self.sandbox, self.policy.allowed_modules.iter().cloned())
    }
}

/// Well-known locations under a harness root.
#[derive(Debug, Clone)]
pub struct HarnessPaths {
    pub root: PathBuf,
    pub config_path: PathBuf,
}

impl HarnessPaths {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            config_path: root.join(CONFIG_PATH),
        }
    }

    /// Resolve a configured path against the root.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `HarnessConfig::default()`.
pub fn load_config(path: &Path) -> Result<HarnessConfig> {
    if !path.exists() {
        return Ok(HarnessConfig::default());
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: HarnessConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &HarnessConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

/// Write `contents` next to `path` and rename it into place.
pub(crate) fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = parent.join(tmp_name);
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}
