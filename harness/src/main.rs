//! Planner harness CLI.
//!
//! Manages the harness configuration (`.harness/config.toml`), checks scripts
//! against the validation policy, and inspects recorded episodes.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use harness::core::validation::Verdict;
use harness::exit_codes;
use harness::io::config::{HarnessConfig, HarnessPaths, load_config, write_config};
use harness::io::turn_store::{FileTurnStore, TurnRepository};

#[derive(Parser)]
#[command(
    name = "harness",
    version,
    about = "Validated, time-bounded execution of planner-authored scripts"
)]
struct Cli {
    /// Directory containing `.harness/`.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write `.harness/config.toml` with defaults if missing.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Check a Rhai script against the validation policy.
    Validate {
        path: PathBuf,
        /// Check the script as the body of procedure NAME.
        #[arg(long, value_name = "NAME")]
        procedure: Option<String>,
    },
    /// Print the effective configuration.
    Config,
    /// Print the recorded turns of an episode as JSON.
    Turns {
        episode: String,
        /// Print only the most recent turn.
        #[arg(long)]
        latest: bool,
    },
}

fn main() {
    harness::logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let paths = HarnessPaths::new(&cli.root);
    match cli.command {
        Command::Init { force } => cmd_init(&paths, force),
        Command::Validate { path, procedure } => {
            cmd_validate(&paths, &path, procedure.as_deref())
        }
        Command::Config => cmd_config(&paths),
        Command::Turns { episode, latest } => cmd_turns(&paths, &episode, latest),
    }
}

fn cmd_init(paths: &HarnessPaths, force: bool) -> Result<i32> {
    if !force && paths.config_path.exists() {
        println!("{} already exists", paths.config_path.display());
        return Ok(exit_codes::OK);
    }
    write_config(&paths.config_path, &HarnessConfig::default())?;
    println!("wrote {}", paths.config_path.display());
    Ok(exit_codes::OK)
}

fn cmd_validate(paths: &HarnessPaths, path: &Path, procedure: Option<&str>) -> Result<i32> {
    let config = load_config(&paths.config_path)?;
    let policy = config.validation_policy()?;
    let source = fs::read_to_string(paths.resolve(path))
        .with_context(|| format!("read {}", path.display()))?;
    let verdict = match procedure {
        Some(name) => policy.evaluate_procedure(name, &source),
        None => policy.evaluate(&source),
    };
    match verdict {
        Verdict::Accepted => {
            println!("accepted");
            Ok(exit_codes::OK)
        }
        Verdict::Rejected(violations) => {
            for violation in &violations {
                println!("{violation}");
            }
            Ok(exit_codes::REJECTED)
        }
    }
}

fn cmd_config(paths: &HarnessPaths) -> Result<i32> {
    let config = load_config(&paths.config_path)?;
    print!("{}", toml::to_string_pretty(&config).context("serialize config toml")?);
    Ok(exit_codes::OK)
}

fn cmd_turns(paths: &HarnessPaths, episode: &str, latest: bool) -> Result<i32> {
    let config = load_config(&paths.config_path)?;
    let store = FileTurnStore::new(paths.resolve(&config.storage.dir));
    let turns: Vec<_> = if latest {
        store.latest_turn(episode)?.into_iter().collect()
    } else {
        store.list_turns(episode)?
    };
    if turns.is_empty() {
        eprintln!("no turns recorded for episode {episode}");
        return Ok(exit_codes::EMPTY);
    }
    let rendered = serde_json::to_string_pretty(&turns).context("serialize turns")?;
    println!("{rendered}");
    Ok(exit_codes::OK)
}
