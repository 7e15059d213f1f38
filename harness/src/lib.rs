//! Planner harness: validated, time-bounded execution of planner-authored
//! Rhai scripts against an environment, with bounded planner context.
//!
//! The crate keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (validation, call tracking,
//!   context compression, decision parsing, episode state). No I/O.
//! - **[`io`]**: Side-effecting operations (configuration files, planner
//!   processes, prompt rendering, turn persistence, procedure files).
//!
//! [`sandbox`] runs accepted scripts against a [`capability::CapabilityApi`];
//! [`orchestrator`] ties everything together into one turn per decision.

pub mod capability;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod orchestrator;
pub mod sandbox;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
