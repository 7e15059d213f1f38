//! Side-effecting collaborators: configuration, child processes, the planner
//! transport, prompt rendering, and persistence.

pub mod config;
pub mod planner;
pub mod procedures;
pub mod process;
pub mod prompt;
pub mod turn_store;
