//! Stable exit codes for harness CLI commands.

/// Command succeeded; a validated script was accepted.
pub const OK: i32 = 0;
/// Command failed due to invalid config, paths, or other errors.
pub const INVALID: i32 = 1;
/// `harness validate` rejected the script.
pub const REJECTED: i32 = 2;
/// `harness turns` found no recorded turns for the episode.
pub const EMPTY: i32 = 3;
