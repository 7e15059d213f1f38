//! Deterministic, pure logic shared by the harness.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod compressor;
pub mod decision;
pub mod dedup;
pub mod lexer;
pub mod policy;
pub mod state_machine;
pub mod tracker;
pub mod types;
pub mod validation;
