//! Command-line interface
//!
//! Handlers behind the `custody` binary.

pub mod commands;

pub use commands::*;
