//! Core library for megatron.
//!
//! Executes stage scripts against hardware capability traits: a line parser
//! and interpreter for the script language, a condition watcher for
//! `waitai`/`waitdi`, and a periodic CSV logger scoped to each run. It is
//! used by the `megatron` binary and by the integration tests.

pub mod condition;
pub mod config;
pub mod error;
pub mod hardware;
pub mod logger;
pub mod runner;
pub mod script;

pub use error::{AppResult, DaqError};
