//! Custom error types for the application.
//!
//! `DaqError` is the single error type returned by the script engine. Every
//! variant is fatal to the current script run: the runner aborts the remaining
//! instructions, stops the periodic logger and reports the error.
//!
//! ## Error Hierarchy
//!
//! - **`Parse`**: a script line was rejected by the line parser (unknown opcode,
//!   wrong argument count, malformed numeric literal, unterminated quote). Carries
//!   the opcode and the raw line.
//! - **`UnknownDevice`**: a display name used by `log`, `set`, `waitai` or
//!   `waitdi` is not in the device registry, or a device path segment could not
//!   be resolved while building the registry.
//! - **`InvalidOperator`**: a comparison operator outside `<`, `<=`, `>`, `>=`,
//!   `==`, `=`, `!=`.
//! - **`ConditionTimeout`**: a wait instruction did not see its condition before
//!   the timeout elapsed.
//! - **`Hardware`**: wraps `anyhow::Error` from capability implementations (the
//!   hardware layer reports errors the way drivers do, with context chains).
//!
//! By using `#[from]`, `DaqError` can be created from the underlying error types
//! with the `?` operator.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

#[derive(Error, Debug)]
pub enum DaqError {
    #[error("Invalid code line {line:?} (opcode '{opcode}'): {reason}")]
    Parse {
        opcode: String,
        line: String,
        reason: String,
    },

    #[error("Unrecognized device name: {0:?}")]
    UnknownDevice(String),

    #[error("Device '{0}' is missing in the devices list")]
    MissingDevice(String),

    #[error("Invalid operator: {0:?}")]
    InvalidOperator(String),

    #[error("Timed out after {timeout:?} waiting for condition on '{signal}'")]
    ConditionTimeout { signal: String, timeout: Duration },

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Instrument error: {0}")]
    Instrument(String),

    #[error("Hardware error: {0:#}")]
    Hardware(#[from] anyhow::Error),

    #[error("Script run was cancelled")]
    Cancelled,
}

impl DaqError {
    pub(crate) fn parse(opcode: &str, line: &str, reason: impl Into<String>) -> Self {
        DaqError::Parse {
            opcode: opcode.to_string(),
            line: line.to_string(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DaqError::UnknownDevice("ION Flux".to_string());
        assert_eq!(err.to_string(), "Unrecognized device name: \"ION Flux\"");
    }

    #[test]
    fn test_parse_error_carries_line_and_opcode() {
        let err = DaqError::parse("sp", "sp fast", "invalid unsigned integer 'fast'");
        let msg = err.to_string();
        assert!(msg.contains("\"sp fast\""));
        assert!(msg.contains("'sp'"));
    }

    #[test]
    fn test_hardware_error_keeps_context_chain() {
        let inner = anyhow::anyhow!("channel disabled").context("galil: move_absolute failed");
        let err = DaqError::from(inner);
        assert_eq!(
            err.to_string(),
            "Hardware error: galil: move_absolute failed: channel disabled"
        );
    }
}
