//! Typed script instructions.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::condition::Operator;

/// One parsed script line.
///
/// `Display` renders the canonical source form, which parses back to an equal
/// instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Instruction {
    /// `t<N>`: sleep N seconds.
    Pause { seconds: u64 },
    /// `sp <speed>`: stage the velocity (scaled integer).
    SetSpeed { speed: u64 },
    /// `pa <position>`: stage an absolute target (scaled integer).
    SetAbsolutePosition { position: i64 },
    /// `pr <distance>`: stage a relative target (scaled integer).
    SetRelativePosition { position: i64 },
    /// `bg`
    Begin,
    /// `st`
    Stop,
    /// `hm`
    Home,
    /// `set <name> <value>`
    SetOutput { name: String, value: String },
    /// `waitai <source> <op> <value> [tolerance] [timeout]`
    WaitAnalog {
        source: String,
        operator: Operator,
        value: f64,
        tolerance: Option<f64>,
        timeout: Option<f64>,
    },
    /// `waitdi <source> <value> [timeout]`
    WaitDigital {
        source: String,
        value: i64,
        timeout: Option<f64>,
    },
    /// `log <name>`
    Log { name: String },
    /// Blank or comment-only line.
    Empty,
}

impl Instruction {
    /// Script opcode for this instruction (`t<N>` for pauses, empty for blank lines).
    pub fn opcode(&self) -> String {
        match self {
            Instruction::Pause { seconds } => format!("t{}", seconds),
            Instruction::SetSpeed { .. } => "sp".into(),
            Instruction::SetAbsolutePosition { .. } => "pa".into(),
            Instruction::SetRelativePosition { .. } => "pr".into(),
            Instruction::Begin => "bg".into(),
            Instruction::Stop => "st".into(),
            Instruction::Home => "hm".into(),
            Instruction::SetOutput { .. } => "set".into(),
            Instruction::WaitAnalog { .. } => "waitai".into(),
            Instruction::WaitDigital { .. } => "waitdi".into(),
            Instruction::Log { .. } => "log".into(),
            Instruction::Empty => String::new(),
        }
    }

    /// Whether executing this instruction touches hardware.
    pub fn is_effectful(&self) -> bool {
        matches!(
            self,
            Instruction::Begin
                | Instruction::Stop
                | Instruction::Home
                | Instruction::SetOutput { .. }
                | Instruction::WaitAnalog { .. }
                | Instruction::WaitDigital { .. }
        )
    }
}

/// Quote a token so the tokenizer reads it back unchanged.
pub(crate) fn quote(token: &str) -> String {
    let needs_quotes = token.is_empty()
        || token
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, ',' | '#' | '"' | '\'' | '\\'));
    if !needs_quotes {
        return token.to_string();
    }
    let mut quoted = String::with_capacity(token.len() + 2);
    quoted.push('"');
    for c in token.chars() {
        if matches!(c, '"' | '\\') {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instruction::Pause { seconds } => write!(f, "t{}", seconds),
            Instruction::SetSpeed { speed } => write!(f, "sp {}", speed),
            Instruction::SetAbsolutePosition { position } => write!(f, "pa {}", position),
            Instruction::SetRelativePosition { position } => write!(f, "pr {}", position),
            Instruction::Begin => f.write_str("bg"),
            Instruction::Stop => f.write_str("st"),
            Instruction::Home => f.write_str("hm"),
            Instruction::SetOutput { name, value } => {
                write!(f, "set {} {}", quote(name), quote(value))
            }
            Instruction::WaitAnalog {
                source,
                operator,
                value,
                tolerance,
                timeout,
            } => {
                write!(f, "waitai {} {} {}", quote(source), operator, value)?;
                match (tolerance, timeout) {
                    (Some(tolerance), Some(timeout)) => write!(f, " {} {}", tolerance, timeout),
                    (Some(tolerance), None) => write!(f, " {}", tolerance),
                    // timeout is positional after tolerance
                    (None, Some(timeout)) => write!(f, " 0 {}", timeout),
                    (None, None) => Ok(()),
                }
            }
            Instruction::WaitDigital {
                source,
                value,
                timeout,
            } => {
                write!(f, "waitdi {} {}", quote(source), value)?;
                if let Some(timeout) = timeout {
                    write!(f, " {}", timeout)?;
                }
                Ok(())
            }
            Instruction::Log { name } => write!(f, "log {}", quote(name)),
            Instruction::Empty => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_canonical_forms() {
        assert_eq!(Instruction::Pause { seconds: 60 }.to_string(), "t60");
        assert_eq!(
            Instruction::SetAbsolutePosition { position: -200000 }.to_string(),
            "pa -200000"
        );
        assert_eq!(
            Instruction::Log {
                name: "Galil RBV".into()
            }
            .to_string(),
            "log \"Galil RBV\""
        );
        assert_eq!(
            Instruction::WaitAnalog {
                source: "ION Power".into(),
                operator: Operator::Equal,
                value: 4000.0,
                tolerance: Some(0.5),
                timeout: None,
            }
            .to_string(),
            "waitai \"ION Power\" == 4000 0.5"
        );
    }

    #[test]
    fn test_quote_escapes() {
        assert_eq!(quote("plain"), "plain");
        assert_eq!(quote(""), "\"\"");
        assert_eq!(quote("a \"b\""), "\"a \\\"b\\\"\"");
        assert_eq!(quote("x#1"), "\"x#1\"");
    }

    #[test]
    fn test_opcode_and_effects() {
        assert_eq!(Instruction::Pause { seconds: 5 }.opcode(), "t5");
        assert!(Instruction::Begin.is_effectful());
        assert!(!Instruction::SetSpeed { speed: 1 }.is_effectful());
        assert!(!Instruction::Log { name: "x".into() }.is_effectful());
    }

    #[test]
    fn test_serializes_with_op_tag() {
        let json = serde_json::to_value(Instruction::SetSpeed { speed: 500000 }).unwrap();
        assert_eq!(json, serde_json::json!({"op": "set_speed", "speed": 500000}));
    }
}
