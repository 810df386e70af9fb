//! Stage script language: parsing, device name resolution and execution.
//!
//! A script is plain text, one instruction per line:
//!
//! ```text
//! log "Galil RBV"            # sample the readback while running
//! sp 500000                  # 0.5 units/s
//! pa -200000                 # absolute target -0.2
//! bg                         # start the move
//! waitai "Galil RBV" <= -199000 1000 30
//! set "ION Output Enable" Disable
//! t10
//! ```

pub mod instruction;
pub mod interpreter;
pub mod parser;
pub mod registry;

use std::path::Path;

use crate::error::AppResult;

pub use instruction::Instruction;
pub use interpreter::{
    Checkpoint, Interpreter, Mode, MotionState, MotionTiming, PositionMode, SCALE,
};
pub use parser::parse_line;
pub use registry::{DeviceEntry, DeviceRegistry, DeviceTable};

/// Raw script lines.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Script {
    lines: Vec<String>,
}

impl Script {
    /// Split `text` into lines, trimming surrounding spaces and line-ending
    /// characters.
    pub fn from_text(text: &str) -> Self {
        text.lines().collect()
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Parse every line, failing on the first malformed one.
    pub fn parse(&self) -> AppResult<Vec<Instruction>> {
        self.lines.iter().map(|line| parse_line(line)).collect()
    }
}

impl<S: AsRef<str>> FromIterator<S> for Script {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self {
            lines: iter
                .into_iter()
                .map(|line| line.as_ref().trim_matches([' ', '\n', '\r']).to_string())
                .collect(),
        }
    }
}

/// Read a script file.
pub async fn load_script(path: impl AsRef<Path>) -> AppResult<Script> {
    let text = tokio::fs::read_to_string(path.as_ref()).await?;
    Ok(Script::from_text(&text))
}
