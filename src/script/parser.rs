//! Line parser for the stage script language.
//!
//! A line is tokenized with shell-like quoting: single quotes keep everything
//! literally, double quotes allow `\"` and `\\` escapes, and an unquoted
//! backslash escapes the next character. Unquoted commas separate tokens the
//! same way whitespace does, and the first unquoted `#` starts a comment.
//!
//! The first token is the opcode. Each opcode has a fixed argument count (or
//! range) and numeric arguments must match the integer/decimal shape the
//! opcode expects; anything else is a [`DaqError::Parse`] carrying the opcode
//! and the raw line.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::condition::Operator;
use crate::error::{AppResult, DaqError};
use crate::script::instruction::Instruction;

#[allow(clippy::expect_used)]
static PAUSE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^t(\d+)$").expect("valid pause pattern"));
#[allow(clippy::expect_used)]
static UNSIGNED: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d+$").expect("valid unsigned pattern"));
#[allow(clippy::expect_used)]
static SIGNED: Lazy<Regex> = Lazy::new(|| Regex::new(r"^-?\d+$").expect("valid signed pattern"));
#[allow(clippy::expect_used)]
static DECIMAL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[-+]?(\d+\.?\d*|\.\d+)([eE][-+]?\d+)?$").expect("valid decimal pattern")
});

#[derive(Clone, Copy, PartialEq)]
enum Quote {
    None,
    Single,
    Double,
}

/// Split a line into trimmed tokens, dropping the comment.
pub fn tokenize(line: &str) -> Result<Vec<String>, String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quote = Quote::None;
    let mut chars = line.chars().peekable();

    let mut finish = |current: &mut String, in_token: &mut bool| {
        if *in_token {
            tokens.push(current.trim().to_string());
            current.clear();
            *in_token = false;
        }
    };

    while let Some(c) = chars.next() {
        match quote {
            Quote::Single => match c {
                '\'' => quote = Quote::None,
                _ => current.push(c),
            },
            Quote::Double => match c {
                '"' => quote = Quote::None,
                '\\' if matches!(chars.peek(), Some('"') | Some('\\')) => {
                    if let Some(escaped) = chars.next() {
                        current.push(escaped);
                    }
                }
                _ => current.push(c),
            },
            Quote::None => match c {
                '#' => break,
                ',' => finish(&mut current, &mut in_token),
                c if c.is_whitespace() => finish(&mut current, &mut in_token),
                '\'' => {
                    quote = Quote::Single;
                    in_token = true;
                }
                '"' => {
                    quote = Quote::Double;
                    in_token = true;
                }
                '\\' => {
                    in_token = true;
                    match chars.next() {
                        Some(escaped) => current.push(escaped),
                        None => return Err("trailing backslash".to_string()),
                    }
                }
                _ => {
                    in_token = true;
                    current.push(c);
                }
            },
        }
    }

    if quote != Quote::None {
        return Err("unterminated quote".to_string());
    }
    finish(&mut current, &mut in_token);
    Ok(tokens)
}

/// Parse one raw script line.
pub fn parse_line(line: &str) -> AppResult<Instruction> {
    let tokens = tokenize(line).map_err(|reason| {
        let opcode = line.split_whitespace().next().unwrap_or_default();
        DaqError::parse(opcode, line, reason)
    })?;

    let Some((opcode, args)) = tokens.split_first() else {
        return Ok(Instruction::Empty);
    };
    let ctx = LineContext { opcode, line, args };

    if let Some(caps) = PAUSE.captures(opcode) {
        ctx.arity(0, 0)?;
        let seconds = caps[1]
            .parse()
            .map_err(|_| ctx.error(format!("pause duration '{}' out of range", &caps[1])))?;
        return Ok(Instruction::Pause { seconds });
    }

    let instruction = match opcode.as_str() {
        "sp" => {
            ctx.arity(1, 1)?;
            Instruction::SetSpeed {
                speed: ctx.unsigned(0)?,
            }
        }
        "pa" => {
            ctx.arity(1, 1)?;
            Instruction::SetAbsolutePosition {
                position: ctx.signed(0)?,
            }
        }
        "pr" => {
            ctx.arity(1, 1)?;
            Instruction::SetRelativePosition {
                position: ctx.signed(0)?,
            }
        }
        "bg" => {
            ctx.arity(0, 0)?;
            Instruction::Begin
        }
        "st" => {
            ctx.arity(0, 0)?;
            Instruction::Stop
        }
        "hm" => {
            ctx.arity(0, 0)?;
            Instruction::Home
        }
        "set" => {
            ctx.arity(2, 2)?;
            Instruction::SetOutput {
                name: args[0].clone(),
                value: args[1].clone(),
            }
        }
        "waitai" => {
            ctx.arity(3, 5)?;
            Instruction::WaitAnalog {
                source: args[0].clone(),
                operator: args[1].parse::<Operator>()?,
                value: ctx.decimal(2)?,
                tolerance: ctx.optional(3, |i| ctx.decimal(i))?,
                timeout: ctx.optional(4, |i| ctx.timeout(i))?,
            }
        }
        "waitdi" => {
            ctx.arity(2, 3)?;
            Instruction::WaitDigital {
                source: args[0].clone(),
                value: ctx.signed(1)?,
                timeout: ctx.optional(2, |i| ctx.timeout(i))?,
            }
        }
        "log" => {
            ctx.arity(1, 1)?;
            Instruction::Log {
                name: args[0].clone(),
            }
        }
        _ => return Err(ctx.error("unknown opcode")),
    };
    Ok(instruction)
}

struct LineContext<'a> {
    opcode: &'a str,
    line: &'a str,
    args: &'a [String],
}

impl LineContext<'_> {
    fn error(&self, reason: impl Into<String>) -> DaqError {
        DaqError::parse(self.opcode, self.line, reason)
    }

    fn arity(&self, min: usize, max: usize) -> AppResult<()> {
        let got = self.args.len();
        if (min..=max).contains(&got) {
            return Ok(());
        }
        let expected = if min == max {
            format!("{} argument{}", min, if min == 1 { "" } else { "s" })
        } else {
            format!("{} to {} arguments", min, max)
        };
        Err(self.error(format!("expected {}, got {}", expected, got)))
    }

    fn unsigned(&self, index: usize) -> AppResult<u64> {
        let token = &self.args[index];
        if !UNSIGNED.is_match(token) {
            return Err(self.error(format!("invalid unsigned integer '{}'", token)));
        }
        token
            .parse()
            .map_err(|_| self.error(format!("integer '{}' out of range", token)))
    }

    fn signed(&self, index: usize) -> AppResult<i64> {
        let token = &self.args[index];
        if !SIGNED.is_match(token) {
            return Err(self.error(format!("invalid signed integer '{}'", token)));
        }
        token
            .parse()
            .map_err(|_| self.error(format!("integer '{}' out of range", token)))
    }

    fn decimal(&self, index: usize) -> AppResult<f64> {
        let token = &self.args[index];
        if !DECIMAL.is_match(token) {
            return Err(self.error(format!("invalid number '{}'", token)));
        }
        match token.parse::<f64>() {
            Ok(value) if value.is_finite() => Ok(value),
            _ => Err(self.error(format!("number '{}' out of range", token))),
        }
    }

    fn timeout(&self, index: usize) -> AppResult<f64> {
        let value = self.decimal(index)?;
        if value < 0.0 {
            return Err(self.error(format!("timeout {} must not be negative", value)));
        }
        Ok(value)
    }

    fn optional<T>(
        &self,
        index: usize,
        parse: impl FnOnce(usize) -> AppResult<T>,
    ) -> AppResult<Option<T>> {
        if index < self.args.len() {
            parse(index).map(Some)
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_err(line: &str) -> (String, String) {
        match parse_line(line) {
            Err(DaqError::Parse { opcode, line, .. }) => (opcode, line),
            other => panic!("expected parse error for {:?}, got {:?}", line, other),
        }
    }

    #[test]
    fn test_tokenize_quotes_commas_and_comments() {
        assert_eq!(
            tokenize(r#"waitai "Galil RBV", >, 100  # wait for stage"#).unwrap(),
            vec!["waitai", "Galil RBV", ">", "100"]
        );
        assert_eq!(
            tokenize("set 'ION Output Enable' Disable").unwrap(),
            vec!["set", "ION Output Enable", "Disable"]
        );
        assert_eq!(tokenize(r#"log "a \"b\" #c""#).unwrap(), vec!["log", "a \"b\" #c"]);
        assert_eq!(tokenize("   # only a comment").unwrap(), Vec::<String>::new());
        assert_eq!(tokenize("log \"\"").unwrap(), vec!["log", ""]);
        assert!(tokenize("log \"Galil RBV").is_err());
    }

    #[test]
    fn test_empty_lines() {
        assert_eq!(parse_line("").unwrap(), Instruction::Empty);
        assert_eq!(parse_line("    ").unwrap(), Instruction::Empty);
        assert_eq!(parse_line("# move the stage").unwrap(), Instruction::Empty);
        assert_eq!(parse_line(" , ,").unwrap(), Instruction::Empty);
    }

    #[test]
    fn test_motion_opcodes() {
        assert_eq!(
            parse_line("t60").unwrap(),
            Instruction::Pause { seconds: 60 }
        );
        assert_eq!(
            parse_line("sp 500000").unwrap(),
            Instruction::SetSpeed { speed: 500000 }
        );
        assert_eq!(
            parse_line("pa -200000").unwrap(),
            Instruction::SetAbsolutePosition { position: -200000 }
        );
        assert_eq!(
            parse_line("pr 1000").unwrap(),
            Instruction::SetRelativePosition { position: 1000 }
        );
        assert_eq!(parse_line("bg").unwrap(), Instruction::Begin);
        assert_eq!(parse_line("st  # stop").unwrap(), Instruction::Stop);
        assert_eq!(parse_line("hm").unwrap(), Instruction::Home);
    }

    #[test]
    fn test_io_opcodes() {
        assert_eq!(
            parse_line("set \"ION Output Enable\" Disable").unwrap(),
            Instruction::SetOutput {
                name: "ION Output Enable".into(),
                value: "Disable".into()
            }
        );
        assert_eq!(
            parse_line("waitai \"ION Power\" >= 4000").unwrap(),
            Instruction::WaitAnalog {
                source: "ION Power".into(),
                operator: Operator::GreaterEqual,
                value: 4000.0,
                tolerance: None,
                timeout: None,
            }
        );
        assert_eq!(
            parse_line("waitai \"Galil RBV\", =, -5000, 100, 2.5").unwrap(),
            Instruction::WaitAnalog {
                source: "Galil RBV".into(),
                operator: Operator::Equal,
                value: -5000.0,
                tolerance: Some(100.0),
                timeout: Some(2.5),
            }
        );
        assert_eq!(
            parse_line("waitdi \"ION Output Enable\" 1 30").unwrap(),
            Instruction::WaitDigital {
                source: "ION Output Enable".into(),
                value: 1,
                timeout: Some(30.0),
            }
        );
        assert_eq!(
            parse_line("log \"ION Current\"").unwrap(),
            Instruction::Log {
                name: "ION Current".into()
            }
        );
    }

    #[test]
    fn test_unknown_opcodes() {
        assert_eq!(parse_err("mv 10"), ("mv".into(), "mv 10".into()));
        assert_eq!(parse_err("BG").0, "BG");
        assert_eq!(parse_err("t").0, "t");
        assert_eq!(parse_err("t-5").0, "t-5");
        assert_eq!(parse_err("t1.5").0, "t1.5");
    }

    #[test]
    fn test_wrong_arity() {
        for line in [
            "t5 now",
            "sp",
            "sp 1 2",
            "pa",
            "bg 1",
            "st now",
            "hm 0",
            "set x",
            "set a b c",
            "waitai x >",
            "waitai x > 1 2 3 4",
            "waitdi x",
            "waitdi x 1 2 3",
            "log",
            "log a b",
        ] {
            let (opcode, raw) = parse_err(line);
            assert_eq!(raw, line);
            assert_eq!(opcode, line.split_whitespace().next().unwrap());
        }
    }

    #[test]
    fn test_malformed_numbers() {
        for line in [
            "sp -5",
            "sp 1.5",
            "sp fast",
            "sp 99999999999999999999999",
            "pa --5",
            "pa 1e3",
            "pr +",
            "waitai x > abc",
            "waitai x > 1 tol",
            "waitai x > 1 0 -3",
            "waitai x > 1e999",
            "waitdi x 0.5",
            "waitdi x 1 soon",
        ] {
            parse_err(line);
        }
    }

    #[test]
    fn test_invalid_operator() {
        assert!(matches!(
            parse_line("waitai \"ION Power\" ~ 5"),
            Err(DaqError::InvalidOperator(op)) if op == "~"
        ));
    }

    #[test]
    fn test_unterminated_quote_is_parse_error() {
        let (opcode, _) = parse_err("log \"Galil RBV");
        assert_eq!(opcode, "log");
    }

    #[test]
    fn test_display_round_trip() {
        let lines = [
            "t0",
            "t3600",
            "sp 500000",
            "pa -200000",
            "pr 42",
            "bg",
            "st",
            "hm",
            "set \"ION Output Enable\" Enable",
            "set 'weird, \"name\"' 'two words'",
            "waitai \"ION Power\" > 4000",
            "waitai \"ION Power\" = 10 0.5",
            "waitai \"Galil RBV\" != -1.25 3 0.1",
            "waitdi \"ION Output Enable\" 1",
            "waitdi \"ION Output Enable\" 0 12.5",
            "log \"Galil RBV\"",
            "log 'has # hash'",
        ];
        for line in lines {
            let parsed = parse_line(line).unwrap();
            let rendered = parsed.to_string();
            assert_eq!(
                parse_line(&rendered).unwrap(),
                parsed,
                "{:?} rendered as {:?}",
                line,
                rendered
            );
        }
    }
}
