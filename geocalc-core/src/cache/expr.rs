//! Expression Keys
//!
//! An [`Expr`] is an immutable S-expression term: a symbol, a literal, or an
//! operator call `(op arg...)`. It is both the textual form the host hands
//! to the engine and the key of the result cache, so equality is structural
//! and two equal terms always denote the same cache entry.
//!
//! # Syntax
//!
//! - `(op a b)`: operator call; the head must be a symbol.
//! - `1.5`, `-3`: number literal (always a `Float64` value).
//! - `#inf`, `-#inf`, `#nan`: non-finite number literals.
//! - `42u`: unsigned 64-bit literal.
//! - `"text"`: string literal, `\"` and `\\` escapes.
//! - anything else: a symbol, typically the full name of a tree item.
//!
//! Calls nest at most [`MAX_NESTING`] levels deep.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::Arc;

use crate::error::{EngineError, Result};

/// Deepest call nesting the parser accepts.
pub const MAX_NESTING: usize = 256;

/// A float literal with total ordering and canonical bits.
#[derive(Debug, Clone, Copy)]
pub struct Number(f64);

impl Number {
    pub fn new(value: f64) -> Self {
        if value == 0.0 {
            Number(0.0)
        } else if value.is_nan() {
            Number(f64::NAN)
        } else {
            Number(value)
        }
    }

    pub fn get(self) -> f64 {
        self.0
    }
}

impl PartialEq for Number {
    fn eq(&self, other: &Self) -> bool {
        self.0.to_bits() == other.0.to_bits()
    }
}

impl Eq for Number {}

impl PartialOrd for Number {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Number {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl Hash for Number {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.to_bits().hash(state);
    }
}

/// A canonical expression term.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Expr {
    Symbol(Arc<str>),
    Number(Number),
    UInt64(u64),
    String(Arc<str>),
    Call { op: Arc<str>, args: Vec<Expr> },
}

impl Expr {
    pub fn symbol(name: impl Into<Arc<str>>) -> Self {
        Expr::Symbol(name.into())
    }

    pub fn number(value: f64) -> Self {
        Expr::Number(Number::new(value))
    }

    pub fn string(value: impl Into<Arc<str>>) -> Self {
        Expr::String(value.into())
    }

    pub fn call(op: impl Into<Arc<str>>, args: impl IntoIterator<Item = Expr>) -> Self {
        Expr::Call {
            op: op.into(),
            args: args.into_iter().collect(),
        }
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut parser = Parser {
            text,
            pos: 0,
            depth: 0,
        };
        let expr = parser.expr()?;
        parser.skip_ws();
        if parser.pos != text.len() {
            return Err(parser.error("trailing input after expression"));
        }
        Ok(expr)
    }

    pub fn is_call(&self) -> bool {
        matches!(self, Expr::Call { .. })
    }

    pub fn args(&self) -> &[Expr] {
        match self {
            Expr::Call { args, .. } => args,
            _ => &[],
        }
    }
}

impl FromStr for Expr {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        Expr::parse(s)
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Symbol(name) => f.write_str(name),
            Expr::Number(n) => match n.get() {
                v if v.is_nan() => f.write_str("#nan"),
                v if v == f64::INFINITY => f.write_str("#inf"),
                v if v == f64::NEG_INFINITY => f.write_str("-#inf"),
                v => write!(f, "{v}"),
            },
            Expr::UInt64(v) => write!(f, "{v}u"),
            Expr::String(s) => {
                f.write_str("\"")?;
                for c in s.chars() {
                    match c {
                        '"' => f.write_str("\\\"")?,
                        '\\' => f.write_str("\\\\")?,
                        c => write!(f, "{c}")?,
                    }
                }
                f.write_str("\"")
            }
            Expr::Call { op, args } => {
                write!(f, "({op}")?;
                for arg in args {
                    write!(f, " {arg}")?;
                }
                f.write_str(")")
            }
        }
    }
}

struct Parser<'a> {
    text: &'a str,
    pos: usize,
    depth: usize,
}

impl Parser<'_> {
    fn error(&self, message: &str) -> EngineError {
        EngineError::Parse {
            pos: self.pos,
            message: message.to_string(),
        }
    }

    fn peek(&self) -> Option<char> {
        self.text[self.pos..].chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.bump();
        }
    }

    fn expr(&mut self) -> Result<Expr> {
        self.skip_ws();
        match self.peek() {
            None => Err(self.error("unexpected end of input")),
            Some('(') => self.call(),
            Some(')') => Err(self.error("unexpected ')'")),
            Some('"') => self.string(),
            Some(_) => Ok(self.atom()),
        }
    }

    fn call(&mut self) -> Result<Expr> {
        if self.depth == MAX_NESTING {
            return Err(self.error("expression nested too deeply"));
        }
        self.depth += 1;
        let call = self.call_body();
        self.depth -= 1;
        call
    }

    fn call_body(&mut self) -> Result<Expr> {
        self.bump();
        self.skip_ws();
        let op = match self.expr()? {
            Expr::Symbol(op) => op,
            _ => return Err(self.error("operator call must start with a symbol")),
        };
        let mut args = Vec::new();
        loop {
            self.skip_ws();
            match self.peek() {
                Some(')') => {
                    self.bump();
                    return Ok(Expr::Call { op, args });
                }
                None => return Err(self.error("missing ')'")),
                Some(_) => args.push(self.expr()?),
            }
        }
    }

    fn string(&mut self) -> Result<Expr> {
        self.bump();
        let mut value = String::new();
        loop {
            match self.bump() {
                None => return Err(self.error("unterminated string literal")),
                Some('"') => return Ok(Expr::string(value)),
                Some('\\') => match self.bump() {
                    Some(c @ ('"' | '\\')) => value.push(c),
                    Some('n') => value.push('\n'),
                    _ => return Err(self.error("invalid escape sequence")),
                },
                Some(c) => value.push(c),
            }
        }
    }

    fn atom(&mut self) -> Expr {
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| !c.is_whitespace() && c != '(' && c != ')' && c != '"')
        {
            self.bump();
        }
        let token = &self.text[start..self.pos];

        match token {
            "#inf" => return Expr::number(f64::INFINITY),
            "-#inf" => return Expr::number(f64::NEG_INFINITY),
            "#nan" => return Expr::number(f64::NAN),
            _ => {}
        }
        if let Some(digits) = token.strip_suffix('u') {
            if let Ok(v) = digits.parse::<u64>() {
                return Expr::UInt64(v);
            }
        }
        if looks_numeric(token) {
            if let Ok(v) = token.parse::<f64>() {
                return Expr::number(v);
            }
        }
        Expr::symbol(token)
    }
}

fn looks_numeric(token: &str) -> bool {
    let mut chars = token.chars();
    match chars.next() {
        Some(c) if c.is_ascii_digit() => true,
        Some('-' | '+' | '.') => chars.next().is_some_and(|c| c.is_ascii_digit() || c == '.'),
        _ => false,
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nested_calls() {
        let expr = Expr::parse("(sum a (mul 2 /b/c))").unwrap();
        assert_eq!(
            expr,
            Expr::call(
                "sum",
                [
                    Expr::symbol("a"),
                    Expr::call("mul", [Expr::number(2.0), Expr::symbol("/b/c")]),
                ]
            )
        );
    }

    #[test]
    fn literal_kinds() {
        assert_eq!(Expr::parse("42u").unwrap(), Expr::UInt64(42));
        assert_eq!(Expr::parse("-1.5").unwrap(), Expr::number(-1.5));
        assert_eq!(Expr::parse("-").unwrap(), Expr::symbol("-"));
        assert_eq!(
            Expr::parse(r#""say \"hi\"""#).unwrap(),
            Expr::string("say \"hi\"")
        );
    }

    #[test]
    fn syntactically_equal_keys_are_equal() {
        let a = Expr::parse("(sum a   1)").unwrap();
        let b = Expr::parse(" ( sum a 1.0 ) ").unwrap();
        assert_eq!(a, b);
        assert_eq!(Expr::number(0.0), Expr::number(-0.0));
    }

    #[test]
    fn display_reparses_to_the_same_key() {
        let expr = Expr::parse(r#"(concat "a\\b" 7u x)"#).unwrap();
        assert_eq!(Expr::parse(&expr.to_string()).unwrap(), expr);
    }

    #[test]
    fn non_finite_numbers_round_trip() {
        let expr = Expr::call(
            "clamp",
            [
                Expr::number(f64::INFINITY),
                Expr::number(f64::NEG_INFINITY),
                Expr::number(f64::NAN),
            ],
        );
        assert_eq!(expr.to_string(), "(clamp #inf -#inf #nan)");
        assert_eq!(Expr::parse(&expr.to_string()).unwrap(), expr);
    }

    #[test]
    fn nesting_is_capped() {
        let nested = |depth: usize| format!("{}x{}", "(f ".repeat(depth), ")".repeat(depth));
        assert!(Expr::parse(&nested(MAX_NESTING)).is_ok());
        match Expr::parse(&nested(100_000)) {
            Err(EngineError::Parse { message, .. }) => {
                assert_eq!(message, "expression nested too deeply")
            }
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn malformed_input_reports_position() {
        match Expr::parse("(sum a") {
            Err(EngineError::Parse { pos, .. }) => assert_eq!(pos, 6),
            other => panic!("expected parse error, got {other:?}"),
        }
        assert!(Expr::parse("(1 2)").is_err());
        assert!(Expr::parse("a b").is_err());
    }
}
