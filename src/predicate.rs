//! Button predicates
//!
//! A predicate decides whether a button is pressed from the raw report byte
//! at its pin. Predicates are written as small expressions over one input
//! named `value` and compiled once, when the configuration is loaded:
//!
//! ```text
//! expr    := and ( "||" and )*
//! and     := unary ( "&&" unary )*
//! unary   := "!" unary | atom
//! atom    := "(" expr ")" [ cmp operand ] | operand [ cmp operand ]
//! operand := term ( "&" term )*
//! term    := "value" | NUMBER
//! cmp     := "==" | "!=" | "<" | "<=" | ">" | ">="
//! ```
//!
//! A bare operand is a bitmask test: `value & 0x20` is true when bit 5 is set.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Predicate compilation error
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid predicate at offset {position}: {message}")]
pub struct PredicateError {
    /// Byte offset into the expression
    pub position: usize,
    pub message: String,
}

impl PredicateError {
    fn new(position: usize, message: impl Into<String>) -> Self {
        Self {
            position,
            message: message.into(),
        }
    }
}

/// Comparison operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    fn apply(self, lhs: u8, rhs: u8) -> bool {
        match self {
            CmpOp::Eq => lhs == rhs,
            CmpOp::Ne => lhs != rhs,
            CmpOp::Lt => lhs < rhs,
            CmpOp::Le => lhs <= rhs,
            CmpOp::Gt => lhs > rhs,
            CmpOp::Ge => lhs >= rhs,
        }
    }
}

/// Single operand term
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Term {
    /// The raw report byte
    Value,
    Literal(u8),
}

/// Terms combined with bitwise AND
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operand(Vec<Term>);

impl Operand {
    fn eval(&self, value: u8) -> u8 {
        self.0.iter().fold(0xFF, |acc, term| {
            acc & match term {
                Term::Value => value,
                Term::Literal(n) => *n,
            }
        })
    }
}

/// Compiled expression tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Or(Box<Node>, Box<Node>),
    And(Box<Node>, Box<Node>),
    Not(Box<Node>),
    Compare(Operand, CmpOp, Operand),
    /// Non-zero test
    Test(Operand),
}

impl Node {
    fn eval(&self, value: u8) -> bool {
        match self {
            Node::Or(a, b) => a.eval(value) || b.eval(value),
            Node::And(a, b) => a.eval(value) && b.eval(value),
            Node::Not(inner) => !inner.eval(value),
            Node::Compare(lhs, op, rhs) => op.apply(lhs.eval(value), rhs.eval(value)),
            Node::Test(operand) => operand.eval(value) != 0,
        }
    }
}

/// Compiled button predicate
///
/// Serialises as its source expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Predicate {
    source: String,
    node: Node,
}

impl Predicate {
    /// Compile an expression
    pub fn parse(source: &str) -> Result<Self, PredicateError> {
        let tokens = tokenize(source)?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            end: source.len(),
        };
        let node = parser.expr()?;
        if let Some(token) = parser.peek() {
            return Err(PredicateError::new(
                token.offset,
                format!("unexpected {}", token.kind),
            ));
        }
        Ok(Self {
            source: source.trim().to_string(),
            node,
        })
    }

    /// `value >= threshold`
    pub fn threshold(threshold: u8) -> Self {
        Self {
            source: format!("value >= {threshold}"),
            node: Node::Compare(
                Operand(vec![Term::Value]),
                CmpOp::Ge,
                Operand(vec![Term::Literal(threshold)]),
            ),
        }
    }

    /// `value & mask`, true when any masked bit is set
    pub fn mask(mask: u8) -> Self {
        Self {
            source: format!("value & 0x{mask:02X}"),
            node: Node::Test(Operand(vec![Term::Value, Term::Literal(mask)])),
        }
    }

    /// `(value & mask) == a || (value & mask) == b || ...`
    pub fn masked_any_of(mask: u8, values: &[u8]) -> Self {
        let compare = |v: u8| {
            Node::Compare(
                Operand(vec![Term::Value, Term::Literal(mask)]),
                CmpOp::Eq,
                Operand(vec![Term::Literal(v)]),
            )
        };
        let node = values
            .iter()
            .map(|&v| compare(v))
            .reduce(|acc, next| Node::Or(Box::new(acc), Box::new(next)))
            .unwrap_or_else(|| Node::Test(Operand(vec![Term::Literal(0)])));
        let source = if values.is_empty() {
            "0".to_string()
        } else {
            values
                .iter()
                .map(|v| format!("(value & 0x{mask:02X}) == {v}"))
                .collect::<Vec<_>>()
                .join(" || ")
        };
        Self { source, node }
    }

    /// Evaluate against a raw report byte
    pub fn evaluate(&self, value: u8) -> bool {
        self.node.eval(value)
    }

    /// The expression this predicate was compiled from
    pub fn source(&self) -> &str {
        &self.source
    }
}

impl FromStr for Predicate {
    type Err = PredicateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Predicate {
    type Error = PredicateError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Predicate> for String {
    fn from(predicate: Predicate) -> Self {
        predicate.source
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

// ---------------------------------------------------------------------------
// Tokenizer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenKind {
    Value,
    Number(u8),
    Amp,
    AndAnd,
    OrOr,
    Bang,
    LParen,
    RParen,
    Cmp(CmpOp),
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenKind::Value => write!(f, "'value'"),
            TokenKind::Number(n) => write!(f, "number {n}"),
            TokenKind::Amp => write!(f, "'&'"),
            TokenKind::AndAnd => write!(f, "'&&'"),
            TokenKind::OrOr => write!(f, "'||'"),
            TokenKind::Bang => write!(f, "'!'"),
            TokenKind::LParen => write!(f, "'('"),
            TokenKind::RParen => write!(f, "')'"),
            TokenKind::Cmp(_) => write!(f, "comparison"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Token {
    kind: TokenKind,
    offset: usize,
}

fn tokenize(source: &str) -> Result<Vec<Token>, PredicateError> {
    let bytes = source.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        let next = bytes.get(i + 1).copied();
        let start = i;

        let (kind, len) = match (c, next) {
            (b' ' | b'\t' | b'\n' | b'\r', _) => {
                i += 1;
                continue;
            }
            (b'&', Some(b'&')) => (TokenKind::AndAnd, 2),
            (b'&', _) => (TokenKind::Amp, 1),
            (b'|', Some(b'|')) => (TokenKind::OrOr, 2),
            (b'!', Some(b'=')) => (TokenKind::Cmp(CmpOp::Ne), 2),
            (b'!', _) => (TokenKind::Bang, 1),
            (b'=', Some(b'=')) => (TokenKind::Cmp(CmpOp::Eq), 2),
            (b'<', Some(b'=')) => (TokenKind::Cmp(CmpOp::Le), 2),
            (b'<', _) => (TokenKind::Cmp(CmpOp::Lt), 1),
            (b'>', Some(b'=')) => (TokenKind::Cmp(CmpOp::Ge), 2),
            (b'>', _) => (TokenKind::Cmp(CmpOp::Gt), 1),
            (b'(', _) => (TokenKind::LParen, 1),
            (b')', _) => (TokenKind::RParen, 1),
            (b'0'..=b'9', _) => {
                let len = bytes[i..]
                    .iter()
                    .take_while(|b| b.is_ascii_alphanumeric())
                    .count();
                let text = &source[i..i + len];
                (TokenKind::Number(parse_number(text, start)?), len)
            }
            (b'a'..=b'z' | b'A'..=b'Z' | b'_', _) => {
                let len = bytes[i..]
                    .iter()
                    .take_while(|b| b.is_ascii_alphanumeric() || **b == b'_')
                    .count();
                let word = &source[i..i + len];
                if word != "value" {
                    return Err(PredicateError::new(
                        start,
                        format!("unknown identifier '{word}', only 'value' is allowed"),
                    ));
                }
                (TokenKind::Value, len)
            }
            _ => {
                let ch = source[i..].chars().next().unwrap_or('?');
                return Err(PredicateError::new(
                    start,
                    format!("unexpected character '{ch}'"),
                ));
            }
        };

        tokens.push(Token {
            kind,
            offset: start,
        });
        i += len;
    }

    Ok(tokens)
}

fn parse_number(text: &str, offset: usize) -> Result<u8, PredicateError> {
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => text.parse::<u32>(),
    };
    match parsed {
        Ok(n) => u8::try_from(n).map_err(|_| {
            PredicateError::new(offset, format!("number {text} does not fit in a byte"))
        }),
        Err(_) => Err(PredicateError::new(offset, format!("bad number '{text}'"))),
    }
}

// ---------------------------------------------------------------------------
// Recursive descent parser
// ---------------------------------------------------------------------------

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    /// Offset reported for errors at end of input
    end: usize,
}

impl Parser {
    fn peek(&self) -> Option<Token> {
        self.tokens.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<Token> {
        let token = self.peek();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, kind: TokenKind) -> bool {
        if self.peek().is_some_and(|t| t.kind == kind) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn error_here(&self, message: &str) -> PredicateError {
        match self.peek() {
            Some(token) => PredicateError::new(
                token.offset,
                format!("{message}, found {}", token.kind),
            ),
            None => PredicateError::new(self.end, format!("{message}, found end of input")),
        }
    }

    fn expr(&mut self) -> Result<Node, PredicateError> {
        let mut node = self.and()?;
        while self.eat(TokenKind::OrOr) {
            let rhs = self.and()?;
            node = Node::Or(Box::new(node), Box::new(rhs));
        }
        Ok(node)
    }

    fn and(&mut self) -> Result<Node, PredicateError> {
        let mut node = self.unary()?;
        while self.eat(TokenKind::AndAnd) {
            let rhs = self.unary()?;
            node = Node::And(Box::new(node), Box::new(rhs));
        }
        Ok(node)
    }

    fn unary(&mut self) -> Result<Node, PredicateError> {
        if self.eat(TokenKind::Bang) {
            return Ok(Node::Not(Box::new(self.unary()?)));
        }
        self.atom()
    }

    fn atom(&mut self) -> Result<Node, PredicateError> {
        if let Some(open) = self.peek().filter(|t| t.kind == TokenKind::LParen) {
            self.pos += 1;
            let inner = self.expr()?;
            if !self.eat(TokenKind::RParen) {
                return Err(self.error_here("expected ')'"));
            }
            return match (self.comparison(), inner) {
                (None, inner) => Ok(inner),
                // `(value & 0x0F) == 3` compares the parenthesised operand
                (Some(op), Node::Test(lhs)) => Ok(Node::Compare(lhs, op, self.operand()?)),
                (Some(_), _) => Err(PredicateError::new(
                    open.offset,
                    "only a numeric operand can be compared",
                )),
            };
        }

        let lhs = self.operand()?;
        match self.comparison() {
            Some(op) => Ok(Node::Compare(lhs, op, self.operand()?)),
            None => Ok(Node::Test(lhs)),
        }
    }

    fn comparison(&mut self) -> Option<CmpOp> {
        match self.peek() {
            Some(Token {
                kind: TokenKind::Cmp(op),
                ..
            }) => {
                self.pos += 1;
                Some(op)
            }
            _ => None,
        }
    }

    fn operand(&mut self) -> Result<Operand, PredicateError> {
        let mut terms = vec![self.term()?];
        while self.eat(TokenKind::Amp) {
            terms.push(self.term()?);
        }
        Ok(Operand(terms))
    }

    fn term(&mut self) -> Result<Term, PredicateError> {
        match self.peek().map(|t| t.kind) {
            Some(TokenKind::Value) => {
                self.bump();
                Ok(Term::Value)
            }
            Some(TokenKind::Number(n)) => {
                self.bump();
                Ok(Term::Literal(n))
            }
            _ => Err(self.error_here("expected 'value' or a number")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn truth_table(p: &Predicate) -> Vec<u8> {
        (0..=255u8).filter(|&v| p.evaluate(v)).collect()
    }

    #[test]
    fn test_threshold() {
        let p = Predicate::parse("value >= 128").unwrap();
        assert!(!p.evaluate(0));
        assert!(!p.evaluate(127));
        assert!(p.evaluate(128));
        assert!(p.evaluate(200));
        assert_eq!(truth_table(&p), truth_table(&Predicate::threshold(128)));
    }

    #[test]
    fn test_bitmask() {
        let p = Predicate::parse("value & 0x20").unwrap();
        assert!(p.evaluate(0x20));
        assert!(p.evaluate(0xFF));
        assert!(!p.evaluate(0xDF));
        assert_eq!(truth_table(&p), truth_table(&Predicate::mask(0x20)));
    }

    #[test]
    fn test_masked_compare_and_or() {
        let source = "(value & 0x0F) == 0 || (value & 0x0F) == 1 || (value & 0x0F) == 7";
        let p = Predicate::parse(source).unwrap();
        assert!(p.evaluate(0x00));
        assert!(p.evaluate(0x81));
        assert!(p.evaluate(0x17));
        assert!(!p.evaluate(0x08));
        assert!(!p.evaluate(0x02));
        assert_eq!(
            truth_table(&p),
            truth_table(&Predicate::masked_any_of(0x0F, &[0, 1, 7]))
        );
    }

    #[test]
    fn test_precedence_and_negation() {
        // && binds tighter than ||
        let p = Predicate::parse("value == 1 || value > 10 && value < 20").unwrap();
        assert!(p.evaluate(1));
        assert!(p.evaluate(15));
        assert!(!p.evaluate(25));

        let p = Predicate::parse("!(value & 1)").unwrap();
        assert!(p.evaluate(2));
        assert!(!p.evaluate(3));

        let p = Predicate::parse("value != 8").unwrap();
        assert!(!p.evaluate(8));
        assert!(p.evaluate(0));
    }

    #[test]
    fn test_errors_carry_position() {
        let err = Predicate::parse("value >= 300").unwrap_err();
        assert_eq!(err.position, 9);

        let err = Predicate::parse("x > 1").unwrap_err();
        assert_eq!(err.position, 0);

        let err = Predicate::parse("value >=").unwrap_err();
        assert_eq!(err.position, 8);
        assert!(err.message.contains("end of input"));

        let err = Predicate::parse("(value > 1) == 2").unwrap_err();
        assert_eq!(err.position, 0);

        let err = Predicate::parse("value 1").unwrap_err();
        assert_eq!(err.position, 6);

        assert!(Predicate::parse("").is_err());
        assert!(Predicate::parse("value $ 1").is_err());
    }

    #[test]
    fn test_serde_uses_source() {
        #[derive(Serialize, Deserialize)]
        struct Wrapper {
            predicate: Predicate,
        }

        let parsed: Wrapper = toml::from_str("predicate = \"value & 0x10\"").unwrap();
        assert!(parsed.predicate.evaluate(0x10));
        assert_eq!(parsed.predicate.to_string(), "value & 0x10");

        let out = toml::to_string(&parsed).unwrap();
        assert_eq!(out.trim(), "predicate = \"value & 0x10\"");

        assert!(toml::from_str::<Wrapper>("predicate = \"value >>\"").is_err());
    }
}
