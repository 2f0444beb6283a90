//! Content selectors: boolean predicates over message meta.
//!
//! ```text
//! region = 'eu' AND (level >= 3 OR NOT muted = 'true')
//! ```

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::message::Message;
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Str(String),
    Num(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Cmp(String, Op, Literal),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
}

#[derive(Clone, PartialEq)]
pub struct Selector {
    source: String,
    expr: Expr,
}

impl fmt::Debug for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Selector({})", self.source)
    }
}

impl Selector {
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Evaluate against `msg`. A missing key compares false; a non-numeric value compared
    /// with a numeric literal is an error.
    pub fn evaluate(&self, msg: &Message) -> Result<bool> {
        eval(&self.expr, msg)
    }
}

fn eval(expr: &Expr, msg: &Message) -> Result<bool> {
    match expr {
        Expr::And(l, r) => Ok(eval(l, msg)? && eval(r, msg)?),
        Expr::Or(l, r) => Ok(eval(l, msg)? || eval(r, msg)?),
        Expr::Not(e) => Ok(!eval(e, msg)?),
        Expr::Cmp(key, op, lit) => {
            let Some(value) = msg.meta.get(key) else {
                return Ok(false);
            };
            let ord = match lit {
                Literal::Str(s) => value.as_str().cmp(s.as_str()),
                Literal::Num(n) => {
                    let v = value
                        .trim()
                        .parse::<f64>()
                        .map_err(|_| Error::Selector(format!("`{key}` value `{value}` is not a number")))?;
                    v.partial_cmp(n).ok_or_else(|| Error::Selector(format!("`{key}` is not comparable")))?
                }
            };
            Ok(match op {
                Op::Eq => ord == Ordering::Equal,
                Op::Ne => ord != Ordering::Equal,
                Op::Lt => ord == Ordering::Less,
                Op::Le => ord != Ordering::Greater,
                Op::Gt => ord == Ordering::Greater,
                Op::Ge => ord != Ordering::Less,
            })
        }
    }
}

impl FromStr for Selector {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let tokens = tokenize(s)?;
        let mut p = Parser { tokens, pos: 0, depth: 0 };
        let expr = p.or()?;
        if p.pos != p.tokens.len() {
            return Err(Error::Selector(format!("unexpected trailing input in `{s}`")));
        }
        Ok(Selector { source: s.to_owned(), expr })
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Lit(Literal),
    Op(Op),
    And,
    Or,
    Not,
    LParen,
    RParen,
}

fn tokenize(s: &str) -> Result<Vec<Token>> {
    let chars = s.chars().collect::<Vec<_>>();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '=' => {
                tokens.push(Token::Op(Op::Eq));
                i += 1;
            }
            '<' | '>' | '!' => {
                let next = chars.get(i + 1).copied();
                let (op, len) = match (c, next) {
                    ('<', Some('>')) | ('!', Some('=')) => (Op::Ne, 2),
                    ('<', Some('=')) => (Op::Le, 2),
                    ('>', Some('=')) => (Op::Ge, 2),
                    ('<', _) => (Op::Lt, 1),
                    ('>', _) => (Op::Gt, 1),
                    _ => return Err(Error::Selector(format!("unexpected `{c}` in `{s}`"))),
                };
                tokens.push(Token::Op(op));
                i += len;
            }
            '\'' => {
                let mut lit = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(Error::Selector(format!("unterminated string in `{s}`"))),
                        Some('\'') if chars.get(i + 1) == Some(&'\'') => {
                            lit.push('\'');
                            i += 2;
                        }
                        Some('\'') => {
                            i += 1;
                            break;
                        }
                        Some(ch) => {
                            lit.push(*ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Lit(Literal::Str(lit)));
            }
            c if c.is_ascii_digit() || c == '-' || c == '.' => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text = chars[start..i].iter().collect::<String>();
                let n = text.parse::<f64>().map_err(|_| Error::Selector(format!("bad number `{text}`")))?;
                tokens.push(Token::Lit(Literal::Num(n)));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.') {
                    i += 1;
                }
                let word = chars[start..i].iter().collect::<String>();
                tokens.push(match word.to_ascii_uppercase().as_str() {
                    "AND" => Token::And,
                    "OR" => Token::Or,
                    "NOT" => Token::Not,
                    _ => Token::Ident(word),
                });
            }
            _ => return Err(Error::Selector(format!("unexpected `{c}` in `{s}`"))),
        }
    }
    Ok(tokens)
}

const MAX_DEPTH: usize = 64;

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn or(&mut self) -> Result<Expr> {
        let mut lhs = self.and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            lhs = Expr::Or(Box::new(lhs), Box::new(self.and()?));
        }
        Ok(lhs)
    }

    fn and(&mut self) -> Result<Expr> {
        let mut lhs = self.not()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            lhs = Expr::And(Box::new(lhs), Box::new(self.not()?));
        }
        Ok(lhs)
    }

    fn nested<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        if self.depth >= MAX_DEPTH {
            return Err(Error::Selector(format!("nesting deeper than {MAX_DEPTH}")));
        }
        self.depth += 1;
        let r = f(self);
        self.depth -= 1;
        r
    }

    fn not(&mut self) -> Result<Expr> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            return Ok(Expr::Not(Box::new(self.nested(Self::not)?)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr> {
        match self.next() {
            Some(Token::LParen) => {
                let e = self.nested(Self::or)?;
                match self.next() {
                    Some(Token::RParen) => Ok(e),
                    _ => Err(Error::Selector("missing `)`".into())),
                }
            }
            Some(Token::Ident(key)) => match (self.next(), self.next()) {
                (Some(Token::Op(op)), Some(Token::Lit(lit))) => Ok(Expr::Cmp(key, op, lit)),
                _ => Err(Error::Selector(format!("expected `{key} <op> <literal>`"))),
            },
            other => Err(Error::Selector(format!("unexpected token {other:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sel(s: &str) -> Selector {
        Selector::from_str(s).unwrap()
    }

    #[test]
    fn comparisons() {
        let msg = Message::new("").meta("region", "eu").meta("level", "4");
        assert!(sel("region = 'eu'").evaluate(&msg).unwrap());
        assert!(!sel("region <> 'eu'").evaluate(&msg).unwrap());
        assert!(sel("level > 3").evaluate(&msg).unwrap());
        assert!(sel("level >= 4 AND level <= 4").evaluate(&msg).unwrap());
        assert!(!sel("level < 4").evaluate(&msg).unwrap());
        assert!(sel("level != 5").evaluate(&msg).unwrap());
    }

    #[test]
    fn logic_and_precedence() {
        let msg = Message::new("").meta("a", "1").meta("b", "x");
        assert!(sel("a = 2 OR b = 'x' AND a = 1").evaluate(&msg).unwrap());
        assert!(!sel("(a = 2 OR b = 'x') AND a = 2").evaluate(&msg).unwrap());
        assert!(sel("NOT a = 2").evaluate(&msg).unwrap());
        assert!(sel("not (a = 2) and b = 'x'").evaluate(&msg).unwrap());
    }

    #[test]
    fn missing_key_is_false() {
        let msg = Message::new("");
        assert!(!sel("region = 'eu'").evaluate(&msg).unwrap());
        assert!(sel("NOT region = 'eu'").evaluate(&msg).unwrap());
    }

    #[test]
    fn evaluation_error() {
        let msg = Message::new("").meta("level", "high");
        assert!(matches!(sel("level > 3").evaluate(&msg), Err(Error::Selector(_))));
    }

    #[test]
    fn parse_errors() {
        assert!(Selector::from_str("a =").is_err());
        assert!(Selector::from_str("(a = 1").is_err());
        assert!(Selector::from_str("a = 'x").is_err());
        assert!(Selector::from_str("a = 1 b").is_err());
        assert!(Selector::from_str("a ~ 1").is_err());
    }

    #[test]
    fn nesting_is_capped() {
        let deep = format!("{}a = 1{}", "(".repeat(100), ")".repeat(100));
        assert!(matches!(Selector::from_str(&deep), Err(Error::Selector(_))));
        let nots = format!("{}a = 1", "NOT ".repeat(100));
        assert!(matches!(Selector::from_str(&nots), Err(Error::Selector(_))));

        let msg = Message::new("").meta("a", "1");
        let ok = format!("{}a = 1{}", "(".repeat(10), ")".repeat(10));
        assert!(sel(&ok).evaluate(&msg).unwrap());
        assert!(sel("NOT NOT a = 1").evaluate(&msg).unwrap());
    }

    #[test]
    fn quoted_quote() {
        let msg = Message::new("").meta("name", "o'neil");
        assert!(sel("name = 'o''neil'").evaluate(&msg).unwrap());
        assert_eq!(sel("name = 'o''neil'").as_str(), "name = 'o''neil'");
    }
}
