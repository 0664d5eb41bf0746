//! Safe arithmetic expression evaluator for descriptor fields.
//!
//! Controller descriptors originally carried fields like `noteAssign` as
//! strings such as `"x + 16*y"`, evaluated at runtime. Rather than embed a
//! general-purpose interpreter, descriptors here are limited to a small
//! arithmetic grammar: integer literals, the operators
//! `+ - * / % & | ^ ~ << >>`, parentheses, named identifiers bound by the
//! caller (`x`, `y`, `noteNumber`, ...), and calls to non-recursive
//! user-defined helper expressions declared alongside the descriptor.

use std::collections::{HashMap, HashSet};
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum ExprError {
    UnexpectedEnd,
    UnexpectedToken(String),
    UnknownIdentifier(String),
    WrongArgCount { name: String, expected: usize, got: usize },
    DivisionByZero,
    RecursiveHelper(String),
}

impl fmt::Display for ExprError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExprError::UnexpectedEnd => write!(f, "unexpected end of expression"),
            ExprError::UnexpectedToken(t) => write!(f, "unexpected token: {t}"),
            ExprError::UnknownIdentifier(n) => write!(f, "unknown identifier: {n}"),
            ExprError::WrongArgCount { name, expected, got } => write!(
                f,
                "helper {name} expects {expected} argument(s), got {got}"
            ),
            ExprError::DivisionByZero => write!(f, "division by zero"),
            ExprError::RecursiveHelper(n) => write!(f, "helper {n} is (indirectly) recursive"),
        }
    }
}

impl std::error::Error for ExprError {}

/// A parsed arithmetic expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(i64),
    Var(String),
    Unary(UnOp, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    And,
    Or,
    Xor,
    Shl,
    Shr,
}

/// A user-defined helper: `name(params...) = body`.
#[derive(Debug, Clone)]
pub struct HelperDef {
    pub params: Vec<String>,
    pub body: Expr,
}

/// Parses a source string into an expression tree.
pub fn parse(src: &str) -> Result<Expr, ExprError> {
    let tokens = tokenize(src)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_expr(0)?;
    if parser.pos != parser.tokens.len() {
        return Err(ExprError::UnexpectedToken(format!(
            "{:?}",
            parser.tokens[parser.pos]
        )));
    }
    Ok(expr)
}

/// Validates that no helper transitively calls itself. Required because
/// the evaluator recurses through helper bodies with no cycle guard of its
/// own — helpers are expected to be a DAG, checked once at load time.
pub fn validate_helpers(helpers: &HashMap<String, HelperDef>) -> Result<(), ExprError> {
    for name in helpers.keys() {
        let mut visiting = HashSet::new();
        check_acyclic(name, helpers, &mut visiting)?;
    }
    Ok(())
}

fn check_acyclic(
    name: &str,
    helpers: &HashMap<String, HelperDef>,
    visiting: &mut HashSet<String>,
) -> Result<(), ExprError> {
    let Some(def) = helpers.get(name) else {
        return Ok(());
    };
    if !visiting.insert(name.to_string()) {
        return Err(ExprError::RecursiveHelper(name.to_string()));
    }
    collect_calls(&def.body, &mut |callee| {
        if helpers.contains_key(callee) {
            check_acyclic(callee, helpers, visiting)
        } else {
            Ok(())
        }
    })?;
    visiting.remove(name);
    Ok(())
}

fn collect_calls(
    expr: &Expr,
    visit: &mut impl FnMut(&str) -> Result<(), ExprError>,
) -> Result<(), ExprError> {
    match expr {
        Expr::Literal(_) | Expr::Var(_) => Ok(()),
        Expr::Unary(_, inner) => collect_calls(inner, visit),
        Expr::Binary(_, lhs, rhs) => {
            collect_calls(lhs, visit)?;
            collect_calls(rhs, visit)
        }
        Expr::Call(name, args) => {
            visit(name)?;
            for a in args {
                collect_calls(a, visit)?;
            }
            Ok(())
        }
    }
}

/// Evaluates `expr` under the given variable bindings, resolving calls
/// against `helpers`. Helper bodies are evaluated with only their own
/// parameters bound (no access to the caller's variables), mirroring plain
/// function semantics.
pub fn eval(
    expr: &Expr,
    vars: &HashMap<String, i64>,
    helpers: &HashMap<String, HelperDef>,
) -> Result<i64, ExprError> {
    match expr {
        Expr::Literal(n) => Ok(*n),
        Expr::Var(name) => vars
            .get(name)
            .copied()
            .ok_or_else(|| ExprError::UnknownIdentifier(name.clone())),
        Expr::Unary(op, inner) => {
            let v = eval(inner, vars, helpers)?;
            Ok(match op {
                UnOp::Neg => -v,
                UnOp::Not => !v,
            })
        }
        Expr::Binary(op, lhs, rhs) => {
            let l = eval(lhs, vars, helpers)?;
            let r = eval(rhs, vars, helpers)?;
            Ok(match op {
                BinOp::Add => l.wrapping_add(r),
                BinOp::Sub => l.wrapping_sub(r),
                BinOp::Mul => l.wrapping_mul(r),
                BinOp::Div => {
                    if r == 0 {
                        return Err(ExprError::DivisionByZero);
                    }
                    l.wrapping_div(r)
                }
                BinOp::Mod => {
                    if r == 0 {
                        return Err(ExprError::DivisionByZero);
                    }
                    l.wrapping_rem(r)
                }
                BinOp::And => l & r,
                BinOp::Or => l | r,
                BinOp::Xor => l ^ r,
                BinOp::Shl => l.wrapping_shl(r as u32),
                BinOp::Shr => l.wrapping_shr(r as u32),
            })
        }
        Expr::Call(name, args) => {
            let def = helpers
                .get(name)
                .ok_or_else(|| ExprError::UnknownIdentifier(name.clone()))?;
            if def.params.len() != args.len() {
                return Err(ExprError::WrongArgCount {
                    name: name.clone(),
                    expected: def.params.len(),
                    got: args.len(),
                });
            }
            let mut local = HashMap::with_capacity(def.params.len());
            for (param, arg) in def.params.iter().zip(args) {
                local.insert(param.clone(), eval(arg, vars, helpers)?);
            }
            eval(&def.body, &local, helpers)
        }
    }
}

// --- tokenizer ---

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Int(i64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Amp,
    Pipe,
    Caret,
    Tilde,
    Shl,
    Shr,
    LParen,
    RParen,
    Comma,
}

fn tokenize(src: &str) -> Result<Vec<Token>, ExprError> {
    let chars: Vec<char> = src.chars().collect();
    let mut i = 0;
    let mut tokens = Vec::new();
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '%' => {
                tokens.push(Token::Percent);
                i += 1;
            }
            '~' => {
                tokens.push(Token::Tilde);
                i += 1;
            }
            '^' => {
                tokens.push(Token::Caret);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '&' => {
                tokens.push(Token::Amp);
                i += 1;
            }
            '|' => {
                tokens.push(Token::Pipe);
                i += 1;
            }
            '<' if chars.get(i + 1) == Some(&'<') => {
                tokens.push(Token::Shl);
                i += 2;
            }
            '>' if chars.get(i + 1) == Some(&'>') => {
                tokens.push(Token::Shr);
                i += 2;
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
                let s: String = chars[start..i].iter().collect();
                tokens.push(Token::Int(s.parse().map_err(|_| {
                    ExprError::UnexpectedToken(s.clone())
                })?));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => return Err(ExprError::UnexpectedToken(other.to_string())),
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    // Precedence climbing: | (1) < ^ (2) < & (3) < shl/shr (4) < add/sub (5) < mul/div/mod (6)
    fn parse_expr(&mut self, min_prec: u8) -> Result<Expr, ExprError> {
        let mut lhs = self.parse_unary()?;
        loop {
            let (op, prec) = match self.peek() {
                Some(Token::Pipe) => (BinOp::Or, 1),
                Some(Token::Caret) => (BinOp::Xor, 2),
                Some(Token::Amp) => (BinOp::And, 3),
                Some(Token::Shl) => (BinOp::Shl, 4),
                Some(Token::Shr) => (BinOp::Shr, 4),
                Some(Token::Plus) => (BinOp::Add, 5),
                Some(Token::Minus) => (BinOp::Sub, 5),
                Some(Token::Star) => (BinOp::Mul, 6),
                Some(Token::Slash) => (BinOp::Div, 6),
                Some(Token::Percent) => (BinOp::Mod, 6),
                _ => break,
            };
            if prec < min_prec {
                break;
            }
            self.bump();
            let rhs = self.parse_expr(prec + 1)?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, ExprError> {
        match self.peek() {
            Some(Token::Minus) => {
                self.bump();
                Ok(Expr::Unary(UnOp::Neg, Box::new(self.parse_unary()?)))
            }
            Some(Token::Tilde) => {
                self.bump();
                Ok(Expr::Unary(UnOp::Not, Box::new(self.parse_unary()?)))
            }
            Some(Token::Plus) => {
                self.bump();
                self.parse_unary()
            }
            _ => self.parse_atom(),
        }
    }

    fn parse_atom(&mut self) -> Result<Expr, ExprError> {
        match self.bump().ok_or(ExprError::UnexpectedEnd)? {
            Token::Int(n) => Ok(Expr::Literal(n)),
            Token::Ident(name) => {
                if self.peek() == Some(&Token::LParen) {
                    self.bump();
                    let mut args = Vec::new();
                    if self.peek() != Some(&Token::RParen) {
                        loop {
                            args.push(self.parse_expr(0)?);
                            if self.peek() == Some(&Token::Comma) {
                                self.bump();
                            } else {
                                break;
                            }
                        }
                    }
                    match self.bump() {
                        Some(Token::RParen) => {}
                        other => {
                            return Err(ExprError::UnexpectedToken(format!("{other:?}")))
                        }
                    }
                    Ok(Expr::Call(name, args))
                } else {
                    Ok(Expr::Var(name))
                }
            }
            Token::LParen => {
                let inner = self.parse_expr(0)?;
                match self.bump() {
                    Some(Token::RParen) => Ok(inner),
                    other => Err(ExprError::UnexpectedToken(format!("{other:?}"))),
                }
            }
            other => Err(ExprError::UnexpectedToken(format!("{other:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, i64)]) -> HashMap<String, i64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn basic_arithmetic() {
        let e = parse("x + 16*y").unwrap();
        let v = vars(&[("x", 3), ("y", 2)]);
        assert_eq!(eval(&e, &v, &HashMap::new()).unwrap(), 35);
    }

    #[test]
    fn precedence_and_parens() {
        let e = parse("(x + y) * 2").unwrap();
        let v = vars(&[("x", 1), ("y", 2)]);
        assert_eq!(eval(&e, &v, &HashMap::new()).unwrap(), 6);
    }

    #[test]
    fn bitwise_ops() {
        let e = parse("x & 0xF").is_err(); // hex literals unsupported by design
        assert!(e);
        let e = parse("x & 15 | y ^ 1").unwrap();
        let v = vars(&[("x", 9), ("y", 4)]);
        // x & 15 = 9; y ^ 1 = 5; 9 | 5 = 13
        assert_eq!(eval(&e, &v, &HashMap::new()).unwrap(), 13);
    }

    #[test]
    fn shifts_and_unary() {
        let e = parse("~x << 1").unwrap();
        let v = vars(&[("x", 0)]);
        assert_eq!(eval(&e, &v, &HashMap::new()).unwrap(), -2);
    }

    #[test]
    fn helper_call() {
        let mut helpers = HashMap::new();
        helpers.insert(
            "boardIndex".to_string(),
            HelperDef {
                params: vec!["n".to_string()],
                body: parse("n / 16").unwrap(),
            },
        );
        let e = parse("boardIndex(noteNumber)").unwrap();
        let v = vars(&[("noteNumber", 40)]);
        assert_eq!(eval(&e, &v, &helpers).unwrap(), 2);
    }

    #[test]
    fn detects_self_recursive_helper() {
        let mut helpers = HashMap::new();
        helpers.insert(
            "f".to_string(),
            HelperDef {
                params: vec!["n".to_string()],
                body: parse("f(n)").unwrap(),
            },
        );
        assert!(validate_helpers(&helpers).is_err());
    }

    #[test]
    fn detects_indirect_recursion() {
        let mut helpers = HashMap::new();
        helpers.insert(
            "f".to_string(),
            HelperDef {
                params: vec!["n".to_string()],
                body: parse("g(n)").unwrap(),
            },
        );
        helpers.insert(
            "g".to_string(),
            HelperDef {
                params: vec!["n".to_string()],
                body: parse("f(n)").unwrap(),
            },
        );
        assert!(validate_helpers(&helpers).is_err());
    }

    #[test]
    fn unknown_identifier_errors() {
        let e = parse("z + 1").unwrap();
        assert_eq!(
            eval(&e, &HashMap::new(), &HashMap::new()),
            Err(ExprError::UnknownIdentifier("z".to_string()))
        );
    }

    #[test]
    fn division_by_zero_errors() {
        let e = parse("x / y").unwrap();
        let v = vars(&[("x", 1), ("y", 0)]);
        assert_eq!(eval(&e, &v, &HashMap::new()), Err(ExprError::DivisionByZero));
    }
}
