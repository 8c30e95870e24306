// Copyright (c) 2024-present, tarmac-index
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The tiny expression language used by address and seek prompts.
//!
//! Integer constants (decimal or `0x` hex), `+ - *`, `<< >>`, unary
//! signs, parentheses, and identifiers. `reg::name` and `sym::name` force
//! a scope; a bare identifier tries registers first, then symbols.
//! Registers are resolved to ids at parse time but read at evaluation
//! time, so one parsed expression can be evaluated at many trace
//! positions.

use crate::registers::RegisterId;
use std::fmt;

/// Failure while evaluating an otherwise well-formed expression.
#[derive(Clone, Debug)]
pub struct EvaluationError {
    pub msg: String,
}

impl EvaluationError {
    #[must_use]
    pub fn new(msg: &str) -> Self {
        Self {
            msg: msg.to_string(),
        }
    }
}

impl fmt::Display for EvaluationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "evaluation error: {}", self.msg)
    }
}

impl std::error::Error for EvaluationError {}

/// Name resolution at parse time.
pub trait ParseContext {
    fn lookup_register(&self, name: &str) -> Option<RegisterId>;
    fn lookup_symbol(&self, name: &str) -> Option<u64>;
}

/// A context that resolves nothing; constants still parse.
#[derive(Clone, Copy, Debug, Default)]
pub struct TrivialContext;

impl ParseContext for TrivialContext {
    fn lookup_register(&self, _name: &str) -> Option<RegisterId> {
        None
    }

    fn lookup_symbol(&self, _name: &str) -> Option<u64> {
        None
    }
}

/// Value lookup at evaluation time.
pub trait ExecutionContext {
    fn register_value(&self, reg: &RegisterId) -> Result<u64, EvaluationError>;
}

impl ExecutionContext for TrivialContext {
    fn register_value(&self, _reg: &RegisterId) -> Result<u64, EvaluationError> {
        Err(EvaluationError::new("no registers available here"))
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Shl,
    Shr,
}

/// A parsed expression.
#[derive(Clone, Debug)]
pub enum Expr {
    Constant(u64),
    Register(RegisterId, String),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Neg(Box<Expr>),
}

impl Expr {
    /// Evaluates against `ec`. Arithmetic wraps at 64 bits; shifts of 64
    /// or more produce 0.
    pub fn evaluate(&self, ec: &dyn ExecutionContext) -> Result<u64, EvaluationError> {
        match self {
            Self::Constant(v) => Ok(*v),
            Self::Register(reg, name) => ec
                .register_value(reg)
                .map_err(|e| EvaluationError::new(&format!("register '{name}': {}", e.msg))),
            Self::Binary(op, lhs, rhs) => {
                let l = lhs.evaluate(ec)?;
                let r = rhs.evaluate(ec)?;
                Ok(match op {
                    BinaryOp::Add => l.wrapping_add(r),
                    BinaryOp::Sub => l.wrapping_sub(r),
                    BinaryOp::Mul => l.wrapping_mul(r),
                    BinaryOp::Shl => {
                        if r >= 64 {
                            0
                        } else {
                            l << r
                        }
                    }
                    BinaryOp::Shr => {
                        if r >= 64 {
                            0
                        } else {
                            l >> r
                        }
                    }
                })
            }
            Self::Neg(e) => Ok(e.evaluate(ec)?.wrapping_neg()),
        }
    }

    /// True if no register reference appears anywhere in the tree.
    #[must_use]
    pub fn is_constant(&self) -> bool {
        match self {
            Self::Constant(_) => true,
            Self::Register(..) => false,
            Self::Binary(_, lhs, rhs) => lhs.is_constant() && rhs.is_constant(),
            Self::Neg(e) => e.is_constant(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Atom(u64),
    Id(String),
    Plus,
    Minus,
    Star,
    LParen,
    RParen,
    LeftShift,
    RightShift,
    Scope,
    Bad,
    Eof,
}

struct Lexer<'a> {
    rest: &'a str,
    token: Token,
}

impl<'a> Lexer<'a> {
    fn new(input: &'a str) -> Self {
        let mut lexer = Self {
            rest: input,
            token: Token::Eof,
        };
        lexer.advance();
        lexer
    }

    fn advance(&mut self) {
        self.rest = self.rest.trim_start_matches([' ', '\t', '\n']);
        let bytes = self.rest.as_bytes();

        if bytes.is_empty() {
            self.token = Token::Eof;
            return;
        }

        if bytes[0] == b'0' && bytes.len() > 1 && (bytes[1] == b'x' || bytes[1] == b'X') {
            let body = &self.rest[2..];
            let len = body
                .bytes()
                .take_while(|b| b.is_ascii_hexdigit())
                .count();
            self.token = Token::Atom(u64::from_str_radix(&body[..len], 16).unwrap_or(0));
            self.rest = &body[len..];
            return;
        }

        if bytes[0].is_ascii_digit() {
            let len = self
                .rest
                .bytes()
                .take_while(|b| b.is_ascii_digit())
                .count();
            self.token = Token::Atom(self.rest[..len].parse().unwrap_or(0));
            self.rest = &self.rest[len..];
            return;
        }

        if bytes[0].is_ascii_alphabetic() || bytes[0] == b'_' || bytes[0] == b'$' {
            let len = self
                .rest
                .bytes()
                .take_while(|b| b.is_ascii_alphanumeric() || *b == b'_' || *b == b'$')
                .count();
            self.token = Token::Id(self.rest[..len].to_string());
            self.rest = &self.rest[len..];
            return;
        }

        for (prefix, token) in [
            ("<<", Token::LeftShift),
            (">>", Token::RightShift),
            ("::", Token::Scope),
        ] {
            if let Some(rest) = self.rest.strip_prefix(prefix) {
                self.token = token;
                self.rest = rest;
                return;
            }
        }

        self.token = match bytes[0] {
            b'+' => Token::Plus,
            b'-' => Token::Minus,
            b'*' => Token::Star,
            b'(' => Token::LParen,
            b')' => Token::RParen,
            _ => Token::Bad,
        };
        self.rest = &self.rest[1..];
    }
}

/// A syntax (or name-resolution) failure at parse time.
#[derive(Clone, Debug)]
pub struct ExprParseError {
    pub msg: String,
}

impl fmt::Display for ExprParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.msg)
    }
}

impl std::error::Error for ExprParseError {}

fn err(msg: impl Into<String>) -> ExprParseError {
    ExprParseError { msg: msg.into() }
}

struct Parser<'a, 'c> {
    lexer: Lexer<'a>,
    pc: &'c dyn ParseContext,
}

impl Parser<'_, '_> {
    fn parse_register_name(&self, name: &str) -> Option<Expr> {
        self.pc
            .lookup_register(name)
            .map(|reg| Expr::Register(reg, name.to_string()))
    }

    fn parse_symbol_name(&self, name: &str) -> Option<Expr> {
        self.pc.lookup_symbol(name).map(Expr::Constant)
    }

    fn parse_unary(&mut self) -> Result<Expr, ExprParseError> {
        while self.lexer.token == Token::Plus {
            self.lexer.advance();
        }

        match self.lexer.token.clone() {
            Token::Atom(v) => {
                self.lexer.advance();
                Ok(Expr::Constant(v))
            }
            Token::Id(id1) => {
                self.lexer.advance();
                if self.lexer.token == Token::Scope {
                    self.lexer.advance();
                    let Token::Id(id2) = self.lexer.token.clone() else {
                        return Err(err("expected an identifier after '::'"));
                    };
                    let expr = match id1.as_str() {
                        "reg" => self
                            .parse_register_name(&id2)
                            .ok_or_else(|| err(format!("unrecognised register name '{id2}'")))?,
                        "sym" => self
                            .parse_symbol_name(&id2)
                            .ok_or_else(|| err(format!("unrecognised symbol name '{id2}'")))?,
                        _ => return Err(err(format!("unrecognised identifier scope '{id1}'"))),
                    };
                    self.lexer.advance();
                    Ok(expr)
                } else {
                    self.parse_register_name(&id1)
                        .or_else(|| self.parse_symbol_name(&id1))
                        .ok_or_else(|| err(format!("unrecognised identifier name '{id1}'")))
                }
            }
            Token::LParen => {
                self.lexer.advance();
                let expr = self.parse_expr()?;
                if self.lexer.token != Token::RParen {
                    return Err(err("expected closing ')'"));
                }
                self.lexer.advance();
                Ok(expr)
            }
            Token::Minus => {
                self.lexer.advance();
                Ok(Expr::Neg(Box::new(self.parse_unary()?)))
            }
            Token::Eof => Err(err("unexpected end of expression")),
            _ => Err(err("unexpected token")),
        }
    }

    fn parse_mul(&mut self) -> Result<Expr, ExprParseError> {
        let mut expr = self.parse_unary()?;
        while self.lexer.token == Token::Star {
            self.lexer.advance();
            expr = Expr::Binary(BinaryOp::Mul, Box::new(expr), Box::new(self.parse_unary()?));
        }
        Ok(expr)
    }

    fn parse_add(&mut self) -> Result<Expr, ExprParseError> {
        let mut expr = self.parse_mul()?;
        loop {
            let op = match self.lexer.token {
                Token::Plus => BinaryOp::Add,
                Token::Minus => BinaryOp::Sub,
                _ => break,
            };
            self.lexer.advance();
            expr = Expr::Binary(op, Box::new(expr), Box::new(self.parse_mul()?));
        }
        Ok(expr)
    }

    fn parse_expr(&mut self) -> Result<Expr, ExprParseError> {
        let mut expr = self.parse_add()?;
        loop {
            let op = match self.lexer.token {
                Token::LeftShift => BinaryOp::Shl,
                Token::RightShift => BinaryOp::Shr,
                _ => break,
            };
            self.lexer.advance();
            expr = Expr::Binary(op, Box::new(expr), Box::new(self.parse_add()?));
        }
        Ok(expr)
    }
}

/// Parses a complete expression; trailing tokens are an error.
pub fn parse_expression(
    input: &str,
    pc: &dyn ParseContext,
) -> Result<Expr, ExprParseError> {
    let mut parser = Parser {
        lexer: Lexer::new(input),
        pc,
    };
    let expr = parser.parse_expr()?;
    if parser.lexer.token != Token::Eof {
        return Err(err("unexpected tokens after expression"));
    }
    Ok(expr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::{lookup_reg_name, REG_32_R0};

    struct TestContext;

    impl ParseContext for TestContext {
        fn lookup_register(&self, name: &str) -> Option<RegisterId> {
            lookup_reg_name(name)
        }

        fn lookup_symbol(&self, name: &str) -> Option<u64> {
            match name {
                "main" => Some(0x8000),
                "r0" => Some(0xbad), // shadowed by the register
                _ => None,
            }
        }
    }

    impl ExecutionContext for TestContext {
        fn register_value(&self, reg: &RegisterId) -> Result<u64, EvaluationError> {
            if *reg == REG_32_R0 {
                Ok(42)
            } else {
                Err(EvaluationError::new("undefined register"))
            }
        }
    }

    fn eval(input: &str) -> u64 {
        parse_expression(input, &TestContext)
            .unwrap()
            .evaluate(&TestContext)
            .unwrap()
    }

    #[test]
    fn constants_and_precedence() {
        assert_eq!(7, eval("7"));
        assert_eq!(0x1234, eval("0x1234"));
        assert_eq!(14, eval("2 + 3 * 4"));
        assert_eq!(20, eval("(2 + 3) * 4"));
        assert_eq!(1, eval("3 - 2"));
        assert_eq!(0u64.wrapping_sub(5), eval("-5"));
        assert_eq!(5, eval("+5"));
    }

    #[test]
    fn shifts_bind_loosest_and_saturate() {
        assert_eq!(48, eval("1 + 2 << 4"));
        assert_eq!(4, eval("1 << 3 >> 1"));
        assert_eq!(0, eval("1 << 64"));
        assert_eq!(0, eval("0xffff >> 100"));
    }

    #[test]
    fn scoped_and_bare_identifiers() {
        assert_eq!(42, eval("reg::r0"));
        assert_eq!(0x8000, eval("sym::main"));
        assert_eq!(0x8004, eval("main + 4"));
        // A bare name resolvable both ways prefers the register.
        assert_eq!(42, eval("r0"));
    }

    #[test]
    fn parse_errors() {
        assert!(parse_expression("1 +", &TestContext).is_err());
        assert!(parse_expression("nosuch", &TestContext).is_err());
        assert!(parse_expression("reg::nosuch", &TestContext).is_err());
        assert!(parse_expression("bogus::x", &TestContext).is_err());
        assert!(parse_expression("(1", &TestContext).is_err());
        assert!(parse_expression("1 2", &TestContext).is_err());
    }

    #[test]
    fn constness() {
        let c = parse_expression("1 + 2 * 3", &TestContext).unwrap();
        assert!(c.is_constant());
        let r = parse_expression("r0 + 1", &TestContext).unwrap();
        assert!(!r.is_constant());
    }

    #[test]
    fn register_evaluation_failure_is_reported() {
        let e = parse_expression("r1", &TestContext).unwrap();
        assert!(e.evaluate(&TestContext).is_err());
    }
}
