//! Closed arithmetic expressions in the engine's expression syntax.
//!
//! Position strings from presets (`(w-text_w)/2`, `h-100`, ...) are parsed
//! into [`Expr`] instead of being passed through verbatim, so only a fixed
//! variable set and a handful of functions can ever reach the engine.
//! Timing expressions are built directly as [`Expr`] values and can be
//! evaluated at a concrete playback time.

use std::fmt;
use thiserror::Error;

/// Variables an expression may reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Var {
    /// Frame width.
    W,
    /// Frame height.
    H,
    /// Rendered text width.
    TextW,
    /// Rendered text height.
    TextH,
    /// Playback time in seconds.
    T,
}

impl Var {
    fn name(self) -> &'static str {
        match self {
            Var::W => "w",
            Var::H => "h",
            Var::TextW => "text_w",
            Var::TextH => "text_h",
            Var::T => "t",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "w" | "W" | "main_w" => Some(Var::W),
            "h" | "H" | "main_h" => Some(Var::H),
            "text_w" | "tw" => Some(Var::TextW),
            "text_h" | "th" => Some(Var::TextH),
            "t" => Some(Var::T),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl BinOp {
    fn precedence(self) -> u8 {
        match self {
            BinOp::Add | BinOp::Sub => 1,
            BinOp::Mul | BinOp::Div => 2,
        }
    }

    fn symbol(self) -> char {
        match self {
            BinOp::Add => '+',
            BinOp::Sub => '-',
            BinOp::Mul => '*',
            BinOp::Div => '/',
        }
    }
}

/// Functions understood by both the engine and [`Expr::eval`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Func {
    If,
    Lt,
    Gt,
    Between,
    Min,
    Max,
}

impl Func {
    fn name(self) -> &'static str {
        match self {
            Func::If => "if",
            Func::Lt => "lt",
            Func::Gt => "gt",
            Func::Between => "between",
            Func::Min => "min",
            Func::Max => "max",
        }
    }

    fn arity(self) -> usize {
        match self {
            Func::If | Func::Between => 3,
            Func::Lt | Func::Gt | Func::Min | Func::Max => 2,
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "if" => Some(Func::If),
            "lt" => Some(Func::Lt),
            "gt" => Some(Func::Gt),
            "between" => Some(Func::Between),
            "min" => Some(Func::Min),
            "max" => Some(Func::Max),
            _ => None,
        }
    }
}

/// An arithmetic expression over [`Var`].
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Num(f64),
    Var(Var),
    Neg(Box<Expr>),
    Bin(BinOp, Box<Expr>, Box<Expr>),
    Call(Func, Vec<Expr>),
}

/// Values bound to the variables during evaluation.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Env {
    pub w: f64,
    pub h: f64,
    pub text_w: f64,
    pub text_h: f64,
    pub t: f64,
}

impl Env {
    /// Environment for a frame of the given size at time `t`, with no text
    /// measured.
    pub fn at(w: f64, h: f64, t: f64) -> Self {
        Self {
            w,
            h,
            t,
            ..Self::default()
        }
    }

    fn get(&self, var: Var) -> f64 {
        match var {
            Var::W => self.w,
            Var::H => self.h,
            Var::TextW => self.text_w,
            Var::TextH => self.text_h,
            Var::T => self.t,
        }
    }
}

/// Longest expression source accepted by [`Expr::parse`].
pub const MAX_EXPR_LEN: usize = 4096;

/// Deepest nesting of parentheses, calls and signs accepted by [`Expr::parse`].
pub const MAX_EXPR_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("empty expression")]
    Empty,
    #[error("unexpected character {0:?} at offset {1}")]
    UnexpectedChar(char, usize),
    #[error("unknown identifier {0:?}")]
    UnknownIdent(String),
    #[error("function {name} takes {expected} arguments, got {got}")]
    Arity {
        name: &'static str,
        expected: usize,
        got: usize,
    },
    #[error("unexpected end of expression")]
    UnexpectedEnd,
    #[error("invalid number {0:?}")]
    BadNumber(String),
    #[error("expression is longer than {MAX_EXPR_LEN} bytes")]
    TooLong,
    #[error("expression nests deeper than {MAX_EXPR_DEPTH} levels")]
    TooDeep,
}

impl Expr {
    pub fn num(v: f64) -> Self {
        Expr::Num(v)
    }

    pub fn var(v: Var) -> Self {
        Expr::Var(v)
    }

    pub fn t() -> Self {
        Expr::Var(Var::T)
    }

    pub fn add(a: Expr, b: Expr) -> Self {
        Expr::Bin(BinOp::Add, Box::new(a), Box::new(b))
    }

    pub fn sub(a: Expr, b: Expr) -> Self {
        Expr::Bin(BinOp::Sub, Box::new(a), Box::new(b))
    }

    pub fn mul(a: Expr, b: Expr) -> Self {
        Expr::Bin(BinOp::Mul, Box::new(a), Box::new(b))
    }

    pub fn div(a: Expr, b: Expr) -> Self {
        Expr::Bin(BinOp::Div, Box::new(a), Box::new(b))
    }

    /// `if(cond, then, otherwise)`; nonzero `cond` selects `then`.
    pub fn if_(cond: Expr, then: Expr, otherwise: Expr) -> Self {
        Expr::Call(Func::If, vec![cond, then, otherwise])
    }

    pub fn lt(a: Expr, b: Expr) -> Self {
        Expr::Call(Func::Lt, vec![a, b])
    }

    pub fn min(a: Expr, b: Expr) -> Self {
        Expr::Call(Func::Min, vec![a, b])
    }

    pub fn max(a: Expr, b: Expr) -> Self {
        Expr::Call(Func::Max, vec![a, b])
    }

    /// Parse an expression string, accepting only the closed grammar.
    pub fn parse(input: &str) -> Result<Self, ParseError> {
        if input.len() > MAX_EXPR_LEN {
            return Err(ParseError::TooLong);
        }
        let tokens = tokenize(input)?;
        if tokens.is_empty() {
            return Err(ParseError::Empty);
        }
        let mut parser = Parser {
            tokens,
            pos: 0,
            depth: 0,
        };
        let expr = parser.expr()?;
        match parser.peek() {
            None => Ok(expr),
            Some(tok) => Err(ParseError::UnexpectedChar(tok.as_char(), parser.pos)),
        }
    }

    /// Evaluate with the engine's semantics (comparisons yield 0 or 1).
    pub fn eval(&self, env: &Env) -> f64 {
        match self {
            Expr::Num(v) => *v,
            Expr::Var(v) => env.get(*v),
            Expr::Neg(e) => -e.eval(env),
            Expr::Bin(op, a, b) => {
                let (a, b) = (a.eval(env), b.eval(env));
                match op {
                    BinOp::Add => a + b,
                    BinOp::Sub => a - b,
                    BinOp::Mul => a * b,
                    BinOp::Div => a / b,
                }
            }
            Expr::Call(func, args) => {
                let v: Vec<f64> = args.iter().map(|a| a.eval(env)).collect();
                let truth = |b: bool| if b { 1.0 } else { 0.0 };
                match func {
                    Func::If => {
                        if v[0] != 0.0 {
                            v[1]
                        } else {
                            v[2]
                        }
                    }
                    Func::Lt => truth(v[0] < v[1]),
                    Func::Gt => truth(v[0] > v[1]),
                    Func::Between => truth(v[0] >= v[1] && v[0] <= v[2]),
                    Func::Min => v[0].min(v[1]),
                    Func::Max => v[0].max(v[1]),
                }
            }
        }
    }

    fn is_negative(&self) -> bool {
        matches!(self, Expr::Neg(_)) || matches!(self, Expr::Num(v) if *v < 0.0)
    }

    fn precedence(&self) -> u8 {
        match self {
            Expr::Bin(op, _, _) => op.precedence(),
            Expr::Neg(_) => 3,
            Expr::Num(v) if *v < 0.0 => 3,
            _ => 4,
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Num(v) => write!(f, "{v}"),
            Expr::Var(v) => f.write_str(v.name()),
            Expr::Neg(e) => {
                if e.precedence() < 4 {
                    write!(f, "-({e})")
                } else {
                    write!(f, "-{e}")
                }
            }
            Expr::Bin(op, a, b) => {
                let p = op.precedence();
                if a.precedence() < p {
                    write!(f, "({a})")?;
                } else {
                    write!(f, "{a}")?;
                }
                write!(f, "{}", op.symbol())?;
                if b.precedence() <= p || b.is_negative() {
                    write!(f, "({b})")
                } else {
                    write!(f, "{b}")
                }
            }
            Expr::Call(func, args) => {
                write!(f, "{}(", func.name())?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{arg}")?;
                }
                f.write_str(")")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Ident(String),
    Op(char),
    Open,
    Close,
    Comma,
}

impl Token {
    fn as_char(&self) -> char {
        match self {
            Token::Num(_) => '0',
            Token::Ident(s) => s.chars().next().unwrap_or('?'),
            Token::Op(c) => *c,
            Token::Open => '(',
            Token::Close => ')',
            Token::Comma => ',',
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>, ParseError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' => i += 1,
            '+' | '-' | '*' | '/' => {
                tokens.push(Token::Op(c));
                i += 1;
            }
            '(' => {
                tokens.push(Token::Open);
                i += 1;
            }
            ')' => {
                tokens.push(Token::Close);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            c if c.is_ascii_digit() || c == '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let value = text
                    .parse::<f64>()
                    .map_err(|_| ParseError::BadNumber(text.clone()))?;
                tokens.push(Token::Num(value));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => return Err(ParseError::UnexpectedChar(other, i)),
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Result<Token, ParseError> {
        let tok = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or(ParseError::UnexpectedEnd)?;
        self.pos += 1;
        Ok(tok)
    }

    fn expect(&mut self, want: Token) -> Result<(), ParseError> {
        let tok = self.next()?;
        if tok == want {
            Ok(())
        } else {
            Err(ParseError::UnexpectedChar(tok.as_char(), self.pos - 1))
        }
    }

    fn expr(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.term()?;
        while let Some(Token::Op(c @ ('+' | '-'))) = self.peek() {
            let op = if *c == '+' { BinOp::Add } else { BinOp::Sub };
            self.pos += 1;
            let rhs = self.term()?;
            lhs = Expr::Bin(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn term(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.unary()?;
        while let Some(Token::Op(c @ ('*' | '/'))) = self.peek() {
            let op = if *c == '*' { BinOp::Mul } else { BinOp::Div };
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = Expr::Bin(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    /// Every nested parse passes through here, so this is where depth is counted.
    fn unary(&mut self) -> Result<Expr, ParseError> {
        self.depth += 1;
        if self.depth > MAX_EXPR_DEPTH {
            return Err(ParseError::TooDeep);
        }
        let parsed = match self.peek() {
            Some(Token::Op('-')) => {
                self.pos += 1;
                self.unary().map(|e| Expr::Neg(Box::new(e)))
            }
            Some(Token::Op('+')) => {
                self.pos += 1;
                self.unary()
            }
            _ => self.atom(),
        };
        self.depth -= 1;
        parsed
    }

    fn atom(&mut self) -> Result<Expr, ParseError> {
        match self.next()? {
            Token::Num(v) => Ok(Expr::Num(v)),
            Token::Open => {
                let inner = self.expr()?;
                self.expect(Token::Close)?;
                Ok(inner)
            }
            Token::Ident(name) => {
                if let Some(var) = Var::from_name(&name) {
                    return Ok(Expr::Var(var));
                }
                let func = Func::from_name(&name).ok_or(ParseError::UnknownIdent(name))?;
                self.expect(Token::Open)?;
                let mut args = vec![self.expr()?];
                while let Some(Token::Comma) = self.peek() {
                    self.pos += 1;
                    args.push(self.expr()?);
                }
                self.expect(Token::Close)?;
                if args.len() != func.arity() {
                    return Err(ParseError::Arity {
                        name: func.name(),
                        expected: func.arity(),
                        got: args.len(),
                    });
                }
                Ok(Expr::Call(func, args))
            }
            other => Err(ParseError::UnexpectedChar(other.as_char(), self.pos - 1)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_prints_preset_positions() {
        for src in ["(w-text_w)/2", "h-100", "50", "(h-text_h)/2", "w-text_w-10"] {
            let expr = Expr::parse(src).unwrap();
            assert_eq!(expr.to_string(), src);
        }
    }

    #[test]
    fn evaluates_center() {
        let expr = Expr::parse("(w-text_w)/2").unwrap();
        let env = Env {
            w: 1920.0,
            text_w: 200.0,
            ..Env::default()
        };
        assert_eq!(expr.eval(&env), 860.0);
    }

    #[test]
    fn rejects_unknown_identifiers_and_junk() {
        assert_eq!(
            Expr::parse("__import__(1)"),
            Err(ParseError::UnknownIdent("__import__".into()))
        );
        assert!(matches!(
            Expr::parse("h-100;drop"),
            Err(ParseError::UnexpectedChar(';', _))
        ));
        assert_eq!(Expr::parse("  "), Err(ParseError::Empty));
        assert!(matches!(Expr::parse("lt(t)"), Err(ParseError::Arity { .. })));
        assert_eq!(Expr::parse("(w"), Err(ParseError::UnexpectedEnd));
    }

    #[test]
    fn bounds_nesting_and_length() {
        let nested = format!("{}1{}", "(".repeat(20_000), ")".repeat(20_000));
        assert_eq!(Expr::parse(&nested), Err(ParseError::TooLong));
        let signs = format!("{}1", "-".repeat(MAX_EXPR_LEN - 1));
        assert_eq!(Expr::parse(&signs), Err(ParseError::TooDeep));
        let calls = format!("{}1{}", "max(0,".repeat(100), ")".repeat(100));
        assert_eq!(Expr::parse(&calls), Err(ParseError::TooDeep));

        let shallow = format!("{}h{}", "(".repeat(30), ")".repeat(30));
        assert_eq!(Expr::parse(&shallow).unwrap().to_string(), "h");
        let flat = vec!["1"; 1000].join("+");
        assert_eq!(Expr::parse(&flat).unwrap().eval(&Env::default()), 1000.0);
    }

    #[test]
    fn keeps_right_operand_grouping() {
        let expr = Expr::sub(Expr::var(Var::H), Expr::sub(Expr::num(10.0), Expr::t()));
        assert_eq!(expr.to_string(), "h-(10-t)");
        assert_eq!(Expr::parse("h-(10-t)").unwrap(), expr);
        let neg = Expr::sub(Expr::t(), Expr::num(-2.0));
        assert_eq!(neg.to_string(), "t-(-2)");
    }

    #[test]
    fn conditionals_follow_engine_semantics() {
        let expr = Expr::parse("if(lt(t,1),0,between(t,2,3))").unwrap();
        assert_eq!(expr.eval(&Env::at(0.0, 0.0, 0.5)), 0.0);
        assert_eq!(expr.eval(&Env::at(0.0, 0.0, 2.5)), 1.0);
        assert_eq!(expr.eval(&Env::at(0.0, 0.0, 4.0)), 0.0);
    }
}
