// The expression module implements the three tiny sub-languages embedded in
// goal definitions:
//
// - conditions:         `variable_name == "points" and key in ("a", "b")`
// - value expressions:  `level * 100`
// - template strings:   reward/property values rendered with a `level` param
//
// All three share one grammar (literals, parameters, arithmetic, comparisons,
// boolean connectives, `in`) and one tree-walking evaluator over `ExprValue`.
// There is no I/O, no loops and no attribute access: a program can only read
// the parameters it was given.

use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

// ============================================================================
// VALUES & ERRORS
// ============================================================================

/// Runtime value of an expression: the sum type the evaluator works over.
#[derive(Debug, Clone, PartialEq)]
pub enum ExprValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    /// Tuple literal, only meaningful as the right-hand side of `in`.
    List(Vec<ExprValue>),
}

impl ExprValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            ExprValue::Int(i) => Some(*i as f64),
            ExprValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            ExprValue::Int(_) => "int",
            ExprValue::Float(_) => "float",
            ExprValue::Bool(_) => "bool",
            ExprValue::Str(_) => "string",
            ExprValue::List(_) => "list",
        }
    }
}

impl fmt::Display for ExprValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExprValue::Int(i) => write!(f, "{}", i),
            ExprValue::Float(v) => write!(f, "{}", v),
            ExprValue::Bool(b) => write!(f, "{}", b),
            ExprValue::Str(s) => write!(f, "{}", s),
            ExprValue::List(items) => {
                let parts: Vec<String> = items.iter().map(|i| i.to_string()).collect();
                write!(f, "({})", parts.join(", "))
            }
        }
    }
}

/// Parameter environment: name -> value bindings supplied by the caller.
pub type Params = HashMap<String, ExprValue>;

#[derive(Debug, Error)]
pub enum ExpressionError {
    #[error("Syntax error in expression: {0}")]
    Syntax(String),

    #[error("Unbound name in expression: {0}")]
    UnboundName(String),

    #[error("Type error in expression: {0}")]
    Type(String),
}

// ============================================================================
// AST & LEXER
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(ExprValue),
    Name(String),
    List(Vec<Expr>),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),
    And,
    Or,
    Not,
    In,
    True,
    False,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
}

fn lex(src: &str) -> Result<Vec<Token>, ExpressionError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = src.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\r' | '\n' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
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
            '=' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::EqEq);
                    i += 2;
                } else {
                    return Err(ExpressionError::Syntax(
                        "single '=' is not a valid operator, use '=='".to_string(),
                    ));
                }
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::NotEq);
                    i += 2;
                } else {
                    return Err(ExpressionError::Syntax("unexpected '!'".to_string()));
                }
            }
            '<' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Le);
                    i += 2;
                } else {
                    tokens.push(Token::Lt);
                    i += 1;
                }
            }
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Ge);
                    i += 2;
                } else {
                    tokens.push(Token::Gt);
                    i += 1;
                }
            }
            // Both quote flavors are accepted, matching how conditions are
            // written in goal catalogs.
            '"' | '\'' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(&ch) => {
                            s.push(ch);
                            i += 1;
                        }
                        None => {
                            return Err(ExpressionError::Syntax(
                                "unterminated string literal".to_string(),
                            ))
                        }
                    }
                }
                tokens.push(Token::Str(s));
            }
            '0'..='9' => {
                let start = i;
                let mut is_float = false;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    if chars[i] == '.' {
                        if is_float {
                            return Err(ExpressionError::Syntax(
                                "malformed number literal".to_string(),
                            ));
                        }
                        is_float = true;
                    }
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                if is_float {
                    let f: f64 = text
                        .parse()
                        .map_err(|_| ExpressionError::Syntax(format!("bad float '{}'", text)))?;
                    tokens.push(Token::Float(f));
                } else {
                    let n: i64 = text
                        .parse()
                        .map_err(|_| ExpressionError::Syntax(format!("bad integer '{}'", text)))?;
                    tokens.push(Token::Int(n));
                }
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "in" => Token::In,
                    "true" | "True" => Token::True,
                    "false" | "False" => Token::False,
                    _ => Token::Ident(word),
                });
            }
            other => {
                return Err(ExpressionError::Syntax(format!(
                    "unexpected character '{}'",
                    other
                )))
            }
        }
    }

    Ok(tokens)
}

// ============================================================================
// PARSER
// ============================================================================
// A small Pratt parser. Binding powers, loosest first:
//   or < and < not < comparisons/in < additive < multiplicative < unary minus

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn expect(&mut self, expected: &Token) -> Result<(), ExpressionError> {
        match self.next() {
            Some(ref t) if t == expected => Ok(()),
            other => Err(ExpressionError::Syntax(format!(
                "expected {:?}, found {:?}",
                expected, other
            ))),
        }
    }

    fn parse_expr(&mut self, min_bp: u8) -> Result<Expr, ExpressionError> {
        let mut lhs = self.parse_prefix()?;

        loop {
            let (op, bp) = match self.peek() {
                Some(Token::Or) => (BinaryOp::Or, 1),
                Some(Token::And) => (BinaryOp::And, 2),
                Some(Token::EqEq) => (BinaryOp::Eq, 4),
                Some(Token::NotEq) => (BinaryOp::Ne, 4),
                Some(Token::Lt) => (BinaryOp::Lt, 4),
                Some(Token::Le) => (BinaryOp::Le, 4),
                Some(Token::Gt) => (BinaryOp::Gt, 4),
                Some(Token::Ge) => (BinaryOp::Ge, 4),
                Some(Token::In) => (BinaryOp::In, 4),
                Some(Token::Not) => {
                    // `not` in infix position is only valid as `not in`
                    if self.tokens.get(self.pos + 1) == Some(&Token::In) {
                        (BinaryOp::NotIn, 4)
                    } else {
                        return Err(ExpressionError::Syntax(
                            "'not' is not an infix operator".to_string(),
                        ));
                    }
                }
                Some(Token::Plus) => (BinaryOp::Add, 5),
                Some(Token::Minus) => (BinaryOp::Sub, 5),
                Some(Token::Star) => (BinaryOp::Mul, 6),
                Some(Token::Slash) => (BinaryOp::Div, 6),
                Some(Token::Percent) => (BinaryOp::Rem, 6),
                _ => break,
            };

            if bp < min_bp {
                break;
            }

            self.next();
            if op == BinaryOp::NotIn {
                self.next(); // consume the `in` after `not`
            }
            let rhs = self.parse_expr(bp + 1)?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }

        Ok(lhs)
    }

    fn parse_prefix(&mut self) -> Result<Expr, ExpressionError> {
        match self.next() {
            Some(Token::Int(i)) => Ok(Expr::Literal(ExprValue::Int(i))),
            Some(Token::Float(f)) => Ok(Expr::Literal(ExprValue::Float(f))),
            Some(Token::Str(s)) => Ok(Expr::Literal(ExprValue::Str(s))),
            Some(Token::True) => Ok(Expr::Literal(ExprValue::Bool(true))),
            Some(Token::False) => Ok(Expr::Literal(ExprValue::Bool(false))),
            Some(Token::Ident(name)) => Ok(Expr::Name(name)),
            Some(Token::Minus) => {
                let inner = self.parse_expr(7)?;
                Ok(Expr::Unary(UnaryOp::Neg, Box::new(inner)))
            }
            Some(Token::Not) => {
                let inner = self.parse_expr(3)?;
                Ok(Expr::Unary(UnaryOp::Not, Box::new(inner)))
            }
            Some(Token::LParen) => {
                let first = self.parse_expr(0)?;
                if self.peek() == Some(&Token::Comma) {
                    // tuple literal: ("a", "b", ...)
                    let mut items = vec![first];
                    while self.peek() == Some(&Token::Comma) {
                        self.next();
                        if self.peek() == Some(&Token::RParen) {
                            break; // trailing comma
                        }
                        items.push(self.parse_expr(0)?);
                    }
                    self.expect(&Token::RParen)?;
                    Ok(Expr::List(items))
                } else {
                    self.expect(&Token::RParen)?;
                    Ok(first)
                }
            }
            Some(Token::LBracket) => {
                let mut items = Vec::new();
                if self.peek() != Some(&Token::RBracket) {
                    items.push(self.parse_expr(0)?);
                    while self.peek() == Some(&Token::Comma) {
                        self.next();
                        if self.peek() == Some(&Token::RBracket) {
                            break;
                        }
                        items.push(self.parse_expr(0)?);
                    }
                }
                self.expect(&Token::RBracket)?;
                Ok(Expr::List(items))
            }
            other => Err(ExpressionError::Syntax(format!(
                "unexpected token {:?}",
                other
            ))),
        }
    }
}

/// A parsed expression. Parsing once and evaluating per row keeps the
/// progress fold cheap.
#[derive(Debug, Clone)]
pub struct Expression {
    root: Expr,
}

impl Expression {
    pub fn parse(src: &str) -> Result<Self, ExpressionError> {
        let tokens = lex(src)?;
        if tokens.is_empty() {
            return Err(ExpressionError::Syntax("empty expression".to_string()));
        }
        let mut parser = Parser { tokens, pos: 0 };
        let root = parser.parse_expr(0)?;
        if parser.pos != parser.tokens.len() {
            return Err(ExpressionError::Syntax(format!(
                "trailing tokens after expression: {:?}",
                &parser.tokens[parser.pos..]
            )));
        }
        Ok(Expression { root })
    }

    pub fn evaluate(&self, params: &Params) -> Result<ExprValue, ExpressionError> {
        eval(&self.root, params)
    }

    /// All string literals appearing in the expression, in source order.
    ///
    /// Conditions reference variables as quoted names compared against the
    /// `variable_name` column, so the literal set is exactly the candidate
    /// set for the variable->rules reverse index.
    pub fn string_literals(&self) -> Vec<String> {
        let mut out = Vec::new();
        collect_strings(&self.root, &mut out);
        out
    }
}

fn collect_strings(expr: &Expr, out: &mut Vec<String>) {
    match expr {
        Expr::Literal(ExprValue::Str(s)) => {
            if !out.contains(s) {
                out.push(s.clone());
            }
        }
        Expr::Literal(_) | Expr::Name(_) => {}
        Expr::List(items) => {
            for item in items {
                collect_strings(item, out);
            }
        }
        Expr::Unary(_, inner) => collect_strings(inner, out),
        Expr::Binary(_, lhs, rhs) => {
            collect_strings(lhs, out);
            collect_strings(rhs, out);
        }
    }
}

// ============================================================================
// EVALUATOR
// ============================================================================

fn eval(expr: &Expr, params: &Params) -> Result<ExprValue, ExpressionError> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Name(name) => params
            .get(name)
            .cloned()
            .ok_or_else(|| ExpressionError::UnboundName(name.clone())),
        Expr::List(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(eval(item, params)?);
            }
            Ok(ExprValue::List(out))
        }
        Expr::Unary(op, inner) => {
            let v = eval(inner, params)?;
            match (op, v) {
                (UnaryOp::Neg, ExprValue::Int(i)) => Ok(ExprValue::Int(-i)),
                (UnaryOp::Neg, ExprValue::Float(f)) => Ok(ExprValue::Float(-f)),
                (UnaryOp::Not, ExprValue::Bool(b)) => Ok(ExprValue::Bool(!b)),
                (op, v) => Err(ExpressionError::Type(format!(
                    "cannot apply {:?} to {}",
                    op,
                    v.type_name()
                ))),
            }
        }
        Expr::Binary(op, lhs, rhs) => {
            // `and`/`or` short-circuit; everything else is strict.
            match op {
                BinaryOp::And => {
                    return match eval(lhs, params)? {
                        ExprValue::Bool(false) => Ok(ExprValue::Bool(false)),
                        ExprValue::Bool(true) => expect_bool(eval(rhs, params)?),
                        v => type_err("and", &v),
                    };
                }
                BinaryOp::Or => {
                    return match eval(lhs, params)? {
                        ExprValue::Bool(true) => Ok(ExprValue::Bool(true)),
                        ExprValue::Bool(false) => expect_bool(eval(rhs, params)?),
                        v => type_err("or", &v),
                    };
                }
                _ => {}
            }

            let l = eval(lhs, params)?;
            let r = eval(rhs, params)?;
            apply_binary(*op, l, r)
        }
    }
}

fn expect_bool(v: ExprValue) -> Result<ExprValue, ExpressionError> {
    match v {
        ExprValue::Bool(_) => Ok(v),
        other => type_err("boolean connective", &other),
    }
}

fn type_err(op: &str, v: &ExprValue) -> Result<ExprValue, ExpressionError> {
    Err(ExpressionError::Type(format!(
        "{} requires booleans, got {}",
        op,
        v.type_name()
    )))
}

fn apply_binary(op: BinaryOp, l: ExprValue, r: ExprValue) -> Result<ExprValue, ExpressionError> {
    use BinaryOp::*;
    use ExprValue::*;

    match op {
        Add => match (l, r) {
            (Int(a), Int(b)) => Ok(Int(a + b)),
            // a string on either side concatenates; numbers render via
            // Display so templates can interpolate thresholds and levels
            (Str(a), b) if !matches!(b, List(_)) => Ok(Str(format!("{}{}", a, b))),
            (a, Str(b)) if !matches!(a, List(_)) => Ok(Str(format!("{}{}", a, b))),
            (a, b) => numeric_op(a, b, "+", |x, y| x + y),
        },
        Sub => match (l, r) {
            (Int(a), Int(b)) => Ok(Int(a - b)),
            (a, b) => numeric_op(a, b, "-", |x, y| x - y),
        },
        Mul => match (l, r) {
            (Int(a), Int(b)) => Ok(Int(a * b)),
            (a, b) => numeric_op(a, b, "*", |x, y| x * y),
        },
        Div => {
            // division always yields a float; division by zero is a type error
            let a = l
                .as_number()
                .ok_or_else(|| ExpressionError::Type(format!("'/' on {}", l.type_name())))?;
            let b = r
                .as_number()
                .ok_or_else(|| ExpressionError::Type(format!("'/' on {}", r.type_name())))?;
            if b == 0.0 {
                return Err(ExpressionError::Type("division by zero".to_string()));
            }
            Ok(Float(a / b))
        }
        Rem => match (l, r) {
            (Int(a), Int(b)) => {
                if b == 0 {
                    Err(ExpressionError::Type("modulo by zero".to_string()))
                } else {
                    Ok(Int(a % b))
                }
            }
            (a, b) => numeric_op(a, b, "%", |x, y| x % y),
        },
        Eq => Ok(Bool(values_equal(&l, &r))),
        Ne => Ok(Bool(!values_equal(&l, &r))),
        Lt | Le | Gt | Ge => {
            let ord = compare(&l, &r)?;
            Ok(Bool(match op {
                Lt => ord == std::cmp::Ordering::Less,
                Le => ord != std::cmp::Ordering::Greater,
                Gt => ord == std::cmp::Ordering::Greater,
                Ge => ord != std::cmp::Ordering::Less,
                _ => unreachable!(),
            }))
        }
        In | NotIn => {
            let items = match r {
                List(items) => items,
                other => {
                    return Err(ExpressionError::Type(format!(
                        "'in' requires a list on the right, got {}",
                        other.type_name()
                    )))
                }
            };
            let found = items.iter().any(|item| values_equal(&l, item));
            Ok(Bool(if op == In { found } else { !found }))
        }
        And | Or => unreachable!("handled before operand evaluation"),
    }
}

fn numeric_op(
    l: ExprValue,
    r: ExprValue,
    op: &str,
    f: impl Fn(f64, f64) -> f64,
) -> Result<ExprValue, ExpressionError> {
    match (l.as_number(), r.as_number()) {
        (Some(a), Some(b)) => Ok(ExprValue::Float(f(a, b))),
        _ => Err(ExpressionError::Type(format!(
            "'{}' requires numbers, got {} and {}",
            op,
            l.type_name(),
            r.type_name()
        ))),
    }
}

fn values_equal(l: &ExprValue, r: &ExprValue) -> bool {
    match (l.as_number(), r.as_number()) {
        (Some(a), Some(b)) => a == b,
        _ => l == r,
    }
}

fn compare(l: &ExprValue, r: &ExprValue) -> Result<std::cmp::Ordering, ExpressionError> {
    match (l, r) {
        (ExprValue::Str(a), ExprValue::Str(b)) => Ok(a.cmp(b)),
        _ => match (l.as_number(), r.as_number()) {
            (Some(a), Some(b)) => a
                .partial_cmp(&b)
                .ok_or_else(|| ExpressionError::Type("incomparable numbers".to_string())),
            _ => Err(ExpressionError::Type(format!(
                "cannot compare {} and {}",
                l.type_name(),
                r.type_name()
            ))),
        },
    }
}

// ============================================================================
// PUBLIC ENTRY POINTS
// ============================================================================

/// Evaluate a boolean condition against the given parameters.
pub fn evaluate_condition(src: &str, params: &Params) -> Result<bool, ExpressionError> {
    match Expression::parse(src)?.evaluate(params)? {
        ExprValue::Bool(b) => Ok(b),
        other => Err(ExpressionError::Type(format!(
            "condition evaluated to {}, expected bool",
            other.type_name()
        ))),
    }
}

/// Evaluate a numeric value expression (e.g. a goal threshold over `level`).
///
/// A `None` source yields `None`, mirroring nullable goal columns.
pub fn evaluate_value_expression(
    src: Option<&str>,
    params: &Params,
) -> Result<Option<f64>, ExpressionError> {
    let src = match src {
        Some(s) if !s.trim().is_empty() => s,
        _ => return Ok(None),
    };
    match Expression::parse(src)?.evaluate(params)? {
        ExprValue::Int(i) => Ok(Some(i as f64)),
        ExprValue::Float(f) => Ok(Some(f)),
        other => Err(ExpressionError::Type(format!(
            "value expression evaluated to {}, expected number",
            other.type_name()
        ))),
    }
}

/// Evaluate a template and render the result as a string.
pub fn evaluate_string(src: &str, params: &Params) -> Result<String, ExpressionError> {
    Ok(Expression::parse(src)?.evaluate(params)?.to_string())
}

/// Build the single-parameter environment used for per-level rendering.
pub fn level_params(level: i32) -> Params {
    let mut params = Params::new();
    params.insert("level".to_string(), ExprValue::Int(level as i64));
    params
}
