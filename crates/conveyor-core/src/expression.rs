//! Allow-listed condition expression interpreter
//!
//! Gateways and edge conditions evaluate a deliberately small grammar:
//! literals, variable references, arithmetic, comparison, and boolean
//! operators. Function calls, attribute access, indexing, and assignment do
//! not exist in the grammar at all, so they cannot be smuggled in. The
//! evaluator works against a flat scope of JSON values; dotted names fall
//! back to path traversal into a root variable.

use crate::EngineError;
use serde_json::Value;
use std::collections::HashMap;

/// Token produced by the lexer
#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    True,
    False,
    Null,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
    Not,
    LParen,
    RParen,
}

/// Parsed expression tree
#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Variable(String),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
}

fn lex(input: &str) -> Result<Vec<Token>, EngineError> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\r' | '\n' => {
                chars.next();
            }
            '0'..='9' | '.' => {
                let mut text = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() || d == '.' {
                        text.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let number = text.parse::<f64>().map_err(|_| {
                    EngineError::Expression(format!("Invalid number literal '{}'", text))
                })?;
                tokens.push(Token::Number(number));
            }
            '\'' | '"' => {
                let quote = c;
                chars.next();
                let mut text = String::new();
                let mut closed = false;
                for d in chars.by_ref() {
                    if d == quote {
                        closed = true;
                        break;
                    }
                    text.push(d);
                }
                if !closed {
                    return Err(EngineError::Expression(
                        "Unterminated string literal".to_string(),
                    ));
                }
                tokens.push(Token::Str(text));
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '+' => {
                chars.next();
                tokens.push(Token::Plus);
            }
            '-' => {
                chars.next();
                tokens.push(Token::Minus);
            }
            '*' => {
                chars.next();
                tokens.push(Token::Star);
            }
            '/' => {
                chars.next();
                tokens.push(Token::Slash);
            }
            '%' => {
                chars.next();
                tokens.push(Token::Percent);
            }
            '=' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Eq);
                } else {
                    return Err(EngineError::Expression(
                        "Assignment is not permitted in conditions".to_string(),
                    ));
                }
            }
            '!' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::NotEq);
                } else {
                    tokens.push(Token::Not);
                }
            }
            '<' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::LtEq);
                } else {
                    tokens.push(Token::Lt);
                }
            }
            '>' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::GtEq);
                } else {
                    tokens.push(Token::Gt);
                }
            }
            '&' => {
                chars.next();
                if chars.next() == Some('&') {
                    tokens.push(Token::And);
                } else {
                    return Err(EngineError::Expression("Expected '&&'".to_string()));
                }
            }
            '|' => {
                chars.next();
                if chars.next() == Some('|') {
                    tokens.push(Token::Or);
                } else {
                    return Err(EngineError::Expression("Expected '||'".to_string()));
                }
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut text = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_alphanumeric() || d == '_' || d == '.' {
                        text.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(match text.as_str() {
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" | "none" => Token::Null,
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    _ => Token::Ident(text),
                });
            }
            other => {
                return Err(EngineError::Expression(format!(
                    "Unexpected character '{}'",
                    other
                )));
            }
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    position: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.position).cloned();
        if token.is_some() {
            self.position += 1;
        }
        token
    }

    fn expect(&mut self, token: Token) -> Result<(), EngineError> {
        match self.advance() {
            Some(t) if t == token => Ok(()),
            other => Err(EngineError::Expression(format!(
                "Expected {:?}, found {:?}",
                token, other
            ))),
        }
    }

    // or_expr := and_expr ("||" and_expr)*
    fn parse_or(&mut self) -> Result<Expr, EngineError> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.advance();
            let right = self.parse_and()?;
            left = Expr::Binary(BinaryOp::Or, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    // and_expr := cmp_expr ("&&" cmp_expr)*
    fn parse_and(&mut self) -> Result<Expr, EngineError> {
        let mut left = self.parse_comparison()?;
        while self.peek() == Some(&Token::And) {
            self.advance();
            let right = self.parse_comparison()?;
            left = Expr::Binary(BinaryOp::And, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    // cmp_expr := add_expr (cmp_op add_expr)?
    fn parse_comparison(&mut self) -> Result<Expr, EngineError> {
        let left = self.parse_additive()?;
        let op = match self.peek() {
            Some(Token::Eq) => BinaryOp::Eq,
            Some(Token::NotEq) => BinaryOp::NotEq,
            Some(Token::Lt) => BinaryOp::Lt,
            Some(Token::LtEq) => BinaryOp::LtEq,
            Some(Token::Gt) => BinaryOp::Gt,
            Some(Token::GtEq) => BinaryOp::GtEq,
            _ => return Ok(left),
        };
        self.advance();
        let right = self.parse_additive()?;
        Ok(Expr::Binary(op, Box::new(left), Box::new(right)))
    }

    fn parse_additive(&mut self) -> Result<Expr, EngineError> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => break,
            };
            self.advance();
            let right = self.parse_multiplicative()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, EngineError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                Some(Token::Percent) => BinaryOp::Rem,
                _ => break,
            };
            self.advance();
            let right = self.parse_unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, EngineError> {
        match self.peek() {
            Some(Token::Minus) => {
                self.advance();
                Ok(Expr::Unary(UnaryOp::Neg, Box::new(self.parse_unary()?)))
            }
            Some(Token::Not) => {
                self.advance();
                Ok(Expr::Unary(UnaryOp::Not, Box::new(self.parse_unary()?)))
            }
            _ => self.parse_primary(),
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, EngineError> {
        match self.advance() {
            Some(Token::Number(n)) => {
                let value = if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
                    Value::from(n as i64)
                } else {
                    serde_json::Number::from_f64(n)
                        .map(Value::Number)
                        .unwrap_or(Value::Null)
                };
                Ok(Expr::Literal(value))
            }
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::True) => Ok(Expr::Literal(Value::Bool(true))),
            Some(Token::False) => Ok(Expr::Literal(Value::Bool(false))),
            Some(Token::Null) => Ok(Expr::Literal(Value::Null)),
            Some(Token::Ident(name)) => Ok(Expr::Variable(name)),
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            other => Err(EngineError::Expression(format!(
                "Unexpected token {:?}",
                other
            ))),
        }
    }
}

fn parse(input: &str) -> Result<Expr, EngineError> {
    let tokens = lex(input)?;
    if tokens.is_empty() {
        return Err(EngineError::Expression("Empty expression".to_string()));
    }
    let mut parser = Parser {
        tokens,
        position: 0,
    };
    let expr = parser.parse_or()?;
    if parser.position != parser.tokens.len() {
        return Err(EngineError::Expression(format!(
            "Trailing tokens after expression, at position {}",
            parser.position
        )));
    }
    Ok(expr)
}

/// Look up a possibly dotted name in the scope
///
/// The full name wins when present as a flat key; otherwise each dot
/// descends into an object.
fn lookup<'a>(scope: &'a HashMap<String, Value>, name: &str) -> Option<&'a Value> {
    if let Some(value) = scope.get(name) {
        return Some(value);
    }
    let mut parts = name.split('.');
    let mut current = scope.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

fn number_value(f: f64) -> Value {
    if f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
        Value::from(f as i64)
    } else {
        serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

fn compare(left: &Value, right: &Value) -> Option<std::cmp::Ordering> {
    if let (Some(l), Some(r)) = (as_number(left), as_number(right)) {
        return l.partial_cmp(&r);
    }
    if let (Value::String(l), Value::String(r)) = (left, right) {
        return Some(l.cmp(r));
    }
    None
}

fn eval(expr: &Expr, scope: &HashMap<String, Value>) -> Result<Value, EngineError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Variable(name) => lookup(scope, name).cloned().ok_or_else(|| {
            EngineError::Expression(format!("Undefined variable '{}'", name))
        }),
        Expr::Unary(op, inner) => {
            let value = eval(inner, scope)?;
            match op {
                UnaryOp::Not => Ok(Value::Bool(!truthy(&value))),
                UnaryOp::Neg => as_number(&value)
                    .map(|n| number_value(-n))
                    .ok_or_else(|| {
                        EngineError::Expression("Cannot negate a non-number".to_string())
                    }),
            }
        }
        Expr::Binary(op, left, right) => {
            // Short-circuit the boolean operators
            match op {
                BinaryOp::And => {
                    let l = eval(left, scope)?;
                    if !truthy(&l) {
                        return Ok(Value::Bool(false));
                    }
                    let r = eval(right, scope)?;
                    return Ok(Value::Bool(truthy(&r)));
                }
                BinaryOp::Or => {
                    let l = eval(left, scope)?;
                    if truthy(&l) {
                        return Ok(Value::Bool(true));
                    }
                    let r = eval(right, scope)?;
                    return Ok(Value::Bool(truthy(&r)));
                }
                _ => {}
            }

            let l = eval(left, scope)?;
            let r = eval(right, scope)?;
            match op {
                BinaryOp::Eq => Ok(Value::Bool(values_equal(&l, &r))),
                BinaryOp::NotEq => Ok(Value::Bool(!values_equal(&l, &r))),
                BinaryOp::Lt | BinaryOp::LtEq | BinaryOp::Gt | BinaryOp::GtEq => {
                    let ordering = compare(&l, &r).ok_or_else(|| {
                        EngineError::Expression(format!(
                            "Cannot order {:?} against {:?}",
                            l, r
                        ))
                    })?;
                    use std::cmp::Ordering::*;
                    let result = match op {
                        BinaryOp::Lt => ordering == Less,
                        BinaryOp::LtEq => ordering != Greater,
                        BinaryOp::Gt => ordering == Greater,
                        BinaryOp::GtEq => ordering != Less,
                        _ => unreachable!(),
                    };
                    Ok(Value::Bool(result))
                }
                BinaryOp::Add => {
                    if let (Value::String(ls), Value::String(rs)) = (&l, &r) {
                        return Ok(Value::String(format!("{}{}", ls, rs)));
                    }
                    arithmetic(&l, &r, |a, b| a + b)
                }
                BinaryOp::Sub => arithmetic(&l, &r, |a, b| a - b),
                BinaryOp::Mul => arithmetic(&l, &r, |a, b| a * b),
                BinaryOp::Div => {
                    let divisor = as_number(&r);
                    if divisor == Some(0.0) {
                        return Err(EngineError::Expression("Division by zero".to_string()));
                    }
                    arithmetic(&l, &r, |a, b| a / b)
                }
                BinaryOp::Rem => {
                    let divisor = as_number(&r);
                    if divisor == Some(0.0) {
                        return Err(EngineError::Expression("Division by zero".to_string()));
                    }
                    arithmetic(&l, &r, |a, b| a % b)
                }
                BinaryOp::And | BinaryOp::Or => unreachable!(),
            }
        }
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    if let (Some(l), Some(r)) = (as_number(left), as_number(right)) {
        return l == r;
    }
    left == right
}

fn arithmetic(
    left: &Value,
    right: &Value,
    op: impl Fn(f64, f64) -> f64,
) -> Result<Value, EngineError> {
    match (as_number(left), as_number(right)) {
        (Some(l), Some(r)) => Ok(number_value(op(l, r))),
        _ => Err(EngineError::Expression(format!(
            "Arithmetic on non-numbers: {:?}, {:?}",
            left, right
        ))),
    }
}

/// Evaluate an expression against a scope of variables
pub fn evaluate(input: &str, scope: &HashMap<String, Value>) -> Result<Value, EngineError> {
    let expr = parse(input)?;
    eval(&expr, scope)
}

/// Evaluate an expression as a boolean condition
///
/// Undefined variables and type errors surface as `Err`; callers that need
/// the recoverable-false behavior map the error at their boundary.
pub fn evaluate_condition(
    input: &str,
    scope: &HashMap<String, Value>,
) -> Result<bool, EngineError> {
    Ok(truthy(&evaluate(input, scope)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scope(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_arithmetic_and_precedence() {
        let empty = HashMap::new();
        assert_eq!(evaluate("1 + 2 * 3", &empty).unwrap(), json!(7));
        assert_eq!(evaluate("(1 + 2) * 3", &empty).unwrap(), json!(9));
        assert_eq!(evaluate("10 / 4", &empty).unwrap(), json!(2.5));
        assert_eq!(evaluate("10 % 3", &empty).unwrap(), json!(1));
        assert_eq!(evaluate("-5 + 2", &empty).unwrap(), json!(-3));
    }

    #[test]
    fn test_comparisons() {
        let vars = scope(&[("amount", json!(150))]);
        assert_eq!(evaluate_condition("amount > 100", &vars).unwrap(), true);
        assert_eq!(evaluate_condition("amount <= 100", &vars).unwrap(), false);
        assert_eq!(evaluate_condition("amount == 150", &vars).unwrap(), true);
        assert_eq!(evaluate_condition("amount != 150", &vars).unwrap(), false);
    }

    #[test]
    fn test_string_comparison_and_concat() {
        let vars = scope(&[("name", json!("alice"))]);
        assert_eq!(
            evaluate_condition("name == 'alice'", &vars).unwrap(),
            true
        );
        assert_eq!(
            evaluate("name + '@corp'", &vars).unwrap(),
            json!("alice@corp")
        );
        assert_eq!(evaluate_condition("'a' < 'b'", &vars).unwrap(), true);
    }

    #[test]
    fn test_boolean_operators_and_keywords() {
        let vars = scope(&[("a", json!(true)), ("b", json!(false))]);
        assert_eq!(evaluate_condition("a && b", &vars).unwrap(), false);
        assert_eq!(evaluate_condition("a || b", &vars).unwrap(), true);
        assert_eq!(evaluate_condition("a and not b", &vars).unwrap(), true);
        assert_eq!(evaluate_condition("!a or b", &vars).unwrap(), false);
    }

    #[test]
    fn test_short_circuit_skips_undefined_right_side() {
        let vars = scope(&[("a", json!(false))]);
        assert_eq!(
            evaluate_condition("a && missing > 1", &vars).unwrap(),
            false
        );
    }

    #[test]
    fn test_undefined_variable_is_an_error() {
        let empty = HashMap::new();
        let result = evaluate_condition("missing > 1", &empty);
        assert!(matches!(result, Err(EngineError::Expression(_))));
    }

    #[test]
    fn test_dotted_lookup_descends_objects() {
        let vars = scope(&[("order", json!({"total": 99.5, "customer": {"tier": "gold"}}))]);
        assert_eq!(
            evaluate_condition("order.total < 100", &vars).unwrap(),
            true
        );
        assert_eq!(
            evaluate_condition("order.customer.tier == 'gold'", &vars).unwrap(),
            true
        );
    }

    #[test]
    fn test_flat_key_wins_over_traversal() {
        let mut vars = scope(&[("order", json!({"total": 1}))]);
        vars.insert("order.total".to_string(), json!(7));
        assert_eq!(evaluate("order.total", &vars).unwrap(), json!(7));
    }

    #[test]
    fn test_disallowed_syntax_rejected() {
        let empty = HashMap::new();
        assert!(evaluate("f(1)", &empty).is_err());
        assert!(evaluate("a = 1", &empty).is_err());
        assert!(evaluate("[1, 2]", &empty).is_err());
        assert!(evaluate("", &empty).is_err());
        assert!(evaluate("1 +", &empty).is_err());
    }

    #[test]
    fn test_division_by_zero() {
        let empty = HashMap::new();
        assert!(matches!(
            evaluate("1 / 0", &empty),
            Err(EngineError::Expression(_))
        ));
        assert!(matches!(
            evaluate("1 % 0", &empty),
            Err(EngineError::Expression(_))
        ));
    }

    #[test]
    fn test_null_and_truthiness() {
        let vars = scope(&[("maybe", json!(null)), ("items", json!([]))]);
        assert_eq!(evaluate_condition("maybe == null", &vars).unwrap(), true);
        assert_eq!(evaluate_condition("maybe", &vars).unwrap(), false);
        assert_eq!(evaluate_condition("items", &vars).unwrap(), false);
        assert_eq!(evaluate_condition("not items", &vars).unwrap(), true);
    }

    #[test]
    fn test_integer_results_stay_integers() {
        let empty = HashMap::new();
        assert_eq!(evaluate("2 + 3", &empty).unwrap(), json!(5));
        assert_eq!(evaluate("2.5 + 0.5", &empty).unwrap(), json!(3));
        assert_eq!(evaluate("7 == 7.0", &empty).unwrap(), json!(true));
    }
}
