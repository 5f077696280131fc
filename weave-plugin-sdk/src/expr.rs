//! Restricted expression language for filter/map style node settings
//!
//! Expressions are parsed into an AST and evaluated against a JSON scope.
//! The grammar only has literals, variable lookup, property/index access and
//! a fixed set of operators. There are no function calls and no assignment,
//! so an expression can read the data it is given and nothing else.
//!
//! ```text
//! ternary    := or ( "?" ternary ":" ternary )?
//! or         := and ( "||" and )*
//! and        := equality ( "&&" equality )*
//! equality   := comparison ( ("==" | "!=") comparison )*
//! comparison := additive ( ("<" | "<=" | ">" | ">=") additive )*
//! additive   := term ( ("+" | "-") term )*
//! term       := unary ( ("*" | "/" | "%") unary )*
//! unary      := ("!" | "-") unary | postfix
//! postfix    := primary ( "." IDENT | "[" ternary "]" )*
//! primary    := NUMBER | STRING | true | false | null | IDENT | "(" ternary ")"
//! ```

use serde_json::{Number, Value};
use thiserror::Error;

/// Longest accepted source text, in bytes
pub const MAX_EXPRESSION_LENGTH: usize = 4096;

/// Deepest accepted nesting
///
/// Parentheses, unary operators, every operator of a binary chain and every
/// `.`/`[]` access each add a level.
pub const MAX_DEPTH: usize = 64;

const FORBIDDEN_PROPERTIES: [&str; 3] = ["__proto__", "constructor", "prototype"];

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExprError {
    #[error("Expression exceeds {} bytes", MAX_EXPRESSION_LENGTH)]
    TooLong,

    #[error("Expression nesting exceeds {} levels", MAX_DEPTH)]
    TooDeep,

    #[error("Unexpected character '{0}' at offset {1}")]
    UnexpectedChar(char, usize),

    #[error("Unterminated string literal")]
    UnterminatedString,

    #[error("Invalid number literal '{0}'")]
    InvalidNumber(String),

    #[error("Unexpected token {found}, expected {expected}")]
    UnexpectedToken { found: String, expected: &'static str },

    #[error("Function calls are not allowed: {0}(...)")]
    FunctionCall(String),

    #[error("Access to property '{0}' is not allowed")]
    ForbiddenProperty(String),

    #[error("Operator {op} cannot be applied to {left} and {right}")]
    TypeMismatch {
        op: &'static str,
        left: &'static str,
        right: &'static str,
    },

    #[error("Division by zero")]
    DivisionByZero,

    #[error("Arithmetic result is not a finite number")]
    NonFinite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    And,
    Or,
}

impl BinaryOp {
    fn symbol(&self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::Rem => "%",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::And => "&&",
            Self::Or => "||",
        }
    }
}

/// Parsed expression
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Ident(String),
    Member(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Conditional(Box<Expr>, Box<Expr>, Box<Expr>),
}

// ============================================================================
// Lexer
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    Punct(&'static str),
    End,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Number(n) => format!("number {}", n),
            Token::Str(s) => format!("string {:?}", s),
            Token::Ident(i) => format!("identifier '{}'", i),
            Token::Punct(p) => format!("'{}'", p),
            Token::End => "end of input".to_string(),
        }
    }
}

const PUNCTUATION: [&str; 21] = [
    "&&", "||", "==", "!=", "<=", ">=", "(", ")", "[", "]", ".", "?", ":", "!", "+", "-", "*",
    "/", "%", "<", ">",
];

fn tokenize(src: &str) -> Result<Vec<Token>, ExprError> {
    let mut tokens = Vec::new();
    let bytes = src.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i] as char;

        if c.is_ascii_whitespace() {
            i += 1;
            continue;
        }

        if c.is_ascii_digit() {
            let start = i;
            while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == b'.') {
                i += 1;
            }
            let text = &src[start..i];
            let n = text
                .parse::<f64>()
                .map_err(|_| ExprError::InvalidNumber(text.to_string()))?;
            tokens.push(Token::Number(n));
            continue;
        }

        if c.is_ascii_alphabetic() || c == '_' || c == '$' {
            let start = i;
            while i < bytes.len()
                && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_' || bytes[i] == b'$')
            {
                i += 1;
            }
            tokens.push(Token::Ident(src[start..i].to_string()));
            continue;
        }

        if c == '"' || c == '\'' {
            let (s, next) = lex_string(src, i)?;
            tokens.push(Token::Str(s));
            i = next;
            continue;
        }

        match PUNCTUATION.iter().find(|p| src[i..].starts_with(**p)) {
            Some(p) => {
                tokens.push(Token::Punct(*p));
                i += p.len();
            }
            None => {
                let ch = src[i..].chars().next().unwrap_or(c);
                return Err(ExprError::UnexpectedChar(ch, i));
            }
        }
    }

    tokens.push(Token::End);
    Ok(tokens)
}

fn lex_string(src: &str, start: usize) -> Result<(String, usize), ExprError> {
    let mut chars = src[start..].char_indices();
    let quote = chars.next().map(|(_, q)| q).ok_or(ExprError::UnterminatedString)?;
    let mut out = String::new();

    while let Some((offset, ch)) = chars.next() {
        match ch {
            '\\' => match chars.next() {
                Some((_, 'n')) => out.push('\n'),
                Some((_, 't')) => out.push('\t'),
                Some((_, other)) => out.push(other),
                None => return Err(ExprError::UnterminatedString),
            },
            c if c == quote => return Ok((out, start + offset + ch.len_utf8())),
            c => out.push(c),
        }
    }

    Err(ExprError::UnterminatedString)
}

// ============================================================================
// Parser
// ============================================================================

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    /// `tokens` always ends with `Token::End`, which is never consumed
    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn next(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, punct: &str) -> bool {
        if matches!(self.peek(), Token::Punct(p) if *p == punct) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, punct: &'static str) -> Result<(), ExprError> {
        if self.eat(punct) {
            Ok(())
        } else {
            Err(ExprError::UnexpectedToken {
                found: self.peek().describe(),
                expected: punct,
            })
        }
    }

    fn enter(&mut self) -> Result<(), ExprError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(ExprError::TooDeep);
        }
        Ok(())
    }

    fn ternary(&mut self) -> Result<Expr, ExprError> {
        self.enter()?;
        let cond = self.binary(0)?;
        let expr = if self.eat("?") {
            let then = self.ternary()?;
            self.expect(":")?;
            let otherwise = self.ternary()?;
            Expr::Conditional(Box::new(cond), Box::new(then), Box::new(otherwise))
        } else {
            cond
        };
        self.depth -= 1;
        Ok(expr)
    }

    /// Precedence levels, loosest first
    const LEVELS: [&'static [(&'static str, BinaryOp)]; 6] = [
        &[("||", BinaryOp::Or)],
        &[("&&", BinaryOp::And)],
        &[("==", BinaryOp::Eq), ("!=", BinaryOp::Ne)],
        &[
            ("<=", BinaryOp::Le),
            (">=", BinaryOp::Ge),
            ("<", BinaryOp::Lt),
            (">", BinaryOp::Gt),
        ],
        &[("+", BinaryOp::Add), ("-", BinaryOp::Sub)],
        &[("*", BinaryOp::Mul), ("/", BinaryOp::Div), ("%", BinaryOp::Rem)],
    ];

    fn binary(&mut self, level: usize) -> Result<Expr, ExprError> {
        if level == Self::LEVELS.len() {
            return self.unary();
        }

        // Each operator in a chain nests the tree one level deeper
        let mut nested = 0;
        let mut left = self.binary(level + 1)?;
        'outer: loop {
            for (symbol, op) in Self::LEVELS[level] {
                if self.eat(symbol) {
                    self.enter()?;
                    nested += 1;
                    let right = self.binary(level + 1)?;
                    left = Expr::Binary(*op, Box::new(left), Box::new(right));
                    continue 'outer;
                }
            }
            self.depth -= nested;
            return Ok(left);
        }
    }

    fn unary(&mut self) -> Result<Expr, ExprError> {
        let op = if self.eat("!") {
            UnaryOp::Not
        } else if self.eat("-") {
            UnaryOp::Neg
        } else {
            return self.postfix();
        };
        self.enter()?;
        let operand = self.unary()?;
        self.depth -= 1;
        Ok(Expr::Unary(op, Box::new(operand)))
    }

    fn postfix(&mut self) -> Result<Expr, ExprError> {
        let mut nested = 0;
        let mut expr = self.primary()?;
        loop {
            if matches!(self.peek(), Token::Punct(".") | Token::Punct("[")) {
                self.enter()?;
                nested += 1;
            }
            if self.eat(".") {
                match self.next() {
                    Token::Ident(name) => {
                        check_property(&name)?;
                        expr = Expr::Member(Box::new(expr), name);
                    }
                    other => {
                        return Err(ExprError::UnexpectedToken {
                            found: other.describe(),
                            expected: "property name",
                        })
                    }
                }
            } else if self.eat("[") {
                let index = self.ternary()?;
                if let Expr::Literal(Value::String(name)) = &index {
                    check_property(name)?;
                }
                self.expect("]")?;
                expr = Expr::Index(Box::new(expr), Box::new(index));
            } else if matches!(self.peek(), Token::Punct("(")) {
                let callee = match &expr {
                    Expr::Ident(name) | Expr::Member(_, name) => name.clone(),
                    _ => "<expression>".to_string(),
                };
                return Err(ExprError::FunctionCall(callee));
            } else {
                self.depth -= nested;
                return Ok(expr);
            }
        }
    }

    fn primary(&mut self) -> Result<Expr, ExprError> {
        match self.next() {
            Token::Number(n) => Ok(Expr::Literal(number(n)?)),
            Token::Str(s) => Ok(Expr::Literal(Value::String(s))),
            Token::Ident(name) => Ok(match name.as_str() {
                "true" => Expr::Literal(Value::Bool(true)),
                "false" => Expr::Literal(Value::Bool(false)),
                "null" => Expr::Literal(Value::Null),
                _ => {
                    check_property(&name)?;
                    Expr::Ident(name)
                }
            }),
            Token::Punct("(") => {
                let inner = self.ternary()?;
                self.expect(")")?;
                Ok(inner)
            }
            other => Err(ExprError::UnexpectedToken {
                found: other.describe(),
                expected: "expression",
            }),
        }
    }
}

fn check_property(name: &str) -> Result<(), ExprError> {
    if FORBIDDEN_PROPERTIES.contains(&name) {
        return Err(ExprError::ForbiddenProperty(name.to_string()));
    }
    Ok(())
}

/// Parse an expression
pub fn parse(src: &str) -> Result<Expr, ExprError> {
    if src.len() > MAX_EXPRESSION_LENGTH {
        return Err(ExprError::TooLong);
    }
    let mut parser = Parser {
        tokens: tokenize(src)?,
        pos: 0,
        depth: 0,
    };
    let expr = parser.ternary()?;
    match parser.peek() {
        Token::End => Ok(expr),
        other => Err(ExprError::UnexpectedToken {
            found: other.describe(),
            expected: "end of input",
        }),
    }
}

/// Parse and evaluate in one step
pub fn evaluate(src: &str, scope: &Value) -> Result<Value, ExprError> {
    parse(src)?.evaluate(scope)
}

// ============================================================================
// Evaluation
// ============================================================================

fn number(n: f64) -> Result<Value, ExprError> {
    if !n.is_finite() {
        return Err(ExprError::NonFinite);
    }
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        return Ok(Value::from(n as i64));
    }
    Number::from_f64(n).map(Value::Number).ok_or(ExprError::NonFinite)
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Truthiness used by `!`, `&&`, `||` and `?:`
pub fn is_truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn to_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl Expr {
    /// Evaluate against a scope; unknown names resolve to `null`
    pub fn evaluate(&self, scope: &Value) -> Result<Value, ExprError> {
        match self {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Ident(name) => Ok(scope.get(name).cloned().unwrap_or(Value::Null)),
            Expr::Member(target, name) => {
                let target = target.evaluate(scope)?;
                Ok(target.get(name).cloned().unwrap_or(Value::Null))
            }
            Expr::Index(target, index) => {
                let target = target.evaluate(scope)?;
                let index = index.evaluate(scope)?;
                let found = match (&target, &index) {
                    (Value::Array(items), Value::Number(n)) => {
                        n.as_u64().and_then(|i| items.get(i as usize))
                    }
                    (Value::Object(map), Value::String(key)) => {
                        check_property(key)?;
                        map.get(key)
                    }
                    _ => None,
                };
                Ok(found.cloned().unwrap_or(Value::Null))
            }
            Expr::Unary(UnaryOp::Not, operand) => Ok(Value::Bool(!is_truthy(&operand.evaluate(scope)?))),
            Expr::Unary(UnaryOp::Neg, operand) => match operand.evaluate(scope)? {
                Value::Number(n) => number(-n.as_f64().unwrap_or(0.0)),
                other => Err(ExprError::TypeMismatch {
                    op: "-",
                    left: type_name(&other),
                    right: "nothing",
                }),
            },
            Expr::Conditional(cond, then, otherwise) => {
                if is_truthy(&cond.evaluate(scope)?) {
                    then.evaluate(scope)
                } else {
                    otherwise.evaluate(scope)
                }
            }
            Expr::Binary(BinaryOp::And, left, right) => {
                let l = left.evaluate(scope)?;
                if is_truthy(&l) {
                    right.evaluate(scope)
                } else {
                    Ok(l)
                }
            }
            Expr::Binary(BinaryOp::Or, left, right) => {
                let l = left.evaluate(scope)?;
                if is_truthy(&l) {
                    Ok(l)
                } else {
                    right.evaluate(scope)
                }
            }
            Expr::Binary(op, left, right) => {
                let l = left.evaluate(scope)?;
                let r = right.evaluate(scope)?;
                apply_binary(*op, &l, &r)
            }
        }
    }
}

fn apply_binary(op: BinaryOp, l: &Value, r: &Value) -> Result<Value, ExprError> {
    let mismatch = || ExprError::TypeMismatch {
        op: op.symbol(),
        left: type_name(l),
        right: type_name(r),
    };

    match op {
        BinaryOp::Eq => return Ok(Value::Bool(loose_eq(l, r))),
        BinaryOp::Ne => return Ok(Value::Bool(!loose_eq(l, r))),
        BinaryOp::Add if l.is_string() || r.is_string() => {
            return Ok(Value::String(format!("{}{}", to_text(l), to_text(r))))
        }
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ord = match (l, r) {
                (Value::Number(a), Value::Number(b)) => a
                    .as_f64()
                    .zip(b.as_f64())
                    .and_then(|(a, b)| a.partial_cmp(&b)),
                (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
                _ => None,
            }
            .ok_or_else(mismatch)?;
            let result = match op {
                BinaryOp::Lt => ord.is_lt(),
                BinaryOp::Le => ord.is_le(),
                BinaryOp::Gt => ord.is_gt(),
                _ => ord.is_ge(),
            };
            return Ok(Value::Bool(result));
        }
        _ => {}
    }

    let (Some(a), Some(b)) = (l.as_f64(), r.as_f64()) else {
        return Err(mismatch());
    };

    match op {
        BinaryOp::Add => number(a + b),
        BinaryOp::Sub => number(a - b),
        BinaryOp::Mul => number(a * b),
        BinaryOp::Div if b == 0.0 => Err(ExprError::DivisionByZero),
        BinaryOp::Div => number(a / b),
        BinaryOp::Rem if b == 0.0 => Err(ExprError::DivisionByZero),
        BinaryOp::Rem => number(a % b),
        _ => Err(mismatch()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn eval(src: &str, scope: Value) -> Value {
        evaluate(src, &scope).unwrap()
    }

    #[test]
    fn test_arithmetic_and_precedence() {
        assert_eq!(eval("1 + 2 * 3", json!({})), json!(7));
        assert_eq!(eval("(1 + 2) * 3", json!({})), json!(9));
        assert_eq!(eval("7 % 4 - -1", json!({})), json!(4));
        assert_eq!(eval("1 / 4", json!({})), json!(0.25));
    }

    #[test]
    fn test_property_and_index_access() {
        let scope = json!({ "item": { "price": 12.5, "tags": ["a", "b"], "meta": { "k": 1 } } });
        assert_eq!(eval("item.price > 10", scope.clone()), json!(true));
        assert_eq!(eval("item.tags[1]", scope.clone()), json!("b"));
        assert_eq!(eval("item[\"meta\"].k", scope.clone()), json!(1));
        assert_eq!(eval("item.missing.deeper", scope.clone()), json!(null));
        assert_eq!(eval("unknown", scope), json!(null));
    }

    #[test]
    fn test_logic_and_ternary() {
        let scope = json!({ "status": "active", "count": 0, "name": "" });
        assert_eq!(eval("status == 'active' && count == 0", scope.clone()), json!(true));
        assert_eq!(eval("name || 'anonymous'", scope.clone()), json!("anonymous"));
        assert_eq!(eval("count ? 'some' : 'none'", scope.clone()), json!("none"));
        assert_eq!(eval("!count", scope.clone()), json!(true));
        assert_eq!(eval("'n=' + count", scope), json!("n=0"));
    }

    #[test]
    fn test_numeric_equality_ignores_representation() {
        assert_eq!(eval("x == 1", json!({ "x": 1.0 })), json!(true));
        assert_eq!(eval("x != '1'", json!({ "x": 1 })), json!(true));
    }

    #[test]
    fn test_function_calls_rejected() {
        assert_eq!(
            parse("process.exit(1)").unwrap_err(),
            ExprError::FunctionCall("exit".to_string())
        );
        assert!(matches!(parse("eval('1')"), Err(ExprError::FunctionCall(_))));
        assert!(matches!(parse("(x)(1)"), Err(ExprError::FunctionCall(_))));
    }

    #[test]
    fn test_forbidden_properties() {
        assert!(matches!(parse("a.constructor"), Err(ExprError::ForbiddenProperty(_))));
        assert!(matches!(parse("a['__proto__']"), Err(ExprError::ForbiddenProperty(_))));
        let err = evaluate("a[k]", &json!({ "a": {}, "k": "prototype" })).unwrap_err();
        assert!(matches!(err, ExprError::ForbiddenProperty(_)));
    }

    #[test]
    fn test_syntax_errors() {
        assert!(matches!(parse("1 +"), Err(ExprError::UnexpectedToken { .. })));
        assert!(matches!(parse("a = 1"), Err(ExprError::UnexpectedChar('=', 2))));
        assert!(matches!(parse("'open"), Err(ExprError::UnterminatedString)));
        assert!(matches!(parse("1 2"), Err(ExprError::UnexpectedToken { .. })));
    }

    #[test]
    fn test_limits() {
        let deep = format!("{}1{}", "(".repeat(100), ")".repeat(100));
        assert_eq!(parse(&deep).unwrap_err(), ExprError::TooDeep);
        let long = "1+".repeat(MAX_EXPRESSION_LENGTH) + "1";
        assert_eq!(parse(&long).unwrap_err(), ExprError::TooLong);
    }

    #[test]
    fn test_flat_chains_count_towards_depth() {
        // Just under the length cap, with no parentheses at all
        let sum = "1+".repeat(2040) + "1";
        assert!(sum.len() <= MAX_EXPRESSION_LENGTH);
        assert_eq!(parse(&sum).unwrap_err(), ExprError::TooDeep);

        let mixed = "1*2-".repeat(500) + "1";
        assert_eq!(parse(&mixed).unwrap_err(), ExprError::TooDeep);

        let members = "a".to_string() + &".b".repeat(1500);
        assert_eq!(parse(&members).unwrap_err(), ExprError::TooDeep);

        let indexes = "a".to_string() + &"[0]".repeat(1000);
        assert_eq!(parse(&indexes).unwrap_err(), ExprError::TooDeep);

        let negations = "-".repeat(200) + "1";
        assert_eq!(parse(&negations).unwrap_err(), ExprError::TooDeep);
    }

    #[test]
    fn test_short_chains_still_evaluate() {
        let sum = "1+".repeat(30) + "1";
        assert_eq!(evaluate(&sum, &Value::Null).unwrap(), json!(31));

        let scope = json!({ "a": { "b": { "c": { "d": [10, 20] } } } });
        assert_eq!(evaluate("a.b.c.d[1]", &scope).unwrap(), json!(20));
        assert_eq!(evaluate("a.b.c.d[0] + a.b.c.d[1] * 2", &scope).unwrap(), json!(50));
    }

    #[test]
    fn test_runtime_type_errors() {
        assert!(matches!(
            evaluate("a - 1", &json!({ "a": "x" })),
            Err(ExprError::TypeMismatch { .. })
        ));
        assert_eq!(evaluate("1 / 0", &json!({})), Err(ExprError::DivisionByZero));
        assert!(matches!(
            evaluate("a < 1", &json!({ "a": [1] })),
            Err(ExprError::TypeMismatch { .. })
        ));
    }
}
