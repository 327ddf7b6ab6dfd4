//! Condition expression language for transitions and step guards.
//!
//! Pure boolean expressions over the context: path references, comparisons
//! against literal scalars, `and`/`or`/`not`, and `exists(path)`. No loops,
//! no function calls. Undefined paths evaluate to undefined; comparisons
//! against undefined are always false, so `not exists(p)` is the only way
//! to branch on absence.
//!
//! Grammar (precedence lowest to highest):
//!
//! ```text
//! expr    := and_expr ( 'or' and_expr )*
//! and_expr:= unary ( 'and' unary )*
//! unary   := 'not' unary | comparison
//! cmp     := operand ( ('=='|'!='|'<='|'>='|'<'|'>') operand )?
//! operand := literal | path | 'exists' '(' path ')' | '(' expr ')'
//! ```

use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConditionError {
    #[error("condition parse error in '{expr}': {reason}")]
    Parse { expr: String, reason: String },
}

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Path(String),
    Exists(String),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Cmp { op: CmpOp, lhs: Box<Expr>, rhs: Box<Expr> },
}

/// A compiled condition expression. Parsed once by the loader, evaluated
/// many times against read-only context views.
#[derive(Debug, Clone)]
pub struct Condition {
    source: String,
    expr: Expr,
}

impl Condition {
    pub fn parse(source: &str) -> Result<Self, ConditionError> {
        let tokens = tokenize(source)?;
        let mut parser = Parser { source, tokens, pos: 0 };
        let expr = parser.expr()?;
        if parser.pos != parser.tokens.len() {
            return Err(parser.error("trailing input after expression"));
        }
        Ok(Self { source: source.to_string(), expr })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate against a path resolver. `None` from the resolver means the
    /// path is undefined.
    pub fn eval<F>(&self, mut resolve: F) -> bool
    where
        F: FnMut(&str) -> Option<Value>,
    {
        truthy(&eval_expr(&self.expr, &mut resolve))
    }
}

fn eval_expr<F>(expr: &Expr, resolve: &mut F) -> Option<Value>
where
    F: FnMut(&str) -> Option<Value>,
{
    match expr {
        Expr::Literal(v) => Some(v.clone()),
        Expr::Path(p) => resolve(p),
        Expr::Exists(p) => Some(Value::Bool(resolve(p).is_some())),
        Expr::Not(inner) => Some(Value::Bool(!truthy(&eval_expr(inner, resolve)))),
        Expr::And(a, b) => {
            let result = truthy(&eval_expr(a, resolve)) && truthy(&eval_expr(b, resolve));
            Some(Value::Bool(result))
        }
        Expr::Or(a, b) => {
            let result = truthy(&eval_expr(a, resolve)) || truthy(&eval_expr(b, resolve));
            Some(Value::Bool(result))
        }
        Expr::Cmp { op, lhs, rhs } => {
            let (Some(l), Some(r)) = (eval_expr(lhs, resolve), eval_expr(rhs, resolve)) else {
                // Comparisons against undefined are always false.
                return Some(Value::Bool(false));
            };
            Some(Value::Bool(compare(*op, &l, &r)))
        }
    }
}

fn compare(op: CmpOp, l: &Value, r: &Value) -> bool {
    match op {
        CmpOp::Eq => l == r,
        CmpOp::Ne => l != r,
        CmpOp::Lt | CmpOp::Le | CmpOp::Gt | CmpOp::Ge => {
            let ord = match (l, r) {
                (Value::Number(a), Value::Number(b)) => {
                    let (a, b) = (a.as_f64(), b.as_f64());
                    match (a, b) {
                        (Some(a), Some(b)) => a.partial_cmp(&b),
                        _ => None,
                    }
                }
                (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
                _ => None,
            };
            match ord {
                Some(ord) => match op {
                    CmpOp::Lt => ord.is_lt(),
                    CmpOp::Le => ord.is_le(),
                    CmpOp::Gt => ord.is_gt(),
                    CmpOp::Ge => ord.is_ge(),
                    _ => unreachable!(),
                },
                None => false,
            }
        }
    }
}

/// Truthiness of an evaluated operand: undefined, null, and false are
/// falsy; zero and the empty string are falsy; everything else is truthy.
fn truthy(value: &Option<Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(_)) | Some(Value::Object(_)) => true,
    }
}

// ── tokenizer ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Path(String),
    Number(f64),
    Str(String),
    True,
    False,
    Null,
    And,
    Or,
    Not,
    Exists,
    LParen,
    RParen,
    Op(CmpOp),
}

fn tokenize(source: &str) -> Result<Vec<Token>, ConditionError> {
    let err = |reason: &str| ConditionError::Parse {
        expr: source.to_string(),
        reason: reason.to_string(),
    };
    let mut tokens = Vec::new();
    let chars: Vec<char> = source.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '=' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Op(CmpOp::Eq));
                    i += 2;
                } else {
                    return Err(err("single '=' (use '==')"));
                }
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Op(CmpOp::Ne));
                    i += 2;
                } else {
                    return Err(err("single '!' (use 'not')"));
                }
            }
            '<' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Op(CmpOp::Le));
                    i += 2;
                } else {
                    tokens.push(Token::Op(CmpOp::Lt));
                    i += 1;
                }
            }
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Op(CmpOp::Ge));
                    i += 2;
                } else {
                    tokens.push(Token::Op(CmpOp::Gt));
                    i += 1;
                }
            }
            '\'' | '"' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some('\\') => {
                            match chars.get(i + 1) {
                                Some(&esc @ ('\'' | '"' | '\\')) => s.push(esc),
                                _ => return Err(err("bad escape in string literal")),
                            }
                            i += 2;
                        }
                        Some(&ch) => {
                            s.push(ch);
                            i += 1;
                        }
                        None => return Err(err("unterminated string literal")),
                    }
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit() || (c == '-' && next_is_digit(&chars, i)) => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n: f64 = text.parse().map_err(|_| err("bad number literal"))?;
                tokens.push(Token::Number(n));
            }
            c if is_path_start(c) => {
                let start = i;
                while i < chars.len() && is_path_char(chars[i]) {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "exists" => Token::Exists,
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" => Token::Null,
                    _ => Token::Path(word),
                });
            }
            _ => return Err(err(&format!("unexpected character '{c}'"))),
        }
    }

    Ok(tokens)
}

fn next_is_digit(chars: &[char], i: usize) -> bool {
    chars.get(i + 1).map(|c| c.is_ascii_digit()).unwrap_or(false)
}

fn is_path_start(c: char) -> bool {
    c.is_alphabetic() || c == '$' || c == '_'
}

fn is_path_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '$' | '_' | '.' | '[' | ']' | '*' | '-')
}

// ── parser ───────────────────────────────────────────────────────────

struct Parser<'a> {
    source: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn error(&self, reason: &str) -> ConditionError {
        ConditionError::Parse {
            expr: self.source.to_string(),
            reason: reason.to_string(),
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, token: Token, what: &str) -> Result<(), ConditionError> {
        if self.next().as_ref() == Some(&token) {
            Ok(())
        } else {
            Err(self.error(&format!("expected {what}")))
        }
    }

    fn expr(&mut self) -> Result<Expr, ConditionError> {
        let mut lhs = self.and_expr()?;
        while self.peek() == Some(&Token::Or) {
            self.next();
            let rhs = self.and_expr()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and_expr(&mut self) -> Result<Expr, ConditionError> {
        let mut lhs = self.unary()?;
        while self.peek() == Some(&Token::And) {
            self.next();
            let rhs = self.unary()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, ConditionError> {
        if self.peek() == Some(&Token::Not) {
            self.next();
            let inner = self.unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr, ConditionError> {
        let lhs = self.operand()?;
        if let Some(Token::Op(op)) = self.peek() {
            let op = *op;
            self.next();
            let rhs = self.operand()?;
            return Ok(Expr::Cmp { op, lhs: Box::new(lhs), rhs: Box::new(rhs) });
        }
        Ok(lhs)
    }

    fn operand(&mut self) -> Result<Expr, ConditionError> {
        match self.next() {
            Some(Token::Number(n)) => Ok(Expr::Literal(number_value(n))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::True) => Ok(Expr::Literal(Value::Bool(true))),
            Some(Token::False) => Ok(Expr::Literal(Value::Bool(false))),
            Some(Token::Null) => Ok(Expr::Literal(Value::Null)),
            Some(Token::Path(p)) => Ok(Expr::Path(p)),
            Some(Token::Exists) => {
                self.expect(Token::LParen, "'(' after exists")?;
                let path = match self.next() {
                    Some(Token::Path(p)) => p,
                    _ => return Err(self.error("path inside exists(...)")),
                };
                self.expect(Token::RParen, "')' after exists path")?;
                Ok(Expr::Exists(path))
            }
            Some(Token::LParen) => {
                let inner = self.expr()?;
                self.expect(Token::RParen, "closing ')'")?;
                Ok(inner)
            }
            _ => Err(self.error("expected operand")),
        }
    }
}

/// Preserve integer representation where possible so `== 3` matches a JSON
/// integer 3.
fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::Number((n as i64).into())
    } else {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}
