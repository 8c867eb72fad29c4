//! Safe expression evaluator for router patterns
//!
//! A recursive-descent parser over
//! `'str' | "str" | number | @value | @exitCode | (…)` with the operators
//! `== != > < >= <= && ||`. No eval, no reflection, no host calls.
//! Expressions are capped at 2 KiB and must be balanced before parsing.

use dagforge_common::error::{Error, Result};

/// Upper bound on expression source length.
pub const MAX_EXPRESSION_LEN: usize = 2048;

/// Substrings rejected inside regex patterns at compile time.
pub const PATTERN_BLOCKLIST: &[&str] =
    &["system(", "exec(", "shell(", "eval(", "__", "reflect."];

/// Reject pattern sources that resemble host-call escapes.
pub fn check_blocklist(pattern: &str) -> Result<()> {
    for needle in PATTERN_BLOCKLIST {
        if pattern.contains(needle) {
            return Err(Error::Validation(format!(
                "pattern {pattern:?} contains blocked sequence {needle:?}"
            )));
        }
    }
    Ok(())
}

/// Inputs available to an expression
#[derive(Debug, Clone, Default)]
pub struct ExprContext {
    pub value: String,
    pub exit_code: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Str(String),
    Num(f64),
    Value,
    ExitCode,
    Cmp(CmpOp),
    And,
    Or,
    LParen,
    RParen,
}

#[derive(Debug, Clone)]
enum Ast {
    Str(String),
    Num(f64),
    Value,
    ExitCode,
    Cmp(Box<Ast>, CmpOp, Box<Ast>),
    And(Box<Ast>, Box<Ast>),
    Or(Box<Ast>, Box<Ast>),
}

#[derive(Debug, Clone, PartialEq)]
enum Operand {
    Str(String),
    Num(f64),
}

/// A compiled boolean expression
#[derive(Debug, Clone)]
pub struct Expression {
    source: String,
    ast: Ast,
}

/// Whether a pattern string looks like an expression rather than a plain
/// value: it references an input or contains an operator.
#[must_use]
pub fn looks_like_expression(pattern: &str) -> bool {
    pattern.contains("@value")
        || pattern.contains("@exitCode")
        || ["==", "!=", ">=", "<=", "&&", "||"]
            .iter()
            .any(|op| pattern.contains(op))
}

/// Compile an expression, enforcing the size and balance guards.
pub fn compile_expression(input: &str) -> Result<Expression> {
    if input.len() > MAX_EXPRESSION_LEN {
        return Err(Error::Validation(format!(
            "expression exceeds {MAX_EXPRESSION_LEN} bytes"
        )));
    }
    check_balance(input)?;
    let tokens = tokenize(input)?;
    let mut parser = Parser { tokens, pos: 0 };
    let ast = parser.parse_or()?;
    if parser.pos != parser.tokens.len() {
        return Err(Error::Validation(format!(
            "unexpected trailing input in expression {input:?}"
        )));
    }
    match ast {
        Ast::Cmp(..) | Ast::And(..) | Ast::Or(..) => Ok(Expression {
            source: input.to_string(),
            ast,
        }),
        _ => Err(Error::Validation(format!(
            "expression {input:?} is not a boolean comparison"
        ))),
    }
}

impl Expression {
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn evaluate(&self, ctx: &ExprContext) -> Result<bool> {
        eval_bool(&self.ast, ctx)
    }
}

fn check_balance(input: &str) -> Result<()> {
    let mut depth: i32 = 0;
    let mut quote: Option<char> = None;
    for ch in input.chars() {
        match quote {
            Some(q) => {
                if ch == q {
                    quote = None;
                }
            }
            None => match ch {
                '\'' | '"' => quote = Some(ch),
                '(' => depth += 1,
                ')' => {
                    depth -= 1;
                    if depth < 0 {
                        return Err(Error::Validation(format!(
                            "unbalanced parentheses in expression {input:?}"
                        )));
                    }
                }
                _ => {}
            },
        }
    }
    if quote.is_some() {
        return Err(Error::Validation(format!(
            "unterminated quote in expression {input:?}"
        )));
    }
    if depth != 0 {
        return Err(Error::Validation(format!(
            "unbalanced parentheses in expression {input:?}"
        )));
    }
    Ok(())
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0usize;
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
            '\'' | '"' => {
                let quote = c;
                let start = i + 1;
                let mut j = start;
                while j < chars.len() && chars[j] != quote {
                    j += 1;
                }
                if j >= chars.len() {
                    return Err(Error::Validation(format!(
                        "unterminated string in expression {input:?}"
                    )));
                }
                tokens.push(Token::Str(chars[start..j].iter().collect()));
                i = j + 1;
            }
            '@' => {
                let rest: String = chars[i..].iter().collect();
                if rest.starts_with("@value") {
                    tokens.push(Token::Value);
                    i += "@value".len();
                } else if rest.starts_with("@exitCode") {
                    tokens.push(Token::ExitCode);
                    i += "@exitCode".len();
                } else {
                    return Err(Error::Validation(format!(
                        "unknown reference at {rest:?} in expression"
                    )));
                }
            }
            '=' | '!' | '<' | '>' => {
                let two: String = chars[i..chars.len().min(i + 2)].iter().collect();
                let (op, len) = match two.as_str() {
                    "==" => (CmpOp::Eq, 2),
                    "!=" => (CmpOp::Ne, 2),
                    ">=" => (CmpOp::Ge, 2),
                    "<=" => (CmpOp::Le, 2),
                    _ => match c {
                        '>' => (CmpOp::Gt, 1),
                        '<' => (CmpOp::Lt, 1),
                        _ => {
                            return Err(Error::Validation(format!(
                                "invalid operator at {two:?} in expression"
                            )))
                        }
                    },
                };
                tokens.push(Token::Cmp(op));
                i += len;
            }
            '&' => {
                if i + 1 < chars.len() && chars[i + 1] == '&' {
                    tokens.push(Token::And);
                    i += 2;
                } else {
                    return Err(Error::Validation("single '&' in expression".to_string()));
                }
            }
            '|' => {
                if i + 1 < chars.len() && chars[i + 1] == '|' {
                    tokens.push(Token::Or);
                    i += 2;
                } else {
                    return Err(Error::Validation("single '|' in expression".to_string()));
                }
            }
            c if c.is_ascii_digit() || c == '-' || c == '+' => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let num = text.parse::<f64>().map_err(|_| {
                    Error::Validation(format!("invalid number {text:?} in expression"))
                })?;
                tokens.push(Token::Num(num));
            }
            other => {
                return Err(Error::Validation(format!(
                    "unexpected character {other:?} in expression {input:?}"
                )))
            }
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

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn parse_or(&mut self) -> Result<Ast> {
        let mut left = self.parse_and()?;
        while matches!(self.peek(), Some(Token::Or)) {
            self.next();
            let right = self.parse_and()?;
            left = Ast::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Ast> {
        let mut left = self.parse_cmp()?;
        while matches!(self.peek(), Some(Token::And)) {
            self.next();
            let right = self.parse_cmp()?;
            left = Ast::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_cmp(&mut self) -> Result<Ast> {
        let left = self.parse_primary()?;
        if let Some(Token::Cmp(op)) = self.peek().cloned() {
            self.next();
            let right = self.parse_primary()?;
            return Ok(Ast::Cmp(Box::new(left), op, Box::new(right)));
        }
        Ok(left)
    }

    fn parse_primary(&mut self) -> Result<Ast> {
        match self.next() {
            Some(Token::Str(s)) => Ok(Ast::Str(s)),
            Some(Token::Num(n)) => Ok(Ast::Num(n)),
            Some(Token::Value) => Ok(Ast::Value),
            Some(Token::ExitCode) => Ok(Ast::ExitCode),
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(Error::Validation("expected ')' in expression".to_string())),
                }
            }
            other => Err(Error::Validation(format!(
                "unexpected token {other:?} in expression"
            ))),
        }
    }
}

fn eval_operand(ast: &Ast, ctx: &ExprContext) -> Result<Operand> {
    match ast {
        Ast::Str(s) => Ok(Operand::Str(s.clone())),
        Ast::Num(n) => Ok(Operand::Num(*n)),
        Ast::Value => Ok(Operand::Str(ctx.value.clone())),
        Ast::ExitCode => Ok(Operand::Num(f64::from(ctx.exit_code))),
        _ => Err(Error::Validation(
            "boolean sub-expression used as a value".to_string(),
        )),
    }
}

fn as_number(operand: &Operand) -> Option<f64> {
    match operand {
        Operand::Num(n) => Some(*n),
        Operand::Str(s) => s.trim().parse::<f64>().ok(),
    }
}

#[allow(clippy::float_cmp)]
fn eval_bool(ast: &Ast, ctx: &ExprContext) -> Result<bool> {
    match ast {
        Ast::And(left, right) => Ok(eval_bool(left, ctx)? && eval_bool(right, ctx)?),
        Ast::Or(left, right) => Ok(eval_bool(left, ctx)? || eval_bool(right, ctx)?),
        Ast::Cmp(left, op, right) => {
            let lhs = eval_operand(left, ctx)?;
            let rhs = eval_operand(right, ctx)?;
            match op {
                CmpOp::Eq | CmpOp::Ne => {
                    let equal = match (as_number(&lhs), as_number(&rhs)) {
                        (Some(a), Some(b)) => a == b,
                        _ => match (&lhs, &rhs) {
                            (Operand::Str(a), Operand::Str(b)) => a == b,
                            _ => false,
                        },
                    };
                    Ok(if *op == CmpOp::Eq { equal } else { !equal })
                }
                CmpOp::Gt | CmpOp::Lt | CmpOp::Ge | CmpOp::Le => {
                    let (Some(a), Some(b)) = (as_number(&lhs), as_number(&rhs)) else {
                        return Err(Error::Validation(
                            "ordering comparison requires numeric operands".to_string(),
                        ));
                    };
                    Ok(match op {
                        CmpOp::Gt => a > b,
                        CmpOp::Lt => a < b,
                        CmpOp::Ge => a >= b,
                        CmpOp::Le => a <= b,
                        _ => unreachable!(),
                    })
                }
            }
        }
        _ => Err(Error::Validation(
            "expression did not reduce to a boolean".to_string(),
        )),
    }
}
