// Consistency condition parser/evaluator.
// Supports: numbers, element references (DE1, DE{2}), + and -, parentheses,
// and exactly one comparison (==, =, <=, >=, <, >) per condition.

use thiserror::Error;

/// Absolute tolerance for `==`, absorbs rounding in reported totals.
pub const EQUALITY_TOLERANCE: f64 = 0.01;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExpressionError {
    #[error("condition is empty")]
    Empty,
    #[error("unexpected character '{ch}' at position {pos}")]
    UnexpectedChar { ch: char, pos: usize },
    #[error("invalid element reference at position {pos}")]
    BadReference { pos: usize },
    #[error("unexpected end of condition")]
    UnexpectedEnd,
    #[error("unexpected token {0}")]
    UnexpectedToken(String),
    #[error("condition must contain exactly one comparison operator")]
    MissingComparison,
    #[error("DE{index} does not exist (rule lists {available} data elements)")]
    UnknownReference { index: usize, available: usize },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ArithOp {
    Add,
    Sub,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Comparison {
    Eq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    /// 1-based index into the rule's data element list
    Ref(usize),
    Neg(Box<Expr>),
    Binary {
        op: ArithOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub left: Expr,
    pub op: Comparison,
    pub right: Expr,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Evaluation {
    pub passed: bool,
    pub left: f64,
    pub right: f64,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ref(usize),
    Plus,
    Minus,
    LParen,
    RParen,
    Eq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

pub fn parse(condition: &str) -> Result<Condition, ExpressionError> {
    let tokens = tokenize(condition.trim())?;
    if tokens.is_empty() {
        return Err(ExpressionError::Empty);
    }

    let (left, pos) = parse_sum(&tokens, 0)?;
    let op = match tokens.get(pos) {
        Some(Token::Eq) => Comparison::Eq,
        Some(Token::Lt) => Comparison::Lt,
        Some(Token::LtEq) => Comparison::LtEq,
        Some(Token::Gt) => Comparison::Gt,
        Some(Token::GtEq) => Comparison::GtEq,
        Some(other) => return Err(ExpressionError::UnexpectedToken(format!("{:?}", other))),
        None => return Err(ExpressionError::MissingComparison),
    };
    let (right, pos) = parse_sum(&tokens, pos + 1)?;

    match tokens.get(pos) {
        None => Ok(Condition { left, op, right }),
        Some(Token::Eq | Token::Lt | Token::LtEq | Token::Gt | Token::GtEq) => {
            Err(ExpressionError::MissingComparison)
        }
        Some(other) => Err(ExpressionError::UnexpectedToken(format!("{:?}", other))),
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>, ExpressionError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut pos = 0;

    while pos < chars.len() {
        let c = chars[pos];
        match c {
            ' ' | '\t' => pos += 1,
            '+' => {
                tokens.push(Token::Plus);
                pos += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                pos += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                pos += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                pos += 1;
            }
            '=' => {
                // "=" 與 "==" 視為相同
                pos += if chars.get(pos + 1) == Some(&'=') { 2 } else { 1 };
                tokens.push(Token::Eq);
            }
            '<' | '>' => {
                let or_equal = chars.get(pos + 1) == Some(&'=');
                tokens.push(match (c, or_equal) {
                    ('<', true) => Token::LtEq,
                    ('<', false) => Token::Lt,
                    (_, true) => Token::GtEq,
                    (_, false) => Token::Gt,
                });
                pos += if or_equal { 2 } else { 1 };
            }
            'D' | 'd' => {
                let (index, next) = read_reference(&chars, pos)?;
                tokens.push(Token::Ref(index));
                pos = next;
            }
            c if c.is_ascii_digit() || c == '.' => {
                let start = pos;
                while pos < chars.len() && (chars[pos].is_ascii_digit() || chars[pos] == '.') {
                    pos += 1;
                }
                let text: String = chars[start..pos].iter().collect();
                let number = text
                    .parse::<f64>()
                    .map_err(|_| ExpressionError::UnexpectedChar { ch: c, pos: start })?;
                tokens.push(Token::Number(number));
            }
            other => return Err(ExpressionError::UnexpectedChar { ch: other, pos }),
        }
    }

    Ok(tokens)
}

/// Reads `DE3` or `DE{3}` starting at `start`.
fn read_reference(chars: &[char], start: usize) -> Result<(usize, usize), ExpressionError> {
    let bad = ExpressionError::BadReference { pos: start };
    if !matches!(chars.get(start + 1), Some('E') | Some('e')) {
        return Err(bad);
    }

    let mut pos = start + 2;
    let braced = chars.get(pos) == Some(&'{');
    if braced {
        pos += 1;
    }

    let digits_start = pos;
    while pos < chars.len() && chars[pos].is_ascii_digit() {
        pos += 1;
    }
    let digits: String = chars[digits_start..pos].iter().collect();

    if braced {
        if chars.get(pos) != Some(&'}') {
            return Err(bad);
        }
        pos += 1;
    }

    match digits.parse::<usize>() {
        Ok(index) if index >= 1 => Ok((index, pos)),
        _ => Err(bad),
    }
}

fn parse_sum(tokens: &[Token], pos: usize) -> Result<(Expr, usize), ExpressionError> {
    let (mut left, mut pos) = parse_unary(tokens, pos)?;

    while pos < tokens.len() {
        let op = match &tokens[pos] {
            Token::Plus => ArithOp::Add,
            Token::Minus => ArithOp::Sub,
            _ => break,
        };
        let (right, new_pos) = parse_unary(tokens, pos + 1)?;
        left = Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        };
        pos = new_pos;
    }

    Ok((left, pos))
}

fn parse_unary(tokens: &[Token], pos: usize) -> Result<(Expr, usize), ExpressionError> {
    match tokens.get(pos) {
        Some(Token::Minus) => {
            let (inner, pos) = parse_unary(tokens, pos + 1)?;
            Ok((Expr::Neg(Box::new(inner)), pos))
        }
        Some(Token::Plus) => parse_unary(tokens, pos + 1),
        _ => parse_primary(tokens, pos),
    }
}

fn parse_primary(tokens: &[Token], pos: usize) -> Result<(Expr, usize), ExpressionError> {
    match tokens.get(pos) {
        None => Err(ExpressionError::UnexpectedEnd),
        Some(Token::Number(n)) => Ok((Expr::Number(*n), pos + 1)),
        Some(Token::Ref(index)) => Ok((Expr::Ref(*index), pos + 1)),
        Some(Token::LParen) => {
            let (inner, pos) = parse_sum(tokens, pos + 1)?;
            match tokens.get(pos) {
                Some(Token::RParen) => Ok((inner, pos + 1)),
                Some(other) => Err(ExpressionError::UnexpectedToken(format!("{:?}", other))),
                None => Err(ExpressionError::UnexpectedEnd),
            }
        }
        Some(other) => Err(ExpressionError::UnexpectedToken(format!("{:?}", other))),
    }
}

impl Expr {
    fn collect_refs(&self, out: &mut Vec<usize>) {
        match self {
            Expr::Number(_) => {}
            Expr::Ref(index) => out.push(*index),
            Expr::Neg(inner) => inner.collect_refs(out),
            Expr::Binary { left, right, .. } => {
                left.collect_refs(out);
                right.collect_refs(out);
            }
        }
    }

    fn eval<F: Fn(usize) -> f64>(&self, resolve: &F) -> f64 {
        match self {
            Expr::Number(n) => *n,
            Expr::Ref(index) => resolve(*index),
            Expr::Neg(inner) => -inner.eval(resolve),
            Expr::Binary { op, left, right } => {
                let (l, r) = (left.eval(resolve), right.eval(resolve));
                match op {
                    ArithOp::Add => l + r,
                    ArithOp::Sub => l - r,
                }
            }
        }
    }

    /// 是否含有加減運算 (決定失敗時要不要回報期望值)
    pub fn is_arithmetic(&self) -> bool {
        matches!(self, Expr::Binary { .. })
    }
}

impl Condition {
    pub fn references(&self) -> Vec<usize> {
        let mut refs = Vec::new();
        self.left.collect_refs(&mut refs);
        self.right.collect_refs(&mut refs);
        refs
    }

    /// 檢查所有 DE{n} 都落在規則的資料元素範圍內
    pub fn check_references(&self, available: usize) -> Result<(), ExpressionError> {
        match self.references().into_iter().find(|i| *i > available) {
            Some(index) => Err(ExpressionError::UnknownReference { index, available }),
            None => Ok(()),
        }
    }

    /// `resolve` receives the 1-based reference index.
    pub fn evaluate<F: Fn(usize) -> f64>(&self, resolve: F) -> Evaluation {
        let left = self.left.eval(&resolve);
        let right = self.right.eval(&resolve);
        let passed = match self.op {
            Comparison::Eq => (left - right).abs() < EQUALITY_TOLERANCE,
            Comparison::Lt => left < right,
            Comparison::LtEq => left <= right,
            Comparison::Gt => left > right,
            Comparison::GtEq => left >= right,
        };
        Evaluation {
            passed,
            left,
            right,
        }
    }
}
