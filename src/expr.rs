//! Filter expressions for aggregation requests.
//!
//! The dashboard filter, the axis restrictions and the ancestor paths of
//! expanded rows are all expressed as one `Expr` tree, which is serialised
//! into request cache keys and fingerprints.
//!
//! The textual form accepts expressions like:
//! - `country == 'DE'`
//! - `revenue > 100 AND channel != 'web'`
//! - `country IN ('DE', 'FR')`
//! - `country NOT IN ('US')`
//! - `(segment IS NULL) OR (segment == 'smb')`
//!
//! ```
//! use livepivot::expr::{parse_expr, eval_expr};
//! use livepivot::PivotValue;
//! use std::collections::HashMap;
//!
//! let expr = parse_expr("country IN ('DE', 'FR') AND revenue >= 10").unwrap();
//! let mut row = HashMap::new();
//! row.insert("country".to_string(), PivotValue::from("FR"));
//! row.insert("revenue".to_string(), PivotValue::Int64(12));
//! assert!(eval_expr(&expr, &row));
//! ```

use crate::error::ExprError;
use crate::value::PivotValue;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// A parsed expression that can be evaluated against a row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Expr {
    /// Compare column to a literal value
    Compare {
        column: String,
        cmp: CompareOp,
        value: PivotValue,
    },
    /// Column value is (or, negated, is not) one of the listed values
    In {
        column: String,
        values: Vec<PivotValue>,
        #[serde(default)]
        negated: bool,
    },
    IsNull { column: String },
    IsNotNull { column: String },
    And { exprs: Vec<Expr> },
    Or { exprs: Vec<Expr> },
    Not { expr: Box<Expr> },
}

/// Comparison operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Eq,      // ==
    Ne,      // !=
    Lt,      // <
    Le,      // <=
    Gt,      // >
    Ge,      // >=
}

impl CompareOp {
    fn symbol(&self) -> &'static str {
        match self {
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        }
    }
}

impl Expr {
    pub fn compare(column: impl Into<String>, cmp: CompareOp, value: impl Into<PivotValue>) -> Self {
        Expr::Compare {
            column: column.into(),
            cmp,
            value: value.into(),
        }
    }

    pub fn eq(column: impl Into<String>, value: impl Into<PivotValue>) -> Self {
        Self::compare(column, CompareOp::Eq, value)
    }

    pub fn in_list(column: impl Into<String>, values: Vec<PivotValue>) -> Self {
        Expr::In {
            column: column.into(),
            values,
            negated: false,
        }
    }

    /// Conjunction of every expression given, flattening nested ANDs.
    /// Returns `None` when nothing is left to filter on.
    pub fn all<I>(exprs: I) -> Option<Expr>
    where
        I: IntoIterator<Item = Expr>,
    {
        let mut flat = Vec::new();
        for expr in exprs {
            match expr {
                Expr::And { exprs } => flat.extend(exprs),
                other => flat.push(other),
            }
        }
        match flat.len() {
            0 => None,
            1 => flat.pop(),
            _ => Some(Expr::And { exprs: flat }),
        }
    }

    /// Disjunction, collapsing the single-element case.
    pub fn any(mut exprs: Vec<Expr>) -> Option<Expr> {
        match exprs.len() {
            0 => None,
            1 => exprs.pop(),
            _ => Some(Expr::Or { exprs }),
        }
    }

    /// `base AND extra...`, where `base` may be absent.
    pub fn merge(base: Option<&Expr>, extra: Vec<Expr>) -> Option<Expr> {
        Self::all(base.cloned().into_iter().chain(extra))
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Compare { column, cmp, value } => {
                write!(f, "{} {} {}", column, cmp.symbol(), literal(value))
            }
            Expr::In { column, values, negated } => {
                let list: Vec<String> = values.iter().map(literal).collect();
                let keyword = if *negated { "NOT IN" } else { "IN" };
                write!(f, "{} {} ({})", column, keyword, list.join(", "))
            }
            Expr::IsNull { column } => write!(f, "{} IS NULL", column),
            Expr::IsNotNull { column } => write!(f, "{} IS NOT NULL", column),
            Expr::And { exprs } => join_exprs(f, exprs, " AND "),
            Expr::Or { exprs } => join_exprs(f, exprs, " OR "),
            Expr::Not { expr } => write!(f, "NOT ({})", expr),
        }
    }
}

fn join_exprs(f: &mut fmt::Formatter<'_>, exprs: &[Expr], sep: &str) -> fmt::Result {
    let parts: Vec<String> = exprs.iter().map(|e| format!("({})", e)).collect();
    write!(f, "{}", parts.join(sep))
}

fn literal(value: &PivotValue) -> String {
    match value {
        PivotValue::String(s) => format!("'{}'", s.replace('\'', "\\'")),
        PivotValue::Null => "NULL".to_string(),
        other => other.to_string(),
    }
}

/// Token types for lexing
#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Int(i64),
    Float(f64),
    String(String),
    Bool(bool),
    Null,
    // Operators
    Eq,       // ==
    Ne,       // !=
    Lt,       // <
    Le,       // <=
    Gt,       // >
    Ge,       // >=
    And,
    Or,
    Not,
    Is,
    In,
    Comma,
    LParen,
    RParen,
    Eof,
}

/// Lexer for tokenizing expression strings
struct Lexer {
    input: Vec<char>,
    pos: usize,
}

impl Lexer {
    fn new(input: &str) -> Self {
        Lexer {
            input: input.chars().collect(),
            pos: 0,
        }
    }

    fn peek(&self) -> Option<char> {
        self.input.get(self.pos).copied()
    }

    fn advance(&mut self) -> Option<char> {
        let c = self.peek();
        self.pos += 1;
        c
    }

    fn skip_whitespace(&mut self) {
        while let Some(c) = self.peek() {
            if c.is_whitespace() {
                self.advance();
            } else {
                break;
            }
        }
    }

    fn read_ident(&mut self) -> String {
        let mut ident = String::new();
        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' || c == '.' {
                ident.push(c);
                self.advance();
            } else {
                break;
            }
        }
        ident
    }

    fn read_number(&mut self) -> Token {
        let mut num_str = String::new();
        let mut is_float = false;

        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                num_str.push(c);
                self.advance();
            } else if c == '.' && !is_float {
                is_float = true;
                num_str.push(c);
                self.advance();
            } else {
                break;
            }
        }

        if is_float {
            Token::Float(num_str.parse().unwrap_or(0.0))
        } else {
            Token::Int(num_str.parse().unwrap_or(0))
        }
    }

    fn read_string(&mut self, quote: char) -> Result<Token, ExprError> {
        self.advance(); // opening quote
        let mut s = String::new();

        while let Some(c) = self.peek() {
            if c == quote {
                self.advance();
                return Ok(Token::String(s));
            } else if c == '\\' {
                self.advance();
                if let Some(escaped) = self.advance() {
                    match escaped {
                        'n' => s.push('\n'),
                        't' => s.push('\t'),
                        _ => s.push(escaped),
                    }
                }
            } else {
                s.push(c);
                self.advance();
            }
        }

        Err(ExprError::UnterminatedString)
    }

    fn two_char(&mut self, second: char, matched: Token, single: Token) -> Token {
        self.advance();
        if self.peek() == Some(second) {
            self.advance();
            matched
        } else {
            single
        }
    }

    fn next_token(&mut self) -> Result<Token, ExprError> {
        self.skip_whitespace();

        let c = match self.peek() {
            None => return Ok(Token::Eof),
            Some(c) => c,
        };

        match c {
            '(' => { self.advance(); Ok(Token::LParen) }
            ')' => { self.advance(); Ok(Token::RParen) }
            ',' => { self.advance(); Ok(Token::Comma) }
            // Single = also means ==
            '=' => Ok(self.two_char('=', Token::Eq, Token::Eq)),
            '!' => Ok(self.two_char('=', Token::Ne, Token::Not)),
            '<' => Ok(self.two_char('=', Token::Le, Token::Lt)),
            '>' => Ok(self.two_char('=', Token::Ge, Token::Gt)),
            '\'' | '"' => self.read_string(c),
            '-' if self.input.get(self.pos + 1).map_or(false, |c| c.is_ascii_digit() || *c == '.') => {
                self.advance();
                match self.read_number() {
                    Token::Int(v) => Ok(Token::Int(-v)),
                    Token::Float(v) => Ok(Token::Float(-v)),
                    other => Ok(other),
                }
            }
            _ if c.is_ascii_digit() => Ok(self.read_number()),
            _ if c.is_alphabetic() || c == '_' => {
                let ident = self.read_ident();
                match ident.to_uppercase().as_str() {
                    "AND" => Ok(Token::And),
                    "OR" => Ok(Token::Or),
                    "NOT" => Ok(Token::Not),
                    "IS" => Ok(Token::Is),
                    "IN" => Ok(Token::In),
                    "NULL" => Ok(Token::Null),
                    "TRUE" => Ok(Token::Bool(true)),
                    "FALSE" => Ok(Token::Bool(false)),
                    _ => Ok(Token::Ident(ident)),
                }
            }
            _ => Err(ExprError::UnexpectedChar(c)),
        }
    }
}

/// Parser for building expression AST
struct Parser {
    lexer: Lexer,
    current: Token,
}

impl Parser {
    fn new(input: &str) -> Result<Self, ExprError> {
        let mut lexer = Lexer::new(input);
        let current = lexer.next_token()?;
        Ok(Parser { lexer, current })
    }

    fn advance(&mut self) -> Result<(), ExprError> {
        self.current = self.lexer.next_token()?;
        Ok(())
    }

    fn unexpected(&self, expected: &str) -> ExprError {
        ExprError::Expected {
            expected: expected.to_string(),
            found: format!("{:?}", self.current),
        }
    }

    fn expect(&mut self, expected: &Token) -> Result<(), ExprError> {
        if &self.current == expected {
            self.advance()
        } else {
            Err(self.unexpected(&format!("{:?}", expected)))
        }
    }

    fn parse(&mut self) -> Result<Expr, ExprError> {
        self.parse_or()
    }

    /// OR has the lowest precedence
    fn parse_or(&mut self) -> Result<Expr, ExprError> {
        let mut terms = vec![self.parse_and()?];
        while self.current == Token::Or {
            self.advance()?;
            terms.push(self.parse_and()?);
        }
        Ok(if terms.len() == 1 { terms.remove(0) } else { Expr::Or { exprs: terms } })
    }

    fn parse_and(&mut self) -> Result<Expr, ExprError> {
        let mut terms = vec![self.parse_not()?];
        while self.current == Token::And {
            self.advance()?;
            terms.push(self.parse_not()?);
        }
        Ok(if terms.len() == 1 { terms.remove(0) } else { Expr::And { exprs: terms } })
    }

    fn parse_not(&mut self) -> Result<Expr, ExprError> {
        if self.current == Token::Not {
            self.advance()?;
            let expr = self.parse_not()?;
            Ok(Expr::Not { expr: Box::new(expr) })
        } else {
            self.parse_comparison()
        }
    }

    fn parse_literal(&mut self) -> Result<PivotValue, ExprError> {
        let value = match &self.current {
            Token::Int(n) => PivotValue::Int64(*n),
            Token::Float(f) => PivotValue::Float64(*f),
            Token::String(s) => PivotValue::String(s.clone()),
            Token::Bool(b) => PivotValue::Bool(*b),
            Token::Null => PivotValue::Null,
            _ => return Err(self.unexpected("literal value")),
        };
        self.advance()?;
        Ok(value)
    }

    fn parse_list(&mut self) -> Result<Vec<PivotValue>, ExprError> {
        self.expect(&Token::LParen)?;
        let mut values = Vec::new();
        if self.current != Token::RParen {
            values.push(self.parse_literal()?);
            while self.current == Token::Comma {
                self.advance()?;
                values.push(self.parse_literal()?);
            }
        }
        self.expect(&Token::RParen)?;
        Ok(values)
    }

    fn parse_comparison(&mut self) -> Result<Expr, ExprError> {
        if self.current == Token::LParen {
            self.advance()?;
            let expr = self.parse()?;
            self.expect(&Token::RParen)?;
            return Ok(expr);
        }

        let column = match &self.current {
            Token::Ident(name) => name.clone(),
            _ => return Err(self.unexpected("column name")),
        };
        self.advance()?;

        match self.current {
            Token::Is => {
                self.advance()?;
                let negated = if self.current == Token::Not {
                    self.advance()?;
                    true
                } else {
                    false
                };
                self.expect(&Token::Null)?;
                return Ok(if negated {
                    Expr::IsNotNull { column }
                } else {
                    Expr::IsNull { column }
                });
            }
            Token::In => {
                self.advance()?;
                let values = self.parse_list()?;
                return Ok(Expr::In { column, values, negated: false });
            }
            Token::Not => {
                self.advance()?;
                if self.current != Token::In {
                    return Err(self.unexpected("IN after NOT"));
                }
                self.advance()?;
                let values = self.parse_list()?;
                return Ok(Expr::In { column, values, negated: true });
            }
            _ => {}
        }

        let cmp = match &self.current {
            Token::Eq => CompareOp::Eq,
            Token::Ne => CompareOp::Ne,
            Token::Lt => CompareOp::Lt,
            Token::Le => CompareOp::Le,
            Token::Gt => CompareOp::Gt,
            Token::Ge => CompareOp::Ge,
            _ => return Err(self.unexpected("comparison operator")),
        };
        self.advance()?;

        let value = self.parse_literal()?;
        Ok(Expr::Compare { column, cmp, value })
    }
}

/// Parse an expression string into an Expr AST.
pub fn parse_expr(input: &str) -> Result<Expr, ExprError> {
    let mut parser = Parser::new(input)?;
    let expr = parser.parse()?;

    if parser.current != Token::Eof {
        return Err(ExprError::TrailingInput(format!("{:?}", parser.current)));
    }

    Ok(expr)
}

/// Evaluate an expression against a row.
pub fn eval_expr(expr: &Expr, row: &HashMap<String, PivotValue>) -> bool {
    match expr {
        Expr::Compare { column, cmp, value } => match row.get(column) {
            None => false,
            Some(col_val) => compare_values(col_val, cmp, value),
        },
        Expr::In { column, values, negated } => {
            let found = match row.get(column) {
                None | Some(PivotValue::Null) => values.iter().any(|v| v.is_null()),
                Some(col_val) => values.iter().any(|v| col_val.loosely_equals(v)),
            };
            found != *negated
        }
        Expr::IsNull { column } => {
            matches!(row.get(column), Some(PivotValue::Null) | None)
        }
        Expr::IsNotNull { column } => !matches!(row.get(column), Some(PivotValue::Null) | None),
        Expr::And { exprs } => exprs.iter().all(|e| eval_expr(e, row)),
        Expr::Or { exprs } => exprs.iter().any(|e| eval_expr(e, row)),
        Expr::Not { expr } => !eval_expr(expr, row),
    }
}

/// Compare a column value to a literal value.
fn compare_values(col_val: &PivotValue, op: &CompareOp, lit_val: &PivotValue) -> bool {
    match (col_val, lit_val) {
        // Any comparison involving NULL is treated as false; use IS NULL.
        (PivotValue::Null, _) | (_, PivotValue::Null) => false,

        (PivotValue::String(a), PivotValue::String(b)) => compare_ord(a.as_str(), b.as_str(), op),

        (PivotValue::Bool(a), PivotValue::Bool(b)) => match op {
            CompareOp::Eq => a == b,
            CompareOp::Ne => a != b,
            _ => false,
        },

        (PivotValue::Int64(a), PivotValue::Int64(b)) => compare_ord(*a, *b, op),

        (a, b) => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => compare_ord(x, y, op),
            // Type mismatches never match
            _ => false,
        },
    }
}

fn compare_ord<T: PartialOrd>(a: T, b: T, op: &CompareOp) -> bool {
    match op {
        CompareOp::Eq => a == b,
        CompareOp::Ne => a != b,
        CompareOp::Lt => a < b,
        CompareOp::Le => a <= b,
        CompareOp::Gt => a > b,
        CompareOp::Ge => a >= b,
    }
}

/// Extract all column names referenced in an expression.
pub fn extract_columns(expr: &Expr) -> Vec<String> {
    let mut columns = Vec::new();
    extract_columns_recursive(expr, &mut columns);
    columns.sort();
    columns.dedup();
    columns
}

fn extract_columns_recursive(expr: &Expr, columns: &mut Vec<String>) {
    match expr {
        Expr::Compare { column, .. }
        | Expr::In { column, .. }
        | Expr::IsNull { column }
        | Expr::IsNotNull { column } => columns.push(column.clone()),
        Expr::And { exprs } | Expr::Or { exprs } => {
            for e in exprs {
                extract_columns_recursive(e, columns);
            }
        }
        Expr::Not { expr } => extract_columns_recursive(expr, columns),
    }
}
