//! Parsed expressions, variables and filter invocations.

use std::{fmt, sync::Arc};

use indexmap::IndexMap;
use num_bigint::BigInt;

use crate::{
    bytecode::{Code, Compiler},
    error::ParseResult,
    legacy::{LaxParser, RegexLaxParser},
    parser,
    value::Value,
};

/// Longest literal (digits only) parsed into the machine-width integer variant.
const SMALL_INT_MAX_DIGITS: usize = 18;

/// An integer literal, split by literal length into a fast and a boxed path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntLiteral {
    Small(i64),
    Big(Box<BigInt>),
}

impl IntLiteral {
    /// Parses `-?[0-9]+`. Returns `None` for anything else.
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        let digits = text.strip_prefix('-').unwrap_or(text);
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        if digits.len() <= SMALL_INT_MAX_DIGITS {
            text.parse().ok().map(Self::Small)
        } else {
            text.parse().ok().map(|big| Self::Big(Box::new(big)))
        }
    }

    #[must_use]
    pub fn to_value(&self) -> Value {
        match self {
            Self::Small(i) => Value::Int(*i),
            Self::Big(big) => Value::from_bigint(big.as_ref().clone()),
        }
    }
}

/// One `.name` or `[expr]` step of a variable lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct LookupSegment {
    pub key: Expression,
    /// Dispatched as a capability call (`.size`) rather than a key access.
    pub command: bool,
}

impl LookupSegment {
    #[must_use]
    pub fn key(key: Expression) -> Self {
        Self { key, command: false }
    }

    #[must_use]
    pub fn command(name: &str) -> Self {
        Self {
            key: Expression::String(Arc::from(name)),
            command: true,
        }
    }
}

/// `name.a[b].size`: a root name followed by lookup segments.
#[derive(Debug, Clone, PartialEq)]
pub struct VariableLookup {
    /// Root name; a string literal for `name`, any expression for `[expr]`.
    pub name: Expression,
    pub lookups: Vec<LookupSegment>,
}

/// An expression compiled to a standalone program ending in `leave`.
///
/// Keeps its source so it can still be lowered inline into an enclosing program.
pub struct CompiledExpression {
    source: Expression,
    code: Code,
}

impl CompiledExpression {
    #[must_use]
    pub fn source(&self) -> &Expression {
        &self.source
    }

    #[must_use]
    pub fn code(&self) -> &Code {
        &self.code
    }

    /// Bytecode listing of the program.
    #[must_use]
    pub fn disassemble(&self) -> String {
        self.code.disassemble()
    }
}

impl fmt::Debug for CompiledExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledExpression").field("source", &self.source).finish_non_exhaustive()
    }
}

impl PartialEq for CompiledExpression {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

/// A parsed expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    Nil,
    Bool(bool),
    Int(IntLiteral),
    Float(f64),
    /// String literal. `empty` and `blank` share [`Value::empty_literal`].
    String(Arc<str>),
    Range(Box<Expression>, Box<Expression>),
    Lookup(Box<VariableLookup>),
    Compiled(Arc<CompiledExpression>),
}

impl Expression {
    /// Parses with the strict grammar, falling back to the lax parser on a syntax error.
    ///
    /// Used for constant sub-expressions and tag arguments where no fallback
    /// telemetry is wanted.
    #[must_use]
    pub fn parse(markup: &str) -> Self {
        parser::strict_parse_expression(markup).unwrap_or_else(|_| RegexLaxParser.lax_parse_expression(markup))
    }

    /// Parses with the strict grammar only.
    pub fn strict_parse(markup: &str) -> ParseResult<Self> {
        parser::strict_parse_expression(markup)
    }

    /// A lookup of a plain variable name.
    #[must_use]
    pub fn variable(name: &str) -> Self {
        Self::Lookup(Box::new(VariableLookup {
            name: Self::String(Arc::from(name)),
            lookups: Vec::new(),
        }))
    }

    /// The `empty`/`blank` literal.
    #[must_use]
    pub fn empty_literal() -> Self {
        Self::String(Value::empty_literal_str())
    }

    /// Whether the expression evaluates without a context.
    #[must_use]
    pub fn is_constant(&self) -> bool {
        match self {
            Self::Nil | Self::Bool(_) | Self::Int(_) | Self::Float(_) | Self::String(_) => true,
            Self::Range(start, end) => start.is_constant() && end.is_constant(),
            Self::Lookup(_) | Self::Compiled(_) => false,
        }
    }

    /// The value of a constant expression, `None` for anything needing a context.
    ///
    /// Ranges fold only when both bounds are integers.
    #[must_use]
    pub fn constant_value(&self) -> Option<Value> {
        match self {
            Self::Nil => Some(Value::Nil),
            Self::Bool(b) => Some(Value::Bool(*b)),
            Self::Int(i) => Some(i.to_value()),
            Self::Float(f) => Some(Value::Float(*f)),
            Self::String(s) => Some(Value::Str(Arc::clone(s))),
            Self::Range(start, end) => match (start.constant_value()?, end.constant_value()?) {
                (Value::Int(a), Value::Int(b)) => Some(Value::Range(a, b)),
                _ => None,
            },
            Self::Lookup(_) | Self::Compiled(_) => None,
        }
    }

    /// Compiles a non-constant expression into a [`Expression::Compiled`] program.
    ///
    /// Constants and already compiled expressions are returned unchanged.
    pub fn compile(self) -> ParseResult<Self> {
        if self.constant_value().is_some() || matches!(self, Self::Compiled(_)) {
            return Ok(self);
        }
        let mut compiler = Compiler::for_expression();
        compiler.add_evaluate_expression(&self)?;
        let code = compiler.finish();
        Ok(Self::Compiled(Arc::new(CompiledExpression { source: self, code })))
    }

    /// The expression with any compiled wrapper removed.
    #[must_use]
    pub fn source(&self) -> &Self {
        match self {
            Self::Compiled(compiled) => &compiled.source,
            other => other,
        }
    }
}

/// A filter application in a pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterCall {
    pub name: String,
    pub args: Vec<Expression>,
    /// Keyword arguments; unique keys in first-appearance order.
    pub keyword_args: IndexMap<String, Expression>,
}

impl FilterCall {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
            keyword_args: IndexMap::new(),
        }
    }

    /// Argument count as a filter sees it: input, positionals and the keyword map.
    #[must_use]
    pub fn total_args(&self) -> usize {
        1 + self.args.len() + usize::from(!self.keyword_args.is_empty())
    }
}

/// The content of `{{ ... }}`: an expression followed by a filter pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    pub expression: Expression,
    pub filters: Vec<FilterCall>,
}

impl Variable {
    #[must_use]
    pub fn new(expression: Expression) -> Self {
        Self {
            expression,
            filters: Vec::new(),
        }
    }

    /// Parses with the strict grammar, falling back to the lax parser.
    #[must_use]
    pub fn parse(markup: &str) -> Self {
        parser::strict_parse_variable(markup).unwrap_or_else(|_| RegexLaxParser.lax_parse_variable(markup))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_literal_tiers_follow_length() {
        assert_eq!(IntLiteral::parse("-42"), Some(IntLiteral::Small(-42)));
        assert!(matches!(IntLiteral::parse("1234567890123456789"), Some(IntLiteral::Big(_))));
        assert_eq!(IntLiteral::parse("4-2"), None);
        assert_eq!(IntLiteral::parse("-"), None);
    }

    #[test]
    fn constant_ranges_fold() {
        let range = Expression::strict_parse("(1..2)").unwrap();
        assert!(matches!(range.constant_value(), Some(Value::Range(1, 2))));
        let dynamic = Expression::strict_parse("(1..var)").unwrap();
        assert!(dynamic.constant_value().is_none());
    }

    #[test]
    fn empty_and_blank_share_one_value() {
        let empty = Expression::strict_parse("empty").unwrap();
        let blank = Expression::strict_parse("blank").unwrap();
        match (empty, blank) {
            (Expression::String(a), Expression::String(b)) => assert!(Arc::ptr_eq(&a, &b)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn parse_falls_back_to_lax() {
        let expr = Expression::parse("a . b");
        assert!(matches!(expr, Expression::Lookup(_)));
    }
}
