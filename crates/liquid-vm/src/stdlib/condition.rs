//! Conditions of `if`, `elsif` and `unless`.
//!
//! `a == b and c or d` parses right-associatively, `a == b and (c or d)`,
//! with no precedence between `and` and `or`.

use std::{cmp::Ordering, sync::LazyLock};

use regex::Regex;

use crate::{
    context::Context,
    error::{LiquidError, ParseResult, RenderResult},
    expression::Expression,
    legacy::{QUOTED_FRAGMENT, compile},
    lexer::TokenType,
    parse_context::ParseContext,
    parser::ExpressionParser,
    value::Value,
};

static WORDS: LazyLock<Regex> = LazyLock::new(|| compile(r#"(?:"[^"]*"|'[^']*'|[^\s"']+)+"#));
static COMPARISON: LazyLock<Regex> =
    LazyLock::new(|| compile(&format!(r"(?s)\A\s*({QUOTED_FRAGMENT})\s*([=!<>a-z_]+)?\s*({QUOTED_FRAGMENT})?")));

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
pub enum Operator {
    #[strum(serialize = "==")]
    Eq,
    #[strum(serialize = "!=", serialize = "<>")]
    Ne,
    #[strum(serialize = "<")]
    Lt,
    #[strum(serialize = ">")]
    Gt,
    #[strum(serialize = "<=")]
    Le,
    #[strum(serialize = ">=")]
    Ge,
    #[strum(serialize = "contains")]
    Contains,
}

impl Operator {
    fn parse(text: &str) -> ParseResult<Self> {
        text.parse()
            .map_err(|_| LiquidError::syntax(format!("Unknown operator {text}")))
    }
}

#[derive(Debug, Clone)]
pub enum Condition {
    /// `left`, or `left op right`.
    Compare {
        left: Expression,
        comparison: Option<(Operator, Expression)>,
    },
    And(Box<Condition>, Box<Condition>),
    Or(Box<Condition>, Box<Condition>),
}

impl Condition {
    /// Parses a condition with the strict grammar, falling back to the lax one.
    pub fn parse(markup: &str, tag: &str, context: &mut ParseContext<'_>) -> ParseResult<Self> {
        let condition = context.parse_markup(markup, strict_parse, |context, markup| {
            lax_parse(markup, tag, context)
        })?;
        condition.prepare(context)
    }

    fn prepare(self, context: &ParseContext<'_>) -> ParseResult<Self> {
        Ok(match self {
            Self::Compare { left, comparison } => Self::Compare {
                left: context.prepare(left)?,
                comparison: match comparison {
                    Some((op, right)) => Some((op, context.prepare(right)?)),
                    None => None,
                },
            },
            Self::And(left, right) => Self::And(Box::new(left.prepare(context)?), Box::new(right.prepare(context)?)),
            Self::Or(left, right) => Self::Or(Box::new(left.prepare(context)?), Box::new(right.prepare(context)?)),
        })
    }

    fn join(self, keyword: &str, right: Self) -> Self {
        if keyword == "and" {
            Self::And(Box::new(self), Box::new(right))
        } else {
            Self::Or(Box::new(self), Box::new(right))
        }
    }

    pub fn evaluate(&self, context: &mut Context<'_>) -> RenderResult<bool> {
        match self {
            Self::Compare { left, comparison: None } => Ok(context.evaluate(left)?.to_liquid().is_truthy()),
            Self::Compare {
                left,
                comparison: Some((op, right)),
            } => {
                let left = context.evaluate(left)?.to_liquid();
                let right = context.evaluate(right)?.to_liquid();
                compare(&left, *op, &right)
            }
            Self::And(left, right) => Ok(left.evaluate(context)? && right.evaluate(context)?),
            Self::Or(left, right) => Ok(left.evaluate(context)? || right.evaluate(context)?),
        }
    }
}

fn compare(left: &Value, op: Operator, right: &Value) -> RenderResult<bool> {
    let ordering = |accept: fn(Ordering) -> bool| -> RenderResult<bool> {
        if !orderable(left) || !orderable(right) {
            return Ok(false);
        }
        match left.liquid_cmp(right) {
            Some(ordering) => Ok(accept(ordering)),
            None => Err(LiquidError::argument(format!(
                "comparison of {} with {} failed",
                left.type_name(),
                right.type_name()
            ))),
        }
    };
    match op {
        Operator::Eq => Ok(left.liquid_eq(right)),
        Operator::Ne => Ok(!left.liquid_eq(right)),
        Operator::Lt => ordering(Ordering::is_lt),
        Operator::Gt => ordering(Ordering::is_gt),
        Operator::Le => ordering(Ordering::is_le),
        Operator::Ge => ordering(Ordering::is_ge),
        Operator::Contains => Ok(contains(left, right)),
    }
}

/// Values that support `<` at all; anything else compares false.
fn orderable(value: &Value) -> bool {
    matches!(value, Value::Int(_) | Value::BigInt(_) | Value::Float(_) | Value::Str(_))
}

fn contains(left: &Value, right: &Value) -> bool {
    if right.is_nil() {
        return false;
    }
    match left {
        Value::Str(s) => s.contains(&*right.to_string()),
        Value::Array(items) => items.iter().any(|item| item.liquid_eq(right)),
        Value::Map(map) => right.as_str().is_some_and(|key| map.contains_key(key)),
        Value::Range(start, end) => right.as_int().is_some_and(|i| (*start..=*end).contains(&i)),
        _ => false,
    }
}

// ============================================================================
// Strict grammar
// ============================================================================

fn strict_parse(markup: &str) -> ParseResult<Condition> {
    let mut parser = ExpressionParser::new(markup)?;
    let condition = parse_chain(&mut parser)?;
    parser.expect_end()?;
    Ok(condition)
}

/// `comparison ((and | or) chain)?`
fn parse_chain(parser: &mut ExpressionParser<'_>) -> ParseResult<Condition> {
    let left = parse_comparison(parser)?;
    for keyword in ["and", "or"] {
        if parser.id(keyword) {
            let right = parse_chain(parser)?;
            return Ok(left.join(keyword, right));
        }
    }
    Ok(left)
}

fn parse_comparison(parser: &mut ExpressionParser<'_>) -> ParseResult<Condition> {
    let left = parser.parse_expression()?;
    let comparison = match parser.consume_optional(TokenType::Comparison) {
        Some(op) => Some((Operator::parse(op)?, parser.parse_expression()?)),
        None => None,
    };
    Ok(Condition::Compare { left, comparison })
}

// ============================================================================
// Lax grammar
// ============================================================================

fn lax_parse(markup: &str, tag: &str, context: &ParseContext<'_>) -> ParseResult<Condition> {
    let syntax_error = || LiquidError::syntax(format!("Syntax Error in tag '{tag}' - Valid syntax: {tag} [expression]"));

    // split into operand groups separated by bare `and` / `or` words
    let mut groups: Vec<(usize, usize)> = Vec::new();
    let mut keywords: Vec<&str> = Vec::new();
    let mut open: Option<(usize, usize)> = None;
    for word in WORDS.find_iter(markup) {
        if matches!(word.as_str(), "and" | "or") {
            groups.push(open.take().ok_or_else(syntax_error)?);
            keywords.push(word.as_str());
        } else {
            open = Some(match open {
                Some((start, _)) => (start, word.end()),
                None => (word.start(), word.end()),
            });
        }
    }
    groups.push(open.ok_or_else(syntax_error)?);

    let mut conditions = groups
        .into_iter()
        .map(|(start, end)| lax_comparison(&markup[start..end], context).ok_or_else(syntax_error)?)
        .collect::<ParseResult<Vec<_>>>()?;
    let mut condition = conditions.pop().ok_or_else(syntax_error)?;
    while let Some(left) = conditions.pop() {
        let keyword = keywords.pop().unwrap_or("and");
        condition = left.join(keyword, condition);
    }
    Ok(condition)
}

fn lax_comparison(text: &str, context: &ParseContext<'_>) -> Option<ParseResult<Condition>> {
    let caps = COMPARISON.captures(text)?;
    let parser = &context.environment().lax_parser;
    let left = parser.lax_parse_expression(&caps[1]);
    let comparison = match caps.get(2) {
        Some(op) => {
            let right = caps.get(3).map_or(Expression::Nil, |m| parser.lax_parse_expression(m.as_str()));
            match Operator::parse(op.as_str()) {
                Ok(op) => Some((op, right)),
                Err(err) => return Some(Err(err)),
            }
        }
        None => None,
    };
    Some(Ok(Condition::Compare { left, comparison }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        filter::FilterRegistry,
        parse_context::{ErrorMode, ParseOptions},
        template::Environment,
        value::Map,
    };

    fn check(markup: &str, assigns: &[(&str, Value)]) -> RenderResult<bool> {
        let environment = Environment::standard();
        let mut parse_context = ParseContext::new(&environment, ParseOptions::default());
        let condition = Condition::parse(markup, "if", &mut parse_context)?;
        let filters = FilterRegistry::new();
        let assigns: Map = assigns.iter().map(|(k, v)| ((*k).to_owned(), v.clone())).collect();
        let mut context = Context::new(&filters).with_assigns(assigns);
        condition.evaluate(&mut context)
    }

    #[test]
    fn comparisons() {
        assert!(check("1 == 1", &[]).unwrap());
        assert!(check("1 <> 2", &[]).unwrap());
        assert!(check("'abc' contains 'b'", &[]).unwrap());
        assert!(check("a contains 2", &[("a", Value::array(vec![Value::from(1), Value::from(2)]))]).unwrap());
        assert!(!check("nil < 1", &[]).unwrap());
        assert!(check("a == empty", &[("a", Value::from(""))]).unwrap());
    }

    #[test]
    fn mixed_comparison_is_an_error() {
        let err = check("1 < 'a'", &[]).unwrap_err();
        assert_eq!(err.message(), "comparison of Integer with String failed");
    }

    #[test]
    fn boolean_operators_bind_to_the_right() {
        // false and (true or true) is false; (false and true) or true would be true
        assert!(!check("false and true or true", &[]).unwrap());
        assert!(check("true or false and false", &[]).unwrap());
    }

    #[test]
    fn lax_fallback_outside_strict_mode() {
        assert!(check("a == 1 ;", &[("a", Value::from(1))]).unwrap());
        let environment = Environment::standard();
        let options = ParseOptions {
            error_mode: ErrorMode::Strict,
            ..ParseOptions::default()
        };
        let mut context = ParseContext::new(&environment, options);
        assert!(Condition::parse("a == 1 ;", "if", &mut context).is_err());
    }

    #[test]
    fn lax_rejects_dangling_keywords() {
        let environment = Environment::standard();
        let context = ParseContext::new(&environment, ParseOptions::default());
        let err = lax_parse("a and", "if", &context).unwrap_err();
        assert_eq!(err.message(), "Syntax Error in tag 'if' - Valid syntax: if [expression]");
    }
}
