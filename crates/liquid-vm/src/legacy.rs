//! Legacy, regex-driven tokenizer and lax parser.
//!
//! These are the slow reference implementations the accelerated path falls
//! back to: [`LegacyTokenizer`] when a source exceeds the accelerated
//! tokenizer's byte bound (or the legacy backend is selected), and
//! [`LaxParser`] when strict parsing rejects markup outside strict mode. The
//! lax parser never fails; malformed markup degrades to a best-effort lookup.

use std::{
    fmt,
    sync::{Arc, LazyLock},
};

use regex::Regex;

use crate::{
    expression::{Expression, FilterCall, IntLiteral, LookupSegment, Variable, VariableLookup},
    tokenizer::{RawBody, Token, TokenKind, TokenSource, count_lines, find_raw_end},
    value::COMMAND_NAMES,
};

pub(crate) const QUOTED_FRAGMENT: &str = r#""[^"]*"|'[^']*'|(?:[^\s,\|'"]|"[^"]*"|'[^']*')+"#;

static TEMPLATE_PARSER: LazyLock<Regex> = LazyLock::new(|| compile(r"(?s)\{%.*?%\}|\{\{.*?\}\}?|\{\{|\{%"));
static MARKUP_WITH_QUOTED_FRAGMENT: LazyLock<Regex> =
    LazyLock::new(|| compile(&format!(r"(?s)({QUOTED_FRAGMENT})(.*)")));
static FILTER_MARKUP: LazyLock<Regex> = LazyLock::new(|| compile(r"(?s)\|\s*(.*)"));
static FILTER_PARSER: LazyLock<Regex> = LazyLock::new(|| compile(&format!(r"(?:\s+|{QUOTED_FRAGMENT}|,)+")));
static FILTER_NAME: LazyLock<Regex> = LazyLock::new(|| compile(r"\w+"));
static FILTER_ARGS: LazyLock<Regex> =
    LazyLock::new(|| compile(&format!(r"(?::|,)\s*((?:\w+\s*:\s*)?(?:{QUOTED_FRAGMENT}))")));
static TAG_ATTRIBUTE: LazyLock<Regex> =
    LazyLock::new(|| compile(&format!(r"(?s)\A(\w[\w-]*)\s*:\s*((?:{QUOTED_FRAGMENT}))\z")));
static VARIABLE_PARSER: LazyLock<Regex> = LazyLock::new(|| compile(r"\[[^\]]+\]|[\w-]+\??"));
static RANGE: LazyLock<Regex> = LazyLock::new(|| compile(r"\A\((\S+)\.\.(\S+)\)\z"));
static FLOAT: LazyLock<Regex> = LazyLock::new(|| compile(r"\A-?\d[\d\.]+\z"));

/// Compiles one of the fixed patterns above.
pub(crate) fn compile(pattern: &str) -> Regex {
    Regex::new(pattern).expect("built-in pattern should compile")
}

/// The lax parsing collaborator.
///
/// Installed on an [`Environment`](crate::Environment); the default is
/// [`RegexLaxParser`].
pub trait LaxParser: fmt::Debug + Send + Sync {
    fn lax_parse_expression(&self, markup: &str) -> Expression;

    fn lax_parse_variable(&self, markup: &str) -> Variable;
}

/// Regex implementation of the lax grammar.
#[derive(Debug, Clone, Copy, Default)]
pub struct RegexLaxParser;

impl LaxParser for RegexLaxParser {
    fn lax_parse_expression(&self, markup: &str) -> Expression {
        let markup = markup.trim();
        match markup {
            "" | "nil" | "null" => return Expression::Nil,
            "true" => return Expression::Bool(true),
            "false" => return Expression::Bool(false),
            "blank" | "empty" => return Expression::empty_literal(),
            _ => {}
        }
        let bytes = markup.as_bytes();
        if bytes.len() >= 2 && matches!(bytes[0], b'"' | b'\'') && bytes[bytes.len() - 1] == bytes[0] {
            return Expression::String(Arc::from(&markup[1..markup.len() - 1]));
        }
        if let Some(int) = IntLiteral::parse(markup) {
            return Expression::Int(int);
        }
        if let Some(caps) = RANGE.captures(markup) {
            return Expression::Range(
                Box::new(self.lax_parse_expression(&caps[1])),
                Box::new(self.lax_parse_expression(&caps[2])),
            );
        }
        if FLOAT.is_match(markup) {
            return Expression::Float(float_prefix(markup));
        }
        self.lax_parse_lookup(markup)
    }

    fn lax_parse_variable(&self, markup: &str) -> Variable {
        let Some(caps) = MARKUP_WITH_QUOTED_FRAGMENT.captures(markup) else {
            return Variable::new(Expression::Nil);
        };
        let mut variable = Variable::new(self.lax_parse_expression(&caps[1]));
        let Some(filter_caps) = FILTER_MARKUP.captures(&caps[2]) else {
            return variable;
        };
        let filter_markup = filter_caps.get(1).map_or("", |m| m.as_str());
        for chunk in FILTER_PARSER.find_iter(filter_markup) {
            let chunk = chunk.as_str();
            let Some(name) = FILTER_NAME.find(chunk) else {
                continue;
            };
            let mut filter = FilterCall::new(name.as_str());
            for arg in FILTER_ARGS.captures_iter(&chunk[name.end()..]) {
                let arg = &arg[1];
                if let Some(attr) = TAG_ATTRIBUTE.captures(arg) {
                    filter
                        .keyword_args
                        .insert(attr[1].to_owned(), self.lax_parse_expression(&attr[2]));
                } else {
                    filter.args.push(self.lax_parse_expression(arg));
                }
            }
            variable.filters.push(filter);
        }
        variable
    }
}

impl RegexLaxParser {
    fn lax_parse_lookup(&self, markup: &str) -> Expression {
        let mut parts = VARIABLE_PARSER.find_iter(markup).map(|m| m.as_str());
        let Some(first) = parts.next() else {
            return Expression::Nil;
        };
        let name = match bracket_inner(first) {
            Some(inner) => self.lax_parse_expression(inner),
            None => Expression::String(Arc::from(first)),
        };
        let lookups = parts
            .map(|part| match bracket_inner(part) {
                Some(inner) => LookupSegment::key(self.lax_parse_expression(inner)),
                None if COMMAND_NAMES.contains(&part) => LookupSegment::command(part),
                None => LookupSegment::key(Expression::String(Arc::from(part))),
            })
            .collect();
        Expression::Lookup(Box::new(VariableLookup { name, lookups }))
    }
}

fn bracket_inner(part: &str) -> Option<&str> {
    part.strip_prefix('[').and_then(|p| p.strip_suffix(']'))
}

/// Parses the longest float prefix, e.g. `1.2.3` -> `1.2`.
fn float_prefix(markup: &str) -> f64 {
    let mut seen_dot = false;
    let end = markup
        .char_indices()
        .find(|&(i, c)| match c {
            '-' => i != 0,
            '.' if !seen_dot => {
                seen_dot = true;
                false
            }
            c => !c.is_ascii_digit(),
        })
        .map_or(markup.len(), |(i, _)| i);
    markup[..end].trim_end_matches('.').parse().unwrap_or(0.0)
}

/// Regex-driven tokenizer with no source size bound.
#[derive(Debug, Clone)]
pub struct LegacyTokenizer<'s> {
    source: &'s str,
    start_line: u32,
    for_liquid_tag: bool,
    cursor: usize,
    line: u32,
    strip_next: bool,
    peeked: Option<(Token, (usize, u32, bool))>,
}

impl<'s> LegacyTokenizer<'s> {
    #[must_use]
    pub fn new(source: &'s str, start_line: u32, for_liquid_tag: bool) -> Self {
        Self {
            source,
            start_line,
            for_liquid_tag,
            cursor: 0,
            line: start_line,
            strip_next: false,
            peeked: None,
        }
    }

    fn next_token(&mut self) -> Option<Token> {
        if self.cursor >= self.source.len() {
            return None;
        }
        let start = self.cursor;
        let token = if self.for_liquid_tag {
            let len = self.source[start..].find('\n').unwrap_or(self.source.len() - start);
            self.cursor = (start + len + 1).min(self.source.len());
            Token {
                kind: TokenKind::Tag,
                offset: start,
                len,
                line_number: self.line,
                lstrip: false,
                rstrip: false,
            }
        } else {
            let found = TEMPLATE_PARSER.find_at(self.source, start);
            match found {
                Some(m) if m.start() == start => {
                    let text = m.as_str();
                    let bytes = text.as_bytes();
                    let complete = text.len() >= 4
                        && ((text.starts_with("{%") && text.ends_with("%}"))
                            || (text.starts_with("{{") && text.ends_with("}}")));
                    let kind = match (complete, bytes[1]) {
                        (false, _) => TokenKind::Invalid,
                        (true, b'%') => TokenKind::Tag,
                        (true, _) => TokenKind::Variable,
                    };
                    let lstrip = bytes.get(2) == Some(&b'-');
                    let rstrip = complete && text.len() >= 5 && bytes[text.len() - 3] == b'-';
                    self.strip_next = rstrip;
                    self.cursor = m.end();
                    Token {
                        kind,
                        offset: start,
                        len: text.len(),
                        line_number: self.line,
                        lstrip,
                        rstrip,
                    }
                }
                other => {
                    let end = other.map_or(self.source.len(), |m| m.start());
                    let rstrip = self.source.as_bytes().get(end + 2) == Some(&b'-') && end < self.source.len();
                    self.cursor = end;
                    Token {
                        kind: TokenKind::Text,
                        offset: start,
                        len: end - start,
                        line_number: self.line,
                        lstrip: std::mem::take(&mut self.strip_next),
                        rstrip,
                    }
                }
            }
        };
        self.line += count_lines(&self.source[start..self.cursor]);
        Some(token)
    }
}

impl<'s> TokenSource<'s> for LegacyTokenizer<'s> {
    fn source(&self) -> &'s str {
        self.source
    }

    fn shift(&mut self) -> Option<Token> {
        if let Some((token, _)) = self.peeked.take() {
            return Some(token);
        }
        self.next_token()
    }

    fn peek(&mut self) -> Option<Token> {
        if let Some((token, _)) = self.peeked {
            return Some(token);
        }
        let before = (self.cursor, self.line, self.strip_next);
        let token = self.next_token()?;
        self.peeked = Some((token, before));
        Some(token)
    }

    fn rewind(&mut self) {
        self.peeked = None;
        self.cursor = 0;
        self.line = self.start_line;
        self.strip_next = false;
    }

    fn for_liquid_tag(&self) -> bool {
        self.for_liquid_tag
    }

    fn line_number(&self) -> u32 {
        self.peeked.map_or(self.line, |(_, (_, line, _))| line)
    }

    fn shift_raw_body(&mut self, end_name: &str) -> Option<RawBody<'s>> {
        if let Some((_, (cursor, line, strip_next))) = self.peeked.take() {
            (self.cursor, self.line, self.strip_next) = (cursor, line, strip_next);
        }
        let start = self.cursor;
        let strip_start = std::mem::take(&mut self.strip_next);
        let Some(found) = find_raw_end(self.source, start, end_name) else {
            self.cursor = self.source.len();
            return None;
        };
        let end_line_number = self.line + count_lines(&self.source[start..found.body_end]);
        self.line += count_lines(&self.source[start..found.tag_end]);
        self.cursor = found.tag_end;
        self.strip_next = found.rstrip;
        Some(RawBody {
            body: found.trim(&self.source[start..found.body_end], strip_start),
            end_line_number,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokenizer::Tokenizer;

    fn texts<'s>(mut source: impl TokenSource<'s>) -> Vec<(TokenKind, &'s str)> {
        let mut tokens = Vec::new();
        while let Some(token) = source.shift() {
            tokens.push((token.kind, source.text(&token)));
        }
        tokens
    }

    #[test]
    fn agrees_with_the_accelerated_tokenizer() {
        for source in ["a {{ b }} c {% d -%}  e", "{{ a } b", "x{%", "{{-}}\n{%- if -%}"] {
            assert_eq!(
                texts(LegacyTokenizer::new(source, 1, false)),
                texts(Tokenizer::new(source, 1, false).unwrap()),
                "{source:?}"
            );
        }
    }

    #[test]
    fn lax_variable_with_filters() {
        let variable = RegexLaxParser.lax_parse_variable(" name | f: 'a', key: 1 | g ");
        assert_eq!(variable.expression, Expression::variable("name"));
        assert_eq!(variable.filters.len(), 2);
        assert_eq!(variable.filters[0].args, [Expression::String(Arc::from("a"))]);
        assert!(variable.filters[0].keyword_args.contains_key("key"));
        assert_eq!(variable.filters[1].name, "g");
    }

    #[test]
    fn lax_garbage_becomes_nil() {
        let variable = RegexLaxParser.lax_parse_variable("@!#");
        assert_eq!(variable.expression, Expression::Nil);
        assert!(variable.filters.is_empty());
    }

    #[test]
    fn lax_expressions() {
        assert_eq!(RegexLaxParser.lax_parse_expression("1.2.3"), Expression::Float(1.2));
        assert!(matches!(RegexLaxParser.lax_parse_expression("(1..a)"), Expression::Range(..)));
        let lookup = RegexLaxParser.lax_parse_expression("a . b.size");
        match lookup {
            Expression::Lookup(lookup) => {
                assert_eq!(lookup.lookups.len(), 2);
                assert!(lookup.lookups[1].command);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
