//! Strict recursive-descent parser for expressions and variables.
//!
//! The grammar is total: every input either parses completely or yields a
//! syntax error, never partial state. Tags use [`ExpressionParser`] directly to
//! parse their own markup (conditions, loop headers, assignments).

use std::sync::Arc;

use indexmap::IndexMap;

use crate::{
    error::{LiquidError, ParseResult},
    expression::{Expression, FilterCall, IntLiteral, LookupSegment, Variable, VariableLookup},
    lexer::{self, LexToken, LexTokens, TokenType},
    value::COMMAND_NAMES,
};

/// Parses a complete expression, rejecting trailing input.
pub fn strict_parse_expression(markup: &str) -> ParseResult<Expression> {
    let mut parser = ExpressionParser::new(markup)?;
    let expression = parser.parse_expression()?;
    parser.expect_end()?;
    Ok(expression)
}

/// Parses `expression (| filter (: args)?)*`, rejecting trailing input.
pub fn strict_parse_variable(markup: &str) -> ParseResult<Variable> {
    let mut parser = ExpressionParser::new(markup)?;
    let variable = parser.parse_variable()?;
    parser.expect_end()?;
    Ok(variable)
}

/// Cursor over the lexed tokens of one markup string.
#[derive(Debug, Clone)]
pub struct ExpressionParser<'m> {
    tokens: LexTokens<'m>,
    pos: usize,
}

impl<'m> ExpressionParser<'m> {
    pub fn new(markup: &'m str) -> ParseResult<Self> {
        Ok(Self {
            tokens: lexer::tokenize(markup)?,
            pos: 0,
        })
    }

    fn current(&self) -> LexToken<'m> {
        // the lexer always ends with EndOfString and the cursor never passes it
        self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    /// Whether the token `ahead` positions from the cursor has type `ty`.
    #[must_use]
    pub fn look(&self, ty: TokenType, ahead: usize) -> bool {
        self.tokens.get(self.pos + ahead).is_some_and(|t| t.ty == ty)
    }

    #[must_use]
    pub fn peek_type(&self) -> TokenType {
        self.current().ty
    }

    /// Whether the next token is the identifier `name`.
    #[must_use]
    pub fn look_id(&self, name: &str) -> bool {
        let token = self.current();
        token.ty == TokenType::Identifier && token.text == name
    }

    /// Consumes a token of type `ty` or fails with `Expected ty but found ...`.
    pub fn consume(&mut self, ty: TokenType) -> ParseResult<&'m str> {
        let token = self.current();
        if token.ty != ty {
            return Err(LiquidError::syntax(format!("Expected {ty} but found {}", token.ty)));
        }
        self.advance();
        Ok(token.text)
    }

    pub fn consume_optional(&mut self, ty: TokenType) -> Option<&'m str> {
        let token = self.current();
        (token.ty == ty).then(|| {
            self.advance();
            token.text
        })
    }

    /// Consumes the identifier `name` if it is next.
    pub fn id(&mut self, name: &str) -> bool {
        if self.look_id(name) {
            self.advance();
            true
        } else {
            false
        }
    }

    pub fn expect_end(&self) -> ParseResult<()> {
        let token = self.current();
        if token.ty == TokenType::EndOfString {
            Ok(())
        } else {
            Err(LiquidError::syntax(format!(
                "Expected end_of_string but found {}",
                token.ty
            )))
        }
    }

    fn advance(&mut self) {
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
    }

    pub fn parse_expression(&mut self) -> ParseResult<Expression> {
        let token = self.current();
        match token.ty {
            TokenType::Identifier | TokenType::OpenSquare => self.parse_variable_lookup(),
            TokenType::String => {
                self.advance();
                Ok(Expression::String(Arc::from(&token.text[1..token.text.len() - 1])))
            }
            TokenType::Number => {
                self.advance();
                parse_number(token.text)
            }
            TokenType::OpenRound => {
                self.advance();
                let start = self.parse_expression()?;
                self.consume(TokenType::DotDot)?;
                let end = self.parse_expression()?;
                self.consume(TokenType::CloseRound)?;
                Ok(Expression::Range(Box::new(start), Box::new(end)))
            }
            _ => Err(LiquidError::syntax(format!(
                "{} is not a valid expression",
                if token.text.is_empty() { "end of markup" } else { token.text }
            ))),
        }
    }

    fn parse_variable_lookup(&mut self) -> ParseResult<Expression> {
        let name = if self.consume_optional(TokenType::OpenSquare).is_some() {
            let key = self.parse_expression()?;
            self.consume(TokenType::CloseSquare)?;
            key
        } else {
            let name = self.consume(TokenType::Identifier)?;
            let has_lookups = self.look(TokenType::Dot, 0) || self.look(TokenType::OpenSquare, 0);
            if !has_lookups && let Some(literal) = literal_expression(name) {
                return Ok(literal);
            }
            Expression::String(Arc::from(name))
        };

        let mut lookups = Vec::new();
        loop {
            if self.consume_optional(TokenType::OpenSquare).is_some() {
                let key = self.parse_expression()?;
                self.consume(TokenType::CloseSquare)?;
                lookups.push(LookupSegment::key(key));
            } else if self.look(TokenType::Dot, 0) {
                let dot = self.current();
                if dot.space_before || dot.space_after {
                    return Err(LiquidError::syntax("Unexpected whitespace around dot"));
                }
                self.advance();
                let key = self.consume(TokenType::Identifier)?;
                if COMMAND_NAMES.contains(&key) {
                    lookups.push(LookupSegment::command(key));
                } else {
                    lookups.push(LookupSegment::key(Expression::String(Arc::from(key))));
                }
            } else {
                break;
            }
        }
        Ok(Expression::Lookup(Box::new(VariableLookup { name, lookups })))
    }

    /// Parses an expression followed by its filter pipeline.
    ///
    /// Empty markup yields a `nil` variable with no filters.
    pub fn parse_variable(&mut self) -> ParseResult<Variable> {
        if self.look(TokenType::EndOfString, 0) {
            return Ok(Variable::new(Expression::Nil));
        }
        let expression = self.parse_expression()?;
        let mut filters = Vec::new();
        while self.consume_optional(TokenType::Pipe).is_some() {
            filters.push(self.parse_filter()?);
        }
        Ok(Variable { expression, filters })
    }

    /// Parses `name (: arg (, arg)*)?` after a pipe.
    ///
    /// A single colon introduces the argument list; `name: a: b` is rejected
    /// because the second colon is not a valid continuation.
    pub fn parse_filter(&mut self) -> ParseResult<FilterCall> {
        let name = self.consume(TokenType::Identifier)?;
        let mut filter = FilterCall::new(name);
        if self.consume_optional(TokenType::Colon).is_some() {
            loop {
                self.parse_filter_arg(&mut filter.args, &mut filter.keyword_args)?;
                if self.consume_optional(TokenType::Comma).is_none() {
                    break;
                }
            }
        }
        Ok(filter)
    }

    fn parse_filter_arg(
        &mut self,
        args: &mut Vec<Expression>,
        keyword_args: &mut IndexMap<String, Expression>,
    ) -> ParseResult<()> {
        if self.look(TokenType::Identifier, 0) && self.look(TokenType::Colon, 1) {
            let key = self.consume(TokenType::Identifier)?;
            self.consume(TokenType::Colon)?;
            let value = self.parse_expression()?;
            keyword_args.insert(key.to_owned(), value);
        } else {
            args.push(self.parse_expression()?);
        }
        Ok(())
    }
}

fn literal_expression(name: &str) -> Option<Expression> {
    match name {
        "nil" | "null" => Some(Expression::Nil),
        "true" => Some(Expression::Bool(true)),
        "false" => Some(Expression::Bool(false)),
        "empty" | "blank" => Some(Expression::empty_literal()),
        _ => None,
    }
}

fn parse_number(text: &str) -> ParseResult<Expression> {
    if text.contains('.') {
        return text
            .parse()
            .map(Expression::Float)
            .map_err(|_| LiquidError::syntax(format!("{text} is not a valid number")));
    }
    IntLiteral::parse(text)
        .map(Expression::Int)
        .ok_or_else(|| LiquidError::syntax(format!("{text} is not a valid number")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(expr: &Expression) -> &VariableLookup {
        match expr {
            Expression::Lookup(lookup) => lookup,
            other => panic!("expected lookup, got {other:?}"),
        }
    }

    #[test]
    fn command_and_key_segments_are_structural() {
        let command = strict_parse_expression("obj.size").unwrap();
        assert!(lookup(&command).lookups[0].command);
        let key = strict_parse_expression("obj[\"size\"]").unwrap();
        assert!(!lookup(&key).lookups[0].command);
    }

    #[test]
    fn literal_names_with_lookups_are_variables() {
        let expr = strict_parse_expression("blank.x").unwrap();
        assert_eq!(lookup(&expr).name, Expression::String(Arc::from("blank")));
    }

    #[test]
    fn dynamic_root() {
        let expr = strict_parse_expression("[meta]").unwrap();
        assert!(matches!(lookup(&expr).name, Expression::Lookup(_)));
    }

    #[test]
    fn keyword_arguments_after_positionals() {
        let variable = strict_parse_variable("name | filter1 : a , b : c , d : e").unwrap();
        let filter = &variable.filters[0];
        assert_eq!(filter.args.len(), 1);
        assert_eq!(filter.keyword_args.keys().collect::<Vec<_>>(), ["b", "d"]);
        assert_eq!(filter.total_args(), 3);
    }

    #[test]
    fn rejects_malformed_markup() {
        for markup in [
            "a -b",
            "a- b",
            "a - b",
            "a . b",
            "question?mark",
            "123.foo",
            " | nothing",
            " -..",
            " hello[\"world']\" ",
            "name | filter : a : b : c : d : e",
        ] {
            assert!(strict_parse_variable(markup).is_err(), "{markup:?} should not parse");
        }
    }

    #[test]
    fn accepts_valid_markup() {
        for markup in ["a-b", "a.b", "question?", "a-2", "", "(1..x) | f", "x | f: 1, 2"] {
            assert!(strict_parse_variable(markup).is_ok(), "{markup:?} should parse");
        }
    }

    #[test]
    fn error_messages() {
        let err = strict_parse_variable("a b").unwrap_err();
        assert_eq!(err.message(), "Expected end_of_string but found id");
        let err = strict_parse_expression("|").unwrap_err();
        assert_eq!(err.message(), "| is not a valid expression");
    }
}
