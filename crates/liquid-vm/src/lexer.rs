//! Byte lexer for markup inside `{{ }}` and `{% %}`.

use smallvec::SmallVec;

use crate::error::{LiquidError, ParseResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum TokenType {
    Comparison,
    String,
    Number,
    #[strum(serialize = "id")]
    Identifier,
    #[strum(serialize = "dotdot")]
    DotDot,
    Pipe,
    Dot,
    Colon,
    Comma,
    OpenSquare,
    CloseSquare,
    OpenRound,
    CloseRound,
    Question,
    Dash,
    EndOfString,
}

/// A lexed token, borrowing its text from the markup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LexToken<'m> {
    pub ty: TokenType,
    pub text: &'m str,
    /// Whitespace separates this token from the previous one.
    pub space_before: bool,
    /// Whitespace separates this token from the next one.
    pub space_after: bool,
}

pub type LexTokens<'m> = SmallVec<[LexToken<'m>; 16]>;

/// Lexes markup, always ending with an [`TokenType::EndOfString`] token.
pub fn tokenize(markup: &str) -> ParseResult<LexTokens<'_>> {
    let bytes = markup.as_bytes();
    let mut tokens = LexTokens::new();
    let mut pos = 0;
    loop {
        let ws_start = pos;
        while pos < bytes.len() && bytes[pos].is_ascii_whitespace() {
            pos += 1;
        }
        let space_before = pos > ws_start;
        if let Some(last) = tokens.last_mut() {
            last.space_after = space_before;
        }
        if pos >= bytes.len() {
            tokens.push(LexToken {
                ty: TokenType::EndOfString,
                text: "",
                space_before,
                space_after: false,
            });
            return Ok(tokens);
        }
        let (ty, len) = lex_one(markup, pos)?;
        tokens.push(LexToken {
            ty,
            text: &markup[pos..pos + len],
            space_before,
            space_after: false,
        });
        pos += len;
    }
}

fn lex_one(markup: &str, pos: usize) -> ParseResult<(TokenType, usize)> {
    let bytes = &markup.as_bytes()[pos..];
    let c = bytes[0];
    let next = bytes.get(1).copied();
    let token = match c {
        b'=' if next == Some(b'=') => (TokenType::Comparison, 2),
        b'!' if next == Some(b'=') => (TokenType::Comparison, 2),
        b'<' if matches!(next, Some(b'>' | b'=')) => (TokenType::Comparison, 2),
        b'>' if next == Some(b'=') => (TokenType::Comparison, 2),
        b'<' | b'>' => (TokenType::Comparison, 1),
        b'\'' | b'"' => match bytes[1..].iter().position(|&b| b == c) {
            Some(end) => (TokenType::String, end + 2),
            None => return Err(unexpected(markup, pos)),
        },
        b'0'..=b'9' => (TokenType::Number, number_len(bytes)),
        b'-' if next.is_some_and(|b| b.is_ascii_digit()) => (TokenType::Number, 1 + number_len(&bytes[1..])),
        b'a'..=b'z' | b'A'..=b'Z' | b'_' => {
            let mut len = 1 + bytes[1..]
                .iter()
                .take_while(|&&b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
                .count();
            if bytes.get(len) == Some(&b'?') {
                len += 1;
            }
            let is_contains = &bytes[..len] == b"contains" && bytes.get(len).is_some_and(u8::is_ascii_whitespace);
            if is_contains {
                (TokenType::Comparison, len)
            } else {
                (TokenType::Identifier, len)
            }
        }
        b'.' if next == Some(b'.') => (TokenType::DotDot, 2),
        b'.' => (TokenType::Dot, 1),
        b'|' => (TokenType::Pipe, 1),
        b':' => (TokenType::Colon, 1),
        b',' => (TokenType::Comma, 1),
        b'[' => (TokenType::OpenSquare, 1),
        b']' => (TokenType::CloseSquare, 1),
        b'(' => (TokenType::OpenRound, 1),
        b')' => (TokenType::CloseRound, 1),
        b'?' => (TokenType::Question, 1),
        b'-' => (TokenType::Dash, 1),
        _ => return Err(unexpected(markup, pos)),
    };
    Ok(token)
}

/// Length of `[0-9]+(\.[0-9]+)?` at the start of `bytes`.
fn number_len(bytes: &[u8]) -> usize {
    let int_len = bytes.iter().take_while(|b| b.is_ascii_digit()).count();
    if bytes.get(int_len) == Some(&b'.') {
        let frac_len = bytes[int_len + 1..].iter().take_while(|b| b.is_ascii_digit()).count();
        if frac_len > 0 {
            return int_len + 1 + frac_len;
        }
    }
    int_len
}

fn unexpected(markup: &str, pos: usize) -> LiquidError {
    let c = markup[pos..].chars().next().unwrap_or_default();
    LiquidError::syntax(format!("Unexpected character {c}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn types(markup: &str) -> Vec<TokenType> {
        tokenize(markup).unwrap().iter().map(|t| t.ty).collect()
    }

    #[test]
    fn lexes_lookups_and_filters() {
        use TokenType::*;
        assert_eq!(
            types("a.b[1] | f: 'x', k: 2.5"),
            [Identifier, Dot, Identifier, OpenSquare, Number, CloseSquare, Pipe, Identifier, Colon, String, Comma, Identifier, Colon, Number, EndOfString]
        );
    }

    #[test]
    fn ranges_are_not_floats() {
        use TokenType::*;
        assert_eq!(types("(1..-5)"), [OpenRound, Number, DotDot, Number, CloseRound, EndOfString]);
    }

    #[test]
    fn identifiers_allow_hyphens_and_one_question_mark() {
        let tokens = tokenize("a-b question?mark").unwrap();
        let texts: Vec<_> = tokens.iter().map(|t| t.text).collect();
        assert_eq!(texts, ["a-b", "question?", "mark", ""]);
    }

    #[test]
    fn whitespace_flags() {
        let tokens = tokenize("a . b").unwrap();
        assert!(tokens[1].space_before && tokens[1].space_after);
        let tokens = tokenize("a.b").unwrap();
        assert!(!tokens[1].space_before && !tokens[1].space_after);
    }

    #[test]
    fn contains_is_a_comparison_only_before_whitespace() {
        assert_eq!(types("a contains b")[1], TokenType::Comparison);
        assert_eq!(types("contains")[0], TokenType::Identifier);
    }

    #[test]
    fn rejects_unknown_characters() {
        let err = tokenize("test \u{a0} test").unwrap_err();
        assert_eq!(err.message(), "Unexpected character \u{a0}");
        assert!(tokenize("'unterminated").is_err());
        assert!(tokenize("@").is_err());
    }
}
