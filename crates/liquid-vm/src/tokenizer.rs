//! Splits template source into text and markup tokens.
//!
//! Tokens are byte ranges into the immutable source buffer; nothing is copied
//! while scanning. The tokenizer is lazy: [`Tokenizer::shift`] scans exactly
//! one token, [`Tokenizer::peek`] looks ahead without consuming, and
//! [`Tokenizer::rewind`] restarts from the beginning.
//!
//! Two modes exist. The default mode scans for `{{ }}` and `{% %}` delimiter
//! pairs. The liquid-tag mode, used for the body of a `{% liquid %}` tag,
//! yields one tag token per newline-separated line.

use std::str;

use crate::error::{ErrorKind, LiquidError, ParseResult};

/// Largest source the tokenizer accepts, `2^24 - 1` bytes.
pub const MAX_SOURCE_BYTE_SIZE: usize = (1 << 24) - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum TokenKind {
    /// Raw text between markup.
    Text,
    /// `{% ... %}` markup, or one line in liquid-tag mode.
    Tag,
    /// `{{ ... }}` markup.
    Variable,
    /// Markup whose closing delimiter is missing or incomplete.
    Invalid,
}

/// A byte range of the source, classified.
///
/// For markup tokens `lstrip`/`rstrip` record the token's own `{%-`/`-%}`
/// markers. For text tokens they record whether the neighbouring markup asked
/// for this text's leading or trailing whitespace to be removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub offset: usize,
    pub len: usize,
    /// 1-based line on which the token starts.
    pub line_number: u32,
    pub lstrip: bool,
    pub rstrip: bool,
}

impl Token {
    #[must_use]
    pub fn is_markup(&self) -> bool {
        !matches!(self.kind, TokenKind::Text)
    }

    #[must_use]
    pub fn end(&self) -> usize {
        self.offset + self.len
    }
}

/// Body of a raw-style block and where its closing tag ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawBody<'s> {
    pub body: &'s str,
    /// Line of the closing tag.
    pub end_line_number: u32,
}

/// Common interface of the accelerated and the legacy tokenizer.
///
/// The block parser drives either implementation through this trait.
pub trait TokenSource<'s> {
    fn source(&self) -> &'s str;

    /// Consumes and returns the next token.
    fn shift(&mut self) -> Option<Token>;

    /// Returns the next token without consuming it.
    fn peek(&mut self) -> Option<Token>;

    /// Restarts the scan at the beginning of the source.
    fn rewind(&mut self);

    fn for_liquid_tag(&self) -> bool;

    /// Line the scanner is currently on.
    fn line_number(&self) -> u32;

    /// Consumes everything up to and including the closing `{% end_name %}` tag.
    ///
    /// Returns `None` when the closing tag never appears, leaving the
    /// tokenizer exhausted.
    fn shift_raw_body(&mut self, end_name: &str) -> Option<RawBody<'s>>;

    /// Full text of the token, delimiters included.
    fn text(&self, token: &Token) -> &'s str {
        &self.source()[token.offset..token.end()]
    }

    /// Text of the token with delimiters, trim markers and requested whitespace removed.
    fn trimmed_text(&self, token: &Token) -> &'s str {
        trimmed_token_text(self.source(), token, self.for_liquid_tag())
    }

    /// Consumes the next token and returns its trimmed text.
    fn shift_trimmed(&mut self) -> Option<(Token, &'s str)> {
        let token = self.shift()?;
        Some((token, self.trimmed_text(&token)))
    }
}

/// The accelerated tokenizer.
#[derive(Debug, Clone)]
pub struct Tokenizer<'s> {
    source: &'s str,
    start_line: u32,
    for_liquid_tag: bool,
    state: ScanState,
    /// Token scanned by `peek` plus the state to restore if it is not consumed.
    peeked: Option<(Token, ScanState)>,
}

#[derive(Debug, Clone, Copy)]
struct ScanState {
    cursor: usize,
    line: u32,
    /// The previous markup ended with `-%}` or `-}}`.
    strip_next: bool,
}

impl<'s> Tokenizer<'s> {
    /// Creates a tokenizer, failing with `SourceTooLarge` past [`MAX_SOURCE_BYTE_SIZE`].
    pub fn new(source: &'s str, start_line: u32, for_liquid_tag: bool) -> ParseResult<Self> {
        check_source_size(source.len())?;
        Ok(Self {
            source,
            start_line,
            for_liquid_tag,
            state: ScanState {
                cursor: 0,
                line: start_line,
                strip_next: false,
            },
            peeked: None,
        })
    }

    /// Creates a tokenizer over raw bytes, validating that they are UTF-8.
    ///
    /// The size check runs first so oversized input is rejected without a scan.
    pub fn from_bytes(source: &'s [u8], start_line: u32, for_liquid_tag: bool) -> ParseResult<Self> {
        check_source_size(source.len())?;
        let source = str::from_utf8(source).map_err(|err| {
            LiquidError::new(
                ErrorKind::Encoding,
                format!(
                    "non-UTF8 encoded source (invalid byte at offset {}) not supported",
                    err.valid_up_to()
                ),
            )
        })?;
        Self::new(source, start_line, for_liquid_tag)
    }

    fn next_token(&mut self) -> Option<Token> {
        if self.state.cursor >= self.source.len() {
            return None;
        }
        if self.for_liquid_tag {
            return Some(self.next_line_token());
        }
        let bytes = self.source.as_bytes();
        let start = self.state.cursor;
        let line = self.state.line;
        let token = if let Some(kind) = markup_start(bytes, start) {
            let end = match kind {
                TokenKind::Variable => scan_variable_end(bytes, start),
                _ => scan_tag_end(bytes, start),
            };
            let (kind, end) = match end {
                Some((end, true)) => (kind, end),
                Some((end, false)) => (TokenKind::Invalid, end),
                None => (TokenKind::Invalid, start + 2),
            };
            let lstrip = bytes.get(start + 2) == Some(&b'-');
            let rstrip = kind != TokenKind::Invalid && end - start >= 5 && bytes[end - 3] == b'-';
            self.state.strip_next = rstrip;
            Token {
                kind,
                offset: start,
                len: end - start,
                line_number: line,
                lstrip,
                rstrip,
            }
        } else {
            let end = find_markup(bytes, start).unwrap_or(bytes.len());
            let lstrip = std::mem::take(&mut self.state.strip_next);
            let rstrip = end < bytes.len() && bytes.get(end + 2) == Some(&b'-');
            Token {
                kind: TokenKind::Text,
                offset: start,
                len: end - start,
                line_number: line,
                lstrip,
                rstrip,
            }
        };
        self.state.cursor = token.end();
        self.state.line += count_lines(&self.source[start..token.end()]);
        Some(token)
    }

    fn next_line_token(&mut self) -> Token {
        let start = self.state.cursor;
        let rest = &self.source[start..];
        let (len, advance) = match rest.find('\n') {
            Some(pos) => (pos, pos + 1),
            None => (rest.len(), rest.len()),
        };
        let token = Token {
            kind: TokenKind::Tag,
            offset: start,
            len,
            line_number: self.state.line,
            lstrip: false,
            rstrip: false,
        };
        self.state.cursor += advance;
        if advance > len {
            self.state.line += 1;
        }
        token
    }

    fn discard_peek(&mut self) {
        if let Some((_, before)) = self.peeked.take() {
            self.state = before;
        }
    }
}

impl<'s> TokenSource<'s> for Tokenizer<'s> {
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
        let before = self.state;
        let token = self.next_token()?;
        self.peeked = Some((token, before));
        Some(token)
    }

    fn rewind(&mut self) {
        self.peeked = None;
        self.state = ScanState {
            cursor: 0,
            line: self.start_line,
            strip_next: false,
        };
    }

    fn for_liquid_tag(&self) -> bool {
        self.for_liquid_tag
    }

    fn line_number(&self) -> u32 {
        self.peeked.map_or(self.state.line, |(_, before)| before.line)
    }

    fn shift_raw_body(&mut self, end_name: &str) -> Option<RawBody<'s>> {
        self.discard_peek();
        let start = self.state.cursor;
        let strip_start = std::mem::take(&mut self.state.strip_next);
        let Some(found) = find_raw_end(self.source, start, end_name) else {
            self.state.cursor = self.source.len();
            return None;
        };
        let end_line_number = self.state.line + count_lines(&self.source[start..found.body_end]);
        self.state.line += count_lines(&self.source[start..found.tag_end]);
        self.state.cursor = found.tag_end;
        self.state.strip_next = found.rstrip;
        Some(RawBody {
            body: found.trim(&self.source[start..found.body_end], strip_start),
            end_line_number,
        })
    }
}

impl Iterator for Tokenizer<'_> {
    type Item = Token;

    fn next(&mut self) -> Option<Token> {
        self.shift()
    }
}

pub(crate) fn check_source_size(len: usize) -> ParseResult<()> {
    if len > MAX_SOURCE_BYTE_SIZE {
        return Err(LiquidError::new(
            ErrorKind::SourceTooLarge,
            format!("Source too large, max {MAX_SOURCE_BYTE_SIZE} bytes"),
        ));
    }
    Ok(())
}

pub(crate) fn count_lines(text: &str) -> u32 {
    u32::try_from(text.bytes().filter(|&b| b == b'\n').count()).unwrap_or(u32::MAX)
}

/// Returns the markup kind if a `{{` or `{%` opens at `pos`.
fn markup_start(bytes: &[u8], pos: usize) -> Option<TokenKind> {
    if bytes.get(pos) != Some(&b'{') {
        return None;
    }
    match bytes.get(pos + 1) {
        Some(b'{') => Some(TokenKind::Variable),
        Some(b'%') => Some(TokenKind::Tag),
        _ => None,
    }
}

/// Offset of the next `{{` or `{%` at or after `from`.
fn find_markup(bytes: &[u8], from: usize) -> Option<usize> {
    (from..bytes.len().saturating_sub(1)).find(|&i| markup_start(bytes, i).is_some())
}

/// End of a `{{` token: `(end, complete)`.
///
/// A single `}` ends the token as incomplete, unless it is the final byte;
/// then nothing ends the markup and the token is just the opening `{{`.
fn scan_variable_end(bytes: &[u8], start: usize) -> Option<(usize, bool)> {
    let close = (start + 2..bytes.len().saturating_sub(1)).find(|&i| bytes[i] == b'}')?;
    if bytes.get(close + 1) == Some(&b'}') {
        Some((close + 2, true))
    } else {
        Some((close + 1, false))
    }
}

fn scan_tag_end(bytes: &[u8], start: usize) -> Option<(usize, bool)> {
    let close = (start + 2..bytes.len().saturating_sub(1)).find(|&i| bytes[i] == b'%' && bytes[i + 1] == b'}')?;
    Some((close + 2, true))
}

/// Text of a token with delimiters and trim markers removed.
pub(crate) fn trimmed_token_text<'s>(source: &'s str, token: &Token, for_liquid_tag: bool) -> &'s str {
    let text = &source[token.offset..token.end()];
    if for_liquid_tag {
        return text.trim();
    }
    match token.kind {
        TokenKind::Text => {
            let text = if token.lstrip { text.trim_start() } else { text };
            if token.rstrip { text.trim_end() } else { text }
        }
        TokenKind::Tag | TokenKind::Variable => {
            let mut inner = &text[2..text.len() - 2];
            if token.lstrip {
                inner = &inner[1..];
            }
            if token.rstrip
                && let Some(stripped) = inner.strip_suffix('-')
            {
                inner = stripped;
            }
            inner
        }
        TokenKind::Invalid => text,
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct RawEnd {
    /// Offset of the `{%` opening the closing tag.
    pub body_end: usize,
    /// Offset just past the closing `%}`.
    pub tag_end: usize,
    /// The closing tag opens with `{%-`.
    pub lstrip: bool,
    /// The closing tag ends with `-%}`.
    pub rstrip: bool,
}

impl RawEnd {
    pub(crate) fn trim<'a>(&self, body: &'a str, strip_start: bool) -> &'a str {
        let body = if strip_start { body.trim_start() } else { body };
        if self.lstrip { body.trim_end() } else { body }
    }
}

/// Finds the tag closing a raw-style block that starts at `from`.
///
/// Every `%}` closes a candidate tag opened by the last `{%` before it. The
/// candidate matches when that `{%` is followed by an optional `-`, ASCII
/// whitespace and the word `end_name` with no further word characters. Any
/// other byte next to the delimiter, such as a non-breaking space, fails the
/// match.
pub(crate) fn find_raw_end(source: &str, from: usize, end_name: &str) -> Option<RawEnd> {
    let bytes = source.as_bytes();
    let mut region_start = from;
    loop {
        let close = region_start + source.get(region_start..)?.find("%}")?;
        if let Some(open) = source[region_start..close].rfind("{%").map(|i| region_start + i) {
            let mut i = open + 2;
            let lstrip = bytes.get(i) == Some(&b'-');
            if lstrip {
                i += 1;
            }
            while i < close && bytes[i].is_ascii_whitespace() {
                i += 1;
            }
            let word_end = (i..close).find(|&j| !is_word(bytes[j])).unwrap_or(close);
            if &source[i..word_end] == end_name {
                return Some(RawEnd {
                    body_end: open,
                    tag_end: close + 2,
                    lstrip,
                    rstrip: close > open + 2 && bytes[close - 1] == b'-',
                });
            }
        }
        region_start = close + 2;
    }
}

pub(crate) fn is_word(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokenize(source: &str, for_liquid_tag: bool, trimmed: bool) -> Vec<String> {
        let mut tokenizer = Tokenizer::new(source, 1, for_liquid_tag).unwrap();
        let mut tokens = Vec::new();
        while let Some(token) = tokenizer.shift() {
            let text = if trimmed {
                tokenizer.trimmed_text(&token)
            } else {
                tokenizer.text(&token)
            };
            tokens.push(text.to_owned());
        }
        tokens
    }

    #[test]
    fn strings() {
        assert_eq!(tokenize(" ", false, false), [" "]);
        assert_eq!(tokenize("hello world", false, false), ["hello world"]);
        assert!(tokenize("", false, false).is_empty());
    }

    #[test]
    fn variables() {
        assert_eq!(tokenize("{{funk}}", false, false), ["{{funk}}"]);
        assert_eq!(
            tokenize(" {{funk}} {{so}} {{brother}} ", false, false),
            [" ", "{{funk}}", " ", "{{so}}", " ", "{{brother}}", " "]
        );
        assert_eq!(tokenize(" {{  funk  }} ", false, true), [" ", "  funk  ", " "]);
    }

    #[test]
    fn blocks() {
        assert_eq!(
            tokenize("  {% comment %} {% endcomment %} ", false, false),
            ["  ", "{% comment %}", " ", "{% endcomment %}", " "]
        );
        assert_eq!(tokenize(" {%  comment  %} ", false, true), [" ", "  comment  ", " "]);
    }

    #[test]
    fn liquid_tag_mode_splits_lines() {
        let source = "\nfunk\n\n  so | brother   \n";
        assert_eq!(tokenize(source, true, false), ["", "funk", "", "  so | brother   "]);
        assert_eq!(tokenize(source, true, true), ["", "funk", "", "so | brother"]);
    }

    #[test]
    fn empty_markup_with_trim_markers() {
        assert_eq!(tokenize("{%-%}", false, true), [""]);
        assert_eq!(tokenize("{{-}}", false, true), [""]);
    }

    #[test]
    fn trim_flags() {
        let mut tokenizer = Tokenizer::new("a {{- b -}} c", 1, false).unwrap();
        let first = tokenizer.shift().unwrap();
        assert!(!first.lstrip && first.rstrip);
        let markup = tokenizer.shift().unwrap();
        assert!(markup.lstrip && markup.rstrip);
        let last = tokenizer.shift().unwrap();
        assert!(last.lstrip && !last.rstrip);
        assert_eq!(tokenizer.trimmed_text(&last), "c");
    }

    #[test]
    fn unterminated_markup_is_invalid() {
        let mut tokenizer = Tokenizer::new("{{ a } b", 1, false).unwrap();
        let token = tokenizer.shift().unwrap();
        assert_eq!(token.kind, TokenKind::Invalid);
        assert_eq!(tokenizer.text(&token), "{{ a }");

        let mut tokenizer = Tokenizer::new("{{ a }", 1, false).unwrap();
        let token = tokenizer.shift().unwrap();
        assert_eq!((token.kind, tokenizer.text(&token)), (TokenKind::Invalid, "{{"));
        let rest = tokenizer.shift().unwrap();
        assert_eq!((rest.kind, tokenizer.text(&rest)), (TokenKind::Text, " a }"));

        let mut tokenizer = Tokenizer::new("{{ a }}", 1, false).unwrap();
        assert_eq!(tokenizer.shift().unwrap().kind, TokenKind::Variable);

        let mut tokenizer = Tokenizer::new("{% if", 1, false).unwrap();
        let token = tokenizer.shift().unwrap();
        assert_eq!((token.kind, token.len), (TokenKind::Invalid, 2));
    }

    #[test]
    fn line_numbers() {
        let mut tokenizer = Tokenizer::new("a\n{{ b }}\n\n{% c %}", 1, false).unwrap();
        let lines: Vec<u32> = std::iter::from_fn(|| tokenizer.shift()).map(|t| t.line_number).collect();
        assert_eq!(lines, [1, 2, 2, 4]);
    }

    #[test]
    fn peek_and_rewind() {
        let mut tokenizer = Tokenizer::new("a{{b}}", 1, false).unwrap();
        let peeked = tokenizer.peek().unwrap();
        assert_eq!(tokenizer.shift(), Some(peeked));
        assert_eq!(tokenizer.shift().map(|t| t.kind), Some(TokenKind::Variable));
        assert_eq!(tokenizer.shift(), None);
        tokenizer.rewind();
        assert_eq!(tokenizer.count(), 2);
    }

    #[test]
    fn non_utf8_source_is_rejected() {
        let err = Tokenizer::from_bytes(b"\xfc\xf1icode", 1, false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Encoding);
        assert!(err.message().starts_with("non-UTF8 encoded source"));
    }

    #[test]
    fn raw_end_matching() {
        let find = |s: &'static str| find_raw_end(s, 0, "endraw").map(|end| &s[..end.body_end]);
        assert_eq!(find("x{% endraw %}"), Some("x"));
        assert_eq!(find("{% endraw {% endraw %}"), Some("{% endraw "));
        assert_eq!(find("{% endraw\u{a0}%}"), Some(""));
        assert_eq!(find("a{%- endraw this_is_allowed -%}"), Some("a"));
        assert_eq!(find("{%\u{a0}endraw%}"), None);
        assert_eq!(find("{% - endraw %}"), None);
        assert_eq!(find("{% endnot endraw %}"), None);
        assert_eq!(find("{% endrawx %}"), None);
    }
}
