//! Error types shared by parsing and rendering.
//!
//! Every failure the engine reports is a [`LiquidError`]: a kind from the fixed
//! taxonomy, a human readable message and optional source position. The
//! `Display` impl produces the text a template author sees, e.g.
//! `Liquid syntax error (line 3): Unknown tag 'foo'` or
//! `Liquid error: wrong number of arguments (given 1, expected 2)`.

use std::fmt;

use crate::resource::ResourceError;

/// Result alias used by the tokenizer, parser and compiler.
pub type ParseResult<T> = Result<T, LiquidError>;

/// Result alias used by the VM, context and collaborators at render time.
pub type RenderResult<T> = Result<T, LiquidError>;

/// Classification of a [`LiquidError`].
///
/// The kind decides both the message prefix and whether a guarded render
/// instruction is allowed to recover from the error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    /// Strict grammar violation, unknown tag, unterminated markup.
    Syntax,
    /// Missing variable or key while `strict_variables` is set.
    UndefinedVariable,
    /// Unknown filter while `strict_filters` is set.
    UndefinedFilter,
    /// Filter invoked with the wrong number or kind of arguments.
    Argument,
    /// A resource ceiling was breached.
    ResourceLimit,
    /// The source was not valid UTF-8.
    Encoding,
    /// The source exceeded the accelerated tokenizer's byte bound.
    SourceTooLarge,
    /// A value could not be converted to text.
    Type,
    /// Generic error raised by a filter, tag or drop.
    Standard,
    /// A dumped template could not be decoded.
    Serialization,
}

impl ErrorKind {
    /// Returns true for errors that are never recovered locally.
    ///
    /// Guarded render instructions re-raise these instead of routing them
    /// through the context's error hook.
    #[must_use]
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            Self::ResourceLimit | Self::Encoding | Self::SourceTooLarge | Self::Serialization
        )
    }
}

/// An error raised while tokenizing, parsing, compiling or rendering a template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiquidError {
    kind: ErrorKind,
    message: String,
    line_number: Option<u32>,
    markup_context: Option<String>,
}

impl LiquidError {
    /// Creates an error of the given kind.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            line_number: None,
            markup_context: None,
        }
    }

    pub fn syntax(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Syntax, message)
    }

    pub fn argument(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Argument, message)
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Type, message)
    }

    pub fn standard(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Standard, message)
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Serialization, message)
    }

    pub fn undefined_variable(name: &str) -> Self {
        Self::new(ErrorKind::UndefinedVariable, format!("undefined variable {name}"))
    }

    pub fn undefined_filter(name: &str) -> Self {
        Self::new(ErrorKind::UndefinedFilter, format!("undefined filter {name}"))
    }

    /// Attaches a line number unless one is already recorded.
    ///
    /// Errors raised deep inside a nested body keep the innermost line.
    #[must_use]
    pub fn with_line_number(mut self, line_number: Option<u32>) -> Self {
        if self.line_number.is_none() {
            self.line_number = line_number;
        }
        self
    }

    /// Attaches the offending markup, e.g. `{{ a | }}`, for syntax errors.
    #[must_use]
    pub fn with_markup_context(mut self, markup: impl Into<String>) -> Self {
        self.markup_context = Some(markup.into());
        self
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[must_use]
    pub fn line_number(&self) -> Option<u32> {
        self.line_number
    }

    #[must_use]
    pub fn markup_context(&self) -> Option<&str> {
        self.markup_context.as_deref()
    }

    #[must_use]
    pub fn is_fatal(&self) -> bool {
        self.kind.is_fatal()
    }

    fn prefix(&self) -> &'static str {
        match self.kind {
            ErrorKind::Syntax => "Liquid syntax error",
            _ => "Liquid error",
        }
    }
}

impl fmt::Display for LiquidError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())?;
        if let Some(line) = self.line_number {
            write!(f, " (line {line})")?;
        }
        write!(f, ": {}", self.message)?;
        if let Some(markup) = &self.markup_context {
            write!(f, " in \"{markup}\"")?;
        }
        Ok(())
    }
}

impl std::error::Error for LiquidError {}

impl From<ResourceError> for LiquidError {
    fn from(_: ResourceError) -> Self {
        // the detailed counter values stay on the ResourceLimits; authors only see the generic text
        Self::new(ErrorKind::ResourceLimit, "Memory limits exceeded")
    }
}

impl From<postcard::Error> for LiquidError {
    fn from(err: postcard::Error) -> Self {
        Self::serialization(format!("invalid serialized template: {err}"))
    }
}
