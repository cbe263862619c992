//! Parse-time options and state shared by the block parser and tag parsers.

use crate::{
    bytecode::Compiler,
    error::{ErrorKind, LiquidError, ParseResult},
    expression::{Expression, Variable},
    parser,
    template::Environment,
};

/// Deepest block nesting the parser accepts.
pub const MAX_NESTING_DEPTH: usize = 100;

/// How syntax the strict grammar rejects is treated.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    serde::Serialize,
    serde::Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorMode {
    /// Fall back to the lax parser silently (the fallback observer still fires).
    #[default]
    Lax,
    /// Fall back to the lax parser and record a warning.
    Warn,
    /// Raise the syntax error.
    Strict,
}

/// Options for one parse.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ParseOptions {
    pub error_mode: ErrorMode,
    /// Report line numbers in errors.
    pub line_numbers: bool,
    /// Keep bodies as walked node lists instead of compiling them.
    pub disable_compiled_nodes: bool,
}

/// Called with the markup whenever a variable falls back to the lax parser.
pub type FallbackObserver<'e> = Box<dyn FnMut(&str) + 'e>;

/// State threaded through one template parse.
pub struct ParseContext<'e> {
    environment: &'e Environment,
    options: ParseOptions,
    warnings: Vec<LiquidError>,
    on_fallback: Option<FallbackObserver<'e>>,
    /// Line of the token being parsed.
    line_number: u32,
    /// Bodies are lowered to bytecode rather than kept as node lists.
    compiled: bool,
    /// Tokenize nested sources with the legacy tokenizer.
    legacy: bool,
    depth: usize,
}

impl<'e> ParseContext<'e> {
    #[must_use]
    pub fn new(environment: &'e Environment, options: ParseOptions) -> Self {
        Self {
            environment,
            options,
            warnings: Vec::new(),
            on_fallback: None,
            line_number: 1,
            compiled: !options.disable_compiled_nodes,
            legacy: false,
            depth: 0,
        }
    }

    /// Installs the observer notified of every lax fallback.
    pub fn set_fallback_observer(&mut self, observer: impl FnMut(&str) + 'e) {
        self.on_fallback = Some(Box::new(observer));
    }

    /// Switches to the legacy tokenizer and walked bodies.
    pub(crate) fn use_legacy(&mut self) {
        self.legacy = true;
        self.compiled = false;
    }

    #[must_use]
    pub fn environment(&self) -> &'e Environment {
        self.environment
    }

    #[must_use]
    pub fn options(&self) -> ParseOptions {
        self.options
    }

    #[must_use]
    pub fn error_mode(&self) -> ErrorMode {
        self.options.error_mode
    }

    /// Whether bodies are compiled to bytecode.
    #[must_use]
    pub fn compiled(&self) -> bool {
        self.compiled
    }

    #[must_use]
    pub(crate) fn legacy(&self) -> bool {
        self.legacy
    }

    /// Line number to report, present only when line numbers are enabled.
    #[must_use]
    pub fn line_number(&self) -> Option<u32> {
        self.options.line_numbers.then_some(self.line_number)
    }

    /// Line of the token being parsed, regardless of options.
    #[must_use]
    pub fn current_line(&self) -> u32 {
        self.line_number
    }

    pub(crate) fn set_line_number(&mut self, line_number: u32) {
        self.line_number = line_number;
    }

    #[must_use]
    pub fn warnings(&self) -> &[LiquidError] {
        &self.warnings
    }

    pub fn take_warnings(&mut self) -> Vec<LiquidError> {
        std::mem::take(&mut self.warnings)
    }

    pub fn add_warning(&mut self, warning: LiquidError) {
        self.warnings.push(warning);
    }

    /// Attaches the current line, when enabled, to a parse error.
    #[must_use]
    pub fn locate(&self, error: LiquidError) -> LiquidError {
        error.with_line_number(self.line_number())
    }

    /// A compiler that knows this environment's built-in filter slots.
    #[must_use]
    pub fn new_compiler(&self) -> Compiler<'e> {
        Compiler::new(&self.environment.filters)
    }

    /// Parses `{{ markup }}` content.
    ///
    /// The strict grammar runs first. On a syntax error strict mode raises
    /// it; warn mode records it; lax and warn mode then notify the fallback
    /// observer and use the environment's lax parser.
    pub fn parse_variable(&mut self, markup: &str) -> ParseResult<Variable> {
        match parser::strict_parse_variable(markup) {
            Ok(variable) => Ok(variable),
            Err(err) => {
                self.strict_failed(err, || format!("{{{{{markup}}}}}"))?;
                if let Some(observer) = self.on_fallback.as_mut() {
                    observer(markup);
                }
                Ok(self.environment.lax_parser.lax_parse_variable(markup))
            }
        }
    }

    /// Parses a tag argument expression with the same strict-then-lax policy,
    /// without notifying the fallback observer.
    pub fn parse_expression(&mut self, markup: &str) -> ParseResult<Expression> {
        match parser::strict_parse_expression(markup) {
            Ok(expression) => Ok(expression),
            Err(err) => {
                self.strict_failed(err, || markup.to_owned())?;
                Ok(self.environment.lax_parser.lax_parse_expression(markup))
            }
        }
    }

    /// Parses tag markup with `strict`, falling back to `lax` on a syntax
    /// error under the same policy as [`Self::parse_expression`].
    pub fn parse_markup<T>(
        &mut self,
        markup: &str,
        strict: impl FnOnce(&str) -> ParseResult<T>,
        lax: impl FnOnce(&mut Self, &str) -> ParseResult<T>,
    ) -> ParseResult<T> {
        match strict(markup) {
            Ok(parsed) => Ok(parsed),
            Err(err) => {
                self.strict_failed(err, || markup.to_owned())?;
                lax(self, markup)
            }
        }
    }

    /// Wraps `expression` in a compiled program when bodies are compiled.
    pub fn prepare(&self, expression: Expression) -> ParseResult<Expression> {
        if self.compiled { expression.compile() } else { Ok(expression) }
    }

    fn strict_failed(&mut self, err: LiquidError, markup_context: impl FnOnce() -> String) -> ParseResult<()> {
        if err.kind() != ErrorKind::Syntax {
            return Err(err);
        }
        let err = self.locate(err).with_markup_context(markup_context());
        match self.options.error_mode {
            ErrorMode::Strict => Err(err),
            ErrorMode::Warn => {
                self.warnings.push(err);
                Ok(())
            }
            ErrorMode::Lax => Ok(()),
        }
    }

    /// Runs `f` one nesting level deeper.
    pub(crate) fn nested<T>(&mut self, f: impl FnOnce(&mut Self) -> ParseResult<T>) -> ParseResult<T> {
        if self.depth >= MAX_NESTING_DEPTH {
            return Err(self.locate(LiquidError::standard("Nesting too deep")));
        }
        self.depth += 1;
        let result = f(self);
        self.depth -= 1;
        result
    }
}

impl std::fmt::Debug for ParseContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParseContext")
            .field("options", &self.options)
            .field("warnings", &self.warnings)
            .field("line_number", &self.line_number)
            .field("compiled", &self.compiled)
            .field("legacy", &self.legacy)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, rc::Rc};

    use super::*;

    fn options(error_mode: ErrorMode) -> ParseOptions {
        ParseOptions {
            error_mode,
            line_numbers: true,
            ..ParseOptions::default()
        }
    }

    #[test]
    fn strict_mode_raises_with_context() {
        let environment = Environment::standard();
        let mut context = ParseContext::new(&environment, options(ErrorMode::Strict));
        context.set_line_number(3);
        let err = context.parse_variable("a | ").unwrap_err();
        assert_eq!(err.line_number(), Some(3));
        assert_eq!(err.markup_context(), Some("{{a | }}"));
    }

    #[test]
    fn warn_mode_records_and_falls_back() {
        let environment = Environment::standard();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let observed = Rc::clone(&seen);
        let mut context = ParseContext::new(&environment, options(ErrorMode::Warn));
        context.set_fallback_observer(move |markup| observed.borrow_mut().push(markup.to_owned()));
        let variable = context.parse_variable("a ; b").unwrap();
        assert!(matches!(variable.expression, Expression::Lookup(_)));
        assert_eq!(context.warnings().len(), 1);
        assert_eq!(*seen.borrow(), ["a ; b"]);
    }

    #[test]
    fn lax_mode_is_silent() {
        let environment = Environment::standard();
        let mut context = ParseContext::new(&environment, options(ErrorMode::Lax));
        context.parse_variable("a ; b").unwrap();
        assert!(context.warnings().is_empty());
    }
}
