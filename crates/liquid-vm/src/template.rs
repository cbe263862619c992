//! Environments, configuration and the engine facade.
//!
//! An [`Environment`] holds the registries a parse resolves names against.
//! An [`Engine`] pairs one with an [`EngineConfig`] and implements
//! [`TemplateEngine`]: parse, render, dump and load. Configuration is always
//! an explicit value; nothing here is process-wide.

use std::{fmt, sync::Arc};

use crate::{
    block::{self, BlockBody},
    context::Context,
    error::{ErrorKind, LiquidError, ParseResult, RenderResult},
    filter::{Filter, FilterRegistry},
    legacy::{LaxParser, LegacyTokenizer, RegexLaxParser},
    parse_context::{ParseContext, ParseOptions},
    resource::LimitsConfig,
    serialize,
    stdlib,
    tag::{TagParser, TagRegistry},
    tokenizer::{TokenSource, Tokenizer},
    value::Map,
};

/// Registries and collaborators a template is parsed and rendered against.
#[derive(Clone)]
pub struct Environment {
    pub tags: TagRegistry,
    pub filters: FilterRegistry,
    /// Parser used when strict parsing fails outside strict mode.
    pub lax_parser: Arc<dyn LaxParser>,
}

impl Environment {
    /// An environment with no tags or filters.
    #[must_use]
    pub fn new() -> Self {
        Self {
            tags: TagRegistry::new(),
            filters: FilterRegistry::new(),
            lax_parser: Arc::new(RegexLaxParser),
        }
    }

    /// An environment with the standard tags and filters installed.
    #[must_use]
    pub fn standard() -> Self {
        let mut environment = Self::new();
        stdlib::register(&mut environment);
        environment
    }

    pub fn register_tag(&mut self, name: impl Into<String>, parser: impl TagParser + 'static) {
        self.tags.register(name, parser);
    }

    pub fn register_filter(&mut self, name: impl Into<String>, filter: impl Filter + 'static) {
        self.filters.register(name, filter);
    }
}

impl Default for Environment {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environment")
            .field("tags", &self.tags)
            .field("filters", &self.filters)
            .finish_non_exhaustive()
    }
}

/// Tokenizer/parser/evaluator implementation pair.
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
pub enum Backend {
    /// Accelerated tokenizer and compiled bodies, falling back to the legacy
    /// tokenizer for oversized sources.
    #[default]
    Accelerated,
    /// Legacy tokenizer and walked bodies throughout.
    Legacy,
}

/// Per-render policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct RenderOptions {
    pub strict_variables: bool,
    pub strict_filters: bool,
    /// Raise recovered errors instead of rendering them inline.
    pub rethrow_errors: bool,
}

/// Everything an [`Engine`] is configured with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub backend: Backend,
    pub parse: ParseOptions,
    pub render: RenderOptions,
    pub limits: LimitsConfig,
}

impl EngineConfig {
    /// Reads a config from JSON; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// A parsed template. Immutable and shareable across threads.
#[derive(Debug, Clone)]
pub struct Template {
    root: BlockBody,
    warnings: Vec<LiquidError>,
    used_fallback: bool,
    line_numbers: bool,
}

impl Template {
    pub(crate) fn new(root: BlockBody, warnings: Vec<LiquidError>, used_fallback: bool, line_numbers: bool) -> Self {
        Self {
            root,
            warnings,
            used_fallback,
            line_numbers,
        }
    }

    #[must_use]
    pub fn root(&self) -> &BlockBody {
        &self.root
    }

    /// Syntax errors recovered in warn mode.
    #[must_use]
    pub fn warnings(&self) -> &[LiquidError] {
        &self.warnings
    }

    /// Whether the source was too large for the accelerated tokenizer.
    #[must_use]
    pub fn used_fallback(&self) -> bool {
        self.used_fallback
    }

    #[must_use]
    pub fn line_numbers(&self) -> bool {
        self.line_numbers
    }

    /// Bytecode listing of the root body.
    #[must_use]
    pub fn disassemble(&self) -> String {
        self.root.disassemble()
    }

    /// Renders against `context`.
    ///
    /// A breached resource limit ends the render; unless the context
    /// rethrows, the output is replaced by the error text and the error is
    /// recorded on the context.
    pub fn render(&self, context: &mut Context<'_>) -> RenderResult<String> {
        context.set_line_numbers(self.line_numbers);
        let mut output = String::new();
        match self.root.render(context, &mut output) {
            Ok(()) => Ok(output),
            Err(err) if err.kind() == ErrorKind::ResourceLimit => context.recover_fatal(err),
            Err(err) => Err(err),
        }
    }
}

/// The parse/render/dump/load contract.
pub trait TemplateEngine {
    fn parse(&self, source: &str) -> ParseResult<Template>;

    fn render(&self, template: &Template, assigns: Map) -> RenderResult<String>;

    fn dump(&self, template: &Template) -> ParseResult<Vec<u8>>;

    fn load(&self, bytes: &[u8]) -> ParseResult<Template>;
}

/// An environment plus configuration.
#[derive(Debug, Clone)]
pub struct Engine {
    environment: Arc<Environment>,
    config: EngineConfig,
}

impl Engine {
    #[must_use]
    pub fn new(environment: Environment, config: EngineConfig) -> Self {
        Self {
            environment: Arc::new(environment),
            config,
        }
    }

    #[must_use]
    pub fn environment(&self) -> &Environment {
        &self.environment
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// A render context configured from this engine's render options and limits.
    #[must_use]
    pub fn new_context(&self, assigns: Map) -> Context<'_> {
        let mut context = Context::new(&self.environment.filters)
            .with_assigns(assigns)
            .with_limits(self.config.limits);
        context.set_strict_variables(self.config.render.strict_variables);
        context.set_strict_filters(self.config.render.strict_filters);
        context.set_rethrow_errors(self.config.render.rethrow_errors);
        context
    }

    /// Parses `source`, notifying `observer` of every variable that falls back
    /// to the lax parser.
    pub fn parse_with_observer(&self, source: &str, observer: impl FnMut(&str)) -> ParseResult<Template> {
        let mut context = ParseContext::new(&self.environment, self.config.parse);
        context.set_fallback_observer(observer);
        self.parse_in(source, context)
    }

    /// Parses raw bytes, rejecting sources that are not UTF-8.
    pub fn parse_bytes(&self, source: &[u8]) -> ParseResult<Template> {
        let source = match Tokenizer::from_bytes(source, 1, false) {
            Ok(tokens) => tokens.source(),
            Err(err) if err.kind() == ErrorKind::SourceTooLarge => std::str::from_utf8(source)
                .map_err(|_| LiquidError::new(ErrorKind::Encoding, "non-UTF8 encoded source not supported"))?,
            Err(err) => return Err(err),
        };
        self.parse(source)
    }

    fn parse_in(&self, source: &str, mut context: ParseContext<'_>) -> ParseResult<Template> {
        let mut used_fallback = false;
        let root = match self.config.backend {
            Backend::Legacy => {
                context.use_legacy();
                block::parse_document(&mut LegacyTokenizer::new(source, 1, false), &mut context)?
            }
            Backend::Accelerated => match Tokenizer::new(source, 1, false) {
                Ok(mut tokens) => block::parse_document(&mut tokens, &mut context)?,
                Err(err) if err.kind() == ErrorKind::SourceTooLarge => {
                    used_fallback = true;
                    context.use_legacy();
                    block::parse_document(&mut LegacyTokenizer::new(source, 1, false), &mut context)?
                }
                Err(err) => return Err(err),
            },
        };
        Ok(Template::new(
            root,
            context.take_warnings(),
            used_fallback,
            self.config.parse.line_numbers,
        ))
    }
}

impl TemplateEngine for Engine {
    fn parse(&self, source: &str) -> ParseResult<Template> {
        let context = ParseContext::new(&self.environment, self.config.parse);
        self.parse_in(source, context)
    }

    fn render(&self, template: &Template, assigns: Map) -> RenderResult<String> {
        let mut context = self.new_context(assigns);
        template.render(&mut context)
    }

    fn dump(&self, template: &Template) -> ParseResult<Vec<u8>> {
        serialize::dump(template)
    }

    fn load(&self, bytes: &[u8]) -> ParseResult<Template> {
        serialize::load(bytes, &self.environment)
    }
}
