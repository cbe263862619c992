//! Extension points for tags.
//!
//! A [`TagParser`] is registered per tag name. The block parser collects the
//! tag's markup and, for block and raw tags, its section bodies into a
//! [`TagMarkup`] and hands it to [`TagParser::build`]. The resulting [`Tag`]
//! either lowers itself to bytecode in [`Tag::compile`] or is dispatched at
//! runtime through `write_node`, which calls [`Tag::render`].

use std::{fmt, sync::Arc};

use ahash::AHashMap;

use crate::{
    block::BlockBody,
    bytecode::Compiler,
    context::Context,
    error::{ParseResult, RenderResult},
    parse_context::ParseContext,
};

/// How a tag was lowered by [`Tag::compile`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lowering {
    /// The tag emitted nothing; the compiler emits `write_node` for it.
    RuntimeDispatch,
    /// The tag emitted its own instructions (possibly none).
    Emitted,
}

/// A parsed tag.
pub trait Tag: fmt::Debug + Send + Sync {
    /// The markup the tag was built from; also what serialization records.
    fn markup(&self) -> &TagMarkup;

    fn name(&self) -> &str {
        &self.markup().name
    }

    fn line_number(&self) -> Option<u32> {
        self.markup().line_number
    }

    /// Whether the tag never produces output.
    ///
    /// A body made only of blank tags and whitespace drops its whitespace.
    fn blank(&self) -> bool {
        false
    }

    /// Lowers the tag into the enclosing program.
    fn compile(&self, _compiler: &mut Compiler<'_>) -> ParseResult<Lowering> {
        Ok(Lowering::RuntimeDispatch)
    }

    /// Renders the tag. Called by `write_node` and by walked bodies.
    fn render(&self, context: &mut Context<'_>, output: &mut String) -> RenderResult<()>;
}

/// How the block parser collects a tag's extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagShape {
    /// A single `{% name markup %}`.
    Simple,
    /// A tag with a body closed by `end`; `intermediates` (such as `else`)
    /// split the body into sections.
    Block {
        end: &'static str,
        intermediates: &'static [&'static str],
    },
    /// A tag whose body is kept verbatim up to `{% end %}`.
    Raw { end: &'static str },
    /// `{% liquid %}`: the markup itself is a newline-separated tag body.
    Liquid,
}

/// One section of a tag: the opening tag or an intermediate plus its body.
#[derive(Debug, Clone)]
pub struct TagSection {
    pub name: String,
    pub markup: String,
    pub line_number: Option<u32>,
    pub body: SectionBody,
}

#[derive(Debug, Clone)]
pub enum SectionBody {
    Block(BlockBody),
    Raw(String),
}

impl SectionBody {
    #[must_use]
    pub fn as_block(&self) -> Option<&BlockBody> {
        match self {
            Self::Block(body) => Some(body),
            Self::Raw(_) => None,
        }
    }

    #[must_use]
    pub fn as_raw(&self) -> Option<&str> {
        match self {
            Self::Block(_) => None,
            Self::Raw(text) => Some(text),
        }
    }
}

/// Everything the block parser collected for one tag.
///
/// `sections` is empty for simple tags; for block tags the first section is
/// the opening tag itself.
#[derive(Debug, Clone)]
pub struct TagMarkup {
    pub name: String,
    pub markup: String,
    pub line_number: Option<u32>,
    pub sections: Vec<TagSection>,
}

impl TagMarkup {
    #[must_use]
    pub fn simple(name: impl Into<String>, markup: impl Into<String>, line_number: Option<u32>) -> Self {
        Self {
            name: name.into(),
            markup: markup.into(),
            line_number,
            sections: Vec::new(),
        }
    }

    /// The body of the first section, if it is a block body.
    #[must_use]
    pub fn body(&self) -> Option<&BlockBody> {
        self.sections.first().and_then(|section| section.body.as_block())
    }
}

/// Builds tags of one name.
pub trait TagParser: fmt::Debug + Send + Sync {
    fn shape(&self) -> TagShape;

    fn build(&self, markup: TagMarkup, context: &mut ParseContext<'_>) -> ParseResult<Arc<dyn Tag>>;
}

/// Name-to-parser table.
#[derive(Debug, Clone, Default)]
pub struct TagRegistry {
    parsers: AHashMap<String, Arc<dyn TagParser>>,
}

impl TagRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, parser: impl TagParser + 'static) {
        self.parsers.insert(name.into(), Arc::new(parser));
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Arc<dyn TagParser>> {
        self.parsers.get(name)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.parsers.contains_key(name)
    }
}
