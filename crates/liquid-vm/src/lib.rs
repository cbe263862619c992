#![doc = include_str!("../../../README.md")]

mod block;
pub mod bytecode;
mod context;
mod error;
mod expression;
mod filter;
mod legacy;
mod lexer;
mod parse_context;
pub mod parser;
mod resource;
pub mod serialize;
pub mod stdlib;
mod tag;
mod template;
mod tokenizer;
pub mod tracer;
mod value;

pub use crate::{
    block::{BlockBody, Node},
    context::{Context, ExceptionRenderer, Interrupt, MAX_SCOPE_DEPTH},
    error::{ErrorKind, LiquidError, ParseResult, RenderResult},
    expression::{CompiledExpression, Expression, FilterCall, IntLiteral, LookupSegment, Variable, VariableLookup},
    filter::{Arity, BuiltinFilter, Filter, FilterFn, FilterRegistry, filter_fn},
    legacy::{LaxParser, LegacyTokenizer, RegexLaxParser},
    lexer::{LexToken, TokenType},
    parse_context::{ErrorMode, FallbackObserver, MAX_NESTING_DEPTH, ParseContext, ParseOptions},
    resource::{LimitsConfig, ResourceError, ResourceLimits},
    tag::{Lowering, SectionBody, Tag, TagMarkup, TagParser, TagRegistry, TagSection, TagShape},
    template::{Backend, Engine, EngineConfig, Environment, RenderOptions, Template, TemplateEngine},
    tokenizer::{MAX_SOURCE_BYTE_SIZE, RawBody, Token, TokenKind, TokenSource, Tokenizer},
    value::{LiquidDrop, Map, Value},
};
