//! The standard tags.

use std::sync::{Arc, LazyLock};

use regex::Regex;

use super::{condition::Condition, to_integer};
use crate::{
    block::BlockBody,
    bytecode::Compiler,
    context::{Context, Interrupt},
    error::{LiquidError, ParseResult, RenderResult},
    expression::{Expression, Variable},
    legacy::{QUOTED_FRAGMENT, compile},
    lexer::TokenType,
    parse_context::ParseContext,
    parser::ExpressionParser,
    tag::{Lowering, Tag, TagMarkup, TagParser, TagRegistry, TagShape},
    value::{Map, Value, range_len, usize_to_i64},
};

static ASSIGN_SYNTAX: LazyLock<Regex> = LazyLock::new(|| compile(r"(?s)\A([\w\-\.\[\]()]+)\s*=\s*(.*?)\s*\z"));
static CAPTURE_SYNTAX: LazyLock<Regex> = LazyLock::new(|| compile(r"\A([\w\-\.\[\]()]+)"));
static FOR_SYNTAX: LazyLock<Regex> = LazyLock::new(|| {
    compile(&format!(
        r"(?s)\A([\w\-]+)\s+in\s+((?:{QUOTED_FRAGMENT})+)\s*(reversed)?"
    ))
});
static TAG_ATTRIBUTES: LazyLock<Regex> =
    LazyLock::new(|| compile(&format!(r"(\w[\w-]*)\s*:\s*({QUOTED_FRAGMENT})")));

pub(super) fn register(tags: &mut TagRegistry) {
    tags.register("assign", AssignParser);
    tags.register("capture", CaptureParser);
    tags.register("comment", CommentParser);
    tags.register("raw", RawParser);
    tags.register("if", IfParser { negate: false });
    tags.register("unless", IfParser { negate: true });
    tags.register("for", ForParser);
    tags.register("break", InterruptParser(Interrupt::Break));
    tags.register("continue", InterruptParser(Interrupt::Continue));
    tags.register("increment", IncrementParser);
    tags.register("echo", EchoParser);
    tags.register("liquid", LiquidParser);
}

fn first_body(markup: &TagMarkup) -> BlockBody {
    markup.body().cloned().unwrap_or_default()
}

fn prepare_variable(mut variable: Variable, context: &ParseContext<'_>) -> ParseResult<Variable> {
    variable.expression = context.prepare(variable.expression)?;
    Ok(variable)
}

// ============================================================================
// assign / capture
// ============================================================================

#[derive(Debug)]
struct AssignParser;

impl TagParser for AssignParser {
    fn shape(&self) -> TagShape {
        TagShape::Simple
    }

    fn build(&self, markup: TagMarkup, context: &mut ParseContext<'_>) -> ParseResult<Arc<dyn Tag>> {
        let Some(caps) = ASSIGN_SYNTAX.captures(&markup.markup) else {
            return Err(LiquidError::syntax(
                "Syntax Error in 'assign' - Valid syntax: assign [var] = [source]",
            ));
        };
        let to = caps[1].to_owned();
        let from = context.parse_variable(&caps[2])?;
        let from = prepare_variable(from, context)?;
        Ok(Arc::new(Assign { markup, to, from }))
    }
}

#[derive(Debug)]
struct Assign {
    markup: TagMarkup,
    to: String,
    from: Variable,
}

impl Tag for Assign {
    fn markup(&self) -> &TagMarkup {
        &self.markup
    }

    fn blank(&self) -> bool {
        true
    }

    fn render(&self, context: &mut Context<'_>, _output: &mut String) -> RenderResult<()> {
        let value = context.evaluate_variable(&self.from)?;
        context.assign(self.to.as_str(), value)
    }
}

#[derive(Debug)]
struct CaptureParser;

impl TagParser for CaptureParser {
    fn shape(&self) -> TagShape {
        TagShape::Block {
            end: "endcapture",
            intermediates: &[],
        }
    }

    fn build(&self, markup: TagMarkup, _context: &mut ParseContext<'_>) -> ParseResult<Arc<dyn Tag>> {
        let Some(caps) = CAPTURE_SYNTAX.captures(&markup.markup) else {
            return Err(LiquidError::syntax(
                "Syntax Error in 'capture' - Valid syntax: capture [var]",
            ));
        };
        let to = caps[1].to_owned();
        let body = first_body(&markup);
        Ok(Arc::new(Capture { markup, to, body }))
    }
}

#[derive(Debug)]
struct Capture {
    markup: TagMarkup,
    to: String,
    body: BlockBody,
}

impl Tag for Capture {
    fn markup(&self) -> &TagMarkup {
        &self.markup
    }

    fn blank(&self) -> bool {
        true
    }

    fn render(&self, context: &mut Context<'_>, _output: &mut String) -> RenderResult<()> {
        // captured output is charged to the assign score while it is written
        let captured = context.with_capture(|context| self.body.render_to_string(context))?;
        context.set_global(self.to.as_str(), Value::from(captured));
        Ok(())
    }
}

// ============================================================================
// comment / raw
// ============================================================================

#[derive(Debug)]
struct CommentParser;

impl TagParser for CommentParser {
    fn shape(&self) -> TagShape {
        TagShape::Raw { end: "endcomment" }
    }

    fn build(&self, markup: TagMarkup, _context: &mut ParseContext<'_>) -> ParseResult<Arc<dyn Tag>> {
        Ok(Arc::new(Comment { markup }))
    }
}

#[derive(Debug)]
struct Comment {
    markup: TagMarkup,
}

impl Tag for Comment {
    fn markup(&self) -> &TagMarkup {
        &self.markup
    }

    fn blank(&self) -> bool {
        true
    }

    fn compile(&self, _compiler: &mut Compiler<'_>) -> ParseResult<Lowering> {
        Ok(Lowering::Emitted)
    }

    fn render(&self, _context: &mut Context<'_>, _output: &mut String) -> RenderResult<()> {
        Ok(())
    }
}

#[derive(Debug)]
struct RawParser;

impl TagParser for RawParser {
    fn shape(&self) -> TagShape {
        TagShape::Raw { end: "endraw" }
    }

    fn build(&self, markup: TagMarkup, _context: &mut ParseContext<'_>) -> ParseResult<Arc<dyn Tag>> {
        if !markup.markup.trim().is_empty() {
            return Err(LiquidError::syntax(
                "Syntax Error in 'raw' - Valid syntax: {% raw %}{% endraw %}",
            ));
        }
        let body = markup
            .sections
            .first()
            .and_then(|section| section.body.as_raw())
            .unwrap_or_default()
            .to_owned();
        Ok(Arc::new(Raw { markup, body }))
    }
}

#[derive(Debug)]
struct Raw {
    markup: TagMarkup,
    body: String,
}

impl Tag for Raw {
    fn markup(&self) -> &TagMarkup {
        &self.markup
    }

    fn blank(&self) -> bool {
        self.body.is_empty()
    }

    fn compile(&self, compiler: &mut Compiler<'_>) -> ParseResult<Lowering> {
        compiler.add_write_raw(&self.body);
        Ok(Lowering::Emitted)
    }

    fn render(&self, _context: &mut Context<'_>, output: &mut String) -> RenderResult<()> {
        output.push_str(&self.body);
        Ok(())
    }
}

// ============================================================================
// if / unless
// ============================================================================

#[derive(Debug)]
struct IfParser {
    /// `unless`: the first branch renders when its condition is false.
    negate: bool,
}

impl TagParser for IfParser {
    fn shape(&self) -> TagShape {
        if self.negate {
            TagShape::Block {
                end: "endunless",
                intermediates: &["elsif", "else"],
            }
        } else {
            TagShape::Block {
                end: "endif",
                intermediates: &["elsif", "else"],
            }
        }
    }

    fn build(&self, markup: TagMarkup, context: &mut ParseContext<'_>) -> ParseResult<Arc<dyn Tag>> {
        let mut branches = Vec::with_capacity(markup.sections.len());
        for section in &markup.sections {
            let condition = if section.name == "else" {
                None
            } else {
                Some(Condition::parse(&section.markup, &markup.name, context)?)
            };
            branches.push(Branch {
                condition,
                body: section.body.as_block().cloned().unwrap_or_default(),
            });
        }
        Ok(Arc::new(If {
            markup,
            branches,
            negate: self.negate,
        }))
    }
}

#[derive(Debug)]
struct Branch {
    /// `None` for `else`.
    condition: Option<Condition>,
    body: BlockBody,
}

#[derive(Debug)]
struct If {
    markup: TagMarkup,
    branches: Vec<Branch>,
    negate: bool,
}

impl Tag for If {
    fn markup(&self) -> &TagMarkup {
        &self.markup
    }

    fn blank(&self) -> bool {
        self.branches.iter().all(|branch| branch.body.blank())
    }

    fn render(&self, context: &mut Context<'_>, output: &mut String) -> RenderResult<()> {
        for (index, branch) in self.branches.iter().enumerate() {
            let taken = match &branch.condition {
                None => true,
                Some(condition) => condition.evaluate(context)? != (self.negate && index == 0),
            };
            if taken {
                return branch.body.render(context, output);
            }
        }
        Ok(())
    }
}

// ============================================================================
// for
// ============================================================================

#[derive(Debug, Clone)]
enum Offset {
    Start,
    At(Expression),
    /// Resume where the previous loop over the same collection stopped.
    Continue,
}

#[derive(Debug)]
struct ForHeader {
    variable: String,
    collection: Expression,
    collection_markup: String,
    reversed: bool,
    limit: Option<Expression>,
    offset: Offset,
}

#[derive(Debug)]
struct ForParser;

impl TagParser for ForParser {
    fn shape(&self) -> TagShape {
        TagShape::Block {
            end: "endfor",
            intermediates: &["else"],
        }
    }

    fn build(&self, markup: TagMarkup, context: &mut ParseContext<'_>) -> ParseResult<Arc<dyn Tag>> {
        let header = context.parse_markup(&markup.markup, strict_for_header, lax_for_header)?;
        let offset = match header.offset {
            Offset::At(expression) => Offset::At(context.prepare(expression)?),
            other => other,
        };
        let limit = header.limit.map(|limit| context.prepare(limit)).transpose()?;
        let body = first_body(&markup);
        let else_body = markup
            .sections
            .get(1)
            .and_then(|section| section.body.as_block())
            .cloned();
        Ok(Arc::new(For {
            name: format!("{}-{}", header.variable, header.collection_markup),
            variable: header.variable,
            collection: context.prepare(header.collection)?,
            reversed: header.reversed,
            limit,
            offset,
            body,
            else_body,
            markup,
        }))
    }
}

fn strict_for_header(markup: &str) -> ParseResult<ForHeader> {
    let mut parser = ExpressionParser::new(markup)?;
    let variable = parser.consume(TokenType::Identifier)?.to_owned();
    if !parser.id("in") {
        return Err(LiquidError::syntax("For loops require an 'in' clause"));
    }
    let collection = parser.parse_expression()?;
    let mut header = ForHeader {
        variable,
        collection,
        collection_markup: collection_markup(markup),
        reversed: parser.id("reversed"),
        limit: None,
        offset: Offset::Start,
    };
    while parser.look(TokenType::Comma, 0) || parser.look(TokenType::Identifier, 0) {
        parser.consume_optional(TokenType::Comma);
        if parser.id("limit") {
            parser.consume(TokenType::Colon)?;
            header.limit = Some(parser.parse_expression()?);
        } else if parser.id("offset") {
            parser.consume(TokenType::Colon)?;
            header.offset = if parser.id("continue") {
                Offset::Continue
            } else {
                Offset::At(parser.parse_expression()?)
            };
        } else {
            return Err(LiquidError::syntax(
                "Invalid attribute in for loop. Valid attributes are limit and offset",
            ));
        }
    }
    parser.expect_end()?;
    Ok(header)
}

/// The word after `in`, which names the loop for `offset: continue`.
fn collection_markup(markup: &str) -> String {
    markup
        .split_whitespace()
        .skip_while(|word| *word != "in")
        .nth(1)
        .unwrap_or_default()
        .to_owned()
}

fn lax_for_header(context: &mut ParseContext<'_>, markup: &str) -> ParseResult<ForHeader> {
    let Some(caps) = FOR_SYNTAX.captures(markup) else {
        return Err(LiquidError::syntax(
            "Syntax Error in 'for loop' - Valid syntax: for [item] in [collection]",
        ));
    };
    let parser = &context.environment().lax_parser;
    let mut header = ForHeader {
        variable: caps[1].to_owned(),
        collection: parser.lax_parse_expression(&caps[2]),
        collection_markup: caps[2].to_owned(),
        reversed: caps.get(3).is_some(),
        limit: None,
        offset: Offset::Start,
    };
    for attribute in TAG_ATTRIBUTES.captures_iter(markup) {
        match &attribute[1] {
            "limit" => header.limit = Some(parser.lax_parse_expression(&attribute[2])),
            "offset" if &attribute[2] == "continue" => header.offset = Offset::Continue,
            "offset" => header.offset = Offset::At(parser.lax_parse_expression(&attribute[2])),
            _ => {}
        }
    }
    Ok(header)
}

#[derive(Debug)]
struct For {
    markup: TagMarkup,
    /// `item-collection`; keys the `offset: continue` register.
    name: String,
    variable: String,
    collection: Expression,
    reversed: bool,
    limit: Option<Expression>,
    offset: Offset,
    body: BlockBody,
    else_body: Option<BlockBody>,
}

impl For {
    fn register_key(&self) -> String {
        format!("for:{}", self.name)
    }

    /// The items this render iterates, after offset, limit and reversal.
    fn segment(&self, context: &mut Context<'_>) -> RenderResult<Vec<Value>> {
        let from = match &self.offset {
            Offset::Start => 0,
            Offset::Continue => context.register(&self.register_key()).and_then(Value::as_int).unwrap_or(0),
            Offset::At(expression) => {
                let value = context.evaluate(expression)?;
                if value.is_nil() { 0 } else { to_integer(&value)? }
            }
        };
        let collection = context.evaluate(&self.collection)?.to_liquid();
        let to = match &self.limit {
            Some(expression) => {
                let value = context.evaluate(expression)?;
                if value.is_nil() {
                    None
                } else {
                    Some(to_integer(&value)?.saturating_add(from))
                }
            }
            None => None,
        };
        let mut segment: Vec<Value> = match collection {
            Value::Int(_) | Value::BigInt(_) | Value::Float(_) | Value::Bool(_) => Vec::new(),
            Value::Range(start, end) => range_window(start, end, from, to),
            other => other
                .to_items()
                .into_iter()
                .enumerate()
                .filter(|(index, _)| {
                    let index = usize_to_i64(*index);
                    index >= from && to.is_none_or(|to| index < to)
                })
                .map(|(_, item)| item)
                .collect(),
        };
        if self.reversed {
            segment.reverse();
        }
        context.set_register(self.register_key(), Value::Int(from.saturating_add(usize_to_i64(segment.len()))));
        Ok(segment)
    }
}

impl Tag for For {
    fn markup(&self) -> &TagMarkup {
        &self.markup
    }

    fn blank(&self) -> bool {
        self.body.blank() && self.else_body.as_ref().is_none_or(BlockBody::blank)
    }

    fn render(&self, context: &mut Context<'_>, output: &mut String) -> RenderResult<()> {
        let segment = self.segment(context)?;
        if segment.is_empty() {
            return match &self.else_body {
                Some(body) => body.render(context, output),
                None => Ok(()),
            };
        }
        let parent = context.find_variable("forloop", false)?;
        let length = segment.len();
        context.with_scope(Map::new(), |context| {
            for (index, item) in segment.into_iter().enumerate() {
                context.set(self.variable.as_str(), item);
                context.set("forloop", forloop(&self.name, index, length, &parent));
                self.body.render(context, output)?;
                if context.pop_interrupt() == Some(Interrupt::Break) {
                    break;
                }
            }
            Ok(())
        })
    }
}

/// The integers of `start..=end` at positions `from..to`, built without
/// materializing the rest of the range.
fn range_window(start: i64, end: i64, from: i64, to: Option<i64>) -> Vec<Value> {
    let len = range_len(start, end);
    let lo = from.clamp(0, len);
    let hi = to.map_or(len, |to| to.clamp(lo, len));
    if lo >= hi {
        return Vec::new();
    }
    let first = start.saturating_add(lo);
    let last = start.saturating_add(hi - 1).min(end);
    (first..=last).map(Value::Int).collect()
}

/// The `forloop` object for iteration `index` of `length`.
fn forloop(name: &str, index: usize, length: usize, parent: &Value) -> Value {
    let index = usize_to_i64(index);
    let length = usize_to_i64(length);
    let mut map = Map::with_capacity(9);
    map.insert("name".to_owned(), Value::from(name));
    map.insert("length".to_owned(), Value::Int(length));
    map.insert("index".to_owned(), Value::Int(index + 1));
    map.insert("index0".to_owned(), Value::Int(index));
    map.insert("rindex".to_owned(), Value::Int(length - index));
    map.insert("rindex0".to_owned(), Value::Int(length - index - 1));
    map.insert("first".to_owned(), Value::Bool(index == 0));
    map.insert("last".to_owned(), Value::Bool(index == length - 1));
    map.insert("parentloop".to_owned(), parent.clone());
    Value::map(map)
}

// ============================================================================
// break / continue / increment / echo / liquid
// ============================================================================

#[derive(Debug)]
struct InterruptParser(Interrupt);

impl TagParser for InterruptParser {
    fn shape(&self) -> TagShape {
        TagShape::Simple
    }

    fn build(&self, markup: TagMarkup, _context: &mut ParseContext<'_>) -> ParseResult<Arc<dyn Tag>> {
        Ok(Arc::new(InterruptTag {
            markup,
            interrupt: self.0,
        }))
    }
}

#[derive(Debug)]
struct InterruptTag {
    markup: TagMarkup,
    interrupt: Interrupt,
}

impl Tag for InterruptTag {
    fn markup(&self) -> &TagMarkup {
        &self.markup
    }

    fn render(&self, context: &mut Context<'_>, _output: &mut String) -> RenderResult<()> {
        context.push_interrupt(self.interrupt);
        Ok(())
    }
}

#[derive(Debug)]
struct IncrementParser;

impl TagParser for IncrementParser {
    fn shape(&self) -> TagShape {
        TagShape::Simple
    }

    fn build(&self, markup: TagMarkup, _context: &mut ParseContext<'_>) -> ParseResult<Arc<dyn Tag>> {
        let variable = markup.markup.trim().to_owned();
        Ok(Arc::new(Increment { markup, variable }))
    }
}

#[derive(Debug)]
struct Increment {
    markup: TagMarkup,
    variable: String,
}

impl Tag for Increment {
    fn markup(&self) -> &TagMarkup {
        &self.markup
    }

    fn render(&self, context: &mut Context<'_>, output: &mut String) -> RenderResult<()> {
        let value = context.increment_counter(&self.variable);
        context.write_value(&value, output)
    }
}

#[derive(Debug)]
struct EchoParser;

impl TagParser for EchoParser {
    fn shape(&self) -> TagShape {
        TagShape::Simple
    }

    fn build(&self, markup: TagMarkup, context: &mut ParseContext<'_>) -> ParseResult<Arc<dyn Tag>> {
        let variable = context.parse_variable(&markup.markup)?;
        let variable = prepare_variable(variable, context)?;
        Ok(Arc::new(Echo {
            markup,
            variable,
            line_number: context.current_line(),
        }))
    }
}

#[derive(Debug)]
struct Echo {
    markup: TagMarkup,
    variable: Variable,
    line_number: u32,
}

impl Tag for Echo {
    fn markup(&self) -> &TagMarkup {
        &self.markup
    }

    fn compile(&self, compiler: &mut Compiler<'_>) -> ParseResult<Lowering> {
        compiler.add_render_variable(&self.variable, Some(self.line_number))?;
        Ok(Lowering::Emitted)
    }

    fn render(&self, context: &mut Context<'_>, output: &mut String) -> RenderResult<()> {
        let value = context.evaluate_variable(&self.variable)?;
        context.write_value(&value, output)
    }
}

#[derive(Debug)]
struct LiquidParser;

impl TagParser for LiquidParser {
    fn shape(&self) -> TagShape {
        TagShape::Liquid
    }

    fn build(&self, markup: TagMarkup, _context: &mut ParseContext<'_>) -> ParseResult<Arc<dyn Tag>> {
        let body = first_body(&markup);
        Ok(Arc::new(LiquidTag { markup, body }))
    }
}

#[derive(Debug)]
struct LiquidTag {
    markup: TagMarkup,
    body: BlockBody,
}

impl Tag for LiquidTag {
    fn markup(&self) -> &TagMarkup {
        &self.markup
    }

    fn blank(&self) -> bool {
        self.body.blank()
    }

    fn render(&self, context: &mut Context<'_>, output: &mut String) -> RenderResult<()> {
        self.body.render(context, output)
    }
}
