//! Block bodies: parsing a token stream into nodes and rendering them.
//!
//! The block parser drives a [`TokenSource`], turning text, `{{ }}` and
//! `{% %}` tokens into [`Node`]s and dispatching tags to their registered
//! [`TagParser`]. A finished node list becomes a [`BlockBody`], which is
//! either lowered to bytecode for the VM or kept as a list of nodes walked at
//! render time (the legacy backend and the profiling switch).

use std::sync::Arc;

use crate::{
    bytecode::{self, Code},
    context::Context,
    error::{LiquidError, ParseResult, RenderResult},
    expression::Variable,
    legacy::LegacyTokenizer,
    parse_context::ParseContext,
    tag::{SectionBody, Tag, TagMarkup, TagParser, TagSection, TagShape},
    tokenizer::{TokenKind, TokenSource, Tokenizer, count_lines, is_word},
};

/// One parsed element of a body.
#[derive(Debug, Clone)]
pub enum Node {
    /// Literal text, already whitespace-trimmed.
    Text(String),
    /// `{{ markup }}`.
    Variable {
        variable: Variable,
        markup: String,
        line_number: u32,
    },
    Tag(Arc<dyn Tag>),
}

#[derive(Debug, Clone)]
enum Body {
    Compiled(Arc<Code>),
    Walked(Arc<[Node]>),
}

/// A parsed body: the template root or one section of a block tag.
#[derive(Debug, Clone)]
pub struct BlockBody {
    body: Body,
    /// Nodes charged to the render score each time the body renders.
    node_count: usize,
    blank: bool,
}

impl Default for BlockBody {
    fn default() -> Self {
        Self::walked(Vec::new(), true)
    }
}

impl BlockBody {
    /// A body rendered by walking `nodes`.
    #[must_use]
    pub fn walked(nodes: Vec<Node>, blank: bool) -> Self {
        Self {
            node_count: nodes.len(),
            body: Body::Walked(nodes.into()),
            blank,
        }
    }

    /// A body rendered by the VM.
    #[must_use]
    pub fn compiled(code: Code, node_count: usize, blank: bool) -> Self {
        Self {
            body: Body::Compiled(Arc::new(code)),
            node_count,
            blank,
        }
    }

    /// Lowers `nodes` to a program.
    pub fn compile(nodes: &[Node], blank: bool, context: &ParseContext<'_>) -> ParseResult<Self> {
        let mut compiler = context.new_compiler();
        for node in nodes {
            match node {
                Node::Text(text) => compiler.add_write_raw(text),
                Node::Variable {
                    variable, line_number, ..
                } => compiler.add_render_variable(variable, Some(*line_number))?,
                Node::Tag(tag) => compiler.add_tag(Arc::clone(tag))?,
            }
        }
        Ok(Self::compiled(compiler.finish(), nodes.len(), blank))
    }

    /// Whether the body produces no output: only blank tags and whitespace.
    #[must_use]
    pub fn blank(&self) -> bool {
        self.blank
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.node_count
    }

    #[must_use]
    pub fn is_compiled(&self) -> bool {
        matches!(self.body, Body::Compiled(_))
    }

    /// The program of a compiled body.
    #[must_use]
    pub fn code(&self) -> Option<&Code> {
        match &self.body {
            Body::Compiled(code) => Some(code),
            Body::Walked(_) => None,
        }
    }

    /// The nodes of a walked body.
    #[must_use]
    pub fn nodes(&self) -> Option<&[Node]> {
        match &self.body {
            Body::Compiled(_) => None,
            Body::Walked(nodes) => Some(nodes),
        }
    }

    /// Bytecode listing of a compiled body; empty for walked bodies.
    #[must_use]
    pub fn disassemble(&self) -> String {
        self.code().map(Code::disassemble).unwrap_or_default()
    }

    /// Renders the body, appending to `output`.
    pub fn render(&self, context: &mut Context<'_>, output: &mut String) -> RenderResult<()> {
        context.increment_render_score(self.node_count)?;
        match &self.body {
            Body::Compiled(code) => bytecode::render(code, context, output),
            Body::Walked(nodes) => render_nodes(nodes, context, output),
        }
    }

    /// Renders the body into a fresh string.
    pub fn render_to_string(&self, context: &mut Context<'_>) -> RenderResult<String> {
        let mut output = String::new();
        self.render(context, &mut output)?;
        Ok(output)
    }
}

fn render_nodes(nodes: &[Node], context: &mut Context<'_>, output: &mut String) -> RenderResult<()> {
    for node in nodes {
        match node {
            Node::Text(text) => output.push_str(text),
            Node::Variable {
                variable, line_number, ..
            } => {
                let written = context
                    .evaluate_variable(variable)
                    .and_then(|value| context.write_value(&value, output));
                if let Err(err) = written {
                    let text = context.handle_error(err, Some(*line_number))?;
                    output.push_str(&text);
                }
            }
            Node::Tag(tag) => {
                if let Some(tracer) = context.tracer() {
                    tracer.on_node(tag.name(), tag.line_number());
                }
                if let Err(err) = tag.render(context, output) {
                    let text = context.handle_error(err, tag.line_number())?;
                    output.push_str(&text);
                }
                context.increment_write_score(output.len())?;
                if context.has_interrupt() {
                    break;
                }
                continue;
            }
        }
        context.increment_write_score(output.len())?;
    }
    Ok(())
}

// ============================================================================
// Parsing
// ============================================================================

/// Parses a whole template body.
pub(crate) fn parse_document<'s>(tokens: &mut dyn TokenSource<'s>, context: &mut ParseContext<'_>) -> ParseResult<BlockBody> {
    let parsed = parse_nodes(tokens, context, None)?;
    finish_body(parsed.nodes, parsed.blank, false, context)
}

/// The block tag whose body is being parsed.
struct Enclosing<'a> {
    name: &'a str,
    end: &'a str,
    intermediates: &'a [&'a str],
}

/// The tag that stopped a body: the enclosing block's end or an intermediate.
struct Delimiter<'s> {
    name: &'s str,
    markup: &'s str,
    line_number: u32,
}

struct Parsed<'s> {
    nodes: Vec<Node>,
    blank: bool,
    delimiter: Option<Delimiter<'s>>,
}

fn parse_nodes<'s>(
    tokens: &mut dyn TokenSource<'s>,
    context: &mut ParseContext<'_>,
    enclosing: Option<&Enclosing<'_>>,
) -> ParseResult<Parsed<'s>> {
    let mut nodes = Vec::new();
    let mut blank = true;
    while let Some(token) = tokens.shift() {
        context.set_line_number(token.line_number);
        match token.kind {
            TokenKind::Text => {
                let text = tokens.trimmed_text(&token);
                if text.is_empty() {
                    continue;
                }
                blank &= text.trim().is_empty();
                nodes.push(Node::Text(text.to_owned()));
            }
            TokenKind::Invalid => {
                let text = tokens.text(&token);
                let message = if text.starts_with("{{") {
                    format!("Variable '{text}' was not properly terminated with regexp: /\\}}\\}}/")
                } else {
                    format!("Tag '{text}' was not properly terminated with regexp: /\\%\\}}/")
                };
                return Err(context.locate(LiquidError::syntax(message)));
            }
            TokenKind::Variable => {
                let markup = tokens.trimmed_text(&token);
                let variable = context.parse_variable(markup)?;
                blank = false;
                nodes.push(Node::Variable {
                    variable,
                    markup: markup.to_owned(),
                    line_number: token.line_number,
                });
            }
            TokenKind::Tag => {
                let text = tokens.trimmed_text(&token);
                let Some(split) = split_tag(text) else {
                    if tokens.for_liquid_tag() {
                        if text.is_empty() {
                            continue;
                        }
                        return Err(context.locate(LiquidError::syntax(format!("Unknown tag '{text}'"))));
                    }
                    let message = format!(
                        "Tag '{}' was not properly terminated with regexp: /\\%\\}}/",
                        tokens.text(&token)
                    );
                    return Err(context.locate(LiquidError::syntax(message)));
                };
                if split.name == "#" {
                    // inline comment
                    continue;
                }
                if let Some(enclosing) = enclosing
                    && (split.name == enclosing.end || enclosing.intermediates.contains(&split.name))
                {
                    return Ok(Parsed {
                        nodes,
                        blank,
                        delimiter: Some(Delimiter {
                            name: split.name,
                            markup: split.markup,
                            line_number: token.line_number,
                        }),
                    });
                }
                let environment = context.environment();
                let Some(parser) = environment.tags.get(split.name) else {
                    return Err(context.locate(unknown_tag(split.name, enclosing)));
                };
                let markup_line = token.line_number + split.markup_line_offset;
                let tag = parse_tag(tokens, context, parser.as_ref(), &split, token.line_number, markup_line)?;
                blank &= tag.blank();
                nodes.push(Node::Tag(tag));
            }
        }
    }
    if let Some(enclosing) = enclosing {
        return Err(context.locate(LiquidError::syntax(format!(
            "'{}' tag was never closed",
            enclosing.name
        ))));
    }
    Ok(Parsed {
        nodes,
        blank,
        delimiter: None,
    })
}

fn unknown_tag(name: &str, enclosing: Option<&Enclosing<'_>>) -> LiquidError {
    let message = match enclosing {
        Some(block) if name == "else" => format!("{} tag does not expect 'else' tag", block.name),
        Some(block) if name.starts_with("end") => format!(
            "'{name}' is not a valid delimiter for {} tags. use {}",
            block.name, block.end
        ),
        None if name == "else" || name == "end" => format!("Unexpected outer '{name}' tag"),
        _ => format!("Unknown tag '{name}'"),
    };
    LiquidError::syntax(message)
}

/// `name markup` split out of a tag's inner text.
struct TagSplit<'s> {
    name: &'s str,
    markup: &'s str,
    /// Newlines between the start of the tag text and the markup.
    markup_line_offset: u32,
}

fn split_tag(text: &str) -> Option<TagSplit<'_>> {
    let start = text.len() - text.trim_start().len();
    let rest = &text[start..];
    let name_len = if rest.starts_with('#') {
        1
    } else {
        rest.bytes().take_while(|&b| is_word(b)).count()
    };
    if name_len == 0 {
        return None;
    }
    let after = &rest[name_len..];
    let markup = after.trim();
    let lead = after.len() - after.trim_start().len();
    Some(TagSplit {
        name: &rest[..name_len],
        markup,
        markup_line_offset: count_lines(&text[..start]) + count_lines(&after[..lead]),
    })
}

fn parse_tag<'s>(
    tokens: &mut dyn TokenSource<'s>,
    context: &mut ParseContext<'_>,
    parser: &dyn TagParser,
    split: &TagSplit<'s>,
    line_number: u32,
    markup_line: u32,
) -> ParseResult<Arc<dyn Tag>> {
    let line = context.options().line_numbers.then_some(line_number);
    let mut markup = TagMarkup::simple(split.name, split.markup, line);
    match parser.shape() {
        TagShape::Simple => {}
        TagShape::Block { end, intermediates } => {
            let enclosing = Enclosing {
                name: split.name,
                end,
                intermediates,
            };
            let mut pending = Vec::new();
            let mut current = (split.name, split.markup, line_number);
            loop {
                let parsed = context.nested(|context| parse_nodes(tokens, context, Some(&enclosing)))?;
                pending.push((current, parsed.nodes, parsed.blank));
                match parsed.delimiter {
                    Some(delimiter) if delimiter.name != end => {
                        current = (delimiter.name, delimiter.markup, delimiter.line_number);
                    }
                    _ => break,
                }
            }
            // whitespace in a tag's bodies is dropped only when every section is blank
            let blank = pending.iter().all(|(_, _, blank)| *blank);
            for ((name, section_markup, section_line), nodes, section_blank) in pending {
                markup.sections.push(TagSection {
                    name: name.to_owned(),
                    markup: section_markup.to_owned(),
                    line_number: context.options().line_numbers.then_some(section_line),
                    body: SectionBody::Block(finish_body(nodes, section_blank, blank, context)?),
                });
            }
        }
        TagShape::Raw { end } => {
            let body = if tokens.for_liquid_tag() {
                raw_lines(tokens, end)
            } else {
                tokens.shift_raw_body(end).map(|raw| raw.body.to_owned())
            };
            let Some(body) = body else {
                return Err(context.locate(LiquidError::syntax(format!("'{}' tag was never closed", split.name))));
            };
            markup.sections.push(TagSection {
                name: split.name.to_owned(),
                markup: split.markup.to_owned(),
                line_number: line,
                body: SectionBody::Raw(body),
            });
        }
        TagShape::Liquid => {
            let source = split.markup;
            let parsed = context.nested(|context| {
                let mut inner = tokenizer(context, source, markup_line, true)?;
                parse_nodes(inner.as_mut(), context, None)
            })?;
            context.set_line_number(line_number);
            let body = finish_body(parsed.nodes, parsed.blank, parsed.blank, context)?;
            markup.sections.push(TagSection {
                name: split.name.to_owned(),
                markup: String::new(),
                line_number: line,
                body: SectionBody::Block(body),
            });
        }
    }
    context.set_line_number(line_number);
    parser.build(markup, context).map_err(|err| context.locate(err))
}

/// Collects liquid-tag lines up to the line naming `end`.
fn raw_lines<'s>(tokens: &mut dyn TokenSource<'s>, end: &str) -> Option<String> {
    let mut lines = Vec::new();
    loop {
        let (_, line) = tokens.shift_trimmed()?;
        if split_tag(line).is_some_and(|split| split.name == end) {
            return Some(lines.join("\n"));
        }
        lines.push(line);
    }
}

/// Builds the body, dropping whitespace-only text when `strip_blank` is set.
fn finish_body(mut nodes: Vec<Node>, blank: bool, strip_blank: bool, context: &ParseContext<'_>) -> ParseResult<BlockBody> {
    if strip_blank {
        nodes.retain(|node| !matches!(node, Node::Text(_)));
    }
    if context.compiled() {
        BlockBody::compile(&nodes, blank, context)
    } else {
        Ok(BlockBody::walked(nodes, blank))
    }
}

/// A tokenizer for `source` matching the parse's backend.
pub(crate) fn tokenizer<'s>(
    context: &ParseContext<'_>,
    source: &'s str,
    start_line: u32,
    for_liquid_tag: bool,
) -> ParseResult<Box<dyn TokenSource<'s> + 's>> {
    if context.legacy() {
        Ok(Box::new(LegacyTokenizer::new(source, start_line, for_liquid_tag)))
    } else {
        Ok(Box::new(Tokenizer::new(source, start_line, for_liquid_tag)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{parse_context::ParseOptions, template::Environment};

    fn parse(source: &str) -> ParseResult<BlockBody> {
        let environment = Environment::standard();
        let mut context = ParseContext::new(&environment, ParseOptions::default());
        let mut tokens = Tokenizer::new(source, 1, false)?;
        parse_document(&mut tokens, &mut context)
    }

    fn error(source: &str) -> String {
        parse(source).unwrap_err().message().to_owned()
    }

    #[test]
    fn trimmed_text_does_not_become_a_node() {
        assert_eq!(parse("{{ a -}}     {{- b }}").unwrap().node_count(), 2);
        assert_eq!(parse("{{ a -}} foo {{- b }}").unwrap().node_count(), 3);
    }

    #[test]
    fn unterminated_markup() {
        assert_eq!(
            error("{{ a } b"),
            "Variable '{{ a }' was not properly terminated with regexp: /\\}\\}/"
        );
        assert_eq!(error("{% if"), "Tag '{%' was not properly terminated with regexp: /\\%\\}/");
        assert_eq!(
            error("{{ a }"),
            "Variable '{{' was not properly terminated with regexp: /\\}\\}/"
        );
    }

    #[test]
    fn tag_errors() {
        assert_eq!(error("{% foo %}"), "Unknown tag 'foo'");
        assert_eq!(error("{% for a in b %}"), "'for' tag was never closed");
        assert_eq!(
            error("{% if true %}{% endfor %}"),
            "'endfor' is not a valid delimiter for if tags. use endif"
        );
        assert_eq!(error("{% else %}"), "Unexpected outer 'else' tag");
        assert_eq!(error("{% for a in b %}{% elsif %}{% endfor %}"), "Unknown tag 'elsif'");
    }

    #[test]
    fn blank_bodies_drop_whitespace() {
        let body = parse("{% if true %}  {% assign a = 1 %}  {% endif %}").unwrap();
        assert!(body.blank());
        let body = parse("  {{ a }}  ").unwrap();
        assert!(!body.blank());
        assert_eq!(body.node_count(), 3);
    }

    #[test]
    fn liquid_tag_lines() {
        let body = parse("{% liquid\n  assign a = 1\n\n  echo a\n%}").unwrap();
        assert_eq!(body.node_count(), 1);
    }

    #[test]
    fn split_tag_name_and_markup() {
        let split = split_tag(" for  i in x ").unwrap();
        assert_eq!((split.name, split.markup), ("for", "i in x"));
        let split = split_tag("liquid\n  echo a").unwrap();
        assert_eq!((split.name, split.markup, split.markup_line_offset), ("liquid", "echo a", 1));
        assert!(split_tag("  ").is_none());
    }
}
