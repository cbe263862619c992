//! Dumping and loading parsed templates.
//!
//! A dump is a postcard-encoded [`FORMAT_VERSION`] followed by a record tree
//! mirroring the template: compiled bodies keep their bytecode and constants,
//! walked bodies keep their nodes, and every tag is recorded by its markup.
//! Loading rebuilds tags through the environment's registry, so the loading
//! environment must know every tag the dumped template uses. Loaded bytecode
//! is validated before use.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{
    block::{BlockBody, Node},
    bytecode::{Code, Constant},
    error::{LiquidError, ParseResult},
    parse_context::{ParseContext, ParseOptions},
    tag::{SectionBody, Tag, TagMarkup, TagSection},
    template::{Environment, Template},
};

/// Version written at the start of every dump; loads of any other version fail.
pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct DocumentRecord {
    line_numbers: bool,
    used_fallback: bool,
    root: BodyRecord,
}

#[derive(Debug, Serialize, Deserialize)]
enum BodyRecord {
    Compiled {
        bytecode: Vec<u8>,
        constants: Vec<Constant>,
        max_stack_size: u16,
        node_count: u64,
        blank: bool,
        /// The program's `write_node` table.
        tags: Vec<TagRecord>,
    },
    Walked {
        nodes: Vec<NodeRecord>,
        blank: bool,
    },
}

#[derive(Debug, Serialize, Deserialize)]
enum NodeRecord {
    Text(String),
    Variable { markup: String, line_number: u32 },
    Tag(TagRecord),
}

#[derive(Debug, Serialize, Deserialize)]
struct TagRecord {
    name: String,
    markup: String,
    line_number: Option<u32>,
    sections: Vec<SectionRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SectionRecord {
    name: String,
    markup: String,
    line_number: Option<u32>,
    body: SectionBodyRecord,
}

#[derive(Debug, Serialize, Deserialize)]
enum SectionBodyRecord {
    Block(BodyRecord),
    Raw(String),
}

/// Encodes `template` into a self-describing byte string.
pub fn dump(template: &Template) -> ParseResult<Vec<u8>> {
    let record = DocumentRecord {
        line_numbers: template.line_numbers(),
        used_fallback: template.used_fallback(),
        root: body_record(template.root()),
    };
    Ok(postcard::to_allocvec(&(FORMAT_VERSION, record))?)
}

/// Decodes a dump produced by [`dump`], rebuilding tags from `environment`.
pub fn load(bytes: &[u8], environment: &Environment) -> ParseResult<Template> {
    let (version, rest) = postcard::take_from_bytes::<u32>(bytes)?;
    if version != FORMAT_VERSION {
        return Err(LiquidError::serialization(format!(
            "unsupported template format version {version}, expected {FORMAT_VERSION}"
        )));
    }
    let record: DocumentRecord = postcard::from_bytes(rest)?;
    let options = ParseOptions {
        line_numbers: record.line_numbers,
        ..ParseOptions::default()
    };
    let mut context = ParseContext::new(environment, options);
    let root = load_body(record.root, &mut context)?;
    Ok(Template::new(root, Vec::new(), record.used_fallback, record.line_numbers))
}

// ============================================================================
// Dumping
// ============================================================================

fn body_record(body: &BlockBody) -> BodyRecord {
    match (body.code(), body.nodes()) {
        (Some(code), _) => BodyRecord::Compiled {
            bytecode: code.bytecode().to_vec(),
            constants: code.constants().to_vec(),
            max_stack_size: code.max_stack_size(),
            node_count: u64::try_from(body.node_count()).unwrap_or(u64::MAX),
            blank: body.blank(),
            tags: code.nodes().iter().map(|tag| tag_record(tag.as_ref())).collect(),
        },
        (None, nodes) => BodyRecord::Walked {
            nodes: nodes.unwrap_or_default().iter().map(node_record).collect(),
            blank: body.blank(),
        },
    }
}

fn node_record(node: &Node) -> NodeRecord {
    match node {
        Node::Text(text) => NodeRecord::Text(text.clone()),
        Node::Variable {
            markup, line_number, ..
        } => NodeRecord::Variable {
            markup: markup.clone(),
            line_number: *line_number,
        },
        Node::Tag(tag) => NodeRecord::Tag(tag_record(tag.as_ref())),
    }
}

fn tag_record(tag: &dyn Tag) -> TagRecord {
    let markup = tag.markup();
    TagRecord {
        name: markup.name.clone(),
        markup: markup.markup.clone(),
        line_number: markup.line_number,
        sections: markup
            .sections
            .iter()
            .map(|section| SectionRecord {
                name: section.name.clone(),
                markup: section.markup.clone(),
                line_number: section.line_number,
                body: match &section.body {
                    SectionBody::Block(body) => SectionBodyRecord::Block(body_record(body)),
                    SectionBody::Raw(text) => SectionBodyRecord::Raw(text.clone()),
                },
            })
            .collect(),
    }
}

// ============================================================================
// Loading
// ============================================================================

fn load_body(record: BodyRecord, context: &mut ParseContext<'_>) -> ParseResult<BlockBody> {
    match record {
        BodyRecord::Compiled {
            bytecode,
            constants,
            max_stack_size,
            node_count,
            blank,
            tags,
        } => {
            let nodes = tags
                .into_iter()
                .map(|tag| load_tag(tag, context))
                .collect::<ParseResult<Vec<_>>>()?;
            let code = Code::from_parts(bytecode, constants, nodes, max_stack_size)?;
            let node_count = usize::try_from(node_count)
                .map_err(|_| LiquidError::serialization("node count out of range"))?;
            Ok(BlockBody::compiled(code, node_count, blank))
        }
        BodyRecord::Walked { nodes, blank } => {
            let nodes = nodes
                .into_iter()
                .map(|node| load_node(node, context))
                .collect::<ParseResult<Vec<_>>>()?;
            Ok(BlockBody::walked(nodes, blank))
        }
    }
}

fn load_node(record: NodeRecord, context: &mut ParseContext<'_>) -> ParseResult<Node> {
    Ok(match record {
        NodeRecord::Text(text) => Node::Text(text),
        NodeRecord::Variable { markup, line_number } => {
            context.set_line_number(line_number);
            Node::Variable {
                variable: context.parse_variable(&markup)?,
                markup,
                line_number,
            }
        }
        NodeRecord::Tag(tag) => Node::Tag(load_tag(tag, context)?),
    })
}

fn load_tag(record: TagRecord, context: &mut ParseContext<'_>) -> ParseResult<Arc<dyn Tag>> {
    let environment = context.environment();
    let Some(parser) = environment.tags.get(&record.name) else {
        return Err(LiquidError::serialization(format!(
            "unknown tag '{}' in serialized template",
            record.name
        )));
    };
    let mut sections = Vec::with_capacity(record.sections.len());
    for section in record.sections {
        let body = match section.body {
            SectionBodyRecord::Block(body) => SectionBody::Block(load_body(body, context)?),
            SectionBodyRecord::Raw(text) => SectionBody::Raw(text),
        };
        sections.push(TagSection {
            name: section.name,
            markup: section.markup,
            line_number: section.line_number,
            body,
        });
    }
    let markup = TagMarkup {
        name: record.name,
        markup: record.markup,
        line_number: record.line_number,
        sections,
    };
    if let Some(line_number) = markup.line_number {
        context.set_line_number(line_number);
    }
    parser.build(markup, context)
}
