//! Conversion between configuration trees and their XML text form.
//!
//! The reader is strict about structure: a document must hold exactly one root element, tags must
//! balance, no character data may appear outside the root, and nesting is limited to
//! `MAX_DEPTH` elements.  Whitespace-only text is dropped, as are declarations, comments,
//! processing instructions and doctypes; other text is kept as written.
//!
//! Element and attribute names must be XML names both ways, so anything written can be read back.

use log::trace;
use quick_xml::events::attributes::Attribute;
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use snafu::{ensure, OptionExt, ResultExt};
use std::borrow::Cow;

use crate::tree::{ConfigTree, Node};

/// Deepest element nesting accepted by `parse`.
pub const MAX_DEPTH: usize = 512;

/// Parses XML text into a configuration tree.
pub fn parse(xml: &str) -> Result<ConfigTree> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(false);

    let mut stack: Vec<Node> = Vec::new();
    let mut root: Option<Node> = None;

    loop {
        let position = reader.buffer_position();
        match reader.read_event().context(error::XmlSnafu { position })? {
            Event::Start(start) => {
                ensure_single_root(&root, &stack, position)?;
                ensure!(
                    stack.len() < MAX_DEPTH,
                    error::TooDeepSnafu {
                        position,
                        max: MAX_DEPTH,
                    }
                );
                stack.push(start_node(&start, position)?);
            }
            Event::Empty(start) => {
                ensure_single_root(&root, &stack, position)?;
                let node = start_node(&start, position)?;
                finish_node(node, &mut stack, &mut root);
            }
            Event::End(_) => {
                let node = stack
                    .pop()
                    .context(error::UnbalancedSnafu { position })?;
                finish_node(node, &mut stack, &mut root);
            }
            Event::Text(text) => {
                let text = text.unescape().context(error::XmlSnafu { position })?;
                append_text(&mut stack, &text, position)?;
            }
            Event::CData(cdata) => {
                let raw = cdata.into_inner();
                let text = std::str::from_utf8(&raw).context(error::EncodingSnafu { position })?;
                append_text(&mut stack, text, position)?;
            }
            Event::Eof => break,
            // Declarations, comments, processing instructions and doctypes carry no config.
            _ => {}
        }
    }

    ensure!(
        stack.is_empty(),
        error::UnclosedSnafu {
            name: stack.last().map(|n| n.name.clone()).unwrap_or_default(),
        }
    );
    let root = root.context(error::NoRootSnafu)?;
    trace!("Parsed tree with {} nodes", root.len());
    Ok(ConfigTree::from_root(root))
}

/// Serializes a configuration tree to XML text.
pub fn to_string(tree: &ConfigTree) -> Result<String> {
    check_names(tree.root())?;
    let mut writer = Writer::new(Vec::new());
    write_node(&mut writer, tree.root())?;
    String::from_utf8(writer.into_inner()).context(error::OutputEncodingSnafu)
}

/// Checks that every element and attribute name under `node` is a valid XML name.
pub fn check_names(node: &Node) -> Result<()> {
    ensure!(is_xml_name(&node.name), error::InvalidNameSnafu { name: &node.name });
    for (key, _) in &node.attributes {
        ensure!(is_xml_name(key), error::InvalidNameSnafu { name: key });
    }
    node.children.iter().try_for_each(check_names)
}

/// The Name production of XML 1.0.
fn is_xml_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if is_name_start_char(first) => chars.all(is_name_char),
        _ => false,
    }
}

fn is_name_start_char(c: char) -> bool {
    matches!(c,
        ':' | 'A'..='Z' | '_' | 'a'..='z'
        | '\u{C0}'..='\u{D6}'
        | '\u{D8}'..='\u{F6}'
        | '\u{F8}'..='\u{2FF}'
        | '\u{370}'..='\u{37D}'
        | '\u{37F}'..='\u{1FFF}'
        | '\u{200C}'..='\u{200D}'
        | '\u{2070}'..='\u{218F}'
        | '\u{2C00}'..='\u{2FEF}'
        | '\u{3001}'..='\u{D7FF}'
        | '\u{F900}'..='\u{FDCF}'
        | '\u{FDF0}'..='\u{FFFD}'
        | '\u{10000}'..='\u{EFFFF}')
}

fn is_name_char(c: char) -> bool {
    is_name_start_char(c)
        || matches!(c,
            '-' | '.' | '0'..='9' | '\u{B7}' | '\u{300}'..='\u{36F}' | '\u{203F}'..='\u{2040}')
}

fn ensure_single_root(root: &Option<Node>, stack: &[Node], position: usize) -> Result<()> {
    ensure!(
        !(root.is_some() && stack.is_empty()),
        error::MultipleRootsSnafu { position }
    );
    Ok(())
}

fn start_node(start: &BytesStart, position: usize) -> Result<Node> {
    let name = decode_name(start.name().as_ref(), position)?;
    let mut node = Node::new(name);
    for attribute in start.attributes() {
        let attribute: Attribute = attribute.context(error::AttributeSnafu { position })?;
        let key = decode_name(attribute.key.as_ref(), position)?;
        let value = attribute
            .unescape_value()
            .context(error::XmlSnafu { position })?;
        node.attributes.push((key, value.into_owned()));
    }
    Ok(node)
}

fn finish_node(node: Node, stack: &mut [Node], root: &mut Option<Node>) {
    match stack.last_mut() {
        Some(parent) => parent.children.push(node),
        None => *root = Some(node),
    }
}

fn append_text(stack: &mut [Node], text: &str, position: usize) -> Result<()> {
    if text.trim().is_empty() {
        return Ok(());
    }
    let node = stack
        .last_mut()
        .context(error::TextOutsideRootSnafu { position })?;
    match node.text.as_mut() {
        Some(existing) => existing.push_str(text),
        None => node.text = Some(text.to_string()),
    }
    Ok(())
}

fn decode_name(raw: &[u8], position: usize) -> Result<String> {
    let name = std::str::from_utf8(raw).context(error::EncodingSnafu { position })?;
    ensure!(is_xml_name(name), error::InvalidNameSnafu { name });
    Ok(name.to_string())
}

fn write_node(writer: &mut Writer<Vec<u8>>, node: &Node) -> Result<()> {
    let mut start = BytesStart::new(Cow::Borrowed(node.name.as_str()));
    for (key, value) in &node.attributes {
        start.push_attribute((key.as_str(), value.as_str()));
    }

    if node.text.is_none() && node.children.is_empty() {
        return writer
            .write_event(Event::Empty(start))
            .context(error::WriteSnafu { name: &node.name });
    }

    writer
        .write_event(Event::Start(start))
        .context(error::WriteSnafu { name: &node.name })?;
    if let Some(text) = &node.text {
        writer
            .write_event(Event::Text(BytesText::new(text)))
            .context(error::WriteSnafu { name: &node.name })?;
    }
    for child in &node.children {
        write_node(writer, child)?;
    }
    writer
        .write_event(Event::End(BytesEnd::new(Cow::Borrowed(node.name.as_str()))))
        .context(error::WriteSnafu { name: &node.name })
}

pub mod error {
    use snafu::Snafu;

    /// Errors from reading or writing the XML form of a tree.
    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub enum Error {
        #[snafu(display("Malformed XML at byte {}: {}", position, source))]
        Xml {
            position: usize,
            source: quick_xml::Error,
        },

        #[snafu(display("Malformed attribute at byte {}: {}", position, source))]
        Attribute {
            position: usize,
            source: quick_xml::events::attributes::AttrError,
        },

        #[snafu(display("Invalid UTF-8 at byte {}: {}", position, source))]
        Encoding {
            position: usize,
            source: std::str::Utf8Error,
        },

        #[snafu(display("Serialized XML was not UTF-8: {}", source))]
        OutputEncoding { source: std::string::FromUtf8Error },

        #[snafu(display("Document has more than one root element, second begins at byte {}", position))]
        MultipleRoots { position: usize },

        #[snafu(display("Document has no root element"))]
        NoRoot,

        #[snafu(display("Closing tag without matching opening tag at byte {}", position))]
        Unbalanced { position: usize },

        #[snafu(display("Element '{}' is never closed", name))]
        Unclosed { name: String },

        #[snafu(display("Character data outside the root element at byte {}", position))]
        TextOutsideRoot { position: usize },

        #[snafu(display("Elements nested deeper than {} at byte {}", max, position))]
        TooDeep { position: usize, max: usize },

        #[snafu(display("'{}' is not a valid XML name", name))]
        InvalidName { name: String },

        #[snafu(display("Failed to write element '{}': {}", name, source))]
        Write {
            name: String,
            source: quick_xml::Error,
        },
    }
}

pub use error::Error;
pub type Result<T> = std::result::Result<T, error::Error>;
