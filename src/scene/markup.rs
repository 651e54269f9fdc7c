//! Minimal scene markup tree
//!
//! Parses the element/attribute/text subset of XML used for scene documents
//! and serializes it back. Processing instructions, comments and doctype
//! declarations are skipped. Empty elements serialize self-closed.

use std::fmt::Write as _;

use thiserror::Error;

/// Markup syntax error
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("markup error at byte {position}: {message}")]
pub struct MarkupError {
    /// Byte offset of the error in the input
    pub position: usize,

    /// What went wrong
    pub message: String,
}

/// A node in the scene tree
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Node {
    Element(Element),
    Text(String),
}

/// An element with ordered attributes and children
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Element {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<Node>,
}

impl Element {
    /// Create an empty element
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Look up an attribute value
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Set an attribute, keeping its position if it already exists
    pub fn set_attribute(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.attributes.iter_mut().find(|(key, _)| *key == name) {
            Some((_, existing)) => *existing = value,
            None => self.attributes.push((name, value)),
        }
    }

    /// Remove an attribute, returning whether it existed
    pub fn remove_attribute(&mut self, name: &str) -> bool {
        let before = self.attributes.len();
        self.attributes.retain(|(key, _)| key != name);
        self.attributes.len() != before
    }

    /// Replace all children with a single text node
    pub fn set_text(&mut self, text: impl Into<String>) {
        let text = text.into();
        self.children.clear();
        if !text.is_empty() {
            self.children.push(Node::Text(text));
        }
    }

    /// Concatenated text of direct text children
    pub fn text(&self) -> String {
        self.children
            .iter()
            .filter_map(|child| match child {
                Node::Text(text) => Some(text.as_str()),
                Node::Element(_) => None,
            })
            .collect()
    }

    /// Child elements, skipping text
    pub fn child_elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|child| match child {
            Node::Element(element) => Some(element),
            Node::Text(_) => None,
        })
    }

    /// Serialize this element and its subtree
    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        self.write_xml(&mut out);
        out
    }

    fn write_xml(&self, out: &mut String) {
        out.push('<');
        out.push_str(&self.name);
        for (key, value) in &self.attributes {
            let _ = write!(out, " {}=\"{}\"", key, escape_attribute(value));
        }

        if self.children.is_empty() {
            out.push_str("/>");
            return;
        }

        out.push('>');
        for child in &self.children {
            match child {
                Node::Element(element) => element.write_xml(out),
                Node::Text(text) => out.push_str(&escape_text(text)),
            }
        }
        let _ = write!(out, "</{}>", self.name);
    }
}

/// Parse a complete document with exactly one root element
pub fn parse_document(input: &str) -> Result<Element, MarkupError> {
    let mut parser = MarkupParser { input, pos: 0, depth: 0 };
    parser.skip_misc()?;
    if parser.at_end() {
        return Err(parser.error("document has no root element"));
    }

    let root = parser.parse_element()?;
    parser.skip_misc()?;
    if !parser.at_end() {
        return Err(parser.error("content after the root element"));
    }
    Ok(root)
}

/// Parse a fragment of zero or more sibling nodes
pub fn parse_fragment(input: &str) -> Result<Vec<Node>, MarkupError> {
    let mut parser = MarkupParser { input, pos: 0, depth: 0 };
    let nodes = parser.parse_content()?;
    if !parser.at_end() {
        return Err(parser.error("unexpected closing tag in fragment"));
    }
    Ok(nodes)
}

/// Check that a string is usable as an element or attribute name
pub fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if is_name_start(c) => chars.all(is_name_char),
        _ => false,
    }
}

/// Deepest element nesting accepted before parsing fails
pub const MAX_DEPTH: usize = 256;

struct MarkupParser<'a> {
    input: &'a str,
    pos: usize,
    depth: usize,
}

impl<'a> MarkupParser<'a> {
    fn rest(&self) -> &'a str {
        &self.input[self.pos..]
    }

    fn at_end(&self) -> bool {
        self.pos >= self.input.len()
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn error(&self, message: &str) -> MarkupError {
        MarkupError {
            position: self.pos,
            message: message.to_string(),
        }
    }

    fn expect(&mut self, token: &str) -> Result<(), MarkupError> {
        if self.rest().starts_with(token) {
            self.pos += token.len();
            Ok(())
        } else {
            Err(self.error(&format!("expected `{}`", token)))
        }
    }

    fn skip_whitespace(&mut self) {
        let trimmed = self.rest().trim_start();
        self.pos = self.input.len() - trimmed.len();
    }

    fn skip_until(&mut self, terminator: &str) -> Result<(), MarkupError> {
        match self.rest().find(terminator) {
            Some(offset) => {
                self.pos += offset + terminator.len();
                Ok(())
            }
            None => Err(self.error(&format!("unterminated construct, missing `{}`", terminator))),
        }
    }

    /// Skip whitespace, comments, processing instructions and doctype outside the root
    fn skip_misc(&mut self) -> Result<(), MarkupError> {
        loop {
            self.skip_whitespace();
            if self.rest().starts_with("<?") {
                self.skip_until("?>")?;
            } else if self.rest().starts_with("<!--") {
                self.skip_until("-->")?;
            } else if self.rest().starts_with("<!DOCTYPE") {
                self.skip_until(">")?;
            } else {
                return Ok(());
            }
        }
    }

    fn parse_name(&mut self) -> Result<String, MarkupError> {
        let rest = self.rest();
        let mut chars = rest.char_indices();
        match chars.next() {
            Some((_, c)) if is_name_start(c) => {}
            _ => return Err(self.error("expected a name")),
        }

        let end = chars
            .find(|(_, c)| !is_name_char(*c))
            .map(|(i, _)| i)
            .unwrap_or(rest.len());
        self.pos += end;
        Ok(rest[..end].to_string())
    }

    fn parse_element(&mut self) -> Result<Element, MarkupError> {
        if self.depth >= MAX_DEPTH {
            return Err(self.error(&format!("elements nested deeper than {}", MAX_DEPTH)));
        }
        self.expect("<")?;
        let mut element = Element::new(self.parse_name()?);

        loop {
            self.skip_whitespace();
            if self.rest().starts_with("/>") {
                self.pos += 2;
                return Ok(element);
            }
            if self.rest().starts_with('>') {
                self.pos += 1;
                break;
            }

            let name = self.parse_name()?;
            self.skip_whitespace();
            self.expect("=")?;
            self.skip_whitespace();
            let value = self.parse_attribute_value()?;
            if element.attribute(&name).is_some() {
                return Err(self.error(&format!("duplicate attribute `{}`", name)));
            }
            element.attributes.push((name, value));
        }

        self.depth += 1;
        element.children = self.parse_content()?;
        self.depth -= 1;

        self.expect("</")?;
        let closing = self.parse_name()?;
        if closing != element.name {
            return Err(self.error(&format!(
                "mismatched closing tag `{}`, expected `{}`",
                closing, element.name
            )));
        }
        self.skip_whitespace();
        self.expect(">")?;
        Ok(element)
    }

    fn parse_attribute_value(&mut self) -> Result<String, MarkupError> {
        let quote = match self.peek() {
            Some(q @ ('"' | '\'')) => q,
            _ => return Err(self.error("expected a quoted attribute value")),
        };
        self.pos += 1;

        let rest = self.rest();
        let end = rest
            .find(quote)
            .ok_or_else(|| self.error("unterminated attribute value"))?;
        let raw = &rest[..end];
        if raw.contains('<') {
            return Err(self.error("`<` is not allowed in attribute values"));
        }
        let value = unescape(raw).map_err(|message| self.error(&message))?;
        self.pos += end + 1;
        Ok(value)
    }

    /// Parse children until a closing tag or the end of input
    fn parse_content(&mut self) -> Result<Vec<Node>, MarkupError> {
        let mut nodes = Vec::new();

        while !self.at_end() {
            let rest = self.rest();
            if rest.starts_with("</") {
                break;
            } else if rest.starts_with("<!--") {
                self.skip_until("-->")?;
            } else if rest.starts_with("<![CDATA[") {
                self.pos += "<![CDATA[".len();
                let rest = self.rest();
                let end = rest
                    .find("]]>")
                    .ok_or_else(|| self.error("unterminated CDATA section"))?;
                push_text(&mut nodes, &rest[..end]);
                self.pos += end + 3;
            } else if rest.starts_with("<?") {
                self.skip_until("?>")?;
            } else if rest.starts_with('<') {
                nodes.push(Node::Element(self.parse_element()?));
            } else {
                let end = rest.find('<').unwrap_or(rest.len());
                let text = unescape(&rest[..end]).map_err(|message| self.error(&message))?;
                push_text(&mut nodes, &text);
                self.pos += end;
            }
        }

        Ok(nodes)
    }
}

fn push_text(nodes: &mut Vec<Node>, text: &str) {
    if text.is_empty() {
        return;
    }
    if let Some(Node::Text(last)) = nodes.last_mut() {
        last.push_str(text);
    } else {
        nodes.push(Node::Text(text.to_string()));
    }
}

fn is_name_start(c: char) -> bool {
    c.is_alphabetic() || c == '_' || c == ':'
}

fn is_name_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | ':' | '-' | '.')
}

fn unescape(raw: &str) -> Result<String, String> {
    if !raw.contains('&') {
        return Ok(raw.to_string());
    }

    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(start) = rest.find('&') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let end = after
            .find(';')
            .ok_or_else(|| "unterminated entity reference".to_string())?;
        let entity = &after[..end];
        let decoded = match entity {
            "lt" => '<',
            "gt" => '>',
            "amp" => '&',
            "quot" => '"',
            "apos" => '\'',
            _ => decode_char_reference(entity)
                .ok_or_else(|| format!("unknown entity `&{};`", entity))?,
        };
        out.push(decoded);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

fn decode_char_reference(entity: &str) -> Option<char> {
    let code = if let Some(hex) = entity
        .strip_prefix("#x")
        .or_else(|| entity.strip_prefix("#X"))
    {
        u32::from_str_radix(hex, 16).ok()?
    } else {
        entity.strip_prefix('#')?.parse::<u32>().ok()?
    };
    char::from_u32(code)
}

fn escape_text(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn escape_attribute(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('"', "&quot;")
}
