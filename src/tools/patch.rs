//! Declarative structural patches over the scene tree
//!
//! A patch is a list of DOM operations addressed by element paths such as
//! `scene/room/cube[1]`. The first segment names the root; each following
//! segment selects the n-th child element with that name (zero-based, `[0]`
//! when omitted). Patches apply to a private copy of the tree: either every
//! operation succeeds or the caller gets an error and the original tree.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::trace;

use crate::scene::markup::{is_valid_name, parse_fragment, Element, Node};

/// Failure of one patch operation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("operation {index} ({op}) failed: {reason}")]
pub struct MutationError {
    /// Zero-based position of the failing operation
    pub index: usize,

    /// Operation kind
    pub op: &'static str,

    pub reason: String,
}

/// One DOM operation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PatchOperation {
    /// Append markup as the last children of `target`
    Append { target: String, xml: String },
    /// Replace `target` with markup
    Replace { target: String, xml: String },
    /// Remove `target` and its subtree
    Remove { target: String },
    /// Set an attribute on `target`
    SetAttribute {
        target: String,
        name: String,
        value: String,
    },
    /// Remove an attribute from `target` (no-op when absent)
    RemoveAttribute { target: String, name: String },
    /// Replace the children of `target` with text
    SetText { target: String, text: String },
    /// Change the tag name of `target`
    Rename { target: String, name: String },
}

impl PatchOperation {
    pub fn kind(&self) -> &'static str {
        match self {
            PatchOperation::Append { .. } => "append",
            PatchOperation::Replace { .. } => "replace",
            PatchOperation::Remove { .. } => "remove",
            PatchOperation::SetAttribute { .. } => "set_attribute",
            PatchOperation::RemoveAttribute { .. } => "remove_attribute",
            PatchOperation::SetText { .. } => "set_text",
            PatchOperation::Rename { .. } => "rename",
        }
    }

    pub fn target(&self) -> &str {
        match self {
            PatchOperation::Append { target, .. }
            | PatchOperation::Replace { target, .. }
            | PatchOperation::Remove { target }
            | PatchOperation::SetAttribute { target, .. }
            | PatchOperation::RemoveAttribute { target, .. }
            | PatchOperation::SetText { target, .. }
            | PatchOperation::Rename { target, .. } => target,
        }
    }
}

/// Arguments of the structural patch tool
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchScript {
    pub operations: Vec<PatchOperation>,
}

/// Step of a [`NodePath`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PathStep {
    pub name: String,
    pub nth: usize,
}

/// Slash-separated element path starting at the root
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodePath {
    steps: Vec<PathStep>,
}

impl NodePath {
    pub fn steps(&self) -> &[PathStep] {
        &self.steps
    }

    /// Whether the path addresses the root element
    pub fn is_root(&self) -> bool {
        self.steps.len() == 1
    }

    /// Child steps below the root
    fn descent(&self) -> &[PathStep] {
        &self.steps[1..]
    }
}

impl FromStr for NodePath {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim().trim_matches('/');
        if trimmed.is_empty() {
            return Err("empty element path".to_string());
        }

        let steps = trimmed
            .split('/')
            .map(|part| parse_step(part).ok_or_else(|| format!("invalid path segment `{}`", part)))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { steps })
    }
}

impl fmt::Display for NodePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, step) in self.steps.iter().enumerate() {
            if i > 0 {
                f.write_str("/")?;
            }
            write!(f, "{}[{}]", step.name, step.nth)?;
        }
        Ok(())
    }
}

fn parse_step(part: &str) -> Option<PathStep> {
    let (name, nth) = match part.find('[') {
        Some(open) => {
            let index = part[open + 1..].strip_suffix(']')?;
            (&part[..open], index.parse::<usize>().ok()?)
        }
        None => (part, 0),
    };

    if !is_valid_name(name) {
        return None;
    }
    Some(PathStep {
        name: name.to_string(),
        nth,
    })
}

/// Apply a patch to a copy of `root`
pub fn apply_script(root: &Element, script: &PatchScript) -> Result<Element, MutationError> {
    let mut working = root.clone();

    for (index, operation) in script.operations.iter().enumerate() {
        trace!(index, op = operation.kind(), target = operation.target(), "applying patch operation");
        apply_operation(&mut working, operation).map_err(|reason| MutationError {
            index,
            op: operation.kind(),
            reason,
        })?;
    }

    Ok(working)
}

fn apply_operation(root: &mut Element, operation: &PatchOperation) -> Result<(), String> {
    let path: NodePath = operation.target().parse()?;
    if path.steps[0].name != root.name || path.steps[0].nth != 0 {
        return Err(format!(
            "path `{}` does not start at the root element <{}>",
            operation.target(),
            root.name
        ));
    }

    match operation {
        PatchOperation::Append { xml, .. } => {
            let nodes = parse_markup(xml)?;
            resolve_mut(root, &path)?.children.extend(nodes);
        }
        PatchOperation::Replace { xml, .. } => {
            let nodes = parse_markup(xml)?;
            if path.is_root() {
                *root = single_element(nodes)?;
            } else {
                let (parent, position) = resolve_parent_mut(root, &path)?;
                parent.children.splice(position..=position, nodes);
            }
        }
        PatchOperation::Remove { .. } => {
            if path.is_root() {
                return Err("the root element cannot be removed".to_string());
            }
            let (parent, position) = resolve_parent_mut(root, &path)?;
            parent.children.remove(position);
        }
        PatchOperation::SetAttribute { name, value, .. } => {
            ensure_name(name)?;
            resolve_mut(root, &path)?.set_attribute(name.clone(), value.clone());
        }
        PatchOperation::RemoveAttribute { name, .. } => {
            resolve_mut(root, &path)?.remove_attribute(name);
        }
        PatchOperation::SetText { text, .. } => {
            resolve_mut(root, &path)?.set_text(text.clone());
        }
        PatchOperation::Rename { name, .. } => {
            ensure_name(name)?;
            resolve_mut(root, &path)?.name = name.clone();
        }
    }

    Ok(())
}

fn parse_markup(xml: &str) -> Result<Vec<Node>, String> {
    parse_fragment(xml).map_err(|e| e.to_string())
}

fn single_element(nodes: Vec<Node>) -> Result<Element, String> {
    let mut elements = Vec::new();
    for node in nodes {
        match node {
            Node::Element(element) => elements.push(element),
            Node::Text(text) if text.trim().is_empty() => {}
            Node::Text(_) => return Err("the root cannot be replaced by text".to_string()),
        }
    }

    match elements.len() {
        1 => Ok(elements.remove(0)),
        _ => Err("replacing the root requires exactly one element".to_string()),
    }
}

fn ensure_name(name: &str) -> Result<(), String> {
    if is_valid_name(name) {
        Ok(())
    } else {
        Err(format!("`{}` is not a valid name", name))
    }
}

/// Position in `children` of the n-th child element named `name`
fn child_position(element: &Element, step: &PathStep) -> Option<usize> {
    element
        .children
        .iter()
        .enumerate()
        .filter(|(_, child)| matches!(child, Node::Element(e) if e.name == step.name))
        .nth(step.nth)
        .map(|(position, _)| position)
}

fn descend_mut<'a>(element: &'a mut Element, step: &PathStep) -> Result<&'a mut Element, String> {
    let position = child_position(element, step)
        .ok_or_else(|| format!("no element <{}> at index {}", step.name, step.nth))?;
    match &mut element.children[position] {
        Node::Element(child) => Ok(child),
        Node::Text(_) => Err(format!("no element <{}> at index {}", step.name, step.nth)),
    }
}

fn resolve_mut<'a>(root: &'a mut Element, path: &NodePath) -> Result<&'a mut Element, String> {
    let mut current = root;
    for step in path.descent() {
        current = descend_mut(current, step)?;
    }
    Ok(current)
}

/// Resolve the parent of the addressed element and the element's child position
fn resolve_parent_mut<'a>(
    root: &'a mut Element,
    path: &NodePath,
) -> Result<(&'a mut Element, usize), String> {
    let descent = path.descent();
    let Some((last, ancestors)) = descent.split_last() else {
        return Err("the root element has no parent".to_string());
    };

    let mut parent = root;
    for step in ancestors {
        parent = descend_mut(parent, step)?;
    }
    let position = child_position(parent, last)
        .ok_or_else(|| format!("no element <{}> at index {}", last.name, last.nth))?;
    Ok((parent, position))
}
