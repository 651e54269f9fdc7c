//! Tool dispatch for scene-editing turns
//!
//! The model may call one of two tools per turn. Arguments stream in as
//! fragments and are parsed incrementally; once the turn ends the first call
//! is resolved against the lookup table and executed exactly once against the
//! turn's snapshot. Handlers never touch the store: they return a proposed
//! document that the pipeline commits.

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::llm::transport::{ToolCallDelta, ToolSpec};
use crate::scene::markup::{parse_document, MarkupError};
use crate::stream::json_parser::{JsonStreamError, ParserOptions, StreamingJsonParser};
use crate::stream::path::PathSelector;
use crate::tools::patch::{apply_script, MutationError, PatchScript};

/// Message returned to the model after a successful tool call
pub const TOOL_DONE: &str = "Done";

/// Errors raised while resolving or executing a tool call
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ToolError {
    #[error("unknown tool `{0}`")]
    UnknownTool(String),

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("incomplete arguments: {0}")]
    IncompleteArguments(String),

    #[error(transparent)]
    Mutation(#[from] MutationError),

    #[error("invalid document: {0}")]
    InvalidDocument(String),

    #[error(transparent)]
    Markup(#[from] MarkupError),
}

/// Tools registered with the dispatcher
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ToolName {
    PatchScene,
    RewriteXml,
}

impl ToolName {
    pub const ALL: [ToolName; 2] = [ToolName::PatchScene, ToolName::RewriteXml];

    pub fn as_str(&self) -> &'static str {
        match self {
            ToolName::PatchScene => "patch_scene",
            ToolName::RewriteXml => "rewrite_xml",
        }
    }

    /// Look a tool up by the name the model used
    pub fn lookup(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|tool| tool.as_str() == name)
    }
}

/// A resolved tool call with typed arguments
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SceneTool {
    /// Structural patch applied to the parsed snapshot
    Patch(PatchScript),
    /// Full replacement of the document
    Rewrite { xml: String },
}

impl SceneTool {
    pub fn name(&self) -> ToolName {
        match self {
            SceneTool::Patch(_) => ToolName::PatchScene,
            SceneTool::Rewrite { .. } => ToolName::RewriteXml,
        }
    }
}

#[derive(Deserialize)]
struct RewriteArguments {
    xml: String,
}

/// A tool call declared by the model
#[derive(Clone, Debug, PartialEq)]
pub struct ToolInvocation {
    pub name: String,
    pub raw_arguments: String,
    pub parsed_arguments: Result<Value, JsonStreamError>,
}

impl ToolInvocation {
    /// Build an invocation from complete argument text
    pub fn new(name: impl Into<String>, raw_arguments: impl Into<String>) -> Self {
        let raw_arguments = raw_arguments.into();
        let mut arguments = ArgumentParser::new();
        arguments.write(&raw_arguments);
        Self {
            name: name.into(),
            parsed_arguments: arguments.finish(),
            raw_arguments,
        }
    }

    /// Resolve the tool and decode its arguments
    pub fn resolve(&self) -> Result<SceneTool, ToolError> {
        let tool =
            ToolName::lookup(&self.name).ok_or_else(|| ToolError::UnknownTool(self.name.clone()))?;

        let arguments = match &self.parsed_arguments {
            Ok(value) => value.clone(),
            Err(e) if e.is_incomplete() => {
                return Err(ToolError::IncompleteArguments(e.to_string()))
            }
            Err(e) => return Err(ToolError::InvalidArguments(e.to_string())),
        };
        if !arguments.is_object() {
            return Err(ToolError::InvalidArguments(
                "arguments must be a JSON object".to_string(),
            ));
        }

        let invalid = |e: serde_json::Error| ToolError::InvalidArguments(e.to_string());
        match tool {
            ToolName::PatchScene => Ok(SceneTool::Patch(
                serde_json::from_value::<PatchScript>(arguments).map_err(invalid)?,
            )),
            ToolName::RewriteXml => {
                let args = serde_json::from_value::<RewriteArguments>(arguments).map_err(invalid)?;
                Ok(SceneTool::Rewrite { xml: args.xml })
            }
        }
    }
}

/// Result of a dispatched tool call
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ToolOutcome {
    /// Text fed back as the turn's final content
    pub message: String,

    /// Proposed document, present only on success
    pub document: Option<String>,
}

impl ToolOutcome {
    pub fn is_success(&self) -> bool {
        self.document.is_some()
    }
}

/// Executes scene tools against a document snapshot
#[derive(Clone, Debug)]
pub struct ToolDispatcher {
    root_tag: String,
}

impl ToolDispatcher {
    pub fn new(root_tag: impl Into<String>) -> Self {
        Self {
            root_tag: root_tag.into(),
        }
    }

    pub fn root_tag(&self) -> &str {
        &self.root_tag
    }

    /// Function declarations sent with every scene request
    pub fn tool_specs(&self) -> Vec<ToolSpec> {
        let root = &self.root_tag;
        vec![
            ToolSpec {
                name: ToolName::PatchScene.as_str().to_string(),
                description: "Edit the scene in place with a list of DOM operations".to_string(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "operations": {
                            "type": "array",
                            "description": format!(
                                "Operations applied in order. `target` is a slash-separated element path from the root with optional zero-based indexes, e.g. `{root}/room/cube[1]`"
                            ),
                            "items": {
                                "type": "object",
                                "properties": {
                                    "op": {
                                        "type": "string",
                                        "enum": ["append", "replace", "remove", "set_attribute", "remove_attribute", "set_text", "rename"]
                                    },
                                    "target": { "type": "string" },
                                    "xml": { "type": "string", "description": "Markup for append and replace" },
                                    "name": { "type": "string", "description": "Attribute name, or the new tag name for rename" },
                                    "value": { "type": "string" },
                                    "text": { "type": "string" }
                                },
                                "required": ["op", "target"]
                            }
                        }
                    },
                    "required": ["operations"]
                }),
            },
            ToolSpec {
                name: ToolName::RewriteXml.as_str().to_string(),
                description: "Rewrite the entire scene xml".to_string(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "xml": {
                            "type": "string",
                            "description": format!("The new scene xml, top level tag must be <{root}>...</{root}>")
                        }
                    },
                    "required": ["xml"]
                }),
            },
        ]
    }

    /// Run a resolved tool against `current` and return the proposed document
    pub fn execute(&self, tool: &SceneTool, current: &str) -> Result<String, ToolError> {
        match tool {
            SceneTool::Patch(script) => {
                let root = parse_document(current)?;
                let patched = apply_script(&root, script)?;
                if patched.name != self.root_tag {
                    return Err(ToolError::InvalidDocument(format!(
                        "root element must stay <{}>",
                        self.root_tag
                    )));
                }
                Ok(patched.to_xml())
            }
            SceneTool::Rewrite { xml } => {
                let xml = xml.trim();
                if !xml.starts_with(&format!("<{}", self.root_tag)) {
                    return Err(ToolError::InvalidDocument(format!(
                        "document must start with <{}>",
                        self.root_tag
                    )));
                }
                let root = parse_document(xml)?;
                if root.name != self.root_tag {
                    return Err(ToolError::InvalidDocument(format!(
                        "root element is <{}>, expected <{}>",
                        root.name, self.root_tag
                    )));
                }
                Ok(xml.to_string())
            }
        }
    }

    /// Resolve and execute an invocation, converting errors to a message
    pub fn dispatch(&self, invocation: &ToolInvocation, current: &str) -> ToolOutcome {
        let result = invocation
            .resolve()
            .and_then(|tool| self.execute(&tool, current));

        match result {
            Ok(document) => {
                debug!(tool = %invocation.name, "tool call succeeded");
                ToolOutcome {
                    message: TOOL_DONE.to_string(),
                    document: Some(document),
                }
            }
            Err(e) => {
                warn!(tool = %invocation.name, error = %e, "tool call failed");
                ToolOutcome {
                    message: format!("Error: {}", e),
                    document: None,
                }
            }
        }
    }
}

/// Incremental parser for one tool-call argument blob
struct ArgumentParser {
    parser: StreamingJsonParser,
    value: Arc<Mutex<Option<Value>>>,
}

impl ArgumentParser {
    fn new() -> Self {
        let value = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&value);
        let options = ParserOptions {
            paths: vec![PathSelector::root()],
            keep_stack: true,
        };
        let parser = StreamingJsonParser::with_options(
            options,
            Box::new(move |streamed| *slot.lock() = Some(streamed.value)),
        );
        Self { parser, value }
    }

    fn write(&mut self, fragment: &str) {
        self.parser.write(fragment);
    }

    fn finish(mut self) -> Result<Value, JsonStreamError> {
        self.parser.end()?;
        self.value
            .lock()
            .take()
            .ok_or(JsonStreamError::Incomplete { depth: 0 })
    }
}

struct PendingCall {
    index: usize,
    name: Option<String>,
    raw_arguments: String,
    arguments: ArgumentParser,
}

/// Accumulates streamed tool-call fragments and keeps the first call only
#[derive(Default)]
pub struct ToolCallCollector {
    honored: Option<PendingCall>,
    ignored: BTreeSet<usize>,
}

impl ToolCallCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one fragment
    pub fn push(&mut self, delta: ToolCallDelta) {
        let call = self.honored.get_or_insert_with(|| PendingCall {
            index: delta.index,
            name: None,
            raw_arguments: String::new(),
            arguments: ArgumentParser::new(),
        });

        if call.index != delta.index {
            if self.ignored.insert(delta.index) {
                warn!(index = delta.index, "ignoring additional tool call in the same turn");
            }
            return;
        }

        if let Some(name) = delta.name.filter(|n| !n.is_empty()) {
            call.name.get_or_insert(name);
        }
        call.raw_arguments.push_str(&delta.arguments);
        call.arguments.write(&delta.arguments);
    }

    /// Whether any tool call was seen
    pub fn has_call(&self) -> bool {
        self.honored.is_some()
    }

    /// Number of additional calls that will be ignored
    pub fn ignored_calls(&self) -> usize {
        self.ignored.len()
    }

    /// Finish the stream and return the honored call, if any
    pub fn finish(self) -> Option<ToolInvocation> {
        let call = self.honored?;
        Some(ToolInvocation {
            name: call.name.unwrap_or_default(),
            parsed_arguments: call.arguments.finish(),
            raw_arguments: call.raw_arguments,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EMPTY: &str = "<scene></scene>";

    fn dispatcher() -> ToolDispatcher {
        ToolDispatcher::new("scene")
    }

    fn fragment(index: usize, name: Option<&str>, arguments: &str) -> ToolCallDelta {
        ToolCallDelta {
            index,
            name: name.map(str::to_string),
            arguments: arguments.to_string(),
        }
    }

    #[test]
    fn test_lookup_table() {
        assert_eq!(ToolName::lookup("patch_scene"), Some(ToolName::PatchScene));
        assert_eq!(ToolName::lookup("rewrite_xml"), Some(ToolName::RewriteXml));
        assert_eq!(ToolName::lookup("update_by_script"), None);
        assert_eq!(dispatcher().tool_specs().len(), ToolName::ALL.len());
    }

    #[test]
    fn test_rewrite_returns_document() {
        let invocation =
            ToolInvocation::new("rewrite_xml", r#"{"xml":"<scene><cube color=\"red\"/></scene>"}"#);
        let outcome = dispatcher().dispatch(&invocation, EMPTY);

        assert_eq!(outcome.message, "Done");
        assert_eq!(
            outcome.document.as_deref(),
            Some(r#"<scene><cube color="red"/></scene>"#)
        );
    }

    #[test]
    fn test_rewrite_is_idempotent() {
        let invocation = ToolInvocation::new("rewrite_xml", r#"{"xml":"<scene><a/></scene>"}"#);
        let first = dispatcher().dispatch(&invocation, EMPTY);
        let second = dispatcher().dispatch(&invocation, first.document.as_deref().unwrap());
        assert_eq!(first.document, second.document);
    }

    #[test]
    fn test_rewrite_requires_root_marker() {
        for xml in [r#"{"xml":"<world/>"}"#, r#"{"xml":"<scenery/>"}"#, r#"{"xml":"<scene>"}"#] {
            let outcome = dispatcher().dispatch(&ToolInvocation::new("rewrite_xml", xml), EMPTY);
            assert!(outcome.message.starts_with("Error:"), "{}", xml);
            assert!(outcome.document.is_none());
        }
    }

    #[test]
    fn test_patch_against_snapshot() {
        let invocation = ToolInvocation::new(
            "patch_scene",
            r#"{"operations":[{"op":"append","target":"scene","xml":"<cube color=\"red\"/>"}]}"#,
        );
        let outcome = dispatcher().dispatch(&invocation, EMPTY);
        assert_eq!(
            outcome.document.as_deref(),
            Some(r#"<scene><cube color="red"/></scene>"#)
        );
    }

    #[test]
    fn test_patch_failure_reports_error() {
        let invocation = ToolInvocation::new(
            "patch_scene",
            r#"{"operations":[{"op":"append","target":"scene","xml":"<a/>"},{"op":"remove","target":"scene/missing"}]}"#,
        );
        let outcome = dispatcher().dispatch(&invocation, EMPTY);
        assert!(outcome.message.contains("operation 1"));
        assert!(!outcome.is_success());
    }

    #[test]
    fn test_argument_errors_are_classified() {
        let truncated = ToolInvocation::new("rewrite_xml", r#"{"xml":"<scene>"#);
        assert!(matches!(
            truncated.resolve(),
            Err(ToolError::IncompleteArguments(_))
        ));

        let malformed = ToolInvocation::new("rewrite_xml", r#"{"xml" <scene>}"#);
        assert!(matches!(malformed.resolve(), Err(ToolError::InvalidArguments(_))));

        let wrong_shape = ToolInvocation::new("rewrite_xml", r#"{"document":"<scene/>"}"#);
        assert!(matches!(wrong_shape.resolve(), Err(ToolError::InvalidArguments(_))));

        let not_object = ToolInvocation::new("rewrite_xml", r#"["<scene/>"]"#);
        assert!(matches!(not_object.resolve(), Err(ToolError::InvalidArguments(_))));

        let unknown = ToolInvocation::new("delete_everything", "{}");
        assert!(matches!(unknown.resolve(), Err(ToolError::UnknownTool(_))));
    }

    #[test]
    fn test_collector_joins_fragments() {
        let mut collector = ToolCallCollector::new();
        collector.push(fragment(0, Some("rewrite_xml"), ""));
        collector.push(fragment(0, None, r#"{"xml":"<sce"#));
        collector.push(fragment(0, None, r#"ne/>"}"#));

        let invocation = collector.finish().unwrap();
        assert_eq!(invocation.name, "rewrite_xml");
        assert_eq!(invocation.raw_arguments, r#"{"xml":"<scene/>"}"#);
        assert_eq!(
            invocation.resolve().unwrap(),
            SceneTool::Rewrite {
                xml: "<scene/>".to_string()
            }
        );
    }

    #[test]
    fn test_collector_honors_first_call_only() {
        let mut collector = ToolCallCollector::new();
        collector.push(fragment(0, Some("rewrite_xml"), r#"{"xml":"<scene><a/></scene>"}"#));
        collector.push(fragment(1, Some("rewrite_xml"), r#"{"xml":"<scene><b/></scene>"}"#));
        collector.push(fragment(1, None, ""));

        assert_eq!(collector.ignored_calls(), 1);
        let invocation = collector.finish().unwrap();
        assert!(invocation.raw_arguments.contains("<a/>"));
    }

    #[test]
    fn test_collector_without_calls() {
        let collector = ToolCallCollector::new();
        assert!(!collector.has_call());
        assert!(collector.finish().is_none());
    }
}
