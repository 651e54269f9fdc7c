//! Incremental parsing of structured JSON out of streamed completion text
//!
//! - **json_parser**: fragment-driven JSON parser emitting nested values as they close
//! - **path**: value locations and `$.a.*` style selectors
//! - **dialogue**: `{speaker, utterance}` extraction for simulated dialogues

pub mod dialogue;
pub mod json_parser;
pub mod path;

pub use dialogue::{render_transcript, DialogueExtractor, Utterance, UtteranceCallback};
pub use json_parser::{
    parse_fragments, JsonStreamError, ParserOptions, ParserStatus, StreamedValue,
    StreamingJsonParser, ValueCallback,
};
pub use path::{format_path, PathSegment, PathSelector};
