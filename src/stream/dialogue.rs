//! Dialogue utterance extraction from a streamed `{utterances: [...]}` document

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::stream::json_parser::{JsonStreamError, StreamedValue, StreamingJsonParser};
use crate::stream::path::format_path;

/// One line of a simulated dialogue
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utterance {
    /// Who is speaking (e.g. "expert" or "novice")
    pub speaker: String,

    /// What they say
    pub utterance: String,
}

/// Callback receiving each utterance as soon as it is complete
pub type UtteranceCallback = Box<dyn FnMut(&Utterance) + Send>;

/// Streams utterances out of partial completion text
///
/// Only array elements shaped like `{speaker: string, utterance: string}` are
/// accepted. Object members, the enclosing array and any element of another
/// shape are ignored silently.
pub struct DialogueExtractor {
    parser: StreamingJsonParser,
    utterances: Arc<Mutex<Vec<Utterance>>>,
}

impl DialogueExtractor {
    /// Create an extractor that reports each utterance to `on_utterance`
    pub fn new(mut on_utterance: UtteranceCallback) -> Self {
        let utterances = Arc::new(Mutex::new(Vec::new()));
        let collected = Arc::clone(&utterances);

        let parser = StreamingJsonParser::new(Box::new(move |value: StreamedValue| {
            if let Some(utterance) = as_utterance(value) {
                on_utterance(&utterance);
                collected.lock().push(utterance);
            }
        }));

        Self { parser, utterances }
    }

    /// Feed a completion delta
    pub fn write(&mut self, delta: &str) {
        self.parser.write(delta);
    }

    /// Finish the stream and return every accepted utterance
    ///
    /// Parse errors do not discard what was already extracted.
    pub fn finish(mut self) -> (Vec<Utterance>, Option<JsonStreamError>) {
        let error = self.parser.end().err();
        if let Some(err) = &error {
            debug!(error = %err, "dialogue stream ended with a parse error");
        }
        let utterances = std::mem::take(&mut *self.utterances.lock());
        (utterances, error)
    }

    /// Number of utterances accepted so far
    pub fn len(&self) -> usize {
        self.utterances.lock().len()
    }

    /// Whether no utterance has been accepted yet
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn as_utterance(value: StreamedValue) -> Option<Utterance> {
    if value.index().is_none() || !value.value.is_object() {
        return None;
    }

    let StreamedValue { path, value } = value;
    match serde_json::from_value::<Utterance>(value) {
        Ok(utterance) => Some(utterance),
        Err(e) => {
            trace!(path = %format_path(&path), error = %e, "skipping non-conforming array element");
            None
        }
    }
}

/// Render utterances as a plain transcript, one `speaker: text` line each
pub fn render_transcript(utterances: &[Utterance]) -> String {
    utterances
        .iter()
        .map(|u| format!("{}: {}", u.speaker, u.utterance))
        .collect::<Vec<_>>()
        .join("\n")
}
