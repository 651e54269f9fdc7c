//! Turn planners: what each pipeline slot asks the model and how it reads the answer

use std::sync::Arc;

use tracing::{debug, info};

use crate::integration::sinks::AudioSink;
use crate::llm::prompts::{
    dialogue_system_prompt, dialogue_user_prompt, scene_system_prompt, DEFAULT_DIALOGUE_REQUIREMENT,
};
use crate::llm::session::TurnConsumer;
use crate::llm::transport::{ChatMessage, CompletionDelta, CompletionRequest, ResponseFormat};
use crate::scene::store::{DocumentStore, SharedDocument};
use crate::stream::dialogue::{render_transcript, DialogueExtractor};
use crate::tools::dispatcher::{ToolCallCollector, ToolDispatcher};
use crate::{Result, StagehandError};

/// What a completed turn proposes to the coordinator
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TurnCommit {
    /// Final content of the turn (tool result or assistant text)
    pub message: String,

    /// Proposed replacement for the slot's document
    pub document: Option<String>,
}

/// Builds the request and consumer for one turn of a pipeline slot
pub trait TurnPlanner: Send + Sync + 'static {
    type Consumer: TurnConsumer<Output = TurnCommit>;

    /// Slot name used in logs and events
    fn slot(&self) -> &'static str;

    /// Plan a turn from the joined instruction and the slot document snapshot
    fn plan(&self, instruction: &str, snapshot: &SharedDocument)
        -> (CompletionRequest, Self::Consumer);
}

/// Scene editing through tool calls
pub struct ScenePlanner {
    dispatcher: ToolDispatcher,
    max_tokens: Option<usize>,
}

impl ScenePlanner {
    pub fn new(dispatcher: ToolDispatcher) -> Self {
        Self {
            dispatcher,
            max_tokens: None,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: Option<usize>) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

impl TurnPlanner for ScenePlanner {
    type Consumer = SceneTurn;

    fn slot(&self) -> &'static str {
        "scene"
    }

    fn plan(&self, instruction: &str, snapshot: &SharedDocument) -> (CompletionRequest, SceneTurn) {
        let mut request = CompletionRequest::new(vec![
            ChatMessage::system(scene_system_prompt(
                &snapshot.content,
                self.dispatcher.root_tag(),
            )),
            ChatMessage::user(instruction),
        ])
        .with_tools(self.dispatcher.tool_specs());
        if let Some(max_tokens) = self.max_tokens {
            request = request.with_max_tokens(max_tokens);
        }

        let turn = SceneTurn {
            snapshot: snapshot.content.clone(),
            dispatcher: self.dispatcher.clone(),
            calls: ToolCallCollector::new(),
            content: String::new(),
        };
        (request, turn)
    }
}

/// Consumer for a scene turn
///
/// Tool-call fragments are collected while streaming; the first call runs
/// once, after the stream ends, against the snapshot taken at turn start.
pub struct SceneTurn {
    snapshot: String,
    dispatcher: ToolDispatcher,
    calls: ToolCallCollector,
    content: String,
}

impl TurnConsumer for SceneTurn {
    type Output = TurnCommit;

    fn on_delta(&mut self, delta: CompletionDelta) {
        match delta {
            CompletionDelta::Content(text) => self.content.push_str(&text),
            CompletionDelta::ToolCall(call) => self.calls.push(call),
        }
    }

    fn finish(self) -> Result<TurnCommit> {
        let Some(invocation) = self.calls.finish() else {
            debug!("scene turn ended without a tool call");
            return Ok(TurnCommit {
                message: self.content,
                document: None,
            });
        };

        info!(tool = %invocation.name, "dispatching tool call");
        let outcome = self.dispatcher.dispatch(&invocation, &self.snapshot);
        Ok(TurnCommit {
            message: outcome.message,
            document: outcome.document,
        })
    }
}

/// Two-party dialogue about the current scene
pub struct DialoguePlanner {
    world: DocumentStore,
    audio: Arc<dyn AudioSink>,
    default_requirement: String,
    max_tokens: usize,
}

impl DialoguePlanner {
    pub fn new(world: DocumentStore, audio: Arc<dyn AudioSink>) -> Self {
        Self {
            world,
            audio,
            default_requirement: DEFAULT_DIALOGUE_REQUIREMENT.to_string(),
            max_tokens: 4000,
        }
    }

    /// Requirement used when the instruction is blank
    pub fn with_default_requirement(mut self, requirement: impl Into<String>) -> Self {
        self.default_requirement = requirement.into();
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

impl TurnPlanner for DialoguePlanner {
    type Consumer = DialogueTurn;

    fn slot(&self) -> &'static str {
        "dialogue"
    }

    fn plan(&self, instruction: &str, _snapshot: &SharedDocument) -> (CompletionRequest, DialogueTurn) {
        let world = self.world.content();
        let requirement = match instruction.trim() {
            "" => self.default_requirement.as_str(),
            other => other,
        };
        let request = CompletionRequest::new(vec![
            ChatMessage::system(dialogue_system_prompt(requirement)),
            ChatMessage::user(dialogue_user_prompt(&world)),
        ])
        .with_response_format(ResponseFormat::JsonObject)
        .with_max_tokens(self.max_tokens);

        let audio = Arc::clone(&self.audio);
        let extractor = DialogueExtractor::new(Box::new(move |utterance| {
            debug!(speaker = %utterance.speaker, "utterance ready");
            audio.enqueue(&utterance.utterance);
        }));

        (request, DialogueTurn { extractor })
    }
}

/// Consumer for a dialogue turn: utterances reach the audio sink as they close
pub struct DialogueTurn {
    extractor: DialogueExtractor,
}

impl TurnConsumer for DialogueTurn {
    type Output = TurnCommit;

    fn on_delta(&mut self, delta: CompletionDelta) {
        if let CompletionDelta::Content(text) = delta {
            self.extractor.write(&text);
        }
    }

    fn finish(self) -> Result<TurnCommit> {
        let (utterances, error) = self.extractor.finish();
        if utterances.is_empty() {
            if let Some(e) = error {
                return Err(StagehandError::from(e));
            }
            // Nothing to show; the previous transcript stays
            return Ok(TurnCommit {
                message: "0 utterances".to_string(),
                document: None,
            });
        }

        Ok(TurnCommit {
            message: format!("{} utterances", utterances.len()),
            document: Some(render_transcript(&utterances)),
        })
    }
}
