//! Completion transport, turn sessions and prompts
//!
//! - **transport**: the `CompletionTransport` seam and request/delta types
//! - **scripted**: offline transport replaying scripted completions
//! - **inference**: local mistral.rs transport (feature `local-llm`)
//! - **session**: cancellable turns with a terminal state machine

pub mod config;
#[cfg(feature = "local-llm")]
pub mod inference;
pub mod prompts;
pub mod scripted;
pub mod session;
pub mod transport;

pub use config::{LLMConfig, QuantizationType, SamplingConfig};
#[cfg(feature = "local-llm")]
pub use inference::MistralTransport;
pub use scripted::{Script, ScriptStep, ScriptedTransport};
pub use session::{
    TextCollector, TurnCanceller, TurnConsumer, TurnHandle, TurnResult, TurnSession, TurnState,
};
pub use transport::{
    ChatMessage, CompletionDelta, CompletionRequest, CompletionTransport, DeltaStream,
    MessageRole, ResponseFormat, ToolCallDelta, ToolSpec,
};
