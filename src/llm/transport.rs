//! Completion transport seam
//!
//! A transport turns a [`CompletionRequest`] into a stream of deltas and stops
//! delivering them once the supplied cancellation token fires.

use std::pin::Pin;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::{Result, StagehandError};

/// Role of a chat message
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        }
    }
}

/// A single chat message
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

/// Function the model may call, with a JSON-schema parameter description
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Requested shape of the assistant content
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseFormat {
    #[default]
    Text,
    JsonObject,
}

/// One chat-completion request
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CompletionRequest {
    /// Conversation, system prompt first
    pub messages: Vec<ChatMessage>,

    /// Tools offered to the model (empty = plain completion)
    pub tools: Vec<ToolSpec>,

    /// Requested response format
    pub response_format: ResponseFormat,

    /// Generation limit, transport default when `None`
    pub max_tokens: Option<usize>,
}

impl CompletionRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            ..Default::default()
        }
    }

    pub fn with_tools(mut self, tools: Vec<ToolSpec>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_response_format(mut self, format: ResponseFormat) -> Self {
        self.response_format = format;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Content of the last user message, if any
    pub fn last_user_message(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::User)
            .map(|m| m.content.as_str())
    }
}

/// Fragment of a streamed tool call
///
/// Calls are identified by `index`; `name` usually arrives with the first
/// fragment and `arguments` is a piece of the JSON argument text.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ToolCallDelta {
    pub index: usize,
    pub name: Option<String>,
    pub arguments: String,
}

/// One increment of a streamed completion
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CompletionDelta {
    /// Assistant text
    Content(String),
    /// Tool-call fragment
    ToolCall(ToolCallDelta),
}

/// Stream of completion deltas
pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<CompletionDelta>> + Send>>;

/// Chat-completion endpoint
#[async_trait]
pub trait CompletionTransport: Send + Sync {
    /// Open a streamed completion
    ///
    /// Once `cancel` fires the stream must end without yielding more deltas.
    async fn stream_completion(
        &self,
        request: CompletionRequest,
        cancel: CancellationToken,
    ) -> Result<DeltaStream>;

    /// Run a completion to the end and return its concatenated text content
    async fn complete(&self, request: CompletionRequest, cancel: CancellationToken) -> Result<String> {
        let mut stream = self.stream_completion(request, cancel.clone()).await?;
        let mut content = String::new();

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(StagehandError::Cancelled),
                next = stream.next() => match next {
                    Some(Ok(CompletionDelta::Content(text))) => content.push_str(&text),
                    Some(Ok(CompletionDelta::ToolCall(_))) => {}
                    Some(Err(e)) => return Err(e),
                    None => break,
                },
            }
        }

        Ok(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builder() {
        let request = CompletionRequest::new(vec![
            ChatMessage::system("sys"),
            ChatMessage::user("first"),
            ChatMessage::assistant("reply"),
            ChatMessage::user("second"),
        ])
        .with_response_format(ResponseFormat::JsonObject)
        .with_max_tokens(4000);

        assert_eq!(request.last_user_message(), Some("second"));
        assert_eq!(request.response_format, ResponseFormat::JsonObject);
        assert_eq!(request.max_tokens, Some(4000));
        assert!(request.tools.is_empty());
    }

    #[test]
    fn test_message_role_names() {
        assert_eq!(MessageRole::System.as_str(), "system");
        assert_eq!(MessageRole::User.as_str(), "user");
        assert_eq!(MessageRole::Assistant.as_str(), "assistant");
    }
}
