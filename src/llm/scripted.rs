//! Offline transport replaying scripted completions
//!
//! Each call to `stream_completion` pops the next script. Useful for tests and
//! for running the pipeline without a model.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::llm::transport::{
    CompletionDelta, CompletionRequest, CompletionTransport, DeltaStream, ToolCallDelta,
};
use crate::{Result, StagehandError};

/// One step of a scripted completion
#[derive(Clone, Debug)]
pub enum ScriptStep {
    /// Yield a delta
    Delta(CompletionDelta),
    /// Wait before the next step
    Delay(Duration),
    /// Fail the stream with a transport error
    Fail(String),
}

/// A scripted completion
#[derive(Clone, Debug, Default)]
pub struct Script {
    steps: Vec<ScriptStep>,
}

impl Script {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append assistant text
    pub fn content(mut self, text: impl Into<String>) -> Self {
        self.steps
            .push(ScriptStep::Delta(CompletionDelta::Content(text.into())));
        self
    }

    /// Append assistant text split into chunks of `chunk_chars` characters
    pub fn content_chunks(mut self, text: &str, chunk_chars: usize) -> Self {
        let chars: Vec<char> = text.chars().collect();
        for chunk in chars.chunks(chunk_chars.max(1)) {
            self.steps.push(ScriptStep::Delta(CompletionDelta::Content(
                chunk.iter().collect(),
            )));
        }
        self
    }

    /// Append a complete tool call as two fragments (name, then arguments)
    pub fn tool_call(mut self, index: usize, name: &str, arguments: &str) -> Self {
        self.steps
            .push(ScriptStep::Delta(CompletionDelta::ToolCall(ToolCallDelta {
                index,
                name: Some(name.to_string()),
                arguments: String::new(),
            })));
        self.steps
            .push(ScriptStep::Delta(CompletionDelta::ToolCall(ToolCallDelta {
                index,
                name: None,
                arguments: arguments.to_string(),
            })));
        self
    }

    /// Append a pause
    pub fn delay(mut self, duration: Duration) -> Self {
        self.steps.push(ScriptStep::Delay(duration));
        self
    }

    /// Append a transport failure
    pub fn fail(mut self, reason: impl Into<String>) -> Self {
        self.steps.push(ScriptStep::Fail(reason.into()));
        self
    }

    pub fn steps(&self) -> &[ScriptStep] {
        &self.steps
    }
}

/// Transport that replays queued scripts in order
#[derive(Clone, Default)]
pub struct ScriptedTransport {
    scripts: Arc<Mutex<VecDeque<Script>>>,
    requests: Arc<Mutex<Vec<CompletionRequest>>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a transport preloaded with scripts
    pub fn with_scripts(scripts: impl IntoIterator<Item = Script>) -> Self {
        let transport = Self::new();
        for script in scripts {
            transport.push(script);
        }
        transport
    }

    /// Queue a script for a later request
    pub fn push(&self, script: Script) {
        self.scripts.lock().push_back(script);
    }

    /// Requests received so far
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().clone()
    }

    /// Number of requests received so far
    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    /// Scripts not yet consumed
    pub fn remaining(&self) -> usize {
        self.scripts.lock().len()
    }
}

#[async_trait]
impl CompletionTransport for ScriptedTransport {
    async fn stream_completion(
        &self,
        request: CompletionRequest,
        cancel: CancellationToken,
    ) -> Result<DeltaStream> {
        self.requests.lock().push(request);
        let script = self.scripts.lock().pop_front().ok_or_else(|| {
            StagehandError::TransportError("no scripted completion left".to_string())
        })?;

        debug!(steps = script.steps.len(), "replaying scripted completion");

        let stream = stream! {
            for step in script.steps {
                if cancel.is_cancelled() {
                    break;
                }
                match step {
                    ScriptStep::Delta(delta) => yield Ok(delta),
                    ScriptStep::Delay(duration) => {
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(duration) => {}
                        }
                    }
                    ScriptStep::Fail(reason) => {
                        yield Err(StagehandError::TransportError(reason));
                        break;
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::transport::ChatMessage;
    use futures::StreamExt;

    fn request() -> CompletionRequest {
        CompletionRequest::new(vec![ChatMessage::user("hi")])
    }

    #[tokio::test]
    async fn test_replays_scripts_in_order() {
        let transport = ScriptedTransport::with_scripts([
            Script::new().content("first"),
            Script::new().content_chunks("second", 2),
        ]);

        let text = transport
            .complete(request(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(text, "first");

        let text = transport
            .complete(request(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(text, "second");
        assert_eq!(transport.request_count(), 2);
        assert_eq!(transport.remaining(), 0);
    }

    #[tokio::test]
    async fn test_missing_script_is_transport_error() {
        let transport = ScriptedTransport::new();
        let result = transport
            .stream_completion(request(), CancellationToken::new())
            .await;
        assert!(matches!(result, Err(StagehandError::TransportError(_))));
    }

    #[tokio::test]
    async fn test_cancel_stops_delivery() {
        let transport = ScriptedTransport::with_scripts([Script::new()
            .content("a")
            .delay(Duration::from_secs(30))
            .content("b")]);
        let cancel = CancellationToken::new();

        let mut stream = transport
            .stream_completion(request(), cancel.clone())
            .await
            .unwrap();
        assert!(matches!(
            stream.next().await,
            Some(Ok(CompletionDelta::Content(_)))
        ));

        cancel.cancel();
        let next = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap();
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn test_failure_step_yields_error() {
        let transport =
            ScriptedTransport::with_scripts([Script::new().content("partial").fail("reset")]);
        let result = transport.complete(request(), CancellationToken::new()).await;
        assert!(matches!(result, Err(StagehandError::TransportError(r)) if r == "reset"));
    }

    #[test]
    fn test_tool_call_script_shape() {
        let script = Script::new().tool_call(0, "rewrite_xml", r#"{"xml":"<scene/>"}"#);
        assert_eq!(script.steps().len(), 2);
    }
}
