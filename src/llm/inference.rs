//! Local completion transport using mistral.rs
//!
//! Streams content and tool-call deltas from an in-process model. Requests
//! run on a spawned task that stops forwarding as soon as the turn is
//! cancelled.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use mistralrs::{
    Constraint, Function, IsqType, PagedAttentionMetaBuilder, RequestBuilder, Response,
    TextMessageRole, TextModelBuilder, Tool, ToolChoice, ToolType,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::llm::config::{LLMConfig, QuantizationType};
use crate::llm::transport::{
    CompletionDelta, CompletionRequest, CompletionTransport, DeltaStream, MessageRole,
    ResponseFormat, ToolCallDelta, ToolSpec,
};
use crate::{Result, StagehandError};

/// Completion transport backed by a local mistral.rs model
pub struct MistralTransport {
    config: LLMConfig,
    model: Arc<mistralrs::Model>,
}

impl MistralTransport {
    /// Load the configured model
    pub async fn new(config: LLMConfig) -> Result<Self> {
        info!("Loading completion model: {}", config.model_id);

        let isq_type = match config.quantization {
            QuantizationType::None => None,
            QuantizationType::Q4k => Some(IsqType::Q4K),
            QuantizationType::Q8_0 => Some(IsqType::Q8_0),
            QuantizationType::Q4_0 => Some(IsqType::Q4_0),
        };

        let mut builder = TextModelBuilder::new(&config.model_id);

        if let Some(isq) = isq_type {
            builder = builder.with_isq(isq);
        }

        if config.engine_logging {
            builder = builder.with_logging();
        }

        if let Some(block_size) = config.paged_attention_block {
            builder = builder
                .with_paged_attn(|| {
                    PagedAttentionMetaBuilder::default()
                        .with_block_size(block_size)
                        .build()
                })
                .map_err(|e| {
                    StagehandError::ConfigError(format!("Failed to configure paged attention: {}", e))
                })?;
        }

        let model = builder.build().await.map_err(|e| {
            StagehandError::TransportError(format!("Failed to load model: {}", e))
        })?;

        info!("Completion model loaded");

        Ok(Self {
            config,
            model: Arc::new(model),
        })
    }

    pub fn config(&self) -> &LLMConfig {
        &self.config
    }

    fn build_request(&self, request: &CompletionRequest) -> RequestBuilder {
        let mut builder = RequestBuilder::new();

        for message in &request.messages {
            let role = match message.role {
                MessageRole::System => TextMessageRole::System,
                MessageRole::User => TextMessageRole::User,
                MessageRole::Assistant => TextMessageRole::Assistant,
            };
            builder = builder.add_message(role, &message.content);
        }

        if !request.tools.is_empty() {
            builder = builder
                .set_tools(request.tools.iter().map(to_mistral_tool).collect())
                .set_tool_choice(ToolChoice::Auto);
        }

        if request.response_format == ResponseFormat::JsonObject {
            builder = builder.set_constraint(Constraint::JsonSchema(
                serde_json::json!({ "type": "object" }),
            ));
        }

        builder
            .set_sampler_max_len(request.max_tokens.unwrap_or(self.config.default_max_tokens))
            .set_sampler_temperature(self.config.sampling.temperature as f64)
            .set_sampler_topp(self.config.sampling.top_p as f64)
    }
}

fn to_mistral_tool(spec: &ToolSpec) -> Tool {
    let parameters = spec
        .parameters
        .as_object()
        .map(|map| map.clone().into_iter().collect::<HashMap<_, _>>());

    Tool {
        tp: ToolType::Function,
        function: Function {
            description: Some(spec.description.clone()),
            name: spec.name.clone(),
            parameters,
        },
    }
}

#[async_trait]
impl CompletionTransport for MistralTransport {
    async fn stream_completion(
        &self,
        request: CompletionRequest,
        cancel: CancellationToken,
    ) -> Result<DeltaStream> {
        let builder = self.build_request(&request);
        let model = self.model.clone();
        let (tx, mut rx) = mpsc::channel::<Result<CompletionDelta>>(100);

        tokio::spawn(async move {
            let mut stream = match model.stream_chat_request(builder).await {
                Ok(stream) => stream,
                Err(e) => {
                    error!("Streaming request failed: {}", e);
                    let _ = tx
                        .send(Err(StagehandError::TransportError(e.to_string())))
                        .await;
                    return;
                }
            };

            let mut tool_calls = ToolCallCounter::default();
            loop {
                let response = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        debug!("model stream cancelled");
                        break;
                    }
                    next = stream.next() => match next {
                        Some(response) => response,
                        None => break,
                    },
                };

                let deltas = match response {
                    Response::Chunk(chunk) => chunk
                        .choices
                        .into_iter()
                        .flat_map(|choice| {
                            let mut out = Vec::new();
                            if let Some(content) = choice.delta.content {
                                if !content.is_empty() {
                                    out.push(Ok(CompletionDelta::Content(content)));
                                }
                            }
                            for call in choice.delta.tool_calls.into_iter().flatten() {
                                out.push(Ok(CompletionDelta::ToolCall(
                                    tool_calls.next(call.function.name, call.function.arguments),
                                )));
                            }
                            out
                        })
                        .collect::<Vec<_>>(),
                    Response::Done(_) => break,
                    Response::ModelError(message, _) => {
                        vec![Err(StagehandError::TransportError(message))]
                    }
                    Response::InternalError(e) => {
                        vec![Err(StagehandError::TransportError(e.to_string()))]
                    }
                    Response::ValidationError(e) => {
                        vec![Err(StagehandError::TransportError(e.to_string()))]
                    }
                    _ => {
                        warn!("ignoring unexpected model response");
                        Vec::new()
                    }
                };

                for delta in deltas {
                    let failed = delta.is_err();
                    if tx.send(delta).await.is_err() {
                        return;
                    }
                    if failed {
                        return;
                    }
                }
            }
        });

        let stream = async_stream::stream! {
            while let Some(delta) = rx.recv().await {
                yield delta;
            }
        };
        Ok(Box::pin(stream))
    }
}

/// Numbers tool calls across the whole turn
///
/// The engine emits every call complete, one or more per chunk, so each call
/// gets the next index rather than its position within the chunk.
#[derive(Debug, Default)]
struct ToolCallCounter {
    next: usize,
}

impl ToolCallCounter {
    fn next(&mut self, name: String, arguments: String) -> ToolCallDelta {
        let index = self.next;
        self.next += 1;
        ToolCallDelta {
            index,
            name: Some(name),
            arguments,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::transport::ChatMessage;

    #[test]
    fn test_tool_conversion_keeps_schema() {
        let spec = ToolSpec {
            name: "rewrite_xml".to_string(),
            description: "Rewrite the entire scene".to_string(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": { "xml": { "type": "string" } }
            }),
        };
        let tool = to_mistral_tool(&spec);
        assert_eq!(tool.function.name, "rewrite_xml");
        assert!(tool
            .function
            .parameters
            .map(|p| p.contains_key("properties"))
            .unwrap_or(false));
    }

    #[test]
    fn test_tool_call_index_runs_across_chunks() {
        let mut counter = ToolCallCounter::default();

        let first_chunk = counter.next("set_attribute".to_string(), "{}".to_string());
        let second_chunk: Vec<usize> = ["insert_child", "remove_node"]
            .into_iter()
            .map(|name| counter.next(name.to_string(), "{}".to_string()).index)
            .collect();

        assert_eq!(first_chunk.index, 0);
        assert_eq!(first_chunk.name.as_deref(), Some("set_attribute"));
        assert_eq!(second_chunk, vec![1, 2]);
    }

    #[tokio::test]
    #[ignore]
    async fn test_local_completion() {
        let transport = MistralTransport::new(LLMConfig::default()).await.unwrap();
        let request = CompletionRequest::new(vec![
            ChatMessage::system("You are terse."),
            ChatMessage::user("Say hello in one word."),
        ]);
        let text = transport
            .complete(request, CancellationToken::new())
            .await
            .unwrap();
        assert!(!text.is_empty());
    }
}
