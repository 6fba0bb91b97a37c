//! Completion orchestration and wire shapes.
//!
//! Ties the pipeline together (template, then session, then aggregator) and
//! renders the result either as one OpenAI-style completion object or as an
//! SSE event sequence terminated by the literal `[DONE]` sentinel.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::config::AppConfig;
use crate::error::GatewayError;
use crate::llm::aggregator::ChunkAggregator;
use crate::llm::registry::ModelRegistry;
use crate::llm::session::GenerationSession;
use crate::llm::template::RenderedPrompt;
use crate::llm::{ChatMessage, GenerationRequest, ResponseChunk, ROLE_ASSISTANT};
use crate::{log_debug, log_error};

/// `POST /chat/completions` request body.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CompletionRequest {
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
    /// Accepted for OpenAI compatibility; the sampler chain does not use it.
    pub top_p: Option<f64>,
    #[serde(default)]
    pub stream: bool,
}

#[derive(Debug, Serialize)]
pub struct ChoiceMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Serialize)]
pub struct Choice {
    pub index: u32,
    pub message: ChoiceMessage,
    pub logprobs: Option<serde_json::Value>,
    pub finish_reason: String,
}

/// Full-mode completion envelope.
#[derive(Debug, Serialize)]
pub struct ChatCompletion {
    pub id: String,
    pub object: String,
    pub created: u64,
    pub model: String,
    pub choices: Vec<Choice>,
}

#[derive(Debug, Serialize)]
pub struct ChunkDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub content: String,
}

#[derive(Debug, Serialize)]
pub struct ChunkChoice {
    pub index: u32,
    pub delta: ChunkDelta,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

/// Streaming-mode event envelope.
#[derive(Debug, Serialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: String,
    pub created: u64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
}

pub const SSE_DONE: &str = "data: [DONE]\n\n";

pub struct CompletionService {
    registry: Arc<ModelRegistry>,
}

impl CompletionService {
    pub fn new(registry: Arc<ModelRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    /// Full mode: one blocking generation wrapped in a completion object.
    pub async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> Result<ChatCompletion, GatewayError> {
        if request.messages.is_empty() {
            return Err(GatewayError::EmptyInput);
        }

        let config = self.registry.config();
        let guard = self.registry.acquire().await?;
        let communicator = guard.as_ref().ok_or(GatewayError::ModelNotLoaded)?;

        let rendered = communicator.build_prompt(&request.messages)?;
        let stop = stop_list(&rendered, communicator.template().end_tokens.clone());
        let model = communicator.model_label().to_string();
        let generation = build_generation_request(&config, request, rendered.prompt, false);

        if config.model_config.verbose {
            log_debug!("prompt = {}", generation.prompt);
            log_debug!("stop = {:?}", stop);
        }

        let session = GenerationSession::new(guard);
        let text = session.complete(generation, stop).await?;

        Ok(ChatCompletion {
            id: completion_id(),
            object: "chat.completion".to_string(),
            created: epoch_seconds(),
            model,
            choices: vec![Choice {
                index: 0,
                message: ChoiceMessage {
                    role: ROLE_ASSISTANT.to_string(),
                    content: text,
                },
                logprobs: None,
                finish_reason: "stop".to_string(),
            }],
        })
    }

    /// Streaming mode, transport-agnostic: aggregated response chunks in
    /// generation order. The chatbot consumes these directly; HTTP wraps
    /// them via [`stream_events`](Self::stream_events).
    pub async fn stream_chunks(
        &self,
        request: &CompletionRequest,
    ) -> Result<mpsc::Receiver<Result<ResponseChunk, GatewayError>>, GatewayError> {
        if request.messages.is_empty() {
            return Err(GatewayError::EmptyInput);
        }

        let config = self.registry.config();
        let guard = self.registry.acquire().await?;
        let communicator = guard.as_ref().ok_or(GatewayError::ModelNotLoaded)?;

        let rendered = communicator.build_prompt(&request.messages)?;
        let stop = stop_list(&rendered, communicator.template().end_tokens.clone());
        let generation = build_generation_request(&config, request, rendered.prompt, true);
        let batch_size = config.stream_batch_size;

        let session = GenerationSession::new(guard);
        let mut fragment_rx = session.stream(generation, stop);

        let (tx, rx) = mpsc::channel::<Result<ResponseChunk, GatewayError>>(4);
        tokio::task::spawn_blocking(move || {
            let mut stream_error: Option<GatewayError> = None;
            {
                let source = std::iter::from_fn(|| match fragment_rx.blocking_recv() {
                    Some(Ok(fragment)) => Some(fragment),
                    Some(Err(e)) => {
                        stream_error = Some(e);
                        None
                    }
                    None => None,
                });
                for chunk in ChunkAggregator::new(source, batch_size) {
                    if tx.blocking_send(Ok(chunk)).is_err() {
                        // Consumer cancelled; unflushed text is discarded.
                        return;
                    }
                }
            }
            if let Some(e) = stream_error {
                let _ = tx.blocking_send(Err(e));
            }
        });

        Ok(rx)
    }

    /// Streaming mode, HTTP shape: SSE frames ready to write to the body.
    pub async fn stream_events(
        &self,
        request: &CompletionRequest,
    ) -> Result<mpsc::Receiver<String>, GatewayError> {
        let model = self.registry.config().model_label();
        let mut chunks = self.stream_chunks(request).await?;

        let id = completion_id();
        let created = epoch_seconds();
        let (tx, rx) = mpsc::channel::<String>(8);

        tokio::spawn(async move {
            let mut errored = false;
            while let Some(item) = chunks.recv().await {
                let frame = match item {
                    Ok(chunk) => chunk_frame(&id, created, &model, &chunk),
                    Err(e) => {
                        log_error!("Streaming generation failed: {e}");
                        errored = true;
                        error_frame(&e)
                    }
                };
                if tx.send(frame).await.is_err() {
                    return;
                }
                if errored {
                    return;
                }
            }
            let _ = tx.send(SSE_DONE.to_string()).await;
        });

        Ok(rx)
    }
}

/// Combine the request body with the profile defaults.
fn build_generation_request(
    config: &AppConfig,
    request: &CompletionRequest,
    prompt: String,
    streaming: bool,
) -> GenerationRequest {
    let defaults = &config.model_config.default_completion_config;
    GenerationRequest {
        prompt,
        max_tokens: request.max_tokens.unwrap_or(defaults.max_tokens),
        temperature: request.temperature.unwrap_or(defaults.temperature),
        repeat_penalty: defaults.repeat_penalty,
        echo: defaults.echo,
        streaming,
    }
}

/// Positional templates carry a single dynamic stop token; role-keyed
/// templates fall back to the model's configured end tokens.
fn stop_list(rendered: &RenderedPrompt, end_tokens: Vec<String>) -> Vec<String> {
    if rendered.stop_token.is_empty() {
        end_tokens
    } else {
        vec![rendered.stop_token.clone()]
    }
}

fn completion_id() -> String {
    format!("chatcmpl-{}", uuid::Uuid::new_v4())
}

fn epoch_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn chunk_frame(id: &str, created: u64, model: &str, chunk: &ResponseChunk) -> String {
    let payload = ChatCompletionChunk {
        id: id.to_string(),
        object: "chat.completion.chunk".to_string(),
        created,
        model: model.to_string(),
        choices: vec![ChunkChoice {
            index: 0,
            delta: ChunkDelta {
                role: chunk.is_first.then(|| ROLE_ASSISTANT.to_string()),
                content: chunk.text.clone(),
            },
            finish_reason: chunk.is_last.then(|| "stop".to_string()),
        }],
    };
    let json = serde_json::to_string(&payload)
        .unwrap_or_else(|_| r#"{"error":"serialization failed"}"#.to_string());
    format!("data: {json}\n\n")
}

fn error_frame(error: &GatewayError) -> String {
    format!(
        "event: error\ndata: {}\n\n",
        serde_json::json!({ "error": error.to_string() })
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::communicator::stub::StubCommunicator;

    fn test_config() -> AppConfig {
        serde_json::from_value(serde_json::json!({
            "host": "127.0.0.1", "port": 8000, "url_prefix": "/v1",
            "model": "stub", "stream_batch_size": 2,
            "model_config": {
                "hf_id": "stub/stub", "hf_file": "stub.gguf", "family": "mistral",
                "default_completion_config": {
                    "max_tokens": 64, "temperature": 0.0,
                    "repeat_penalty": 1.1, "echo": false, "top_p": 0.95
                }
            }
        }))
        .unwrap()
    }

    fn service_with(stub: StubCommunicator) -> CompletionService {
        let registry = ModelRegistry::with_communicator(test_config(), Box::new(stub));
        CompletionService::new(Arc::new(registry))
    }

    fn chat_request(stream: bool) -> CompletionRequest {
        CompletionRequest {
            messages: vec![ChatMessage::new("user", "hi")],
            stream,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn full_completion_has_expected_envelope() {
        let service = service_with(StubCommunicator::with_fragments(&["Hello", " world"]));
        let completion = service.complete(&chat_request(false)).await.unwrap();

        assert!(completion.id.starts_with("chatcmpl-"));
        assert_eq!(completion.object, "chat.completion");
        assert_eq!(completion.model, "stub-model");
        assert_eq!(completion.choices.len(), 1);
        assert_eq!(completion.choices[0].message.role, "assistant");
        assert_eq!(completion.choices[0].message.content, "Hello world");
        assert_eq!(completion.choices[0].finish_reason, "stop");
    }

    #[tokio::test]
    async fn empty_messages_fail_before_any_generation() {
        let stub = StubCommunicator::with_fragments(&["x"]);
        let calls = stub.calls.clone();
        let service = service_with(stub);

        let err = service
            .complete(&CompletionRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::EmptyInput));

        let err = service
            .stream_chunks(&CompletionRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::EmptyInput));

        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    /// Round trip: streamed chunks concatenate to the full-mode text.
    #[tokio::test]
    async fn streaming_and_full_mode_agree() {
        let fragments = ["The", " quick", " brown", " fox", " jumps"];

        let service = service_with(StubCommunicator::with_fragments(&fragments));
        let full = service.complete(&chat_request(false)).await.unwrap();

        let service = service_with(StubCommunicator::with_fragments(&fragments));
        let mut rx = service.stream_chunks(&chat_request(true)).await.unwrap();
        let mut streamed = String::new();
        while let Some(chunk) = rx.recv().await {
            streamed.push_str(&chunk.unwrap().text);
        }

        assert_eq!(full.choices[0].message.content, streamed);
    }

    #[tokio::test]
    async fn chunk_flags_follow_batch_boundaries() {
        // 5 fragments, batch size 2: three chunks, flags on the ends.
        let service = service_with(StubCommunicator::with_fragments(&[
            "a", "b", "c", "d", "e",
        ]));
        let mut rx = service.stream_chunks(&chat_request(true)).await.unwrap();
        let mut chunks = Vec::new();
        while let Some(chunk) = rx.recv().await {
            chunks.push(chunk.unwrap());
        }
        assert_eq!(chunks.len(), 3);
        assert!(chunks[0].is_first && !chunks[0].is_last);
        assert!(!chunks[1].is_first && !chunks[1].is_last);
        assert!(!chunks[2].is_first && chunks[2].is_last);
    }

    #[tokio::test]
    async fn sse_events_carry_role_finish_and_done() {
        let service = service_with(StubCommunicator::with_fragments(&["a", "b", "c"]));
        let mut rx = service.stream_events(&chat_request(true)).await.unwrap();
        let mut frames = Vec::new();
        while let Some(frame) = rx.recv().await {
            frames.push(frame);
        }

        assert!(frames.len() >= 2);
        assert!(frames[0].starts_with("data: "));
        assert!(frames[0].contains(r#""role":"assistant""#));
        let last_data = &frames[frames.len() - 2];
        assert!(last_data.contains(r#""finish_reason":"stop""#));
        assert_eq!(frames.last().unwrap(), SSE_DONE);
        // Interior events never announce the role twice.
        for frame in &frames[1..frames.len() - 2] {
            assert!(!frame.contains(r#""role""#));
        }
    }

    #[tokio::test]
    async fn engine_failure_emits_error_event_without_done() {
        let mut stub = StubCommunicator::with_fragments(&[]);
        stub.fail_with = Some("engine exploded".to_string());
        let service = service_with(stub);

        let mut rx = service.stream_events(&chat_request(true)).await.unwrap();
        let mut frames = Vec::new();
        while let Some(frame) = rx.recv().await {
            frames.push(frame);
        }
        assert_eq!(frames.len(), 1);
        assert!(frames[0].starts_with("event: error\n"));
        assert!(!frames.iter().any(|f| f == SSE_DONE));
    }

    #[tokio::test]
    async fn empty_generation_streams_only_done() {
        let service = service_with(StubCommunicator::with_fragments(&[]));
        let mut rx = service.stream_events(&chat_request(true)).await.unwrap();
        let mut frames = Vec::new();
        while let Some(frame) = rx.recv().await {
            frames.push(frame);
        }
        assert_eq!(frames, vec![SSE_DONE.to_string()]);
    }
}
