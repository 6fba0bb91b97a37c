//! One inference call against the active model.
//!
//! A session takes ownership of the registry guard, so the exclusivity lock
//! lives exactly as long as the call: through the blocking completion, or
//! until a fragment stream is exhausted or its consumer goes away. Heavy
//! work runs on the blocking thread pool (the decode loop would otherwise
//! starve the runtime), with fragments handed back over a capacity-one
//! channel so the engine only advances when the consumer pulls.

use tokio::sync::mpsc;

use crate::error::GatewayError;
use crate::llm::registry::ModelGuard;
use crate::llm::{Fragment, GenerationRequest};
use crate::log_debug;

pub struct GenerationSession {
    guard: ModelGuard,
}

impl GenerationSession {
    pub fn new(guard: ModelGuard) -> Self {
        Self { guard }
    }

    /// Blocking completion: returns the final text, trimmed, with the echoed
    /// prompt prefix stripped when the engine included it.
    pub async fn complete(
        self,
        request: GenerationRequest,
        stop: Vec<String>,
    ) -> Result<String, GatewayError> {
        let Self { guard } = self;
        tokio::task::spawn_blocking(move || {
            let communicator = guard.as_ref().ok_or(GatewayError::ModelNotLoaded)?;
            let raw = communicator.complete(&request, &stop)?;
            Ok(finalize_text(raw, &request.prompt))
            // guard drops here: the lock is released once the call is done,
            // success or not.
        })
        .await
        .map_err(|e| GatewayError::Inference(format!("generation task failed: {e}")))?
    }

    /// Streaming completion: a forward-only fragment sequence. Dropping the
    /// receiver cancels the generation and releases the lock; fragments
    /// buffered in flight at that point are discarded.
    pub fn stream(
        self,
        request: GenerationRequest,
        stop: Vec<String>,
    ) -> mpsc::Receiver<Result<Fragment, GatewayError>> {
        let (tx, rx) = mpsc::channel::<Result<Fragment, GatewayError>>(1);
        let Self { guard } = self;

        tokio::task::spawn_blocking(move || {
            let guard = guard;
            let communicator = match guard.as_ref() {
                Some(c) => c,
                None => {
                    let _ = tx.blocking_send(Err(GatewayError::ModelNotLoaded));
                    return;
                }
            };

            let fragments = match communicator.complete_stream(&request, &stop) {
                Ok(iter) => iter,
                Err(e) => {
                    let _ = tx.blocking_send(Err(e));
                    return;
                }
            };

            for item in fragments {
                let is_err = item.is_err();
                if tx.blocking_send(item).is_err() {
                    // Consumer dropped the receiver: stop pulling fragments.
                    log_debug!("Stream consumer went away, abandoning generation");
                    break;
                }
                if is_err {
                    break;
                }
            }
            // Iterator and guard drop here, in that order; the lock is held
            // until the sequence is exhausted or cancelled.
        });

        rx
    }
}

fn finalize_text(raw: String, prompt: &str) -> String {
    let mut text = raw.trim().to_string();
    if text.starts_with(prompt) {
        text = text[prompt.len()..].trim().to_string();
    }
    text
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::config::AppConfig;
    use crate::llm::communicator::stub::StubCommunicator;
    use crate::llm::registry::ModelRegistry;

    fn test_config() -> AppConfig {
        // Reuse the registry test fixture shape.
        let store = serde_json::json!({
            "host": "127.0.0.1", "port": 8000, "url_prefix": "/v1",
            "model": "stub", "stream_batch_size": 2,
            "model_config": {
                "hf_id": "stub/stub", "hf_file": "stub.gguf", "family": "mistral"
            }
        });
        serde_json::from_value(store).unwrap()
    }

    fn request() -> GenerationRequest {
        GenerationRequest {
            prompt: "<s>[INST] hi [/INST]".to_string(),
            max_tokens: 64,
            temperature: 0.0,
            repeat_penalty: 1.1,
            echo: false,
            streaming: false,
        }
    }

    #[tokio::test]
    async fn complete_returns_trimmed_text() {
        let registry = ModelRegistry::with_communicator(
            test_config(),
            Box::new(StubCommunicator::with_fragments(&["  hello", " world  "])),
        );
        let session = GenerationSession::new(registry.acquire().await.unwrap());
        let text = session.complete(request(), vec![]).await.unwrap();
        assert_eq!(text, "hello world");
    }

    #[tokio::test]
    async fn echoed_prompt_prefix_is_stripped() {
        let stub = StubCommunicator::with_fragments(&["continuation"]);
        let registry = ModelRegistry::with_communicator(test_config(), Box::new(stub));
        let session = GenerationSession::new(registry.acquire().await.unwrap());
        let mut req = request();
        req.echo = true;
        let text = session.complete(req, vec![]).await.unwrap();
        assert_eq!(text, "continuation");
    }

    #[tokio::test]
    async fn stream_yields_fragments_in_order() {
        let registry = ModelRegistry::with_communicator(
            test_config(),
            Box::new(StubCommunicator::with_fragments(&["a", "b", "c"])),
        );
        let session = GenerationSession::new(registry.acquire().await.unwrap());
        let mut rx = session.stream(request(), vec![]);
        let mut got = Vec::new();
        while let Some(item) = rx.recv().await {
            got.push(item.unwrap().text);
        }
        assert_eq!(got, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn dropping_receiver_releases_the_lock() {
        let mut stub = StubCommunicator::with_fragments(&["a"; 64]);
        stub.delay = Some(Duration::from_millis(5));
        let registry =
            Arc::new(ModelRegistry::with_communicator(test_config(), Box::new(stub)));

        let session = GenerationSession::new(registry.acquire().await.unwrap());
        let mut rx = session.stream(request(), vec![]);
        let first = rx.recv().await.unwrap().unwrap();
        assert_eq!(first.text, "a");
        drop(rx);

        // Cancellation must release the exclusivity lock promptly.
        tokio::time::timeout(Duration::from_secs(2), registry.acquire())
            .await
            .expect("lock was not released after cancellation")
            .unwrap();
    }

    #[tokio::test]
    async fn engine_error_surfaces_and_releases_lock() {
        let mut stub = StubCommunicator::with_fragments(&[]);
        stub.fail_with = Some("boom".to_string());
        let registry =
            Arc::new(ModelRegistry::with_communicator(test_config(), Box::new(stub)));

        let session = GenerationSession::new(registry.acquire().await.unwrap());
        let err = session.complete(request(), vec![]).await.unwrap_err();
        assert!(matches!(err, GatewayError::Inference(_)));

        tokio::time::timeout(Duration::from_secs(2), registry.acquire())
            .await
            .expect("lock was not released after engine failure")
            .unwrap();
    }

    /// Two concurrent generations never overlap in wall-clock time.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_generations_are_serialized() {
        let mut stub = StubCommunicator::with_fragments(&["out"]);
        stub.delay = Some(Duration::from_millis(40));
        let spans = stub.spans.clone();
        let registry =
            Arc::new(ModelRegistry::with_communicator(test_config(), Box::new(stub)));

        let mut handles = Vec::new();
        for _ in 0..2 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                let session = GenerationSession::new(registry.acquire().await.unwrap());
                session.complete(request(), vec![]).await.unwrap()
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap(), "out");
        }

        let spans = spans.lock().unwrap();
        assert_eq!(spans.len(), 2);
        let (a_start, a_end) = spans[0];
        let (b_start, b_end) = spans[1];
        let disjoint = a_end <= b_start || b_end <= a_start;
        assert!(disjoint, "generation intervals overlap");
    }
}
