//! llama.cpp adapter.
//!
//! Wraps `llama-cpp-2` behind two entry points: a blocking full completion
//! and a pull-based token stream. Iterating the stream is what drives the
//! decoder forward; dropping it mid-way abandons the generation.

use std::num::NonZeroU32;
use std::path::Path;

use llama_cpp_2::{
    context::params::LlamaContextParams,
    context::LlamaContext,
    llama_backend::LlamaBackend,
    llama_batch::LlamaBatch,
    model::{params::LlamaModelParams, AddBos, LlamaModel, Special},
    sampling::LlamaSampler,
    token::LlamaToken,
};
use once_cell::sync::OnceCell;

use crate::error::GatewayError;
use crate::llm::{Fragment, GenerationRequest};
use crate::{log_debug, log_info, log_warn};

/// Keep a little context head-room so the final decode never trips the limit.
const CONTEXT_MARGIN: u32 = 8;

static BACKEND: OnceCell<LlamaBackend> = OnceCell::new();

/// The llama.cpp backend holds process-wide hardware state and must only be
/// initialized once, regardless of how many times the model is swapped.
fn backend() -> Result<&'static LlamaBackend, GatewayError> {
    BACKEND.get_or_try_init(|| {
        LlamaBackend::init().map_err(|e| GatewayError::Inference(format!("backend init failed: {e}")))
    })
}

/// Model-level knobs applied at load time.
#[derive(Debug, Clone)]
pub struct EngineParams {
    pub n_ctx: u32,
    pub n_batch: u32,
    pub n_threads: u32,
    pub n_gpu_layers: u32,
}

pub struct LlamaEngine {
    model: LlamaModel,
    params: EngineParams,
}

impl LlamaEngine {
    pub fn load(model_path: &Path, params: EngineParams) -> Result<Self, GatewayError> {
        let backend = backend()?;

        let model_params = LlamaModelParams::default().with_n_gpu_layers(params.n_gpu_layers);

        log_info!("Loading model from: {}", model_path.display());
        log_info!("GPU layers configured: {}", params.n_gpu_layers);

        let model = LlamaModel::load_from_file(backend, model_path, &model_params)
            .map_err(|e| GatewayError::Inference(format!("failed to load model: {e}")))?;

        log_info!("Model loaded successfully");

        Ok(Self { model, params })
    }

    /// Run one generation to completion and return the raw text. When
    /// `request.echo` is set the prompt is included in the returned text,
    /// mirroring the engine-side echo flag callers may rely on.
    pub fn complete(
        &self,
        request: &GenerationRequest,
        stop: &[String],
    ) -> Result<String, GatewayError> {
        let mut text = String::new();
        for fragment in self.stream(request, stop)? {
            text.push_str(&fragment?.text);
        }
        if request.echo {
            Ok(format!("{}{}", request.prompt, text))
        } else {
            Ok(text)
        }
    }

    /// Evaluate the prompt and return a lazy token stream. The prompt decode
    /// happens eagerly here; each `next()` afterwards samples and decodes
    /// exactly one token.
    pub fn stream(
        &self,
        request: &GenerationRequest,
        stop: &[String],
    ) -> Result<TokenStream<'_>, GatewayError> {
        let tokens = self
            .model
            .str_to_token(&request.prompt, AddBos::Never)
            .map_err(|e| GatewayError::Inference(format!("tokenization failed: {e}")))?;
        if tokens.is_empty() {
            return Err(GatewayError::Inference("prompt tokenized to nothing".to_string()));
        }
        log_debug!("Prompt tokenized to {} tokens", tokens.len());

        let n_ctx = NonZeroU32::new(self.params.n_ctx)
            .ok_or_else(|| GatewayError::Config("n_ctx must be non-zero".to_string()))?;
        let ctx_params = LlamaContextParams::default()
            .with_n_ctx(Some(n_ctx))
            .with_n_batch(self.params.n_batch)
            .with_n_threads(self.params.n_threads as i32);

        let mut context = self
            .model
            .new_context(backend()?, ctx_params)
            .map_err(|e| GatewayError::Inference(format!("context creation failed: {e}")))?;

        // Decode the prompt in n_batch-sized slices; only the final slice's
        // last token requests logits.
        let batch_cap = self.params.n_batch as usize;
        let prompt_tokens = tokens.len();
        let mut batch = LlamaBatch::new(batch_cap, 1);
        let chunk_count = prompt_tokens.div_ceil(batch_cap);
        for chunk_idx in 0..chunk_count {
            let start = chunk_idx * batch_cap;
            let end = std::cmp::min(start + batch_cap, prompt_tokens);

            batch.clear();
            for (offset, &token) in tokens[start..end].iter().enumerate() {
                let pos = start + offset;
                let is_last = pos == prompt_tokens - 1;
                batch
                    .add(token, pos as i32, &[0], is_last)
                    .map_err(|e| {
                        GatewayError::Inference(format!("batch add failed at prompt token {pos}: {e}"))
                    })?;
            }

            context.decode(&mut batch).map_err(|e| {
                GatewayError::Inference(format!(
                    "prompt decode failed (chunk {}/{}): {}",
                    chunk_idx + 1,
                    chunk_count,
                    e
                ))
            })?;
        }

        // Budget: caller's max_tokens, capped by remaining context space.
        let room = self
            .params
            .n_ctx
            .saturating_sub(prompt_tokens as u32)
            .saturating_sub(CONTEXT_MARGIN);
        let budget = std::cmp::min(request.max_tokens, room);
        log_debug!(
            "Generation budget: {} tokens ({} requested, {} context room)",
            budget,
            request.max_tokens,
            room
        );

        let sampler = build_sampler(request);
        let stops: Vec<String> = stop.iter().filter(|s| !s.is_empty()).cloned().collect();

        Ok(TokenStream {
            model: &self.model,
            context,
            sampler,
            batch,
            stops,
            eos: self.model.token_eos(),
            pos: prompt_tokens as i32,
            remaining: budget,
            generated: String::new(),
            done: false,
        })
    }
}

/// Greedy decoding at temperature zero, otherwise a temperature chain with a
/// seeded final distribution so runs stay reproducible.
fn build_sampler(request: &GenerationRequest) -> LlamaSampler {
    let mut chain: Vec<LlamaSampler> = Vec::new();
    if request.repeat_penalty > 1.0 {
        chain.push(LlamaSampler::penalties(
            64,
            request.repeat_penalty as f32,
            0.0,
            0.0,
        ));
    }
    if request.temperature <= 0.0 {
        chain.push(LlamaSampler::greedy());
    } else {
        chain.push(LlamaSampler::temp(request.temperature as f32));
        chain.push(LlamaSampler::dist(1234));
    }
    LlamaSampler::chain_simple(chain)
}

/// Forward-only iterator over generated fragments. Holds the decode context,
/// so it cannot outlive the engine, and a sequence can never be re-iterated.
pub struct TokenStream<'a> {
    model: &'a LlamaModel,
    context: LlamaContext<'a>,
    sampler: LlamaSampler,
    batch: LlamaBatch<'a>,
    stops: Vec<String>,
    eos: LlamaToken,
    pos: i32,
    remaining: u32,
    generated: String,
    done: bool,
}

impl TokenStream<'_> {
    /// Append `piece`, then scan for a stop sequence. Returns the slice of
    /// `piece` that may still be emitted; `None` text means stop without
    /// emitting anything further.
    fn apply_stops(&mut self, piece: String) -> Option<String> {
        let before = self.generated.len();
        self.generated.push_str(&piece);

        let mut cut: Option<usize> = None;
        for stop in &self.stops {
            if let Some(idx) = self.generated.find(stop.as_str()) {
                cut = Some(cut.map_or(idx, |c| c.min(idx)));
            }
        }

        match cut {
            None => Some(piece),
            Some(idx) => {
                self.done = true;
                self.generated.truncate(idx);
                if idx > before {
                    // The stop sequence starts inside this piece: emit the
                    // prefix that precedes it.
                    let mut head = piece;
                    head.truncate(idx - before);
                    Some(head)
                } else {
                    // Stop sequence began in already-emitted text; there is
                    // nothing left to send.
                    None
                }
            }
        }
    }
}

impl Iterator for TokenStream<'_> {
    type Item = Result<Fragment, GatewayError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done || self.remaining == 0 {
                self.done = true;
                return None;
            }

            let token = self.sampler.sample(&self.context, -1);
            if token == self.eos {
                log_debug!("EOS token at position {}", self.pos);
                self.done = true;
                return None;
            }

            self.batch.clear();
            if let Err(e) = self.batch.add(token, self.pos, &[0], true) {
                self.done = true;
                return Some(Err(GatewayError::Inference(format!(
                    "batch add failed at position {}: {e}",
                    self.pos
                ))));
            }
            if let Err(e) = self.context.decode(&mut self.batch) {
                self.done = true;
                return Some(Err(GatewayError::Inference(format!(
                    "decode failed at position {}: {e}",
                    self.pos
                ))));
            }
            self.pos += 1;
            self.remaining -= 1;

            let piece = match self.model.token_to_str(token, Special::Tokenize) {
                Ok(s) => s,
                Err(e) => {
                    // Partial UTF-8 at a token boundary; skip and continue.
                    log_warn!("Token {token} is not valid UTF-8 on its own: {e}");
                    continue;
                }
            };

            match self.apply_stops(piece) {
                Some(text) if !text.is_empty() => return Some(Ok(Fragment::new(text))),
                Some(_) => continue,
                None => return None,
            }
        }
    }
}
