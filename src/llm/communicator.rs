//! Model-family adapters.
//!
//! A communicator bundles a loaded engine with the prompt template its model
//! family expects. The capability surface is deliberately small: build a
//! prompt, complete it, or stream it. Which concrete communicator gets
//! constructed is a configuration decision, not an inheritance hierarchy.

use std::path::Path;

use crate::config::AppConfig;
use crate::error::GatewayError;
use crate::llm::engine::{EngineParams, LlamaEngine};
use crate::llm::template::{RenderedPrompt, TemplateConfig};
use crate::llm::{ChatMessage, Fragment, GenerationRequest};

pub type FragmentIter<'a> = Box<dyn Iterator<Item = Result<Fragment, GatewayError>> + 'a>;

pub trait Communicator: Send {
    /// Model identifier reported in completion envelopes.
    fn model_label(&self) -> &str;

    fn template(&self) -> &TemplateConfig;

    fn build_prompt(&self, messages: &[ChatMessage]) -> Result<RenderedPrompt, GatewayError> {
        self.template().render(messages)
    }

    fn complete(
        &self,
        request: &GenerationRequest,
        stop: &[String],
    ) -> Result<String, GatewayError>;

    fn complete_stream<'a>(
        &'a self,
        request: &GenerationRequest,
        stop: &[String],
    ) -> Result<FragmentIter<'a>, GatewayError>;
}

/// Mistral-instruct family: positional `[INST]` templating.
pub struct MistralCommunicator {
    engine: LlamaEngine,
    template: TemplateConfig,
    label: String,
}

impl MistralCommunicator {
    pub fn load(config: &AppConfig, model_path: &Path) -> Result<Self, GatewayError> {
        Ok(Self {
            engine: load_engine(config, model_path)?,
            template: config
                .model_config
                .template
                .clone()
                .unwrap_or_else(TemplateConfig::mistral),
            label: config.model_label(),
        })
    }
}

impl Communicator for MistralCommunicator {
    fn model_label(&self) -> &str {
        &self.label
    }

    fn template(&self) -> &TemplateConfig {
        &self.template
    }

    fn complete(
        &self,
        request: &GenerationRequest,
        stop: &[String],
    ) -> Result<String, GatewayError> {
        self.engine.complete(request, stop)
    }

    fn complete_stream<'a>(
        &'a self,
        request: &GenerationRequest,
        stop: &[String],
    ) -> Result<FragmentIter<'a>, GatewayError> {
        Ok(Box::new(self.engine.stream(request, stop)?))
    }
}

/// ChatML family (Qwen, Zephyr and friends): role-keyed templating with a
/// dedicated system slot.
pub struct ChatMlCommunicator {
    engine: LlamaEngine,
    template: TemplateConfig,
    label: String,
}

impl ChatMlCommunicator {
    pub fn load(config: &AppConfig, model_path: &Path) -> Result<Self, GatewayError> {
        Ok(Self {
            engine: load_engine(config, model_path)?,
            template: config
                .model_config
                .template
                .clone()
                .unwrap_or_else(TemplateConfig::chatml),
            label: config.model_label(),
        })
    }
}

impl Communicator for ChatMlCommunicator {
    fn model_label(&self) -> &str {
        &self.label
    }

    fn template(&self) -> &TemplateConfig {
        &self.template
    }

    fn complete(
        &self,
        request: &GenerationRequest,
        stop: &[String],
    ) -> Result<String, GatewayError> {
        self.engine.complete(request, stop)
    }

    fn complete_stream<'a>(
        &'a self,
        request: &GenerationRequest,
        stop: &[String],
    ) -> Result<FragmentIter<'a>, GatewayError> {
        Ok(Box::new(self.engine.stream(request, stop)?))
    }
}

fn load_engine(config: &AppConfig, model_path: &Path) -> Result<LlamaEngine, GatewayError> {
    let mc = &config.model_config;
    LlamaEngine::load(
        model_path,
        EngineParams {
            n_ctx: mc.n_ctx,
            n_batch: mc.n_batch,
            n_threads: mc.n_threads,
            n_gpu_layers: config.gpu_layers(),
        },
    )
}

/// Pick the communicator for the configured model family.
pub fn build_communicator(
    config: &AppConfig,
    model_path: &Path,
) -> Result<Box<dyn Communicator>, GatewayError> {
    match config.model_config.family.as_str() {
        "mistral" => Ok(Box::new(MistralCommunicator::load(config, model_path)?)),
        "chatml" => Ok(Box::new(ChatMlCommunicator::load(config, model_path)?)),
        other => Err(GatewayError::Config(format!(
            "unknown model family: {other}"
        ))),
    }
}
