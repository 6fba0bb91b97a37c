//! llama-gateway: an OpenAI-compatible chat-completions server for a single
//! locally hosted GGUF model.
//!
//! A request flows through templating, the generation session, and the
//! chunk aggregator before wire framing; everything mutable funnels through
//! the model registry, whose lock guarantees at most one generation runs at
//! a time.

pub mod chatbot;
pub mod config;
pub mod error;
pub mod llm;
pub mod loader;
pub mod logger;
pub mod web;

pub use config::{AppConfig, ConfigStore};
pub use error::GatewayError;
pub use llm::registry::ModelRegistry;
pub use llm::service::CompletionService;
