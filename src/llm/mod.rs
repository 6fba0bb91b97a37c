//! Completion pipeline: templating, generation, aggregation, response shaping.

pub mod aggregator;
pub mod communicator;
pub mod engine;
pub mod registry;
pub mod service;
pub mod session;
pub mod template;

use serde::{Deserialize, Serialize};

pub const ROLE_SYSTEM: &str = "system";
pub const ROLE_USER: &str = "user";
pub const ROLE_ASSISTANT: &str = "assistant";

/// One turn of a conversation as received on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: &str, content: &str) -> Self {
        Self {
            role: role.to_string(),
            content: content.to_string(),
        }
    }
}

/// One decoding step's text delta from the engine.
///
/// A fragment sequence is finite, ordered and consumed exactly once;
/// a new generation call always produces a new sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub text: String,
}

impl Fragment {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

/// A batched group of fragments, tagged for wire framing.
///
/// `is_first` carries the role-announcement obligation; `is_last` carries
/// the termination obligation. A single-chunk stream sets both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseChunk {
    pub text: String,
    pub is_first: bool,
    pub is_last: bool,
}

/// Sampling parameters for one inference call. Built fresh per request from
/// the profile's `default_completion_config` plus any request overrides.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f64,
    pub repeat_penalty: f64,
    pub echo: bool,
    pub streaming: bool,
}
