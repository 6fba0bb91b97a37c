//! Chat-prompt construction.
//!
//! Turns an ordered list of role-tagged messages into the flat prompt string
//! a given model family expects, driven entirely by per-model token
//! configuration. Two addressing modes exist: positional (Mistral-style
//! `[INST]` wrapping keyed on message position) and role-keyed (one token
//! pair per role, with followup variants after the first occurrence).

use serde::{Deserialize, Serialize};

use crate::error::GatewayError;
use crate::llm::{ChatMessage, ROLE_ASSISTANT, ROLE_SYSTEM, ROLE_USER};

/// A start/end token pair wrapped around one message's content.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenPair {
    #[serde(default)]
    pub start: String,
    #[serde(default)]
    pub end: String,
}

impl TokenPair {
    pub fn new(start: &str, end: &str) -> Self {
        Self {
            start: start.to_string(),
            end: end.to_string(),
        }
    }

    fn wrap(&self, content: &str, out: &mut String) {
        out.push_str(&self.start);
        out.push_str(content);
        out.push_str(&self.end);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateMode {
    /// First two messages use the primary pairs, the rest the followup pairs.
    /// Roles other than user/assistant are skipped.
    Positional,
    /// Token pair selected by role; followup pairs after the first user and
    /// first assistant turn. Unknown roles are an error.
    RoleKeyed,
}

/// Per-model token-wrapping rules. Immutable once the model is loaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateConfig {
    pub mode: TemplateMode,
    #[serde(default)]
    pub system: TokenPair,
    #[serde(default)]
    pub user: TokenPair,
    #[serde(default)]
    pub user_followup: TokenPair,
    #[serde(default)]
    pub assistant: TokenPair,
    #[serde(default)]
    pub assistant_followup: TokenPair,
    #[serde(default)]
    pub system_prompt_supported: bool,
    /// Stop sequences recognized during generation.
    #[serde(default)]
    pub end_tokens: Vec<String>,
}

/// The rendered prompt plus the positional-mode stop token (empty when none
/// applies; role-keyed prompts rely on `end_tokens` instead).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedPrompt {
    pub prompt: String,
    pub stop_token: String,
}

impl TemplateConfig {
    /// Mistral-instruct wrapping: `<s>[INST] ... [/INST]` for the opening
    /// exchange, bare `[INST]` pairs afterwards.
    pub fn mistral() -> Self {
        Self {
            mode: TemplateMode::Positional,
            system: TokenPair::default(),
            user: TokenPair::new("<s>[INST] ", " [/INST]"),
            user_followup: TokenPair::new("[INST] ", " [/INST]"),
            assistant: TokenPair::new(" ", " </s>"),
            assistant_followup: TokenPair::new(" ", ""),
            system_prompt_supported: false,
            end_tokens: vec!["</s>".to_string()],
        }
    }

    /// ChatML wrapping: `<|im_start|>role\n ... <|im_end|>\n` for every turn.
    pub fn chatml() -> Self {
        Self {
            mode: TemplateMode::RoleKeyed,
            system: TokenPair::new("<|im_start|>system\n", "<|im_end|>\n"),
            user: TokenPair::new("<|im_start|>user\n", "<|im_end|>\n"),
            user_followup: TokenPair::new("<|im_start|>user\n", "<|im_end|>\n"),
            assistant: TokenPair::new("<|im_start|>assistant\n", "<|im_end|>\n"),
            assistant_followup: TokenPair::new("<|im_start|>assistant\n", "<|im_end|>\n"),
            system_prompt_supported: true,
            end_tokens: vec!["<|im_end|>".to_string(), "<|endoftext|>".to_string()],
        }
    }

    /// Render `messages` into a model-native prompt. Pure: identical input
    /// always yields byte-identical output.
    pub fn render(&self, messages: &[ChatMessage]) -> Result<RenderedPrompt, GatewayError> {
        if messages.is_empty() {
            return Err(GatewayError::EmptyInput);
        }
        match self.mode {
            TemplateMode::Positional => Ok(self.render_positional(messages)),
            TemplateMode::RoleKeyed => self.render_role_keyed(messages),
        }
    }

    fn render_positional(&self, messages: &[ChatMessage]) -> RenderedPrompt {
        let primary_stop = self.end_tokens.first().cloned().unwrap_or_default();
        let mut prompt = String::new();
        let mut stop_token = String::new();

        for (i, message) in messages.iter().enumerate() {
            let content = message.content.trim();
            let role = message.role.as_str();
            if role != ROLE_USER && role != ROLE_ASSISTANT {
                continue;
            }

            // The stop token only applies while the opening exchange is the
            // latest thing in the prompt.
            if i <= 1 {
                stop_token = primary_stop.clone();
                if role == ROLE_USER {
                    self.user.wrap(content, &mut prompt);
                } else {
                    self.assistant.wrap(content, &mut prompt);
                }
            } else {
                stop_token.clear();
                if role == ROLE_USER {
                    self.user_followup.wrap(content, &mut prompt);
                } else {
                    self.assistant_followup.wrap(content, &mut prompt);
                }
            }
        }

        RenderedPrompt { prompt, stop_token }
    }

    fn render_role_keyed(&self, messages: &[ChatMessage]) -> Result<RenderedPrompt, GatewayError> {
        let mut prompt = String::new();

        // Models that expect a system slot get an empty synthetic one when
        // the conversation doesn't open with a system message.
        if self.system_prompt_supported && messages[0].role != ROLE_SYSTEM {
            self.system.wrap("", &mut prompt);
        }

        let mut seen_user = false;
        let mut seen_assistant = false;

        for (i, message) in messages.iter().enumerate() {
            let content = message.content.trim();
            match message.role.as_str() {
                ROLE_SYSTEM => {
                    if i != 0 {
                        return Err(GatewayError::MisplacedSystemPrompt);
                    }
                    self.system.wrap(content, &mut prompt);
                }
                ROLE_USER => {
                    if seen_user {
                        self.user_followup.wrap(content, &mut prompt);
                    } else {
                        self.user.wrap(content, &mut prompt);
                        seen_user = true;
                    }
                }
                ROLE_ASSISTANT => {
                    if seen_assistant {
                        self.assistant_followup.wrap(content, &mut prompt);
                    } else {
                        self.assistant.wrap(content, &mut prompt);
                        seen_assistant = true;
                    }
                }
                other => return Err(GatewayError::UnknownRole(other.to_string())),
            }
        }

        // Generation cue: open the assistant turn the model should continue.
        if messages.last().map(|m| m.role.as_str()) != Some(ROLE_ASSISTANT) {
            let cue = if seen_assistant {
                &self.assistant_followup
            } else {
                &self.assistant
            };
            prompt.push_str(&cue.start);
        }

        Ok(RenderedPrompt {
            prompt,
            stop_token: String::new(),
        })
    }
}
