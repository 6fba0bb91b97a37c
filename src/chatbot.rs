//! Interactive terminal chat.
//!
//! A thin REPL over the same completion service the HTTP routes use.
//! Generation errors are printed and the loop continues; only `/quit` ends
//! the session.

use std::io::Write;
use std::sync::Arc;

use serde_json::json;

use crate::config::ConfigStore;
use crate::error::GatewayError;
use crate::llm::service::{CompletionRequest, CompletionService};
use crate::llm::{ChatMessage, ROLE_ASSISTANT, ROLE_SYSTEM, ROLE_USER};
use crate::log_info;

/// A parsed line of user input.
#[derive(Debug, PartialEq, Eq)]
pub enum Command {
    Quit,
    Clear,
    Load(String),
    Language(String),
    Chat(String),
    Unknown(String),
}

impl Command {
    pub fn parse(input: &str) -> Self {
        let trimmed = input.trim();
        if !trimmed.starts_with('/') {
            return Command::Chat(trimmed.to_string());
        }
        let mut parts = trimmed.splitn(2, char::is_whitespace);
        let head = parts.next().unwrap_or_default();
        let rest = parts.next().unwrap_or("").trim();
        match head {
            "/quit" | "/q" => Command::Quit,
            "/clear" | "/c" => Command::Clear,
            "/load" if !rest.is_empty() => Command::Load(rest.to_string()),
            "/language" if !rest.is_empty() => Command::Language(rest.to_string()),
            other => Command::Unknown(other.to_string()),
        }
    }
}

/// `system: <text>` stores a system message instead of chatting.
fn split_system_prefix(content: &str) -> Option<&str> {
    content.strip_prefix("system:").map(str::trim)
}

pub struct Chatbot {
    service: Arc<CompletionService>,
    store: ConfigStore,
    messages: Vec<ChatMessage>,
    multiline: bool,
}

impl Chatbot {
    pub fn new(service: Arc<CompletionService>, store: ConfigStore, multiline: bool) -> Self {
        Self {
            service,
            store,
            messages: Vec::new(),
            multiline,
        }
    }

    pub async fn run(&mut self) -> Result<(), GatewayError> {
        println!("Type a message to chat. Commands: /quit, /clear, /load <model>, /language <lang>");
        if self.multiline {
            println!("Multiline mode: finish your message with an empty line.");
        }

        loop {
            println!("{}", "─".repeat(60));
            print!("You: \n>>> ");
            std::io::stdout().flush()?;

            let input = read_input(self.multiline).await?;
            match Command::parse(&input) {
                Command::Quit => break,
                Command::Clear => {
                    self.messages.clear();
                    println!("Chat history cleared.");
                }
                Command::Load(model) => {
                    if let Err(e) = self.load_model(&model).await {
                        println!("Error: {e}");
                    }
                }
                Command::Language(language) => {
                    if let Err(e) = self.switch_language(&language) {
                        println!("Error: {e}");
                    }
                }
                Command::Unknown(command) => {
                    println!("Unknown command: {command}");
                }
                Command::Chat(content) if content.is_empty() => {}
                Command::Chat(content) => {
                    if let Some(system) = split_system_prefix(&content) {
                        self.messages.push(ChatMessage::new(ROLE_SYSTEM, system));
                        continue;
                    }
                    self.messages.push(ChatMessage::new(ROLE_USER, &content));
                    if let Err(e) = self.stream_response().await {
                        println!("Error: {e}");
                    }
                }
            }
        }
        Ok(())
    }

    /// Stream one assistant turn to stdout and append it to the history.
    async fn stream_response(&mut self) -> Result<(), GatewayError> {
        let request = CompletionRequest {
            messages: self.messages.clone(),
            stream: true,
            ..Default::default()
        };
        let mut chunks = self.service.stream_chunks(&request).await?;

        println!("{}", "─".repeat(60));
        println!("Assistant:");
        let mut response = String::new();
        while let Some(item) = chunks.recv().await {
            match item {
                Ok(chunk) => {
                    print!("{}", chunk.text);
                    std::io::stdout().flush()?;
                    response.push_str(&chunk.text);
                }
                Err(e) => {
                    println!();
                    println!("Error: {e}");
                    break;
                }
            }
        }
        println!();

        if !response.is_empty() {
            self.messages
                .push(ChatMessage::new(ROLE_ASSISTANT, response.trim()));
        }
        Ok(())
    }

    /// Swap to another model profile and persist the choice.
    async fn load_model(&mut self, model: &str) -> Result<(), GatewayError> {
        println!("Loading model {model}...");
        let config = self.store.load(model)?;
        self.store.persist_default_key("model", json!(model))?;

        let registry = self.service.registry();
        registry.reload(config).await;
        // Prime the new handle so the first chat turn doesn't pay for it.
        drop(registry.acquire().await?);

        log_info!("Switched active model to {}", model);
        println!("Model {model} ready.");
        Ok(())
    }

    fn switch_language(&self, language: &str) -> Result<(), GatewayError> {
        self.store.persist_default_key("language", json!(language))?;
        println!("Language set to {language}. Restart the app to reload language resources.");
        Ok(())
    }
}

/// Read one user input from stdin; in multiline mode lines accumulate until
/// an empty line (commands still act immediately).
async fn read_input(multiline: bool) -> Result<String, GatewayError> {
    tokio::task::spawn_blocking(move || {
        let stdin = std::io::stdin();
        let mut lines: Vec<String> = Vec::new();
        loop {
            let mut line = String::new();
            let n = stdin.read_line(&mut line)?;
            if n == 0 {
                // EOF behaves like /quit
                if lines.is_empty() {
                    return Ok("/quit".to_string());
                }
                break;
            }
            let line = line.trim_end_matches(['\r', '\n']).to_string();
            if !multiline {
                return Ok(line);
            }
            if line.is_empty() {
                break;
            }
            let is_command = lines.is_empty() && line.starts_with('/');
            lines.push(line);
            if is_command {
                break;
            }
        }
        Ok(lines.join("\n"))
    })
    .await
    .map_err(|e| GatewayError::Inference(format!("input task failed: {e}")))?
}
