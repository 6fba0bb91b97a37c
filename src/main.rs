use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use tokio::sync::oneshot;

use llama_gateway::chatbot::Chatbot;
use llama_gateway::logger::LOGGER;
use llama_gateway::{web, CompletionService, ConfigStore, ModelRegistry};

#[derive(Parser, Debug)]
#[command(
    name = "llama-gateway",
    about = "OpenAI-compatible chat-completions server for a local GGUF model"
)]
struct Cli {
    /// Model profile name (a file under llm_config/)
    #[arg(long)]
    model: Option<String>,

    /// Bind address override
    #[arg(long)]
    host: Option<String>,

    /// Port override
    #[arg(long)]
    port: Option<u16>,

    /// Force GPU offload on (1) or off (0)
    #[arg(long)]
    use_gpu: Option<u8>,

    /// Run the interactive terminal chat alongside the server
    #[arg(long)]
    chat: bool,

    /// Multiline input in chat mode (finish messages with an empty line)
    #[arg(long)]
    multiline: bool,

    /// Mirror log output to stderr
    #[arg(long, short)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        LOGGER.set_verbose(true);
    }

    let store = ConfigStore::new("./config", "./llm_config");

    // --model beats the MODEL env var, which beats the persisted choice in
    // config/default.json.
    let model = match cli.model.or_else(|| std::env::var("MODEL").ok()) {
        Some(model) => model,
        None => {
            let default = store.read_default().context("reading config/default.json")?;
            match default.get("model").and_then(|v| v.as_str()) {
                Some(model) => model.to_string(),
                None => bail!("model can't be empty: pass --model or set it in config/default.json"),
            }
        }
    };

    let mut config = store
        .load(&model)
        .with_context(|| format!("loading configuration for model {model}"))?;

    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(use_gpu) = cli.use_gpu {
        config.use_gpu = use_gpu == 1;
    }

    if config.debug_mode {
        println!("=== CONFIGURATION ===");
        println!("{}", serde_json::to_string_pretty(&config)?);
    }

    let registry = Arc::new(ModelRegistry::new(config.clone()));
    let service = Arc::new(CompletionService::new(registry.clone()));

    // Fetch and load the model up front so the first request doesn't pay
    // for it (and so a broken profile fails the boot, not a request).
    println!("=== INIT MODEL: {} ===", config.model_label());
    drop(registry.acquire().await?);

    let (ready_tx, ready_rx) = oneshot::channel();
    let server = {
        let config = config.clone();
        let service = service.clone();
        tokio::spawn(async move { web::run_server(&config, service, ready_tx).await })
    };

    let addr = match ready_rx.await {
        Ok(addr) => addr,
        Err(_) => {
            // The sender dropped: surface the bind/startup error itself.
            server.await.context("server task panicked")??;
            bail!("server exited before becoming ready");
        }
    };
    println!("=== SERVER STARTED: http://{}{} ===", addr, config.url_prefix);

    if cli.chat {
        Chatbot::new(service, store, cli.multiline).run().await?;
        Ok(())
    } else {
        server.await.context("server task panicked")??;
        Ok(())
    }
}
