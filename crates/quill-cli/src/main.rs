//! quill — terminal coding assistant.
//!
//! Headless line-oriented driver over `quill-core`: reads prompts from
//! stdin, prints agent events, and answers permission prompts inline.
//! Richer front-ends consume the same core APIs.

use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};

use quill_core::agent::{Agent, AgentEvent, AgentServices};
use quill_core::config::Config;
use quill_core::logging::LogStore;
use quill_core::lsp::LspCoordinator;
use quill_core::models;
use quill_core::permission::PermissionService;
use quill_core::provider::{
    default_should_think, AnthropicProvider, OpenAiProvider, Provider, ProviderOptions,
};
use quill_core::pubsub::EventBus;
use quill_core::storage::{Database, FileStore, MessageStore, SessionStore};
use quill_core::tools::{implementations, FileRecords, ToolRegistry, ToolServices};

/// quill - AI coding assistant
#[derive(Parser)]
#[command(name = "quill")]
#[command(about = "Terminal-hosted AI coding assistant", long_about = None)]
struct Cli {
    /// Config file path (defaults to the platform config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Working directory for tools (overrides config)
    #[arg(short, long)]
    workdir: Option<PathBuf>,

    /// Skip all permission prompts
    #[arg(long)]
    yolo: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(
                if config.debug {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::WARN.into()
                },
            ),
        )
        .with_writer(std::io::stderr)
        .init();

    let working_dir = cli
        .workdir
        .clone()
        .unwrap_or_else(|| config.working_directory());

    let data_dir = dirs::data_dir()
        .map(|d| d.join("quill"))
        .unwrap_or_else(|| PathBuf::from("."));
    std::fs::create_dir_all(&data_dir).context("creating data directory")?;
    let db = Database::new(&data_dir.join("quill.db"))?;

    let bus = Arc::new(EventBus::default());
    let sessions = Arc::new(SessionStore::new(db.clone(), bus.sessions.clone()));
    let messages = Arc::new(MessageStore::new(db.clone(), bus.messages.clone()));
    let files = Arc::new(FileStore::new(db, bus.files.clone()));

    let permissions = Arc::new(PermissionService::new(
        bus.permission_requests.clone(),
        bus.permission_replies.clone(),
    ));
    if cli.yolo {
        permissions.set_skip_all(true);
    }

    let log_store = Arc::new(LogStore::new(bus.logs.clone()));
    let lsp = Arc::new(LspCoordinator::new(config.lsp.keys().cloned().collect()));
    let tool_services = Arc::new(ToolServices {
        permissions: permissions.clone(),
        files,
        records: Arc::new(FileRecords::new()),
        lsp,
    });

    let registry = Arc::new(ToolRegistry::new(implementations::default_tools(
        config.fetch.per_host_interval_ms,
    )));

    let provider = build_provider(&config, &config.models.big)?;
    let title_provider = build_provider(&config, &config.models.little)?;

    let agent = Agent::new(AgentServices {
        bus,
        sessions: sessions.clone(),
        messages,
        registry,
        tool_services,
        provider,
        title_provider,
        working_dir,
    });

    let session = sessions.create(None, "")?;
    println!("quill ready (session {}). Type a prompt, or 'exit'.", session.id);

    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();

    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let prompt = line.trim();
        if prompt.is_empty() {
            continue;
        }
        if prompt == "exit" || prompt == "quit" {
            break;
        }

        let mut events = match agent.run(&session.id, prompt) {
            Ok(events) => events,
            Err(e) => {
                eprintln!("error: {e}");
                continue;
            }
        };

        while let Some(event) = events.recv().await {
            match event {
                AgentEvent::MessageUpdated { message } | AgentEvent::MessageCreated { message } => {
                    if message.role == quill_core::message::Role::Assistant {
                        // Repaint the assistant text as it grows.
                        print!("\r{}\x1b[K", message.text().replace('\n', " "));
                        std::io::stdout().flush()?;
                    }
                }
                AgentEvent::ToolStarted { call_id } => {
                    println!("\n[tool {call_id} started]");
                }
                AgentEvent::ToolFinished { call_id, is_error } => {
                    let status = if is_error { "failed" } else { "ok" };
                    println!("[tool {call_id} {status}]");
                }
                AgentEvent::PermissionRequested { request } => {
                    println!("\n--- permission requested ---");
                    println!("{}: {}", request.tool_name, request.description);
                    if let Some(diff) = request.params.get("diff").and_then(|d| d.as_str()) {
                        if !diff.is_empty() {
                            println!("{diff}");
                        }
                    }
                    print!("allow? [y]es / [a]lways / [n]o: ");
                    std::io::stdout().flush()?;
                    let answer = lines.next_line().await?.unwrap_or_default();
                    match answer.trim() {
                        "y" | "yes" => permissions.grant(&request.id),
                        "a" | "always" => permissions.grant_persistent(&request.id),
                        _ => permissions.deny(&request.id),
                    }
                }
                AgentEvent::RunFinished { reason } => {
                    println!("\n[run finished: {reason:?}]");
                    break;
                }
                AgentEvent::Error { message } => {
                    log_store.error(message.clone());
                    eprintln!("\nerror: {message}");
                }
            }
        }
    }

    Ok(())
}

fn build_provider(config: &Config, model_id: &str) -> Result<Arc<dyn Provider>> {
    let model = models::find(model_id)
        .with_context(|| format!("unknown model id: {model_id}"))?
        .clone();

    Ok(match model.provider {
        models::ModelProvider::Anthropic => {
            let provider_config = config.provider("anthropic");
            let mut options = ProviderOptions::new(provider_config.api_key, model);
            options.base_url = provider_config.base_url;
            options.disable_cache = provider_config.disable_cache;
            options.should_think = Some(default_should_think);
            Arc::new(AnthropicProvider::new(options))
        }
        models::ModelProvider::OpenAi => {
            let provider_config = config.provider("openai");
            let mut options = ProviderOptions::new(provider_config.api_key, model);
            options.base_url = provider_config.base_url;
            options.disable_cache = provider_config.disable_cache;
            Arc::new(OpenAiProvider::new(options))
        }
    })
}
