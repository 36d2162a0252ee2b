//! glossa - knowledge-escalated answers from local or hosted models

mod config;

use anyhow::{Context, Result, bail};
use clap::Parser;
use futures::StreamExt;
use glossa_ai::{Message, Providers};
use glossa_graph::{
    InMemoryKnowledgeStore, KnowledgeGraph, KnowledgeStore, RunRequest, StreamEvent,
};
use glossa_store::SqliteKnowledgeStore;
use std::io::{IsTerminal, Read, Write};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// glossa - answer prompts with knowledge-base context
#[derive(Parser, Debug)]
#[command(name = "glossa")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Prompt to answer (read from stdin when absent)
    prompt: Option<String>,

    /// Model to use, optionally prefixed with a provider (e.g. openai:gpt-4o-mini)
    #[arg(short, long)]
    model: Option<String>,

    /// Provider (ollama, openai)
    #[arg(short, long)]
    provider: Option<String>,

    /// Sampling temperature, passed to the backend as is
    #[arg(short, long)]
    temperature: Option<f32>,

    /// System message to prepend
    #[arg(short, long)]
    system: Option<String>,

    /// Wait for the whole answer instead of streaming it
    #[arg(long)]
    no_stream: bool,

    /// Knowledge store URL (overrides DATABASE_URL)
    #[arg(long)]
    database: Option<String>,

    /// Use a throwaway in-memory knowledge store
    #[arg(long, conflicts_with = "database")]
    in_memory: bool,

    /// List available models and exit
    #[arg(long)]
    models: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Initialize config file
    #[arg(long)]
    init_config: bool,
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("glossa=debug,glossa_ai=debug,glossa_graph=debug,glossa_store=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    if args.init_config {
        let path = config::Config::init().context("Error creating config")?;
        println!("Config file created at: {}", path.display());
        println!("\nExample config:\n{}", config::example_config());
        return Ok(());
    }

    let mut settings = config::Config::load().resolve()?;
    if let Some(url) = args.database.clone() {
        settings.database_url = url;
    }

    let providers = Providers::from_settings(&settings.providers)?;

    if args.models {
        return list_models(&providers).await;
    }

    let store = open_store(&args, &settings.database_url).await?;
    let graph = KnowledgeGraph::new(providers, store, settings.graph, settings.defaults)?;

    let request = build_request(&args)?;
    if args.no_stream {
        run_blocking(&graph, request).await
    } else {
        run_streaming(&graph, request).await
    }
}

async fn list_models(providers: &Providers) -> Result<()> {
    for kind in [glossa_ai::Provider::Local, glossa_ai::Provider::Hosted] {
        if !providers.contains(kind) {
            continue;
        }
        let provider = providers.get(kind)?;
        match provider.list_models().await {
            Ok(models) => {
                for model in models {
                    println!("{}:{}", kind.tag(), model);
                }
            }
            Err(e) => eprintln!("Could not list {} models: {}", kind.name(), e),
        }
    }
    Ok(())
}

async fn open_store(args: &Args, database_url: &str) -> Result<Arc<dyn KnowledgeStore>> {
    if args.in_memory {
        return Ok(Arc::new(InMemoryKnowledgeStore::new()));
    }
    if let Some(dir) = config::sqlite_path(database_url).and_then(|p| p.parent()) {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating {}", dir.display()))?;
        }
    }
    let store = SqliteKnowledgeStore::connect(database_url)
        .await
        .with_context(|| format!("opening knowledge store {database_url}"))?;
    Ok(Arc::new(store))
}

fn build_request(args: &Args) -> Result<RunRequest> {
    let prompt = match &args.prompt {
        Some(prompt) => prompt.clone(),
        None => {
            let mut stdin = std::io::stdin();
            if stdin.is_terminal() {
                bail!("no prompt given; pass one as an argument or pipe it on stdin");
            }
            let mut buf = String::new();
            stdin.read_to_string(&mut buf)?;
            buf
        }
    };
    if prompt.trim().is_empty() {
        bail!("prompt is empty");
    }

    let mut messages = Vec::new();
    if let Some(system) = &args.system {
        messages.push(Message::system(system.clone()));
    }
    messages.push(Message::user(prompt));

    Ok(RunRequest {
        model: args.model.clone(),
        provider: args.provider.clone(),
        messages,
        temperature: args.temperature,
    })
}

async fn run_blocking(graph: &KnowledgeGraph, request: RunRequest) -> Result<()> {
    let output = graph.run_blocking(request).await?;
    println!("{}", output.answer);
    if let Some(error) = output.error {
        eprintln!("Warning: {}", error);
    }
    tracing::info!(
        provider = %output.provider,
        model = %output.model,
        new_terms = ?output.new_terms,
        "done"
    );
    Ok(())
}

async fn run_streaming(graph: &KnowledgeGraph, request: RunRequest) -> Result<()> {
    let mut events = graph.run_streaming(request)?;
    let mut stdout = std::io::stdout();

    while let Some(event) = events.next().await {
        match event {
            StreamEvent::Delta { text } => {
                write!(stdout, "{}", text)?;
                stdout.flush()?;
            }
            StreamEvent::Done { output } => {
                writeln!(stdout)?;
                if let Some(error) = output.error {
                    eprintln!("Warning: {}", error);
                }
                tracing::info!(
                    provider = %output.provider,
                    model = %output.model,
                    new_terms = ?output.new_terms,
                    "done"
                );
                return Ok(());
            }
            StreamEvent::Error { message } => {
                writeln!(stdout)?;
                bail!("generation failed: {message}");
            }
        }
    }

    bail!("stream ended without a result")
}
