//! context-rag command line: queue worker and document/chat operations
//!
//! Run with: cargo run -p context-rag --features cli -- worker

use anyhow::{bail, Context as _};
use clap::{ArgAction, Parser, Subcommand};
use context_rag::{AppState, HistoryMessage, RagConfig};
use std::path::{Path, PathBuf};
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "context-rag", about = "Document ingestion and grounded chat over contexts")]
struct Cli {
    /// TOML configuration file; environment variables override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true, action = ArgAction::SetTrue)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Consume document messages until Ctrl+C
    Worker {
        /// Overrides queue.workers
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Create a context and print its id
    CreateContext {
        #[arg(long)]
        owner: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        description: Option<String>,
    },
    /// Upload a file into a context
    Ingest {
        #[arg(long)]
        context: Uuid,
        file: PathBuf,
        /// Declared MIME type; guessed from the extension when omitted
        #[arg(long)]
        mime: Option<String>,
    },
    /// List a context's documents
    Documents {
        #[arg(long)]
        context: Uuid,
    },
    /// Show a document's upload status
    Status { document: Uuid },
    /// Retry a document that failed processing
    Reprocess { document: Uuid },
    /// Ask a question against a context
    Ask {
        #[arg(long)]
        context: Uuid,
        message: String,
        /// JSON array of {"role", "content"} history messages
        #[arg(long)]
        history: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "context_rag=debug" } else { "context_rag=info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = RagConfig::load(cli.config.as_deref())?;
    if let Command::Worker { workers: Some(workers) } = &cli.command {
        config.queue.workers = *workers;
    }

    tracing::info!("Configuration loaded");
    tracing::info!("  - Database: {}", config.database.path.display());
    tracing::info!("  - Embedding model: {} ({} dimensions)", config.embeddings.model, config.embeddings.dimensions);
    tracing::info!("  - LLM model: {}", config.llm.model);
    tracing::info!("  - Chunk size: {} (overlap {})", config.chunking.chunk_size, config.chunking.chunk_overlap);

    let state = AppState::new(config).await?;

    match cli.command {
        Command::Worker { .. } => run_worker(&state).await?,
        Command::CreateContext {
            owner,
            name,
            description,
        } => {
            let context = state.documents().create_context(&owner, &name, description).await?;
            println!("{}", context.id);
        }
        Command::Ingest { context, file, mime } => {
            let mime = match mime {
                Some(mime) => mime,
                None => guess_mime(&file)?,
            };
            let data = tokio::fs::read(&file)
                .await
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let filename = file
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| file.display().to_string());

            let document = state.documents().upload(context, &filename, &mime, data).await?;
            println!("{} {}", document.id, document.upload_status);
        }
        Command::Documents { context } => {
            for document in state.documents().list_documents(context).await? {
                println!(
                    "{}  {:<17}  {}  {}",
                    document.id,
                    document.upload_status.to_string(),
                    document.created_at.format("%Y-%m-%d %H:%M:%S"),
                    document.filename
                );
            }
        }
        Command::Status { document } => {
            println!("{}", state.documents().status(document).await?);
        }
        Command::Reprocess { document } => {
            let document = state.documents().reprocess(document).await?;
            println!("{} {}", document.id, document.upload_status);
        }
        Command::Ask {
            context,
            message,
            history,
        } => {
            check_embeddings(&state).await;
            let history = match history {
                Some(path) => load_history(&path)?,
                None => Vec::new(),
            };
            let response = state.chat().chat(context, &message, &history).await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
    }

    Ok(())
}

async fn run_worker(state: &AppState) -> anyhow::Result<()> {
    check_embeddings(state).await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = state.spawn_workers(shutdown_rx)?;

    tracing::info!("Worker running, press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down...");
    shutdown_tx.send(true)?;

    for handle in handles {
        if let Err(e) = handle.await {
            tracing::error!("Consumer task ended abnormally: {}", e);
        }
    }
    Ok(())
}

async fn check_embeddings(state: &AppState) {
    let embedder = state.embedder();
    tracing::info!("Checking embedding provider {}...", embedder.provider_name());
    match embedder.health_check().await {
        Ok(true) => tracing::info!("Embedding provider is reachable"),
        Ok(false) => tracing::warn!("Embedding provider is not healthy; chunks will fall back to zero vectors"),
        Err(e) => tracing::warn!("Embedding provider check failed: {}", e),
    }
}

fn guess_mime(path: &Path) -> anyhow::Result<String> {
    let extension = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    let mime = match extension.as_str() {
        "pdf" => "application/pdf",
        "txt" | "text" => "text/plain",
        "md" | "markdown" => "text/markdown",
        other => bail!("Cannot infer a MIME type for '.{}', pass --mime", other),
    };
    Ok(mime.to_string())
}

fn load_history(path: &Path) -> anyhow::Result<Vec<HistoryMessage>> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Invalid history JSON in {}", path.display()))
}
