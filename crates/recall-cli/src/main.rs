//! recall CLI - operator interface for the retrieval service.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;
use ulid::Ulid;

use recall_core::{EmbeddingModel, RecallConfig};
use recall_embed::{HashedTokenModel, OnnxEmbeddingModel};
use recall_service::{ReindexItem, RetrievalService};

/// recall - course-scoped semantic retrieval over stored notes
#[derive(Parser)]
#[command(name = "recall")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Database path (default: platform data dir)
    #[arg(short, long, global = true)]
    database: Option<PathBuf>,

    /// ONNX model directory; a lexical hashing model is used when omitted
    #[arg(short, long, global = true)]
    model: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the embedding store
    Init,

    /// Index a note file into a course
    Add {
        /// Path to the note file (markdown or plain text)
        path: PathBuf,

        /// Course id (ULID)
        #[arg(short, long)]
        course: String,
    },

    /// Remove a document from the index
    Remove {
        /// Document id (ULID)
        id: String,
    },

    /// Retrieve prior-note context for new note text
    Context {
        /// The new note text
        text: String,

        /// Course id (ULID)
        #[arg(short, long)]
        course: String,
    },

    /// Show notes related to an indexed document
    Related {
        /// Document id (ULID)
        id: String,

        /// Maximum number of related notes
        #[arg(short = 'k', long, default_value = "5")]
        top_k: usize,
    },

    /// Show indexing counts for a course
    Stats {
        /// Course id (ULID)
        #[arg(short, long)]
        course: String,
    },
}

fn setup_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::WARN };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();
}

fn build_config(database: Option<PathBuf>, model: &Option<PathBuf>) -> RecallConfig {
    let mut config = RecallConfig::load_default().unwrap_or_default();
    if let Some(path) = database {
        config.storage.path = path;
    }
    if let Some(path) = model {
        config.embedding.model_path = path.clone();
    }
    config
}

async fn open_service(config: RecallConfig, use_onnx: bool) -> Result<RetrievalService, Box<dyn std::error::Error>> {
    let model: Arc<dyn EmbeddingModel> = if use_onnx {
        Arc::new(OnnxEmbeddingModel::open(&config.embedding)?)
    } else {
        Arc::new(HashedTokenModel::new(config.embedding.dimension))
    };
    Ok(RetrievalService::with_model(config, model).await?)
}

fn parse_ulid(s: &str, what: &str) -> Result<Ulid, Box<dyn std::error::Error>> {
    Ulid::from_string(s).map_err(|_| format!("invalid {} id: {}", what, s).into())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let config = build_config(cli.database, &cli.model);
    let use_onnx = cli.model.is_some();

    match cli.command {
        Commands::Init => {
            let service = open_service(config, use_onnx).await?;
            println!(
                "Initialized embedding store at: {}",
                service.config().storage.path.display()
            );
            service.shutdown().await;
        }
        Commands::Add { path, course } => {
            let course = parse_ulid(&course, "course")?;
            let text = fs::read_to_string(&path)?;

            let service = open_service(config, use_onnx).await?;
            // The CLI owns its document ids; a real deployment gets them
            // from the document store.
            let id = Ulid::new();

            // Reindex commits synchronously, so the result is queryable
            // when the command exits.
            let report = service
                .reindex(vec![ReindexItem {
                    id,
                    collection_id: course,
                    content_version: 1,
                    text,
                }])
                .await;

            if let Some((_, e)) = report.failed.first() {
                eprintln!("Error indexing {}: {}", path.display(), e);
                service.shutdown().await;
                std::process::exit(1);
            }
            println!("Indexed {} as document {}", path.display(), id);
            service.shutdown().await;
        }
        Commands::Remove { id } => {
            let id = parse_ulid(&id, "document")?;
            let service = open_service(config, use_onnx).await?;
            service.on_document_deleted(id).await?;
            println!("Removed document {}", id);
            service.shutdown().await;
        }
        Commands::Context { text, course } => {
            let course = parse_ulid(&course, "course")?;
            let service = open_service(config, use_onnx).await?;

            match service.get_context_for_note(&text, course).await {
                Ok(bundle) => {
                    if bundle.is_empty() {
                        match bundle.skipped {
                            Some(reason) => println!("Retrieval skipped: {:?}", reason),
                            None => println!("No relevant prior notes."),
                        }
                    } else {
                        println!(
                            "{} prior note(s), {} dropped for budget:\n",
                            bundle.results.len(),
                            bundle.dropped_for_budget
                        );
                        for result in &bundle.results {
                            println!(
                                "[{}] {} (score: {:.3})\n{}\n",
                                result.rank, result.document_id, result.similarity, result.snippet
                            );
                        }
                        let blob = service.build_prompt_context(&text, &bundle);
                        println!("--- prompt context ({} chars) ---", blob.total_chars());
                        println!("{}", blob.render());
                    }
                }
                Err(e) => {
                    eprintln!("Error: {}", e);
                    service.shutdown().await;
                    std::process::exit(1);
                }
            }
            service.shutdown().await;
        }
        Commands::Related { id, top_k } => {
            let id = parse_ulid(&id, "document")?;
            let service = open_service(config, use_onnx).await?;

            match service.get_related(id, top_k).await {
                Ok(related) if related.is_empty() => println!("No related notes."),
                Ok(related) => {
                    for result in related {
                        println!(
                            "[{}] {} (score: {:.3})\n{}\n",
                            result.rank, result.document_id, result.similarity, result.snippet
                        );
                    }
                }
                Err(e) => {
                    eprintln!("Error: {}", e);
                    service.shutdown().await;
                    std::process::exit(1);
                }
            }
            service.shutdown().await;
        }
        Commands::Stats { course } => {
            let course = parse_ulid(&course, "course")?;
            let service = open_service(config, use_onnx).await?;
            let stats = service.stats(course).await;
            println!("Documents: {}", stats.documents);
            println!("Embedded:  {}", stats.embedded);
            println!("Pending:   {}", stats.pending);
            service.shutdown().await;
        }
    }

    Ok(())
}
