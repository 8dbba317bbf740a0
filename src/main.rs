//! `ragd` — the ragserve command-line entry point.
//!
//! Subcommands cover the operational surface: database init, the HTTP
//! server, knowledge-base management, ingestion, direct retrieval, agent
//! chat, and flow-log analysis.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use ragserve::agent::{Agent, KnowledgeSearch};
use ragserve::config::{self, Config};
use ragserve::embedding::{Embedder, OllamaEmbedder};
use ragserve::flowlog::{analyzer::FlowAnalyzer, DetailLevel, FlowLogger};
use ragserve::ingest::IngestionPipeline;
use ragserve::kb::{KbDefaults, KbManager, KbPatch, KbSpec, QueryOverrides};
use ragserve::llm::{LlmProvider, OllamaChat};
use ragserve::metadata::MetadataStore;
use ragserve::models::RetrievalMode;
use ragserve::server;
use ragserve::vectorstore::{QdrantStore, VectorStore};

#[derive(Parser)]
#[command(
    name = "ragd",
    about = "ragserve — a locally-deployed retrieval-augmented generation service",
    version
)]
struct Cli {
    /// Path to configuration file
    #[arg(long, global = true, default_value = "./config/ragserve.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the metadata database schema
    Init,

    /// Start the HTTP server
    Serve,

    /// Manage knowledge bases
    Kb {
        #[command(subcommand)]
        command: KbCommands,
    },

    /// Ingest files or directories into a knowledge base
    Ingest {
        /// Knowledge base id
        kb: String,

        /// Files or directories to ingest
        paths: Vec<PathBuf>,

        /// Drop the collection and re-index everything
        #[arg(long)]
        force: bool,
    },

    /// Search a knowledge base directly
    Search {
        /// Knowledge base id
        kb: String,

        /// Search query
        query: String,

        /// Override mode: vector, fulltext, or hybrid
        #[arg(long)]
        mode: Option<String>,

        /// Override number of results
        #[arg(long)]
        top_k: Option<usize>,
    },

    /// Ask the agent a question
    Chat {
        /// The question
        query: String,

        /// Knowledge base id to ground the answer in
        #[arg(long)]
        kb: Option<String>,
    },

    /// Inspect the flow log
    Flow {
        #[command(subcommand)]
        command: FlowCommands,
    },
}

#[derive(Subcommand)]
enum KbCommands {
    /// Create a knowledge base
    Create {
        name: String,

        #[arg(long, default_value = "")]
        description: String,
    },

    /// List knowledge bases
    List {
        #[arg(long, default_value_t = 1)]
        page: u32,

        #[arg(long, default_value_t = 20)]
        size: u32,
    },

    /// Show one knowledge base
    Show { id: String },

    /// Rename a knowledge base
    Rename { id: String, name: String },

    /// Delete a knowledge base and its collection
    Delete { id: String },
}

#[derive(Subcommand)]
enum FlowCommands {
    /// Per-event-type timing statistics
    Stats,

    /// Events of one session in order
    Session { id: String },

    /// All error events
    Errors,

    /// Operations slower than a threshold
    Slow {
        #[arg(long, default_value_t = 1000)]
        threshold_ms: u64,
    },

    /// Export parsed events
    Export {
        /// Output format: json or csv
        #[arg(long, default_value = "json")]
        format: String,
    },
}

/// Everything the serve/chat/search paths share.
struct AppContext {
    manager: Arc<KbManager>,
    agent: Arc<Agent>,
    llm: Arc<dyn LlmProvider>,
    store: Arc<dyn VectorStore>,
    flow: Arc<FlowLogger>,
}

async fn build_context(config: &Config) -> Result<AppContext> {
    let metadata = MetadataStore::open(&config.db.path).await?;

    let embedder: Arc<dyn Embedder> = Arc::new(OllamaEmbedder::new(&config.embedding)?);
    let store: Arc<dyn VectorStore> = Arc::new(QdrantStore::new(&config.vector_store)?);
    let llm: Arc<dyn LlmProvider> = Arc::new(OllamaChat::new(&config.llm)?);

    let pipeline = IngestionPipeline::new(
        Arc::clone(&embedder),
        Arc::clone(&store),
        metadata.clone(),
        config.limits.max_file_size_bytes,
        config.limits.ingest_worker_pool,
    );

    let uploads_dir = config
        .db
        .path
        .parent()
        .map(|p| p.join("uploads"))
        .unwrap_or_else(|| PathBuf::from("data/uploads"));

    let manager = Arc::new(KbManager::new(
        metadata,
        Arc::clone(&store),
        Arc::clone(&embedder),
        pipeline,
        KbDefaults {
            embedding_model: config.embedding.model.clone(),
            embedding_dimension: config.embedding.dim,
            chunk_config: config.chunking.to_chunk_config(),
            retrieval_config: config.retrieval.to_retrieval_config(),
        },
        uploads_dir,
    ));

    let detail = DetailLevel::parse(&config.flow_log.detail_level)
        .context("invalid flow_log.detail_level")?;
    let flow = Arc::new(FlowLogger::start(&config.flow_log.path, detail)?);

    let agent = Arc::new(Agent::new(
        Arc::clone(&llm),
        Arc::clone(&manager) as Arc<dyn KnowledgeSearch>,
        Arc::clone(&flow),
        config.limits.max_query_length,
    ));

    Ok(AppContext {
        manager,
        agent,
        llm,
        store,
        flow,
    })
}

/// Expand directories into supported files; plain files pass through.
fn collect_ingest_paths(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut globs = globset::GlobSetBuilder::new();
    for pattern in ["*.txt", "*.md", "*.pdf", "*.docx"] {
        globs.add(globset::Glob::new(pattern)?);
    }
    let globs = globs.build()?;

    let mut out = Vec::new();
    for path in paths {
        if path.is_dir() {
            for entry in walkdir::WalkDir::new(path)
                .follow_links(false)
                .into_iter()
                .filter_map(|e| e.ok())
            {
                if entry.file_type().is_file()
                    && globs.is_match(entry.file_name().to_string_lossy().as_ref())
                {
                    out.push(entry.into_path());
                }
            }
        } else {
            out.push(path.clone());
        }
    }
    out.sort();
    Ok(out)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "ragserve=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            MetadataStore::open(&config.db.path).await?;
            println!("initialized {}", config.db.path.display());
        }

        Commands::Serve => {
            let context = build_context(&config).await?;
            let state = server::AppState {
                manager: context.manager,
                agent: context.agent,
                llm: context.llm,
                store: context.store,
            };
            server::run_server(&config.server.bind, state).await?;
        }

        Commands::Kb { command } => {
            let context = build_context(&config).await?;
            match command {
                KbCommands::Create { name, description } => {
                    let kb = context
                        .manager
                        .create_kb(KbSpec {
                            name,
                            description,
                            embedding_model: None,
                            embedding_dimension: None,
                            chunk_config: None,
                            retrieval_config: None,
                        })
                        .await?;
                    println!("created {} ({})", kb.name, kb.id);
                }
                KbCommands::List { page, size } => {
                    let (kbs, total) = context.manager.list_kbs(page, size).await?;
                    println!("{total} knowledge base(s)");
                    for kb in kbs {
                        println!(
                            "{}  {}  docs={} chunks={} dim={}",
                            kb.id, kb.name, kb.document_count, kb.chunk_count,
                            kb.embedding_dimension
                        );
                    }
                }
                KbCommands::Show { id } => {
                    let kb = context.manager.get_kb(&id).await?;
                    println!("{}", serde_json::to_string_pretty(&kb)?);
                }
                KbCommands::Rename { id, name } => {
                    let kb = context
                        .manager
                        .update_kb(
                            &id,
                            KbPatch {
                                name: Some(name),
                                ..KbPatch::default()
                            },
                        )
                        .await?;
                    println!("renamed to {}", kb.name);
                }
                KbCommands::Delete { id } => {
                    context.manager.delete_kb(&id).await?;
                    println!("deleted {id}");
                }
            }
        }

        Commands::Ingest { kb, paths, force } => {
            let context = build_context(&config).await?;
            let files = collect_ingest_paths(&paths)?;
            if files.is_empty() {
                println!("nothing to ingest");
                return Ok(());
            }

            let report = context.manager.ingest_paths(&kb, &files, force).await?;
            println!("ingest {kb}");
            println!("  documents loaded: {}", report.documents_loaded);
            println!("  chunks created:   {}", report.chunks_created);
            println!("  vectors uploaded: {}", report.vectors_uploaded);
            println!("  skipped files:    {}", report.skipped_files);
            println!("  failed files:     {}", report.failed_files.len());
            for error in &report.errors {
                println!("    {error}");
            }
            println!("  took {:.2}s", report.total_seconds);
        }

        Commands::Search {
            kb,
            query,
            mode,
            top_k,
        } => {
            let context = build_context(&config).await?;
            let mode = match mode.as_deref() {
                None => None,
                Some("vector") => Some(RetrievalMode::Vector),
                Some("fulltext") => Some(RetrievalMode::Fulltext),
                Some("hybrid") => Some(RetrievalMode::Hybrid),
                Some(other) => {
                    anyhow::bail!("unknown mode '{other}'; use vector, fulltext, or hybrid")
                }
            };

            let hits = context
                .manager
                .query(
                    &kb,
                    &query,
                    &QueryOverrides {
                        mode,
                        top_k,
                        similarity_threshold: None,
                    },
                )
                .await?;

            if hits.is_empty() {
                println!("No results.");
            }
            for (i, hit) in hits.iter().enumerate() {
                println!("{}. [{:.3}] {}", i + 1, hit.score, hit.source);
                println!("   {}", hit.content.replace('\n', " ").trim());
            }
        }

        Commands::Chat { query, kb } => {
            let context = build_context(&config).await?;
            let answer = context.agent.chat(&query, &[], kb.as_deref()).await;
            // Land the flow events on disk before the process exits.
            context.flow.flush().await;
            println!("{}", answer?);
        }

        Commands::Flow { command } => {
            let analyzer = FlowAnalyzer::from_file(&config.flow_log.path)
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            match command {
                FlowCommands::Stats => {
                    for (kind, stats) in analyzer.timing_stats() {
                        println!(
                            "{kind}: count={} avg={:.1}ms min={}ms max={}ms p95={}ms",
                            stats.count, stats.avg_ms, stats.min_ms, stats.max_ms, stats.p95_ms
                        );
                    }
                }
                FlowCommands::Session { id } => {
                    for event in analyzer.session(&id) {
                        println!(
                            "[+{:.3}s] {} {}",
                            event.elapsed_ms as f64 / 1000.0,
                            event.kind.as_str(),
                            event.status.as_str()
                        );
                    }
                }
                FlowCommands::Errors => {
                    for event in analyzer.errors() {
                        println!(
                            "{} {} (Session: {}): {}",
                            event.timestamp.format("%Y-%m-%d %H:%M:%S"),
                            event.kind.as_str(),
                            event.session_id,
                            event
                                .metadata
                                .get("error")
                                .and_then(|v| v.as_str())
                                .unwrap_or("-")
                        );
                    }
                }
                FlowCommands::Slow { threshold_ms } => {
                    for event in analyzer.slow_operations(threshold_ms) {
                        println!(
                            "{}ms {} (Session: {})",
                            event.duration_ms.unwrap_or(0),
                            event.kind.as_str(),
                            event.session_id
                        );
                    }
                }
                FlowCommands::Export { format } => match format.as_str() {
                    "json" => println!("{}", analyzer.export_json().map_err(|e| anyhow::anyhow!("{e}"))?),
                    "csv" => print!("{}", analyzer.export_csv()),
                    other => anyhow::bail!("unknown export format '{other}'; use json or csv"),
                },
            }
        }
    }

    Ok(())
}
