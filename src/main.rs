//! # Knowledge Harness CLI (`kh`)
//!
//! ## Usage
//!
//! ```bash
//! kh --config ./config/kh.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `kh init` | Create the database, schema and storage directories |
//! | `kh add <paths...>` | Upload files (directories are walked) and process them |
//! | `kh note <title>` | Store a text note (from `--text` or stdin) |
//! | `kh status <id>` | Show status, metadata and tags of a file |
//! | `kh retry <id>` | Retry a file in `error` |
//! | `kh reanalyze <id>` | Drop AI metadata and classify again |
//! | `kh delete <id>` | Delete a file everywhere |
//! | `kh tag add\|remove <id> <tag>` | Manage manual tags |
//! | `kh search "<query>"` | Hybrid search |
//! | `kh reindex` | Rebuild every vector from stored text |
//! | `kh serve` | Start the HTTP API |
//!
//! Logging goes to stderr through `tracing`; set `RUST_LOG` to adjust
//! (default `knowledge_harness=info`).

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

use knowledge_harness::config::{self, Config};
use knowledge_harness::harness::Harness;
use knowledge_harness::ingest::AddOutcome;
use knowledge_harness::models::{FileStatus, FileType};
use knowledge_harness::search::SearchOptions;
use knowledge_harness::{db, migrate, server};

/// Knowledge Harness: ingestion pipeline and hybrid retrieval for a
/// personal knowledge store.
#[derive(Parser)]
#[command(name = "kh", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/kh.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema and storage directories.
    ///
    /// Idempotent; running it again is safe.
    Init,

    /// Upload files and wait for them to be processed.
    Add {
        /// Files or directories (walked recursively).
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Return after uploading; processing resumes on the next start.
        #[arg(long)]
        no_wait: bool,
    },

    /// Store a text note as a Markdown file.
    Note {
        title: String,

        /// Note text. Read from stdin when omitted.
        #[arg(long)]
        text: Option<String>,
    },

    /// Show status, metadata and tags of a file.
    Status { id: String },

    /// Retry a file that ended in `error`.
    Retry { id: String },

    /// Drop AI metadata and tags and classify the file again.
    Reanalyze { id: String },

    /// Delete a file, its metadata, its vectors and its stored bytes.
    Delete { id: String },

    /// Manage manual tags.
    Tag {
        #[command(subcommand)]
        action: TagAction,
    },

    /// Search complete files.
    Search {
        query: String,

        /// Only files of this type (pdf, image, video, audio, code, text, other).
        #[arg(long = "type")]
        file_type: Option<String>,

        #[arg(long)]
        category: Option<String>,

        /// Skip the semantic leg.
        #[arg(long)]
        keyword_only: bool,

        /// Maximum number of results.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Rebuild every vector from stored text.
    Reindex,

    /// Start the HTTP API on `[server].bind`.
    Serve,
}

#[derive(Subcommand)]
enum TagAction {
    Add { id: String, tag: String },
    Remove { id: String, tag: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("knowledge_harness=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => run_init(&cfg).await,
        Commands::Serve => {
            let harness = Arc::new(Harness::open(cfg).await?);
            server::run_server(harness).await
        }
        command => {
            let harness = Harness::open(cfg).await?;
            let result = run_command(&harness, command).await;
            harness.close().await;
            result
        }
    }
}

async fn run_init(cfg: &Config) -> Result<()> {
    let pool = db::connect(cfg).await?;
    migrate::run_migrations(&pool).await?;
    pool.close().await;
    std::fs::create_dir_all(cfg.storage.files_dir())?;
    std::fs::create_dir_all(cfg.storage.tmp_dir())?;
    println!("Database initialized successfully.");
    println!("  db: {}", cfg.db.path.display());
    println!("  storage: {}", cfg.storage.root.display());
    Ok(())
}

async fn run_command(harness: &Harness, command: Commands) -> Result<()> {
    match command {
        Commands::Add { paths, no_wait } => run_add(harness, &paths, no_wait).await,
        Commands::Note { title, text } => {
            let text = match text {
                Some(t) => t,
                None => {
                    let mut buf = String::new();
                    std::io::stdin().read_to_string(&mut buf)?;
                    buf
                }
            };
            if text.trim().is_empty() {
                bail!("note text must not be empty");
            }
            let outcome = harness.add_text(&title, &text).await?;
            print_outcome(&outcome);
            if !outcome.duplicate {
                harness.wait_idle().await;
                print_status(harness, &outcome.file.id).await?;
            }
            Ok(())
        }
        Commands::Status { id } => print_status(harness, &id).await,
        Commands::Retry { id } => {
            if !harness.retry(&id).await? {
                bail!("{} is not in error status (or does not exist)", id);
            }
            harness.wait_idle().await;
            print_status(harness, &id).await
        }
        Commands::Reanalyze { id } => {
            if !harness.reanalyze(&id).await? {
                bail!("file not found: {}", id);
            }
            harness.wait_idle().await;
            print_status(harness, &id).await
        }
        Commands::Delete { id } => {
            if !harness.delete(&id).await? {
                bail!("file not found: {}", id);
            }
            println!("deleted {}", id);
            Ok(())
        }
        Commands::Tag { action } => match action {
            TagAction::Add { id, tag } => {
                if !harness.add_tag(&id, &tag).await? {
                    bail!("file not found: {}", id);
                }
                println!("tagged {} with '{}'", id, tag.trim().to_lowercase());
                Ok(())
            }
            TagAction::Remove { id, tag } => {
                if !harness.remove_tag(&id, &tag).await? {
                    bail!("manual tag '{}' not found on {}", tag, id);
                }
                println!("removed '{}' from {}", tag, id);
                Ok(())
            }
        },
        Commands::Search {
            query,
            file_type,
            category,
            keyword_only,
            limit,
        } => {
            let opts = SearchOptions {
                file_type: file_type.as_deref().map(str::parse::<FileType>).transpose()?,
                category,
                semantic: !keyword_only,
                top_n: limit,
            };
            run_search(harness, &query, &opts).await
        }
        Commands::Reindex => {
            let report = harness.reindex().await?;
            println!("reindex");
            println!("  files: {}", report.files_total);
            println!("  indexed: {}", report.files_indexed);
            println!("  skipped: {}", report.files_skipped);
            println!("  failed: {}", report.files_failed);
            println!("  chunks: {}", report.chunks_indexed);
            Ok(())
        }
        Commands::Init | Commands::Serve => unreachable!("handled before the harness opens"),
    }
}

async fn run_add(harness: &Harness, paths: &[PathBuf], no_wait: bool) -> Result<()> {
    let mut added = Vec::new();
    let mut duplicates = 0usize;
    let mut failed = 0usize;

    for root in paths {
        for entry in WalkDir::new(root).follow_links(true) {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    eprintln!("Warning: {}", e);
                    failed += 1;
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            match harness.add_path(entry.path()).await {
                Ok(outcome) => {
                    print_outcome(&outcome);
                    if outcome.duplicate {
                        duplicates += 1;
                    } else {
                        added.push(outcome.file.id);
                    }
                }
                Err(e) => {
                    eprintln!("Warning: {}: {:#}", entry.path().display(), e);
                    failed += 1;
                }
            }
        }
    }

    if !no_wait && !added.is_empty() {
        harness.wait_idle().await;
    }

    let mut complete = 0usize;
    let mut errored = 0usize;
    for id in &added {
        if let Some(view) = harness.status(id).await? {
            match view.status {
                FileStatus::Complete => complete += 1,
                FileStatus::Error => errored += 1,
                _ => {}
            }
            if let Some(msg) = view.error_message {
                eprintln!("  {} [{}] {}", id, view.status, msg);
            }
        }
    }

    println!("add");
    println!("  added: {}", added.len());
    println!("  duplicates: {}", duplicates);
    println!("  failed: {}", failed);
    if !no_wait {
        println!("  complete: {}", complete);
        println!("  error: {}", errored);
    }
    Ok(())
}

fn print_outcome(outcome: &AddOutcome) {
    let label = if outcome.duplicate { "duplicate" } else { "added" };
    println!(
        "{} {} ({}, {})",
        label, outcome.file.id, outcome.file.filename, outcome.file.file_type
    );
}

async fn print_status(harness: &Harness, id: &str) -> Result<()> {
    let Some(file) = harness.store().get_file(id).await? else {
        bail!("file not found: {}", id);
    };

    println!("--- File ---");
    println!("id:           {}", file.id);
    println!("filename:     {}", file.filename);
    println!("type:         {}", file.file_type);
    println!("mime:         {}", file.mime_type);
    println!("size:         {}", file.size_bytes);
    println!("status:       {}", file.status);
    println!("retries:      {}", file.retry_count);
    if let Some(err) = &file.error_message {
        println!("error:        {}", err);
    }

    if let Some(meta) = harness.store().get_metadata(id).await? {
        let processed = chrono::DateTime::from_timestamp(meta.processed_at, 0)
            .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_default();
        println!();
        println!("--- Metadata ---");
        println!("title:        {}", meta.title);
        println!("category:     {}", meta.category);
        println!("words:        {}", meta.word_count);
        if let Some(lang) = &meta.language {
            println!("language:     {}", lang);
        }
        println!("processed:    {}", processed);
        if !meta.summary.is_empty() {
            println!("summary:      {}", meta.summary);
        }
    }

    let tags = harness.store().get_tags(id).await?;
    if !tags.is_empty() {
        let rendered: Vec<String> = tags
            .iter()
            .map(|t| format!("{} ({})", t.tag, t.source.as_str()))
            .collect();
        println!("tags:         {}", rendered.join(", "));
    }
    Ok(())
}

async fn run_search(harness: &Harness, query: &str, opts: &SearchOptions) -> Result<()> {
    let response = harness.search(query, opts).await?;

    if response.results.is_empty() {
        println!("No results.");
        return Ok(());
    }
    if opts.semantic && !response.semantic_used {
        eprintln!("Note: semantic search unavailable, showing keyword matches only.");
    }

    for (i, hit) in response.results.iter().enumerate() {
        println!(
            "{}. [{:.2}] {} / {}",
            i + 1,
            hit.hybrid_score,
            hit.category,
            hit.title
        );
        println!("    file: {} ({})", hit.filename, hit.file_type);
        let kw = hit.keyword_score.map(|s| format!("{:.2}", s));
        let sem = hit.semantic_score.map(|s| format!("{:.2}", s));
        println!(
            "    keyword: {}  semantic: {}",
            kw.as_deref().unwrap_or("-"),
            sem.as_deref().unwrap_or("-")
        );
        if !hit.tags.is_empty() {
            println!("    tags: {}", hit.tags.join(", "));
        }
        if let Some(excerpt) = hit.snippet.as_ref().or(hit.semantic_snippet.as_ref()) {
            let excerpt: String = excerpt.replace('\n', " ").chars().take(200).collect();
            println!("    excerpt: \"{}\"", excerpt.trim());
        }
        println!("    id: {}", hit.file_id);
        println!();
    }
    Ok(())
}
