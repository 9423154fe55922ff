use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};

use semantic_code_search::chunker::GrammarCache;
use semantic_code_search::config::{load_config, Config, ABSOLUTE_MAX_FILE_BYTES};
use semantic_code_search::embedder::Embedder;
use semantic_code_search::index_manager::IndexManager;
use semantic_code_search::logging;
use semantic_code_search::retrieval::{self, HybridSearchOptions};
use semantic_code_search::server::run_stdio_server;
use semantic_code_search::store::VectorStore;

#[derive(Debug, Parser)]
#[command(name = "semantic-code-search")]
#[command(version)]
#[command(about = "Semantic code search over a local workspace (MCP stdio server + one-shot CLI search)")]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the stdio JSON-RPC tool server (the primary, long-running mode).
    Serve {
        /// Workspace root to index. Overrides every other root-resolution source.
        #[arg(long, value_name = "PATH")]
        root: Option<PathBuf>,

        /// Log level (`error`, `warn`, `info`, `debug`, `trace`, or an EnvFilter directive).
        #[arg(long, value_name = "LEVEL")]
        log_level: Option<String>,

        /// Log format: `text` or `json`.
        #[arg(long, value_name = "FORMAT")]
        log_format: Option<String>,
    },
    /// One-shot local search for smoke-testing; prints formatted results to stdout.
    Query {
        /// Natural-language search query.
        text: String,

        /// Workspace root to search. Defaults to the current directory.
        #[arg(long, value_name = "PATH")]
        root: Option<PathBuf>,

        /// Maximum number of results.
        #[arg(long, default_value_t = retrieval::DEFAULT_LIMIT)]
        limit: usize,

        /// Restrict results to paths under this prefix.
        #[arg(long, value_name = "PREFIX")]
        path: Option<String>,

        /// Restrict results to files matching this glob (e.g. `*.rs`).
        #[arg(long, value_name = "GLOB")]
        file_pattern: Option<String>,
    },
}

fn spinner(message: &str) -> ProgressBar {
    let bar = ProgressBar::new_spinner();
    bar.set_style(
        ProgressStyle::with_template("{spinner} {msg}")
            .unwrap()
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    bar.enable_steady_tick(Duration::from_millis(80));
    bar.set_message(message.to_string());
    bar
}

fn resolve_query_root(root: Option<PathBuf>) -> Result<PathBuf> {
    let root = root
        .or_else(|| std::env::var("SEMANTIC_CODE_ROOT").ok().map(PathBuf::from))
        .map(Ok)
        .unwrap_or_else(|| std::env::current_dir().context("failed to get current directory"))?;
    Ok(root)
}

/// Best-effort config lookup for logging setup, which must happen before the
/// server's own (possibly lazy) root resolution runs. An explicit `--root`
/// flag is used as-is; otherwise we guess the cwd, matching where a config
/// file would realistically sit for an editor-launched server.
fn preload_server_config(root: &Option<PathBuf>) -> Config {
    let guess = root
        .clone()
        .or_else(|| std::env::var("SEMANTIC_CODE_ROOT").ok().map(PathBuf::from))
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."));
    load_config(&guess)
}

fn run_query(text: String, root: Option<PathBuf>, limit: usize, path: Option<String>, file_pattern: Option<String>) -> Result<()> {
    let repo_root = resolve_query_root(root)?;
    let config = load_config(&repo_root);

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        let index_dir = repo_root.join(&config.index.index_dir);
        let store = std::sync::Arc::new(VectorStore::open(&index_dir).await?);
        let embedder = std::sync::Arc::new(Embedder::new(
            config.index.model.clone(),
            config.index.model_cache_dir.clone(),
        ));
        let grammar_cache = std::sync::Arc::new(GrammarCache::new(config.cache.grammar_cache_capacity.max(1)));
        let manager = IndexManager::with_query_cache(
            repo_root.clone(),
            config.index.scan_exclude_dir_names(),
            ABSOLUTE_MAX_FILE_BYTES,
            store.clone(),
            embedder.clone(),
            grammar_cache,
            config.cache.query_embedding_cache_capacity,
            config.cache.query_embedding_cache_ttl_seconds,
        );

        let index_spinner = spinner("indexing workspace...");
        manager.ensure_initialized().await?;
        index_spinner.finish_with_message(format!("indexed {} chunks", manager.count().await));

        let options = HybridSearchOptions {
            limit,
            path,
            file_pattern,
            use_reranking: config.retrieval.use_reranking,
            candidate_multiplier: config.retrieval.candidate_multiplier,
            ..Default::default()
        };

        let result = manager.store();
        let search_spinner = spinner("searching...");
        let outcome = retrieval::hybrid_search(&text, &options, &result, &embedder, None, &manager).await;
        search_spinner.finish_and_clear();

        match outcome {
            Ok(outcome) => {
                if outcome.results.is_empty() {
                    println!("No results for \"{text}\".");
                } else {
                    for (i, r) in outcome.results.iter().enumerate() {
                        let name = r.record.name.as_deref().unwrap_or("<anonymous>");
                        println!(
                            "{}. {}:{}-{}  {} `{}`  score={:.3}",
                            i + 1,
                            r.record.file_path,
                            r.record.start_line,
                            r.record.end_line,
                            r.record.node_kind,
                            name,
                            r.combined_score
                        );
                        if let Some(sig) = &r.record.signature {
                            println!("   {sig}");
                        }
                    }
                    if outcome.used_fallback {
                        eprintln!("(keyword fallback used — embedder unavailable)");
                    }
                }
            }
            Err(e) => {
                eprintln!("search failed: {e}");
            }
        }

        manager.shutdown().await?;
        Ok::<(), anyhow::Error>(())
    })
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.cmd {
        Command::Serve {
            root,
            log_level,
            log_format,
        } => {
            let server_config = preload_server_config(&root);
            let format: logging::LogFormat = log_format
                .as_deref()
                .and_then(|f| f.parse().ok())
                .unwrap_or_else(|| server_config.server.parsed_log_format());
            let level = log_level.unwrap_or(server_config.server.log_level);
            logging::init(&level, format);

            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(run_stdio_server(root))
        }
        Command::Query {
            text,
            root,
            limit,
            path,
            file_pattern,
        } => run_query(text, root, limit, path, file_pattern),
    }
}
