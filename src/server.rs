//! Newline-delimited JSON-RPC 2.0 over stdio (MCP-style): `initialize`,
//! `tools/list`, `tools/call`. A single tool, `semantic_search`, is exposed;
//! everything else in this module negotiates the workspace root and
//! translates between the external tool schema and the internal engine.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use crate::chunker::GrammarCache;
use crate::config::Config;
use crate::embedder::Embedder;
use crate::error::{ErrorKind, SemanticSearchError};
use crate::index_manager::IndexManager;
use crate::reranker::CrossEncoder;
use crate::retrieval::{self, HybridSearchOptions};
use crate::store::VectorStore;

const TOOL_NAME: &str = "semantic_search";
const ROOT_ENV_VAR: &str = "SEMANTIC_CODE_ROOT";

/// Everything a running query needs for one resolved workspace root. Built
/// once, lazily, on the first tool call.
pub struct Engine {
    index_manager: IndexManager,
    embedder: Arc<Embedder>,
    // No concrete cross-encoder model facade ships with this crate (the reranking
    // model is an opaque external collaborator) — always `None` today, but held
    // here, not hardcoded at the call site, so a real encoder can be plugged in
    // without touching the request path.
    reranker: Option<Arc<dyn CrossEncoder>>,
    config: Config,
}

impl Engine {
    pub async fn new(repo_root: &Path, config: Config) -> Result<Self, SemanticSearchError> {
        let index_dir = repo_root.join(&config.index.index_dir);
        let store = Arc::new(VectorStore::open(&index_dir).await?);
        let embedder = Arc::new(Embedder::new(
            config.index.model.clone(),
            config.index.model_cache_dir.clone(),
        ));
        let grammar_cache = Arc::new(GrammarCache::new(config.cache.grammar_cache_capacity.max(1)));

        let index_manager = IndexManager::with_query_cache(
            repo_root.to_path_buf(),
            config.index.scan_exclude_dir_names(),
            crate::config::ABSOLUTE_MAX_FILE_BYTES,
            store,
            embedder.clone(),
            grammar_cache,
            config.cache.query_embedding_cache_capacity,
            config.cache.query_embedding_cache_ttl_seconds,
        );

        Ok(Engine {
            index_manager,
            embedder,
            reranker: None,
            config,
        })
    }

    pub async fn search(
        &self,
        query: &str,
        options: HybridSearchOptions,
    ) -> Result<retrieval::HybridSearchResult, SemanticSearchError> {
        self.index_manager.ensure_initialized().await?;
        let store = self.index_manager.store();
        let reranker = self.reranker.as_deref();
        retrieval::hybrid_search(query, &options, &store, &self.embedder, reranker, &self.index_manager).await
    }

    pub async fn index_stats(&self) -> (usize, bool) {
        (self.index_manager.count().await, true)
    }

    pub async fn shutdown(&self) -> Result<(), SemanticSearchError> {
        self.index_manager.shutdown().await
    }

    pub fn default_retrieval_options(&self) -> HybridSearchOptions {
        HybridSearchOptions {
            limit: self.config.retrieval.default_limit,
            candidate_multiplier: self.config.retrieval.candidate_multiplier,
            use_reranking: self.config.retrieval.use_reranking,
            ..Default::default()
        }
    }
}

/// Returns `true` for "useless" roots that indicate the server started with the
/// wrong cwd (usually $HOME or filesystem root on any OS).
fn is_dead_root(p: &Path) -> bool {
    if p.parent().is_none() {
        return true;
    }
    if p.components().count() <= 1 {
        return true;
    }
    if let Ok(home) = std::env::var("HOME").or_else(|_| std::env::var("USERPROFILE")) {
        if !home.trim().is_empty() && p == Path::new(home.trim()) {
            return true;
        }
    }
    false
}

fn extract_path_from_uri(uri: &str) -> Option<PathBuf> {
    let rest = uri.strip_prefix("file://").unwrap_or(uri);
    // `file:///C:/foo` strips to `/C:/foo` — drop the leading slash in front of
    // a Windows drive letter.
    let rest = if rest.starts_with('/')
        && rest.len() >= 3
        && rest.as_bytes()[1].is_ascii_alphabetic()
        && rest.as_bytes()[2] == b':'
    {
        &rest[1..]
    } else {
        rest
    };
    let s = rest.trim_end_matches('/');
    if s.is_empty() {
        None
    } else {
        Some(PathBuf::from(s))
    }
}

/// Holds the negotiated workspace root and the lazily-constructed [`Engine`].
pub struct ServerState {
    repo_root: Option<PathBuf>,
    root_locked: bool,
    engine: AsyncMutex<Option<Arc<Engine>>>,
}

impl ServerState {
    pub fn new(cli_root: Option<PathBuf>) -> Self {
        let root_locked = cli_root.is_some();
        ServerState {
            repo_root: cli_root,
            root_locked,
            engine: AsyncMutex::new(None),
        }
    }

    /// Called when an `initialize` request arrives. A `--root` CLI flag outranks
    /// whatever the editor sends; otherwise the protocol's root is authoritative.
    fn capture_init_root(&mut self, params: &Value) {
        if self.root_locked {
            return;
        }
        let raw = params
            .get("workspaceFolders")
            .and_then(|f| f.as_array())
            .and_then(|a| a.first())
            .and_then(|f| f.get("uri").or_else(|| f.get("path")))
            .and_then(|v| v.as_str())
            .or_else(|| {
                params
                    .get("rootUri")
                    .or_else(|| params.get("rootPath"))
                    .and_then(|v| v.as_str())
            });
        if let Some(root) = raw.and_then(extract_path_from_uri) {
            self.repo_root = Some(root);
        }
    }

    /// Env var / IDE env var / find-up / cwd cascade, used only when neither a
    /// CLI flag nor `initialize` supplied a root.
    fn resolve_fallback_root(&self) -> Result<PathBuf, String> {
        let home = std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_default();

        let env_root = std::env::var(ROOT_ENV_VAR)
            .ok()
            .or_else(|| std::env::var("VSCODE_WORKSPACE_FOLDER").ok())
            .or_else(|| std::env::var("VSCODE_CWD").ok())
            .or_else(|| std::env::var("IDEA_INITIAL_DIRECTORY").ok())
            .or_else(|| std::env::var("PWD").ok().filter(|v| v.trim() != home.trim()))
            .or_else(|| std::env::var("INIT_CWD").ok().filter(|v| v.trim() != home.trim()))
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);
        if let Some(root) = env_root {
            return Ok(root);
        }

        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        let mut current = cwd.clone();
        while let Some(parent) = current.parent() {
            if parent.join(".git").exists() || parent.join("Cargo.toml").exists() || parent.join("package.json").exists() {
                return Ok(parent.to_path_buf());
            }
            current = parent.to_path_buf();
        }

        if is_dead_root(&cwd) {
            return Err(format!(
                "workspace root resolved to '{}' (home or filesystem root); refusing to index it — pass --root explicitly",
                cwd.display()
            ));
        }
        Ok(cwd)
    }

    async fn ensure_engine(&mut self) -> Result<Arc<Engine>, SemanticSearchError> {
        {
            let guard = self.engine.lock().await;
            if let Some(engine) = guard.as_ref() {
                return Ok(engine.clone());
            }
        }

        let root = match &self.repo_root {
            Some(r) => r.clone(),
            None => {
                let resolved = self
                    .resolve_fallback_root()
                    .map_err(|reason| SemanticSearchError::StoreFatal { reason })?;
                self.repo_root = Some(resolved.clone());
                resolved
            }
        };

        let config = crate::config::load_config(&root);
        let engine = Arc::new(Engine::new(&root, config).await?);
        *self.engine.lock().await = Some(engine.clone());
        Ok(engine)
    }

    fn tool_list(&self, id: Value) -> Value {
        json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": {
                "tools": [{
                    "name": TOOL_NAME,
                    "description": "Semantic code search: given a natural-language query, returns ranked code regions (functions, classes, methods) whose meaning matches the query.",
                    "inputSchema": {
                        "type": "object",
                        "properties": {
                            "query": { "type": "string", "description": "Natural-language search query." },
                            "path": { "type": "string", "description": "Optional path prefix to restrict results to." },
                            "limit": { "type": "integer", "description": "Maximum number of results (default 10, capped at 50)." },
                            "file_pattern": { "type": "string", "description": "Optional glob (e.g. '*.rs') to restrict results to." }
                        },
                        "required": ["query"]
                    }
                }]
            }
        })
    }

    async fn tool_call(&mut self, id: Value, params: &Value) -> Value {
        let name = params.get("name").and_then(|v| v.as_str()).unwrap_or("");
        if name != TOOL_NAME {
            return json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": { "code": -32602, "message": format!("unknown tool '{name}'") }
            });
        }

        let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));
        let Some(query) = arguments.get("query").and_then(|v| v.as_str()) else {
            return json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": { "code": -32602, "message": "missing required field 'query'" }
            });
        };

        let engine = match self.ensure_engine().await {
            Ok(engine) => engine,
            Err(e) => return error_response(id, &e),
        };

        let mut options = engine.default_retrieval_options();
        if let Some(limit) = arguments.get("limit").and_then(|v| v.as_u64()) {
            options.limit = limit as usize;
        }
        options.path = arguments.get("path").and_then(|v| v.as_str()).map(str::to_string);
        options.file_pattern = arguments
            .get("file_pattern")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        match engine.search(query, options).await {
            Ok(result) => {
                let (total_chunks, indexed) = engine.index_stats().await;
                let results: Vec<Value> = result
                    .results
                    .iter()
                    .map(|r| {
                        json!({
                            "file": r.record.file_path,
                            "start_line": r.record.start_line,
                            "end_line": r.record.end_line,
                            "name": r.record.name,
                            "node_type": r.record.node_kind,
                            "score": r.combined_score,
                            "content": r.record.content,
                            "signature": r.record.signature,
                        })
                    })
                    .collect();
                let payload = json!({
                    "results": results,
                    "total_results": result.total_results,
                    "query": query,
                    "index_stats": { "total_chunks": total_chunks, "indexed": indexed },
                });
                json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": {
                        "content": [{ "type": "text", "text": payload.to_string() }],
                        "isError": false,
                    }
                })
            }
            Err(e) => error_response(id, &e),
        }
    }
}

fn error_code_for_kind(kind: ErrorKind) -> i64 {
    match kind {
        ErrorKind::PathTraversal | ErrorKind::InvalidFilter | ErrorKind::InvalidId => -32602,
        ErrorKind::ModelLoadFailure | ErrorKind::EmbeddingGenerationFailure => -32000,
        ErrorKind::StoreTransient | ErrorKind::StoreFatal => -32001,
        ErrorKind::ChunkerFailure => -32002,
    }
}

fn error_response(id: Value, err: &SemanticSearchError) -> Value {
    let kind = err.kind();
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {
            "code": error_code_for_kind(kind),
            "message": err.to_string(),
            "data": { "kind": kind.as_str() }
        }
    })
}

/// Run the stdio JSON-RPC loop until stdin closes.
pub async fn run_stdio_server(startup_root: Option<PathBuf>) -> anyhow::Result<()> {
    let stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();
    let mut reader = BufReader::new(stdin).lines();

    let mut state = ServerState::new(startup_root);

    while let Some(line) = reader.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let msg: Value = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(_) => continue,
        };

        // JSON-RPC notifications carry no "id" — there is nothing to reply to.
        let Some(id) = msg.get("id").cloned() else {
            continue;
        };
        let method = msg.get("method").and_then(|m| m.as_str()).unwrap_or("");

        let reply = match method {
            "initialize" => {
                if let Some(params) = msg.get("params") {
                    state.capture_init_root(params);
                }
                json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": {
                        "protocolVersion": msg.get("params").and_then(|p| p.get("protocolVersion")).cloned().unwrap_or(json!("2024-11-05")),
                        "capabilities": { "tools": { "listChanged": false } },
                        "serverInfo": { "name": "semantic-code-search", "version": env!("CARGO_PKG_VERSION") }
                    }
                })
            }
            "ping" => json!({ "jsonrpc": "2.0", "id": id, "result": {} }),
            "tools/list" => state.tool_list(id),
            "tools/call" => {
                let params = msg.get("params").cloned().unwrap_or_else(|| json!({}));
                state.tool_call(id, &params).await
            }
            "resources/list" => json!({ "jsonrpc": "2.0", "id": id, "result": { "resources": [] } }),
            "prompts/list" => json!({ "jsonrpc": "2.0", "id": id, "result": { "prompts": [] } }),
            _ => json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": { "code": -32601, "message": format!("method not found: {method}") }
            }),
        };

        let line_out = format!("{reply}\n");
        stdout.write_all(line_out.as_bytes()).await?;
        stdout.flush().await?;
    }

    let existing_engine = state.engine.lock().await.clone();
    if let Some(engine) = existing_engine {
        if let Err(e) = engine.shutdown().await {
            warn!(component = "server", error = %e, "error during engine shutdown");
        }
    }
    info!(component = "server", "stdio server exiting");
    Ok(())
}
