//! Index manager: keeps the vector store consistent with a mutating file tree.
//! Owns the initial scan, per-file content hashing, the live file-system watcher,
//! and per-path write serialization. Lazily initialized on first query.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, Mutex as AsyncMutex, RwLock as AsyncRwLock, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use crate::cache::TtlLruCache;
use crate::chunker::{self, GrammarCache};
use crate::embedder::Embedder;
use crate::error::{Result, SemanticSearchError};
use crate::pathutil::{is_within_root, normalize_path};
use crate::scanner::{self, ScanOptions};
use crate::store::{content_hash_hex, Record, VectorStore};

/// Bounded worker count for concurrent per-file ingestion during a scan.
const SCAN_WORKER_COUNT: usize = 4;
/// Debounce window for coalescing editor save-storms on a single path.
const WATCH_DEBOUNCE: Duration = Duration::from_millis(1000);

/// Mutable counters surfaced through logs and `index_stats`.
#[derive(Debug, Clone, Default)]
pub struct IndexingMetrics {
    pub files_scanned: usize,
    pub files_skipped: usize,
    pub files_errored: usize,
    pub chunks_produced: usize,
    pub scan_duration: Duration,
    pub last_query_latency: Option<Duration>,
    pub last_query_result_count: Option<usize>,
    pub last_query_fallback_used: Option<bool>,
}

struct Inner {
    repo_root: PathBuf,
    exclude_dir_names: Vec<String>,
    max_file_bytes: u64,
    store: Arc<VectorStore>,
    embedder: Arc<Embedder>,
    grammar_cache: Arc<GrammarCache>,
    query_cache: StdMutex<TtlLruCache<String, Vec<f32>>>,
    file_state: AsyncRwLock<HashMap<String, String>>,
    path_locks: StdMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    metrics: StdMutex<IndexingMetrics>,
    initialized: AtomicBool,
    init_lock: AsyncMutex<()>,
    watch_generation: StdMutex<HashMap<PathBuf, u64>>,
    watcher_tasks: StdMutex<Vec<tokio::task::JoinHandle<()>>>,
    shutting_down: AtomicBool,
    _watcher_handle: StdMutex<Option<RecommendedWatcher>>,
    pending_ops: AtomicUsize,
}

/// Cheaply cloneable handle to the index; every clone shares the same state.
#[derive(Clone)]
pub struct IndexManager {
    inner: Arc<Inner>,
}

impl IndexManager {
    pub fn new(
        repo_root: PathBuf,
        exclude_dir_names: Vec<String>,
        max_file_bytes: u64,
        store: Arc<VectorStore>,
        embedder: Arc<Embedder>,
        grammar_cache: Arc<GrammarCache>,
    ) -> Self {
        Self::with_query_cache(
            repo_root,
            exclude_dir_names,
            max_file_bytes,
            store,
            embedder,
            grammar_cache,
            256,
            300,
        )
    }

    /// Same as [`IndexManager::new`], with explicit capacity/TTL for the
    /// query-embedding cache instead of the built-in defaults.
    #[allow(clippy::too_many_arguments)]
    pub fn with_query_cache(
        repo_root: PathBuf,
        exclude_dir_names: Vec<String>,
        max_file_bytes: u64,
        store: Arc<VectorStore>,
        embedder: Arc<Embedder>,
        grammar_cache: Arc<GrammarCache>,
        query_cache_capacity: usize,
        query_cache_ttl_seconds: u64,
    ) -> Self {
        let ttl = if query_cache_ttl_seconds == 0 {
            None
        } else {
            Some(Duration::from_secs(query_cache_ttl_seconds))
        };
        IndexManager {
            inner: Arc::new(Inner {
                repo_root,
                exclude_dir_names,
                max_file_bytes,
                store,
                embedder,
                grammar_cache,
                query_cache: StdMutex::new(TtlLruCache::new(query_cache_capacity.max(1), ttl)),
                file_state: AsyncRwLock::new(HashMap::new()),
                path_locks: StdMutex::new(HashMap::new()),
                metrics: StdMutex::new(IndexingMetrics::default()),
                initialized: AtomicBool::new(false),
                init_lock: AsyncMutex::new(()),
                watch_generation: StdMutex::new(HashMap::new()),
                watcher_tasks: StdMutex::new(Vec::new()),
                shutting_down: AtomicBool::new(false),
                _watcher_handle: StdMutex::new(None),
                pending_ops: AtomicUsize::new(0),
            }),
        }
    }

    pub fn metrics_snapshot(&self) -> IndexingMetrics {
        self.inner.metrics.lock().expect("metrics lock poisoned").clone()
    }

    pub fn record_query(&self, latency: Duration, result_count: usize, fallback_used: bool) {
        let mut metrics = self.inner.metrics.lock().expect("metrics lock poisoned");
        metrics.last_query_latency = Some(latency);
        metrics.last_query_result_count = Some(result_count);
        metrics.last_query_fallback_used = Some(fallback_used);
    }

    /// Recent-query embedding cache, purely a performance aid: a miss costs an
    /// extra embedder call, never correctness.
    pub fn cached_query_embedding(&self, query: &str) -> Option<Vec<f32>> {
        self.inner
            .query_cache
            .lock()
            .expect("query cache lock poisoned")
            .get(&query.to_string())
            .cloned()
    }

    pub fn cache_query_embedding(&self, query: &str, vector: Vec<f32>) {
        self.inner
            .query_cache
            .lock()
            .expect("query cache lock poisoned")
            .put(query.to_string(), vector);
    }

    pub async fn count(&self) -> usize {
        self.inner.store.count().await
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.store.is_empty().await
    }

    pub fn store(&self) -> Arc<VectorStore> {
        self.inner.store.clone()
    }

    /// Build the index on first call (scan + start the live watcher); a no-op on
    /// every subsequent call.
    pub async fn ensure_initialized(&self) -> Result<()> {
        if self.inner.initialized.load(Ordering::Acquire) {
            return Ok(());
        }
        let _guard = self.inner.init_lock.lock().await;
        if self.inner.initialized.load(Ordering::Acquire) {
            return Ok(());
        }

        self.hydrate_file_state().await;
        self.initial_scan().await?;
        self.start_watcher();
        self.inner.initialized.store(true, Ordering::Release);
        Ok(())
    }

    async fn hydrate_file_state(&self) {
        let indexed = self.inner.store.indexed_files().await;
        let mut state = self.inner.file_state.write().await;
        *state = indexed;
    }

    async fn initial_scan(&self) -> Result<()> {
        let started = Instant::now();
        let opts = ScanOptions {
            repo_root: self.inner.repo_root.clone(),
            target: self.inner.repo_root.clone(),
            max_file_bytes: self.inner.max_file_bytes,
            exclude_dir_names: self.inner.exclude_dir_names.clone(),
        };
        let entries = scanner::scan_workspace(&opts).map_err(|e| SemanticSearchError::StoreFatal {
            reason: format!("initial scan failed: {e}"),
        })?;

        let semaphore = Arc::new(Semaphore::new(SCAN_WORKER_COUNT));
        let mut tasks = JoinSet::new();
        for entry in entries {
            let permit = semaphore.clone();
            let this = self.clone();
            tasks.spawn(async move {
                let _permit = permit.acquire_owned().await.expect("semaphore not closed");
                this.process_scanned_file(entry.abs_path, entry.rel_path).await
            });
        }

        let mut scanned = 0usize;
        let mut skipped = 0usize;
        let mut errored = 0usize;
        let mut chunks = 0usize;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(FileOutcome::Indexed(n)) => {
                    scanned += 1;
                    chunks += n;
                }
                Ok(FileOutcome::Skipped) => skipped += 1,
                Ok(FileOutcome::Errored) => errored += 1,
                Err(e) => {
                    error!(component = "watcher", error = %e, "scan worker task panicked");
                    errored += 1;
                }
            }
        }

        let mut metrics = self.inner.metrics.lock().expect("metrics lock poisoned");
        metrics.files_scanned = scanned;
        metrics.files_skipped = skipped;
        metrics.files_errored = errored;
        metrics.chunks_produced = chunks;
        metrics.scan_duration = started.elapsed();
        debug!(
            component = "scanner",
            scanned, skipped, errored, chunks, "initial scan complete"
        );
        Ok(())
    }

    async fn process_scanned_file(&self, abs_path: PathBuf, rel_path: PathBuf) -> FileOutcome {
        let rel = normalize_path(&rel_path);
        match self.ingest_file(&rel, &abs_path).await {
            Ok(Some(n)) => FileOutcome::Indexed(n),
            Ok(None) => FileOutcome::Skipped,
            Err(e) => {
                warn!(component = "scanner", path = %rel, error = %e, "failed to index file");
                FileOutcome::Errored
            }
        }
    }

    fn path_lock(&self, rel_path: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.inner.path_locks.lock().expect("path lock map poisoned");
        locks
            .entry(rel_path.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Re-read, re-hash, and (if changed) re-chunk/re-embed/upsert one file.
    /// Returns `Ok(None)` when the file's hash is unchanged (skipped), or the
    /// number of chunks produced otherwise.
    async fn ingest_file(&self, rel_path: &str, abs_path: &Path) -> Result<Option<usize>> {
        let lock = self.path_lock(rel_path);
        let _guard = lock.lock().await;

        let bytes = std::fs::read(abs_path).map_err(|e| SemanticSearchError::ChunkerFailure {
            path: abs_path.to_path_buf(),
            reason: format!("failed to read file: {e}"),
        })?;
        let hash = content_hash_hex(&bytes);

        {
            let state = self.inner.file_state.read().await;
            if state.get(rel_path).map(|h| h.as_str()) == Some(hash.as_str()) {
                return Ok(None);
            }
        }

        self.inner.store.delete_by_file_path(rel_path).await?;

        let chunks = chunker::chunk(&bytes, rel_path, &self.inner.grammar_cache);
        let produced = chunks.len();

        if !chunks.is_empty() {
            let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
            let batch = self.inner.embedder.embed_batch(&texts).await?;
            for (idx, reason) in &batch.failures {
                warn!(component = "embedder", path = %rel_path, chunk_index = idx, %reason, "embedding failed for chunk");
            }
            let mut records = Vec::with_capacity(batch.vectors.len());
            for (idx, vector) in batch.vectors {
                records.push(Record::from_chunk(chunks[idx].clone(), vector, hash.clone()));
            }
            if !records.is_empty() {
                self.inner.store.upsert(records).await?;
            }
        }

        let mut state = self.inner.file_state.write().await;
        state.insert(rel_path.to_string(), hash);
        Ok(Some(produced))
    }

    pub async fn handle_delete(&self, rel_path: &str) -> Result<()> {
        let lock = self.path_lock(rel_path);
        let _guard = lock.lock().await;
        self.inner.store.delete_by_file_path(rel_path).await?;
        let mut state = self.inner.file_state.write().await;
        state.remove(rel_path);
        Ok(())
    }

    /// Start the live file-system watcher. A no-op if already running (tracked
    /// implicitly by `ensure_initialized`'s once-guard).
    fn start_watcher(&self) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
        let repo_root = self.inner.repo_root.clone();

        let watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                let _ = tx.send(event);
            }
            Err(e) => {
                warn!(component = "watcher", error = %e, "file watcher error");
            }
        });

        let mut watcher = match watcher {
            Ok(w) => w,
            Err(e) => {
                warn!(component = "watcher", error = %e, "failed to create file watcher; live updates disabled");
                return;
            }
        };

        if let Err(e) = watcher.watch(&repo_root, RecursiveMode::Recursive) {
            warn!(component = "watcher", error = %e, "failed to watch root; live updates disabled");
            return;
        }

        *self.inner._watcher_handle.lock().expect("watcher handle lock poisoned") = Some(watcher);

        let this = self.clone();
        let consumer = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                this.handle_watch_event(event).await;
            }
        });
        self.inner
            .watcher_tasks
            .lock()
            .expect("watcher tasks lock poisoned")
            .push(consumer);
    }

    /// True when `path` falls under one of `exclude_dir_names` anywhere below
    /// the repo root — in particular the index directory itself, so the
    /// watcher never re-triggers on the store's own writes.
    fn is_excluded_path(&self, path: &Path) -> bool {
        let Ok(rel) = path.strip_prefix(&self.inner.repo_root) else {
            return false;
        };
        rel.components().any(|c| {
            let name = c.as_os_str().to_string_lossy();
            self.inner.exclude_dir_names.iter().any(|d| d == name.as_ref())
        })
    }

    async fn handle_watch_event(&self, event: Event) {
        if self.inner.shutting_down.load(Ordering::Acquire) {
            return;
        }
        let is_delete = matches!(event.kind, EventKind::Remove(_));
        for path in event.paths {
            if !is_within_root(&path, &self.inner.repo_root) {
                continue;
            }
            if self.is_excluded_path(&path) {
                continue;
            }
            self.schedule_debounced(path, is_delete);
        }
    }

    fn schedule_debounced(&self, abs_path: PathBuf, is_delete: bool) {
        let generation = {
            let mut gens = self.inner.watch_generation.lock().expect("watch generation lock poisoned");
            let entry = gens.entry(abs_path.clone()).or_insert(0);
            *entry = entry.wrapping_add(1);
            *entry
        };

        let this = self.clone();
        self.inner.pending_ops.fetch_add(1, Ordering::AcqRel);
        tokio::spawn(async move {
            tokio::time::sleep(WATCH_DEBOUNCE).await;
            let still_current = {
                let gens = this.inner.watch_generation.lock().expect("watch generation lock poisoned");
                gens.get(&abs_path).copied() == Some(generation)
            };
            if still_current {
                this.apply_debounced_event(&abs_path, is_delete).await;
            }
            this.inner.pending_ops.fetch_sub(1, Ordering::AcqRel);
        });
    }

    async fn apply_debounced_event(&self, abs_path: &Path, is_delete: bool) {
        let Ok(rel_path) = abs_path.strip_prefix(&self.inner.repo_root) else {
            return;
        };
        let rel = normalize_path(rel_path);

        if is_delete || !abs_path.exists() {
            if let Err(e) = self.handle_delete(&rel).await {
                warn!(component = "watcher", path = %rel, error = %e, "failed to remove deleted file from index");
            }
            return;
        }

        match self.ingest_file(&rel, abs_path).await {
            Ok(_) => debug!(component = "watcher", path = %rel, "re-indexed changed file"),
            Err(e) => warn!(component = "watcher", path = %rel, error = %e, "failed to re-index changed file"),
        }
    }

    /// Stop accepting new watcher events, await in-flight per-file tasks, close
    /// the store.
    pub async fn shutdown(&self) -> Result<()> {
        self.inner.shutting_down.store(true, Ordering::Release);
        *self.inner._watcher_handle.lock().expect("watcher handle lock poisoned") = None;

        while self.inner.pending_ops.load(Ordering::Acquire) > 0 {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        let handles: Vec<_> = self
            .inner
            .watcher_tasks
            .lock()
            .expect("watcher tasks lock poisoned")
            .drain(..)
            .collect();
        for handle in handles {
            handle.abort();
        }

        self.inner.store.close().await
    }
}

enum FileOutcome {
    Indexed(usize),
    Skipped,
    Errored,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_default_to_zero() {
        let m = IndexingMetrics::default();
        assert_eq!(m.files_scanned, 0);
        assert!(m.last_query_latency.is_none());
    }

    #[tokio::test]
    async fn ensure_initialized_scans_and_indexes_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("lib.rs"),
            "fn add(a: i32, b: i32) -> i32 {\n    let sum = a + b;\n    sum\n}\n",
        )
        .unwrap();

        let index_dir = dir.path().join(".semantic-code").join("index");
        let store = Arc::new(VectorStore::open(&index_dir).await.unwrap());
        let embedder = Arc::new(Embedder::new("minishlab/potion-retrieval-32M", None));
        let grammar_cache = Arc::new(GrammarCache::default());

        let manager = IndexManager::new(
            dir.path().to_path_buf(),
            vec![],
            1_000_000,
            store,
            embedder,
            grammar_cache,
        );

        // Without a reachable model this will surface a model-load-failure; we
        // only assert the scan pipeline runs to completion without panicking.
        let _ = manager.ensure_initialized().await;
        let metrics = manager.metrics_snapshot();
        assert!(metrics.files_scanned + metrics.files_errored >= 1);
    }

    #[tokio::test]
    async fn excluded_path_is_not_scheduled_for_reingest() {
        let dir = tempfile::tempdir().unwrap();
        let index_dir = dir.path().join("index");
        let store = Arc::new(VectorStore::open(&index_dir).await.unwrap());
        let embedder = Arc::new(Embedder::new("minishlab/potion-retrieval-32M", None));
        let grammar_cache = Arc::new(GrammarCache::default());
        let manager = IndexManager::new(
            dir.path().to_path_buf(),
            vec![".semantic-code".to_string()],
            1_000_000,
            store,
            embedder,
            grammar_cache,
        );

        let store_file = dir.path().join(".semantic-code").join("index").join("records.json");
        assert!(manager.is_excluded_path(&store_file));

        let source_file = dir.path().join("src").join("lib.rs");
        assert!(!manager.is_excluded_path(&source_file));
    }

    #[tokio::test]
    async fn watcher_reingests_changed_file_and_updates_hash() {
        let dir = tempfile::tempdir().unwrap();
        // Short, single-line content never clears the chunk floor (`MIN_CHUNK_CHARS`/
        // `MIN_CHUNK_LINES`), so `ingest_file` never calls the embedder — this keeps
        // the test deterministic without a reachable model.
        let file_path = dir.path().join("notes.txt");
        std::fs::write(&file_path, "first version").unwrap();

        let index_dir = dir.path().join(".semantic-code").join("index");
        let store = Arc::new(VectorStore::open(&index_dir).await.unwrap());
        let embedder = Arc::new(Embedder::new("minishlab/potion-retrieval-32M", None));
        let grammar_cache = Arc::new(GrammarCache::default());
        let manager = IndexManager::new(
            dir.path().to_path_buf(),
            vec![],
            1_000_000,
            store,
            embedder,
            grammar_cache,
        );

        manager.ensure_initialized().await.unwrap();
        let first_hash = manager
            .inner
            .file_state
            .read()
            .await
            .get("notes.txt")
            .cloned()
            .expect("initial scan should have recorded notes.txt");
        assert_eq!(first_hash, content_hash_hex(b"first version"));

        std::fs::write(&file_path, "second version, now different").unwrap();
        manager.schedule_debounced(file_path.clone(), false);
        tokio::time::sleep(WATCH_DEBOUNCE + Duration::from_millis(200)).await;

        let second_hash = manager
            .inner
            .file_state
            .read()
            .await
            .get("notes.txt")
            .cloned()
            .expect("watcher should have re-recorded notes.txt");
        assert_ne!(first_hash, second_hash);
        assert_eq!(second_hash, content_hash_hex(b"second version, now different"));

        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn record_query_updates_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let index_dir = dir.path().join("index");
        let store = Arc::new(VectorStore::open(&index_dir).await.unwrap());
        let embedder = Arc::new(Embedder::new("minishlab/potion-retrieval-32M", None));
        let grammar_cache = Arc::new(GrammarCache::default());
        let manager = IndexManager::new(dir.path().to_path_buf(), vec![], 1_000_000, store, embedder, grammar_cache);

        manager.record_query(Duration::from_millis(12), 3, false);
        let metrics = manager.metrics_snapshot();
        assert_eq!(metrics.last_query_result_count, Some(3));
        assert_eq!(metrics.last_query_fallback_used, Some(false));
    }

    #[tokio::test]
    async fn query_embedding_cache_roundtrips_and_evicts() {
        let dir = tempfile::tempdir().unwrap();
        let index_dir = dir.path().join("index");
        let store = Arc::new(VectorStore::open(&index_dir).await.unwrap());
        let embedder = Arc::new(Embedder::new("minishlab/potion-retrieval-32M", None));
        let grammar_cache = Arc::new(GrammarCache::default());
        let manager = IndexManager::with_query_cache(
            dir.path().to_path_buf(),
            vec![],
            1_000_000,
            store,
            embedder,
            grammar_cache,
            1,
            0,
        );

        assert!(manager.cached_query_embedding("add numbers").is_none());
        manager.cache_query_embedding("add numbers", vec![1.0, 0.0]);
        assert_eq!(manager.cached_query_embedding("add numbers"), Some(vec![1.0, 0.0]));

        // capacity 1: a second distinct key evicts the first
        manager.cache_query_embedding("subtract numbers", vec![0.0, 1.0]);
        assert!(manager.cached_query_embedding("add numbers").is_none());
        assert_eq!(manager.cached_query_embedding("subtract numbers"), Some(vec![0.0, 1.0]));
    }
}
