//! Vector store facade: a flat-file, process-owned JSON store with brute-force
//! cosine search. No embedded vector database or full-text engine — this mirrors
//! the reference implementation's own zero-external-search-engine design.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{Result, SemanticSearchError};
use crate::filter::Predicate;

pub const RECORDS_FILE_NAME: &str = "records.json";

/// A persisted chunk: everything a [`crate::chunker::Chunk`] carries, plus its
/// embedding, the hash of the file it was derived from, and when it was indexed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Record {
    pub id: String,
    pub file_path: String,
    pub language: String,
    pub node_kind: String,
    pub name: Option<String>,
    pub signature: Option<String>,
    pub docstring: Option<String>,
    pub content: String,
    pub start_line: usize,
    pub end_line: usize,
    pub vector: Vec<f32>,
    pub content_hash: String,
    pub indexed_at: u64,
}

impl Record {
    pub fn from_chunk(chunk: crate::chunker::Chunk, vector: Vec<f32>, content_hash: String) -> Self {
        Record {
            id: chunk.id,
            file_path: chunk.file_path,
            language: chunk.language,
            node_kind: chunk.node_kind,
            name: chunk.name,
            signature: chunk.signature,
            docstring: chunk.docstring,
            content: chunk.content,
            start_line: chunk.start_line,
            end_line: chunk.end_line,
            vector,
            content_hash,
            indexed_at: now_unix_seconds(),
        }
    }
}

fn now_unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Hex digest of the full file content a [`Record`] was derived from. xxh3-128 —
/// high throughput, not adversarial-collision-resistant, which is fine for change
/// detection rather than security.
pub fn content_hash_hex(bytes: &[u8]) -> String {
    format!("{:032x}", xxhash_rust::xxh3::xxh3_128(bytes))
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    records: HashMap<String, Record>,
}

pub struct VectorStore {
    index_dir: PathBuf,
    records: RwLock<HashMap<String, Record>>,
    closed: AtomicBool,
}

impl VectorStore {
    /// Open (or create) the store rooted at `index_dir`, reading `records.json`
    /// fully into memory if present.
    pub async fn open(index_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(index_dir).map_err(|e| SemanticSearchError::StoreFatal {
            reason: format!("failed to create index directory {}: {e}", index_dir.display()),
        })?;

        let path = index_dir.join(RECORDS_FILE_NAME);
        let records = if path.exists() {
            let bytes = std::fs::read(&path).map_err(|e| SemanticSearchError::StoreFatal {
                reason: format!("failed to read {}: {e}", path.display()),
            })?;
            let file: StoreFile = serde_json::from_slice(&bytes).map_err(|e| SemanticSearchError::StoreFatal {
                reason: format!("corrupt index file {}: {e}", path.display()),
            })?;
            file.records
        } else {
            HashMap::new()
        };

        Ok(VectorStore {
            index_dir: index_dir.to_path_buf(),
            records: RwLock::new(records),
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SemanticSearchError::StoreFatal {
                reason: "store is closed".to_string(),
            });
        }
        Ok(())
    }

    /// Idempotent by id: re-inserting a record with the same id replaces it.
    pub async fn upsert(&self, incoming: Vec<Record>) -> Result<()> {
        self.ensure_open()?;
        let mut guard = self.records.write().await;
        for record in incoming {
            guard.insert(record.id.clone(), record);
        }
        self.persist(&guard)
    }

    pub async fn delete_by_file_path(&self, file_path: &str) -> Result<usize> {
        self.ensure_open()?;
        let mut guard = self.records.write().await;
        let before = guard.len();
        guard.retain(|_, r| r.file_path != file_path);
        let removed = before - guard.len();
        self.persist(&guard)?;
        Ok(removed)
    }

    pub async fn vector_search(
        &self,
        vector: &[f32],
        k: usize,
        predicate: Option<&Predicate>,
    ) -> Result<Vec<(Record, f32)>> {
        self.ensure_open()?;
        let guard = self.records.read().await;
        let mut scored: Vec<(Record, f32)> = guard
            .values()
            .filter(|r| predicate.map(|p| p.matches(&r.id, &r.language)).unwrap_or(true))
            .map(|r| (r.clone(), cosine_similarity(vector, &r.vector)))
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        Ok(scored)
    }

    /// Best-effort keyword search over `content`/`name`/`signature`, normalized to
    /// `[0, 1]`. No external full-text engine — this is the store's own fallback
    /// path, used both for the public contract and the retrieval pipeline's
    /// embedder-failure fallback.
    pub async fn full_text_search(
        &self,
        text: &str,
        k: usize,
        predicate: Option<&Predicate>,
    ) -> Result<Vec<(Record, f32)>> {
        self.ensure_open()?;
        let tokens: Vec<String> = tokenize(text);
        if tokens.is_empty() {
            return Ok(Vec::new());
        }
        let max_possible = tokens.len() as f32 * 3.0;

        let guard = self.records.read().await;
        let mut scored: Vec<(Record, f32)> = guard
            .values()
            .filter(|r| predicate.map(|p| p.matches(&r.id, &r.language)).unwrap_or(true))
            .filter_map(|r| {
                let score = keyword_score(&tokens, r) / max_possible;
                if score > 0.0 {
                    Some((r.clone(), score.clamp(0.0, 1.0)))
                } else {
                    None
                }
            })
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        Ok(scored)
    }

    pub async fn count(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    pub async fn indexed_files(&self) -> HashMap<String, String> {
        let guard = self.records.read().await;
        let mut out = HashMap::new();
        for record in guard.values() {
            out.insert(record.file_path.clone(), record.content_hash.clone());
        }
        out
    }

    /// Allow in-flight writes to complete, persist once more, then refuse further
    /// operations. Since writes already hold the exclusive lock for their entire
    /// duration, taking the write lock here is sufficient to drain.
    pub async fn close(&self) -> Result<()> {
        let guard = self.records.write().await;
        self.persist(&guard)?;
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    fn persist(&self, records: &HashMap<String, Record>) -> Result<()> {
        let path = self.index_dir.join(RECORDS_FILE_NAME);
        let file = StoreFile {
            records: records.clone(),
        };
        let bytes = serde_json::to_vec(&file).map_err(|e| SemanticSearchError::StoreFatal {
            reason: format!("failed to serialize index: {e}"),
        })?;
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &bytes).map_err(|e| SemanticSearchError::StoreTransient {
            reason: format!("failed to write {}: {e}", tmp_path.display()),
        })?;
        std::fs::rename(&tmp_path, &path).map_err(|e| SemanticSearchError::StoreTransient {
            reason: format!("failed to finalize {}: {e}", path.display()),
        })?;
        Ok(())
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

fn keyword_score(tokens: &[String], record: &Record) -> f32 {
    let name = record.name.as_deref().unwrap_or("").to_lowercase();
    let signature = record.signature.as_deref().unwrap_or("").to_lowercase();
    let content = record.content.to_lowercase();

    let mut score = 0.0;
    for token in tokens {
        if !name.is_empty() && name.split(|c: char| !c.is_alphanumeric()).any(|w| w == token) {
            score += 3.0;
        } else if name.contains(token.as_str()) {
            score += 1.5;
        }
        if signature.contains(token.as_str()) {
            score += 2.0;
        }
        if content.contains(token.as_str()) {
            score += 1.0;
        }
    }
    score
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a * norm_b)).clamp(-1.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record(id: &str, language: &str, vector: Vec<f32>) -> Record {
        Record {
            id: id.to_string(),
            file_path: "src/lib.rs".to_string(),
            language: language.to_string(),
            node_kind: "function_item".to_string(),
            name: Some("add".to_string()),
            signature: Some("fn add(a: i32, b: i32) -> i32".to_string()),
            docstring: None,
            content: "fn add(a: i32, b: i32) -> i32 { a + b }".to_string(),
            start_line: 1,
            end_line: 3,
            vector,
            content_hash: "abc123".to_string(),
            indexed_at: 0,
        }
    }

    #[tokio::test]
    async fn upsert_then_search_returns_closest_by_cosine() {
        let dir = tempfile::tempdir().unwrap();
        let store = VectorStore::open(dir.path()).await.unwrap();
        store
            .upsert(vec![
                sample_record("a_L1", "rust", vec![1.0, 0.0]),
                sample_record("b_L1", "rust", vec![0.0, 1.0]),
            ])
            .await
            .unwrap();
        let results = store.vector_search(&[1.0, 0.0], 1, None).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0.id, "a_L1");
        assert!((results[0].1 - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn upsert_is_idempotent_by_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = VectorStore::open(dir.path()).await.unwrap();
        store
            .upsert(vec![sample_record("a_L1", "rust", vec![1.0, 0.0])])
            .await
            .unwrap();
        store
            .upsert(vec![sample_record("a_L1", "rust", vec![0.0, 1.0])])
            .await
            .unwrap();
        assert_eq!(store.count().await, 1);
    }

    #[tokio::test]
    async fn delete_by_file_path_removes_matching_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = VectorStore::open(dir.path()).await.unwrap();
        store
            .upsert(vec![sample_record("a_L1", "rust", vec![1.0, 0.0])])
            .await
            .unwrap();
        let removed = store.delete_by_file_path("src/lib.rs").await.unwrap();
        assert_eq!(removed, 1);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn full_text_search_finds_name_match() {
        let dir = tempfile::tempdir().unwrap();
        let store = VectorStore::open(dir.path()).await.unwrap();
        store
            .upsert(vec![sample_record("a_L1", "rust", vec![1.0, 0.0])])
            .await
            .unwrap();
        let results = store.full_text_search("add", 10, None).await.unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].1 > 0.0 && results[0].1 <= 1.0);
    }

    #[tokio::test]
    async fn predicate_filters_candidates() {
        let dir = tempfile::tempdir().unwrap();
        let store = VectorStore::open(dir.path()).await.unwrap();
        store
            .upsert(vec![
                sample_record("src_a_L1", "rust", vec![1.0, 0.0]),
                sample_record("src_b_L1", "python", vec![1.0, 0.0]),
            ])
            .await
            .unwrap();
        let predicate = Predicate::LanguageEq("python".to_string());
        let results = store.vector_search(&[1.0, 0.0], 10, Some(&predicate)).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0.id, "src_b_L1");
    }

    #[tokio::test]
    async fn close_then_operate_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = VectorStore::open(dir.path()).await.unwrap();
        store.close().await.unwrap();
        let err = store.upsert(vec![]).await.unwrap_err();
        assert_eq!(err.kind().as_str(), "store-fatal-failure");
    }

    #[tokio::test]
    async fn reopen_loads_persisted_records() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = VectorStore::open(dir.path()).await.unwrap();
            store
                .upsert(vec![sample_record("a_L1", "rust", vec![1.0, 0.0])])
                .await
                .unwrap();
        }
        let reopened = VectorStore::open(dir.path()).await.unwrap();
        assert_eq!(reopened.count().await, 1);
    }

    #[test]
    fn content_hash_is_stable() {
        let h1 = content_hash_hex(b"hello world");
        let h2 = content_hash_hex(b"hello world");
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 32);
    }
}
