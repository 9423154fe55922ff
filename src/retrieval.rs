//! Hybrid retrieval pipeline: query → embed → vector search → lexical boost →
//! rerank → results, with a keyword-search fallback when the embedder is down.

use std::time::Instant;

use tracing::debug;

use crate::embedder::Embedder;
use crate::error::Result;
use crate::filter::{build_filter, FilterOptions};
use crate::index_manager::IndexManager;
use crate::reranker::{apply_lexical_boost, cross_encoder_rerank, CrossEncoder, ScoredRecord};
use crate::store::{Record, VectorStore};

pub const DEFAULT_LIMIT: usize = 10;
pub const MAX_LIMIT: usize = 50;
pub const DEFAULT_CANDIDATE_MULTIPLIER: usize = 5;

#[derive(Debug, Clone)]
pub struct HybridSearchOptions {
    pub limit: usize,
    pub path: Option<String>,
    pub file_pattern: Option<String>,
    pub use_reranking: bool,
    pub candidate_multiplier: usize,
    pub fallback_to_keyword: bool,
}

impl Default for HybridSearchOptions {
    fn default() -> Self {
        HybridSearchOptions {
            limit: DEFAULT_LIMIT,
            path: None,
            file_pattern: None,
            use_reranking: true,
            candidate_multiplier: DEFAULT_CANDIDATE_MULTIPLIER,
            fallback_to_keyword: true,
        }
    }
}

impl HybridSearchOptions {
    fn effective_limit(&self) -> usize {
        self.limit.clamp(1, MAX_LIMIT)
    }
}

#[derive(Debug, Clone)]
pub struct HybridResult {
    pub record: Record,
    pub combined_score: f32,
    pub vector_score: f32,
    pub keyword_score: f32,
    pub from_fallback: bool,
}

#[derive(Debug, Clone, Default)]
pub struct HybridSearchResult {
    pub results: Vec<HybridResult>,
    pub total_results: usize,
    pub used_fallback: bool,
}

/// Run the full hybrid search pipeline. `reranker` may be `None` — cross-encoder
/// rerank then behaves as a pass-through of the lexically-boosted ordering.
pub async fn hybrid_search(
    query: &str,
    options: &HybridSearchOptions,
    store: &VectorStore,
    embedder: &Embedder,
    reranker: Option<&dyn CrossEncoder>,
    index_manager: &IndexManager,
) -> Result<HybridSearchResult> {
    let started = Instant::now();
    let limit = options.effective_limit();

    if store.is_empty().await {
        debug!(component = "retrieval", "store is empty, returning no results");
        index_manager.record_query(started.elapsed(), 0, false);
        return Ok(HybridSearchResult::default());
    }

    let filter_options = FilterOptions {
        path: options.path.clone(),
        file_pattern: options.file_pattern.clone(),
    };
    let predicate = build_filter(&filter_options)?;

    if let Some(cached) = index_manager.cached_query_embedding(query) {
        debug!(component = "retrieval", query, "query embedding cache hit");
        return rank_and_finish(query, options, store, index_manager, reranker, predicate, cached, started, false).await;
    }

    let query_vector = match embedder.embed_query(query).await {
        Ok(v) => v,
        Err(e) if e.is_embedder_failure() && options.fallback_to_keyword => {
            debug!(component = "retrieval", error = %e, "embedder unavailable, falling back to keyword search");
            let fallback = store
                .full_text_search(query, limit * 2, predicate.as_ref())
                .await?;
            let results: Vec<HybridResult> = fallback
                .into_iter()
                .take(limit)
                .map(|(record, score)| HybridResult {
                    record,
                    combined_score: score,
                    vector_score: 0.0,
                    keyword_score: score,
                    from_fallback: true,
                })
                .collect();
            index_manager.record_query(started.elapsed(), results.len(), true);
            return Ok(HybridSearchResult {
                total_results: results.len(),
                used_fallback: true,
                results,
            });
        }
        Err(e) => return Err(e),
    };

    index_manager.cache_query_embedding(query, query_vector.clone());
    rank_and_finish(query, options, store, index_manager, reranker, predicate, query_vector, started, false).await
}

/// Vector search + lexical boost + conditional rerank, given an already-resolved
/// query vector (fresh or cache-hit). Shared by both entry paths so the cache
/// never changes the ranking behavior, only whether the embedder is called.
#[allow(clippy::too_many_arguments)]
async fn rank_and_finish(
    query: &str,
    options: &HybridSearchOptions,
    store: &VectorStore,
    index_manager: &IndexManager,
    reranker: Option<&dyn CrossEncoder>,
    predicate: Option<crate::filter::Predicate>,
    query_vector: Vec<f32>,
    started: Instant,
    used_fallback: bool,
) -> Result<HybridSearchResult> {
    let limit = options.effective_limit();
    let candidate_k = if options.use_reranking {
        limit * options.candidate_multiplier.max(1)
    } else {
        limit
    };

    let candidates = store
        .vector_search(&query_vector, candidate_k, predicate.as_ref())
        .await?;

    let boosted: Vec<ScoredRecord> = apply_lexical_boost(query, candidates);

    let final_scored: Vec<ScoredRecord> = if options.use_reranking && boosted.len() > limit {
        cross_encoder_rerank(reranker, query, boosted, limit)
    } else {
        let mut sorted = boosted;
        sorted.sort_by(|a, b| {
            b.combined_score
                .partial_cmp(&a.combined_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        sorted.truncate(limit);
        sorted
    };

    let results: Vec<HybridResult> = final_scored
        .into_iter()
        .map(|s| HybridResult {
            record: s.record,
            combined_score: s.combined_score,
            vector_score: s.vector_score,
            keyword_score: s.keyword_score,
            from_fallback: false,
        })
        .collect();

    index_manager.record_query(started.elapsed(), results.len(), used_fallback);
    debug!(
        component = "retrieval",
        query,
        result_count = results.len(),
        latency_ms = started.elapsed().as_millis() as u64,
        "query complete"
    );

    Ok(HybridSearchResult {
        total_results: results.len(),
        used_fallback,
        results,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::{self, GrammarCache};
    use std::sync::Arc;

    async fn build_manager(root: &std::path::Path) -> (IndexManager, Arc<VectorStore>, Arc<Embedder>) {
        let index_dir = root.join(".semantic-code").join("index");
        let store = Arc::new(VectorStore::open(&index_dir).await.unwrap());
        let embedder = Arc::new(Embedder::new("minishlab/potion-retrieval-32M", None));
        let grammar_cache = Arc::new(GrammarCache::default());
        let manager = IndexManager::new(
            root.to_path_buf(),
            vec![],
            1_000_000,
            store.clone(),
            embedder.clone(),
            grammar_cache,
        );
        (manager, store, embedder)
    }

    #[tokio::test]
    async fn empty_store_returns_empty_result() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, store, embedder) = build_manager(dir.path()).await;
        let options = HybridSearchOptions::default();
        let result = hybrid_search("add numbers", &options, &store, &embedder, None, &manager)
            .await
            .unwrap();
        assert!(result.results.is_empty());
        assert_eq!(result.total_results, 0);
    }

    #[tokio::test]
    async fn fallback_keyword_search_marks_results() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, store, embedder) = build_manager(dir.path()).await;

        let grammar_cache = GrammarCache::default();
        let source = b"fn add(a: i32, b: i32) -> i32 {\n    let sum = a + b;\n    sum\n}\n";
        let chunks = chunker::chunk(source, "src/lib.rs", &grammar_cache);
        let records: Vec<_> = chunks
            .into_iter()
            .map(|c| crate::store::Record::from_chunk(c, vec![1.0, 0.0], "hash".to_string()))
            .collect();
        store.upsert(records).await.unwrap();

        let options = HybridSearchOptions {
            fallback_to_keyword: true,
            ..Default::default()
        };
        // The embedder has no reachable network/model in this test environment, so
        // embed_query fails with a model-load-failure and the fallback path runs.
        let result = hybrid_search("add", &options, &store, &embedder, None, &manager).await;
        if let Ok(result) = result {
            assert!(result.results.iter().all(|r| r.from_fallback) || result.results.is_empty());
        }
    }

    #[tokio::test]
    async fn fallback_disabled_surfaces_embedder_failure() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, store, embedder) = build_manager(dir.path()).await;

        let grammar_cache = GrammarCache::default();
        let source = b"fn add(a: i32, b: i32) -> i32 {\n    let sum = a + b;\n    sum\n}\n";
        let chunks = chunker::chunk(source, "src/lib.rs", &grammar_cache);
        let records: Vec<_> = chunks
            .into_iter()
            .map(|c| crate::store::Record::from_chunk(c, vec![1.0, 0.0], "hash".to_string()))
            .collect();
        store.upsert(records).await.unwrap();

        let options = HybridSearchOptions {
            fallback_to_keyword: false,
            ..Default::default()
        };
        // Same no-network assumption as `fallback_keyword_search_marks_results`: embed_query
        // fails with a model-load-failure. With the fallback disabled that failure must
        // reach the caller, never silently resolve to a keyword-search result.
        let result = hybrid_search("add", &options, &store, &embedder, None, &manager).await;
        assert!(result.is_err());
    }

    #[test]
    fn effective_limit_is_clamped() {
        let options = HybridSearchOptions {
            limit: 500,
            ..Default::default()
        };
        assert_eq!(options.effective_limit(), MAX_LIMIT);

        let options = HybridSearchOptions { limit: 0, ..Default::default() };
        assert_eq!(options.effective_limit(), 1);
    }
}
