//! Reranking: a lexical boost heuristic applied to every candidate, plus an
//! optional cross-encoder pass. The cross-encoder is an opaque, possibly-absent
//! collaborator — when unconfigured or unavailable, reranking is a silent
//! no-op pass-through of the boosted ordering.

use crate::store::Record;

/// Scored candidate as it flows through boosting and reranking.
#[derive(Debug, Clone)]
pub struct ScoredRecord {
    pub record: Record,
    pub vector_score: f32,
    pub keyword_score: f32,
    pub combined_score: f32,
}

/// Tokenize the query into lowercased unicode words and add a weighted lexical
/// score to each candidate's `vector_score`. Tokens are matched literally, never
/// compiled as a regex, so regex-special characters in the query can't misbehave.
pub fn apply_lexical_boost(query: &str, candidates: Vec<(Record, f32)>) -> Vec<ScoredRecord> {
    let tokens = tokenize(query);
    candidates
        .into_iter()
        .map(|(record, vector_score)| {
            let keyword_score = if tokens.is_empty() {
                0.0
            } else {
                lexical_score(&tokens, &record)
            };
            let combined_score = (vector_score + keyword_score).clamp(0.0, 1.0);
            ScoredRecord {
                record,
                vector_score,
                keyword_score,
                combined_score,
            }
        })
        .collect()
}

fn tokenize(query: &str) -> Vec<String> {
    query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

/// Weighted sum over matched tokens, scaled into roughly `[0, 1]`: weight 3 for a
/// match in `name` (exact word beats substring), 2 in `signature`, 1 in `content`.
fn lexical_score(tokens: &[String], record: &Record) -> f32 {
    let name = record.name.as_deref().unwrap_or("").to_lowercase();
    let name_words: Vec<&str> = name.split(|c: char| !c.is_alphanumeric()).collect();
    let signature = record.signature.as_deref().unwrap_or("").to_lowercase();
    let content = record.content.to_lowercase();

    let mut raw = 0.0f32;
    for token in tokens {
        if name_words.iter().any(|w| *w == token) {
            raw += 3.0;
        } else if name.contains(token.as_str()) {
            raw += 1.5;
        }
        if signature.contains(token.as_str()) {
            raw += 2.0;
        }
        if content.contains(token.as_str()) {
            raw += 1.0;
        }
    }
    let max_possible = tokens.len() as f32 * 3.0;
    if max_possible <= 0.0 {
        0.0
    } else {
        (raw / max_possible).clamp(0.0, 1.0)
    }
}

/// A query/candidate pair scored through an opaque cross-encoder model.
pub trait CrossEncoder: Send + Sync {
    /// Score one `(query, candidate_text)` pair; higher is more relevant. Errors
    /// propagate as `Err`, which the caller treats as a non-fatal rerank failure.
    fn score(&self, query: &str, candidate_text: &str) -> Result<f32, String>;
}

/// Rerank `candidates` down to the top `k` using `encoder`. On any scoring
/// failure the boosted ordering is returned unchanged — cross-encoder rerank is
/// never allowed to fail the surrounding search.
pub fn cross_encoder_rerank(
    encoder: Option<&dyn CrossEncoder>,
    query: &str,
    mut candidates: Vec<ScoredRecord>,
    k: usize,
) -> Vec<ScoredRecord> {
    let Some(encoder) = encoder else {
        candidates.truncate(k);
        return candidates;
    };

    let mut rescored = Vec::with_capacity(candidates.len());
    for candidate in candidates.iter() {
        match encoder.score(query, &candidate.record.content) {
            Ok(score) => rescored.push(score),
            Err(_) => {
                candidates.truncate(k);
                return candidates;
            }
        }
    }

    for (candidate, score) in candidates.iter_mut().zip(rescored) {
        candidate.combined_score = score.clamp(0.0, 1.0);
    }
    candidates.sort_by(|a, b| {
        b.combined_score
            .partial_cmp(&a.combined_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    candidates.truncate(k);
    candidates
}
