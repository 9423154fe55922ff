//! Embedder facade: translates text batches into fixed-dimension, unit-normalized
//! vectors. The underlying `model2vec-rs` model is loaded lazily, on a dedicated
//! worker thread (the model handle is not `Send`), and owned for the lifetime of
//! the process by whoever constructs this facade — never as module-level state.

use std::path::PathBuf;
use std::sync::mpsc as std_mpsc;
use std::sync::{Mutex, OnceLock};

use model2vec_rs::model::StaticModel;
use tokio::sync::oneshot;

use crate::error::{Result, SemanticSearchError};

/// Literal prefix markers matching the underlying model's two-tower conditioning —
/// queries and documents are embedded differently even though they share one model.
const DOCUMENT_PREFIX: &str = "passage: ";
const QUERY_PREFIX: &str = "query: ";

/// Upper bound on the number of texts embedded in a single model invocation.
pub const EMBED_BATCH_SIZE: usize = 32;

/// Result of a batch embed call: successful vectors paired with their original
/// index, plus the indices and messages of anything that failed. A vector never
/// appears here unless it is both present and unit-normalized — there are no
/// sentinel zero-vectors for failed items.
#[derive(Debug, Default, Clone)]
pub struct BatchEmbedResult {
    pub vectors: Vec<(usize, Vec<f32>)>,
    pub failures: Vec<(usize, String)>,
}

struct WorkerJob {
    texts: Vec<String>,
    reply: oneshot::Sender<Vec<std::result::Result<Vec<f32>, String>>>,
}

struct Worker {
    sender: std_mpsc::Sender<WorkerJob>,
}

pub struct Embedder {
    model_id: String,
    cache_dir: Option<PathBuf>,
    worker: OnceLock<Worker>,
    init_lock: Mutex<()>,
}

impl Embedder {
    pub fn new(model_id: impl Into<String>, cache_dir: Option<PathBuf>) -> Self {
        Self {
            model_id: model_id.into(),
            cache_dir,
            worker: OnceLock::new(),
            init_lock: Mutex::new(()),
        }
    }

    /// Spawn (once) the worker thread that owns the model, blocking until the
    /// model either finishes loading or reports a load failure.
    fn ensure_worker(&self) -> Result<&Worker> {
        if let Some(w) = self.worker.get() {
            return Ok(w);
        }
        let _guard = self.init_lock.lock().expect("embedder init lock poisoned");
        if let Some(w) = self.worker.get() {
            return Ok(w);
        }

        if let Some(dir) = &self.cache_dir {
            // model2vec-rs delegates to the huggingface-hub cache resolution,
            // which honors HF_HOME; this is the only portable way to redirect it.
            std::env::set_var("HF_HOME", dir);
        }

        let (job_tx, job_rx) = std_mpsc::channel::<WorkerJob>();
        let (ready_tx, ready_rx) = std_mpsc::channel::<std::result::Result<(), String>>();
        let model_id = self.model_id.clone();

        std::thread::Builder::new()
            .name("semantic-code-embedder".into())
            .spawn(move || {
                let model = match StaticModel::from_pretrained(&model_id, None, None, None) {
                    Ok(m) => {
                        let _ = ready_tx.send(Ok(()));
                        m
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e.to_string()));
                        return;
                    }
                };
                for job in job_rx {
                    let results = job
                        .texts
                        .iter()
                        .map(|t| embed_one_with_model(&model, t))
                        .collect();
                    let _ = job.reply.send(results);
                }
            })
            .expect("failed to spawn embedder worker thread");

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(reason)) => {
                return Err(SemanticSearchError::ModelLoadFailure { reason });
            }
            Err(_) => {
                return Err(SemanticSearchError::ModelLoadFailure {
                    reason: "embedder worker thread exited before signaling readiness".to_string(),
                });
            }
        }

        let _ = self.worker.set(Worker { sender: job_tx });
        Ok(self.worker.get().expect("worker was just set"))
    }

    pub async fn embed_document(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_one(DOCUMENT_PREFIX, text).await
    }

    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_one(QUERY_PREFIX, text).await
    }

    async fn embed_one(&self, prefix: &str, text: &str) -> Result<Vec<f32>> {
        let prefixed = format!("{prefix}{text}");
        let result = self.embed_batch_raw(vec![prefixed]).await?;
        match result.into_iter().next() {
            Some(Ok(v)) => Ok(v),
            Some(Err(reason)) => Err(SemanticSearchError::EmbeddingGenerationFailure { reason }),
            None => Err(SemanticSearchError::EmbeddingGenerationFailure {
                reason: "embedder returned no result".to_string(),
            }),
        }
    }

    /// Embed a batch of already-unprefixed documents, bounded to `EMBED_BATCH_SIZE`
    /// per underlying model call. Never raises on a per-item failure — those are
    /// reported in `BatchEmbedResult::failures`. A model-load failure (the worker
    /// never starts) is the one case that fails the whole call.
    pub async fn embed_batch(&self, texts: &[String]) -> Result<BatchEmbedResult> {
        let prefixed: Vec<String> = texts.iter().map(|t| format!("{DOCUMENT_PREFIX}{t}")).collect();
        let mut out = BatchEmbedResult::default();
        for (chunk_start, chunk) in prefixed.chunks(EMBED_BATCH_SIZE).enumerate() {
            let base = chunk_start * EMBED_BATCH_SIZE;
            let results = self.embed_batch_raw(chunk.to_vec()).await?;
            for (offset, result) in results.into_iter().enumerate() {
                match result {
                    Ok(vector) => out.vectors.push((base + offset, vector)),
                    Err(reason) => out.failures.push((base + offset, reason)),
                }
            }
        }
        Ok(out)
    }

    async fn embed_batch_raw(
        &self,
        texts: Vec<String>,
    ) -> Result<Vec<std::result::Result<Vec<f32>, String>>> {
        let worker = self.ensure_worker()?;
        let (reply_tx, reply_rx) = oneshot::channel();
        worker
            .sender
            .send(WorkerJob {
                texts,
                reply: reply_tx,
            })
            .map_err(|_| SemanticSearchError::EmbeddingGenerationFailure {
                reason: "embedder worker thread is no longer running".to_string(),
            })?;
        reply_rx
            .await
            .map_err(|_| SemanticSearchError::EmbeddingGenerationFailure {
                reason: "embedder worker dropped the reply channel".to_string(),
            })
    }
}

fn embed_one_with_model(model: &StaticModel, text: &str) -> std::result::Result<Vec<f32>, String> {
    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| model.encode_single(text)));
    match outcome {
        Ok(vector) if !vector.is_empty() => Ok(normalize(vector)),
        Ok(_) => Err("model returned an empty vector".to_string()),
        Err(_) => Err("embedding generation panicked".to_string()),
    }
}

/// Re-normalize to unit L2 norm regardless of what the underlying model already
/// did — the invariant must hold by construction, not by trusting the model.
fn normalize(mut vector: Vec<f32>) -> Vec<f32> {
    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
    vector
}
