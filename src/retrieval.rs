use std::cmp::Ordering;
use std::collections::HashMap;

use anyhow::Result;

use crate::db::Database;
use crate::models::RetrievalResult;
use crate::ollama::OllamaClient;
use crate::qdrant_store::{QdrantStore, VectorHit};

#[derive(Clone)]
pub struct Retriever {
    db: Database,
    qdrant: QdrantStore,
    ollama: OllamaClient,
    embedding_model: String,
}

impl Retriever {
    pub fn new(
        db: Database,
        qdrant: QdrantStore,
        ollama: OllamaClient,
        embedding_model: impl Into<String>,
    ) -> Self {
        Self {
            db,
            qdrant,
            ollama,
            embedding_model: embedding_model.into(),
        }
    }

    /// Returns up to `top_k` chunks most similar to `query`, best first.
    pub async fn retrieve(&self, query: &str, top_k: usize) -> Result<Vec<RetrievalResult>> {
        if top_k == 0 || query.trim().is_empty() {
            return Ok(vec![]);
        }

        let embedding = self.ollama.embed(&self.embedding_model, query).await?;
        let hits = self.qdrant.search(&embedding, top_k).await?;
        if hits.is_empty() {
            tracing::debug!("vector search returned no hits");
            return Ok(vec![]);
        }

        let ids: Vec<String> = hits.iter().map(|hit| hit.chunk_id.clone()).collect();
        let chunks = self.db.get_chunks_by_ids(&ids).await?;
        if chunks.len() < hits.len() {
            tracing::warn!(
                hits = hits.len(),
                found = chunks.len(),
                "vector index references chunks missing from sqlite; re-run ingest"
            );
        }

        let scores = score_map(&hits);
        let mut out: Vec<RetrievalResult> = chunks
            .into_iter()
            .map(|chunk| RetrievalResult {
                score: scores.get(chunk.id.as_str()).copied().unwrap_or(0.0),
                chunk,
            })
            .collect();

        sort_by_score(&mut out);
        out.truncate(top_k);
        Ok(out)
    }
}

fn score_map(hits: &[VectorHit]) -> HashMap<&str, f32> {
    let mut scores = HashMap::with_capacity(hits.len());
    for hit in hits {
        let entry = scores.entry(hit.chunk_id.as_str()).or_insert(hit.score);
        if hit.score > *entry {
            *entry = hit.score;
        }
    }
    scores
}

fn sort_by_score(results: &mut [RetrievalResult]) {
    results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
}
