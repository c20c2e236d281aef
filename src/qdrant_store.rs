use std::sync::Arc;

use anyhow::{Context, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::RwLock;

use crate::models::IndexedChunk;

#[derive(Debug, Clone)]
pub struct VectorHit {
    pub chunk_id: String,
    pub score: f32,
}

#[derive(Clone)]
pub struct QdrantStore {
    client: Client,
    base_url: String,
    collection: String,
    known_vector_size: Arc<RwLock<Option<usize>>>,
}

impl QdrantStore {
    pub fn new(base_url: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            collection: collection.into(),
            known_vector_size: Arc::new(RwLock::new(None)),
        }
    }

    fn collection_url(&self) -> String {
        format!("{}/collections/{}", self.base_url, self.collection)
    }

    /// Drops the collection (ignoring a missing one) and creates it afresh.
    pub async fn recreate_collection(&self, vector_size: usize) -> Result<()> {
        if let Err(err) = self.client.delete(self.collection_url()).send().await {
            tracing::warn!("qdrant delete of {} failed: {err}", self.collection);
        }
        *self.known_vector_size.write().await = None;

        self.ensure_collection(vector_size).await
    }

    pub async fn ensure_collection(&self, vector_size: usize) -> Result<()> {
        if *self.known_vector_size.read().await == Some(vector_size) {
            return Ok(());
        }

        self.client
            .put(self.collection_url())
            .json(&json!({
                "vectors": {
                    "size": vector_size,
                    "distance": "Cosine"
                }
            }))
            .send()
            .await
            .context("failed to contact qdrant while creating collection")?
            .error_for_status()
            .context("qdrant failed to create collection")?;

        *self.known_vector_size.write().await = Some(vector_size);
        Ok(())
    }

    pub async fn upsert_points(&self, points: &[QdrantPoint]) -> Result<()> {
        let Some(first) = points.first() else {
            return Ok(());
        };
        self.ensure_collection(first.vector.len()).await?;

        self.client
            .put(format!("{}/points?wait=true", self.collection_url()))
            .json(&json!({ "points": points }))
            .send()
            .await
            .context("failed to contact qdrant during upsert")?
            .error_for_status()
            .context("qdrant upsert returned non-success status")?;

        Ok(())
    }

    pub async fn search(&self, vector: &[f32], limit: usize) -> Result<Vec<VectorHit>> {
        if vector.is_empty() || limit == 0 {
            return Ok(vec![]);
        }

        let response = self
            .client
            .post(format!("{}/points/search", self.collection_url()))
            .json(&json!({
                "vector": vector,
                "limit": limit,
                "with_payload": true,
            }))
            .send()
            .await
            .context("failed to contact qdrant during search")?
            .error_for_status()
            .context("qdrant search returned non-success status")?
            .json::<QdrantSearchResponse>()
            .await
            .context("failed to decode qdrant search response")?;

        Ok(response
            .result
            .into_iter()
            .filter_map(|point| {
                Some(VectorHit {
                    chunk_id: point.payload?.chunk_id,
                    score: point.score,
                })
            })
            .collect())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QdrantPoint {
    pub id: String,
    pub vector: Vec<f32>,
    pub payload: QdrantPayload,
}

impl QdrantPoint {
    pub fn for_chunk(chunk: &IndexedChunk, vector: Vec<f32>) -> Self {
        Self {
            id: chunk.id.clone(),
            vector,
            payload: QdrantPayload {
                chunk_id: chunk.id.clone(),
                source_tag: chunk.chunk.source_tag.clone(),
                page_index: chunk.chunk.page_index,
                chunk_index: chunk.chunk.chunk_index,
                title: chunk.chunk.metadata.title.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QdrantPayload {
    pub chunk_id: String,
    pub source_tag: String,
    pub page_index: usize,
    pub chunk_index: usize,
    #[serde(default)]
    pub title: String,
}

#[derive(Debug, Deserialize)]
struct QdrantSearchResponse {
    result: Vec<QdrantResultPoint>,
}

#[derive(Debug, Deserialize)]
struct QdrantResultPoint {
    score: f32,
    payload: Option<QdrantPayload>,
}
