pub mod chunker;
pub mod clean;
pub mod pdf;

use std::io::ErrorKind;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::db::Database;
use crate::error::IngestError;
use crate::models::{Document, IndexedChunk, IngestManifest, IngestRequest, IngestStatus};
use crate::ollama::OllamaClient;
use crate::qdrant_store::{QdrantPoint, QdrantStore};

use self::chunker::DocumentChunker;
use self::clean::DEFAULT_PASSES;

const UPSERT_BATCH_SIZE: usize = 64;

#[derive(Clone)]
pub struct Ingestor {
    config: AppConfig,
    db: Database,
    ollama: OllamaClient,
    qdrant: QdrantStore,
}

#[derive(Debug, Clone)]
pub struct IngestResult {
    pub page_count: i64,
    pub chunk_count: i64,
    pub skipped: bool,
}

impl Ingestor {
    pub fn new(config: AppConfig, db: Database, ollama: OllamaClient, qdrant: QdrantStore) -> Self {
        Self {
            config,
            db,
            ollama,
            qdrant,
        }
    }

    pub async fn ingest<F>(
        &self,
        job_id: &str,
        request: IngestRequest,
        mut progress: F,
    ) -> Result<IngestResult>
    where
        F: FnMut(IngestStatus) + Send,
    {
        // Fail on a bad chunking config before touching any index.
        let chunker = DocumentChunker::new(self.config.chunking.clone())?;

        let now = Utc::now();
        let mut status = IngestStatus {
            job_id: job_id.to_string(),
            status: "running".to_string(),
            stage: "hashing_source".to_string(),
            message: None,
            page_count: 0,
            chunk_count: 0,
            started_at: now,
            updated_at: now,
        };
        self.report(&status, &mut progress).await?;

        let pdf_path = Path::new(&request.pdf_path);
        let pdf_hash = file_sha256(pdf_path).await?;

        if !request.rebuild {
            if let Some(latest) = self.db.latest_manifest().await? {
                if latest.pdf_hash == pdf_hash {
                    status.status = "completed".to_string();
                    status.stage = "skipped_unchanged".to_string();
                    status.message = Some("Source PDF unchanged; skipped re-ingest.".to_string());
                    status.page_count = latest.page_count;
                    status.chunk_count = latest.chunk_count;
                    self.report(&status, &mut progress).await?;

                    return Ok(IngestResult {
                        page_count: latest.page_count,
                        chunk_count: latest.chunk_count,
                        skipped: true,
                    });
                }
            }
        }

        status.stage = "extracting_pdf".to_string();
        self.report(&status, &mut progress).await?;

        let document = pdf::extract_document(pdf_path).await?;
        status.page_count = document.pages.len() as i64;

        status.stage = "chunking".to_string();
        self.report(&status, &mut progress).await?;

        let chunks = prepare_chunks(&document, &chunker);
        if chunks.is_empty() {
            return Err(IngestError::Extraction(format!(
                "no chunks produced from {}",
                pdf_path.display()
            ))
            .into());
        }
        status.chunk_count = chunks.len() as i64;

        status.stage = "embedding_and_indexing".to_string();
        self.report(&status, &mut progress).await?;

        let mut points = Vec::with_capacity(chunks.len());
        for chunk in &chunks {
            let embedding = self
                .ollama
                .embed(&self.config.models.embedding_model, &chunk.chunk.content)
                .await
                .with_context(|| format!("failed embedding for chunk {}", chunk.chunk.source_tag))?;
            points.push(QdrantPoint::for_chunk(chunk, embedding));
        }

        if let Some(first) = points.first() {
            self.qdrant.recreate_collection(first.vector.len()).await?;
        }
        for batch in points.chunks(UPSERT_BATCH_SIZE) {
            self.qdrant.upsert_points(batch).await?;
        }

        self.db.replace_chunks(&chunks).await?;
        self.db
            .record_manifest(&IngestManifest {
                pdf_hash,
                created_at: Utc::now(),
                page_count: status.page_count,
                chunk_count: status.chunk_count,
            })
            .await?;

        status.status = "completed".to_string();
        status.stage = "done".to_string();
        self.report(&status, &mut progress).await?;

        tracing::info!(
            job_id,
            pages = status.page_count,
            chunks = status.chunk_count,
            "ingested {}",
            pdf_path.display()
        );

        Ok(IngestResult {
            page_count: status.page_count,
            chunk_count: status.chunk_count,
            skipped: false,
        })
    }

    async fn report<F>(&self, status: &IngestStatus, progress: &mut F) -> Result<()>
    where
        F: FnMut(IngestStatus) + Send,
    {
        let mut status = status.clone();
        status.updated_at = Utc::now();
        tracing::debug!(job_id = %status.job_id, stage = %status.stage, "ingest progress");
        progress(status.clone());
        self.db.upsert_ingest_status(&status).await
    }
}

/// Cleans and chunks every page, dropping chunks with nothing to embed.
fn prepare_chunks(document: &Document, chunker: &DocumentChunker) -> Vec<IndexedChunk> {
    let cleaned = Document {
        metadata: document.metadata.clone(),
        pages: clean::clean_pages(&document.pages, &DEFAULT_PASSES),
    };

    chunker
        .chunk(&cleaned)
        .into_iter()
        .filter(|chunk| !chunk.content.trim().is_empty())
        .map(|chunk| IndexedChunk {
            id: Uuid::new_v4().to_string(),
            chunk,
        })
        .collect()
}

async fn file_sha256(path: &Path) -> Result<String> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Err(IngestError::FileNotFound(path.to_path_buf()).into());
        }
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed reading file for hash: {}", path.display()));
        }
    };

    let mut hasher = Sha256::new();
    hasher.update(bytes);
    Ok(format!("{:x}", hasher.finalize()))
}
