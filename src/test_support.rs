use std::path::Path;
use std::sync::Arc;

use axum::routing::post;
use axum::{Json, Router};
use serde_json::json;
use tempfile::TempDir;
use tokio::sync::Semaphore;

use crate::chat::ChatService;
use crate::config::{AppConfig, ModelConfig};
use crate::db::Database;
use crate::history::WindowConfig;
use crate::ingest::chunker::ChunkingConfig;
use crate::ingest::Ingestor;
use crate::models::{source_tag, Chunk, DocumentMetadata, IndexedChunk};
use crate::ollama::OllamaClient;
use crate::qdrant_store::QdrantStore;
use crate::retrieval::Retriever;

/// Nothing listens on the discard port, so any request fails fast.
pub const UNREACHABLE_URL: &str = "http://127.0.0.1:9";
pub const COLLECTION: &str = "terms_of_service";

pub fn sqlite_dsn(dir: &Path) -> String {
    format!("sqlite://{}", dir.join("test.sqlite3").display())
}

pub async fn temp_database() -> (TempDir, Database) {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::connect(&sqlite_dsn(dir.path())).await.unwrap();
    (dir, db)
}

pub async fn register_user(db: &Database) -> i64 {
    let api_key = db.register_api_key().await.unwrap();
    db.resolve_user(&api_key).await.unwrap().unwrap()
}

pub fn config(data_dir: &Path, backend_url: &str) -> AppConfig {
    AppConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        data_dir: data_dir.to_path_buf(),
        admin_api_key: None,
        ollama_base_url: backend_url.to_string(),
        qdrant_base_url: backend_url.to_string(),
        qdrant_collection: COLLECTION.to_string(),
        models: ModelConfig {
            answer_model: "test-answer".to_string(),
            embedding_model: "test-embed".to_string(),
            temperature: 0.0,
        },
        window: WindowConfig::default(),
        chunking: ChunkingConfig::default(),
        retrieval_top_k: 4,
        generation_permits: 1,
    }
}

fn clients(config: &AppConfig) -> (OllamaClient, QdrantStore) {
    (
        OllamaClient::new(config.ollama_base_url.clone()),
        QdrantStore::new(
            config.qdrant_base_url.clone(),
            config.qdrant_collection.clone(),
        ),
    )
}

pub fn chat_service(config: &AppConfig, db: &Database) -> ChatService {
    let (ollama, qdrant) = clients(config);
    let retriever = Retriever::new(
        db.clone(),
        qdrant,
        ollama.clone(),
        config.models.embedding_model.clone(),
    );
    ChatService::new(
        config.clone(),
        db.clone(),
        ollama,
        retriever,
        Arc::new(Semaphore::new(config.generation_permits)),
    )
}

pub fn ingestor(config: &AppConfig, db: &Database) -> Ingestor {
    let (ollama, qdrant) = clients(config);
    Ingestor::new(config.clone(), db.clone(), ollama, qdrant)
}

pub fn indexed_chunk(id: &str, content: &str) -> IndexedChunk {
    IndexedChunk {
        id: id.to_string(),
        chunk: Chunk {
            content: content.to_string(),
            page_index: 0,
            chunk_index: 0,
            source_tag: source_tag(0, 0),
            start_offset: 0,
            metadata: DocumentMetadata {
                title: "Terms of Service".to_string(),
                ..DocumentMetadata::default()
            },
        },
    }
}

/// Serves the Ollama embed/chat routes and the Qdrant search route on a
/// local port. Search returns `hit` as the only point, or nothing.
pub async fn spawn_backend(hit: Option<&str>, reply: &str) -> String {
    let points = match hit {
        Some(chunk_id) => json!([{
            "id": chunk_id,
            "score": 0.92,
            "payload": {
                "chunk_id": chunk_id,
                "source_tag": "p0-0",
                "page_index": 0,
                "chunk_index": 0
            }
        }]),
        None => json!([]),
    };
    let search = json!({ "result": points });
    let chat = json!({ "message": { "role": "assistant", "content": reply } });

    let app = Router::new()
        .route(
            "/api/embed",
            post(|| async { Json(json!({ "embeddings": [[0.1, 0.2, 0.3]] })) }),
        )
        .route(
            "/api/chat",
            post(move || {
                let body = chat.clone();
                async move { Json(body) }
            }),
        )
        .route(
            &format!("/collections/{COLLECTION}/points/search"),
            post(move || {
                let body = search.clone();
                async move { Json(body) }
            }),
        );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}
