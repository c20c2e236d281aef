use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Semaphore;
use tracing_subscriber::EnvFilter;

use policy_chatbot::chat::ChatService;
use policy_chatbot::db::Database;
use policy_chatbot::ingest::Ingestor;
use policy_chatbot::ollama::OllamaClient;
use policy_chatbot::qdrant_store::QdrantStore;
use policy_chatbot::retrieval::Retriever;
use policy_chatbot::{run_server, AppConfig};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = AppConfig::from_env();
    let db = Database::new(&config).await?;
    let ollama = OllamaClient::new(config.ollama_base_url.clone());
    let qdrant = QdrantStore::new(
        config.qdrant_base_url.clone(),
        config.qdrant_collection.clone(),
    );

    let retriever = Retriever::new(
        db.clone(),
        qdrant.clone(),
        ollama.clone(),
        config.models.embedding_model.clone(),
    );

    let generation_limit = Arc::new(Semaphore::new(config.generation_permits));

    let chat = ChatService::new(
        config.clone(),
        db.clone(),
        ollama.clone(),
        retriever,
        generation_limit,
    );

    let ingestor = Ingestor::new(config.clone(), db.clone(), ollama, qdrant);

    run_server(config, db, chat, ingestor).await
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
