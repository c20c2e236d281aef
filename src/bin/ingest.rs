use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use policy_chatbot::config::AppConfig;
use policy_chatbot::db::Database;
use policy_chatbot::ingest::Ingestor;
use policy_chatbot::models::IngestRequest;
use policy_chatbot::ollama::OllamaClient;
use policy_chatbot::qdrant_store::QdrantStore;

#[derive(Parser, Debug)]
#[command(name = "ingest")]
#[command(about = "Extract, chunk, embed and index a policy PDF")]
struct Cli {
    #[arg(long)]
    pdf: String,
    /// Re-ingest even if the PDF hash matches the latest manifest.
    #[arg(long, default_value_t = false)]
    rebuild: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let config = AppConfig::from_env();
    let db = Database::new(&config).await?;
    let ollama = OllamaClient::new(config.ollama_base_url.clone());
    let qdrant = QdrantStore::new(
        config.qdrant_base_url.clone(),
        config.qdrant_collection.clone(),
    );
    let ingestor = Ingestor::new(config, db, ollama, qdrant);

    let req = IngestRequest {
        pdf_path: cli.pdf,
        rebuild: cli.rebuild,
    };

    let job_id = format!("cli-{}", uuid::Uuid::new_v4());
    let result = ingestor
        .ingest(&job_id, req, |status| {
            println!(
                "[{}] {} pages={} chunks={} {}",
                status.status,
                status.stage,
                status.page_count,
                status.chunk_count,
                status.message.unwrap_or_default()
            );
        })
        .await?;

    println!(
        "Ingest complete. skipped={} pages={} chunks={}",
        result.skipped, result.page_count, result.chunk_count
    );

    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
