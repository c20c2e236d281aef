use anyhow::Result;
use clap::{ArgGroup, Parser};
use tracing_subscriber::EnvFilter;

use policy_chatbot::config::AppConfig;
use policy_chatbot::db::Database;

#[derive(Parser, Debug)]
#[command(name = "keys")]
#[command(about = "Manage API keys for the chat endpoint")]
#[command(group(ArgGroup::new("action").required(true).multiple(true).args(["list", "register"])))]
struct Cli {
    /// Print every registered API key.
    #[arg(long)]
    list: bool,
    /// Create a new user and print its API key.
    #[arg(long)]
    register: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let config = AppConfig::from_env();
    let db = Database::new(&config).await?;

    if cli.register {
        let api_key = db.register_api_key().await?;
        tracing::info!("registered new user");
        println!("{api_key}");
    }

    if cli.list {
        let keys = db.list_api_keys().await?;
        if keys.is_empty() {
            println!("No API keys registered.");
        }
        for key in keys {
            println!("{key}");
        }
    }

    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
