pub mod chat;
pub mod config;
pub mod db;
pub mod error;
pub mod history;
pub mod ingest;
pub mod models;
pub mod ollama;
pub mod qdrant_store;
pub mod retrieval;
pub mod server;
pub mod tokens;

pub use config::AppConfig;
pub use server::run_server;

#[cfg(test)]
mod test_support;
