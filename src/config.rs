use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use crate::history::WindowConfig;
use crate::ingest::chunker::{ChunkingConfig, DEFAULT_SEPARATORS};

#[derive(Clone, Debug)]
pub struct ModelConfig {
    pub answer_model: String,
    pub embedding_model: String,
    pub temperature: f32,
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub bind_addr: String,
    pub data_dir: PathBuf,
    /// Required for the HTTP ingest endpoints; they are disabled when unset.
    pub admin_api_key: Option<String>,
    pub ollama_base_url: String,
    pub qdrant_base_url: String,
    pub qdrant_collection: String,
    pub models: ModelConfig,
    pub window: WindowConfig,
    pub chunking: ChunkingConfig,
    pub retrieval_top_k: usize,
    pub generation_permits: usize,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let data_dir = env::var("POLICY_CHATBOT_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data"));

        let window_defaults = WindowConfig::default();
        let chunking_defaults = ChunkingConfig::default();

        Self {
            bind_addr: env::var("POLICY_CHATBOT_BIND")
                .unwrap_or_else(|_| "127.0.0.1:3000".to_string()),
            data_dir,
            admin_api_key: env::var("POLICY_CHATBOT_ADMIN_KEY")
                .ok()
                .map(|key| key.trim().to_string())
                .filter(|key| !key.is_empty()),
            ollama_base_url: env::var("OLLAMA_BASE_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:11434".to_string()),
            qdrant_base_url: env::var("QDRANT_BASE_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:6333".to_string()),
            qdrant_collection: env::var("QDRANT_COLLECTION")
                .unwrap_or_else(|_| "terms_of_service".to_string()),
            models: ModelConfig {
                answer_model: env::var("ANSWER_MODEL")
                    .unwrap_or_else(|_| "llama3.1:8b-instruct".to_string()),
                embedding_model: env::var("EMBEDDING_MODEL")
                    .unwrap_or_else(|_| "mxbai-embed-large".to_string()),
                temperature: env_parse("ANSWER_TEMPERATURE", 0.0),
            },
            window: WindowConfig {
                max_model_tokens: env_parse("MAX_MODEL_TOKENS", window_defaults.max_model_tokens),
                reserved_response_tokens: env_parse(
                    "RESERVED_RESPONSE_TOKENS",
                    window_defaults.reserved_response_tokens,
                ),
                tokens_per_message: env_parse(
                    "TOKENS_PER_MESSAGE",
                    window_defaults.tokens_per_message,
                ),
                tokens_per_role: env_parse("TOKENS_PER_ROLE", window_defaults.tokens_per_role),
                reply_priming_tokens: env_parse(
                    "REPLY_PRIMING_TOKENS",
                    window_defaults.reply_priming_tokens,
                ),
                soft_limit_ratio: env_parse("SOFT_LIMIT_RATIO", window_defaults.soft_limit_ratio),
                hard_limit_ratio: env_parse("HARD_LIMIT_RATIO", window_defaults.hard_limit_ratio),
            },
            chunking: ChunkingConfig {
                max_chunk_size: env_parse("CHUNK_MAX_CHARS", chunking_defaults.max_chunk_size),
                overlap: env_parse("CHUNK_OVERLAP_CHARS", chunking_defaults.overlap),
                separators: parse_separators(env::var("CHUNK_SEPARATORS").ok().as_deref()),
            },
            retrieval_top_k: env_parse("RETRIEVAL_TOP_K", 4),
            generation_permits: env_parse::<usize>("GENERATION_PERMITS", 1).max(1),
        }
    }

    pub fn sqlite_dsn(&self) -> String {
        format!(
            "sqlite://{}",
            self.data_dir.join("policy_chatbot.sqlite3").display()
        )
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Separators come in as a JSON string array, e.g. `["\n\n", "\n", " ", ""]`.
pub fn parse_separators(raw: Option<&str>) -> Vec<String> {
    raw.and_then(|value| serde_json::from_str::<Vec<String>>(value).ok())
        .filter(|separators| !separators.is_empty())
        .unwrap_or_else(|| DEFAULT_SEPARATORS.iter().map(|s| s.to_string()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn separators_default_when_unset_or_invalid() {
        let defaults: Vec<String> = DEFAULT_SEPARATORS.iter().map(|s| s.to_string()).collect();
        assert_eq!(parse_separators(None), defaults);
        assert_eq!(parse_separators(Some("not json")), defaults);
        assert_eq!(parse_separators(Some("[]")), defaults);
    }

    #[test]
    fn separators_parse_json_array() {
        let parsed = parse_separators(Some(r#"["\n", ". ", ""]"#));
        assert_eq!(parsed, vec!["\n".to_string(), ". ".to_string(), String::new()]);
    }
}
