use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use tokio::sync::Semaphore;

use crate::config::AppConfig;
use crate::db::Database;
use crate::history::{window_history, HistoryWindow, WindowConfig};
use crate::models::{Message, RetrievalResult};
use crate::ollama::{ChatMessage, ChatOptions, OllamaClient};
use crate::retrieval::Retriever;
use crate::tokens::{ApproximateTokenCounter, TokenCounter};

pub const NOT_FOUND_MESSAGE: &str =
    "I could not find anything about that in the Terms of Service.";

type UserLocks = Arc<Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>>;

#[derive(Clone)]
pub struct ChatService {
    config: AppConfig,
    db: Database,
    ollama: OllamaClient,
    retriever: Retriever,
    generation_limit: Arc<Semaphore>,
    token_counter: Arc<dyn TokenCounter + Send + Sync>,
    user_locks: UserLocks,
}

/// Messages for one model call and their token cost, reply reservation included.
struct PreparedRequest {
    messages: Vec<ChatMessage>,
    sources: usize,
    total_tokens: usize,
}

impl ChatService {
    pub fn new(
        config: AppConfig,
        db: Database,
        ollama: OllamaClient,
        retriever: Retriever,
        generation_limit: Arc<Semaphore>,
    ) -> Self {
        Self {
            config,
            db,
            ollama,
            retriever,
            generation_limit,
            token_counter: Arc::new(ApproximateTokenCounter),
            user_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_token_counter(mut self, counter: Arc<dyn TokenCounter + Send + Sync>) -> Self {
        self.token_counter = counter;
        self
    }

    /// Answers `question` for `user_id` and records the exchange.
    ///
    /// Fails with [`crate::error::ChatError::QuestionTooLarge`] (inside the
    /// `anyhow::Error`) before retrieval when the question cannot fit.
    pub async fn answer(&self, user_id: i64, question: &str) -> Result<String> {
        let user_lock = self.user_lock(user_id)?;
        let result = {
            let _guard = user_lock.lock().await;
            self.answer_exclusive(user_id, question).await
        };
        drop(user_lock);
        self.release_user_lock(user_id);
        result
    }

    async fn answer_exclusive(&self, user_id: i64, question: &str) -> Result<String> {
        let history = self.db.load_history(user_id).await?;
        let window = window_history(
            question,
            &history,
            &self.config.window,
            self.token_counter.as_ref(),
        )?;

        let retrieved = self
            .retriever
            .retrieve(question, self.config.retrieval_top_k)
            .await?;
        let retrieved_count = retrieved.len();

        let prepared = prepare_request(
            question,
            &window,
            retrieved,
            &self.config.window,
            self.token_counter.as_ref(),
        );

        let (answer, sources) = match prepared {
            None => {
                tracing::info!(
                    user_id,
                    retrieved = retrieved_count,
                    "no context fits; replying with not-found message"
                );
                (NOT_FOUND_MESSAGE.to_string(), 0)
            }
            Some(request) => {
                tracing::debug!(
                    user_id,
                    total_tokens = request.total_tokens,
                    "prepared model request"
                );
                let _permit = self.generation_limit.acquire().await?;
                let answer = self
                    .ollama
                    .chat(
                        &self.config.models.answer_model,
                        &request.messages,
                        ChatOptions {
                            num_predict: self.config.window.reserved_response_tokens,
                            temperature: self.config.models.temperature,
                        },
                    )
                    .await?;
                (answer, request.sources)
            }
        };

        self.db
            .append_messages(
                user_id,
                &[Message::user(question), Message::assistant(answer.clone())],
            )
            .await?;

        tracing::info!(
            user_id,
            history_kept = window.messages.len(),
            history_total = history.len(),
            used_tokens = window.used_tokens,
            sources,
            "answered question"
        );

        Ok(answer)
    }

    fn user_lock(&self, user_id: i64) -> Result<Arc<tokio::sync::Mutex<()>>> {
        let mut locks = self
            .user_locks
            .lock()
            .map_err(|_| anyhow::anyhow!("user lock table poisoned"))?;
        Ok(locks.entry(user_id).or_default().clone())
    }

    /// Drops the user's lock entry once no other exchange holds or awaits it.
    fn release_user_lock(&self, user_id: i64) {
        let Ok(mut locks) = self.user_locks.lock() else {
            return;
        };
        if locks
            .get(&user_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&user_id);
        }
    }
}

/// Builds the model request, keeping only the sources whose system prompt
/// fits in what the windowed history leaves of `max_model_tokens`.
///
/// Returns `None` when no source fits.
fn prepare_request<C>(
    question: &str,
    window: &HistoryWindow,
    retrieved: Vec<RetrievalResult>,
    config: &WindowConfig,
    counter: &C,
) -> Option<PreparedRequest>
where
    C: TokenCounter + ?Sized,
{
    let budget = config
        .max_model_tokens
        .saturating_sub(window.used_tokens + config.message_overhead());
    let retrieved_count = retrieved.len();
    let sources = fit_sources(retrieved, budget, counter);
    if sources.is_empty() {
        return None;
    }
    if sources.len() < retrieved_count {
        tracing::debug!(
            kept = sources.len(),
            dropped = retrieved_count - sources.len(),
            budget,
            "trimmed retrieved context to token budget"
        );
    }

    let system_prompt = build_system_prompt(&sources);
    let total_tokens =
        window.used_tokens + config.message_overhead() + counter.count_tokens(&system_prompt);

    let mut messages = Vec::with_capacity(window.messages.len() + 2);
    messages.push(ChatMessage::system(system_prompt));
    messages.extend(window.messages.iter().map(ChatMessage::from));
    messages.push(ChatMessage::user(question));

    Some(PreparedRequest {
        messages,
        sources: sources.len(),
        total_tokens,
    })
}

/// Best-first greedy fill; a source that does not fit is skipped, not fatal.
fn fit_sources<C>(
    sources: Vec<RetrievalResult>,
    budget: usize,
    counter: &C,
) -> Vec<RetrievalResult>
where
    C: TokenCounter + ?Sized,
{
    let mut kept = Vec::with_capacity(sources.len());
    for source in sources {
        kept.push(source);
        if counter.count_tokens(&build_system_prompt(&kept)) > budget {
            kept.pop();
        }
    }
    kept
}

fn build_context(sources: &[RetrievalResult]) -> String {
    let mut context = String::new();
    for (idx, source) in sources.iter().enumerate() {
        context.push_str(&format!(
            "[{}] ({})\n{}\n\n",
            idx + 1,
            source.chunk.chunk.source_tag,
            source.chunk.chunk.content.trim()
        ));
    }
    context
}

fn build_system_prompt(sources: &[RetrievalResult]) -> String {
    let title = sources
        .iter()
        .map(|s| s.chunk.chunk.metadata.title.trim())
        .find(|t| !t.is_empty())
        .unwrap_or("Terms of Service");

    format!(
        "You are a customer support assistant answering questions about the document \"{title}\".\n\
         Rules: Answer only from the context below. If the context does not contain the answer, \
         say you could not find it in the document. Do not invent policies, prices or dates. \
         Mention the source tag, e.g. (p3-1), of the passages you rely on.\n\n\
         Context:\n{}",
        build_context(sources)
    )
}
