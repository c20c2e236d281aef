//! Token-budgeted windowing of a user's conversation history.
//!
//! The newest messages are kept first. Budget accounting follows the chat
//! completion framing: every message pays a fixed per-message and per-role
//! cost on top of its content, and the pending reply pays a priming cost.

use crate::error::ChatError;
use crate::models::Message;
use crate::tokens::TokenCounter;

#[derive(Clone, Debug, PartialEq)]
pub struct WindowConfig {
    pub max_model_tokens: usize,
    pub reserved_response_tokens: usize,
    pub tokens_per_message: usize,
    pub tokens_per_role: usize,
    pub reply_priming_tokens: usize,
    /// History is only admitted while the running total stays below this share.
    pub soft_limit_ratio: f64,
    /// Requests at or above this share of the context are rejected.
    pub hard_limit_ratio: f64,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            max_model_tokens: 4_096,
            reserved_response_tokens: 500,
            tokens_per_message: 4,
            tokens_per_role: 1,
            reply_priming_tokens: 2,
            soft_limit_ratio: 0.8,
            hard_limit_ratio: 0.9,
        }
    }
}

impl WindowConfig {
    pub fn message_overhead(&self) -> usize {
        self.tokens_per_message + self.tokens_per_role
    }

    fn soft_limit(&self) -> f64 {
        self.max_model_tokens as f64 * self.soft_limit_ratio
    }

    fn hard_limit(&self) -> f64 {
        self.max_model_tokens as f64 * self.hard_limit_ratio
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HistoryWindow {
    /// Chronological order.
    pub messages: Vec<Message>,
    pub used_tokens: usize,
}

pub fn window_history<C>(
    question: &str,
    history: &[Message],
    config: &WindowConfig,
    counter: &C,
) -> Result<HistoryWindow, ChatError>
where
    C: TokenCounter + ?Sized,
{
    let mut used = config.reserved_response_tokens + config.reply_priming_tokens;
    used += config.message_overhead() + counter.count_tokens(question);

    let soft_limit = config.soft_limit();
    let mut kept = 0;
    for message in history.iter().rev() {
        let cost = counter.count_tokens(&message.content) + config.message_overhead();
        if ((used + cost) as f64) >= soft_limit {
            break;
        }
        used += cost;
        kept += 1;
    }

    if used as f64 >= config.hard_limit() {
        return Err(ChatError::QuestionTooLarge {
            used,
            limit: config.hard_limit().floor() as usize,
        });
    }

    let messages = history[history.len() - kept..].to_vec();
    tracing::debug!(
        kept,
        dropped = history.len() - kept,
        used_tokens = used,
        "windowed conversation history"
    );

    Ok(HistoryWindow {
        messages,
        used_tokens: used,
    })
}
