use careassist_common::{Error, Result};
use careassist_config::BudgetConfig;
use serde::Serialize;
use tracing::debug;

use crate::providers::ChatMessage;

/// Framing overhead charged per history message (role markers, separators).
pub const MESSAGE_OVERHEAD_TOKENS: u32 = 4;

/// Rough token estimate: ~4 characters per token, rounded up.
pub fn estimate_tokens(text: &str) -> u32 {
    let chars = u32::try_from(text.chars().count()).unwrap_or(u32::MAX);
    chars.div_ceil(4)
}

fn history_cost(message: &ChatMessage) -> u32 {
    estimate_tokens(&message.content) + MESSAGE_OVERHEAD_TOKENS
}

/// Estimated token spend per prompt segment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TokenUsage {
    pub system: u32,
    pub context: u32,
    pub history: u32,
    pub user: u32,
    pub total: u32,
    /// Tokens available for the prompt: ceiling minus response reserve.
    pub budget: u32,
    pub remaining: u32,
}

/// Prompt segments that fit the budget.
#[derive(Debug, Clone)]
pub struct AllocatedPrompt {
    pub system: String,
    pub context: String,
    pub history: Vec<ChatMessage>,
    pub user: String,
    pub usage: TokenUsage,
    pub dropped_history: usize,
    pub context_truncated: bool,
}

/// Splits the model's context window between system prompt, page context,
/// conversation history and the new user message. System and user text are
/// never trimmed.
#[derive(Debug, Clone)]
pub struct TokenBudgetAllocator {
    config: BudgetConfig,
}

impl TokenBudgetAllocator {
    pub fn new(config: BudgetConfig) -> Self {
        Self { config }
    }

    /// Tokens available for the prompt.
    pub fn available(&self) -> u32 {
        self.config
            .max_context_tokens
            .saturating_sub(self.config.response_reserve)
    }

    pub fn allocate(
        &self,
        system: &str,
        context: &str,
        history: &[ChatMessage],
        user: &str,
    ) -> Result<AllocatedPrompt> {
        let available = self.available();
        let system_tokens = estimate_tokens(system);
        let user_tokens = estimate_tokens(user);
        let fixed = system_tokens.saturating_add(user_tokens);
        if fixed > available {
            return Err(Error::BudgetExceeded(format!(
                "message needs {fixed} tokens with the system prompt but only {available} are available"
            )));
        }
        let mut remaining = available - fixed;

        let context_allowance = share(available, self.config.context_share).min(remaining);
        let (context, context_truncated) = truncate_to_tokens(context, context_allowance);
        let context_tokens = estimate_tokens(&context);
        remaining -= context_tokens;

        let history_allowance = share(available, self.config.history_share).min(remaining);
        let window_start = history
            .len()
            .saturating_sub(self.config.max_history_messages);
        let window = &history[window_start..];

        let mut history_tokens = 0u32;
        let mut keep_from = window.len();
        for (index, message) in window.iter().enumerate().rev() {
            let cost = history_cost(message);
            if history_tokens + cost > history_allowance {
                break;
            }
            history_tokens += cost;
            keep_from = index;
        }
        let kept: Vec<ChatMessage> = window[keep_from..].to_vec();
        let dropped_history = history.len() - kept.len();

        let total = fixed + context_tokens + history_tokens;
        let usage = TokenUsage {
            system: system_tokens,
            context: context_tokens,
            history: history_tokens,
            user: user_tokens,
            total,
            budget: available,
            remaining: available - total,
        };
        if dropped_history > 0 || context_truncated {
            debug!(
                dropped_history,
                context_truncated, total, available, "prompt trimmed to fit token budget"
            );
        }

        Ok(AllocatedPrompt {
            system: system.to_string(),
            context,
            history: kept,
            user: user.to_string(),
            usage,
            dropped_history,
            context_truncated,
        })
    }
}

fn share(available: u32, fraction: f64) -> u32 {
    (f64::from(available) * fraction).floor().max(0.0) as u32
}

/// Keep the beginning of `text` so its estimate stays within `max_tokens`.
fn truncate_to_tokens(text: &str, max_tokens: u32) -> (String, bool) {
    if estimate_tokens(text) <= max_tokens {
        return (text.to_string(), false);
    }
    let max_chars = max_tokens as usize * 4;
    (text.chars().take(max_chars).collect(), true)
}
