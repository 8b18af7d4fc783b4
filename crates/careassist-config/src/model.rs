use std::time::Duration;

use careassist_common::{Error, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub gateway: GatewayConfig,
    pub llm: LlmConfig,
    pub retry: RetryConfig,
    pub budget: BudgetConfig,
    pub idempotency: IdempotencyConfig,
    pub chat: ChatConfig,
    pub database: DatabaseConfig,
    pub subjects: Vec<SubjectGrant>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// Shared bearer token required from the portal front-end when set.
    pub api_key: Option<String>,
    /// Overall deadline for one mutating request, independent of provider retries.
    pub request_timeout_secs: u64,
    pub rate_limit: RateLimitConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3888,
            api_key: None,
            request_timeout_secs: 30,
            rate_limit: RateLimitConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub per_second: u64,
    pub burst_size: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            per_second: 1,
            burst_size: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Registry name: `anthropic`, `openai` or `ollama`.
    pub provider: String,
    pub model: Option<String>,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    /// Per-attempt HTTP timeout.
    pub timeout_secs: u64,
    pub max_tokens: u32,
    pub temperature: Option<f64>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: None,
            api_key: None,
            base_url: None,
            timeout_secs: 20,
            max_tokens: 1024,
            temperature: Some(0.2),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Fraction of each delay that may be randomly shaved off (0 disables jitter).
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 250,
            max_delay_ms: 4_000,
            multiplier: 2.0,
            jitter: 0.0,
        }
    }
}

impl RetryConfig {
    /// Sum of the un-jittered delays slept between attempts.
    pub fn total_backoff(&self) -> Duration {
        let mut delay = self.base_delay_ms as f64;
        let mut total = 0.0;
        for _ in 0..self.max_retries {
            total += delay.min(self.max_delay_ms as f64);
            delay *= self.multiplier.max(1.0);
        }
        Duration::from_secs_f64(total / 1_000.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    pub max_context_tokens: u32,
    pub response_reserve: u32,
    pub context_share: f64,
    pub history_share: f64,
    pub max_history_messages: usize,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_context_tokens: 6_000,
            response_reserve: 2_000,
            context_share: 0.35,
            history_share: 0.25,
            max_history_messages: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdempotencyConfig {
    pub retention_hours: u64,
    /// A `pending` claim older than this may be taken over by a new delivery
    /// once no task in this process holds it. Must exceed two worst-case turns.
    pub pending_ttl_secs: u64,
    pub purge_interval_secs: u64,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            retention_hours: 48,
            pending_ttl_secs: 300,
            purge_interval_secs: 3_600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    pub system_prompt: String,
    pub history_page_size: usize,
    /// Hard cap on one user message, checked before any token estimate. At
    /// roughly four chars per token the default stays well inside the default
    /// prompt budget, so `413 budget_exceeded` only appears when the budget is
    /// configured tighter than this cap or the system prompt is very long.
    pub max_message_chars: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            system_prompt: "You are a careful healthcare assistant inside a patient portal. \
                Answer questions about the patient's own records using the context provided. \
                Do not diagnose; recommend contacting a clinician for medical decisions."
                .to_string(),
            history_page_size: 20,
            max_message_chars: 4_000,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite file; `None` resolves to `~/.careassist/careassist.db`.
    pub path: Option<String>,
}

/// Grants a portal user access to a family member's records.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubjectGrant {
    pub user_id: String,
    pub subject_id: String,
}

impl AppConfig {
    /// Longest one provider turn can hold a session: every attempt timing out
    /// plus the backoff between them.
    pub fn worst_case_turn(&self) -> Duration {
        let attempts = u64::from(self.retry.max_retries) + 1;
        Duration::from_secs(attempts.saturating_mul(self.llm.timeout_secs))
            + self.retry.total_backoff()
    }

    /// Reject settings that would make the orchestrator misbehave at runtime.
    pub fn validate(&self) -> Result<()> {
        let budget = &self.budget;
        if budget.response_reserve >= budget.max_context_tokens {
            return Err(Error::Config(format!(
                "budget.response_reserve ({}) must be below budget.max_context_tokens ({})",
                budget.response_reserve, budget.max_context_tokens
            )));
        }
        for (name, share) in [
            ("context_share", budget.context_share),
            ("history_share", budget.history_share),
        ] {
            if !(share > 0.0 && share < 1.0) {
                return Err(Error::Config(format!(
                    "budget.{name} must be between 0 and 1, got {share}"
                )));
            }
        }
        if budget.context_share + budget.history_share >= 1.0 {
            return Err(Error::Config(
                "budget.context_share + budget.history_share must leave room for the prompt"
                    .to_string(),
            ));
        }
        if budget.max_history_messages == 0 {
            return Err(Error::Config(
                "budget.max_history_messages must be at least 1".to_string(),
            ));
        }

        let retry = &self.retry;
        if retry.multiplier < 1.0 {
            return Err(Error::Config(format!(
                "retry.multiplier must be >= 1.0, got {}",
                retry.multiplier
            )));
        }
        if !(0.0..=1.0).contains(&retry.jitter) {
            return Err(Error::Config(format!(
                "retry.jitter must be between 0 and 1, got {}",
                retry.jitter
            )));
        }
        if retry.base_delay_ms > retry.max_delay_ms {
            return Err(Error::Config(
                "retry.base_delay_ms must not exceed retry.max_delay_ms".to_string(),
            ));
        }

        let rl = &self.gateway.rate_limit;
        if rl.enabled && (rl.per_second == 0 || rl.burst_size == 0) {
            return Err(Error::Config(
                "gateway.rate_limit.per_second and burst_size must be non-zero".to_string(),
            ));
        }
        if self.gateway.request_timeout_secs == 0 {
            return Err(Error::Config(
                "gateway.request_timeout_secs must be non-zero".to_string(),
            ));
        }
        // One turn queued behind another on the same session lock stays
        // pending for up to two worst-case turns.
        let pending_floor = self.worst_case_turn() * 2;
        if Duration::from_secs(self.idempotency.pending_ttl_secs) <= pending_floor {
            return Err(Error::Config(format!(
                "idempotency.pending_ttl_secs ({}) must exceed {}s, twice the worst-case provider turn",
                self.idempotency.pending_ttl_secs,
                pending_floor.as_secs_f64().ceil()
            )));
        }
        if self.llm.provider.trim().is_empty() {
            return Err(Error::Config("llm.provider must be set".to_string()));
        }
        Ok(())
    }
}
