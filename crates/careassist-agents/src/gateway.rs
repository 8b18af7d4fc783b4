use std::sync::Arc;
use std::time::{Duration, Instant};

use careassist_common::{Error, MessageMeta, ProviderError, Result, TokenCounts};
use careassist_config::{LlmConfig, RetryConfig};
use tracing::{info, warn};

use crate::budget::estimate_tokens;
use crate::providers::{
    AnthropicProvider, ChatMessage, LlmProvider, LlmRequest, OllamaProvider, OpenAiProvider,
};
use crate::retry::RetryPolicy;

/// Provider names accepted in `llm.provider`.
pub const PROVIDERS: [&str; 3] = ["anthropic", "openai", "ollama"];

#[derive(Debug, Clone, Default)]
pub struct ChatOptions {
    pub system: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
}

/// Outcome of a gateway call. `content` is `None` when every attempt failed;
/// `meta` then carries the error code and message.
#[derive(Debug, Clone)]
pub struct GatewayResponse {
    pub content: Option<String>,
    pub meta: MessageMeta,
}

impl GatewayResponse {
    pub fn is_success(&self) -> bool {
        self.content.is_some()
    }
}

/// Wraps one provider with the retry policy and turns every outcome into a
/// `GatewayResponse`. Never fails.
pub struct ProviderGateway {
    provider: Arc<dyn LlmProvider>,
    retry: RetryPolicy,
    max_tokens: Option<u32>,
    temperature: Option<f64>,
}

impl ProviderGateway {
    pub fn new(provider: Arc<dyn LlmProvider>, retry: RetryPolicy) -> Self {
        Self {
            provider,
            retry,
            max_tokens: None,
            temperature: None,
        }
    }

    /// Build the configured provider. Unknown names and missing credentials
    /// are rejected here rather than on the first request.
    pub fn from_config(llm: &LlmConfig, retry: &RetryConfig) -> Result<Self> {
        let timeout = Duration::from_secs(llm.timeout_secs.max(1));
        let provider: Arc<dyn LlmProvider> = match llm.provider.as_str() {
            "anthropic" => {
                let key = require_api_key(llm)?;
                let mut provider = AnthropicProvider::new(key, llm.model.clone(), timeout);
                if let Some(url) = &llm.base_url {
                    provider = provider.with_base_url(url.clone());
                }
                Arc::new(provider)
            }
            "openai" => {
                let key = require_api_key(llm)?;
                let mut provider = OpenAiProvider::new(key, llm.model.clone(), timeout);
                if let Some(url) = &llm.base_url {
                    provider = provider.with_base_url(url.clone());
                }
                Arc::new(provider)
            }
            "ollama" => Arc::new(OllamaProvider::new(
                llm.base_url.clone(),
                llm.model.clone(),
                timeout,
            )),
            other => {
                return Err(Error::Config(format!(
                    "unknown llm provider '{other}', expected one of: {}",
                    PROVIDERS.join(", ")
                )));
            }
        };
        info!(
            "configured LLM provider: {} ({})",
            provider.provider_id(),
            provider.model()
        );

        let mut gateway = Self::new(provider, RetryPolicy::from_config(retry));
        gateway.max_tokens = Some(llm.max_tokens);
        gateway.temperature = llm.temperature;
        Ok(gateway)
    }

    pub fn provider_id(&self) -> &str {
        self.provider.provider_id()
    }

    pub fn model(&self) -> &str {
        self.provider.model()
    }

    pub async fn health_check(&self) -> bool {
        match self.provider.health_check().await {
            Ok(healthy) => healthy,
            Err(e) => {
                warn!("provider health check failed: {e}");
                false
            }
        }
    }

    pub async fn chat(&self, messages: Vec<ChatMessage>, options: &ChatOptions) -> GatewayResponse {
        let request = LlmRequest {
            model: self.provider.model().to_string(),
            messages,
            system: options.system.clone(),
            max_tokens: options.max_tokens.or(self.max_tokens),
            temperature: options.temperature.or(self.temperature),
        };

        let started = Instant::now();
        let result = self
            .retry
            .run(
                |_| self.provider.complete(&request),
                ProviderError::is_retryable,
            )
            .await;
        let latency_ms = started.elapsed().as_millis() as u64;

        let mut meta = MessageMeta {
            provider: self.provider.provider_id().to_string(),
            model: request.model.clone(),
            latency_ms,
            ..MessageMeta::default()
        };

        match result {
            Ok(response) => {
                let tokens = match response.usage {
                    Some(usage) => TokenCounts::new(usage.input_tokens, usage.output_tokens),
                    None => TokenCounts::new(
                        estimate_request_tokens(&request),
                        estimate_tokens(&response.content),
                    ),
                };
                meta.model = response.model;
                meta.tokens = Some(tokens);
                GatewayResponse {
                    content: Some(response.content),
                    meta,
                }
            }
            Err(err) => {
                warn!(
                    provider = %meta.provider,
                    code = err.code(),
                    latency_ms,
                    "provider call failed: {err}"
                );
                meta.error_code = Some(err.code().to_string());
                meta.error_message = Some(err.to_string());
                GatewayResponse {
                    content: None,
                    meta,
                }
            }
        }
    }
}

fn require_api_key(llm: &LlmConfig) -> Result<String> {
    llm.api_key
        .clone()
        .filter(|key| !key.trim().is_empty())
        .ok_or_else(|| {
            Error::Config(format!(
                "llm.api_key (or CAREASSIST_LLM_API_KEY) is required for provider '{}'",
                llm.provider
            ))
        })
}

fn estimate_request_tokens(request: &LlmRequest) -> u32 {
    let system = request.system.as_deref().map(estimate_tokens).unwrap_or(0);
    request
        .messages
        .iter()
        .map(|m| estimate_tokens(&m.content))
        .sum::<u32>()
        + system
}
