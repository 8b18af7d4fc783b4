use std::time::Duration;

use async_trait::async_trait;
use careassist_common::Result;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};

use super::{
    LlmProvider, LlmRequest, LlmResponse, ProviderResult, Usage, check_status, http_client,
    non_empty, transport_error,
};

const OLLAMA_URL: &str = "http://localhost:11434";
pub const DEFAULT_MODEL: &str = "llama3.1";

/// Local Ollama server. Needs no credential.
#[derive(Clone)]
pub struct OllamaProvider {
    base_url: String,
    model: String,
    client: Client,
}

impl OllamaProvider {
    pub fn new(base_url: Option<String>, model: Option<String>, timeout: Duration) -> Self {
        Self {
            base_url: base_url
                .unwrap_or_else(|| OLLAMA_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            model: model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            client: http_client(timeout),
        }
    }

    fn build_request_body(&self, request: &LlmRequest) -> Value {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if let Some(system) = &request.system {
            messages.push(json!({ "role": "system", "content": system }));
        }
        messages.extend(
            request
                .messages
                .iter()
                .map(|msg| json!({ "role": msg.role.as_str(), "content": msg.content })),
        );

        let mut body = json!({
            "model": request.model,
            "messages": messages,
            "stream": false,
        });

        let mut options = serde_json::Map::new();
        if let Some(temp) = request.temperature {
            options.insert("temperature".to_string(), json!(temp));
        }
        if let Some(max_tokens) = request.max_tokens {
            options.insert("num_predict".to_string(), json!(max_tokens));
        }
        if !options.is_empty() {
            body["options"] = Value::Object(options);
        }
        body
    }
}

#[derive(Deserialize)]
struct OllamaResponse {
    #[serde(default)]
    model: String,
    message: Option<OllamaMessage>,
    #[serde(default)]
    done_reason: Option<String>,
    #[serde(default)]
    eval_count: u32,
    #[serde(default)]
    prompt_eval_count: u32,
}

#[derive(Deserialize)]
struct OllamaMessage {
    content: String,
}

#[async_trait]
impl LlmProvider for OllamaProvider {
    fn provider_id(&self) -> &str {
        "ollama"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &LlmRequest) -> ProviderResult<LlmResponse> {
        let url = format!("{}/api/chat", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&self.build_request_body(request))
            .send()
            .await
            .map_err(transport_error)?;
        let response = check_status(response).await?;

        let parsed: OllamaResponse = response.json().await.map_err(transport_error)?;
        let text = parsed.message.map(|m| m.content).unwrap_or_default();
        let usage = (parsed.prompt_eval_count > 0 || parsed.eval_count > 0).then_some(Usage {
            input_tokens: parsed.prompt_eval_count,
            output_tokens: parsed.eval_count,
        });

        Ok(LlmResponse {
            content: non_empty(text)?,
            model: if parsed.model.is_empty() {
                request.model.clone()
            } else {
                parsed.model
            },
            usage,
            stop_reason: parsed.done_reason,
        })
    }

    async fn health_check(&self) -> Result<bool> {
        let url = format!("{}/api/tags", self.base_url);
        match self.client.get(&url).send().await {
            Ok(resp) => Ok(resp.status().is_success()),
            Err(_) => Ok(false),
        }
    }
}
