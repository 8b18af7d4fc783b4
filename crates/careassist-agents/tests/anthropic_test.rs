use std::net::SocketAddr;
use std::time::Duration;

use axum::{
    Router,
    extract::Json,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::post,
};
use careassist_agents::providers::{AnthropicProvider, ChatMessage, LlmProvider, LlmRequest};
use careassist_common::ProviderError;
use serde_json::json;
use tokio::sync::oneshot;

// Mock server setup
async fn start_mock_server() -> (SocketAddr, oneshot::Sender<()>) {
    let (tx, rx) = oneshot::channel::<()>();

    let app = Router::new().route("/v1/messages", post(mock_messages));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                rx.await.ok();
            })
            .await
            .unwrap();
    });

    (addr, tx)
}

async fn mock_messages(
    headers: HeaderMap,
    Json(payload): Json<serde_json::Value>,
) -> impl IntoResponse {
    if headers.get("x-api-key").and_then(|v| v.to_str().ok()) != Some("test-key") {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"type": "error", "error": {"type": "authentication_error"}})),
        );
    }
    if headers.get("anthropic-version").is_none() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "missing anthropic-version"})),
        );
    }

    let last = payload["messages"]
        .as_array()
        .and_then(|m| m.last())
        .and_then(|m| m["content"].as_str())
        .unwrap_or_default()
        .to_string();

    if last == "overloaded" {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"type": "error", "error": {"type": "overloaded_error"}})),
        );
    }

    let system = payload["system"].as_str().unwrap_or("none").to_string();
    (
        StatusCode::OK,
        Json(json!({
            "id": "msg_123",
            "type": "message",
            "role": "assistant",
            "model": "claude-3-5-haiku-20241022",
            "content": [
                {"type": "text", "text": format!("echo: {last}")},
                {"type": "text", "text": format!(" (system: {system})")}
            ],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 21, "output_tokens": 9}
        })),
    )
}

fn request(text: &str, system: Option<&str>) -> LlmRequest {
    LlmRequest {
        model: "claude-3-5-haiku-latest".to_string(),
        messages: vec![ChatMessage::user(text)],
        system: system.map(str::to_string),
        max_tokens: Some(100),
        temperature: None,
    }
}

fn provider(addr: SocketAddr, key: &str) -> AnthropicProvider {
    AnthropicProvider::new(key.to_string(), None, Duration::from_secs(5))
        .with_base_url(format!("http://{addr}/v1/messages"))
}

#[tokio::test]
async fn test_anthropic_completion() {
    let (addr, _shutdown_tx) = start_mock_server().await;
    let provider = provider(addr, "test-key");

    let response = provider
        .complete(&request("Hello", Some("be brief")))
        .await
        .unwrap();

    assert_eq!(response.content, "echo: Hello (system: be brief)");
    assert_eq!(response.model, "claude-3-5-haiku-20241022");
    assert_eq!(response.stop_reason.as_deref(), Some("end_turn"));
    let usage = response.usage.unwrap();
    assert_eq!(usage.input_tokens, 21);
    assert_eq!(usage.output_tokens, 9);
}

#[tokio::test]
async fn test_anthropic_bad_key_is_terminal() {
    let (addr, _shutdown_tx) = start_mock_server().await;
    let provider = provider(addr, "wrong-key");

    let err = provider.complete(&request("Hello", None)).await.unwrap_err();
    assert!(matches!(err, ProviderError::Status { status: 401, .. }));
    assert!(!err.is_retryable());
    assert_eq!(err.code(), "auth_failed");
}

#[tokio::test]
async fn test_anthropic_overload_is_retryable() {
    let (addr, _shutdown_tx) = start_mock_server().await;
    let provider = provider(addr, "test-key");

    let err = provider
        .complete(&request("overloaded", None))
        .await
        .unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(err.code(), "upstream_unavailable");
}

#[tokio::test]
async fn test_anthropic_unreachable_is_network_error() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let err = provider(addr, "test-key")
        .complete(&request("Hello", None))
        .await
        .unwrap_err();
    assert!(matches!(err, ProviderError::Network(_)));
    assert!(err.is_retryable());
}
