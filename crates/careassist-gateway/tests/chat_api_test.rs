use std::sync::Arc;
use std::time::Duration;

use careassist_agents::{
    ChatOrchestrator, InMemorySubjectDirectory, OpenAiProvider, ProviderGateway, RetryPolicy,
};
use careassist_config::{AppConfig, SubjectGrant};
use careassist_db::{ConversationStore, IdempotencyStore};
use careassist_gateway::{AppState, GatewayServer};
use reqwest::StatusCode;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct TestApp {
    base: String,
    client: reqwest::Client,
    provider: MockServer,
    _shutdown: oneshot::Sender<()>,
}

impl TestApp {
    async fn spawn() -> Self {
        Self::spawn_with(|_| {}).await
    }

    async fn spawn_with(configure: impl FnOnce(&mut AppConfig)) -> Self {
        Self::spawn_with_attempt_timeout(Duration::from_millis(300), configure).await
    }

    async fn spawn_with_attempt_timeout(
        attempt_timeout: Duration,
        configure: impl FnOnce(&mut AppConfig),
    ) -> Self {
        let provider = MockServer::start().await;

        let mut config = AppConfig::default();
        config.gateway.rate_limit.enabled = false;
        config.subjects = vec![SubjectGrant {
            user_id: "alice".into(),
            subject_id: "child-1".into(),
        }];
        configure(&mut config);

        let llm = OpenAiProvider::new(
            "test-key".to_string(),
            Some("gpt-4o-mini".to_string()),
            attempt_timeout,
        )
        .with_base_url(provider.uri());
        let gateway = Arc::new(ProviderGateway::new(
            Arc::new(llm),
            RetryPolicy::new(2, Duration::from_millis(5), Duration::from_millis(20)),
        ));
        let orchestrator = Arc::new(ChatOrchestrator::new(
            Arc::new(ConversationStore::in_memory().unwrap()),
            gateway,
            Arc::new(InMemorySubjectDirectory::from_grants(&config.subjects)),
            &config.budget,
            &config.chat,
        ));
        let records = Arc::new(IdempotencyStore::in_memory().unwrap());
        let state = AppState::new(config, orchestrator, records);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            GatewayServer::new(state)
                .serve(listener, async {
                    rx.await.ok();
                })
                .await
                .unwrap();
        });

        Self {
            base: format!("http://{addr}"),
            client: reqwest::Client::new(),
            provider,
            _shutdown: tx,
        }
    }

    async fn answer_with(&self, text: &str) {
        self.provider.reset().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "model": "gpt-4o-mini",
                "choices": [{
                    "message": {"role": "assistant", "content": text},
                    "finish_reason": "stop"
                }],
                "usage": {"prompt_tokens": 40, "completion_tokens": 8}
            })))
            .mount(&self.provider)
            .await;
    }

    async fn answer_after(&self, text: &str, delay: Duration) {
        self.provider.reset().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({
                        "model": "gpt-4o-mini",
                        "choices": [{
                            "message": {"role": "assistant", "content": text},
                            "finish_reason": "stop"
                        }],
                        "usage": {"prompt_tokens": 40, "completion_tokens": 8}
                    }))
                    .set_delay(delay),
            )
            .mount(&self.provider)
            .await;
    }

    async fn always_time_out(&self) {
        self.provider.reset().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({}))
                    .set_delay(Duration::from_secs(2)),
            )
            .mount(&self.provider)
            .await;
    }

    fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        user: &str,
        key: Option<&str>,
    ) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .request(method, format!("{}{path}", self.base))
            .header("X-User-Id", user);
        if let Some(key) = key {
            builder = builder.header("Idempotency-Key", key);
        }
        builder
    }

    async fn post(&self, path: &str, user: &str, key: &str, body: Value) -> (StatusCode, Value) {
        let response = self
            .request(reqwest::Method::POST, path, user, Some(key))
            .json(&body)
            .send()
            .await
            .unwrap();
        let status = response.status();
        (status, response.json().await.unwrap())
    }

    async fn get(&self, path: &str, user: &str) -> (StatusCode, Value) {
        let response = self
            .request(reqwest::Method::GET, path, user, None)
            .send()
            .await
            .unwrap();
        let status = response.status();
        (status, response.json().await.unwrap())
    }

    async fn start(&self, user: &str, key: &str) -> String {
        let (status, body) = self
            .post("/api/chat/start", user, key, json!({"context_type": "general"}))
            .await;
        assert!(status.is_success(), "start failed: {body}");
        body["session"]["id"].as_str().unwrap().to_string()
    }
}

#[tokio::test]
async fn start_send_and_read_history() {
    let app = TestApp::spawn().await;
    app.answer_with("Fasting for 8 hours is typical.").await;

    let (status, started) = app
        .post(
            "/api/chat/start",
            "alice",
            "start-1",
            json!({"context_type": "lab_report", "context_id": "lab-42", "subject_id": "child-1"}),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(started["resumed"], false);
    assert_eq!(started["session"]["message_count"], 0);
    assert_eq!(started["session"]["subject_id"], "child-1");
    assert_eq!(started["messages"]["items"].as_array().unwrap().len(), 0);
    let session_id = started["session"]["id"].as_str().unwrap();

    let (status, turn) = app
        .post(
            &format!("/api/chat/{session_id}/message"),
            "alice",
            "msg-1",
            json!({"message": "Do I need to fast before the test?"}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(turn["user_message"]["role"], "user");
    assert_eq!(turn["assistant_message"]["content"], "Fasting for 8 hours is typical.");
    assert!(turn["error"].is_null());
    assert!(turn["usage"]["total"].as_u64().unwrap() > 0);
    assert_eq!(turn["assistant_message"]["meta"]["tokens"]["total"], 48);

    let (status, page) = app
        .get(&format!("/api/chat/{session_id}/messages?limit=50"), "alice")
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page["items"].as_array().unwrap().len(), 2);
    assert_eq!(page["has_more"], false);
    assert_eq!(page["total"], 2);

    // Same page context resumes the existing session.
    let (status, resumed) = app
        .post(
            "/api/chat/start",
            "alice",
            "start-2",
            json!({"context_type": "lab_report", "context_id": "lab-42", "subject_id": "child-1"}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(resumed["resumed"], true);
    assert_eq!(resumed["session"]["id"], session_id);
    assert_eq!(resumed["messages"]["items"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn duplicate_key_replays_without_second_side_effect() {
    let app = TestApp::spawn().await;
    app.answer_with("Take it with food.").await;
    let session_id = app.start("alice", "start-1").await;
    let path = format!("/api/chat/{session_id}/message");

    let first = app
        .request(reqwest::Method::POST, &path, "alice", Some("dup-1"))
        .json(&json!({"message": "How should I take my medication?"}))
        .send()
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    assert!(first.headers().get("idempotent-replayed").is_none());
    let first_body = first.text().await.unwrap();

    for body in [
        json!({"message": "How should I take my medication?"}),
        json!({"message": "a different question"}),
    ] {
        let again = app
            .request(reqwest::Method::POST, &path, "alice", Some("dup-1"))
            .json(&body)
            .send()
            .await
            .unwrap();
        assert_eq!(again.status(), StatusCode::OK);
        assert_eq!(again.headers().get("idempotent-replayed").unwrap(), "true");
        assert_eq!(again.text().await.unwrap(), first_body);
    }

    let (_, sessions) = app.get("/api/chat/sessions", "alice").await;
    assert_eq!(sessions["sessions"][0]["message_count"], 2);
}

#[tokio::test]
async fn missing_idempotency_key_is_rejected_before_any_work() {
    let app = TestApp::spawn().await;
    let response = app
        .request(reqwest::Method::POST, "/api/chat/start", "alice", None)
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "error");
    assert_eq!(body["code"], "validation_error");

    let (_, sessions) = app.get("/api/chat/sessions", "alice").await;
    assert_eq!(sessions["sessions"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn missing_user_is_unauthorized() {
    let app = TestApp::spawn().await;
    let response = app
        .client
        .get(format!("{}/api/chat/sessions", app.base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["code"], "unauthorized");
}

#[tokio::test]
async fn provider_timeout_then_retry_replaces_placeholder() {
    let app = TestApp::spawn().await;
    app.always_time_out().await;
    let session_id = app.start("alice", "start-1").await;

    let (status, failed) = app
        .post(
            &format!("/api/chat/{session_id}/message"),
            "alice",
            "msg-1",
            json!({"message": "What does a high A1C mean?"}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(failed["error"]["code"], "timeout");
    assert_eq!(failed["assistant_message"]["content"], "");
    assert_eq!(failed["assistant_message"]["meta"]["error_code"], "timeout");

    app.answer_with("A1C reflects average blood sugar.").await;
    let (status, retried) = app
        .post(
            &format!("/api/chat/{session_id}/retry"),
            "alice",
            "retry-1",
            json!({}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(retried["error"].is_null());
    assert_eq!(
        retried["assistant_message"]["content"],
        "A1C reflects average blood sugar."
    );
    assert_eq!(retried["user_message"]["id"], failed["user_message"]["id"]);

    let (_, page) = app
        .get(&format!("/api/chat/{session_id}/messages?limit=50"), "alice")
        .await;
    let items = page["items"].as_array().unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(items[0]["role"], "user");
    assert_eq!(items[1]["content"], "A1C reflects average blood sugar.");

    // Nothing left to retry.
    let (status, body) = app
        .post(
            &format!("/api/chat/{session_id}/retry"),
            "alice",
            "retry-2",
            json!({}),
        )
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(body["message"].as_str().unwrap().contains("no failed turn"));
}

#[tokio::test]
async fn sessions_are_private_to_their_owner() {
    let app = TestApp::spawn().await;
    app.answer_with("hello").await;
    let session_id = app.start("alice", "start-1").await;

    let (status, body) = app
        .post(
            &format!("/api/chat/{session_id}/message"),
            "mallory",
            "m-1",
            json!({"message": "show me"}),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "forbidden");

    let (status, _) = app
        .get(&format!("/api/chat/{session_id}/messages"), "mallory")
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = app
        .post("/api/chat/start", "mallory", "m-2", json!({"subject_id": "child-1"}))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = app
        .post(
            "/api/chat/missing-session/message",
            "alice",
            "a-1",
            json!({"message": "hi"}),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "not_found");
}

#[tokio::test]
async fn rename_archive_and_delete() {
    let app = TestApp::spawn().await;
    app.answer_with("ok").await;
    let session_id = app.start("alice", "start-1").await;

    let response = app
        .request(
            reqwest::Method::PATCH,
            &format!("/api/chat/{session_id}"),
            "alice",
            Some("rename-1"),
        )
        .json(&json!({"title": "  Flu shot questions "}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["session"]["title"], "Flu shot questions");

    let response = app
        .request(
            reqwest::Method::PUT,
            &format!("/api/chat/{session_id}/archive"),
            "alice",
            Some("archive-1"),
        )
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["session"]["status"], "archived");

    let (status, _) = app
        .post(
            &format!("/api/chat/{session_id}/message"),
            "alice",
            "late-1",
            json!({"message": "one more thing"}),
        )
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (_, archived) = app.get("/api/chat/sessions?status=archived", "alice").await;
    assert_eq!(archived["sessions"].as_array().unwrap().len(), 1);
    let (_, active) = app.get("/api/chat/sessions?status=active", "alice").await;
    assert_eq!(active["sessions"].as_array().unwrap().len(), 0);

    for (key, expected) in [("delete-1", true), ("delete-2", false)] {
        let response = app
            .request(
                reqwest::Method::DELETE,
                &format!("/api/chat/{session_id}"),
                "alice",
                Some(key),
            )
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["deleted"], expected);
    }
}

#[tokio::test]
async fn paging_over_http_visits_every_message_once() {
    let app = TestApp::spawn().await;
    app.answer_with("noted").await;
    let session_id = app.start("alice", "start-1").await;
    for i in 0..3 {
        let (status, _) = app
            .post(
                &format!("/api/chat/{session_id}/message"),
                "alice",
                &format!("msg-{i}"),
                json!({"message": format!("question {i}")}),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
    }

    let mut seen = Vec::new();
    let mut cursor: Option<String> = None;
    loop {
        let mut url = format!("/api/chat/{session_id}/messages?limit=2");
        if let Some(c) = &cursor {
            url.push_str(&format!("&cursor={c}"));
        }
        let (status, page) = app.get(&url, "alice").await;
        assert_eq!(status, StatusCode::OK);
        for item in page["items"].as_array().unwrap() {
            seen.push(item["id"].as_str().unwrap().to_string());
        }
        if page["has_more"] == false {
            break;
        }
        cursor = Some(page["next_cursor"].as_str().unwrap().to_string());
    }
    assert_eq!(seen.len(), 6);
    seen.sort();
    seen.dedup();
    assert_eq!(seen.len(), 6);

    let (status, body) = app
        .get(&format!("/api/chat/{session_id}/messages?cursor=!!!"), "alice")
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["code"], "validation_error");
}

#[tokio::test]
async fn oversized_message_is_rejected() {
    let app = TestApp::spawn_with(|config| config.chat.max_message_chars = 20).await;
    let session_id = app.start("alice", "start-1").await;
    let (status, body) = app
        .post(
            &format!("/api/chat/{session_id}/message"),
            "alice",
            "big-1",
            json!({"message": "x".repeat(21)}),
        )
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["code"], "validation_error");
}

#[tokio::test]
async fn api_key_is_enforced_when_configured() {
    let app = TestApp::spawn_with(|config| {
        config.gateway.api_key = Some("portal-secret".into());
    })
    .await;

    let (status, _) = app.get("/api/chat/sessions", "alice").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let response = app
        .request(reqwest::Method::GET, "/api/chat/sessions", "alice", None)
        .bearer_auth("wrong")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .request(reqwest::Method::GET, "/api/chat/sessions", "alice", None)
        .bearer_auth("portal-secret")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn health_and_status() {
    let app = TestApp::spawn().await;
    Mock::given(method("GET"))
        .and(path("/models"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": []})))
        .mount(&app.provider)
        .await;

    let health = app
        .client
        .get(format!("{}/health", app.base))
        .send()
        .await
        .unwrap();
    assert_eq!(health.status(), StatusCode::OK);
    assert_eq!(health.text().await.unwrap(), "ok");

    let status: Value = app
        .client
        .get(format!("{}/api/status", app.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["status"], "running");
    assert_eq!(status["provider"], "openai");
    assert_eq!(status["model"], "gpt-4o-mini");
    assert_eq!(status["provider_reachable"], true);
}

#[tokio::test]
async fn rate_limit_rejects_bursts() {
    let app = TestApp::spawn_with(|config| {
        config.gateway.rate_limit.enabled = true;
        config.gateway.rate_limit.per_second = 60;
        config.gateway.rate_limit.burst_size = 2;
    })
    .await;

    let mut statuses = Vec::new();
    for _ in 0..4 {
        let response = app
            .request(reqwest::Method::GET, "/api/chat/sessions", "alice", None)
            .send()
            .await
            .unwrap();
        statuses.push(response.status());
    }
    assert_eq!(statuses[0], StatusCode::OK);
    assert!(statuses.contains(&StatusCode::TOO_MANY_REQUESTS));
}

#[tokio::test]
async fn slow_turn_times_out_but_completes_in_background() {
    let app = TestApp::spawn_with_attempt_timeout(Duration::from_secs(5), |config| {
        config.gateway.request_timeout_secs = 1;
    })
    .await;
    let session_id = app.start("alice", "start-slow").await;
    app.answer_after("Results are in.", Duration::from_millis(1_500))
        .await;

    let message_path = format!("/api/chat/{session_id}/message");
    let body = json!({"message": "Are my results ready?"});
    let (status, error) = app.post(&message_path, "alice", "slow-1", body.clone()).await;
    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(error["code"], "request_timeout");

    let messages_path = format!("/api/chat/{session_id}/messages?limit=50");
    let mut persisted = 0;
    for _ in 0..40 {
        let (_, page) = app.get(&messages_path, "alice").await;
        persisted = page["items"].as_array().unwrap().len();
        if persisted == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(persisted, 2);

    // The record is completed just after the turn is written.
    let mut response = None;
    for _ in 0..20 {
        let attempt = app
            .request(reqwest::Method::POST, &message_path, "alice", Some("slow-1"))
            .json(&body)
            .send()
            .await
            .unwrap();
        if attempt.status() != StatusCode::CONFLICT {
            response = Some(attempt);
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let response = response.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["idempotent-replayed"], "true");
    let turn: Value = response.json().await.unwrap();
    assert_eq!(turn["assistant_message"]["content"], "Results are in.");

    let (_, page) = app.get(&messages_path, "alice").await;
    assert_eq!(page["items"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn prompt_over_budget_is_413() {
    let app = TestApp::spawn_with(|config| {
        config.budget.max_context_tokens = 600;
        config.budget.response_reserve = 200;
    })
    .await;
    app.answer_with("unused").await;
    let session_id = app.start("alice", "start-budget").await;

    let (status, error) = app
        .post(
            &format!("/api/chat/{session_id}/message"),
            "alice",
            "budget-1",
            json!({"message": "a".repeat(3_000)}),
        )
        .await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(error["code"], "budget_exceeded");

    let (_, page) = app
        .get(&format!("/api/chat/{session_id}/messages"), "alice")
        .await;
    assert_eq!(page["items"].as_array().unwrap().len(), 0);
}
