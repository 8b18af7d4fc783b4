use std::future::Future;
use std::time::Duration;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::Response;
use careassist_agents::StartChat;
use careassist_common::{ChatContext, ContextKind, Error, SessionStatus};
use careassist_db::SessionFilter;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{error, warn};

use crate::auth::Caller;
use crate::error::{ApiError, ApiResult};
use crate::idempotency::{IDEMPOTENCY_KEY_HEADER, IdempotentRequest, JsonReply};
use crate::state::SharedState;

const STATUS_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

// ---------------------------------------------------------------------------
// Request bodies
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct StartChatRequest {
    #[serde(alias = "subjectId")]
    pub subject_id: Option<String>,
    #[serde(alias = "contextType")]
    pub context_type: Option<String>,
    #[serde(alias = "contextId")]
    pub context_id: Option<String>,
    #[serde(alias = "contextData")]
    pub context_data: Option<Map<String, Value>>,
    pub title: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    #[serde(alias = "text")]
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct RenameRequest {
    pub title: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct MessagesQuery {
    pub limit: Option<String>,
    pub cursor: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SessionsQuery {
    #[serde(alias = "subjectId")]
    pub subject_id: Option<String>,
    #[serde(alias = "contextType")]
    pub context_type: Option<String>,
    pub status: Option<String>,
}

// ---------------------------------------------------------------------------
// Mutating routes
// ---------------------------------------------------------------------------

/// POST /api/chat/start
pub async fn start_chat(
    State(state): State<SharedState>,
    caller: Caller,
    headers: HeaderMap,
    uri: Uri,
    body: Bytes,
) -> ApiResult<Response> {
    let request = idempotent_request(&state, &headers, &caller, &uri, &body)?;
    let payload: StartChatRequest = parse_optional_body(&body)?;
    let start = start_chat_from(&state, payload)?;

    let orchestrator = state.orchestrator.clone();
    let user_id = caller.user_id;
    dispatch(&state, request, async move {
        let started = orchestrator.start_or_resume(&user_id, start).await?;
        let status = if started.resumed {
            StatusCode::OK
        } else {
            StatusCode::CREATED
        };
        Ok::<_, ApiError>(JsonReply::with_status(status, to_json(&started)?))
    })
    .await
}

/// POST /api/chat/{id}/message
pub async fn send_message(
    State(state): State<SharedState>,
    caller: Caller,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    uri: Uri,
    body: Bytes,
) -> ApiResult<Response> {
    let request = idempotent_request(&state, &headers, &caller, &uri, &body)?;
    state.validator.identifier("session id", &session_id)?;
    let payload: SendMessageRequest = parse_body(&body)?;
    let text = state.validator.message_text(&payload.message)?;

    let orchestrator = state.orchestrator.clone();
    let user_id = caller.user_id;
    dispatch(&state, request, async move {
        let turn = orchestrator
            .send_message(&user_id, &session_id, &text)
            .await?;
        Ok::<_, ApiError>(JsonReply::ok(to_json(&turn)?))
    })
    .await
}

/// POST /api/chat/{id}/retry
pub async fn retry_message(
    State(state): State<SharedState>,
    caller: Caller,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    uri: Uri,
    body: Bytes,
) -> ApiResult<Response> {
    let request = idempotent_request(&state, &headers, &caller, &uri, &body)?;
    state.validator.identifier("session id", &session_id)?;

    let orchestrator = state.orchestrator.clone();
    let user_id = caller.user_id;
    dispatch(&state, request, async move {
        let turn = orchestrator
            .retry_last_message(&user_id, &session_id)
            .await?;
        Ok::<_, ApiError>(JsonReply::ok(to_json(&turn)?))
    })
    .await
}

/// PATCH /api/chat/{id}
pub async fn rename_session(
    State(state): State<SharedState>,
    caller: Caller,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    uri: Uri,
    body: Bytes,
) -> ApiResult<Response> {
    let request = idempotent_request(&state, &headers, &caller, &uri, &body)?;
    state.validator.identifier("session id", &session_id)?;
    let payload: RenameRequest = parse_body(&body)?;
    let title = state.validator.title(&payload.title)?;

    let orchestrator = state.orchestrator.clone();
    let user_id = caller.user_id;
    dispatch(&state, request, async move {
        let session = orchestrator.rename_session(&user_id, &session_id, &title)?;
        Ok::<_, ApiError>(JsonReply::ok(json!({ "session": to_json(&session)? })))
    })
    .await
}

/// PUT /api/chat/{id}/archive
pub async fn archive_session(
    State(state): State<SharedState>,
    caller: Caller,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    uri: Uri,
    body: Bytes,
) -> ApiResult<Response> {
    let request = idempotent_request(&state, &headers, &caller, &uri, &body)?;
    state.validator.identifier("session id", &session_id)?;

    let orchestrator = state.orchestrator.clone();
    let user_id = caller.user_id;
    dispatch(&state, request, async move {
        let session = orchestrator.archive_session(&user_id, &session_id)?;
        Ok::<_, ApiError>(JsonReply::ok(json!({ "session": to_json(&session)? })))
    })
    .await
}

/// DELETE /api/chat/{id}
pub async fn delete_session(
    State(state): State<SharedState>,
    caller: Caller,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    uri: Uri,
    body: Bytes,
) -> ApiResult<Response> {
    let request = idempotent_request(&state, &headers, &caller, &uri, &body)?;
    state.validator.identifier("session id", &session_id)?;

    let orchestrator = state.orchestrator.clone();
    let user_id = caller.user_id;
    dispatch(&state, request, async move {
        let deleted = orchestrator.delete_session(&user_id, &session_id).await?;
        Ok::<_, ApiError>(JsonReply::ok(json!({ "deleted": deleted })))
    })
    .await
}

// ---------------------------------------------------------------------------
// Read-only routes
// ---------------------------------------------------------------------------

/// GET /api/chat/{id}/messages?limit=&cursor=
pub async fn list_messages(
    State(state): State<SharedState>,
    caller: Caller,
    Path(session_id): Path<String>,
    Query(query): Query<MessagesQuery>,
) -> ApiResult<Json<Value>> {
    state.validator.identifier("session id", &session_id)?;
    let limit = query
        .limit
        .as_deref()
        .map(|raw| {
            raw.parse::<usize>()
                .map_err(|_| ApiError::validation(format!("invalid limit '{raw}'")))
        })
        .transpose()?;
    let page = state.orchestrator.list_messages(
        &caller.user_id,
        &session_id,
        limit,
        query.cursor.as_deref(),
    )?;
    Ok(Json(to_json(&page)?))
}

/// GET /api/chat/sessions?subject_id=&context_type=&status=
pub async fn list_sessions(
    State(state): State<SharedState>,
    caller: Caller,
    Query(query): Query<SessionsQuery>,
) -> ApiResult<Json<Value>> {
    let filter = SessionFilter {
        subject_id: query.subject_id.filter(|s| !s.is_empty()),
        context_kind: query
            .context_type
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(str::parse::<ContextKind>)
            .transpose()?,
        status: query
            .status
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(str::parse::<SessionStatus>)
            .transpose()?,
    };
    let sessions = state.orchestrator.list_sessions(&caller.user_id, &filter)?;
    Ok(Json(json!({ "sessions": to_json(&sessions)? })))
}

pub async fn health() -> &'static str {
    "ok"
}

/// GET /api/status
pub async fn status(State(state): State<SharedState>) -> Json<Value> {
    let gateway = state.orchestrator.gateway();
    let reachable = tokio::time::timeout(STATUS_PROBE_TIMEOUT, gateway.health_check())
        .await
        .unwrap_or(false);
    Json(json!({
        "status": "running",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "provider": gateway.provider_id(),
        "model": gateway.model(),
        "provider_reachable": reachable,
    }))
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Run mutating work on a detached task. The caller waits at most
/// `request_timeout`; the task itself always runs to completion so the turn
/// and its idempotency record are persisted even if the client goes away.
async fn dispatch<Fut>(state: &SharedState, request: IdempotentRequest, work: Fut) -> ApiResult<Response>
where
    Fut: Future<Output = ApiResult<JsonReply>> + Send + 'static,
{
    let cache = state.idempotency.clone();
    let key = request.key.clone();
    let task = tokio::spawn(async move { cache.run(request, work).await });

    match tokio::time::timeout(state.request_timeout(), task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => {
            error!(key = %key, "request task failed: {join_err}");
            Err(ApiError::Internal("request task failed".into()))
        }
        Err(_) => {
            warn!(key = %key, "request exceeded timeout, leaving it to finish in the background");
            Err(ApiError::Timeout)
        }
    }
}

fn idempotent_request(
    state: &SharedState,
    headers: &HeaderMap,
    caller: &Caller,
    uri: &Uri,
    body: &Bytes,
) -> ApiResult<IdempotentRequest> {
    let raw = headers
        .get(IDEMPOTENCY_KEY_HEADER)
        .map(|v| {
            v.to_str()
                .map_err(|_| ApiError::validation("Idempotency-Key must be printable ASCII"))
        })
        .transpose()?;
    let key = state.validator.idempotency_key(raw)?;
    Ok(IdempotentRequest {
        key,
        user_id: caller.user_id.clone(),
        path: uri.path().to_string(),
        request: canonical_body(body),
    })
}

/// Key order and whitespace do not distinguish two requests.
fn canonical_body(body: &Bytes) -> String {
    if body.is_empty() {
        return String::new();
    }
    serde_json::from_slice::<Value>(body)
        .map(|v| v.to_string())
        .unwrap_or_else(|_| String::from_utf8_lossy(body).into_owned())
}

fn parse_body<T: DeserializeOwned>(body: &Bytes) -> ApiResult<T> {
    serde_json::from_slice(body).map_err(|e| ApiError::validation(format!("invalid JSON body: {e}")))
}

fn parse_optional_body<T: DeserializeOwned + Default>(body: &Bytes) -> ApiResult<T> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    parse_body(body)
}

fn to_json<T: Serialize>(value: &T) -> ApiResult<Value> {
    serde_json::to_value(value).map_err(|e| ApiError::from(Error::from(e)))
}

fn start_chat_from(state: &SharedState, payload: StartChatRequest) -> ApiResult<StartChat> {
    let kind = match payload.context_type.as_deref().filter(|s| !s.is_empty()) {
        Some(raw) => raw.parse::<ContextKind>()?,
        None => ContextKind::General,
    };
    if let Some(subject) = &payload.subject_id {
        state.validator.identifier("subject id", subject)?;
    }
    let context_id = payload.context_id.filter(|s| !s.is_empty());
    if let Some(id) = &context_id {
        state.validator.identifier("context id", id)?;
    }
    let title = payload
        .title
        .as_deref()
        .map(|t| state.validator.title(t))
        .transpose()?;

    Ok(StartChat {
        subject_id: payload.subject_id,
        context: ChatContext {
            kind,
            context_id,
            data: payload.context_data.unwrap_or_default(),
        },
        title,
    })
}
