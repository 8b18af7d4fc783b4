use std::future::Future;
use std::sync::Arc;

use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use careassist_db::{ClaimOutcome, IdempotencyRecords};
use dashmap::DashSet;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{ApiError, ApiResult};

pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";
pub const REPLAYED_HEADER: &str = "idempotent-replayed";

/// A successful handler result before it is recorded and sent.
#[derive(Debug, Clone)]
pub struct JsonReply {
    pub status: StatusCode,
    pub body: Value,
}

impl JsonReply {
    pub fn ok(body: Value) -> Self {
        Self {
            status: StatusCode::OK,
            body,
        }
    }

    pub fn with_status(status: StatusCode, body: Value) -> Self {
        Self { status, body }
    }
}

/// Identity of one idempotent delivery.
#[derive(Debug, Clone)]
pub struct IdempotentRequest {
    pub key: String,
    pub user_id: String,
    pub path: String,
    /// Canonical snapshot of the request body.
    pub request: String,
}

/// Wraps mutating handlers so each key produces at most one side effect.
///
/// Only 2xx results are recorded. A record store that errors never fails
/// the request; it only loses the replay guarantee for that delivery.
///
/// Keys held by a task in this process are tracked in memory, so a pending
/// record that outlives the store's takeover window is still never claimed
/// twice while its owner runs.
#[derive(Clone)]
pub struct IdempotencyCache {
    records: Arc<dyn IdempotencyRecords>,
    in_flight: Arc<DashSet<String>>,
}

impl IdempotencyCache {
    pub fn new(records: Arc<dyn IdempotencyRecords>) -> Self {
        Self {
            records,
            in_flight: Arc::new(DashSet::new()),
        }
    }

    pub async fn run<Fut>(&self, request: IdempotentRequest, work: Fut) -> ApiResult<Response>
    where
        Fut: Future<Output = ApiResult<JsonReply>>,
    {
        if !self.in_flight.insert(request.key.clone()) {
            debug!(key = %request.key, "key is held by a running request");
            return Err(ApiError::RequestInProgress);
        }
        let _held = InFlight {
            keys: &self.in_flight,
            key: &request.key,
        };

        let claimed = match self.records.claim(
            &request.key,
            &request.user_id,
            &request.path,
            &request.request,
        ) {
            Ok(ClaimOutcome::Claimed) => true,
            Ok(ClaimOutcome::Replay(stored)) => {
                debug!(key = %request.key, "replaying stored response");
                return Ok(replayed(stored.status, stored.body));
            }
            Ok(ClaimOutcome::InFlight) => return Err(ApiError::RequestInProgress),
            Ok(ClaimOutcome::Mismatch(reason)) => return Err(ApiError::validation(reason)),
            Err(e) => {
                warn!(key = %request.key, "idempotency store unavailable, proceeding uncached: {e}");
                false
            }
        };

        let result = work.await;
        if !claimed {
            return result.map(into_response);
        }

        match result {
            Ok(reply) if reply.status.is_success() => {
                let body = reply.body.to_string();
                if let Err(e) = self
                    .records
                    .complete(&request.key, reply.status.as_u16(), &body)
                {
                    warn!(key = %request.key, "failed to record idempotent response: {e}");
                }
                Ok(json_response(reply.status, body))
            }
            other => {
                if let Err(e) = self.records.release(&request.key) {
                    warn!(key = %request.key, "failed to release idempotency key: {e}");
                }
                other.map(into_response)
            }
        }
    }
}

struct InFlight<'a> {
    keys: &'a DashSet<String>,
    key: &'a str,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.keys.remove(self.key);
    }
}

fn into_response(reply: JsonReply) -> Response {
    json_response(reply.status, reply.body.to_string())
}

fn json_response(status: StatusCode, body: String) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, HeaderValue::from_static("application/json"))],
        body,
    )
        .into_response()
}

fn replayed(status: u16, body: String) -> Response {
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::OK);
    let mut response = json_response(status, body);
    response
        .headers_mut()
        .insert(REPLAYED_HEADER, HeaderValue::from_static("true"));
    response
}
