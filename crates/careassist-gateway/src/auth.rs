use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use tracing::warn;

use crate::error::ApiError;
use crate::state::SharedState;

pub const USER_ID_HEADER: &str = "x-user-id";

/// Authenticated portal user, as forwarded by the portal's auth layer.
#[derive(Debug, Clone)]
pub struct Caller {
    pub user_id: String,
}

impl FromRequestParts<SharedState> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &SharedState,
    ) -> Result<Self, Self::Rejection> {
        if let Some(expected) = &state.config.gateway.api_key {
            let provided = parts
                .headers
                .get(AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
                .map(str::trim);
            match provided {
                Some(token) if constant_time_eq(token.as_bytes(), expected.as_bytes()) => {}
                Some(_) => {
                    warn!(target: "security", path = %parts.uri.path(), "rejected request with invalid api key");
                    return Err(ApiError::Unauthorized("invalid api key".into()));
                }
                None => {
                    return Err(ApiError::Unauthorized(
                        "missing Authorization: Bearer header".into(),
                    ));
                }
            }
        }

        let user_id = parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ApiError::Unauthorized("missing X-User-Id header".into()))?;
        state
            .validator
            .identifier("X-User-Id", user_id)
            .map_err(|_| ApiError::Unauthorized("malformed X-User-Id header".into()))?;

        Ok(Self {
            user_id: user_id.to_string(),
        })
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
