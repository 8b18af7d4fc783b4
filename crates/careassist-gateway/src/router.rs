use std::time::Duration;

use axum::Router;
use axum::routing::{get, patch, post, put};
use tower_governor::GovernorLayer;
use tower_governor::governor::GovernorConfigBuilder;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::api;
use crate::state::SharedState;

/// Build the application router with all routes.
pub fn build_router(state: SharedState) -> Router {
    let rate_limit = state.config.gateway.rate_limit.clone();

    let chat = Router::new()
        .route("/api/chat/start", post(api::start_chat))
        .route("/api/chat/sessions", get(api::list_sessions))
        .route("/api/chat/{id}/message", post(api::send_message))
        .route("/api/chat/{id}/retry", post(api::retry_message))
        .route("/api/chat/{id}/messages", get(api::list_messages))
        .route("/api/chat/{id}/archive", put(api::archive_session))
        .route(
            "/api/chat/{id}",
            patch(api::rename_session).delete(api::delete_session),
        );

    let chat = if rate_limit.enabled {
        with_rate_limit(chat, rate_limit.per_second, rate_limit.burst_size)
    } else {
        chat
    };

    Router::new()
        .route("/health", get(api::health))
        .route("/api/status", get(api::status))
        .merge(chat)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Per-IP rate limit on the chat routes. Requires the server to be started
/// with connect info so the peer address is known.
fn with_rate_limit(
    router: Router<SharedState>,
    per_second: u64,
    burst_size: u32,
) -> Router<SharedState> {
    let Some(governor_conf) = GovernorConfigBuilder::default()
        .per_second(per_second)
        .burst_size(burst_size)
        .finish()
    else {
        warn!("invalid rate limit settings, serving chat routes without a limiter");
        return router;
    };
    let governor_limiter = governor_conf.limiter().clone();

    // Forget idle peers so the limiter state does not grow without bound.
    tokio::spawn(async move {
        let interval = Duration::from_secs(60);
        loop {
            tokio::time::sleep(interval).await;
            governor_limiter.retain_recent();
        }
    });

    router.layer(GovernorLayer::new(governor_conf))
}
