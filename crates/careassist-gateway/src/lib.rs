pub mod api;
pub mod auth;
pub mod error;
pub mod idempotency;
pub mod router;
pub mod server;
pub mod state;

pub use error::{ApiError, ApiResult};
pub use idempotency::IdempotencyCache;
pub use router::build_router;
pub use server::GatewayServer;
pub use state::{AppState, SharedState};
