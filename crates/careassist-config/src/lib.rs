pub mod loader;
pub mod model;

pub use loader::ConfigLoader;
pub use model::{
    AppConfig, BudgetConfig, ChatConfig, DatabaseConfig, GatewayConfig, IdempotencyConfig,
    LlmConfig, RateLimitConfig, RetryConfig, SubjectGrant,
};
