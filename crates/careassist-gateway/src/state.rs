use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use careassist_agents::{ChatOrchestrator, InMemorySubjectDirectory, ProviderGateway};
use careassist_common::Result;
use careassist_config::AppConfig;
use careassist_db::{ConversationStore, IdempotencyRecords, IdempotencyStore};
use careassist_security::InputValidator;
use tracing::info;

use crate::idempotency::IdempotencyCache;

/// Shared application state accessible from all request handlers.
pub struct AppState {
    pub config: AppConfig,
    pub orchestrator: Arc<ChatOrchestrator>,
    pub idempotency: IdempotencyCache,
    pub records: Arc<dyn IdempotencyRecords>,
    pub validator: InputValidator,
    pub started_at: Instant,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(
        config: AppConfig,
        orchestrator: Arc<ChatOrchestrator>,
        records: Arc<dyn IdempotencyRecords>,
    ) -> Self {
        let validator = InputValidator::new(config.chat.max_message_chars);
        Self {
            idempotency: IdempotencyCache::new(records.clone()),
            records,
            validator,
            orchestrator,
            config,
            started_at: Instant::now(),
        }
    }

    /// Open both stores on `db_path` and wire the configured provider.
    pub fn open(config: AppConfig, db_path: &Path) -> Result<Self> {
        let store = Arc::new(ConversationStore::open(db_path)?);
        let records = IdempotencyStore::open(db_path)?
            .with_pending_ttl(Duration::from_secs(config.idempotency.pending_ttl_secs));
        let gateway = Arc::new(ProviderGateway::from_config(&config.llm, &config.retry)?);
        let subjects = Arc::new(InMemorySubjectDirectory::from_grants(&config.subjects));
        info!(
            "loaded {} subject grant(s), provider {}",
            config.subjects.len(),
            gateway.provider_id()
        );

        let orchestrator = Arc::new(ChatOrchestrator::new(
            store,
            gateway,
            subjects,
            &config.budget,
            &config.chat,
        ));
        Ok(Self::new(config, orchestrator, Arc::new(records)))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.config.gateway.request_timeout_secs.max(1))
    }

    pub fn idempotency_retention(&self) -> Duration {
        Duration::from_secs(self.config.idempotency.retention_hours * 3600)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use careassist_common::Error;

    #[test]
    fn open_wires_stores_and_provider() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.llm.provider = "ollama".into();
        config.gateway.request_timeout_secs = 0;

        let state = AppState::open(config, &dir.path().join("careassist.db")).unwrap();
        assert_eq!(state.orchestrator.gateway().provider_id(), "ollama");
        assert_eq!(state.request_timeout(), Duration::from_secs(1));
        assert_eq!(state.idempotency_retention(), Duration::from_secs(48 * 3600));
        assert!(dir.path().join("careassist.db").exists());
    }

    #[test]
    fn open_rejects_missing_provider_key() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.llm.provider = "anthropic".into();
        config.llm.api_key = None;

        let err = AppState::open(config, &dir.path().join("careassist.db"))
            .err()
            .unwrap();
        assert!(matches!(err, Error::Config(_)));
    }
}
