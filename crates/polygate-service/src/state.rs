//! Shared application state threaded through every axum handler, built
//! once in `main` and cheaply `Clone`d per request via `Arc`, mirroring
//! the teacher's `ServerState { registry: Arc<PluginRegistry>, .. }`
//! pattern in `querymt-service`.

use std::sync::Arc;

use polygate_core::backend::BackendRegistry;
use polygate_core::config::GatewayConfig;
use polygate_core::conversation::ConversationStateManager;
use polygate_core::proxy::ProxyEngine;
use polygate_core::ratelimit::RateLimitRegistry;
use polygate_core::signature::{AsyncWriteQueue, SignatureStore};
use polygate_core::signature::sqlite::SqliteSignatureStore;

use crate::credentials::CredentialManager;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub registry: Arc<BackendRegistry>,
    pub signatures: Arc<SignatureStore>,
    pub conversations: Arc<ConversationStateManager>,
    pub rate_limits: Arc<RateLimitRegistry>,
    pub proxy: Arc<ProxyEngine>,
    pub credentials: Arc<dyn CredentialManager>,
    pub auth_key: Option<String>,
}

impl AppState {
    pub async fn build(config: GatewayConfig, credentials: Arc<dyn CredentialManager>, auth_key: Option<String>) -> anyhow::Result<Self> {
        let l2 = Arc::new(SqliteSignatureStore::new(&config.cache.db_path).await?);
        let queue = if config.async_queue.max_queue_size > 0 {
            Some(AsyncWriteQueue::start(l2.clone(), config.async_queue.clone()))
        } else {
            None
        };
        let signatures = Arc::new(SignatureStore::new(l2.clone(), &config.cache, queue));
        let conversations = Arc::new(ConversationStateManager::new(l2, None));
        let rate_limits = Arc::new(RateLimitRegistry::new());
        let proxy = Arc::new(ProxyEngine::new(rate_limits.clone()));
        let registry = Arc::new(BackendRegistry::new(config.backends.clone()));

        Ok(Self {
            config: Arc::new(config),
            registry,
            signatures,
            conversations,
            rate_limits,
            proxy,
            credentials,
            auth_key,
        })
    }
}
