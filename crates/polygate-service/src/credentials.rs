//! Credential resolution for outbound backend requests. The gateway itself
//! is deliberately agnostic to *how* a deployment authenticates against
//! Kiro/Antigravity/Copilot upstreams — that's operator-specific and left
//! abstract, mirroring how `querymt::plugin::host::ProviderConfig` treats
//! provider secrets as opaque config values rather than a first-class type.
//!
//! [`StaticCredentialManager`] is the one concrete implementation shipped
//! here: it reads a single bearer token per backend name from the process
//! environment, which is enough to run the service end to end without
//! inventing a secrets-management story the gateway doesn't need to own.

use std::collections::HashMap;

use async_trait::async_trait;

/// Resolves the `Authorization` header value to attach to an outbound
/// request for a given backend. Implementations may rotate tokens, call
/// out to a vault, or refresh OAuth credentials; the gateway only needs
/// the resulting header value per call.
#[async_trait]
pub trait CredentialManager: Send + Sync {
    async fn credential_for(&self, backend_name: &str) -> Option<String>;
}

/// Reads `POLYGATE_CRED_<BACKEND_NAME>` (backend name upper-cased, `-` to
/// `_`) once at startup and serves it from memory for the process
/// lifetime. Missing entries resolve to `None`, meaning requests to that
/// backend are sent unauthenticated (acceptable for local/dev backends
/// behind their own network boundary).
pub struct StaticCredentialManager {
    tokens: HashMap<String, String>,
}

impl StaticCredentialManager {
    pub fn from_env(backend_names: &[String]) -> Self {
        let mut tokens = HashMap::new();
        for name in backend_names {
            let env_key = format!("POLYGATE_CRED_{}", name.to_uppercase().replace('-', "_"));
            if let Ok(value) = std::env::var(&env_key) {
                if !value.is_empty() {
                    tokens.insert(name.clone(), value);
                }
            }
        }
        Self { tokens }
    }
}

#[async_trait]
impl CredentialManager for StaticCredentialManager {
    async fn credential_for(&self, backend_name: &str) -> Option<String> {
        self.tokens.get(backend_name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_credential_resolves_to_none() {
        let manager = StaticCredentialManager::from_env(&["kiro-gateway".to_string()]);
        assert!(manager.credential_for("kiro-gateway").await.is_none());
    }

    #[tokio::test]
    async fn reads_env_var_for_backend_name() {
        std::env::set_var("POLYGATE_CRED_TEST_BACKEND", "secret-token");
        let manager = StaticCredentialManager::from_env(&["test-backend".to_string()]);
        assert_eq!(
            manager.credential_for("test-backend").await,
            Some("secret-token".to_string())
        );
        std::env::remove_var("POLYGATE_CRED_TEST_BACKEND");
    }
}
