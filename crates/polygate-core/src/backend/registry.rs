//! `BackendRegistry` (C8): enabled-backend bookkeeping over
//! [`crate::config::BackendConfig`], grounded on
//! `original_source/src/gateway/routing.py::get_sorted_backends`.

use std::collections::HashMap;

use crate::config::BackendConfig;

pub struct BackendRegistry {
    backends: HashMap<String, BackendConfig>,
}

impl BackendRegistry {
    pub fn new(backends: Vec<BackendConfig>) -> Self {
        Self {
            backends: backends.into_iter().map(|b| (b.name.clone(), b)).collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&BackendConfig> {
        self.backends.get(name)
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.backends.get(name).map(|b| b.enabled).unwrap_or(false)
    }

    /// Enabled backends in ascending priority order (lower number = tried
    /// first), ties broken by name for determinism.
    pub fn sorted_backends(&self) -> Vec<&BackendConfig> {
        let mut enabled: Vec<&BackendConfig> = self.backends.values().filter(|b| b.enabled).collect();
        enabled.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.name.cmp(&b.name)));
        enabled
    }
}
