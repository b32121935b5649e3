//! Provider cache
//!
//! Building a provider means fetching its config, maybe a secret, and running
//! its constructor under the credential scope, so the solver keeps one built
//! provider per in-flight challenge. Entries go away when the challenge
//! index reports the challenge deleted.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::config::EnvMap;
use super::types::{ProviderKey, SolverError};
use crate::providers::DnsProvider;

/// A built provider and the environment it must run under
pub struct CachedProvider {
    pub provider: Arc<dyn DnsProvider>,
    pub envs: EnvMap,
}

impl std::fmt::Debug for CachedProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Env values are credentials
        f.debug_struct("CachedProvider")
            .field("provider", &self.provider.name())
            .field("envs", &self.envs.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[derive(Default)]
pub struct ProviderCache {
    entries: RwLock<HashMap<ProviderKey, Arc<CachedProvider>>>,
}

impl ProviderCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &ProviderKey) -> Option<Arc<CachedProvider>> {
        self.entries.read().get(key).cloned()
    }

    /// Return the cached provider for `key`, building it on a miss.
    ///
    /// `build` runs without any lock held. Two callers missing on the same key
    /// may both build; the last insert wins and both get a usable provider.
    pub async fn get_or_build<F, Fut>(
        &self,
        key: &ProviderKey,
        build: F,
    ) -> Result<Arc<CachedProvider>, SolverError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<CachedProvider, SolverError>>,
    {
        if let Some(hit) = self.get(key) {
            return Ok(hit);
        }

        debug!(dns_name = %key.dns_name, "Provider cache miss");
        let built = Arc::new(build().await?);

        self.entries.write().insert(key.clone(), built.clone());
        Ok(built)
    }

    pub fn evict(&self, key: &ProviderKey) -> bool {
        self.entries.write().remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Drain deletion notifications until every sender is gone
    pub async fn run_evictions(self: Arc<Self>, mut deletions: mpsc::UnboundedReceiver<ProviderKey>) {
        while let Some(key) = deletions.recv().await {
            if self.evict(&key) {
                debug!(dns_name = %key.dns_name, "Evicted provider for deleted challenge");
            }
        }
        info!("Provider eviction loop stopped");
    }
}
