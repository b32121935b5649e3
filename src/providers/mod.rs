//! DNS providers
//!
//! Available providers:
//! - [`ManualProvider`] - logs the record for an operator to create by hand
//! - [`ExecProvider`] - runs an external program per record
//!
//! Providers are constructed by the [`ProviderRegistry`] while the solver
//! holds the credential scope, so constructors may read their configuration
//! from the process environment.

pub mod exec;
pub mod manual;

pub use exec::ExecProvider;
pub use manual::ManualProvider;

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use tracing::debug;

use crate::solver::authorization::challenge_digest;
use crate::solver::SolverError;

/// ACME challenge record label
pub const ACME_CHALLENGE_RECORD: &str = "_acme-challenge";

/// Capability to publish and remove DNS-01 TXT records.
///
/// `domain` is the record name cert-manager resolved for the challenge;
/// implementations must be safe to call concurrently.
#[async_trait]
pub trait DnsProvider: Send + Sync + Debug {
    /// Registry identifier, e.g. "manual"
    fn name(&self) -> &'static str;

    async fn present(&self, domain: &str, token: &str, key_auth: &str) -> Result<(), SolverError>;

    /// Remove the record; must tolerate a record that was never created
    async fn cleanup(&self, domain: &str, token: &str, key_auth: &str) -> Result<(), SolverError>;
}

/// TXT record a provider should create for a challenge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeRecord {
    /// Absolute record name with trailing dot
    pub fqdn: String,
    pub value: String,
}

/// Record name lookups shared by every provider a registry builds.
///
/// Holds one entry per record a provider is currently responsible for: a
/// lookup adds it and a successful cleanup forgets it. The solver clears the
/// whole cache after a provider error so a retry starts from fresh lookups.
/// Names are derived with [`record_fqdn`] today; a provider that discovers
/// zones through DNS keeps its answers here too.
#[derive(Debug, Default)]
pub struct RecordCache {
    fqdns: RwLock<HashMap<String, String>>,
}

impl RecordCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, domain: &str, key_auth: &str) -> ChallengeRecord {
        ChallengeRecord {
            fqdn: self.fqdn(domain),
            value: challenge_digest(key_auth),
        }
    }

    fn fqdn(&self, domain: &str) -> String {
        if let Some(hit) = self.fqdns.read().get(domain) {
            return hit.clone();
        }

        let fqdn = record_fqdn(domain);
        self.fqdns.write().insert(domain.to_string(), fqdn.clone());
        fqdn
    }

    /// Drop the entry for a record that has been cleaned up
    pub fn forget(&self, domain: &str) {
        self.fqdns.write().remove(domain);
    }

    pub fn len(&self) -> usize {
        self.fqdns.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.fqdns.read().is_empty()
    }

    /// Forget every memoized lookup
    pub fn clear(&self) {
        let mut fqdns = self.fqdns.write();
        if !fqdns.is_empty() {
            debug!(entries = fqdns.len(), "Clearing record lookup cache");
        }
        fqdns.clear();
    }
}

/// Absolute `_acme-challenge` record name for a domain or resolved FQDN
pub fn record_fqdn(domain: &str) -> String {
    let base = domain.strip_prefix("*.").unwrap_or(domain).trim_end_matches('.');
    let prefix = format!("{}.", ACME_CHALLENGE_RECORD);

    if base.starts_with(&prefix) {
        format!("{}.", base)
    } else {
        format!("{}{}.", prefix, base)
    }
}

/// Builds a provider; runs inside the credential scope
pub type Constructor =
    Arc<dyn Fn(Arc<RecordCache>) -> Result<Arc<dyn DnsProvider>, SolverError> + Send + Sync>;

/// Maps provider identifiers to constructors
#[derive(Clone)]
pub struct ProviderRegistry {
    constructors: HashMap<String, Constructor>,
    records: Arc<RecordCache>,
}

impl ProviderRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self {
            constructors: HashMap::new(),
            records: Arc::new(RecordCache::new()),
        }
    }

    /// Registry with every provider shipped in this crate
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(manual::NAME, |records| Ok(Arc::new(ManualProvider::new(records))));
        registry.register(exec::NAME, |records| Ok(Arc::new(ExecProvider::from_env(records)?)));
        registry
    }

    pub fn register<F>(&mut self, id: &str, constructor: F)
    where
        F: Fn(Arc<RecordCache>) -> Result<Arc<dyn DnsProvider>, SolverError> + Send + Sync + 'static,
    {
        self.constructors.insert(id.to_string(), Arc::new(constructor));
    }

    pub fn contains(&self, id: &str) -> bool {
        self.constructors.contains_key(id)
    }

    /// Construct the provider registered under `id`
    pub fn build(&self, id: &str) -> Result<Arc<dyn DnsProvider>, SolverError> {
        let constructor = self
            .constructors
            .get(id)
            .ok_or_else(|| SolverError::UnknownProvider(id.to_string()))?;

        constructor(self.records.clone())
    }

    pub fn record_cache(&self) -> &Arc<RecordCache> {
        &self.records
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

impl Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut ids: Vec<_> = self.constructors.keys().collect();
        ids.sort();
        f.debug_struct("ProviderRegistry").field("providers", &ids).finish()
    }
}
