//! DNS-01 solver
//!
//! The facade cert-manager drives through the webhook. Every request walks
//! the same stages:
//!
//! 1. **Verifying** - find the mirrored challenge, resolve the issuer's
//!    account key and check the request digest against the recomputed key
//!    authorization.
//! 2. **Resolving provider** - reuse the cached provider for the challenge or
//!    build one from the request config and its credentials.
//! 3. **Invoking provider** - call `present` or `cleanup` with the
//!    credentials applied to the process environment.
//!
//! A failure carries the stage it happened in; nothing touches DNS unless
//! verification passed.

pub mod authorization;
pub mod cache;
pub mod challenges;
pub mod config;
pub mod env_scope;
pub mod keys;
pub mod resources;
pub mod store;
pub mod types;

pub use cache::{CachedProvider, ProviderCache};
pub use challenges::ChallengeIndex;
pub use env_scope::{EnvGuard, EnvPolicy, EnvironmentScope};
pub use keys::{IssuerKey, SecretKeyResolver};
pub use types::{ChallengeRequest, ProviderKey, SolverError, Stage, StageError};

use kube::{Api, Client, ResourceExt};
use std::sync::Arc;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

use crate::providers::ProviderRegistry;
use authorization::KeyAuthorization;
use config::{EnvMap, EnvSource, WebhookConfig};
use resources::Challenge;
use store::{IssuerStore, KubeStore, SecretData, SecretStore};

/// Name cert-manager addresses this solver by
pub const SOLVER_NAME: &str = "dns01-solver";

/// Runtime settings for [`Solver::initialize`]
#[derive(Debug, Clone)]
pub struct SolverSettings {
    /// Namespace holding secrets referenced by cluster issuers
    pub cluster_resource_namespace: String,
    pub env_policy: EnvPolicy,
    pub registry: ProviderRegistry,
}

impl SolverSettings {
    pub fn new(cluster_resource_namespace: impl Into<String>) -> Self {
        Self {
            cluster_resource_namespace: cluster_resource_namespace.into(),
            env_policy: EnvPolicy::default(),
            registry: ProviderRegistry::with_builtin(),
        }
    }

    pub fn with_env_policy(mut self, policy: EnvPolicy) -> Self {
        self.env_policy = policy;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    Present,
    Cleanup,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operation::Present => write!(f, "present"),
            Operation::Cleanup => write!(f, "cleanup"),
        }
    }
}

pub struct Solver {
    resolver: SecretKeyResolver,
    secrets: Arc<dyn SecretStore>,
    index: Arc<ChallengeIndex>,
    cache: Arc<ProviderCache>,
    registry: ProviderRegistry,
    env: EnvironmentScope,
}

impl Solver {
    /// Assemble a solver over existing stores and index.
    ///
    /// Does not start any background task; see [`Solver::initialize`].
    pub fn new(
        issuers: Arc<dyn IssuerStore>,
        secrets: Arc<dyn SecretStore>,
        index: Arc<ChallengeIndex>,
        cache: Arc<ProviderCache>,
        settings: SolverSettings,
    ) -> Self {
        Self {
            resolver: SecretKeyResolver::new(issuers, secrets.clone(), settings.cluster_resource_namespace),
            secrets,
            index,
            cache,
            registry: settings.registry,
            env: EnvironmentScope::new(settings.env_policy),
        }
    }

    pub fn name(&self) -> &'static str {
        SOLVER_NAME
    }

    /// Wire the solver to the cluster and wait for the challenge index to sync.
    ///
    /// Spawns the challenge watch and the provider eviction loop; both stop
    /// once `shutdown` flips.
    pub async fn initialize(
        client: Client,
        settings: SolverSettings,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self, SolverError> {
        info!(
            namespace = %settings.cluster_resource_namespace,
            policy = %settings.env_policy,
            providers = ?settings.registry,
            "Initializing DNS-01 solver"
        );

        let store = Arc::new(KubeStore::new(client.clone()));
        let (index, deletions) = ChallengeIndex::new();
        let index = Arc::new(index);
        let cache = Arc::new(ProviderCache::new());

        tokio::spawn(cache.clone().run_evictions(deletions));

        let (ready_tx, ready_rx) = oneshot::channel();
        let watch_index = index.clone();
        let api: Api<Challenge> = Api::all(client);
        tokio::spawn(async move {
            watch_index.run_watch(api, ready_tx, shutdown).await;
        });

        ready_rx
            .await
            .map_err(|_| SolverError::WatchUnavailable("watch stopped before initial list".to_string()))??;

        info!(challenges = index.len(), "Challenge index synced");
        Ok(Self::new(store.clone(), store, index, cache, settings))
    }

    pub async fn present(&self, req: &ChallengeRequest) -> Result<(), StageError> {
        self.run(Operation::Present, req).await
    }

    /// Same path as [`Solver::present`]; a provider is rebuilt if none is cached
    pub async fn cleanup(&self, req: &ChallengeRequest) -> Result<(), StageError> {
        self.run(Operation::Cleanup, req).await
    }

    async fn run(&self, op: Operation, req: &ChallengeRequest) -> Result<(), StageError> {
        info!(
            uid = %req.uid,
            dns_name = %req.dns_name,
            fqdn = %req.resolved_fqdn,
            operation = %op,
            "Handling challenge"
        );

        let result = async {
            let verified = self
                .verify(req)
                .await
                .map_err(|e| StageError::new(Stage::Verifying, e))?;

            let cached = self
                .provider_for(req)
                .await
                .map_err(|e| StageError::new(Stage::ResolvingProvider, e))?;

            self.invoke(op, &cached, req, &verified)
                .await
                .map_err(|e| StageError::new(Stage::Invoking, e))
        }
        .await;

        match &result {
            Ok(()) => info!(dns_name = %req.dns_name, operation = %op, "Challenge handled"),
            Err(e) => warn!(
                dns_name = %req.dns_name,
                operation = %op,
                stage = %e.stage,
                error = %e.error,
                "Challenge failed"
            ),
        }
        result
    }

    async fn verify(&self, req: &ChallengeRequest) -> Result<KeyAuthorization, SolverError> {
        let challenge = self.index.lookup(&req.dns_name, &req.key)?;
        let namespace = challenge
            .namespace()
            .unwrap_or_else(|| req.resource_namespace.clone());

        let key = self.resolver.resolve(&challenge.spec.issuer_ref, &namespace).await?;
        debug!(dns_name = %req.dns_name, algorithm = key.algorithm(), "Resolved issuer key");

        authorization::compute_and_verify(&challenge, &key, &req.key)
    }

    async fn provider_for(&self, req: &ChallengeRequest) -> Result<Arc<CachedProvider>, SolverError> {
        let key = ProviderKey::from(req);
        self.cache.get_or_build(&key, || self.build_provider(req)).await
    }

    async fn build_provider(&self, req: &ChallengeRequest) -> Result<CachedProvider, SolverError> {
        let cfg = WebhookConfig::parse(req.config.as_ref())?;
        if !self.registry.contains(&cfg.provider) {
            return Err(SolverError::UnknownProvider(cfg.provider));
        }

        let envs = match cfg.env_source(&req.resource_namespace)? {
            EnvSource::Static(envs) => envs.clone(),
            EnvSource::Secret { namespace, name } => {
                let data = self.secrets.get_secret(namespace, name).await?;
                secret_envs(data, namespace, name)?
            }
        };

        let provider = {
            let _guard = self.env.enter(&envs).await?;
            self.registry.build(&cfg.provider)?
        };

        info!(
            dns_name = %req.dns_name,
            provider = provider.name(),
            envs = ?envs.keys().collect::<Vec<_>>(),
            "Built DNS provider"
        );
        Ok(CachedProvider { provider, envs })
    }

    async fn invoke(
        &self,
        op: Operation,
        cached: &CachedProvider,
        req: &ChallengeRequest,
        verified: &KeyAuthorization,
    ) -> Result<(), SolverError> {
        let domain = if req.resolved_fqdn.is_empty() {
            req.dns_name.as_str()
        } else {
            req.resolved_fqdn.as_str()
        };

        let result = {
            let _guard = self.env.enter(&cached.envs).await?;
            match op {
                Operation::Present => {
                    cached
                        .provider
                        .present(domain, &verified.token, &verified.key_authorization)
                        .await
                }
                Operation::Cleanup => {
                    cached
                        .provider
                        .cleanup(domain, &verified.token, &verified.key_authorization)
                        .await
                }
            }
        };

        if result.is_err() {
            self.registry.record_cache().clear();
        }
        result
    }
}

/// Secret data as environment values; every value must be UTF-8 and every
/// entry storable in the process environment
fn secret_envs(data: SecretData, namespace: &str, name: &str) -> Result<EnvMap, SolverError> {
    data.into_iter()
        .map(|(key, value)| {
            let value = String::from_utf8(value).map_err(|_| {
                SolverError::Decode(format!(
                    "secret {}/{} key '{}' is not valid UTF-8",
                    namespace, name, key
                ))
            })?;
            if let Some(reason) = config::invalid_env(&key, &value) {
                return Err(SolverError::Decode(format!("secret {}/{}: {}", namespace, name, reason)));
            }
            Ok((key, value))
        })
        .collect()
}
