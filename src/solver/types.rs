//! Types shared across the solver pipeline
//!
//! Request and identity types handed between the challenge index, the
//! provider cache and the facade, plus the error taxonomy every stage reports.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur while resolving or answering a challenge
#[derive(Debug, Error)]
pub enum SolverError {
    /// Malformed or incomplete webhook config
    #[error("Invalid config: {0}")]
    Config(String),

    /// Config names a provider the registry does not know
    #[error("Unknown DNS provider '{0}'")]
    UnknownProvider(String),

    /// A challenge, issuer, secret or secret key is missing
    #[error("Not found: {0}")]
    NotFound(String),

    /// Key material could not be decoded
    #[error("Failed to decode private key: {0}")]
    Decode(String),

    /// The request digest does not match the recomputed key authorization
    #[error("Key authorization mismatch for challenge '{dns_name}'")]
    AuthorizationMismatch { dns_name: String },

    /// Key is neither RSA nor a supported elliptic curve
    #[error("Unsupported key type: {0}")]
    UnsupportedKeyType(String),

    /// Another value already occupies an environment variable the scope needs
    #[error("Environment variable '{name}' is already set")]
    EnvironmentConflict { name: String },

    /// The DNS provider failed to present or clean up the record
    #[error("DNS provider '{provider}' failed: {message}")]
    Provider { provider: String, message: String },

    /// Transport or API failure talking to the cluster
    #[error("Cluster store error: {0}")]
    Store(String),

    /// The challenge watch could not be established
    #[error("Challenge watch unavailable: {0}")]
    WatchUnavailable(String),
}

impl SolverError {
    /// Whether the host may reasonably re-invoke the operation unchanged
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SolverError::EnvironmentConflict { .. } | SolverError::Store(_)
        )
    }
}

impl From<kube::Error> for SolverError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(resp) if resp.code == 404 => SolverError::NotFound(resp.message),
            other => SolverError::Store(other.to_string()),
        }
    }
}

/// Pipeline stage a request was in when it failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Verifying,
    ResolvingProvider,
    Invoking,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Verifying => write!(f, "verifying"),
            Stage::ResolvingProvider => write!(f, "resolving provider"),
            Stage::Invoking => write!(f, "invoking provider"),
        }
    }
}

/// A [`SolverError`] tagged with the stage that produced it
#[derive(Debug, Error)]
#[error("{stage} failed: {error}")]
pub struct StageError {
    pub stage: Stage,
    #[source]
    pub error: SolverError,
}

impl StageError {
    pub fn new(stage: Stage, error: SolverError) -> Self {
        Self { stage, error }
    }
}

/// Challenge request as delivered by cert-manager
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeRequest {
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub action: String,
    #[serde(default, rename = "type")]
    pub challenge_type: String,
    pub dns_name: String,
    pub key: String,
    #[serde(default)]
    pub resource_namespace: String,
    #[serde(default, rename = "resolvedFQDN")]
    pub resolved_fqdn: String,
    #[serde(default)]
    pub resolved_zone: String,
    #[serde(default)]
    pub allow_ambient_credentials: bool,
    #[serde(default)]
    pub config: Option<serde_json::Value>,
}

/// Identity used to memoize providers per in-flight challenge
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProviderKey {
    pub dns_name: String,
    pub key: String,
}

impl ProviderKey {
    pub fn new(dns_name: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            dns_name: dns_name.into(),
            key: key.into(),
        }
    }
}

impl From<&ChallengeRequest> for ProviderKey {
    fn from(req: &ChallengeRequest) -> Self {
        Self::new(&req.dns_name, &req.key)
    }
}
