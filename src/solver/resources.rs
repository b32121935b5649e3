//! cert-manager resources mirrored by the solver
//!
//! Only the fields the solver reads are modelled; everything else in the
//! objects is ignored on deserialization.

use kube::CustomResource;
use serde::{Deserialize, Serialize};

use super::types::{ProviderKey, SolverError};

/// Challenge type string for DNS-01 challenges
pub const DNS01_CHALLENGE_TYPE: &str = "DNS-01";

/// Default data key holding the ACME account key in its secret
pub const DEFAULT_PRIVATE_KEY_KEY: &str = "tls.key";

/// ACME challenge (`acme.cert-manager.io/v1`)
#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize)]
#[kube(
    group = "acme.cert-manager.io",
    version = "v1",
    kind = "Challenge",
    namespaced,
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeSpec {
    pub dns_name: String,
    pub key: String,
    pub token: String,
    #[serde(rename = "type")]
    pub challenge_type: String,
    pub issuer_ref: IssuerReference,
    #[serde(default)]
    pub wildcard: bool,
}

impl Challenge {
    /// Cache identity of the provider serving this challenge
    pub fn provider_key(&self) -> ProviderKey {
        ProviderKey::new(&self.spec.dns_name, &self.spec.key)
    }

    pub fn is_dns01(&self) -> bool {
        self.spec.challenge_type == DNS01_CHALLENGE_TYPE
    }
}

/// Reference to the issuer that authorized a challenge
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuerReference {
    pub name: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub group: String,
}

/// Scope of an issuer reference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssuerKind {
    Issuer,
    ClusterIssuer,
}

impl IssuerReference {
    /// Resolve the kind discriminator; an empty kind means `Issuer`
    pub fn issuer_kind(&self) -> Result<IssuerKind, SolverError> {
        match self.kind.as_str() {
            "" | "Issuer" => Ok(IssuerKind::Issuer),
            "ClusterIssuer" => Ok(IssuerKind::ClusterIssuer),
            other => Err(SolverError::Config(format!("unknown issuer kind '{}'", other))),
        }
    }
}

/// Selects a single data key of a secret
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretKeySelector {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl SecretKeySelector {
    pub fn data_key(&self) -> &str {
        match self.key.as_deref() {
            Some(key) if !key.is_empty() => key,
            _ => DEFAULT_PRIVATE_KEY_KEY,
        }
    }
}

/// ACME section of an issuer spec
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcmeIssuer {
    pub private_key_secret_ref: SecretKeySelector,
}

/// Namespaced issuer (`cert-manager.io/v1`)
#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize)]
#[kube(
    group = "cert-manager.io",
    version = "v1",
    kind = "Issuer",
    namespaced,
    schema = "disabled"
)]
pub struct IssuerSpec {
    #[serde(default)]
    pub acme: Option<AcmeIssuer>,
}

/// Cluster-scoped issuer (`cert-manager.io/v1`)
#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize)]
#[kube(
    group = "cert-manager.io",
    version = "v1",
    kind = "ClusterIssuer",
    schema = "disabled"
)]
pub struct ClusterIssuerSpec {
    #[serde(default)]
    pub acme: Option<AcmeIssuer>,
}
