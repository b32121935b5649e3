//! Cluster object stores
//!
//! Trait seams for the secret, issuer and cluster-issuer lookups the solver
//! performs, with a kube-backed implementation for in-cluster use.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client};
use std::collections::BTreeMap;
use tracing::debug;

use super::resources::{AcmeIssuer, ClusterIssuer, Issuer};
use super::types::SolverError;

/// Raw secret data, keyed by data key
pub type SecretData = BTreeMap<String, Vec<u8>>;

/// Read access to secrets
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<SecretData, SolverError>;
}

/// Read access to namespaced and cluster-scoped issuers
#[async_trait]
pub trait IssuerStore: Send + Sync {
    /// ACME section of a namespaced issuer
    async fn get_issuer(&self, namespace: &str, name: &str) -> Result<AcmeIssuer, SolverError>;

    /// ACME section of a cluster issuer
    async fn get_cluster_issuer(&self, name: &str) -> Result<AcmeIssuer, SolverError>;
}

/// Stores backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn acme_section(acme: Option<AcmeIssuer>, what: &str) -> Result<AcmeIssuer, SolverError> {
    acme.ok_or_else(|| SolverError::NotFound(format!("{} has no ACME configuration", what)))
}

#[async_trait]
impl SecretStore for KubeStore {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<SecretData, SolverError> {
        debug!(namespace = %namespace, name = %name, "Fetching secret");

        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = api.get_opt(name).await?.ok_or_else(|| {
            SolverError::NotFound(format!("secret {}/{}", namespace, name))
        })?;

        Ok(secret
            .data
            .unwrap_or_default()
            .into_iter()
            .map(|(key, value)| (key, value.0))
            .collect())
    }
}

#[async_trait]
impl IssuerStore for KubeStore {
    async fn get_issuer(&self, namespace: &str, name: &str) -> Result<AcmeIssuer, SolverError> {
        debug!(namespace = %namespace, name = %name, "Fetching issuer");

        let api: Api<Issuer> = Api::namespaced(self.client.clone(), namespace);
        let issuer = api.get_opt(name).await?.ok_or_else(|| {
            SolverError::NotFound(format!("issuer {}/{}", namespace, name))
        })?;

        acme_section(issuer.spec.acme, &format!("issuer {}/{}", namespace, name))
    }

    async fn get_cluster_issuer(&self, name: &str) -> Result<AcmeIssuer, SolverError> {
        debug!(name = %name, "Fetching cluster issuer");

        let api: Api<ClusterIssuer> = Api::all(self.client.clone());
        let issuer = api
            .get_opt(name)
            .await?
            .ok_or_else(|| SolverError::NotFound(format!("clusterissuer {}", name)))?;

        acme_section(issuer.spec.acme, &format!("clusterissuer {}", name))
    }
}
