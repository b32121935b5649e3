//! Per-challenge webhook config
//!
//! The `config` blob of a cert-manager solver stanza:
//!
//! ```json
//! {
//!   "provider": "exec",
//!   "envs": {"EXEC_PATH": "/usr/local/bin/update-dns"},
//!   "envFrom": {"secret": {"name": "dns-creds", "namespace": "cert-manager"}}
//! }
//! ```

use serde::Deserialize;
use std::collections::HashMap;

use super::types::SolverError;

/// Environment map handed to a provider
pub type EnvMap = HashMap<String, String>;

/// Secret holding provider environment values, one data key per variable
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SecretEnv {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct EnvFrom {
    #[serde(default)]
    pub secret: SecretEnv,
}

/// Where a provider's credentials come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvSource<'a> {
    Static(&'a EnvMap),
    Secret { namespace: &'a str, name: &'a str },
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookConfig {
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub envs: Option<EnvMap>,
    #[serde(default)]
    pub env_from: Option<EnvFrom>,
}

/// Why `name=value` cannot be placed in the process environment, if it can't
pub fn invalid_env(name: &str, value: &str) -> Option<String> {
    if name.is_empty() {
        Some("environment variable name is empty".to_string())
    } else if name.contains('=') || name.contains('\0') {
        Some(format!("environment variable name {:?} contains '=' or NUL", name))
    } else if value.contains('\0') {
        Some(format!("value of environment variable '{}' contains NUL", name))
    } else {
        None
    }
}

impl WebhookConfig {
    /// Decode and validate a config blob
    pub fn parse(raw: Option<&serde_json::Value>) -> Result<Self, SolverError> {
        let raw = raw.ok_or_else(|| SolverError::Config("config is required".to_string()))?;

        let cfg: WebhookConfig = serde_json::from_value(raw.clone())
            .map_err(|e| SolverError::Config(format!("failed to unmarshal config: {}", e)))?;

        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), SolverError> {
        if self.provider.is_empty() {
            return Err(SolverError::Config("provider is required".to_string()));
        }

        if let Some(envs) = &self.envs {
            if let Some(reason) = envs.iter().find_map(|(k, v)| invalid_env(k, v)) {
                return Err(SolverError::Config(reason));
            }
        }

        match (&self.envs, &self.env_from) {
            (_, Some(from)) if from.secret.name.is_empty() => {
                Err(SolverError::Config("secret name is required".to_string()))
            }
            (None, None) => Err(SolverError::Config("envs or envFrom is required".to_string())),
            _ => Ok(()),
        }
    }

    /// Credential source; static `envs` take precedence over `envFrom`
    pub fn env_source<'a>(&'a self, default_namespace: &'a str) -> Result<EnvSource<'a>, SolverError> {
        match (&self.envs, &self.env_from) {
            (Some(envs), _) => Ok(EnvSource::Static(envs)),
            (None, Some(from)) => Ok(EnvSource::Secret {
                namespace: from
                    .secret
                    .namespace
                    .as_deref()
                    .filter(|ns| !ns.is_empty())
                    .unwrap_or(default_namespace),
                name: &from.secret.name,
            }),
            (None, None) => Err(SolverError::Config("envs or envFrom is required".to_string())),
        }
    }
}
