//! Exec provider
//!
//! Hands each record to an external program, for DNS services without a
//! built-in provider. Configured through the environment:
//!
//! - `EXEC_PATH` - program to run (required)
//! - `EXEC_MODE` - `RAW` to pass the unprocessed challenge instead of the record
//!
//! Default mode runs `EXEC_PATH present|cleanup <fqdn> <value>`; RAW mode runs
//! `EXEC_PATH present|cleanup -- <domain> <token> <key_auth>`.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, info};

use super::{DnsProvider, RecordCache};
use crate::solver::SolverError;

pub const NAME: &str = "exec";

pub const EXEC_PATH_ENV: &str = "EXEC_PATH";
pub const EXEC_MODE_ENV: &str = "EXEC_MODE";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecMode {
    /// Pass the computed record name and value
    Record,
    /// Pass domain, token and key authorization untouched
    Raw,
}

#[derive(Debug)]
pub struct ExecProvider {
    program: PathBuf,
    mode: ExecMode,
    records: Arc<RecordCache>,
}

impl ExecProvider {
    pub fn new(program: impl Into<PathBuf>, mode: ExecMode, records: Arc<RecordCache>) -> Self {
        Self {
            program: program.into(),
            mode,
            records,
        }
    }

    /// Read `EXEC_PATH` and `EXEC_MODE` from the current environment
    pub fn from_env(records: Arc<RecordCache>) -> Result<Self, SolverError> {
        let program = std::env::var(EXEC_PATH_ENV)
            .ok()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| SolverError::Config(format!("{} is required for the exec provider", EXEC_PATH_ENV)))?;

        let mode = match std::env::var(EXEC_MODE_ENV).as_deref() {
            Ok("RAW") => ExecMode::Raw,
            _ => ExecMode::Record,
        };

        Ok(Self::new(program, mode, records))
    }

    fn args(&self, command: &str, domain: &str, token: &str, key_auth: &str) -> Vec<String> {
        match self.mode {
            ExecMode::Raw => vec![
                command.to_string(),
                "--".to_string(),
                domain.to_string(),
                token.to_string(),
                key_auth.to_string(),
            ],
            ExecMode::Record => {
                let record = self.records.record(domain, key_auth);
                vec![command.to_string(), record.fqdn, record.value]
            }
        }
    }

    async fn run(&self, command: &str, domain: &str, token: &str, key_auth: &str) -> Result<(), SolverError> {
        let args = self.args(command, domain, token, key_auth);
        debug!(program = %self.program.display(), command = %command, mode = ?self.mode, "Running exec provider");

        let output = Command::new(&self.program)
            .args(&args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| SolverError::Provider {
                provider: NAME.to_string(),
                message: format!("failed to execute {}: {}", self.program.display(), e),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SolverError::Provider {
                provider: NAME.to_string(),
                message: format!("{} {} exited with {}: {}", self.program.display(), command, output.status, stderr.trim()),
            });
        }

        info!(program = %self.program.display(), command = %command, "Exec provider finished");
        Ok(())
    }
}

#[async_trait]
impl DnsProvider for ExecProvider {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn present(&self, domain: &str, token: &str, key_auth: &str) -> Result<(), SolverError> {
        self.run("present", domain, token, key_auth).await
    }

    async fn cleanup(&self, domain: &str, token: &str, key_auth: &str) -> Result<(), SolverError> {
        self.run("cleanup", domain, token, key_auth).await?;
        self.records.forget(domain);
        Ok(())
    }
}
