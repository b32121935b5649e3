//! Manual provider
//!
//! Does not talk to any DNS service. It logs the record so an operator can
//! create or delete it by hand, which makes it useful for dry runs and for
//! zones without an API.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use super::{DnsProvider, RecordCache};
use crate::solver::SolverError;

pub const NAME: &str = "manual";

#[derive(Debug)]
pub struct ManualProvider {
    records: Arc<RecordCache>,
}

impl ManualProvider {
    pub fn new(records: Arc<RecordCache>) -> Self {
        Self { records }
    }
}

#[async_trait]
impl DnsProvider for ManualProvider {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn present(&self, domain: &str, _token: &str, key_auth: &str) -> Result<(), SolverError> {
        let record = self.records.record(domain, key_auth);
        info!(
            fqdn = %record.fqdn,
            value = %record.value,
            "Create TXT record: {} 120 IN TXT \"{}\"",
            record.fqdn,
            record.value
        );
        Ok(())
    }

    async fn cleanup(&self, domain: &str, _token: &str, key_auth: &str) -> Result<(), SolverError> {
        let record = self.records.record(domain, key_auth);
        info!(
            fqdn = %record.fqdn,
            "Delete TXT record: {} 120 IN TXT \"{}\"",
            record.fqdn,
            record.value
        );
        self.records.forget(domain);
        Ok(())
    }
}
