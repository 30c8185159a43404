//! Key-pair management
//!
//! Every worker type owns one cloud key pair named
//! `<key_prefix><worker_type>`, and that key must exist in every allowed
//! region before a bid is placed there - the key name is how snapshot
//! classification recovers ownership later.
//!
//! The known-good cache is process-local and deliberately never persisted:
//! after a restart the first ensure re-checks every region, which is what
//! makes an allowed-regions change across restarts safe (the key gets
//! imported into any newly-added region).

use futures::future::join_all;
use std::collections::HashSet;
use std::sync::Mutex;
use tracing::{debug, info, warn};

use crate::adapter::CloudApi;
use crate::config::ProvisionerConfig;
use crate::error::Result;

/// Ensures worker-type key pairs exist in every allowed region
pub struct KeyPairManager {
    key_prefix: String,
    public_key_body: String,
    regions: Vec<String>,
    known: Mutex<HashSet<String>>,
}

impl KeyPairManager {
    /// Create a manager for the configured regions and key prefix
    pub fn new(config: &ProvisionerConfig) -> Self {
        Self {
            key_prefix: config.key_prefix.clone(),
            public_key_body: config.public_key_body.clone(),
            regions: config.allowed_regions.clone(),
            known: Mutex::new(HashSet::new()),
        }
    }

    /// Key-pair name for a worker type
    pub fn key_name(&self, worker_type: &str) -> String {
        format!("{}{}", self.key_prefix, worker_type)
    }

    /// Ensure the worker type's key pair exists in every allowed region.
    ///
    /// Checks all regions in parallel, imports into the missing ones in
    /// parallel, and only then records the worker type as known good.
    pub async fn ensure(&self, adapter: &dyn CloudApi, worker_type: &str) -> Result<()> {
        if crate::lock(&self.known).contains(worker_type) {
            return Ok(());
        }

        let key_name = self.key_name(worker_type);
        let names = vec![key_name.clone()];

        let checks = join_all(self.regions.iter().map(|region| {
            let names = names.clone();
            async move {
                let found = adapter.describe_key_pairs(region, &names).await?;
                Result::Ok((region.as_str(), !found.is_empty()))
            }
        }))
        .await;

        let mut missing = Vec::new();
        for check in checks {
            let (region, exists) = check?;
            if !exists {
                missing.push(region);
            }
        }

        if !missing.is_empty() {
            info!(
                worker_type,
                regions = ?missing,
                "importing key pair into missing regions"
            );
            let imports = join_all(missing.iter().map(|region| {
                adapter.import_key_pair(region, &key_name, &self.public_key_body)
            }))
            .await;
            for import in imports {
                import?;
            }
        } else {
            debug!(worker_type, "key pair present in every region");
        }

        crate::lock(&self.known).insert(worker_type.to_string());
        Ok(())
    }

    /// Delete the worker type's key pair from every allowed region.
    ///
    /// The worker type leaves the known-good cache first, so a partial
    /// delete is re-checked by the next ensure.
    pub async fn delete(&self, adapter: &dyn CloudApi, worker_type: &str) -> Result<()> {
        crate::lock(&self.known).remove(worker_type);

        let key_name = self.key_name(worker_type);
        let deletes = join_all(
            self.regions
                .iter()
                .map(|region| adapter.delete_key_pair(region, &key_name)),
        )
        .await;

        for (region, delete) in self.regions.iter().zip(deletes) {
            if let Err(e) = delete {
                warn!(worker_type, region = %region, error = %e, "key pair delete failed");
                return Err(e);
            }
        }
        Ok(())
    }
}
