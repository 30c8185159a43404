//! Provisioner configuration
//!
//! Loaded from a JSON file or assembled with the builder methods. The
//! defaults match what the fleet runs in production; tests override the
//! timing knobs freely.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{ProvisionerError, Result};

/// Default reconciliation interval (75 seconds)
pub const DEFAULT_ITERATION_INTERVAL_MS: u64 = 75_000;

/// Default maximum instance life (96 hours)
pub const DEFAULT_MAX_INSTANCE_LIFE_HOURS: u64 = 96;

/// Default age after which an open bid is considered stalled (20 minutes)
pub const DEFAULT_STALL_TIMEOUT_MS: u64 = 20 * 60 * 1000;

/// Default wall-clock timeout for in-flight bids (15 minutes)
pub const DEFAULT_IN_FLIGHT_TIMEOUT_MS: u64 = 15 * 60 * 1000;

/// Default iteration budget for unresolved departures
pub const DEFAULT_MAX_ITERATIONS_FOR_STATE_RESOLUTION: u32 = 20;

/// Default per-call cloud API timeout (30 seconds)
pub const DEFAULT_API_TIMEOUT_MS: u64 = 30_000;

/// Static configuration for the provisioner core
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionerConfig {
    /// Identity of this provisioner; written as the `Owner` tag value
    pub provisioner_id: String,

    /// Prefix prepended to worker-type names to form key-pair names
    pub key_prefix: String,

    /// Regions the provisioner may observe and bid in
    pub allowed_regions: Vec<String>,

    /// Reconciliation interval in milliseconds
    pub iteration_interval_ms: u64,

    /// Maximum instance life in hours; older instances are terminated
    pub max_instance_life_hours: u64,

    /// Public key body imported into every allowed region
    pub public_key_body: String,

    /// Age after which an open bid is considered stalled, in milliseconds
    pub stall_timeout_ms: u64,

    /// Wall-clock timeout for in-flight bids, in milliseconds
    pub in_flight_timeout_ms: u64,

    /// Iterations an unresolved departure is retried before being dropped
    pub max_iterations_for_state_resolution: u32,

    /// Per-call cloud API timeout, in milliseconds
    pub api_timeout_ms: u64,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            provisioner_id: "flotilla".to_string(),
            key_prefix: "flotilla:".to_string(),
            allowed_regions: vec!["us-east-1".to_string()],
            iteration_interval_ms: DEFAULT_ITERATION_INTERVAL_MS,
            max_instance_life_hours: DEFAULT_MAX_INSTANCE_LIFE_HOURS,
            public_key_body: String::new(),
            stall_timeout_ms: DEFAULT_STALL_TIMEOUT_MS,
            in_flight_timeout_ms: DEFAULT_IN_FLIGHT_TIMEOUT_MS,
            max_iterations_for_state_resolution: DEFAULT_MAX_ITERATIONS_FOR_STATE_RESOLUTION,
            api_timeout_ms: DEFAULT_API_TIMEOUT_MS,
        }
    }
}

impl ProvisionerConfig {
    /// Load configuration from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check internal consistency
    pub fn validate(&self) -> Result<()> {
        if self.provisioner_id.is_empty() {
            return Err(ProvisionerError::config("provisioner_id must not be empty"));
        }
        if self.key_prefix.is_empty() {
            return Err(ProvisionerError::config("key_prefix must not be empty"));
        }
        if self.allowed_regions.is_empty() {
            return Err(ProvisionerError::config(
                "at least one allowed region is required",
            ));
        }
        if self.iteration_interval_ms == 0 {
            return Err(ProvisionerError::config(
                "iteration_interval_ms must be positive",
            ));
        }
        Ok(())
    }

    /// Set the provisioner identity
    pub fn with_provisioner_id(mut self, id: impl Into<String>) -> Self {
        self.provisioner_id = id.into();
        self
    }

    /// Set the key-pair name prefix
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Set the allowed regions
    pub fn with_regions(mut self, regions: Vec<String>) -> Self {
        self.allowed_regions = regions;
        self
    }

    /// Set the public key body used by key-pair import
    pub fn with_public_key_body(mut self, body: impl Into<String>) -> Self {
        self.public_key_body = body.into();
        self
    }

    /// Set the reconciliation interval
    pub fn with_iteration_interval(mut self, interval: Duration) -> Self {
        self.iteration_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Reconciliation interval as a [`Duration`]
    pub fn iteration_interval(&self) -> Duration {
        Duration::from_millis(self.iteration_interval_ms)
    }

    /// Per-call cloud API timeout as a [`Duration`]
    pub fn api_timeout(&self) -> Duration {
        Duration::from_millis(self.api_timeout_ms)
    }

    /// Maximum instance life as a chrono duration
    pub fn max_instance_life(&self) -> chrono::Duration {
        chrono::Duration::hours(self.max_instance_life_hours as i64)
    }

    /// Stalled-bid age threshold as a chrono duration
    pub fn stall_timeout(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.stall_timeout_ms as i64)
    }

    /// In-flight bid timeout as a chrono duration
    pub fn in_flight_timeout(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.in_flight_timeout_ms as i64)
    }

    /// Key-pair name for a worker type: `<key_prefix><worker_type>`
    pub fn key_pair_name(&self, worker_type: &str) -> String {
        format!("{}{}", self.key_prefix, worker_type)
    }
}
