//! Collaborator traits for the reconciliation core
//!
//! The reconciler works through these interfaces ONLY - never concrete
//! store, queue, or telemetry clients. Implementations live outside the
//! core and are injected at construction.

use async_trait::async_trait;

use crate::error::Result;
use crate::events::FleetEvent;
use crate::types::WorkerType;

/// Read interface over the worker-type definition store
#[async_trait]
pub trait WorkerTypeStore: Send + Sync {
    /// Names of every configured worker type
    async fn list_worker_types(&self) -> Result<Vec<String>>;

    /// Load one worker-type definition
    async fn load_worker_type(&self, name: &str) -> Result<WorkerType>;
}

/// Backlog of tasks waiting on each worker type
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Number of tasks currently pending for a worker type
    async fn pending_tasks(&self, worker_type: &str) -> Result<u64>;
}

/// A recent spot price observation for one availability zone
#[derive(Debug, Clone)]
pub struct ZonePrice {
    /// Availability zone (e.g. "us-east-1a")
    pub zone: String,

    /// Most recent observed spot price, USD per hour
    pub price: f64,
}

/// Source of recent spot prices.
///
/// Optional collaborator: without one the bidder prices every candidate
/// uniformly and lets the tie-break ordering decide.
#[async_trait]
pub trait PricingOracle: Send + Sync {
    /// Recent per-zone spot prices for an instance type in a region
    async fn recent_spot(&self, region: &str, instance_type: &str) -> Result<Vec<ZonePrice>>;
}

/// Destination for structured core events; transport is pluggable
pub trait EventSink: Send + Sync {
    /// Emit one event. Must not block the reconciliation task.
    fn emit(&self, event: FleetEvent);
}
