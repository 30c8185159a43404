//! Normalized fleet snapshots
//!
//! One snapshot is an immutable view of a single cloud observation: a flat
//! set of instances and a flat set of spot requests, each tagged with its
//! region and its worker type. Worker types are recovered by stripping the
//! configured key prefix from the resource's key-pair name; anything that
//! does not carry the prefix belongs to someone else and never enters a
//! snapshot.
//!
//! Request and instance records reference each other only through
//! `spot_request_id` / `instance_id` foreign keys. Neither embeds the other.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};

/// Instance lifecycle states as reported by the cloud API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceState {
    /// Instance is pending
    Pending,
    /// Instance is running
    Running,
    /// Instance is shutting down
    ShuttingDown,
    /// Instance is stopping
    Stopping,
    /// Instance is terminated
    Terminated,
}

impl InstanceState {
    /// Check if the instance still supplies capacity
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }
}

/// Spot request lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestState {
    /// Bid is open and unfulfilled
    Open,
    /// Bid was fulfilled and the instance may be running
    Active,
    /// Bid was cancelled
    Cancelled,
    /// Bid failed
    Failed,
    /// Bid closed (instance terminated or request expired)
    Closed,
}

impl RequestState {
    /// Stable kebab-case label
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Active => "active",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
            Self::Closed => "closed",
        }
    }
}

/// Status codes that mean an open bid is unlikely to ever fill
pub const STALLED_STATUS_CODES: [&str; 8] = [
    "capacity-not-available",
    "capacity-oversubscribed",
    "price-too-low",
    "not-scheduled-yet",
    "launch-group-constraint",
    "az-group-constraint",
    "placement-group-constraint",
    "constraint-not-fulfillable",
];

/// Spot request status code reported as fulfilled
pub const STATUS_FULFILLED: &str = "fulfilled";

/// State-reason code the cloud uses for spot market terminations
pub const REASON_SPOT_TERMINATION: &str = "Server.SpotInstanceTermination";

/// Terminal metadata attached to a dead instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateReason {
    /// Machine-readable reason code
    pub code: String,
    /// Human-readable message
    pub message: String,
}

/// One instance in a fleet snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetInstance {
    /// Cloud instance ID
    pub instance_id: String,
    /// Region the instance lives in
    pub region: String,
    /// Availability zone, when reported
    pub zone: Option<String>,
    /// Worker type recovered from the key-pair name
    pub worker_type: String,
    /// Cloud instance type
    pub instance_type: String,
    /// AMI the instance was launched from
    pub image_id: Option<String>,
    /// Launch time, when reported
    pub launch_time: Option<DateTime<Utc>>,
    /// Lifecycle state
    pub state: InstanceState,
    /// Spot request that produced this instance, when bound
    pub spot_request_id: Option<String>,
    /// Terminal metadata, populated on dead instances
    pub state_reason: Option<StateReason>,
    /// Original key-pair name
    pub key_name: Option<String>,
    /// Cloud tags on the instance
    pub tags: HashMap<String, String>,
}

/// One spot request in a fleet snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpotRequest {
    /// Cloud spot request ID
    pub request_id: String,
    /// Region the request was placed in
    pub region: String,
    /// Availability zone, when bound
    pub zone: Option<String>,
    /// Worker type recovered from the key-pair name
    pub worker_type: String,
    /// Requested instance type
    pub instance_type: String,
    /// Requested AMI
    pub image_id: Option<String>,
    /// When the bid was created
    pub create_time: Option<DateTime<Utc>>,
    /// Lifecycle state
    pub state: RequestState,
    /// Most recent status code
    pub status_code: String,
    /// Most recent status message
    pub status_message: String,
    /// When the status last changed
    pub status_update_time: Option<DateTime<Utc>>,
    /// Bid price, USD per hour
    pub bid_price: f64,
    /// Instance the request produced, once bound
    pub instance_id: Option<String>,
    /// Original key-pair name
    pub key_name: Option<String>,
    /// Cloud tags on the request
    pub tags: HashMap<String, String>,
}

impl SpotRequest {
    /// Check whether this open bid is unlikely to ever fill.
    ///
    /// A bid stalls when the cloud reports a constraint status or when it
    /// has been open longer than `stall_timeout`.
    pub fn is_stalled(&self, now: DateTime<Utc>, stall_timeout: chrono::Duration) -> bool {
        if STALLED_STATUS_CODES.contains(&self.status_code.as_str()) {
            return true;
        }
        match (self.state, self.create_time) {
            (RequestState::Open, Some(created)) => now - created > stall_timeout,
            _ => false,
        }
    }
}

/// Recover a worker-type name from a key-pair name.
///
/// Returns `None` when the key does not carry the configured prefix; such
/// resources belong to someone else and are invisible to the provisioner.
pub fn worker_type_of(key_name: Option<&str>, key_prefix: &str) -> Option<String> {
    key_name
        .and_then(|k| k.strip_prefix(key_prefix))
        .filter(|suffix| !suffix.is_empty())
        .map(|suffix| suffix.to_string())
}

/// Immutable normalized view of one cloud observation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FleetSnapshot {
    instances: Vec<FleetInstance>,
    requests: Vec<SpotRequest>,
}

impl FleetSnapshot {
    /// Classify raw adapter output into a snapshot.
    ///
    /// Each item is associated with a worker type by stripping `key_prefix`
    /// from its key-pair name; items without the prefix or outside the
    /// allowed regions are dropped. The result is a partition: every kept
    /// item belongs to exactly one `(region, worker_type)`.
    pub fn classify(
        key_prefix: &str,
        allowed_regions: &[String],
        instances: Vec<FleetInstance>,
        requests: Vec<SpotRequest>,
    ) -> Self {
        let allowed: HashSet<&str> = allowed_regions.iter().map(String::as_str).collect();

        let instances = instances
            .into_iter()
            .filter_map(|mut instance| {
                if !allowed.contains(instance.region.as_str()) {
                    return None;
                }
                instance.worker_type = worker_type_of(instance.key_name.as_deref(), key_prefix)?;
                Some(instance)
            })
            .collect();

        let requests = requests
            .into_iter()
            .filter_map(|mut request| {
                if !allowed.contains(request.region.as_str()) {
                    return None;
                }
                request.worker_type = worker_type_of(request.key_name.as_deref(), key_prefix)?;
                Some(request)
            })
            .collect();

        Self {
            instances,
            requests,
        }
    }

    /// Build a snapshot from already-classified records (test seam)
    pub fn from_parts(instances: Vec<FleetInstance>, requests: Vec<SpotRequest>) -> Self {
        Self {
            instances,
            requests,
        }
    }

    /// All instances in the snapshot
    pub fn instances(&self) -> &[FleetInstance] {
        &self.instances
    }

    /// All spot requests in the snapshot
    pub fn requests(&self) -> &[SpotRequest] {
        &self.requests
    }

    /// Instance IDs present in this snapshot
    pub fn instance_ids(&self) -> HashSet<&str> {
        self.instances
            .iter()
            .map(|i| i.instance_id.as_str())
            .collect()
    }

    /// Request IDs present in this snapshot
    pub fn request_ids(&self) -> HashSet<&str> {
        self.requests
            .iter()
            .map(|r| r.request_id.as_str())
            .collect()
    }

    /// Look up an instance by ID
    pub fn find_instance(&self, instance_id: &str) -> Option<&FleetInstance> {
        self.instances
            .iter()
            .find(|i| i.instance_id == instance_id)
    }

    /// Look up a request by ID
    pub fn find_request(&self, request_id: &str) -> Option<&SpotRequest> {
        self.requests.iter().find(|r| r.request_id == request_id)
    }

    /// Every worker type observed in this snapshot
    pub fn worker_types(&self) -> BTreeSet<String> {
        self.instances
            .iter()
            .map(|i| i.worker_type.clone())
            .chain(self.requests.iter().map(|r| r.worker_type.clone()))
            .collect()
    }

    /// Split the open requests into (good, stalled).
    ///
    /// Stalled requests are cancelled synchronously and must not enter the
    /// snapshot handed to the diff engine, so this consumes the request set
    /// and returns a snapshot containing only the good ones.
    pub fn bisect_stalled(
        self,
        now: DateTime<Utc>,
        stall_timeout: chrono::Duration,
    ) -> (FleetSnapshot, Vec<SpotRequest>) {
        let (stalled, good): (Vec<_>, Vec<_>) = self
            .requests
            .into_iter()
            .partition(|r| r.is_stalled(now, stall_timeout));

        (
            FleetSnapshot {
                instances: self.instances,
                requests: good,
            },
            stalled,
        )
    }
}
