//! Core types shared across Flotilla components
//!
//! A [`WorkerType`] is a named recipe for a fleet of interchangeable spot
//! workers: capacity bounds, price envelope, and the per-region /
//! per-instance-type launch configuration. Launch specs are resolved by
//! deep-merging three override documents (shared, region, instance type)
//! and deserializing the result into a typed [`LaunchSpec`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CoreError, Result};

/// A named recipe for a fleet of interchangeable spot workers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerType {
    /// Worker-type name; also the suffix of its cloud key-pair name
    pub name: String,

    /// Minimum provisioned capacity (task units)
    pub min_capacity: u32,

    /// Maximum provisioned capacity (task units)
    pub max_capacity: u32,

    /// Target pending-tasks per provisioned capacity unit.
    /// Zero means "one capacity unit per pending task".
    pub scaling_ratio: f64,

    /// Lower price bound, in utility-normalized units
    pub min_price: f64,

    /// Upper price bound, in utility-normalized units
    pub max_price: f64,

    /// Instance types this worker type may bid on
    pub instance_types: Vec<InstanceTypeDef>,

    /// Regions this worker type may bid in
    pub regions: Vec<RegionDef>,

    /// Launch-spec fields shared by every region and instance type
    #[serde(default)]
    pub shared_launch_spec: Value,
}

impl WorkerType {
    /// Look up the definition for an instance type, if configured
    pub fn instance_type(&self, name: &str) -> Option<&InstanceTypeDef> {
        self.instance_types.iter().find(|t| t.instance_type == name)
    }

    /// Look up the definition for a region, if allowed
    pub fn region(&self, name: &str) -> Option<&RegionDef> {
        self.regions.iter().find(|r| r.region == name)
    }

    /// Capacity contribution of one instance of the given type.
    ///
    /// Unknown types count as a single capacity unit so that resources we
    /// did not bid for (manual launches, stale definitions) still weigh
    /// against the capacity bounds.
    pub fn capacity_of(&self, instance_type: &str) -> u32 {
        self.instance_type(instance_type)
            .map(|t| t.capacity)
            .unwrap_or(1)
    }

    /// Utility multiplier of the given type (1.0 when unknown)
    pub fn utility_of(&self, instance_type: &str) -> f64 {
        self.instance_type(instance_type)
            .map(|t| t.utility)
            .unwrap_or(1.0)
    }
}

/// Per-instance-type slice of a worker type definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceTypeDef {
    /// Cloud instance type name (e.g. "c5.large")
    pub instance_type: String,

    /// Tasks one instance of this type can serve concurrently
    pub capacity: u32,

    /// Unitless multiplier normalizing spot prices across hardware
    pub utility: f64,

    /// Launch-spec overrides applied when bidding on this type
    #[serde(default)]
    pub overrides: Value,
}

/// Per-region slice of a worker type definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionDef {
    /// Region name (e.g. "us-east-1")
    pub region: String,

    /// Launch-spec overrides applied when bidding in this region
    #[serde(default)]
    pub overrides: Value,
}

/// Typed spot launch specification, produced by [`resolve_launch_spec`].
///
/// Carries only the fields that come from worker-type override documents.
/// Bid-time placement (key-pair name, instance type, availability zone) is
/// chosen by the bidder per submission and travels next to this document,
/// never inside it; an override document carrying such a key is malformed
/// and rejected.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LaunchSpec {
    /// AMI to launch
    pub image_id: String,

    /// Security group IDs
    #[serde(default)]
    pub security_group_ids: Vec<String>,

    /// Subnet ID
    #[serde(default)]
    pub subnet_id: Option<String>,

    /// Base64-encoded user data
    #[serde(default)]
    pub user_data: Option<String>,

    /// IAM instance profile name
    #[serde(default)]
    pub iam_profile: Option<String>,
}

/// Resolve the launch spec for one (worker type, region, instance type).
///
/// Merge order is shared, then region overrides, then instance-type
/// overrides; later documents win. Object values merge recursively,
/// everything else replaces.
pub fn resolve_launch_spec(
    worker_type: &WorkerType,
    region: &str,
    instance_type: &str,
) -> Result<LaunchSpec> {
    let region_def = worker_type
        .region(region)
        .ok_or_else(|| CoreError::UnknownRegion {
            worker_type: worker_type.name.clone(),
            region: region.to_string(),
        })?;
    let type_def =
        worker_type
            .instance_type(instance_type)
            .ok_or_else(|| CoreError::UnknownInstanceType {
                worker_type: worker_type.name.clone(),
                instance_type: instance_type.to_string(),
            })?;

    let mut merged = worker_type.shared_launch_spec.clone();
    merge_overrides(&mut merged, &region_def.overrides);
    merge_overrides(&mut merged, &type_def.overrides);

    serde_json::from_value(merged).map_err(|e| CoreError::MalformedLaunchSpec(e.to_string()))
}

/// Deep-merge `over` into `base`
fn merge_overrides(base: &mut Value, over: &Value) {
    match (base, over) {
        (Value::Object(base_map), Value::Object(over_map)) => {
            for (key, value) in over_map {
                match base_map.get_mut(key) {
                    Some(existing) => merge_overrides(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, over) => {
            if !over.is_null() {
                *base = over.clone();
            }
        }
    }
}
