//! Safety killers
//!
//! Two independent guards that run after the per-worker-type
//! reconciliation:
//!
//! - the rogue killer removes every resource belonging to a worker type
//!   that is no longer in the configured set (including its key pairs);
//!   called with an empty set it acts as a global stop.
//! - the age killer terminates instances that have outlived the configured
//!   maximum life, whatever their worker type.
//!
//! Both are idempotent: a failed call leaves the resource in place and the
//! next iteration reconsiders it.

use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Mutex;
use tracing::{info, warn};

use crate::adapter::CloudApi;
use crate::keypairs::KeyPairManager;
use crate::snapshot::FleetSnapshot;
use crate::tracker::InFlightTracker;

/// Cancel, terminate, and de-key every worker type outside the configured
/// set.
///
/// Rogues are detected across all three capacity sources: snapshot
/// instances, snapshot requests, and in-flight bids. Failures are logged
/// and retried by repetition on the next iteration.
pub async fn kill_rogues(
    adapter: &dyn CloudApi,
    snapshot: &FleetSnapshot,
    in_flight: &Mutex<InFlightTracker>,
    keypairs: &KeyPairManager,
    configured: &HashSet<String>,
) {
    let mut observed: BTreeSet<String> = snapshot.worker_types();
    {
        let tracker = crate::lock(in_flight);
        observed.extend(tracker.bids().iter().map(|b| b.worker_type.clone()));
    }

    for rogue in observed.into_iter().filter(|w| !configured.contains(w)) {
        info!(worker_type = %rogue, "removing rogue worker type");

        let mut cancels: HashMap<String, Vec<String>> = HashMap::new();
        let mut in_flight_ids: HashMap<String, Vec<String>> = HashMap::new();
        for request in snapshot.requests().iter().filter(|r| r.worker_type == rogue) {
            cancels
                .entry(request.region.clone())
                .or_default()
                .push(request.request_id.clone());
        }
        {
            let tracker = crate::lock(in_flight);
            for bid in tracker.bids_for(&rogue) {
                cancels
                    .entry(bid.region.clone())
                    .or_default()
                    .push(bid.request_id.clone());
                in_flight_ids
                    .entry(bid.region.clone())
                    .or_default()
                    .push(bid.request_id.clone());
            }
        }

        for (region, ids) in &cancels {
            match adapter.cancel_spot_requests(region, ids).await {
                Ok(()) => {
                    if let Some(tracked) = in_flight_ids.get(region) {
                        let mut tracker = crate::lock(in_flight);
                        for id in tracked {
                            tracker.remove(id);
                        }
                    }
                }
                Err(e) => {
                    warn!(worker_type = %rogue, region = %region, error = %e, "rogue cancel failed")
                }
            }
        }

        let mut terminations: HashMap<String, Vec<String>> = HashMap::new();
        for instance in snapshot.instances().iter().filter(|i| i.worker_type == rogue) {
            terminations
                .entry(instance.region.clone())
                .or_default()
                .push(instance.instance_id.clone());
        }
        for (region, ids) in &terminations {
            if let Err(e) = adapter.terminate_instances(region, ids).await {
                warn!(worker_type = %rogue, region = %region, error = %e, "rogue terminate failed");
            }
        }

        if let Err(e) = keypairs.delete(adapter, &rogue).await {
            warn!(worker_type = %rogue, error = %e, "rogue key pair delete failed");
        }
    }
}

/// Terminate instances older than the configured maximum life.
///
/// Instances without a launch time are left alone.
pub async fn kill_aged(
    adapter: &dyn CloudApi,
    snapshot: &FleetSnapshot,
    max_instance_life: chrono::Duration,
    now: DateTime<Utc>,
) {
    let cutoff = now - max_instance_life;

    let mut terminations: HashMap<String, Vec<String>> = HashMap::new();
    for instance in snapshot.instances() {
        let Some(launch_time) = instance.launch_time else {
            continue;
        };
        if launch_time < cutoff {
            info!(
                instance_id = %instance.instance_id,
                worker_type = %instance.worker_type,
                %launch_time,
                "terminating over-aged instance"
            );
            terminations
                .entry(instance.region.clone())
                .or_default()
                .push(instance.instance_id.clone());
        }
    }

    for (region, ids) in &terminations {
        if let Err(e) = adapter.terminate_instances(region, ids).await {
            warn!(region = %region, error = %e, "age kill failed, will retry next iteration");
        }
    }
}
