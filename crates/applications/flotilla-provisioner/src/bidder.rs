//! Capacity accounting and bidding
//!
//! Sizing works in capacity units (tasks-per-instance), not instance
//! counts: provisioned capacity is everything the fleet currently supplies
//! or will shortly supply - live instances, open bids, and in-flight bids
//! the cloud has not surfaced yet. The bidder closes the gap between that
//! and the target one bid at a time, always taking the cheapest viable
//! (region, zone, instance type) on the utility-normalized price axis.
//!
//! Excess capacity is released in the opposite order of certainty:
//! in-flight bids first, then open requests, then instances. Requests and
//! instances are shuffled uniformly so no zone or region is drained
//! preferentially.

use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, info, warn};

use flotilla_core::{
    events::now_ms, resolve_launch_spec, EventSink, FleetEvent, PricingOracle, WorkerType,
};

use crate::adapter::{CloudApi, SpotBid};
use crate::config::ProvisionerConfig;
use crate::error::Result;
use crate::snapshot::FleetSnapshot;
use crate::tracker::{InFlightBid, InFlightTracker};

/// Capacity currently provisioned for a worker type.
///
/// Counts live instances, open spot requests, and in-flight bids, each
/// weighted by the capacity of its instance type. Unknown types weigh 1.
pub fn current_capacity(
    worker_type: &WorkerType,
    snapshot: &FleetSnapshot,
    in_flight: &InFlightTracker,
) -> u32 {
    let instances: u32 = snapshot
        .instances()
        .iter()
        .filter(|i| i.worker_type == worker_type.name && i.state.is_live())
        .map(|i| worker_type.capacity_of(&i.instance_type))
        .sum();

    let requests: u32 = snapshot
        .requests()
        .iter()
        .filter(|r| r.worker_type == worker_type.name)
        .map(|r| worker_type.capacity_of(&r.instance_type))
        .sum();

    let pending_bids: u32 = in_flight
        .bids_for(&worker_type.name)
        .map(|b| worker_type.capacity_of(&b.instance_type))
        .sum();

    instances + requests + pending_bids
}

/// Target capacity for a worker type given its pending-task backlog.
///
/// The scaling ratio maps backlog to capacity (`ceil(pending × ratio)`); a
/// ratio of zero targets one capacity unit per pending task. The result is
/// clamped into the worker type's `[min_capacity, max_capacity]`.
pub fn target_capacity(worker_type: &WorkerType, pending_tasks: u64) -> u32 {
    let raw = if worker_type.scaling_ratio > 0.0 {
        (pending_tasks as f64 * worker_type.scaling_ratio).ceil() as u64
    } else {
        pending_tasks
    };
    raw.clamp(
        worker_type.min_capacity as u64,
        worker_type.max_capacity as u64,
    ) as u32
}

/// One (region, zone, instance type) the bidder may bid on
#[derive(Debug, Clone)]
pub struct BidCandidate {
    /// Region to bid in
    pub region: String,
    /// Availability zone, when the pricing oracle reported one
    pub zone: Option<String>,
    /// Instance type to bid on
    pub instance_type: String,
    /// Capacity one instance of this type supplies
    pub capacity: u32,
    /// Utility multiplier for this type
    pub utility: f64,
    /// Recent observed spot price, USD per hour
    pub observed_price: f64,
}

impl BidCandidate {
    /// Observed price on the utility-normalized axis
    pub fn effective_price(&self) -> f64 {
        self.observed_price / self.utility
    }

    /// Whether the normalized price sits inside the worker type's envelope
    pub fn within_envelope(&self, min_price: f64, max_price: f64) -> bool {
        let effective = self.effective_price();
        min_price <= effective && effective <= max_price
    }
}

/// Order candidates cheapest-first.
///
/// Ties break toward smaller capacity (bids stay granular), then region
/// name, so the ordering is total and deterministic.
pub fn rank_candidates(candidates: &mut [BidCandidate]) {
    candidates.sort_by(|a, b| {
        a.effective_price()
            .total_cmp(&b.effective_price())
            .then(a.capacity.cmp(&b.capacity))
            .then(a.region.cmp(&b.region))
    });
}

/// Resources selected for release, batched per region
#[derive(Debug, Default)]
pub struct KillPlan {
    /// In-flight request IDs to cancel, per region
    pub in_flight: HashMap<String, Vec<String>>,
    /// Open request IDs to cancel, per region
    pub requests: HashMap<String, Vec<String>>,
    /// Instance IDs to terminate, per region
    pub instances: HashMap<String, Vec<String>>,
}

impl KillPlan {
    /// Whether the plan releases anything at all
    pub fn is_empty(&self) -> bool {
        self.in_flight.is_empty() && self.requests.is_empty() && self.instances.is_empty()
    }
}

/// Select the resources to release when a worker type is over capacity.
///
/// Kill order: in-flight bids, then open requests (shuffled), then live
/// instances (shuffled). Selection stops as soon as releasing the next
/// candidate would push capacity below `min_capacity`, unless this is a
/// full shutdown.
pub fn plan_excess_kill(
    worker_type: &WorkerType,
    snapshot: &FleetSnapshot,
    in_flight: &InFlightTracker,
    full_shutdown: bool,
    rng: &mut impl Rng,
) -> KillPlan {
    let mut capacity = current_capacity(worker_type, snapshot, in_flight) as i64;
    let bound = if full_shutdown {
        0
    } else {
        worker_type.max_capacity as i64
    };
    let floor = worker_type.min_capacity as i64;

    let mut plan = KillPlan::default();
    if capacity <= bound {
        return plan;
    }

    let mut take = |capacity: &mut i64, item_capacity: u32| -> bool {
        if *capacity <= bound {
            return false;
        }
        let next = *capacity - item_capacity as i64;
        if !full_shutdown && next < floor {
            return false;
        }
        *capacity = next;
        true
    };

    for bid in in_flight.bids_for(&worker_type.name) {
        if !take(&mut capacity, worker_type.capacity_of(&bid.instance_type)) {
            break;
        }
        plan.in_flight
            .entry(bid.region.clone())
            .or_default()
            .push(bid.request_id.clone());
    }

    let mut requests: Vec<_> = snapshot
        .requests()
        .iter()
        .filter(|r| r.worker_type == worker_type.name)
        .collect();
    requests.shuffle(rng);
    for request in requests {
        if !take(&mut capacity, worker_type.capacity_of(&request.instance_type)) {
            break;
        }
        plan.requests
            .entry(request.region.clone())
            .or_default()
            .push(request.request_id.clone());
    }

    let mut instances: Vec<_> = snapshot
        .instances()
        .iter()
        .filter(|i| i.worker_type == worker_type.name && i.state.is_live())
        .collect();
    instances.shuffle(rng);
    for instance in instances {
        if !take(&mut capacity, worker_type.capacity_of(&instance.instance_type)) {
            break;
        }
        plan.instances
            .entry(instance.region.clone())
            .or_default()
            .push(instance.instance_id.clone());
    }

    plan
}

/// Places bids and releases excess capacity for one worker type
pub struct Bidder<'a> {
    config: &'a ProvisionerConfig,
    adapter: &'a dyn CloudApi,
    pricing: Option<&'a dyn PricingOracle>,
    sink: &'a dyn EventSink,
}

impl<'a> Bidder<'a> {
    /// Create a bidder over the injected collaborators
    pub fn new(
        config: &'a ProvisionerConfig,
        adapter: &'a dyn CloudApi,
        pricing: Option<&'a dyn PricingOracle>,
        sink: &'a dyn EventSink,
    ) -> Self {
        Self {
            config,
            adapter,
            pricing,
            sink,
        }
    }

    /// Collect the viable candidates for a worker type, cheapest first.
    ///
    /// Without a pricing oracle every candidate is priced uniformly at its
    /// own envelope cap, which keeps all of them viable and lets the
    /// tie-break ordering decide.
    pub async fn gather_candidates(&self, worker_type: &WorkerType) -> Vec<BidCandidate> {
        let mut candidates = Vec::new();

        for region_def in &worker_type.regions {
            for type_def in &worker_type.instance_types {
                let uniform = worker_type.max_price * type_def.utility;
                let mut zone_prices = Vec::new();

                if let Some(oracle) = self.pricing {
                    match oracle
                        .recent_spot(&region_def.region, &type_def.instance_type)
                        .await
                    {
                        Ok(prices) if !prices.is_empty() => {
                            zone_prices = prices
                                .into_iter()
                                .map(|p| (Some(p.zone), p.price))
                                .collect();
                        }
                        Ok(_) => zone_prices.push((None, uniform)),
                        Err(e) => {
                            warn!(
                                region = %region_def.region,
                                instance_type = %type_def.instance_type,
                                error = %e,
                                "pricing oracle failed, assuming uniform price"
                            );
                            zone_prices.push((None, uniform));
                        }
                    }
                } else {
                    zone_prices.push((None, uniform));
                }

                for (zone, price) in zone_prices {
                    candidates.push(BidCandidate {
                        region: region_def.region.clone(),
                        zone,
                        instance_type: type_def.instance_type.clone(),
                        capacity: type_def.capacity,
                        utility: type_def.utility,
                        observed_price: price,
                    });
                }
            }
        }

        candidates.retain(|c| c.within_envelope(worker_type.min_price, worker_type.max_price));
        rank_candidates(&mut candidates);
        candidates
    }

    /// Place bids until `delta` capacity units have been requested.
    ///
    /// One bid at a time; every accepted bid is recorded in the in-flight
    /// tracker before the next candidate is evaluated, so a crash between
    /// bids never loses more than the one unrecorded request.
    pub async fn provision(
        &self,
        worker_type: &WorkerType,
        delta: u32,
        in_flight: &Mutex<InFlightTracker>,
    ) -> Result<u32> {
        let candidates = self.gather_candidates(worker_type).await;
        let Some(best) = candidates.first() else {
            warn!(
                worker_type = %worker_type.name,
                "no viable bid candidates inside the price envelope"
            );
            return Ok(0);
        };

        let launch_spec = resolve_launch_spec(worker_type, &best.region, &best.instance_type)?;
        let bid_price = worker_type.max_price * best.utility;
        let key_name = self.config.key_pair_name(&worker_type.name);

        let mut remaining = delta as i64;
        let mut submitted = 0u32;
        while remaining > 0 {
            let bid = SpotBid {
                worker_type: worker_type.name.clone(),
                region: best.region.clone(),
                zone: best.zone.clone(),
                instance_type: best.instance_type.clone(),
                key_name: key_name.clone(),
                bid_price,
                launch_spec: launch_spec.clone(),
            };

            let request_id = self.adapter.request_spot(&best.region, &bid).await?;
            info!(
                worker_type = %worker_type.name,
                region = %best.region,
                instance_type = %best.instance_type,
                request_id = %request_id,
                bid_price,
                "spot bid submitted"
            );

            crate::lock(in_flight).insert(InFlightBid {
                request_id: request_id.clone(),
                worker_type: worker_type.name.clone(),
                region: best.region.clone(),
                zone: best.zone.clone(),
                instance_type: best.instance_type.clone(),
                bid_price,
                submitted_at: chrono::Utc::now(),
            });

            self.sink.emit(FleetEvent::RequestSubmitted {
                worker_type: worker_type.name.clone(),
                region: best.region.clone(),
                zone: best.zone.clone(),
                instance_type: best.instance_type.clone(),
                request_id,
                bid_price,
                at: now_ms(),
            });
            self.sink.emit(FleetEvent::AmiUsage {
                region: best.region.clone(),
                image_id: launch_spec.image_id.clone(),
                at: now_ms(),
            });

            remaining -= best.capacity.max(1) as i64;
            submitted += 1;
        }

        Ok(submitted)
    }

    /// Execute a kill plan: one cancel and one terminate call per region.
    ///
    /// In-flight entries leave the tracker only after their cancel call
    /// succeeds; a failed call leaves them tracked for the next iteration.
    pub async fn execute_kill_plan(
        &self,
        plan: &KillPlan,
        in_flight: &Mutex<InFlightTracker>,
    ) -> Result<()> {
        let mut cancels: HashMap<&str, Vec<String>> = HashMap::new();
        for (region, ids) in plan.in_flight.iter().chain(plan.requests.iter()) {
            cancels
                .entry(region.as_str())
                .or_default()
                .extend(ids.iter().cloned());
        }

        for (region, ids) in cancels {
            match self.adapter.cancel_spot_requests(region, &ids).await {
                Ok(()) => {
                    debug!(region, count = ids.len(), "cancelled spot requests");
                    if let Some(tracked) = plan.in_flight.get(region) {
                        let mut tracker = crate::lock(in_flight);
                        for id in tracked {
                            tracker.remove(id);
                        }
                    }
                }
                Err(e) => warn!(region, error = %e, "cancel failed, will retry next iteration"),
            }
        }

        for (region, ids) in &plan.instances {
            match self.adapter.terminate_instances(region, ids).await {
                Ok(()) => debug!(region, count = ids.len(), "terminated instances"),
                Err(e) => warn!(region, error = %e, "terminate failed, will retry next iteration"),
            }
        }

        Ok(())
    }
}
