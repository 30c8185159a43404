//! Reconciliation iteration driver
//!
//! One reconciler value owns all process state: the two most recent
//! snapshots, the in-flight tracker, the pending-resolution tracker, and
//! the key-pair cache. Collaborators are injected at construction and the
//! value has a single start/stop lifecycle.
//!
//! Each iteration runs observe-diff-decide-act:
//! snapshot refresh, stalled-bid cancellation, diff, in-flight sweep,
//! per-worker-type sizing (in parallel), then the rogue and age killers
//! and best-effort tagging. Only one iteration is ever in flight; a tick
//! that lands while an iteration is still running is dropped.
//!
//! The loop is self-healing by repetition: anything missed in one
//! iteration - an event, a termination, a stale snapshot - is reconsidered
//! on the next tick, so no step retries internally.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use flotilla_core::{
    events::now_ms, EventSink, FleetEvent, PricingOracle, TaskQueue, WorkerTypeStore,
};

use crate::adapter::{CloudApi, InstanceLiveness, RequestPhase};
use crate::bidder::{current_capacity, plan_excess_kill, target_capacity, Bidder};
use crate::config::ProvisionerConfig;
use crate::diff::diff_iteration;
use crate::error::Result;
use crate::keypairs::KeyPairManager;
use crate::killers::{kill_aged, kill_rogues};
use crate::snapshot::{FleetSnapshot, SpotRequest};
use crate::tracker::{InFlightBid, InFlightTracker, PendingResolutionTracker};

/// The reconciliation loop and all state it owns
pub struct Reconciler {
    config: ProvisionerConfig,
    adapter: Arc<dyn CloudApi>,
    store: Arc<dyn WorkerTypeStore>,
    queue: Arc<dyn TaskQueue>,
    pricing: Option<Arc<dyn PricingOracle>>,
    sink: Arc<dyn EventSink>,
    keypairs: KeyPairManager,
    in_flight: Mutex<InFlightTracker>,
    pending: Mutex<PendingResolutionTracker>,
    previous: Mutex<Option<FleetSnapshot>>,
    stop_tx: watch::Sender<bool>,
}

impl Reconciler {
    /// Construct a reconciler with all collaborators injected
    pub fn new(
        config: ProvisionerConfig,
        adapter: Arc<dyn CloudApi>,
        store: Arc<dyn WorkerTypeStore>,
        queue: Arc<dyn TaskQueue>,
        pricing: Option<Arc<dyn PricingOracle>>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let keypairs = KeyPairManager::new(&config);
        let in_flight = Mutex::new(InFlightTracker::new(config.in_flight_timeout()));
        let pending = Mutex::new(PendingResolutionTracker::new(
            config.max_iterations_for_state_resolution,
        ));
        let (stop_tx, _) = watch::channel(false);

        Self {
            config,
            adapter,
            store,
            queue,
            pricing,
            sink,
            keypairs,
            in_flight,
            pending,
            previous: Mutex::new(None),
            stop_tx,
        }
    }

    /// Request the running loop to stop after the current iteration
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Bids currently tracked as in flight
    pub fn in_flight_bids(&self) -> Vec<InFlightBid> {
        crate::lock(&self.in_flight).bids().to_vec()
    }

    /// Run the reconciliation loop until [`stop`](Self::stop) is called.
    ///
    /// Ticks that land while an iteration is still running are skipped,
    /// and each iteration carries a hard deadline of one interval.
    pub async fn run(&self) -> Result<()> {
        let interval = self.config.iteration_interval();
        let mut ticks = tokio::time::interval(interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut stop_rx = self.stop_tx.subscribe();

        info!(
            provisioner_id = %self.config.provisioner_id,
            interval_ms = self.config.iteration_interval_ms,
            regions = ?self.config.allowed_regions,
            "reconciler starting"
        );

        loop {
            tokio::select! {
                _ = ticks.tick() => {
                    match tokio::time::timeout(interval, self.run_iteration()).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) if e.is_transient() => {
                            warn!(error = %e, "transient cloud error, skipping iteration");
                        }
                        Ok(Err(e)) => {
                            error!(error = %e, "iteration aborted");
                        }
                        Err(_) => {
                            warn!("iteration exceeded its deadline, keeping partial progress");
                        }
                    }
                }
                _ = stop_rx.changed() => {
                    info!("reconciler stopping");
                    return Ok(());
                }
            }
        }
    }

    /// Run one full reconciliation iteration
    pub async fn run_iteration(&self) -> Result<()> {
        let now = Utc::now();

        // 1. Observe. Four queries, each fanned out per region, all in
        // parallel.
        let (current_raw, dead) = self.observe().await?;

        // 2. Stalled bids are cancelled synchronously and never reach the
        // diff engine.
        let (current, stalled) = current_raw.bisect_stalled(now, self.config.stall_timeout());
        self.cancel_stalled(&stalled).await;

        // 3. Diff. A bad diff must not halt provisioning, so a panic here
        // is an operator alert rather than an iteration failure.
        let previous = crate::lock(&self.previous).clone().unwrap_or_default();
        let diffed = {
            let mut pending = crate::lock(&self.pending);
            catch_unwind(AssertUnwindSafe(|| {
                diff_iteration(&previous, &current, &dead, &mut pending, now)
            }))
        };
        match diffed {
            Ok(events) => {
                for event in events {
                    self.sink.emit(event);
                }
            }
            Err(_) => error!("snapshot diff panicked; state kept, continuing"),
        }

        // 4. Sweep the in-flight tracker against what just became visible.
        self.sweep_in_flight(&current, now);

        // 5. Size every configured worker type, in parallel.
        let names = self.store.list_worker_types().await?;
        let configured: HashSet<String> = names.iter().cloned().collect();
        let outcomes = join_all(
            names
                .iter()
                .map(|name| self.reconcile_worker_type(name, &current)),
        )
        .await;
        for (name, outcome) in names.iter().zip(outcomes) {
            if let Err(e) = outcome {
                error!(worker_type = %name, error = %e, "worker type reconciliation failed");
            }
        }

        // 6.-7. Safety killers.
        kill_rogues(
            self.adapter.as_ref(),
            &current,
            &self.in_flight,
            &self.keypairs,
            &configured,
        )
        .await;
        kill_aged(
            self.adapter.as_ref(),
            &current,
            self.config.max_instance_life(),
            now,
        )
        .await;

        // 8. Best-effort tagging.
        self.apply_tags(&current).await;

        *crate::lock(&self.previous) = Some(current);
        Ok(())
    }

    /// Observe the fleet and run one rogue-killer pass.
    ///
    /// With `global_stop` the configured set is treated as empty, which
    /// removes every observed worker type.
    pub async fn sweep_rogues(&self, global_stop: bool) -> Result<()> {
        let (current_raw, _dead) = self.observe().await?;
        let (current, _stalled) =
            current_raw.bisect_stalled(Utc::now(), self.config.stall_timeout());

        let configured: HashSet<String> = if global_stop {
            HashSet::new()
        } else {
            self.store.list_worker_types().await?.into_iter().collect()
        };

        kill_rogues(
            self.adapter.as_ref(),
            &current,
            &self.in_flight,
            &self.keypairs,
            &configured,
        )
        .await;
        Ok(())
    }

    /// Ensure key pairs exist for every configured worker type
    pub async fn ensure_keys(&self) -> Result<()> {
        let names = self.store.list_worker_types().await?;
        let ensures = join_all(
            names
                .iter()
                .map(|name| self.keypairs.ensure(self.adapter.as_ref(), name)),
        )
        .await;
        for (name, outcome) in names.iter().zip(ensures) {
            if let Err(e) = outcome {
                error!(worker_type = %name, error = %e, "key pair ensure failed");
            }
        }
        Ok(())
    }

    /// Refresh the fleet view: (live snapshot, dead snapshot)
    async fn observe(&self) -> Result<(FleetSnapshot, FleetSnapshot)> {
        let regions = &self.config.allowed_regions;

        let live_instances = join_all(
            regions
                .iter()
                .map(|r| self.adapter.describe_instances(r, InstanceLiveness::Live)),
        );
        let dead_instances = join_all(
            regions
                .iter()
                .map(|r| self.adapter.describe_instances(r, InstanceLiveness::Dead)),
        );
        let open_requests = join_all(
            regions
                .iter()
                .map(|r| self.adapter.describe_spot_requests(r, RequestPhase::Open)),
        );
        let resolved_requests = join_all(
            regions
                .iter()
                .map(|r| self.adapter.describe_spot_requests(r, RequestPhase::Resolved)),
        );

        let (live_instances, dead_instances, open_requests, resolved_requests) =
            tokio::join!(live_instances, dead_instances, open_requests, resolved_requests);

        fn flatten<T>(results: Vec<Result<Vec<T>>>) -> Result<Vec<T>> {
            let mut flat = Vec::new();
            for result in results {
                flat.extend(result?);
            }
            Ok(flat)
        }

        let current = FleetSnapshot::classify(
            &self.config.key_prefix,
            regions,
            flatten(live_instances)?,
            flatten(open_requests)?,
        );
        let dead = FleetSnapshot::classify(
            &self.config.key_prefix,
            regions,
            flatten(dead_instances)?,
            flatten(resolved_requests)?,
        );

        debug!(
            instances = current.instances().len(),
            requests = current.requests().len(),
            dead_instances = dead.instances().len(),
            resolved_requests = dead.requests().len(),
            "fleet observed"
        );
        Ok((current, dead))
    }

    /// Cancel stalled bids, batched per region
    async fn cancel_stalled(&self, stalled: &[SpotRequest]) {
        if stalled.is_empty() {
            return;
        }

        let mut per_region: HashMap<&str, Vec<String>> = HashMap::new();
        for request in stalled {
            info!(
                request_id = %request.request_id,
                worker_type = %request.worker_type,
                status_code = %request.status_code,
                "cancelling stalled bid"
            );
            per_region
                .entry(request.region.as_str())
                .or_default()
                .push(request.request_id.clone());
        }

        for (region, ids) in per_region {
            if let Err(e) = self.adapter.cancel_spot_requests(region, &ids).await {
                warn!(region, error = %e, "stalled cancel failed, will retry next iteration");
            }
        }
    }

    /// Remove in-flight entries that became visible or timed out
    fn sweep_in_flight(&self, current: &FleetSnapshot, now: DateTime<Utc>) {
        let outcome = {
            let mut tracker = crate::lock(&self.in_flight);
            tracker.sweep(&current.request_ids(), now)
        };

        for bid in outcome.visible {
            self.sink.emit(FleetEvent::BidVisibilityLag {
                worker_type: bid.worker_type,
                region: bid.region,
                request_id: bid.request_id,
                lag_ms: (now - bid.submitted_at).num_milliseconds(),
                timed_out: false,
                at: now_ms(),
            });
        }
        for bid in outcome.timed_out {
            warn!(
                request_id = %bid.request_id,
                worker_type = %bid.worker_type,
                "in-flight bid never became visible"
            );
            self.sink.emit(FleetEvent::BidVisibilityLag {
                worker_type: bid.worker_type,
                region: bid.region,
                request_id: bid.request_id,
                lag_ms: (now - bid.submitted_at).num_milliseconds(),
                timed_out: true,
                at: now_ms(),
            });
        }
    }

    /// Size one worker type: ensure its key pair, then bid or shrink
    async fn reconcile_worker_type(&self, name: &str, snapshot: &FleetSnapshot) -> Result<()> {
        let worker_type = self.store.load_worker_type(name).await?;

        // Key pair must exist everywhere before any bid references it.
        self.keypairs.ensure(self.adapter.as_ref(), name).await?;

        let pending_tasks = self.queue.pending_tasks(name).await?;
        let capacity = {
            let tracker = crate::lock(&self.in_flight);
            current_capacity(&worker_type, snapshot, &tracker)
        };
        let target = target_capacity(&worker_type, pending_tasks);
        debug!(
            worker_type = %name,
            pending_tasks,
            capacity,
            target,
            "capacity sized"
        );

        let bidder = Bidder::new(
            &self.config,
            self.adapter.as_ref(),
            self.pricing.as_deref(),
            self.sink.as_ref(),
        );

        if capacity < target {
            bidder
                .provision(&worker_type, target - capacity, &self.in_flight)
                .await?;
        } else if capacity > worker_type.max_capacity {
            let plan = {
                let tracker = crate::lock(&self.in_flight);
                plan_excess_kill(
                    &worker_type,
                    snapshot,
                    &tracker,
                    false,
                    &mut rand::thread_rng(),
                )
            };
            bidder.execute_kill_plan(&plan, &self.in_flight).await?;
        }

        Ok(())
    }

    /// Tag whatever the snapshot shows as untagged. Never fatal.
    async fn apply_tags(&self, snapshot: &FleetSnapshot) {
        let mut batches: HashMap<(String, String), Vec<String>> = HashMap::new();

        for instance in snapshot.instances() {
            if !instance.tags.contains_key("Owner") {
                batches
                    .entry((instance.region.clone(), instance.worker_type.clone()))
                    .or_default()
                    .push(instance.instance_id.clone());
            }
        }
        for request in snapshot.requests() {
            if !request.tags.contains_key("Owner") {
                batches
                    .entry((request.region.clone(), request.worker_type.clone()))
                    .or_default()
                    .push(request.request_id.clone());
            }
        }

        for ((region, worker_type), ids) in batches {
            let tags = vec![
                ("Name".to_string(), worker_type.clone()),
                ("Owner".to_string(), self.config.provisioner_id.clone()),
                (
                    "WorkerType".to_string(),
                    format!("{}/{}", self.config.provisioner_id, worker_type),
                ),
            ];
            if let Err(e) = self.adapter.create_tags(&region, &ids, &tags).await {
                debug!(region = %region, error = %e, "tagging failed, ignored");
            }
        }
    }
}
