//! End-to-end reconciliation scenarios against an in-memory cloud

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use flotilla_core::{
    CoreError, EventSink, FleetEvent, InstanceTypeDef, RegionDef, TaskQueue, WorkerType,
    WorkerTypeStore,
};
use flotilla_provisioner::{
    CloudApi, FleetInstance, InstanceLiveness, InstanceState, ProvisionerConfig, Reconciler,
    RequestPhase, RequestState, Result, SpotBid, SpotRequest, StateReason,
};

const REGIONS: [&str; 2] = ["us-east-1", "us-west-2"];
const KEY_PREFIX: &str = "prov:";

#[derive(Default)]
struct CloudState {
    live_instances: Vec<FleetInstance>,
    dead_instances: Vec<FleetInstance>,
    open_requests: Vec<SpotRequest>,
    resolved_requests: Vec<SpotRequest>,
    key_pairs: HashSet<(String, String)>,
    submitted: Vec<SpotBid>,
    terminated: Vec<(String, String)>,
    cancelled: Vec<(String, String)>,
    next_request_id: u32,
}

/// In-memory cloud; tests mutate its state directly to simulate the
/// asynchronous transitions the real API reveals over time.
#[derive(Default)]
struct MockCloud {
    state: Mutex<CloudState>,
}

impl MockCloud {
    fn with<T>(&self, f: impl FnOnce(&mut CloudState) -> T) -> T {
        f(&mut self.state.lock().unwrap())
    }

    fn submitted_ids(&self) -> Vec<String> {
        self.with(|s| {
            (1..=s.submitted.len() as u32)
                .map(|n| format!("sir-{n:04}"))
                .collect()
        })
    }
}

#[async_trait]
impl CloudApi for MockCloud {
    async fn describe_instances(
        &self,
        region: &str,
        liveness: InstanceLiveness,
    ) -> Result<Vec<FleetInstance>> {
        self.with(|s| {
            let source = match liveness {
                InstanceLiveness::Live => &s.live_instances,
                InstanceLiveness::Dead => &s.dead_instances,
            };
            Ok(source.iter().filter(|i| i.region == region).cloned().collect())
        })
    }

    async fn describe_spot_requests(
        &self,
        region: &str,
        phase: RequestPhase,
    ) -> Result<Vec<SpotRequest>> {
        self.with(|s| {
            let source = match phase {
                RequestPhase::Open => &s.open_requests,
                RequestPhase::Resolved => &s.resolved_requests,
            };
            Ok(source.iter().filter(|r| r.region == region).cloned().collect())
        })
    }

    async fn request_spot(&self, _region: &str, bid: &SpotBid) -> Result<String> {
        self.with(|s| {
            s.submitted.push(bid.clone());
            s.next_request_id += 1;
            Ok(format!("sir-{:04}", s.next_request_id))
        })
    }

    async fn terminate_instances(&self, region: &str, instance_ids: &[String]) -> Result<()> {
        self.with(|s| {
            for id in instance_ids {
                s.terminated.push((region.to_string(), id.clone()));
                s.live_instances
                    .retain(|i| !(i.region == region && &i.instance_id == id));
            }
            Ok(())
        })
    }

    async fn cancel_spot_requests(&self, region: &str, request_ids: &[String]) -> Result<()> {
        self.with(|s| {
            for id in request_ids {
                s.cancelled.push((region.to_string(), id.clone()));
                s.open_requests
                    .retain(|r| !(r.region == region && &r.request_id == id));
            }
            Ok(())
        })
    }

    async fn import_key_pair(
        &self,
        region: &str,
        key_name: &str,
        _public_key_body: &str,
    ) -> Result<()> {
        self.with(|s| {
            s.key_pairs.insert((region.to_string(), key_name.to_string()));
            Ok(())
        })
    }

    async fn describe_key_pairs(&self, region: &str, key_names: &[String]) -> Result<Vec<String>> {
        self.with(|s| {
            Ok(key_names
                .iter()
                .filter(|n| s.key_pairs.contains(&(region.to_string(), (*n).clone())))
                .cloned()
                .collect())
        })
    }

    async fn delete_key_pair(&self, region: &str, key_name: &str) -> Result<()> {
        self.with(|s| {
            s.key_pairs.remove(&(region.to_string(), key_name.to_string()));
            Ok(())
        })
    }

    async fn create_tags(
        &self,
        _region: &str,
        _resource_ids: &[String],
        _tags: &[(String, String)],
    ) -> Result<()> {
        Ok(())
    }
}

struct MemStore {
    worker_types: Vec<WorkerType>,
    pending: HashMap<String, u64>,
}

#[async_trait]
impl WorkerTypeStore for MemStore {
    async fn list_worker_types(&self) -> flotilla_core::Result<Vec<String>> {
        Ok(self.worker_types.iter().map(|w| w.name.clone()).collect())
    }

    async fn load_worker_type(&self, name: &str) -> flotilla_core::Result<WorkerType> {
        self.worker_types
            .iter()
            .find(|w| w.name == name)
            .cloned()
            .ok_or_else(|| CoreError::UnknownWorkerType(name.to_string()))
    }
}

#[async_trait]
impl TaskQueue for MemStore {
    async fn pending_tasks(&self, worker_type: &str) -> flotilla_core::Result<u64> {
        Ok(self.pending.get(worker_type).copied().unwrap_or(0))
    }
}

#[derive(Default)]
struct MemSink {
    events: Mutex<Vec<FleetEvent>>,
}

impl EventSink for MemSink {
    fn emit(&self, event: FleetEvent) {
        self.events.lock().unwrap().push(event);
    }
}

impl MemSink {
    fn count(&self, kind: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.kind() == kind)
            .count()
    }

    fn events(&self) -> Vec<FleetEvent> {
        self.events.lock().unwrap().clone()
    }
}

fn worker_type(name: &str, min: u32, max: u32, ratio: f64) -> WorkerType {
    WorkerType {
        name: name.to_string(),
        min_capacity: min,
        max_capacity: max,
        scaling_ratio: ratio,
        min_price: 0.0,
        max_price: 0.5,
        instance_types: vec![InstanceTypeDef {
            instance_type: "c5.large".to_string(),
            capacity: 1,
            utility: 1.0,
            overrides: serde_json::Value::Null,
        }],
        regions: REGIONS
            .iter()
            .map(|r| RegionDef {
                region: r.to_string(),
                overrides: serde_json::Value::Null,
            })
            .collect(),
        shared_launch_spec: serde_json::json!({"image_id": "ami-test"}),
    }
}

fn live_instance(id: &str, region: &str, worker: &str) -> FleetInstance {
    FleetInstance {
        instance_id: id.to_string(),
        region: region.to_string(),
        zone: Some(format!("{region}a")),
        worker_type: String::new(),
        instance_type: "c5.large".to_string(),
        image_id: Some("ami-test".to_string()),
        launch_time: Some(Utc::now() - ChronoDuration::hours(1)),
        state: InstanceState::Running,
        spot_request_id: None,
        state_reason: None,
        key_name: Some(format!("{KEY_PREFIX}{worker}")),
        tags: HashMap::new(),
    }
}

fn open_request(id: &str, region: &str, worker: &str) -> SpotRequest {
    SpotRequest {
        request_id: id.to_string(),
        region: region.to_string(),
        zone: Some(format!("{region}a")),
        worker_type: String::new(),
        instance_type: "c5.large".to_string(),
        image_id: Some("ami-test".to_string()),
        create_time: Some(Utc::now() - ChronoDuration::minutes(1)),
        state: RequestState::Open,
        status_code: "pending-fulfillment".to_string(),
        status_message: String::new(),
        status_update_time: Some(Utc::now()),
        bid_price: 0.5,
        instance_id: None,
        key_name: Some(format!("{KEY_PREFIX}{worker}")),
        tags: HashMap::new(),
    }
}

fn harness(
    worker_types: Vec<WorkerType>,
    pending: HashMap<String, u64>,
) -> (Arc<Reconciler>, Arc<MockCloud>, Arc<MemSink>) {
    let config = ProvisionerConfig::default()
        .with_provisioner_id("flotilla-test")
        .with_key_prefix(KEY_PREFIX)
        .with_regions(REGIONS.iter().map(|r| r.to_string()).collect())
        .with_public_key_body("ssh-rsa AAAATEST");

    let cloud = Arc::new(MockCloud::default());
    let sink = Arc::new(MemSink::default());
    let store = Arc::new(MemStore {
        worker_types,
        pending,
    });

    let reconciler = Arc::new(Reconciler::new(
        config,
        cloud.clone(),
        store.clone(),
        store,
        None,
        sink.clone(),
    ));

    (reconciler, cloud, sink)
}

/// Cold start bids the full delta and records every request ID
#[tokio::test]
async fn cold_start_provisions_the_backlog() {
    let (reconciler, cloud, sink) = harness(
        vec![worker_type("w", 2, 10, 0.5)],
        HashMap::from([("w".to_string(), 10)]),
    );

    reconciler.run_iteration().await.unwrap();

    // 10 pending at ratio 0.5 targets 5 capacity units of 1 each
    cloud.with(|s| {
        assert_eq!(s.submitted.len(), 5);
        for bid in &s.submitted {
            assert_eq!(bid.worker_type, "w");
            assert_eq!(bid.key_name, "prov:w");
            assert_eq!(bid.instance_type, "c5.large");
            assert!((bid.bid_price - 0.5).abs() < f64::EPSILON);
        }
        // Key pair was ensured in every allowed region before bidding
        for region in REGIONS {
            assert!(s.key_pairs.contains(&(region.to_string(), "prov:w".to_string())));
        }
    });

    // Every accepted bid is tracked before the iteration ends
    let tracked: HashSet<String> = reconciler
        .in_flight_bids()
        .into_iter()
        .map(|b| b.request_id)
        .collect();
    assert_eq!(tracked.len(), 5);
    for id in cloud.submitted_ids() {
        assert!(tracked.contains(&id), "{id} missing from in-flight tracker");
    }
    assert_eq!(sink.count("request_submitted"), 5);
    assert_eq!(sink.count("ami_usage"), 5);
}

/// Partially visible bids leave the tracker; capacity still counts all
#[tokio::test]
async fn in_flight_bridges_partial_visibility() {
    let (reconciler, cloud, sink) = harness(
        vec![worker_type("w", 2, 10, 0.5)],
        HashMap::from([("w".to_string(), 10)]),
    );

    reconciler.run_iteration().await.unwrap();
    let ids = cloud.submitted_ids();
    assert_eq!(ids.len(), 5);

    // The cloud catches up on 3 of the 5 bids
    cloud.with(|s| {
        for id in &ids[..3] {
            s.open_requests.push(open_request(id, "us-east-1", "w"));
        }
    });

    reconciler.run_iteration().await.unwrap();

    // 3 became visible, 2 still bridge the gap; 3 + 2 = 5 means no re-bid
    assert_eq!(reconciler.in_flight_bids().len(), 2);
    cloud.with(|s| assert_eq!(s.submitted.len(), 5, "double-provisioned"));
    assert_eq!(sink.count("bid_visibility_lag"), 3);
    assert!(sink.events().iter().all(|e| match e {
        FleetEvent::BidVisibilityLag { timed_out, .. } => !timed_out,
        _ => true,
    }));
}

/// An over-aged open bid is cancelled in the same iteration
#[tokio::test]
async fn stalled_bid_is_cancelled_synchronously() {
    let (reconciler, cloud, _sink) = harness(
        vec![worker_type("w", 0, 10, 1.0)],
        HashMap::new(),
    );

    cloud.with(|s| {
        let mut stalled = open_request("sir-stalled", "us-east-1", "w");
        stalled.create_time = Some(Utc::now() - ChronoDuration::minutes(25));
        s.open_requests.push(stalled);
    });

    reconciler.run_iteration().await.unwrap();

    cloud.with(|s| {
        assert!(s
            .cancelled
            .contains(&("us-east-1".to_string(), "sir-stalled".to_string())));
        // And it never re-entered provisioned capacity: no replacement bid
        // beyond what the (empty) backlog asks for.
        assert!(s.submitted.is_empty());
    });
}

/// A spot-market termination surfaces the price floor from the dead bid
#[tokio::test]
async fn spot_termination_reveals_price_floor() {
    let (reconciler, cloud, sink) = harness(
        vec![worker_type("w", 0, 10, 1.0)],
        HashMap::new(),
    );

    cloud.with(|s| {
        let mut instance = live_instance("i-floor", "us-east-1", "w");
        instance.spot_request_id = Some("sir-floor".to_string());
        s.live_instances.push(instance);
    });

    reconciler.run_iteration().await.unwrap();

    // The market takes the instance between iterations
    cloud.with(|s| {
        let mut gone = s.live_instances.pop().unwrap();
        gone.state = InstanceState::Terminated;
        gone.state_reason = Some(StateReason {
            code: "Server.SpotInstanceTermination".to_string(),
            message: "Your Spot request price is lower than the price floor".to_string(),
        });
        s.dead_instances.push(gone);

        let mut request = open_request("sir-floor", "us-east-1", "w");
        request.state = RequestState::Closed;
        request.status_code = "instance-terminated-by-price".to_string();
        request.bid_price = 0.41;
        s.resolved_requests.push(request);
    });

    reconciler.run_iteration().await.unwrap();

    assert_eq!(sink.count("instance_terminated"), 1);
    assert_eq!(sink.count("spot_price_floor"), 1);
    let floor = sink
        .events()
        .into_iter()
        .find_map(|e| match e {
            FleetEvent::SpotPriceFloor { price, .. } => Some(price),
            _ => None,
        })
        .unwrap();
    assert!((floor - 0.41).abs() < f64::EPSILON);
}

/// Everything owned by an unconfigured worker type is removed
#[tokio::test]
async fn rogue_worker_type_is_swept() {
    let (reconciler, cloud, _sink) = harness(
        vec![worker_type("modern", 0, 10, 1.0)],
        HashMap::new(),
    );

    cloud.with(|s| {
        s.live_instances.push(live_instance("i-legacy", "us-east-1", "legacy"));
        s.open_requests.push(open_request("sir-legacy", "us-west-2", "legacy"));
        for region in REGIONS {
            s.key_pairs.insert((region.to_string(), "prov:legacy".to_string()));
        }
    });

    reconciler.run_iteration().await.unwrap();

    cloud.with(|s| {
        assert!(s
            .terminated
            .contains(&("us-east-1".to_string(), "i-legacy".to_string())));
        assert!(s
            .cancelled
            .contains(&("us-west-2".to_string(), "sir-legacy".to_string())));
        for region in REGIONS {
            assert!(
                !s.key_pairs.contains(&(region.to_string(), "prov:legacy".to_string())),
                "legacy key pair survived in {region}"
            );
        }
    });
}

/// A second rogue pass has nothing left to do
#[tokio::test]
async fn rogue_sweep_is_idempotent() {
    let (reconciler, cloud, _sink) = harness(
        vec![worker_type("modern", 0, 10, 1.0)],
        HashMap::new(),
    );

    cloud.with(|s| {
        s.live_instances.push(live_instance("i-legacy", "us-east-1", "legacy"));
        s.open_requests.push(open_request("sir-legacy", "us-east-1", "legacy"));
    });

    reconciler.sweep_rogues(false).await.unwrap();
    let (terminated, cancelled) =
        cloud.with(|s| (s.terminated.len(), s.cancelled.len()));

    reconciler.sweep_rogues(false).await.unwrap();
    cloud.with(|s| {
        assert_eq!(s.terminated.len(), terminated);
        assert_eq!(s.cancelled.len(), cancelled);
    });
}

/// Only instances beyond the maximum life are terminated
#[tokio::test]
async fn age_killer_spares_the_young() {
    let (reconciler, cloud, _sink) = harness(
        vec![worker_type("w", 0, 10, 1.0)],
        HashMap::new(),
    );

    cloud.with(|s| {
        let mut old = live_instance("i-old", "us-east-1", "w");
        old.launch_time = Some(Utc::now() - ChronoDuration::hours(100));
        let mut young = live_instance("i-young", "us-east-1", "w");
        young.launch_time = Some(Utc::now() - ChronoDuration::hours(20));
        s.live_instances.push(old);
        s.live_instances.push(young);
    });

    reconciler.run_iteration().await.unwrap();

    cloud.with(|s| {
        assert!(s
            .terminated
            .contains(&("us-east-1".to_string(), "i-old".to_string())));
        assert!(!s
            .terminated
            .iter()
            .any(|(_, id)| id == "i-young"));
    });
}

/// Running twice against unchanged cloud state bids and kills nothing
/// the second time
#[tokio::test]
async fn iteration_is_idempotent_at_steady_state() {
    let (reconciler, cloud, _sink) = harness(
        vec![worker_type("w", 0, 10, 0.0)],
        HashMap::from([("w".to_string(), 2)]),
    );

    cloud.with(|s| {
        s.live_instances.push(live_instance("i-1", "us-east-1", "w"));
        s.live_instances.push(live_instance("i-2", "us-east-1", "w"));
    });

    reconciler.run_iteration().await.unwrap();
    reconciler.run_iteration().await.unwrap();

    cloud.with(|s| {
        assert!(s.submitted.is_empty(), "steady state produced bids");
        assert!(s.terminated.is_empty(), "steady state produced kills");
        assert!(s.cancelled.is_empty(), "steady state produced cancels");
    });
}

/// Over-capacity worker types shrink back inside their bounds
#[tokio::test]
async fn excess_capacity_is_released() {
    let (reconciler, cloud, _sink) = harness(
        vec![worker_type("w", 1, 2, 0.0)],
        HashMap::new(),
    );

    cloud.with(|s| {
        for n in 0..4 {
            s.live_instances
                .push(live_instance(&format!("i-{n}"), "us-east-1", "w"));
        }
    });

    reconciler.run_iteration().await.unwrap();

    // Capacity 4 over max 2: exactly two instances released
    cloud.with(|s| {
        assert_eq!(s.terminated.len(), 2);
        assert_eq!(s.live_instances.len(), 2);
        assert!(s.submitted.is_empty());
    });
}
