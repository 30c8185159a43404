//! Snapshot diffing
//!
//! The cloud API reveals most transitions only asynchronously: an instance
//! or request simply stops appearing in the live view, and its terminal
//! metadata shows up in the dead view some iterations later. The diff
//! engine compares the previous and current snapshots to find departures,
//! resolves each against the dead view, and parks whatever cannot be
//! resolved yet on the pending-resolution tracker.
//!
//! The engine is pure with respect to the cloud: it reads snapshots,
//! mutates only the pending tracker, and returns the events to publish.

use chrono::{DateTime, Utc};
use tracing::debug;

use flotilla_core::{events::now_ms, FleetEvent};

use crate::snapshot::{
    FleetInstance, FleetSnapshot, RequestState, SpotRequest, REASON_SPOT_TERMINATION,
    STATUS_FULFILLED,
};
use crate::tracker::PendingResolutionTracker;

/// Diff the previous and current snapshots and classify every departure.
///
/// Ordering per iteration:
/// 1. resolve parked entries whose terminal metadata the dead view now has
/// 2. age the remaining parked entries, dropping any over budget
/// 3. classify instances and requests that departed since `previous`,
///    parking those the dead view cannot explain yet
pub fn diff_iteration(
    previous: &FleetSnapshot,
    current: &FleetSnapshot,
    dead: &FleetSnapshot,
    pending: &mut PendingResolutionTracker,
    now: DateTime<Utc>,
) -> Vec<FleetEvent> {
    let mut events = Vec::new();

    // 1. Revisit parked departures.
    let resolved_instances = pending.take_instances(|entry| {
        dead.find_instance(&entry.id)
            .is_some_and(|i| i.state_reason.is_some())
    });
    for entry in resolved_instances {
        if let Some(instance) = dead.find_instance(&entry.id) {
            debug!(instance_id = %entry.id, "parked departure resolved");
            emit_instance_terminated(instance, dead, entry.first_seen_at, &mut events);
        }
    }

    let resolved_requests = pending.take_requests(|entry| {
        dead.find_request(&entry.id)
            .is_some_and(|r| r.state != RequestState::Open)
    });
    for entry in resolved_requests {
        if let Some(request) = dead.find_request(&entry.id) {
            debug!(request_id = %entry.id, "parked request resolved");
            emit_request_resolution(request, &mut events);
        }
    }

    // 2. Entries past their retry budget are dropped silently.
    let dropped = pending.advance();
    if dropped > 0 {
        debug!(dropped, "gave up waiting for terminal metadata");
    }

    // 3. Departed instances: in previous, gone from current.
    let current_instances = current.instance_ids();
    for departed in previous
        .instances()
        .iter()
        .filter(|i| !current_instances.contains(i.instance_id.as_str()))
    {
        match dead.find_instance(&departed.instance_id) {
            Some(rich) if rich.state_reason.is_some() => {
                emit_instance_terminated(rich, dead, now, &mut events);
            }
            _ => pending.note_instance(departed.instance_id.clone(), now),
        }
    }

    // 4. Departed requests, matched on request_id.
    let current_requests = current.request_ids();
    for departed in previous
        .requests()
        .iter()
        .filter(|r| !current_requests.contains(r.request_id.as_str()))
    {
        match dead.find_request(&departed.request_id) {
            Some(rich) if rich.state != RequestState::Open => {
                emit_request_resolution(rich, &mut events);
            }
            // The dead view still says open (or has nothing): retry next
            // iteration.
            _ => pending.note_request(departed.request_id.clone(), now),
        }
    }

    events
}

/// Emit `instance_terminated`, plus `spot_price_floor` when the spot
/// market took the instance and the originating bid is recoverable.
fn emit_instance_terminated(
    instance: &FleetInstance,
    dead: &FleetSnapshot,
    first_seen_at: DateTime<Utc>,
    events: &mut Vec<FleetEvent>,
) {
    let reason = match &instance.state_reason {
        Some(reason) => reason,
        None => return,
    };

    events.push(FleetEvent::InstanceTerminated {
        worker_type: instance.worker_type.clone(),
        region: instance.region.clone(),
        instance_id: instance.instance_id.clone(),
        reason_code: reason.code.clone(),
        reason_message: reason.message.clone(),
        first_seen_at: first_seen_at.timestamp_millis(),
        at: now_ms(),
    });

    if reason.code == REASON_SPOT_TERMINATION {
        let bid = instance
            .spot_request_id
            .as_deref()
            .and_then(|id| dead.find_request(id));
        if let Some(request) = bid {
            events.push(FleetEvent::SpotPriceFloor {
                worker_type: instance.worker_type.clone(),
                region: instance.region.clone(),
                zone: instance.zone.clone(),
                instance_type: instance.instance_type.clone(),
                price: request.bid_price,
                at: now_ms(),
            });
        }
    }
}

/// Classify a departed request that the dead view has an answer for
fn emit_request_resolution(request: &SpotRequest, events: &mut Vec<FleetEvent>) {
    if request.state == RequestState::Active && request.status_code == STATUS_FULFILLED {
        events.push(FleetEvent::RequestFulfilled {
            worker_type: request.worker_type.clone(),
            region: request.region.clone(),
            request_id: request.request_id.clone(),
            instance_id: request.instance_id.clone(),
            at: now_ms(),
        });
    } else {
        events.push(FleetEvent::RequestDied {
            worker_type: request.worker_type.clone(),
            region: request.region.clone(),
            request_id: request.request_id.clone(),
            state: request.state.as_str().to_string(),
            status_code: request.status_code.clone(),
            status_message: request.status_message.clone(),
            bid_price: request.bid_price,
            at: now_ms(),
        });
    }
}
