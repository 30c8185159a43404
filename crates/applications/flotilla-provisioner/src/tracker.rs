//! Process-local trackers bridging cloud eventual consistency
//!
//! Two bounded sets, both owned exclusively by the reconciler and never
//! persisted:
//!
//! - [`InFlightTracker`] holds bids the cloud API accepted but whose
//!   request IDs have not yet appeared in any snapshot. Entries leave when
//!   they become visible or after a wall-clock timeout.
//! - [`PendingResolutionTracker`] holds departed resources whose terminal
//!   metadata the dead view has not yet produced. Entries are retried for
//!   a bounded number of iterations and then dropped silently.
//!
//! Both trackers update with a build-next-state-then-swap discipline; no
//! entry is spliced out while a scan is walking the set.

use chrono::{DateTime, Utc};
use std::collections::HashSet;

/// A submitted bid that has not yet appeared in a snapshot
#[derive(Debug, Clone)]
pub struct InFlightBid {
    /// Request ID returned by the cloud API
    pub request_id: String,
    /// Worker type the bid provisions for
    pub worker_type: String,
    /// Region the bid was placed in
    pub region: String,
    /// Availability zone, when one was targeted
    pub zone: Option<String>,
    /// Instance type the bid asks for
    pub instance_type: String,
    /// Bid price, USD per hour
    pub bid_price: f64,
    /// When the cloud API accepted the bid
    pub submitted_at: DateTime<Utc>,
}

/// Outcome of one in-flight sweep
#[derive(Debug, Default)]
pub struct SweepOutcome {
    /// Bids that appeared in the current snapshot
    pub visible: Vec<InFlightBid>,
    /// Bids that outlived the in-flight timeout without appearing
    pub timed_out: Vec<InFlightBid>,
}

/// Tracks bids between submission and snapshot visibility
#[derive(Debug)]
pub struct InFlightTracker {
    timeout: chrono::Duration,
    bids: Vec<InFlightBid>,
}

impl InFlightTracker {
    /// Create a tracker with the given wall-clock timeout
    pub fn new(timeout: chrono::Duration) -> Self {
        Self {
            timeout,
            bids: Vec::new(),
        }
    }

    /// Record a freshly submitted bid
    pub fn insert(&mut self, bid: InFlightBid) {
        if !self.contains(&bid.request_id) {
            self.bids.push(bid);
        }
    }

    /// Remove one entry by request ID. Idempotent.
    pub fn remove(&mut self, request_id: &str) -> Option<InFlightBid> {
        let index = self.bids.iter().position(|b| b.request_id == request_id)?;
        Some(self.bids.remove(index))
    }

    /// Check whether a request ID is tracked
    pub fn contains(&self, request_id: &str) -> bool {
        self.bids.iter().any(|b| b.request_id == request_id)
    }

    /// All tracked bids
    pub fn bids(&self) -> &[InFlightBid] {
        &self.bids
    }

    /// Tracked bids for one worker type
    pub fn bids_for<'a>(&'a self, worker_type: &'a str) -> impl Iterator<Item = &'a InFlightBid> {
        self.bids.iter().filter(move |b| b.worker_type == worker_type)
    }

    /// Number of tracked bids
    pub fn len(&self) -> usize {
        self.bids.len()
    }

    /// Whether the tracker is empty
    pub fn is_empty(&self) -> bool {
        self.bids.is_empty()
    }

    /// Sweep the tracker against the request IDs visible in the current
    /// snapshot.
    ///
    /// Entries whose ID is visible have bridged the consistency gap and
    /// are removed; entries older than the timeout are removed as
    /// timed-out. Everything else stays.
    pub fn sweep(&mut self, visible: &HashSet<&str>, now: DateTime<Utc>) -> SweepOutcome {
        let mut outcome = SweepOutcome::default();
        let mut kept = Vec::with_capacity(self.bids.len());

        for bid in self.bids.drain(..) {
            if visible.contains(bid.request_id.as_str()) {
                outcome.visible.push(bid);
            } else if now - bid.submitted_at > self.timeout {
                outcome.timed_out.push(bid);
            } else {
                kept.push(bid);
            }
        }

        self.bids = kept;
        outcome
    }
}

/// A departed resource awaiting terminal metadata
#[derive(Debug, Clone)]
pub struct PendingEntry {
    /// Resource ID (instance ID or request ID)
    pub id: String,
    /// When the departure was first observed
    pub first_seen_at: DateTime<Utc>,
    /// Iterations this entry has been retried
    pub iterations: u32,
}

/// Tracks departed resources whose resolution is still pending
#[derive(Debug)]
pub struct PendingResolutionTracker {
    budget: u32,
    instances: Vec<PendingEntry>,
    requests: Vec<PendingEntry>,
}

impl PendingResolutionTracker {
    /// Create a tracker with the given per-entry iteration budget
    pub fn new(budget: u32) -> Self {
        Self {
            budget,
            instances: Vec::new(),
            requests: Vec::new(),
        }
    }

    /// Enqueue a departed instance awaiting a termination reason
    pub fn note_instance(&mut self, id: impl Into<String>, now: DateTime<Utc>) {
        let id = id.into();
        if !self.instances.iter().any(|e| e.id == id) {
            self.instances.push(PendingEntry {
                id,
                first_seen_at: now,
                iterations: 0,
            });
        }
    }

    /// Enqueue a departed request awaiting classification
    pub fn note_request(&mut self, id: impl Into<String>, now: DateTime<Utc>) {
        let id = id.into();
        if !self.requests.iter().any(|e| e.id == id) {
            self.requests.push(PendingEntry {
                id,
                first_seen_at: now,
                iterations: 0,
            });
        }
    }

    /// Pending instance entries
    pub fn instances(&self) -> &[PendingEntry] {
        &self.instances
    }

    /// Pending request entries
    pub fn requests(&self) -> &[PendingEntry] {
        &self.requests
    }

    /// Remove and return the instance entries matching a predicate
    pub fn take_instances(&mut self, mut resolved: impl FnMut(&PendingEntry) -> bool) -> Vec<PendingEntry> {
        let (taken, kept): (Vec<_>, Vec<_>) =
            self.instances.drain(..).partition(|e| resolved(e));
        self.instances = kept;
        taken
    }

    /// Remove and return the request entries matching a predicate
    pub fn take_requests(&mut self, mut resolved: impl FnMut(&PendingEntry) -> bool) -> Vec<PendingEntry> {
        let (taken, kept): (Vec<_>, Vec<_>) = self.requests.drain(..).partition(|e| resolved(e));
        self.requests = kept;
        taken
    }

    /// Advance all entries by one iteration, dropping those that have
    /// outlived the retry budget. Returns the number dropped.
    pub fn advance(&mut self) -> usize {
        let budget = self.budget;
        let advance_set = |entries: &mut Vec<PendingEntry>| {
            let before = entries.len();
            let next: Vec<PendingEntry> = entries
                .drain(..)
                .filter_map(|mut e| {
                    e.iterations += 1;
                    (e.iterations <= budget).then_some(e)
                })
                .collect();
            *entries = next;
            before - entries.len()
        };

        advance_set(&mut self.instances) + advance_set(&mut self.requests)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bid(id: &str, age_minutes: i64) -> InFlightBid {
        InFlightBid {
            request_id: id.to_string(),
            worker_type: "builder".to_string(),
            region: "us-east-1".to_string(),
            zone: None,
            instance_type: "c5.large".to_string(),
            bid_price: 0.2,
            submitted_at: Utc::now() - chrono::Duration::minutes(age_minutes),
        }
    }

    #[test]
    fn test_sweep_partitions_visible_and_timed_out() {
        let mut tracker = InFlightTracker::new(chrono::Duration::minutes(15));
        tracker.insert(bid("sir-visible", 2));
        tracker.insert(bid("sir-young", 2));
        tracker.insert(bid("sir-old", 20));

        let visible: HashSet<&str> = ["sir-visible"].into_iter().collect();
        let outcome = tracker.sweep(&visible, Utc::now());

        assert_eq!(outcome.visible.len(), 1);
        assert_eq!(outcome.visible[0].request_id, "sir-visible");
        assert_eq!(outcome.timed_out.len(), 1);
        assert_eq!(outcome.timed_out[0].request_id, "sir-old");
        assert_eq!(tracker.len(), 1);
        assert!(tracker.contains("sir-young"));
    }

    #[test]
    fn test_insert_and_remove_are_idempotent() {
        let mut tracker = InFlightTracker::new(chrono::Duration::minutes(15));
        tracker.insert(bid("sir-1", 0));
        tracker.insert(bid("sir-1", 0));
        assert_eq!(tracker.len(), 1);

        assert!(tracker.remove("sir-1").is_some());
        assert!(tracker.remove("sir-1").is_none());
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_pending_entries_expire_after_budget() {
        let mut tracker = PendingResolutionTracker::new(3);
        tracker.note_instance("i-1", Utc::now());
        tracker.note_request("sir-1", Utc::now());

        for _ in 0..3 {
            assert_eq!(tracker.advance(), 0);
        }
        assert_eq!(tracker.instances().len(), 1);

        // Fourth advance pushes both past the budget
        assert_eq!(tracker.advance(), 2);
        assert!(tracker.instances().is_empty());
        assert!(tracker.requests().is_empty());
    }

    #[test]
    fn test_pending_note_is_idempotent() {
        let mut tracker = PendingResolutionTracker::new(20);
        let first_seen = Utc::now() - chrono::Duration::minutes(5);
        tracker.note_instance("i-1", first_seen);
        tracker.note_instance("i-1", Utc::now());

        assert_eq!(tracker.instances().len(), 1);
        assert_eq!(tracker.instances()[0].first_seen_at, first_seen);
    }

    #[test]
    fn test_take_resolved_entries() {
        let mut tracker = PendingResolutionTracker::new(20);
        tracker.note_instance("i-1", Utc::now());
        tracker.note_instance("i-2", Utc::now());

        let taken = tracker.take_instances(|e| e.id == "i-1");
        assert_eq!(taken.len(), 1);
        assert_eq!(tracker.instances().len(), 1);
        assert_eq!(tracker.instances()[0].id, "i-2");
    }
}
