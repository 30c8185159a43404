//! # Flotilla Provisioner
//!
//! Reconciliation and bidding core of the Flotilla elastic spot-fleet
//! provisioner.
//!
//! ## Architecture
//!
//! ```text
//! Reconciler (one iteration every tick)
//! ├── Cloud adapter        ←──  per-region EC2 APIs
//! ├── Fleet snapshot            (classify + stalled bisect)
//! ├── Diff engine               (departures, terminal metadata)
//! ├── In-flight / pending       (eventual-consistency bridges)
//! ├── Bidder                    (capacity sizing, price selection)
//! └── Safety killers            (rogue + age)
//! ```
//!
//! The reconciler is self-healing by repetition: every iteration observes
//! the fleet from scratch, so a missed event or failed kill is simply
//! reconsidered on the next tick. The only process state worth protecting
//! is the pair of eventual-consistency trackers, and those are bounded
//! and non-durable by design.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod adapter;
pub mod bidder;
pub mod config;
pub mod diff;
pub mod error;
pub mod keypairs;
pub mod killers;
pub mod reconciler;
pub mod sink;
pub mod snapshot;
pub mod tracker;

#[cfg(test)]
pub(crate) mod testutil;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the inner state from a poisoned lock.
/// Guards never span an await point, so the inner state is always
/// consistent.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// Error handling
pub use error::{ProvisionerError, Result};

// Configuration
pub use config::ProvisionerConfig;

// Cloud surface
pub use adapter::{CloudApi, Ec2Adapter, InstanceLiveness, RequestPhase, SpotBid};

// Fleet model
pub use snapshot::{
    FleetInstance, FleetSnapshot, InstanceState, RequestState, SpotRequest, StateReason,
};

// Trackers
pub use tracker::{InFlightBid, InFlightTracker, PendingResolutionTracker};

// Sizing and bidding
pub use bidder::{current_capacity, target_capacity, BidCandidate, Bidder, KillPlan};

// Iteration driver
pub use reconciler::Reconciler;

// Event transport
pub use sink::LogEventSink;
