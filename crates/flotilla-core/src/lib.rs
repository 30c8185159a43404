//! Flotilla Core - Shared types and traits
//!
//! This crate defines the core abstractions used across:
//! - flotilla-provisioner (reconciliation and bidding loop)
//! - flotilla-api (private, worker-type CRUD surface)
//!
//! Key types:
//! - WorkerType definitions and launch-spec resolution
//! - Collaborator traits (store, task queue, pricing, event sink)
//! - FleetEvent (structured events emitted by the reconciler)
//! - Error types

pub mod error;
pub mod events;
pub mod traits;
pub mod types;

pub use error::*;
pub use events::*;
pub use traits::*;
pub use types::*;
