//! Structured events emitted by the reconciliation core
//!
//! Transport is pluggable: the core hands every event to an [`EventSink`]
//! and never waits on delivery. All timestamps are epoch milliseconds.
//!
//! [`EventSink`]: crate::traits::EventSink

use serde::{Deserialize, Serialize};

/// Current time as epoch milliseconds
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// An event produced by the reconciliation core
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FleetEvent {
    /// A spot bid was accepted by the cloud API
    RequestSubmitted {
        worker_type: String,
        region: String,
        zone: Option<String>,
        instance_type: String,
        request_id: String,
        bid_price: f64,
        at: i64,
    },

    /// A departed request resolved as fulfilled
    RequestFulfilled {
        worker_type: String,
        region: String,
        request_id: String,
        instance_id: Option<String>,
        at: i64,
    },

    /// A departed request resolved as anything other than fulfilled
    RequestDied {
        worker_type: String,
        region: String,
        request_id: String,
        state: String,
        status_code: String,
        status_message: String,
        bid_price: f64,
        at: i64,
    },

    /// A departed instance resolved with a termination reason
    InstanceTerminated {
        worker_type: String,
        region: String,
        instance_id: String,
        reason_code: String,
        reason_message: String,
        /// When the departure was first observed, for entries that waited
        /// on the pending-resolution tracker
        first_seen_at: i64,
        at: i64,
    },

    /// The spot market terminated an instance, revealing the price floor
    /// our bid fell under
    SpotPriceFloor {
        worker_type: String,
        region: String,
        zone: Option<String>,
        instance_type: String,
        price: f64,
        at: i64,
    },

    /// An AMI was referenced by a submitted bid
    AmiUsage {
        region: String,
        image_id: String,
        at: i64,
    },

    /// An in-flight bid left the tracker, either by appearing in a
    /// snapshot or by timing out
    BidVisibilityLag {
        worker_type: String,
        region: String,
        request_id: String,
        lag_ms: i64,
        timed_out: bool,
        at: i64,
    },
}

impl FleetEvent {
    /// Event kind as a stable snake_case label
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RequestSubmitted { .. } => "request_submitted",
            Self::RequestFulfilled { .. } => "request_fulfilled",
            Self::RequestDied { .. } => "request_died",
            Self::InstanceTerminated { .. } => "instance_terminated",
            Self::SpotPriceFloor { .. } => "spot_price_floor",
            Self::AmiUsage { .. } => "ami_usage",
            Self::BidVisibilityLag { .. } => "bid_visibility_lag",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_kind_labels() {
        let ev = FleetEvent::AmiUsage {
            region: "us-east-1".to_string(),
            image_id: "ami-1".to_string(),
            at: 0,
        };
        assert_eq!(ev.kind(), "ami_usage");

        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains("\"kind\":\"ami_usage\""));
    }
}
