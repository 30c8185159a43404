//! Shared record constructors for unit tests

use chrono::Utc;
use std::collections::HashMap;

use crate::snapshot::{FleetInstance, InstanceState, RequestState, SpotRequest};

/// Raw (unclassified) instance record as the adapter would return it
pub fn instance(id: &str, region: &str, key_name: &str) -> FleetInstance {
    FleetInstance {
        instance_id: id.to_string(),
        region: region.to_string(),
        zone: Some(format!("{region}a")),
        worker_type: String::new(),
        instance_type: "c5.large".to_string(),
        image_id: Some("ami-1".to_string()),
        launch_time: Some(Utc::now()),
        state: InstanceState::Running,
        spot_request_id: None,
        state_reason: None,
        key_name: Some(key_name.to_string()),
        tags: HashMap::new(),
    }
}

/// Raw (unclassified) open spot request as the adapter would return it
pub fn request(id: &str, region: &str, key_name: &str) -> SpotRequest {
    SpotRequest {
        request_id: id.to_string(),
        region: region.to_string(),
        zone: Some(format!("{region}a")),
        worker_type: String::new(),
        instance_type: "c5.large".to_string(),
        image_id: Some("ami-1".to_string()),
        create_time: Some(Utc::now()),
        state: RequestState::Open,
        status_code: "pending-evaluation".to_string(),
        status_message: String::new(),
        status_update_time: Some(Utc::now()),
        bid_price: 0.1,
        instance_id: None,
        key_name: Some(key_name.to_string()),
        tags: HashMap::new(),
    }
}

/// Classified live instance belonging to a worker type
pub fn live_instance(
    id: &str,
    region: &str,
    worker_type: &str,
    instance_type: &str,
) -> FleetInstance {
    FleetInstance {
        worker_type: worker_type.to_string(),
        instance_type: instance_type.to_string(),
        ..instance(id, region, "unused")
    }
}

/// Classified open request belonging to a worker type
pub fn open_request(id: &str, region: &str, worker_type: &str, instance_type: &str) -> SpotRequest {
    SpotRequest {
        worker_type: worker_type.to_string(),
        instance_type: instance_type.to_string(),
        ..request(id, region, "unused")
    }
}
