//! Cloud adapter
//!
//! Thin, uniform wrapper over the per-region EC2 APIs. The reconciler
//! works through the [`CloudApi`] trait ONLY - never concrete SDK clients -
//! so tests drive it against an in-memory cloud.
//!
//! The SDK's record shapes differ subtly between the live and dead
//! queries; both are normalized into [`FleetInstance`] / [`SpotRequest`]
//! here at the boundary, never downstream. Items missing their identity
//! fields are skipped with a warning and the iteration continues.

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_ec2::primitives::Blob;
use aws_sdk_ec2::types::{
    Filter, IamInstanceProfileSpecification, InstanceStateName, InstanceType,
    RequestSpotLaunchSpecification, SpotInstanceState, SpotInstanceType, SpotPlacement, Tag,
};
use aws_sdk_ec2::Client;
use aws_types::region::Region;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use flotilla_core::LaunchSpec;

use crate::error::{ProvisionerError, Result};
use crate::snapshot::{FleetInstance, InstanceState, RequestState, SpotRequest, StateReason};

/// Which slice of the instance population to describe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceLiveness {
    /// Instances in states pending or running
    Live,
    /// Instances in states shutting-down, stopping, or terminated
    Dead,
}

impl InstanceLiveness {
    fn state_names(&self) -> &'static [&'static str] {
        match self {
            Self::Live => &["pending", "running"],
            Self::Dead => &["shutting-down", "stopping", "terminated"],
        }
    }
}

/// Which slice of the spot-request population to describe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestPhase {
    /// Requests still open
    Open,
    /// Requests that have left the open state
    Resolved,
}

impl RequestPhase {
    fn state_names(&self) -> &'static [&'static str] {
        match self {
            Self::Open => &["open"],
            Self::Resolved => &["active", "cancelled", "failed", "closed"],
        }
    }
}

/// A fully-specified spot bid ready for submission
#[derive(Debug, Clone)]
pub struct SpotBid {
    /// Worker type the bid provisions for
    pub worker_type: String,
    /// Region to bid in
    pub region: String,
    /// Availability zone to target, when one was selected
    pub zone: Option<String>,
    /// Instance type to bid on
    pub instance_type: String,
    /// Key-pair name carried by the launched instance
    pub key_name: String,
    /// Bid price, USD per hour
    pub bid_price: f64,
    /// Resolved launch specification
    pub launch_spec: LaunchSpec,
}

/// Uniform, region-parameterized cloud API surface
#[async_trait]
pub trait CloudApi: Send + Sync {
    /// Describe one slice of the instance population in a region
    async fn describe_instances(
        &self,
        region: &str,
        liveness: InstanceLiveness,
    ) -> Result<Vec<FleetInstance>>;

    /// Describe one slice of the spot-request population in a region
    async fn describe_spot_requests(
        &self,
        region: &str,
        phase: RequestPhase,
    ) -> Result<Vec<SpotRequest>>;

    /// Submit a one-time spot bid for a single instance; returns the
    /// request ID the cloud assigned
    async fn request_spot(&self, region: &str, bid: &SpotBid) -> Result<String>;

    /// Terminate instances, batched per region
    async fn terminate_instances(&self, region: &str, instance_ids: &[String]) -> Result<()>;

    /// Cancel spot requests, batched per region
    async fn cancel_spot_requests(&self, region: &str, request_ids: &[String]) -> Result<()>;

    /// Import a public key under the given key-pair name
    async fn import_key_pair(&self, region: &str, key_name: &str, public_key_body: &str)
        -> Result<()>;

    /// Which of the given key-pair names exist in the region
    async fn describe_key_pairs(&self, region: &str, key_names: &[String]) -> Result<Vec<String>>;

    /// Delete a key pair by name
    async fn delete_key_pair(&self, region: &str, key_name: &str) -> Result<()>;

    /// Apply tags to the given resources
    async fn create_tags(
        &self,
        region: &str,
        resource_ids: &[String],
        tags: &[(String, String)],
    ) -> Result<()>;
}

/// [`CloudApi`] implementation over the AWS EC2 SDK
pub struct Ec2Adapter {
    clients: HashMap<String, Client>,
    api_timeout: Duration,
}

impl Ec2Adapter {
    /// Build one EC2 client per allowed region
    pub async fn new(regions: &[String], api_timeout: Duration) -> Self {
        let mut clients = HashMap::new();
        for region in regions {
            debug!("Creating EC2 client for region: {}", region);
            let config = aws_config::defaults(BehaviorVersion::latest())
                .region(Region::new(region.clone()))
                .load()
                .await;
            clients.insert(region.clone(), Client::new(&config));
        }
        Self {
            clients,
            api_timeout,
        }
    }

    fn client(&self, region: &str) -> Result<&Client> {
        self.clients
            .get(region)
            .ok_or_else(|| ProvisionerError::config(format!("no client for region {region}")))
    }

    /// Apply the per-call deadline to one SDK call
    async fn bounded<T>(&self, call: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.api_timeout, call)
            .await
            .map_err(|_| ProvisionerError::ApiTimeout(self.api_timeout))?
    }
}

#[async_trait]
impl CloudApi for Ec2Adapter {
    async fn describe_instances(
        &self,
        region: &str,
        liveness: InstanceLiveness,
    ) -> Result<Vec<FleetInstance>> {
        let client = self.client(region)?;
        let mut state_filter = Filter::builder().name("instance-state-name");
        for state in liveness.state_names() {
            state_filter = state_filter.values(*state);
        }

        let response = self
            .bounded(async {
                client
                    .describe_instances()
                    .filters(state_filter.build())
                    .send()
                    .await
                    .map_err(ProvisionerError::from_sdk)
            })
            .await?;

        let mut instances = Vec::new();
        for reservation in response.reservations() {
            for instance in reservation.instances() {
                match instance_from_aws(region, instance) {
                    Some(normalized) => instances.push(normalized),
                    None => warn!(region, "skipping malformed instance record"),
                }
            }
        }
        Ok(instances)
    }

    async fn describe_spot_requests(
        &self,
        region: &str,
        phase: RequestPhase,
    ) -> Result<Vec<SpotRequest>> {
        let client = self.client(region)?;
        let mut state_filter = Filter::builder().name("state");
        for state in phase.state_names() {
            state_filter = state_filter.values(*state);
        }

        let response = self
            .bounded(async {
                client
                    .describe_spot_instance_requests()
                    .filters(state_filter.build())
                    .send()
                    .await
                    .map_err(ProvisionerError::from_sdk)
            })
            .await?;

        let mut requests = Vec::new();
        for sir in response.spot_instance_requests() {
            match request_from_aws(region, sir) {
                Some(normalized) => requests.push(normalized),
                None => warn!(region, "skipping malformed spot request record"),
            }
        }
        Ok(requests)
    }

    async fn request_spot(&self, region: &str, bid: &SpotBid) -> Result<String> {
        let client = self.client(region)?;
        let spec = &bid.launch_spec;

        let mut launch = RequestSpotLaunchSpecification::builder()
            .image_id(&spec.image_id)
            .instance_type(InstanceType::from(bid.instance_type.as_str()))
            .key_name(&bid.key_name);
        if !spec.security_group_ids.is_empty() {
            launch = launch.set_security_group_ids(Some(spec.security_group_ids.clone()));
        }
        launch = launch
            .set_subnet_id(spec.subnet_id.clone())
            .set_user_data(spec.user_data.clone());
        if let Some(profile) = &spec.iam_profile {
            launch = launch.iam_instance_profile(
                IamInstanceProfileSpecification::builder().name(profile).build(),
            );
        }
        if let Some(zone) = &bid.zone {
            launch = launch.placement(SpotPlacement::builder().availability_zone(zone).build());
        }

        let response = self
            .bounded(async {
                client
                    .request_spot_instances()
                    .spot_price(format!("{:.6}", bid.bid_price))
                    .instance_count(1)
                    .r#type(SpotInstanceType::OneTime)
                    .launch_specification(launch.build())
                    .send()
                    .await
                    .map_err(ProvisionerError::from_sdk)
            })
            .await?;

        response
            .spot_instance_requests()
            .first()
            .and_then(|r| r.spot_instance_request_id())
            .map(str::to_string)
            .ok_or_else(|| ProvisionerError::cloud("no request ID in spot response"))
    }

    async fn terminate_instances(&self, region: &str, instance_ids: &[String]) -> Result<()> {
        if instance_ids.is_empty() {
            return Ok(());
        }
        let client = self.client(region)?;
        self.bounded(async {
            client
                .terminate_instances()
                .set_instance_ids(Some(instance_ids.to_vec()))
                .send()
                .await
                .map_err(ProvisionerError::from_sdk)
        })
        .await?;
        Ok(())
    }

    async fn cancel_spot_requests(&self, region: &str, request_ids: &[String]) -> Result<()> {
        if request_ids.is_empty() {
            return Ok(());
        }
        let client = self.client(region)?;
        self.bounded(async {
            client
                .cancel_spot_instance_requests()
                .set_spot_instance_request_ids(Some(request_ids.to_vec()))
                .send()
                .await
                .map_err(ProvisionerError::from_sdk)
        })
        .await?;
        Ok(())
    }

    async fn import_key_pair(
        &self,
        region: &str,
        key_name: &str,
        public_key_body: &str,
    ) -> Result<()> {
        let client = self.client(region)?;
        self.bounded(async {
            client
                .import_key_pair()
                .key_name(key_name)
                .public_key_material(Blob::new(public_key_body.as_bytes()))
                .send()
                .await
                .map_err(ProvisionerError::from_sdk)
        })
        .await?;
        Ok(())
    }

    async fn describe_key_pairs(&self, region: &str, key_names: &[String]) -> Result<Vec<String>> {
        if key_names.is_empty() {
            return Ok(Vec::new());
        }
        let client = self.client(region)?;
        let filter = Filter::builder()
            .name("key-name")
            .set_values(Some(key_names.to_vec()))
            .build();

        let response = self
            .bounded(async {
                client
                    .describe_key_pairs()
                    .filters(filter)
                    .send()
                    .await
                    .map_err(ProvisionerError::from_sdk)
            })
            .await?;

        Ok(response
            .key_pairs()
            .iter()
            .filter_map(|k| k.key_name().map(str::to_string))
            .collect())
    }

    async fn delete_key_pair(&self, region: &str, key_name: &str) -> Result<()> {
        let client = self.client(region)?;
        self.bounded(async {
            client
                .delete_key_pair()
                .key_name(key_name)
                .send()
                .await
                .map_err(ProvisionerError::from_sdk)
        })
        .await?;
        Ok(())
    }

    async fn create_tags(
        &self,
        region: &str,
        resource_ids: &[String],
        tags: &[(String, String)],
    ) -> Result<()> {
        if resource_ids.is_empty() || tags.is_empty() {
            return Ok(());
        }
        let client = self.client(region)?;
        let tags: Vec<Tag> = tags
            .iter()
            .map(|(k, v)| Tag::builder().key(k).value(v).build())
            .collect();

        self.bounded(async {
            client
                .create_tags()
                .set_resources(Some(resource_ids.to_vec()))
                .set_tags(Some(tags))
                .send()
                .await
                .map_err(ProvisionerError::from_sdk)
        })
        .await?;
        Ok(())
    }
}

/// Convert an AWS timestamp to chrono
fn datetime_from_aws(dt: &aws_sdk_ec2::primitives::DateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(dt.secs(), dt.subsec_nanos())
}

fn tags_from_aws(tags: &[Tag]) -> HashMap<String, String> {
    tags.iter()
        .filter_map(|t| Some((t.key()?.to_string(), t.value()?.to_string())))
        .collect()
}

/// Normalize one SDK instance record; `None` when identity fields are
/// missing
fn instance_from_aws(
    region: &str,
    instance: &aws_sdk_ec2::types::Instance,
) -> Option<FleetInstance> {
    let instance_id = instance.instance_id()?.to_string();
    let state = match instance.state().and_then(|s| s.name())? {
        InstanceStateName::Pending => InstanceState::Pending,
        InstanceStateName::Running => InstanceState::Running,
        InstanceStateName::ShuttingDown => InstanceState::ShuttingDown,
        InstanceStateName::Stopping => InstanceState::Stopping,
        InstanceStateName::Terminated => InstanceState::Terminated,
        _ => return None,
    };

    Some(FleetInstance {
        instance_id,
        region: region.to_string(),
        zone: instance
            .placement()
            .and_then(|p| p.availability_zone())
            .map(str::to_string),
        worker_type: String::new(),
        instance_type: instance
            .instance_type()
            .map(|t| t.as_str().to_string())
            .unwrap_or_else(|| "unknown".to_string()),
        image_id: instance.image_id().map(str::to_string),
        launch_time: instance.launch_time().and_then(datetime_from_aws),
        state,
        spot_request_id: instance.spot_instance_request_id().map(str::to_string),
        state_reason: instance.state_reason().and_then(|r| {
            Some(StateReason {
                code: r.code()?.to_string(),
                message: r.message().unwrap_or("").to_string(),
            })
        }),
        key_name: instance.key_name().map(str::to_string),
        tags: tags_from_aws(instance.tags()),
    })
}

/// Normalize one SDK spot request record; the live and resolved queries
/// return the same wire type but populate different subsets of it
fn request_from_aws(
    region: &str,
    sir: &aws_sdk_ec2::types::SpotInstanceRequest,
) -> Option<SpotRequest> {
    let request_id = sir.spot_instance_request_id()?.to_string();
    let state = match sir.state()? {
        SpotInstanceState::Open => RequestState::Open,
        SpotInstanceState::Active => RequestState::Active,
        SpotInstanceState::Cancelled => RequestState::Cancelled,
        SpotInstanceState::Failed => RequestState::Failed,
        SpotInstanceState::Closed => RequestState::Closed,
        _ => return None,
    };
    let launch = sir.launch_specification();

    Some(SpotRequest {
        request_id,
        region: region.to_string(),
        zone: sir.launched_availability_zone().map(str::to_string),
        worker_type: String::new(),
        instance_type: launch
            .and_then(|l| l.instance_type())
            .map(|t| t.as_str().to_string())
            .unwrap_or_else(|| "unknown".to_string()),
        image_id: launch.and_then(|l| l.image_id()).map(str::to_string),
        create_time: sir.create_time().and_then(datetime_from_aws),
        state,
        status_code: sir
            .status()
            .and_then(|s| s.code())
            .unwrap_or("")
            .to_string(),
        status_message: sir
            .status()
            .and_then(|s| s.message())
            .unwrap_or("")
            .to_string(),
        status_update_time: sir
            .status()
            .and_then(|s| s.update_time())
            .and_then(datetime_from_aws),
        bid_price: sir
            .spot_price()
            .and_then(|p| p.parse().ok())
            .unwrap_or(0.0),
        instance_id: sir.instance_id().map(str::to_string),
        key_name: launch.and_then(|l| l.key_name()).map(str::to_string),
        tags: tags_from_aws(sir.tags()),
    })
}
