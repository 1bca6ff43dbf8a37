//! Per-kind adapters backed by the gateway client.
//!
//! Every kind shares the same REST shape; what differs is which attributes
//! can change in place, which outputs it exposes, and whether provisioning
//! is asynchronous.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::ProviderError;
use crate::model::{ResolvedAttributes, ResourceKind};

use super::adapter::{
    diff_attributes, AttributeChange, CreateOutcome, Outputs, ProviderAdapter, ProviderResult,
};
use super::client::{GatewayClient, RemoteResource};

/// Status reported once a resource is usable.
const READY_STATUS: &str = "available";

/// Status reported when provisioning failed for good.
const FAILED_STATUS: &str = "failed";

/// Default interval between readiness polls.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Default readiness timeout.
const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(900);

/// Static description of one resource kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KindProfile {
    /// Kind described.
    pub kind: ResourceKind,
    /// Attributes changeable in place.
    pub updatable: &'static [&'static str],
    /// Outputs other resources may reference.
    pub outputs: &'static [&'static str],
    /// Provisioning completes asynchronously; poll until ready.
    pub await_ready: bool,
}

impl KindProfile {
    /// Virtual network with public and private subnets.
    pub const NETWORK: Self = Self {
        kind: ResourceKind::Network,
        updatable: &["tags"],
        outputs: &["id", "cidr", "private_subnets", "public_subnets"],
        await_ready: false,
    };

    /// Container cluster.
    pub const CLUSTER: Self = Self {
        kind: ResourceKind::Cluster,
        updatable: &["tags", "container_insights"],
        outputs: &["id", "arn", "name"],
        await_ready: true,
    };

    /// Managed secret. Only the container is managed, never its value.
    pub const SECRET: Self = Self {
        kind: ResourceKind::Secret,
        updatable: &["description", "tags", "rotation_days"],
        outputs: &["id", "arn", "name"],
        await_ready: false,
    };

    /// Managed relational database.
    pub const DATABASE: Self = Self {
        kind: ResourceKind::Database,
        updatable: &[
            "instance_class",
            "allocated_storage_gb",
            "backup_retention_days",
            "deletion_protection",
            "multi_az",
            "tags",
        ],
        outputs: &["id", "arn", "endpoint", "port"],
        await_ready: true,
    };

    /// Container task definition. Revisions are immutable.
    pub const TASK_DEFINITION: Self = Self {
        kind: ResourceKind::ContainerTaskDefinition,
        updatable: &["tags"],
        outputs: &["id", "arn", "revision"],
        await_ready: false,
    };

    /// Long-running container service.
    pub const CONTAINER_SERVICE: Self = Self {
        kind: ResourceKind::ContainerService,
        updatable: &[
            "desired_count",
            "task_definition",
            "health_check_grace_secs",
            "tags",
        ],
        outputs: &["id", "arn", "name", "url"],
        await_ready: true,
    };

    /// Serverless function.
    pub const FUNCTION: Self = Self {
        kind: ResourceKind::Function,
        updatable: &[
            "code",
            "handler",
            "runtime",
            "memory_mib",
            "timeout_secs",
            "environment",
            "tags",
        ],
        outputs: &["id", "arn", "name"],
        await_ready: false,
    };

    /// Cron trigger pointing at a function.
    pub const SCHEDULE_RULE: Self = Self {
        kind: ResourceKind::ScheduleRule,
        updatable: &["schedule", "target", "enabled", "tags"],
        outputs: &["id", "arn"],
        await_ready: false,
    };

    /// Returns the profile of a kind.
    #[must_use]
    pub const fn of(kind: ResourceKind) -> Self {
        match kind {
            ResourceKind::Network => Self::NETWORK,
            ResourceKind::Cluster => Self::CLUSTER,
            ResourceKind::Secret => Self::SECRET,
            ResourceKind::Database => Self::DATABASE,
            ResourceKind::ContainerTaskDefinition => Self::TASK_DEFINITION,
            ResourceKind::ContainerService => Self::CONTAINER_SERVICE,
            ResourceKind::Function => Self::FUNCTION,
            ResourceKind::ScheduleRule => Self::SCHEDULE_RULE,
        }
    }
}

/// Adapter for one kind, bound to the gateway.
#[derive(Debug, Clone)]
pub struct KindAdapter {
    /// Kind description.
    profile: KindProfile,
    /// Shared gateway client.
    client: Arc<GatewayClient>,
    /// Interval between readiness polls.
    poll_interval: Duration,
    /// Readiness timeout.
    ready_timeout: Duration,
}

impl KindAdapter {
    /// Creates an adapter for a kind.
    #[must_use]
    pub const fn new(profile: KindProfile, client: Arc<GatewayClient>) -> Self {
        Self {
            profile,
            client,
            poll_interval: DEFAULT_POLL_INTERVAL,
            ready_timeout: DEFAULT_READY_TIMEOUT,
        }
    }

    /// Sets readiness polling parameters.
    #[must_use]
    pub const fn with_readiness(mut self, poll_interval: Duration, ready_timeout: Duration) -> Self {
        self.poll_interval = poll_interval;
        self.ready_timeout = ready_timeout;
        self
    }

    /// Returns the kind profile.
    #[must_use]
    pub const fn profile(&self) -> &KindProfile {
        &self.profile
    }

    /// Rejects attributes the provider would refuse anyway.
    fn check_request(&self, attributes: &ResolvedAttributes) -> ProviderResult<()> {
        if self.profile.kind == ResourceKind::ScheduleRule {
            for name in ["schedule", "target"] {
                if !attributes.get(name).is_some_and(Value::is_string) {
                    return Err(ProviderError::InvalidRequest {
                        message: format!("schedule rule needs a string '{name}'"),
                    });
                }
            }
        }
        Ok(())
    }

    /// Polls until the resource reports ready.
    ///
    /// The resource exists once this is called, so every error returned
    /// carries its physical id. Transient read failures keep polling until
    /// the readiness timeout.
    async fn wait_ready(&self, mut resource: RemoteResource) -> ProviderResult<RemoteResource> {
        if !self.profile.await_ready {
            return Ok(resource);
        }

        let deadline = Instant::now() + self.ready_timeout;
        let mut delay = self.poll_interval;
        loop {
            match resource.status.as_deref() {
                None | Some(READY_STATUS) => return Ok(resource),
                Some(FAILED_STATUS) => {
                    return Err(ProviderError::ProvisioningFailed {
                        physical_id: resource.id,
                        message: format!("{} reported status {FAILED_STATUS}", self.profile.kind),
                    });
                }
                Some(status) => {
                    debug!("{} {} is {status}, waiting", self.profile.kind, resource.id);
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(ProviderError::Timeout {
                    physical_id: resource.id,
                    expected_state: String::from(READY_STATUS),
                });
            }

            tokio::time::sleep(delay.min(deadline - now)).await;
            delay = self.poll_interval;

            resource = match self.client.get(self.profile.kind, &resource.id).await {
                Ok(r) => r,
                // freshly created resources can lag behind in reads
                Err(ProviderError::NotFound { .. } | ProviderError::NotYetVisible { .. }) => {
                    resource
                }
                Err(e) if e.is_transient() => {
                    warn!("Readiness check of {} {} failed: {e}", self.profile.kind, resource.id);
                    if let Some(after) = e.retry_after() {
                        delay = delay.max(after);
                    }
                    resource
                }
                Err(e) => {
                    return Err(ProviderError::ProvisioningFailed {
                        physical_id: resource.id,
                        message: format!("readiness check failed: {e}"),
                    });
                }
            };
        }
    }

    /// Keeps only the outputs the kind declares.
    fn outputs_of(&self, resource: &RemoteResource) -> Outputs {
        let mut outputs: Outputs = resource
            .outputs
            .iter()
            .filter(|(name, _)| self.profile.outputs.contains(&name.as_str()))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        outputs
            .entry(String::from("id"))
            .or_insert_with(|| Value::from(resource.id.clone()));
        outputs
    }
}

#[async_trait]
impl ProviderAdapter for KindAdapter {
    fn kind(&self) -> ResourceKind {
        self.profile.kind
    }

    fn updatable_attributes(&self) -> Vec<String> {
        self.profile.updatable.iter().map(ToString::to_string).collect()
    }

    fn output_attributes(&self) -> Vec<String> {
        self.profile.outputs.iter().map(ToString::to_string).collect()
    }

    async fn create(&self, attributes: &ResolvedAttributes) -> ProviderResult<CreateOutcome> {
        self.check_request(attributes)?;

        let created = self.client.create(self.profile.kind, attributes).await?;
        info!("Created {} {}", self.profile.kind, created.id);

        let ready = self.wait_ready(created).await?;
        Ok(CreateOutcome {
            outputs: self.outputs_of(&ready),
            physical_id: ready.id,
        })
    }

    async fn read(&self, physical_id: &str) -> ProviderResult<ResolvedAttributes> {
        Ok(self.client.get(self.profile.kind, physical_id).await?.attributes)
    }

    async fn update(&self, physical_id: &str, delta: &ResolvedAttributes) -> ProviderResult<Outputs> {
        let unsupported: Vec<String> = delta
            .keys()
            .filter(|name| !self.profile.updatable.contains(&name.as_str()))
            .cloned()
            .collect();
        if !unsupported.is_empty() {
            return Err(ProviderError::Unsupported {
                attributes: unsupported,
            });
        }

        let updated = self.client.patch(self.profile.kind, physical_id, delta).await?;
        info!("Updated {} {}", self.profile.kind, physical_id);

        let ready = self.wait_ready(updated).await?;
        Ok(self.outputs_of(&ready))
    }

    async fn delete(&self, physical_id: &str) -> ProviderResult<()> {
        self.client.delete(self.profile.kind, physical_id).await?;
        info!("Deleted {} {}", self.profile.kind, physical_id);
        Ok(())
    }

    async fn compute_drift(
        &self,
        physical_id: &str,
        recorded: &ResolvedAttributes,
    ) -> ProviderResult<Vec<AttributeChange>> {
        let live = self.read(physical_id).await?;
        Ok(diff_attributes(recorded, &live))
    }
}
