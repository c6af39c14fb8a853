//! In-process event channel for lifecycle state changes.
//!
//! Delivery is at-least-once from the subscriber's point of view; handlers must
//! be idempotent. Provisioning failures are always logged on publish.

use crate::compute::TransformJobState;
use crate::lifecycle::{WorkflowFailure, WorkflowPhase};
use crate::model_registry::{ApprovalStatus, PackageRef};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointOperation { Create, Update, CreateMultiModel }

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleEvent {
    PackageStateChanged { package: PackageRef, status: ApprovalStatus },
    EndpointSubmitted { endpoint: String, operation: EndpointOperation, packages: Vec<PackageRef> },
    ProvisioningFailed { resource: String, correlation: String, reason: String },
    TransformJobStateChanged { execution: String, job: String, state: TransformJobState },
    WorkflowFinished { execution: String, phase: WorkflowPhase, failure: Option<WorkflowFailure> },
}

impl LifecycleEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            LifecycleEvent::PackageStateChanged { .. } => "package_state_changed",
            LifecycleEvent::EndpointSubmitted { .. } => "endpoint_submitted",
            LifecycleEvent::ProvisioningFailed { .. } => "provisioning_failed",
            LifecycleEvent::TransformJobStateChanged { .. } => "transform_job_state_changed",
            LifecycleEvent::WorkflowFinished { .. } => "workflow_finished",
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<LifecycleEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: LifecycleEvent) {
        match &event {
            LifecycleEvent::ProvisioningFailed { resource, correlation, reason } => {
                error!(%resource, %correlation, %reason, "provisioning_failed");
            }
            LifecycleEvent::WorkflowFinished { execution, failure: Some(f), .. } => {
                warn!(%execution, step = ?f.step, reason = %f.reason, "workflow_failed");
            }
            other => debug!(kind = other.kind(), "lifecycle_event"),
        }
        // sending with no subscribers is not an error
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> { self.tx.subscribe() }
}

impl Default for EventBus {
    fn default() -> Self { Self::new(1024) }
}
