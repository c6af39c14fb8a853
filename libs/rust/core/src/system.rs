//! Wiring of the lifecycle components over in-memory collaborators.
//!
//! Endpoint submissions go through `ResilientCompute`. Batch transform
//! submissions and polls do not.

use crate::batch::{BatchInferenceWorkflow, OutputCollector};
use crate::compute::{ComputeClient, InMemoryCompute};
use crate::config::LifecycleConfig;
use crate::endpoint::EndpointController;
use crate::error::LifecycleResult;
use crate::events::EventBus;
use crate::model_registry::{ModelRegistration, ModelRegistry};
use crate::provisioner::ScopedProvisioner;
use crate::resilience::ResilientCompute;
use crate::storage::{InMemoryObjectStore, ObjectStore};
use std::sync::Arc;
use tokio::task::JoinHandle;

pub struct LifecycleSystem {
    pub cfg: Arc<LifecycleConfig>,
    pub events: EventBus,
    pub store: Arc<InMemoryObjectStore>,
    pub compute: Arc<InMemoryCompute>,
    pub provisioner: Arc<ScopedProvisioner>,
    pub registry: Arc<ModelRegistry>,
    pub registration: ModelRegistration,
    pub endpoints: Arc<EndpointController>,
    pub batch: Arc<BatchInferenceWorkflow>,
}

impl LifecycleSystem {
    pub fn in_memory(cfg: LifecycleConfig) -> LifecycleResult<Self> {
        cfg.validate()?;
        let cfg = Arc::new(cfg);
        let events = EventBus::default();
        let store = Arc::new(InMemoryObjectStore::new());
        let store_dyn: Arc<dyn ObjectStore> = store.clone();
        let compute = Arc::new(InMemoryCompute::new(store_dyn.clone(), events.clone()));
        let guarded: Arc<dyn ComputeClient> = Arc::new(ResilientCompute::new(compute.clone(), &cfg.compute));
        let provisioner = Arc::new(ScopedProvisioner::new(cfg.region.clone()));
        let registry = Arc::new(ModelRegistry::new(cfg.clone(), events.clone()));
        let registration = ModelRegistration::new(cfg.clone(), registry.clone());
        let endpoints = Arc::new(EndpointController::new(cfg.clone(), registry.clone(), provisioner.clone(), guarded, store_dyn.clone(), events.clone()));
        // batch steps are never retried
        let batch = Arc::new(BatchInferenceWorkflow::new(cfg.clone(), compute.clone(), provisioner.clone(), Arc::new(OutputCollector::new(store_dyn)), events.clone()));
        Ok(Self { cfg, events, store, compute, provisioner, registry, registration, endpoints, batch })
    }

    /// Approval-driven endpoint convergence on this system's bus.
    pub fn spawn_convergence(&self) -> JoinHandle<()> { self.endpoints.spawn_convergence(&self.events) }
}
