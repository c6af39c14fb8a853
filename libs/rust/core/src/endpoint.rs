//! Endpoint Controller: materialises and converges serving endpoints from approved packages.
//!
//! Every submission to the compute layer is fire-and-forget; provisioning
//! outcomes come back as `ProvisioningFailed` events. Operations on one endpoint
//! are serialised through its slot mutex and updates are ordered by package
//! version through [`decide_update`], so an older approval never replaces a newer
//! binding whatever order the events arrive in.

use crate::compute::{ComputeClient, ContainerMode, EndpointConfigSpec, InvocationRequest, ModelDefinition, ProductionVariant};
use crate::config::LifecycleConfig;
use crate::error::{LifecycleError, LifecycleResult, ResourceKind};
use crate::events::{EndpointOperation, EventBus, LifecycleEvent};
use crate::metrics::LIFECYCLE_METRICS;
use crate::model_registry::{serving_environment, ApprovalStatus, ContainerDefinition, ModelPackage, ModelRegistry, PackageRef};
use crate::provisioner::{ExecutionEnvironmentProvisioner, ExecutionIdentity, IdentityRequest, StorageScope};
use crate::storage::{ObjectLocation, ObjectStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

pub const VARIANT_NAME: &str = "AllTraffic";
const INVOCATION_CONTENT_TYPE: &str = "application/json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSpec {
    pub instance_type: String,
    pub instance_count: u32,
}

impl InstanceSpec {
    pub fn new(instance_type: impl Into<String>, instance_count: u32) -> Self { Self { instance_type: instance_type.into(), instance_count } }

    fn validate(&self) -> LifecycleResult<()> {
        if self.instance_type.trim().is_empty() { return Err(LifecycleError::InvalidRequest("instance type must be set".into())); }
        if self.instance_count == 0 { return Err(LifecycleError::InvalidRequest("instance count must be positive".into())); }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointRef {
    pub name: String,
}

impl EndpointRef {
    pub fn new(name: impl Into<String>) -> Self { Self { name: name.into() } }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndpointKind { SingleModel, MultiModel }

/// One package served by an endpoint. `target` is the artifact name callers pass
/// to select a model on a multi-model endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointBinding {
    pub package: PackageRef,
    pub model_name: String,
    pub target: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServingEndpoint {
    pub name: String,
    pub group: String,
    pub kind: EndpointKind,
    pub instance: InstanceSpec,
    pub config_name: String,
    pub bindings: Vec<EndpointBinding>,
    pub identity: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub updates: u32,
}

impl ServingEndpoint {
    /// The package a single-model endpoint currently serves.
    pub fn bound_package(&self) -> Option<&PackageRef> {
        match self.kind {
            EndpointKind::SingleModel => self.bindings.first().map(|b| &b.package),
            EndpointKind::MultiModel => None,
        }
    }

    pub fn reference(&self) -> EndpointRef { EndpointRef::new(self.name.clone()) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateOutcome {
    Applied { from: u64, to: u64 },
    /// Same version re-delivered; nothing submitted.
    Duplicate { version: u64 },
    /// Incoming version is older than the bound one; nothing submitted.
    Stale { current: u64, incoming: u64 },
}

/// Version-ordered update decision, independent of event arrival order.
pub fn decide_update(current: u64, incoming: u64) -> UpdateOutcome {
    match incoming.cmp(&current) {
        Ordering::Greater => UpdateOutcome::Applied { from: current, to: incoming },
        Ordering::Equal => UpdateOutcome::Duplicate { version: current },
        Ordering::Less => UpdateOutcome::Stale { current, incoming },
    }
}

pub fn endpoint_name(group: &str) -> String { format!("{group}-ep") }

pub fn multi_model_endpoint_name(group: &str) -> String { format!("{group}-mme-ep") }

fn timestamp(now: DateTime<Utc>) -> String { now.format("%Y-%m-%d-%H-%M-%S").to_string() }

fn model_name(package: &PackageRef, now: DateTime<Utc>) -> String { format!("{}-v{}-{}", package.group, package.version, timestamp(now)) }

fn endpoint_config_name(package: &PackageRef, now: DateTime<Utc>) -> String { format!("{}-epc-v{}-{}", package.group, package.version, timestamp(now)) }

fn staged_artifact_name(package: &PackageRef) -> String { format!("{}-v{}.tar.gz", package.group, package.version) }

fn check_realtime_support(pkg: &ModelPackage, instance: &InstanceSpec) -> LifecycleResult<()> {
    let supported = &pkg.supported.realtime_instance_types;
    if !supported.is_empty() && !supported.contains(&instance.instance_type) {
        return Err(LifecycleError::InvalidRequest(format!("{} does not support realtime instance type {}", pkg.reference, instance.instance_type)));
    }
    Ok(())
}

struct EndpointSlot {
    group: String,
    kind: EndpointKind,
    state: AsyncMutex<Option<ServingEndpoint>>,
}

pub struct EndpointController {
    cfg: Arc<LifecycleConfig>,
    registry: Arc<ModelRegistry>,
    provisioner: Arc<dyn ExecutionEnvironmentProvisioner>,
    compute: Arc<dyn ComputeClient>,
    store: Arc<dyn ObjectStore>,
    events: EventBus,
    slots: parking_lot::Mutex<HashMap<String, Arc<EndpointSlot>>>,
}

impl EndpointController {
    pub fn new(
        cfg: Arc<LifecycleConfig>,
        registry: Arc<ModelRegistry>,
        provisioner: Arc<dyn ExecutionEnvironmentProvisioner>,
        compute: Arc<dyn ComputeClient>,
        store: Arc<dyn ObjectStore>,
        events: EventBus,
    ) -> Self {
        Self { cfg, registry, provisioner, compute, store, events, slots: parking_lot::Mutex::new(HashMap::new()) }
    }

    fn approved_package(&self, package: &PackageRef) -> LifecycleResult<ModelPackage> {
        let pkg = self.registry.package(package)?;
        if pkg.status != ApprovalStatus::Approved { return Err(LifecycleError::NotApproved(package.to_string())); }
        Ok(pkg)
    }

    fn slot_for(&self, name: &str, group: &str, kind: EndpointKind) -> Arc<EndpointSlot> {
        self.slots
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(EndpointSlot { group: group.to_string(), kind, state: AsyncMutex::new(None) }))
            .clone()
    }

    fn existing_slot(&self, name: &str) -> LifecycleResult<Arc<EndpointSlot>> {
        self.slots.lock().get(name).cloned().ok_or_else(|| LifecycleError::not_found(ResourceKind::Endpoint, name))
    }

    fn record_submission(&self, op: EndpointOperation, outcome: &str) {
        let op = match op { EndpointOperation::Create => "create", EndpointOperation::Update => "update", EndpointOperation::CreateMultiModel => "create_multi_model" };
        LIFECYCLE_METRICS.endpoint.submissions_total.with_label_values(&[op, outcome]).inc();
    }

    /// Identity, model and endpoint config for one single-model package.
    async fn submit_model(&self, endpoint: &str, pkg: &ModelPackage, instance: &InstanceSpec) -> LifecycleResult<(ExecutionIdentity, String, String)> {
        let identity = self
            .provisioner
            .provision(IdentityRequest::new(endpoint).read(StorageScope::object(&pkg.artifact)).read(StorageScope::object(&pkg.code)))
            .await?;
        let now = Utc::now();
        let model = ModelDefinition {
            name: model_name(&pkg.reference, now),
            identity: identity.clone(),
            container: pkg.container.clone(),
            mode: ContainerMode::SingleModel,
            packages: vec![pkg.reference.clone()],
        };
        self.compute.create_model(&model).await?;
        let config = EndpointConfigSpec {
            name: endpoint_config_name(&pkg.reference, now),
            variants: vec![ProductionVariant {
                variant_name: VARIANT_NAME.into(),
                model_name: model.name.clone(),
                instance_type: instance.instance_type.clone(),
                initial_instance_count: instance.instance_count,
                initial_weight: 1.0,
            }],
        };
        self.compute.create_endpoint_config(&config).await?;
        Ok((identity, model.name, config.name))
    }

    /// Create `<group>-ep` bound to an approved package. Fails with `NotApproved`
    /// before any identity is provisioned, and with `AlreadyExists` if the
    /// endpoint is already live.
    #[instrument(skip_all, fields(package = %package))]
    pub async fn create_endpoint(&self, package: &PackageRef, instance: &InstanceSpec) -> LifecycleResult<EndpointRef> {
        let pkg = self.approved_package(package)?;
        instance.validate()?;
        check_realtime_support(&pkg, instance)?;
        let name = endpoint_name(&package.group);
        let slot = self.slot_for(&name, &package.group, EndpointKind::SingleModel);
        let mut state = slot.state.lock().await;
        if state.is_some() { return Err(LifecycleError::already_exists(ResourceKind::Endpoint, &name)); }

        let submitted = async {
            let (identity, model, config) = self.submit_model(&name, &pkg, instance).await?;
            self.compute.create_endpoint(&name, &config).await?;
            Ok::<_, LifecycleError>((identity, model, config))
        }
        .await;
        let (identity, model, config) = match submitted {
            Ok(v) => v,
            Err(e) => {
                self.record_submission(EndpointOperation::Create, "error");
                return Err(e);
            }
        };

        let now = Utc::now();
        *state = Some(ServingEndpoint {
            name: name.clone(),
            group: package.group.clone(),
            kind: EndpointKind::SingleModel,
            instance: instance.clone(),
            config_name: config,
            bindings: vec![EndpointBinding { package: package.clone(), model_name: model, target: None }],
            identity: identity.id,
            created_at: now,
            updated_at: now,
            updates: 0,
        });
        drop(state);
        self.record_submission(EndpointOperation::Create, "ok");
        info!(endpoint = %name, version = package.version, "endpoint_create_submitted");
        self.events.publish(LifecycleEvent::EndpointSubmitted { endpoint: name.clone(), operation: EndpointOperation::Create, packages: vec![package.clone()] });
        Ok(EndpointRef::new(name))
    }

    /// Create the group's endpoint from its highest approved version.
    pub async fn create_endpoint_for_group(&self, group: &str, instance: &InstanceSpec) -> LifecycleResult<EndpointRef> {
        let latest = self.registry.latest_approved(group)?;
        self.create_endpoint(&latest.reference, instance).await
    }

    /// Re-point an existing single-model endpoint at a package of its family.
    /// Older or equal versions are no-ops reported through `UpdateOutcome`.
    #[instrument(skip_all, fields(endpoint = %endpoint.name, package = %package))]
    pub async fn update_endpoint(&self, endpoint: &EndpointRef, package: &PackageRef) -> LifecycleResult<UpdateOutcome> {
        let pkg = self.approved_package(package)?;
        let slot = self.existing_slot(&endpoint.name)?;
        if slot.kind != EndpointKind::SingleModel {
            return Err(LifecycleError::InvalidRequest(format!("{} is a multi-model endpoint and is not updated in place", endpoint.name)));
        }
        if slot.group != package.group {
            return Err(LifecycleError::InvalidRequest(format!("{} serves group {}, not {}", endpoint.name, slot.group, package.group)));
        }
        let mut state = slot.state.lock().await;
        let current = state.as_mut().ok_or_else(|| LifecycleError::not_found(ResourceKind::Endpoint, &endpoint.name))?;
        let bound = current.bound_package().map(|p| p.version).unwrap_or(0);

        let outcome = decide_update(bound, package.version);
        match outcome {
            UpdateOutcome::Duplicate { .. } => {
                debug!(version = bound, "endpoint_update_duplicate");
                self.record_submission(EndpointOperation::Update, "duplicate");
                return Ok(outcome);
            }
            UpdateOutcome::Stale { current: cur, incoming } => {
                LIFECYCLE_METRICS.endpoint.stale_updates_total.inc();
                self.record_submission(EndpointOperation::Update, "stale");
                info!(current = cur, incoming, "endpoint_update_stale");
                return Ok(outcome);
            }
            UpdateOutcome::Applied { .. } => {}
        }

        let instance = current.instance.clone();
        check_realtime_support(&pkg, &instance)?;
        let submitted = async {
            let (identity, model, config) = self.submit_model(&endpoint.name, &pkg, &instance).await?;
            self.compute.update_endpoint(&endpoint.name, &config).await?;
            Ok::<_, LifecycleError>((identity, model, config))
        }
        .await;
        let (identity, model, config) = match submitted {
            Ok(v) => v,
            Err(e) => {
                self.record_submission(EndpointOperation::Update, "error");
                warn!(error = %e, "endpoint_update_failed");
                return Err(e);
            }
        };
        current.config_name = config;
        current.bindings = vec![EndpointBinding { package: package.clone(), model_name: model, target: None }];
        current.identity = identity.id;
        current.updated_at = Utc::now();
        current.updates += 1;
        drop(state);

        self.record_submission(EndpointOperation::Update, "ok");
        info!(from = bound, to = package.version, "endpoint_update_submitted");
        self.events.publish(LifecycleEvent::EndpointSubmitted { endpoint: endpoint.name.clone(), operation: EndpointOperation::Update, packages: vec![package.clone()] });
        Ok(outcome)
    }

    /// Converge every single-model endpoint of the package's family. Safe to call
    /// repeatedly for the same approval.
    pub async fn on_package_approved(&self, package: &PackageRef) -> Vec<(EndpointRef, LifecycleResult<UpdateOutcome>)> {
        let targets: Vec<EndpointRef> = self
            .slots
            .lock()
            .iter()
            .filter(|(_, s)| s.kind == EndpointKind::SingleModel && s.group == package.group)
            .map(|(name, _)| EndpointRef::new(name.clone()))
            .collect();
        let mut results = Vec::with_capacity(targets.len());
        for ep in targets {
            let res = match self.update_endpoint(&ep, package).await {
                // a create that never succeeded leaves an empty slot behind
                Err(LifecycleError::NotFound { kind: ResourceKind::Endpoint, .. }) => continue,
                other => other,
            };
            if let Err(e) = &res { error!(endpoint = %ep.name, %package, error = %e, "endpoint_convergence_failed"); }
            results.push((ep, res));
        }
        results
    }

    /// Bring each family's endpoint to its latest approved version, e.g. after
    /// the subscriber lagged and dropped approval events.
    pub async fn resync(&self) {
        let groups: Vec<String> = self.slots.lock().values().filter(|s| s.kind == EndpointKind::SingleModel).map(|s| s.group.clone()).collect();
        for group in groups {
            if let Ok(latest) = self.registry.latest_approved(&group) { self.on_package_approved(&latest.reference).await; }
        }
    }

    /// Subscribe before returning so no approval published afterwards is missed.
    pub fn spawn_convergence(self: &Arc<Self>, bus: &EventBus) -> JoinHandle<()> {
        let mut rx = bus.subscribe();
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(LifecycleEvent::PackageStateChanged { package, status: ApprovalStatus::Approved }) => {
                        controller.on_package_approved(&package).await;
                    }
                    Ok(LifecycleEvent::ProvisioningFailed { resource, correlation, reason }) => {
                        error!(%resource, %correlation, %reason, "endpoint_provisioning_failed");
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "convergence_lagged_resyncing");
                        controller.resync().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("endpoint_convergence_stopped");
        })
    }

    /// Co-host several approved packages behind `<group>-mme-ep`, where group is
    /// that of the first package. Artifacts are staged under
    /// `multi-model/<endpoint>/` in the model bucket without overwriting.
    #[instrument(skip_all, fields(packages = packages.len()))]
    pub async fn create_multi_model_endpoint(&self, packages: &[PackageRef], instance: &InstanceSpec) -> LifecycleResult<EndpointRef> {
        let first = packages.first().ok_or_else(|| LifecycleError::InvalidRequest("multi-model endpoint needs at least one package".into()))?;
        let pkgs = packages.iter().map(|p| self.approved_package(p)).collect::<LifecycleResult<Vec<_>>>()?;
        instance.validate()?;
        let name = multi_model_endpoint_name(&first.group);
        let slot = self.slot_for(&name, &first.group, EndpointKind::MultiModel);
        let mut state = slot.state.lock().await;
        if state.is_some() { return Err(LifecycleError::already_exists(ResourceKind::Endpoint, &name)); }

        let staging = ObjectLocation::new(self.cfg.model_artifact_bucket.clone(), format!("multi-model/{name}/"));
        let mut request = IdentityRequest::new(name.as_str()).read_write(StorageScope::prefix(staging.bucket.clone(), staging.key.clone()));
        for pkg in &pkgs {
            request = request.read(StorageScope::object(&pkg.artifact)).read(StorageScope::object(&pkg.code));
        }

        let submitted = async {
            let identity = self.provisioner.provision(request).await?;
            let mut bindings = Vec::with_capacity(pkgs.len());
            for pkg in &pkgs {
                let target = staged_artifact_name(&pkg.reference);
                self.stage_artifact(&pkg.artifact, &staging.join(&target)).await?;
                bindings.push((pkg.reference.clone(), target));
            }
            let now = Utc::now();
            let model = ModelDefinition {
                name: format!("{}-mme-{}", first.group, timestamp(now)),
                identity: identity.clone(),
                container: ContainerDefinition {
                    image: self.cfg.inference_image.clone(),
                    model_data: staging.clone(),
                    environment: serving_environment(&self.cfg, &pkgs[0].code),
                },
                mode: ContainerMode::MultiModel,
                packages: packages.to_vec(),
            };
            self.compute.create_model(&model).await?;
            let config = EndpointConfigSpec {
                name: format!("{}-mme-epc-{}", first.group, timestamp(now)),
                variants: vec![ProductionVariant {
                    variant_name: VARIANT_NAME.into(),
                    model_name: model.name.clone(),
                    instance_type: instance.instance_type.clone(),
                    initial_instance_count: instance.instance_count,
                    initial_weight: 1.0,
                }],
            };
            self.compute.create_endpoint_config(&config).await?;
            self.compute.create_endpoint(&name, &config.name).await?;
            Ok::<_, LifecycleError>((identity, model.name, config.name, bindings))
        }
        .await;
        let (identity, model, config, staged) = match submitted {
            Ok(v) => v,
            Err(e) => {
                self.record_submission(EndpointOperation::CreateMultiModel, "error");
                return Err(e);
            }
        };

        let now = Utc::now();
        *state = Some(ServingEndpoint {
            name: name.clone(),
            group: first.group.clone(),
            kind: EndpointKind::MultiModel,
            instance: instance.clone(),
            config_name: config,
            bindings: staged.into_iter().map(|(package, target)| EndpointBinding { package, model_name: model.clone(), target: Some(target) }).collect(),
            identity: identity.id,
            created_at: now,
            updated_at: now,
            updates: 0,
        });
        drop(state);
        self.record_submission(EndpointOperation::CreateMultiModel, "ok");
        info!(endpoint = %name, staging = %staging, "multi_model_endpoint_submitted");
        self.events.publish(LifecycleEvent::EndpointSubmitted { endpoint: name.clone(), operation: EndpointOperation::CreateMultiModel, packages: packages.to_vec() });
        Ok(EndpointRef::new(name))
    }

    async fn stage_artifact(&self, source: &ObjectLocation, dest: &ObjectLocation) -> LifecycleResult<()> {
        if self.store.exists(dest).await? {
            debug!(%dest, "artifact_already_staged");
            return Ok(());
        }
        let body = self.store.get(source).await?;
        match self.store.put(dest, body).await {
            Ok(()) | Err(LifecycleError::AlreadyExists { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Pass-through invocation. `target_model` selects the artifact on a
    /// multi-model endpoint and must be absent for single-model ones.
    pub async fn invoke_endpoint(&self, endpoint: &EndpointRef, body: Vec<u8>, target_model: Option<&str>) -> LifecycleResult<Vec<u8>> {
        let snapshot = self.endpoint(&endpoint.name).await?;
        match (snapshot.kind, target_model) {
            (EndpointKind::SingleModel, Some(_)) => return Err(LifecycleError::InvalidRequest(format!("{} is single-model; target model not allowed", endpoint.name))),
            (EndpointKind::MultiModel, None) => return Err(LifecycleError::InvalidRequest(format!("{} is multi-model; target model required", endpoint.name))),
            (EndpointKind::MultiModel, Some(t)) if !snapshot.bindings.iter().any(|b| b.target.as_deref() == Some(t)) => {
                return Err(LifecycleError::not_found(ResourceKind::Model, t));
            }
            _ => {}
        }
        let request = InvocationRequest {
            endpoint: endpoint.name.clone(),
            body,
            content_type: INVOCATION_CONTENT_TYPE.into(),
            target_model: target_model.map(str::to_string),
        };
        self.compute.invoke_endpoint(&request).await
    }

    pub async fn endpoint(&self, name: &str) -> LifecycleResult<ServingEndpoint> {
        let slot = self.existing_slot(name)?;
        let state = slot.state.lock().await;
        state.clone().ok_or_else(|| LifecycleError::not_found(ResourceKind::Endpoint, name))
    }

    pub async fn endpoints(&self) -> Vec<ServingEndpoint> {
        let slots: Vec<Arc<EndpointSlot>> = self.slots.lock().values().cloned().collect();
        let mut out = Vec::with_capacity(slots.len());
        for slot in slots {
            if let Some(ep) = slot.state.lock().await.clone() { out.push(ep); }
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }
}
