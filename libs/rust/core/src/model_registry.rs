//! Model Registry: named package groups holding append-only, versioned model packages.
//!
//! Packages are created pending (or directly approved) and only move through an
//! explicit approve/reject transition. Every transition is published on the
//! event bus so endpoint convergence can react to it.
//!
//! Group creation is serialised by the registry's write lock: concurrent
//! find-or-create callers for the same name all observe the single entry that
//! won the lock, so no compare-and-swap against the backing service is needed.

use crate::config::LifecycleConfig;
use crate::error::{LifecycleError, LifecycleResult, ResourceKind};
use crate::events::{EventBus, LifecycleEvent};
use crate::metrics::LIFECYCLE_METRICS;
use crate::storage::ObjectLocation;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::{info, instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ApprovalStatus { PendingManualApproval, Approved, Rejected }

impl fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self { ApprovalStatus::PendingManualApproval => "PendingManualApproval", ApprovalStatus::Approved => "Approved", ApprovalStatus::Rejected => "Rejected" };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PackageRef {
    pub group: String,
    pub version: u64,
}

impl PackageRef {
    pub fn new(group: impl Into<String>, version: u64) -> Self { Self { group: group.into(), version } }
}

impl fmt::Display for PackageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}/{}", self.group, self.version) }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupRef {
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupportedTypes {
    pub transform_instance_types: Vec<String>,
    pub realtime_instance_types: Vec<String>,
    pub content_types: Vec<String>,
    pub response_mime_types: Vec<String>,
}

impl SupportedTypes {
    /// CSV in, CSV out, one instance type per inference mode.
    pub fn csv(transform_instance_type: &str, realtime_instance_type: &str) -> Self {
        Self {
            transform_instance_types: vec![transform_instance_type.to_string()],
            realtime_instance_types: vec![realtime_instance_type.to_string()],
            content_types: vec!["text/csv".into()],
            response_mime_types: vec!["text/csv".into()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerDefinition {
    pub image: String,
    pub model_data: ObjectLocation,
    pub environment: BTreeMap<String, String>,
}

/// Environment the serving container needs to locate and run the inference code.
pub(crate) fn serving_environment(cfg: &LifecycleConfig, code: &ObjectLocation) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("SAGEMAKER_CONTAINER_LOG_LEVEL".to_string(), "20".to_string()),
        ("SAGEMAKER_PROGRAM".to_string(), "inference.py".to_string()),
        ("SAGEMAKER_REGION".to_string(), cfg.region.clone()),
        ("SAGEMAKER_SUBMIT_DIRECTORY".to_string(), code.to_string()),
    ])
}

#[derive(Debug, Clone)]
pub struct PackageSpec {
    pub artifact: ObjectLocation,
    pub code: ObjectLocation,
    pub supported: SupportedTypes,
    pub initial_status: ApprovalStatus,
}

impl PackageSpec {
    pub fn new(artifact: ObjectLocation, code: ObjectLocation, supported: SupportedTypes) -> Self {
        Self { artifact, code, supported, initial_status: ApprovalStatus::PendingManualApproval }
    }

    pub fn approved(mut self) -> Self { self.initial_status = ApprovalStatus::Approved; self }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelPackage {
    pub reference: PackageRef,
    pub artifact: ObjectLocation,
    pub code: ObjectLocation,
    pub status: ApprovalStatus,
    pub supported: SupportedTypes,
    pub container: ContainerDefinition,
    pub fingerprint: String,
    pub created_at: DateTime<Utc>,
    pub status_changed_at: DateTime<Utc>,
}

impl ModelPackage {
    pub fn is_approved(&self) -> bool { self.status == ApprovalStatus::Approved }
}

#[derive(Debug, Clone)]
pub struct ModelPackageGroup {
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub packages: Vec<ModelPackage>,
}

fn fingerprint(image: &str, artifact: &ObjectLocation, code: &ObjectLocation) -> String {
    let mut h = Sha256::new();
    h.update(image.as_bytes());
    h.update(b"\n");
    h.update(artifact.to_string().as_bytes());
    h.update(b"\n");
    h.update(code.to_string().as_bytes());
    hex::encode(h.finalize())
}

/// 1-63 chars, alphanumeric or hyphen, leading alphanumeric. A trailing `-mme`
/// is reserved: `<g>-mme` would name its endpoint `<g>-mme-ep`, which belongs
/// to the multi-model endpoint of `<g>`.
pub fn validate_group_name(name: &str) -> LifecycleResult<()> {
    let valid = !name.is_empty()
        && name.len() <= 63
        && name.chars().next().map_or(false, |c| c.is_ascii_alphanumeric())
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        && !name.ends_with("-mme");
    if valid { Ok(()) } else { Err(LifecycleError::InvalidRequest(format!("invalid model package group name: {name:?}"))) }
}

pub struct ModelRegistry {
    cfg: Arc<LifecycleConfig>,
    groups: RwLock<HashMap<String, ModelPackageGroup>>,
    events: EventBus,
}

impl ModelRegistry {
    pub fn new(cfg: Arc<LifecycleConfig>, events: EventBus) -> Self { Self { cfg, groups: RwLock::new(HashMap::new()), events } }

    pub fn find_group(&self, name: &str) -> LifecycleResult<GroupRef> {
        self.groups.read().get(name).map(|g| GroupRef { name: g.name.clone(), created_at: g.created_at }).ok_or_else(|| LifecycleError::not_found(ResourceKind::PackageGroup, name))
    }

    pub fn find_or_create_group(&self, name: &str) -> LifecycleResult<GroupRef> {
        validate_group_name(name)?;
        if let Ok(existing) = self.find_group(name) { return Ok(existing); }
        let mut groups = self.groups.write();
        // a racing creator may have won between the read and the write lock
        let group = groups.entry(name.to_string()).or_insert_with(|| {
            info!(group = %name, "model_package_group_created");
            ModelPackageGroup { name: name.to_string(), created_at: Utc::now(), packages: Vec::new() }
        });
        Ok(GroupRef { name: group.name.clone(), created_at: group.created_at })
    }

    #[instrument(skip(self, spec), fields(group = %group.name))]
    pub fn register_package(&self, group: &GroupRef, spec: PackageSpec) -> LifecycleResult<PackageRef> {
        if spec.initial_status == ApprovalStatus::Rejected {
            return Err(LifecycleError::Registration("packages cannot be registered as Rejected".into()));
        }
        let reference = {
            let mut groups = self.groups.write();
            let g = groups.get_mut(&group.name).ok_or_else(|| LifecycleError::Registration(format!("model package group {} does not exist", group.name)))?;
            let now = Utc::now();
            let reference = PackageRef::new(g.name.clone(), g.packages.len() as u64 + 1);
            let container = ContainerDefinition {
                image: self.cfg.inference_image.clone(),
                model_data: spec.artifact.clone(),
                environment: serving_environment(&self.cfg, &spec.code),
            };
            g.packages.push(ModelPackage {
                reference: reference.clone(),
                fingerprint: fingerprint(&container.image, &spec.artifact, &spec.code),
                artifact: spec.artifact,
                code: spec.code,
                status: spec.initial_status,
                supported: spec.supported,
                container,
                created_at: now,
                status_changed_at: now,
            });
            reference
        };
        LIFECYCLE_METRICS.registry.packages_registered_total.with_label_values(&[reference.group.as_str()]).inc();
        info!(package = %reference, status = %spec.initial_status, "model_package_registered");
        self.events.publish(LifecycleEvent::PackageStateChanged { package: reference.clone(), status: spec.initial_status });
        Ok(reference)
    }

    /// PendingManualApproval -> Approved. Re-approving an Approved package is an
    /// `InvalidTransition` like any other non-pending source state.
    pub fn approve(&self, package: &PackageRef) -> LifecycleResult<()> { self.transition(package, ApprovalStatus::Approved) }

    /// PendingManualApproval -> Rejected.
    pub fn reject(&self, package: &PackageRef) -> LifecycleResult<()> { self.transition(package, ApprovalStatus::Rejected) }

    fn transition(&self, package: &PackageRef, to: ApprovalStatus) -> LifecycleResult<()> {
        {
            let mut groups = self.groups.write();
            let g = groups.get_mut(&package.group).ok_or_else(|| LifecycleError::not_found(ResourceKind::PackageGroup, &package.group))?;
            let p = package_slot(&mut g.packages, package)?;
            if p.status != ApprovalStatus::PendingManualApproval {
                return Err(LifecycleError::invalid_transition(package, p.status, to));
            }
            p.status = to;
            p.status_changed_at = Utc::now();
        }
        LIFECYCLE_METRICS.registry.approval_transitions_total.with_label_values(&[to.to_string().as_str()]).inc();
        info!(%package, status = %to, "model_package_status_changed");
        self.events.publish(LifecycleEvent::PackageStateChanged { package: package.clone(), status: to });
        Ok(())
    }

    pub fn package(&self, package: &PackageRef) -> LifecycleResult<ModelPackage> {
        let groups = self.groups.read();
        let g = groups.get(&package.group).ok_or_else(|| LifecycleError::not_found(ResourceKind::PackageGroup, &package.group))?;
        package.version.checked_sub(1)
            .and_then(|i| g.packages.get(i as usize))
            .cloned()
            .ok_or_else(|| LifecycleError::not_found(ResourceKind::ModelPackage, package.to_string()))
    }

    pub fn list_packages(&self, group: &str) -> LifecycleResult<Vec<ModelPackage>> {
        self.groups.read().get(group).map(|g| g.packages.clone()).ok_or_else(|| LifecycleError::not_found(ResourceKind::PackageGroup, group))
    }

    /// Highest approved version in the group.
    pub fn latest_approved(&self, group: &str) -> LifecycleResult<ModelPackage> {
        self.list_packages(group)?
            .into_iter()
            .rev()
            .find(ModelPackage::is_approved)
            .ok_or_else(|| LifecycleError::not_found(ResourceKind::ModelPackage, format!("{group}/<latest approved>")))
    }
}

fn package_slot<'a>(packages: &'a mut [ModelPackage], package: &PackageRef) -> LifecycleResult<&'a mut ModelPackage> {
    package.version.checked_sub(1)
        .and_then(|i| packages.get_mut(i as usize))
        .ok_or_else(|| LifecycleError::not_found(ResourceKind::ModelPackage, package.to_string()))
}

fn default_auto_approve() -> bool { true }

/// Registration API payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelRegistrationRequest {
    /// Key of the model artifact (tar.gz) in the model artifact bucket.
    pub model_artifact_s3_key: String,
    /// Key of the inference code (tar.gz) in the code storage bucket.
    pub code_storage_s3_key: String,
    pub model_package_group_name: String,
    pub transform_instance_type: String,
    pub inference_instance_type: String,
    #[serde(default = "default_auto_approve")]
    pub auto_approve: bool,
}

/// Find-or-create group, append a package, then optionally approve it.
pub struct ModelRegistration {
    cfg: Arc<LifecycleConfig>,
    registry: Arc<ModelRegistry>,
}

impl ModelRegistration {
    pub fn new(cfg: Arc<LifecycleConfig>, registry: Arc<ModelRegistry>) -> Self { Self { cfg, registry } }

    #[instrument(skip(self, req), fields(group = %req.model_package_group_name))]
    pub fn register(&self, req: &ModelRegistrationRequest) -> LifecycleResult<PackageRef> {
        if req.model_artifact_s3_key.is_empty() || req.code_storage_s3_key.is_empty() {
            return Err(LifecycleError::InvalidRequest("artifact and code keys are required".into()));
        }
        let group = self.registry.find_or_create_group(&req.model_package_group_name)?;
        let spec = PackageSpec::new(
            ObjectLocation::new(self.cfg.model_artifact_bucket.clone(), req.model_artifact_s3_key.clone()),
            ObjectLocation::new(self.cfg.code_storage_bucket.clone(), req.code_storage_s3_key.clone()),
            SupportedTypes::csv(&req.transform_instance_type, &req.inference_instance_type),
        );
        let package = self.registry.register_package(&group, spec)?;
        if req.auto_approve { self.registry.approve(&package)?; }
        Ok(package)
    }
}
