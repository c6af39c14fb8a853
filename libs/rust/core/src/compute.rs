//! Managed-compute seam: model, endpoint and transform-job submissions.
//!
//! Create/update calls only acknowledge a submission. Provisioning outcomes
//! arrive later as `LifecycleEvent`s on the bus.

use crate::error::{LifecycleError, LifecycleResult, ResourceKind};
use crate::events::{EventBus, LifecycleEvent};
use crate::model_registry::{ContainerDefinition, PackageRef};
use crate::provisioner::{AccessMode, ExecutionIdentity};
use crate::storage::{ObjectLocation, ObjectStore};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContainerMode { SingleModel, MultiModel }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDefinition {
    pub name: String,
    pub identity: ExecutionIdentity,
    pub container: ContainerDefinition,
    pub mode: ContainerMode,
    pub packages: Vec<PackageRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductionVariant {
    pub variant_name: String,
    pub model_name: String,
    pub instance_type: String,
    pub initial_instance_count: u32,
    pub initial_weight: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointConfigSpec {
    pub name: String,
    pub variants: Vec<ProductionVariant>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformJobSpec {
    pub job_name: String,
    pub model_name: String,
    pub input: ObjectLocation,
    pub content_type: String,
    pub output: ObjectLocation,
    pub instance_type: String,
    pub instance_count: u32,
    pub identity: ExecutionIdentity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TransformJobState {
    Submitted,
    Running,
    Completed,
    Failed { reason: String },
}

impl TransformJobState {
    pub fn is_terminal(&self) -> bool { matches!(self, Self::Completed | Self::Failed { .. }) }

    /// Submitted -> Running -> {Completed, Failed}; terminal states never change.
    pub fn can_transition_to(&self, next: &TransformJobState) -> bool {
        use TransformJobState::*;
        matches!((self, next), (Submitted, Running) | (Submitted, Failed { .. }) | (Running, Completed) | (Running, Failed { .. }))
    }
}

impl fmt::Display for TransformJobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransformJobState::Submitted => f.write_str("Submitted"),
            TransformJobState::Running => f.write_str("Running"),
            TransformJobState::Completed => f.write_str("Completed"),
            TransformJobState::Failed { reason } => write!(f, "Failed({reason})"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationRequest {
    pub endpoint: String,
    pub body: Vec<u8>,
    pub content_type: String,
    pub target_model: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionHandle {
    pub resource: String,
    pub request_id: String,
}

impl SubmissionHandle {
    fn new(resource: &str) -> Self { Self { resource: resource.to_string(), request_id: Uuid::new_v4().to_string() } }
}

#[async_trait]
pub trait ComputeClient: Send + Sync {
    async fn create_model(&self, model: &ModelDefinition) -> LifecycleResult<SubmissionHandle>;
    async fn create_endpoint_config(&self, config: &EndpointConfigSpec) -> LifecycleResult<SubmissionHandle>;
    async fn create_endpoint(&self, endpoint: &str, config_name: &str) -> LifecycleResult<SubmissionHandle>;
    async fn update_endpoint(&self, endpoint: &str, config_name: &str) -> LifecycleResult<SubmissionHandle>;
    async fn submit_transform_job(&self, job: &TransformJobSpec) -> LifecycleResult<SubmissionHandle>;
    async fn transform_job_state(&self, job_name: &str) -> LifecycleResult<TransformJobState>;
    async fn invoke_endpoint(&self, request: &InvocationRequest) -> LifecycleResult<Vec<u8>>;
}

/// How an in-memory transform job progresses, counted in state polls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransformScript {
    CompleteAfter(u32),
    FailAfter(u32, String),
    Never,
}

impl Default for TransformScript {
    fn default() -> Self { Self::CompleteAfter(1) }
}

struct JobRecord {
    spec: TransformJobSpec,
    state: TransformJobState,
    polls: u32,
    script: TransformScript,
}

#[derive(Debug, Clone)]
pub struct EndpointRecord {
    pub config_name: String,
    pub updates: u32,
}

#[derive(Default)]
struct ComputeState {
    models: HashMap<String, ModelDefinition>,
    failed_models: HashMap<String, String>,
    configs: HashMap<String, EndpointConfigSpec>,
    endpoints: HashMap<String, EndpointRecord>,
    jobs: HashMap<String, JobRecord>,
    job_order: Vec<String>,
    scripts: HashMap<String, TransformScript>,
    default_script: TransformScript,
    transient_failures: u32,
}

/// Local stand-in for the managed-compute service.
pub struct InMemoryCompute {
    state: Mutex<ComputeState>,
    store: Arc<dyn ObjectStore>,
    events: EventBus,
}

impl InMemoryCompute {
    pub fn new(store: Arc<dyn ObjectStore>, events: EventBus) -> Self { Self { state: Mutex::new(ComputeState::default()), store, events } }

    pub fn set_default_script(&self, script: TransformScript) { self.state.lock().default_script = script; }

    pub fn script_job(&self, job_name: &str, script: TransformScript) { self.state.lock().scripts.insert(job_name.to_string(), script); }

    /// The next `n` submissions are rejected with a retryable error.
    pub fn fail_next_submissions(&self, n: u32) { self.state.lock().transient_failures = n; }

    pub fn model(&self, name: &str) -> Option<ModelDefinition> { self.state.lock().models.get(name).cloned() }

    pub fn model_count(&self) -> usize { self.state.lock().models.len() }

    pub fn model_failure(&self, name: &str) -> Option<String> { self.state.lock().failed_models.get(name).cloned() }

    pub fn endpoint(&self, name: &str) -> Option<EndpointRecord> { self.state.lock().endpoints.get(name).cloned() }

    pub fn endpoint_config(&self, name: &str) -> Option<EndpointConfigSpec> { self.state.lock().configs.get(name).cloned() }

    pub fn submitted_jobs(&self) -> Vec<TransformJobSpec> {
        let st = self.state.lock();
        st.job_order.iter().filter_map(|n| st.jobs.get(n)).map(|j| j.spec.clone()).collect()
    }

    fn take_transient_failure(st: &mut ComputeState, op: &str) -> LifecycleResult<()> {
        if st.transient_failures > 0 {
            st.transient_failures -= 1;
            return Err(LifecycleError::Compute(format!("{op}: throttled")));
        }
        Ok(())
    }

    fn model_access_problem(model: &ModelDefinition) -> Option<String> {
        if !model.identity.permits(&model.container.model_data, AccessMode::Read) {
            return Some(format!("execution identity {} cannot read {}", model.identity.id, model.container.model_data));
        }
        let code = model.container.environment.get("SAGEMAKER_SUBMIT_DIRECTORY").map(|uri| ObjectLocation::parse(uri));
        match code {
            Some(Ok(loc)) if !model.identity.permits(&loc, AccessMode::Read) => Some(format!("execution identity {} cannot read {}", model.identity.id, loc)),
            Some(Err(e)) => Some(e.to_string()),
            _ => None,
        }
    }

    async fn write_outputs(&self, spec: &TransformJobSpec) -> LifecycleResult<()> {
        for input in self.store.list(&spec.input.bucket, &spec.input.key).await? {
            let body = self.store.get(&input).await?;
            let out = spec.output.join(&format!("{}.out", input.file_name()));
            match self.store.put(&out, body).await {
                Ok(()) | Err(LifecycleError::AlreadyExists { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ComputeClient for InMemoryCompute {
    async fn create_model(&self, model: &ModelDefinition) -> LifecycleResult<SubmissionHandle> {
        let problem = {
            let mut st = self.state.lock();
            Self::take_transient_failure(&mut st, "create_model")?;
            if st.models.contains_key(&model.name) { return Err(LifecycleError::already_exists(ResourceKind::Model, &model.name)); }
            st.models.insert(model.name.clone(), model.clone());
            let problem = Self::model_access_problem(model);
            if let Some(reason) = &problem { st.failed_models.insert(model.name.clone(), reason.clone()); }
            problem
        };
        if let Some(reason) = problem {
            let events = self.events.clone();
            let correlation = model.packages.iter().map(|p| p.to_string()).collect::<Vec<_>>().join(",");
            let resource = model.name.clone();
            tokio::spawn(async move { events.publish(LifecycleEvent::ProvisioningFailed { resource, correlation, reason }); });
        }
        debug!(model = %model.name, "model_submitted");
        Ok(SubmissionHandle::new(&model.name))
    }

    async fn create_endpoint_config(&self, config: &EndpointConfigSpec) -> LifecycleResult<SubmissionHandle> {
        let mut st = self.state.lock();
        Self::take_transient_failure(&mut st, "create_endpoint_config")?;
        if st.configs.contains_key(&config.name) { return Err(LifecycleError::already_exists(ResourceKind::EndpointConfig, &config.name)); }
        if let Some(missing) = config.variants.iter().find(|v| !st.models.contains_key(&v.model_name)) {
            return Err(LifecycleError::not_found(ResourceKind::Model, &missing.model_name));
        }
        st.configs.insert(config.name.clone(), config.clone());
        Ok(SubmissionHandle::new(&config.name))
    }

    async fn create_endpoint(&self, endpoint: &str, config_name: &str) -> LifecycleResult<SubmissionHandle> {
        let mut st = self.state.lock();
        Self::take_transient_failure(&mut st, "create_endpoint")?;
        if st.endpoints.contains_key(endpoint) { return Err(LifecycleError::already_exists(ResourceKind::Endpoint, endpoint)); }
        if !st.configs.contains_key(config_name) { return Err(LifecycleError::not_found(ResourceKind::EndpointConfig, config_name)); }
        st.endpoints.insert(endpoint.to_string(), EndpointRecord { config_name: config_name.to_string(), updates: 0 });
        Ok(SubmissionHandle::new(endpoint))
    }

    async fn update_endpoint(&self, endpoint: &str, config_name: &str) -> LifecycleResult<SubmissionHandle> {
        let mut st = self.state.lock();
        Self::take_transient_failure(&mut st, "update_endpoint")?;
        if !st.configs.contains_key(config_name) { return Err(LifecycleError::not_found(ResourceKind::EndpointConfig, config_name)); }
        let record = st.endpoints.get_mut(endpoint).ok_or_else(|| LifecycleError::not_found(ResourceKind::Endpoint, endpoint))?;
        record.config_name = config_name.to_string();
        record.updates += 1;
        Ok(SubmissionHandle::new(endpoint))
    }

    async fn submit_transform_job(&self, job: &TransformJobSpec) -> LifecycleResult<SubmissionHandle> {
        let mut st = self.state.lock();
        Self::take_transient_failure(&mut st, "submit_transform_job")?;
        if st.jobs.contains_key(&job.job_name) { return Err(LifecycleError::already_exists(ResourceKind::TransformJob, &job.job_name)); }
        let mut script = st.scripts.get(&job.job_name).cloned().unwrap_or_else(|| st.default_script.clone());
        // the job itself fails later when it cannot run, like the real service
        if !st.models.contains_key(&job.model_name) {
            script = TransformScript::FailAfter(0, format!("model {} not found", job.model_name));
        } else if !job.identity.permits(&job.input, AccessMode::Read) || !job.identity.permits(&job.output.join("part-0.out"), AccessMode::ReadWrite) {
            script = TransformScript::FailAfter(0, format!("execution identity {} lacks access to job locations", job.identity.id));
        }
        st.jobs.insert(job.job_name.clone(), JobRecord { spec: job.clone(), state: TransformJobState::Submitted, polls: 0, script });
        st.job_order.push(job.job_name.clone());
        Ok(SubmissionHandle::new(&job.job_name))
    }

    async fn transform_job_state(&self, job_name: &str) -> LifecycleResult<TransformJobState> {
        let (state, completed_spec) = {
            let mut st = self.state.lock();
            let job = st.jobs.get_mut(job_name).ok_or_else(|| LifecycleError::not_found(ResourceKind::TransformJob, job_name))?;
            if job.state.is_terminal() { return Ok(job.state.clone()); }
            let next = match (&job.state, &job.script) {
                (TransformJobState::Submitted, TransformScript::FailAfter(0, reason)) => TransformJobState::Failed { reason: reason.clone() },
                (TransformJobState::Submitted, _) => TransformJobState::Running,
                (_, TransformScript::CompleteAfter(n)) if job.polls >= *n => TransformJobState::Completed,
                (_, TransformScript::FailAfter(n, reason)) if job.polls >= *n => TransformJobState::Failed { reason: reason.clone() },
                (current, _) => current.clone(),
            };
            job.polls += 1;
            if next != job.state && !job.state.can_transition_to(&next) {
                warn!(job = %job_name, from = %job.state, to = %next, "illegal_transform_transition");
                return Ok(job.state.clone());
            }
            job.state = next;
            let completed = (job.state == TransformJobState::Completed).then(|| job.spec.clone());
            (job.state.clone(), completed)
        };
        if let Some(spec) = completed_spec { self.write_outputs(&spec).await?; }
        Ok(state)
    }

    async fn invoke_endpoint(&self, request: &InvocationRequest) -> LifecycleResult<Vec<u8>> {
        let st = self.state.lock();
        let record = st.endpoints.get(&request.endpoint).ok_or_else(|| LifecycleError::not_found(ResourceKind::Endpoint, &request.endpoint))?;
        let model = st.configs.get(&record.config_name).and_then(|c| c.variants.first()).map(|v| v.model_name.clone()).unwrap_or_default();
        let reply = serde_json::json!({
            "endpoint": request.endpoint,
            "model": model,
            "targetModel": request.target_model,
            "bytes": request.body.len(),
        });
        Ok(serde_json::to_vec(&reply)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transform_transitions() {
        use TransformJobState::*;
        assert!(Submitted.can_transition_to(&Running));
        assert!(Running.can_transition_to(&Completed));
        assert!(Running.can_transition_to(&Failed { reason: "oom".into() }));
        assert!(!Completed.can_transition_to(&Running));
        assert!(!Failed { reason: "x".into() }.can_transition_to(&Completed));
        assert!(!Submitted.can_transition_to(&Completed));
    }

    #[test]
    fn state_serializes_with_tag() {
        let v = serde_json::to_value(TransformJobState::Failed { reason: "oom".into() }).unwrap();
        assert_eq!(v["state"], "failed");
        assert_eq!(v["reason"], "oom");
    }
}
