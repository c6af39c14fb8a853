//! Batch Inference Workflow: transform job, then post-processing, under one deadline.
//!
//! The output prefix is derived from the execution name alone
//! (`s3://<inference bucket>/output/<execution>`), so post-processing can find
//! results without any hand-off beyond the name. The workflow never retries a
//! step. A failed execution may be re-run under the same name, which starts a
//! new attempt writing to the same output prefix.

use crate::compute::{ComputeClient, TransformJobSpec, TransformJobState};
use crate::config::LifecycleConfig;
use crate::error::{LifecycleError, LifecycleResult, ResourceKind};
use crate::events::{EventBus, LifecycleEvent};
use crate::lifecycle::{WorkflowFailure, WorkflowPhase, WorkflowState, WorkflowStep};
use crate::metrics::LIFECYCLE_METRICS;
use crate::provisioner::{ExecutionEnvironmentProvisioner, IdentityRequest, StorageScope};
use crate::storage::{ObjectLocation, ObjectStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Trigger payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchInferenceRequest {
    pub model_name: String,
    /// Key of the input dataset (object or prefix) in the inference bucket.
    pub input_location: String,
    pub content_type: String,
    pub instance_type: String,
    #[serde(default)]
    pub execution_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowExecution {
    pub name: String,
    pub attempt: u32,
    pub request: BatchInferenceRequest,
    pub job_name: String,
    pub input: ObjectLocation,
    pub output: ObjectLocation,
    pub phase: WorkflowPhase,
    pub job_state: Option<TransformJobState>,
    pub failure: Option<WorkflowFailure>,
    pub result: Option<serde_json::Value>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl WorkflowExecution {
    pub fn is_terminal(&self) -> bool { self.phase.is_terminal() }
}

/// Everything post-processing gets: the full request plus what the transform produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowContext {
    pub execution: String,
    pub attempt: u32,
    pub request: BatchInferenceRequest,
    pub transform_input: ObjectLocation,
    pub transform_output: ObjectLocation,
    pub job_name: String,
    pub job_state: TransformJobState,
}

#[async_trait]
pub trait PostProcessor: Send + Sync {
    async fn process(&self, ctx: &WorkflowContext) -> LifecycleResult<serde_json::Value>;
}

/// Reads every object under the transform output prefix and summarises it.
pub struct OutputCollector {
    store: Arc<dyn ObjectStore>,
}

impl OutputCollector {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self { Self { store } }
}

#[async_trait]
impl PostProcessor for OutputCollector {
    async fn process(&self, ctx: &WorkflowContext) -> LifecycleResult<serde_json::Value> {
        let prefix = format!("{}/", ctx.transform_output.key.trim_end_matches('/'));
        let mut objects = Vec::new();
        let mut total = 0usize;
        for loc in self.store.list(&ctx.transform_output.bucket, &prefix).await? {
            let body = self.store.get(&loc).await?;
            total += body.len();
            objects.push(serde_json::json!({ "key": loc.key, "bytes": body.len() }));
        }
        info!(execution = %ctx.execution, objects = objects.len(), bytes = total, "transform_output_collected");
        Ok(serde_json::json!({
            "execution": ctx.execution,
            "outputPath": ctx.transform_output.to_string(),
            "objects": objects,
            "totalBytes": total,
        }))
    }
}

fn validate_request(req: &BatchInferenceRequest) -> LifecycleResult<()> {
    for (field, value) in [("modelName", &req.model_name), ("inputLocation", &req.input_location), ("contentType", &req.content_type), ("instanceType", &req.instance_type)] {
        if value.trim().is_empty() { return Err(LifecycleError::InvalidRequest(format!("{field} is required"))); }
    }
    if let Some(name) = &req.execution_name {
        let valid = !name.is_empty() && name.len() <= 63 && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');
        if !valid { return Err(LifecycleError::InvalidRequest(format!("invalid execution name: {name:?}"))); }
    }
    Ok(())
}

enum Reservation {
    Finished(WorkflowExecution),
    Started(WorkflowExecution),
}

pub struct BatchInferenceWorkflow {
    cfg: Arc<LifecycleConfig>,
    compute: Arc<dyn ComputeClient>,
    provisioner: Arc<dyn ExecutionEnvironmentProvisioner>,
    post: Arc<dyn PostProcessor>,
    events: EventBus,
    executions: Mutex<HashMap<String, WorkflowExecution>>,
}

impl BatchInferenceWorkflow {
    pub fn new(
        cfg: Arc<LifecycleConfig>,
        compute: Arc<dyn ComputeClient>,
        provisioner: Arc<dyn ExecutionEnvironmentProvisioner>,
        post: Arc<dyn PostProcessor>,
        events: EventBus,
    ) -> Self {
        Self { cfg, compute, provisioner, post, events, executions: Mutex::new(HashMap::new()) }
    }

    pub fn output_location(&self, execution: &str) -> ObjectLocation { ObjectLocation::new(self.cfg.inference_bucket.clone(), format!("output/{execution}")) }

    pub fn execution(&self, name: &str) -> LifecycleResult<WorkflowExecution> {
        self.executions.lock().get(name).cloned().ok_or_else(|| LifecycleError::not_found(ResourceKind::Execution, name))
    }

    fn reserve(&self, req: &BatchInferenceRequest) -> LifecycleResult<Reservation> {
        validate_request(req)?;
        let name = req.execution_name.clone().unwrap_or_else(|| Uuid::new_v4().to_string());
        let mut executions = self.executions.lock();
        let attempt = match executions.get(&name) {
            Some(prev) if prev.phase == WorkflowPhase::Completed => return Ok(Reservation::Finished(prev.clone())),
            Some(prev) if !prev.is_terminal() => return Err(LifecycleError::already_exists(ResourceKind::Execution, &name)),
            Some(prev) => prev.attempt + 1,
            None => 1,
        };
        let job_name = if attempt == 1 { name.clone() } else { format!("{name}-r{attempt}") };
        let request = BatchInferenceRequest { execution_name: Some(name.clone()), ..req.clone() };
        let exec = WorkflowExecution {
            input: ObjectLocation::new(self.cfg.inference_bucket.clone(), req.input_location.clone()),
            output: self.output_location(&name),
            name: name.clone(),
            attempt,
            request,
            job_name,
            phase: WorkflowPhase::Submitted,
            job_state: None,
            failure: None,
            result: None,
            started_at: Utc::now(),
            finished_at: None,
        };
        executions.insert(name, exec.clone());
        Ok(Reservation::Started(exec))
    }

    fn snapshot(&self, exec: &WorkflowExecution) { self.executions.lock().insert(exec.name.clone(), exec.clone()); }

    /// Start an execution in the background and return its name. Rejections
    /// (invalid payload, execution already in flight) are reported synchronously.
    pub fn trigger(self: &Arc<Self>, req: BatchInferenceRequest) -> LifecycleResult<String> {
        match self.reserve(&req)? {
            Reservation::Finished(exec) => Ok(exec.name),
            Reservation::Started(exec) => {
                let name = exec.name.clone();
                let workflow = Arc::clone(self);
                tokio::spawn(async move { workflow.execute(exec).await; });
                Ok(name)
            }
        }
    }

    /// Drive an execution to a terminal phase. A Failed execution is a normal result.
    pub async fn run(&self, req: BatchInferenceRequest) -> LifecycleResult<WorkflowExecution> {
        match self.reserve(&req)? {
            Reservation::Finished(exec) => Ok(exec),
            Reservation::Started(exec) => Ok(self.execute(exec).await),
        }
    }

    #[instrument(skip_all, fields(execution = %exec.name, attempt = exec.attempt))]
    async fn execute(&self, mut exec: WorkflowExecution) -> WorkflowExecution {
        let mut state = WorkflowState::new(exec.name.clone());
        let deadline = self.cfg.workflow_timeout();
        let outcome = tokio::time::timeout(deadline, self.drive(&mut state, &mut exec)).await;
        let failed = match outcome {
            Ok(Ok(())) => None,
            Ok(Err((step, reason))) => Some((step, reason)),
            Err(_) => Some((WorkflowStep::Timeout, format!("workflow exceeded {}s", deadline.as_secs()))),
        };
        if let Some((step, reason)) = failed {
            if let Err(e) = state.fail(step, reason) { warn!(error = %e, "workflow_fail_after_terminal"); }
        }

        exec.phase = state.phase();
        exec.failure = state.failure().cloned();
        exec.finished_at = Some(Utc::now());
        self.snapshot(&exec);

        LIFECYCLE_METRICS.workflow.finished_total.with_label_values(&[exec.phase.as_str()]).inc();
        LIFECYCLE_METRICS.workflow.duration_seconds.observe(state.elapsed().as_secs_f64());
        match &exec.failure {
            Some(f) => error!(step = ?f.step, reason = %f.reason, job = %exec.job_name, "workflow_failed"),
            None => info!(output = %exec.output, "workflow_completed"),
        }
        self.events.publish(LifecycleEvent::WorkflowFinished { execution: exec.name.clone(), phase: exec.phase, failure: exec.failure.clone() });
        exec
    }

    async fn drive(&self, state: &mut WorkflowState, exec: &mut WorkflowExecution) -> Result<(), (WorkflowStep, String)> {
        let transform = |e: LifecycleError| (WorkflowStep::Transform, e.to_string());

        let output_scope = StorageScope::prefix(exec.output.bucket.clone(), format!("{}/", exec.output.key));
        let identity = self
            .provisioner
            .provision(IdentityRequest::new(format!("{}-transform", exec.name)).read(StorageScope::object(&exec.input)).read_write(output_scope))
            .await
            .map_err(transform)?;
        let job = TransformJobSpec {
            job_name: exec.job_name.clone(),
            model_name: exec.request.model_name.clone(),
            input: exec.input.clone(),
            content_type: exec.request.content_type.clone(),
            output: exec.output.clone(),
            instance_type: exec.request.instance_type.clone(),
            instance_count: self.cfg.default_instance_count,
            identity,
        };
        self.compute.submit_transform_job(&job).await.map_err(transform)?;
        self.observe(exec, TransformJobState::Submitted);
        state.advance_to(WorkflowPhase::TransformRunning).map_err(transform)?;
        self.sync_phase(state, exec);

        let final_state = loop {
            tokio::time::sleep(self.cfg.transform_poll_interval()).await;
            let current = self.compute.transform_job_state(&exec.job_name).await.map_err(transform)?;
            if exec.job_state.as_ref() != Some(&current) { self.observe(exec, current.clone()); }
            match current {
                TransformJobState::Completed => break current,
                TransformJobState::Failed { reason } => return Err((WorkflowStep::Transform, reason)),
                TransformJobState::Submitted | TransformJobState::Running => {}
            }
        };
        state.advance_to(WorkflowPhase::TransformCompleted).map_err(transform)?;
        state.advance_to(WorkflowPhase::PostProcessing).map_err(transform)?;
        self.sync_phase(state, exec);

        let ctx = WorkflowContext {
            execution: exec.name.clone(),
            attempt: exec.attempt,
            request: exec.request.clone(),
            transform_input: exec.input.clone(),
            transform_output: exec.output.clone(),
            job_name: exec.job_name.clone(),
            job_state: final_state,
        };
        let result = self.post.process(&ctx).await.map_err(|e| (WorkflowStep::PostProcess, e.to_string()))?;
        exec.result = Some(result);
        state.advance_to(WorkflowPhase::Completed).map_err(|e| (WorkflowStep::PostProcess, e.to_string()))?;
        Ok(())
    }

    fn observe(&self, exec: &mut WorkflowExecution, job_state: TransformJobState) {
        exec.job_state = Some(job_state.clone());
        self.snapshot(exec);
        self.events.publish(LifecycleEvent::TransformJobStateChanged { execution: exec.name.clone(), job: exec.job_name.clone(), state: job_state });
    }

    fn sync_phase(&self, state: &WorkflowState, exec: &mut WorkflowExecution) {
        exec.phase = state.phase();
        self.snapshot(exec);
    }
}
