use async_trait::async_trait;
use modelops_core::config::ComputeConfig;
use modelops_core::provisioner::AccessMode;
use modelops_core::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn cfg() -> LifecycleConfig {
    LifecycleConfig {
        transform_poll_interval_ms: 5,
        compute: ComputeConfig { retry_base_delay_ms: 1, retry_max_delay_ms: 5, ..Default::default() },
        ..Default::default()
    }
}

/// Deploys iris v1 and seeds the input dataset; returns the served model name.
async fn deploy(sys: &LifecycleSystem) -> String {
    let g = sys.registry.find_or_create_group("iris").unwrap();
    let spec = PackageSpec::new(
        ObjectLocation::new("model-artifacts", "a.tar.gz"),
        ObjectLocation::new("code-storage", "c.tar.gz"),
        SupportedTypes::csv("ml.m5.large", "ml.t2.medium"),
    )
    .approved();
    let v1 = sys.registry.register_package(&g, spec).unwrap();
    sys.endpoints.create_endpoint(&v1, &InstanceSpec::new("ml.t2.medium", 1)).await.unwrap();
    sys.store.put(&ObjectLocation::new("inference", "in/data.csv"), b"5.1,3.5,1.4,0.2\n6.2,2.9,4.3,1.3\n".to_vec()).await.unwrap();
    sys.endpoints.endpoint("iris-ep").await.unwrap().bindings[0].model_name.clone()
}

fn request(model: &str, execution: Option<&str>) -> BatchInferenceRequest {
    BatchInferenceRequest {
        model_name: model.to_string(),
        input_location: "in/data.csv".into(),
        content_type: "text/csv".into(),
        instance_type: "ml.m5.large".into(),
        execution_name: execution.map(str::to_string),
    }
}

#[derive(Default)]
struct CountingPostProcessor {
    calls: AtomicUsize,
}

#[async_trait]
impl PostProcessor for CountingPostProcessor {
    async fn process(&self, ctx: &WorkflowContext) -> LifecycleResult<serde_json::Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(serde_json::to_value(ctx)?)
    }
}

fn counting_workflow(sys: &LifecycleSystem, cfg: LifecycleConfig, post: Arc<CountingPostProcessor>) -> BatchInferenceWorkflow {
    BatchInferenceWorkflow::new(Arc::new(cfg), sys.compute.clone(), sys.provisioner.clone(), post, sys.events.clone())
}

#[tokio::test]
async fn output_lands_under_execution_prefix() {
    let sys = LifecycleSystem::in_memory(cfg()).unwrap();
    let model = deploy(&sys).await;

    let exec = sys.batch.run(request(&model, Some("run-42"))).await.unwrap();
    assert_eq!(exec.phase, WorkflowPhase::Completed);
    assert_eq!(exec.output.to_string(), "s3://inference/output/run-42");
    assert_eq!(exec.job_name, "run-42");

    let jobs = sys.compute.submitted_jobs();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].input.to_string(), "s3://inference/in/data.csv");
    assert_eq!(jobs[0].output.to_string(), "s3://inference/output/run-42");
    assert!(jobs[0].identity.permits(&ObjectLocation::new("inference", "output/run-42/x.out"), AccessMode::ReadWrite));
    assert!(!jobs[0].identity.permits(&jobs[0].input, AccessMode::ReadWrite));

    let result = exec.result.unwrap();
    assert_eq!(result["objects"][0]["key"], "output/run-42/data.csv.out");
    assert_eq!(result["outputPath"], "s3://inference/output/run-42");
    assert!(sys.store.exists(&ObjectLocation::new("inference", "output/run-42/data.csv.out")).await.unwrap());
}

#[tokio::test]
async fn transform_failure_skips_post_processing() {
    let sys = LifecycleSystem::in_memory(cfg()).unwrap();
    let model = deploy(&sys).await;
    let post = Arc::new(CountingPostProcessor::default());
    let workflow = counting_workflow(&sys, cfg(), post.clone());
    sys.compute.script_job("run-7", TransformScript::FailAfter(1, "AlgorithmError: bad row".into()));

    let exec = workflow.run(request(&model, Some("run-7"))).await.unwrap();
    assert_eq!(exec.phase, WorkflowPhase::Failed);
    let failure = exec.failure.unwrap();
    assert_eq!(failure.step, WorkflowStep::Transform);
    assert_eq!(failure.reason, "AlgorithmError: bad row");
    assert_eq!(failure.phase_at_failure, WorkflowPhase::TransformRunning);
    assert_eq!(post.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn deadline_fails_workflow_even_if_transform_would_finish() {
    let sys = LifecycleSystem::in_memory(cfg()).unwrap();
    let model = deploy(&sys).await;
    let post = Arc::new(CountingPostProcessor::default());
    let workflow = counting_workflow(&sys, LifecycleConfig { workflow_timeout_secs: 1, transform_poll_interval_ms: 50, ..cfg() }, post.clone());
    sys.compute.script_job("run-slow", TransformScript::CompleteAfter(100));

    let exec = workflow.run(request(&model, Some("run-slow"))).await.unwrap();
    assert_eq!(exec.phase, WorkflowPhase::Failed);
    assert_eq!(exec.failure.unwrap().step, WorkflowStep::Timeout);
    assert_eq!(post.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn post_processor_receives_full_context() {
    let sys = LifecycleSystem::in_memory(cfg()).unwrap();
    let model = deploy(&sys).await;
    let post = Arc::new(CountingPostProcessor::default());
    let workflow = counting_workflow(&sys, cfg(), post.clone());

    let exec = workflow.run(request(&model, Some("run-ctx"))).await.unwrap();
    let ctx = exec.result.unwrap();
    assert_eq!(ctx["request"]["modelName"], model.as_str());
    assert_eq!(ctx["request"]["inputLocation"], "in/data.csv");
    assert_eq!(ctx["jobName"], "run-ctx");
    assert_eq!(ctx["jobState"]["state"], "completed");
    assert_eq!(post.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn completed_execution_is_not_rerun() {
    let sys = LifecycleSystem::in_memory(cfg()).unwrap();
    let model = deploy(&sys).await;
    let first = sys.batch.run(request(&model, Some("run-42"))).await.unwrap();
    let again = sys.batch.run(request(&model, Some("run-42"))).await.unwrap();
    assert_eq!(again.attempt, first.attempt);
    assert_eq!(again.finished_at, first.finished_at);
    assert_eq!(sys.compute.submitted_jobs().len(), 1);
}

#[tokio::test]
async fn failed_execution_retries_under_same_output_path() {
    let sys = LifecycleSystem::in_memory(cfg()).unwrap();
    let model = deploy(&sys).await;
    sys.compute.script_job("run-9", TransformScript::FailAfter(0, "capacity".into()));

    let failed = sys.batch.run(request(&model, Some("run-9"))).await.unwrap();
    assert_eq!(failed.phase, WorkflowPhase::Failed);
    assert_eq!(failed.failure.as_ref().unwrap().phase_at_failure, WorkflowPhase::TransformRunning);

    let retried = sys.batch.run(request(&model, Some("run-9"))).await.unwrap();
    assert_eq!(retried.phase, WorkflowPhase::Completed);
    assert_eq!(retried.attempt, 2);
    assert_eq!(retried.job_name, "run-9-r2");
    assert_eq!(retried.output, failed.output);
    assert_eq!(sys.batch.execution("run-9").unwrap().attempt, 2);
}

#[tokio::test]
async fn unknown_model_fails_in_transform() {
    let sys = LifecycleSystem::in_memory(cfg()).unwrap();
    deploy(&sys).await;
    let exec = sys.batch.run(request("ghost-model", Some("run-ghost"))).await.unwrap();
    assert_eq!(exec.phase, WorkflowPhase::Failed);
    assert!(exec.failure.unwrap().reason.contains("not found"));
}

#[tokio::test]
async fn trigger_runs_in_background_and_reports_finish() {
    let sys = LifecycleSystem::in_memory(cfg()).unwrap();
    let model = deploy(&sys).await;
    let mut rx = sys.events.subscribe();

    let name = sys.batch.trigger(request(&model, None)).unwrap();
    assert_eq!(uuid::Uuid::parse_str(&name).unwrap().get_version_num(), 4);

    let mut job_states = Vec::new();
    let finished = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await.unwrap() {
                LifecycleEvent::TransformJobStateChanged { execution, state, .. } if execution == name => job_states.push(state),
                LifecycleEvent::WorkflowFinished { execution, phase, failure } if execution == name => return (phase, failure),
                _ => {}
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(finished, (WorkflowPhase::Completed, None));
    assert_eq!(job_states, vec![TransformJobState::Submitted, TransformJobState::Running, TransformJobState::Completed]);
    assert_eq!(sys.batch.execution(&name).unwrap().phase, WorkflowPhase::Completed);
}

#[tokio::test]
async fn in_flight_execution_rejects_duplicate_trigger() {
    let sys = LifecycleSystem::in_memory(cfg()).unwrap();
    let model = deploy(&sys).await;
    sys.compute.script_job("run-busy", TransformScript::Never);

    sys.batch.trigger(request(&model, Some("run-busy"))).unwrap();
    let err = sys.batch.trigger(request(&model, Some("run-busy"))).unwrap_err();
    assert!(matches!(err, LifecycleError::AlreadyExists { kind: ResourceKind::Execution, .. }));
    assert!(!sys.batch.execution("run-busy").unwrap().is_terminal());
}

#[tokio::test]
async fn missing_execution_is_not_found() {
    let sys = LifecycleSystem::in_memory(cfg()).unwrap();
    assert!(matches!(sys.batch.execution("nope"), Err(LifecycleError::NotFound { kind: ResourceKind::Execution, .. })));
}

#[tokio::test]
async fn rejected_submission_fails_without_retry() {
    let sys = LifecycleSystem::in_memory(cfg()).unwrap();
    let model = deploy(&sys).await;
    sys.compute.fail_next_submissions(1);

    let exec = sys.batch.run(request(&model, Some("run-1"))).await.unwrap();
    assert_eq!(exec.phase, WorkflowPhase::Failed);
    let failure = exec.failure.unwrap();
    assert_eq!(failure.step, WorkflowStep::Transform);
    assert_eq!(failure.phase_at_failure, WorkflowPhase::Submitted);
    assert!(failure.reason.contains("throttled"));
    assert!(sys.compute.submitted_jobs().is_empty());
}
