use lifecycle_service::{
    handle_approval, handle_batch_trigger, handle_endpoint_create, handle_endpoint_create_multi_model, handle_endpoint_invoke, handle_registration,
};
use modelops_core::{ApprovalStatus, LifecycleConfig, LifecycleError, LifecycleSystem, ObjectLocation, ObjectStore, PackageRef, ResourceKind};
use std::time::Duration;

fn system() -> LifecycleSystem { LifecycleSystem::in_memory(LifecycleConfig { transform_poll_interval_ms: 5, ..Default::default() }).unwrap() }

fn registration(auto_approve: bool) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "modelArtifactS3Key": "iris/a.tar.gz",
        "codeStorageS3Key": "iris/c.tar.gz",
        "modelPackageGroupName": "iris",
        "transformInstanceType": "ml.m5.large",
        "inferenceInstanceType": "ml.t2.medium",
        "autoApprove": auto_approve
    }))
    .unwrap()
}

#[test]
fn registration_replies_with_package_ref() {
    let sys = system();
    let reply = handle_registration(&sys, &registration(true)).unwrap();
    assert_eq!(reply, serde_json::json!({ "group": "iris", "version": 1 }));
    assert!(sys.registry.package(&PackageRef::new("iris", 1)).unwrap().is_approved());
}

#[test]
fn manual_gate_approves_then_refuses_reapproval() {
    let sys = system();
    handle_registration(&sys, &registration(false)).unwrap();
    let approve = br#"{"group":"iris","version":1,"decision":"approve"}"#;
    let reply = handle_approval(&sys, approve).unwrap();
    assert_eq!(reply["status"], serde_json::json!(ApprovalStatus::Approved));
    assert!(matches!(handle_approval(&sys, approve), Err(LifecycleError::InvalidTransition { .. })));
}

#[test]
fn reject_decision_is_recorded() {
    let sys = system();
    handle_registration(&sys, &registration(false)).unwrap();
    handle_approval(&sys, br#"{"group":"iris","version":1,"decision":"reject"}"#).unwrap();
    assert_eq!(sys.registry.package(&PackageRef::new("iris", 1)).unwrap().status, ApprovalStatus::Rejected);
}

#[test]
fn malformed_payload_is_serialization_error() {
    let sys = system();
    assert!(matches!(handle_registration(&sys, b"not json"), Err(LifecycleError::Serialization(_))));
    assert!(matches!(handle_approval(&sys, br#"{"group":"iris","version":1,"decision":"maybe"}"#), Err(LifecycleError::Serialization(_))));
}

#[tokio::test]
async fn batch_trigger_returns_execution_name() {
    let sys = system();
    let payload = br#"{"modelName":"iris-model","inputLocation":"in/data.csv","contentType":"text/csv","instanceType":"ml.m5.large","executionName":"run-42"}"#;
    let reply = handle_batch_trigger(&sys, payload).unwrap();
    assert_eq!(reply["executionName"], "run-42");
    assert_eq!(sys.batch.execution("run-42").unwrap().output.to_string(), "s3://inference/output/run-42");
}

async fn bound_version(sys: &LifecycleSystem) -> u64 {
    sys.endpoints.endpoint("iris-ep").await.unwrap().bound_package().unwrap().version
}

#[tokio::test]
async fn endpoint_created_over_handler_follows_manual_approval() {
    let sys = system();
    let _convergence = sys.spawn_convergence();
    handle_registration(&sys, &registration(true)).unwrap();

    let reply = handle_endpoint_create(&sys, br#"{"modelPackageGroupName":"iris","instanceType":"ml.t2.medium"}"#).await.unwrap();
    assert_eq!(reply["endpointName"], "iris-ep");
    assert_eq!(bound_version(&sys).await, 1);

    handle_registration(&sys, &registration(false)).unwrap();
    handle_approval(&sys, br#"{"group":"iris","version":2,"decision":"approve"}"#).unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while bound_version(&sys).await != 2 { tokio::time::sleep(Duration::from_millis(10)).await; }
    })
    .await
    .expect("endpoint converged to v2");
    assert_eq!(sys.endpoints.endpoint("iris-ep").await.unwrap().updates, 1);

    let reply = handle_endpoint_invoke(&sys, br#"{"endpointName":"iris-ep","body":"5.1,3.5,1.4,0.2"}"#).await.unwrap();
    assert!(reply["model"].as_str().unwrap().starts_with("iris-v2-"));
    assert_eq!(reply["bytes"], 15);
}

#[tokio::test]
async fn endpoint_create_without_approved_package_is_not_found() {
    let sys = system();
    handle_registration(&sys, &registration(false)).unwrap();
    let err = handle_endpoint_create(&sys, br#"{"modelPackageGroupName":"iris","instanceType":"ml.t2.medium"}"#).await.unwrap_err();
    assert!(matches!(err, LifecycleError::NotFound { kind: ResourceKind::ModelPackage, .. }));
}

#[tokio::test]
async fn multi_model_endpoint_over_handlers() {
    let sys = system();
    sys.store.put(&ObjectLocation::new("model-artifacts", "iris/a.tar.gz"), b"weights".to_vec()).await.unwrap();
    handle_registration(&sys, &registration(true)).unwrap();

    let reply = handle_endpoint_create_multi_model(
        &sys,
        br#"{"packages":[{"group":"iris","version":1}],"instanceType":"ml.t2.medium","instanceCount":2}"#,
    )
    .await
    .unwrap();
    assert_eq!(reply["endpointName"], "iris-mme-ep");
    assert_eq!(sys.endpoints.endpoint("iris-mme-ep").await.unwrap().instance.instance_count, 2);

    let reply = handle_endpoint_invoke(&sys, br#"{"endpointName":"iris-mme-ep","targetModel":"iris-v1.tar.gz","body":"[1]"}"#).await.unwrap();
    assert_eq!(reply["targetModel"], "iris-v1.tar.gz");
    let err = handle_endpoint_invoke(&sys, br#"{"endpointName":"iris-mme-ep","body":"[1]"}"#).await.unwrap_err();
    assert!(matches!(err, LifecycleError::InvalidRequest(_)));
}
