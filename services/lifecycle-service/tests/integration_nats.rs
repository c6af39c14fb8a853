// Requires a NATS server on 127.0.0.1:4222 and `lifecycle-service` running.
// Run with: cargo test -p lifecycle-service --features integration

#[cfg(feature = "integration")]
#[tokio::test]
async fn registration_request_reply_roundtrip() {
    use std::time::Duration;
    let client = match async_nats::connect("127.0.0.1:4222").await {
        Ok(c) => c,
        Err(_) => { eprintln!("NATS not available, skipping integration test"); return; }
    };
    let payload = serde_json::to_vec(&serde_json::json!({
        "modelArtifactS3Key": "iris/a.tar.gz",
        "codeStorageS3Key": "iris/c.tar.gz",
        "modelPackageGroupName": "iris-it",
        "transformInstanceType": "ml.m5.large",
        "inferenceInstanceType": "ml.t2.medium"
    }))
    .unwrap();
    let reply = tokio::time::timeout(Duration::from_secs(5), client.request("modelops.registry.register", payload.into())).await.unwrap().unwrap();
    let body: serde_json::Value = serde_json::from_slice(&reply.payload).unwrap();
    assert_eq!(body["ok"], true);
    assert_eq!(body["result"]["group"], "iris-it");
}

#[cfg(feature = "integration")]
#[tokio::test]
async fn lifecycle_events_are_forwarded() {
    use futures::StreamExt;
    use std::time::Duration;
    let client = match async_nats::connect("127.0.0.1:4222").await {
        Ok(c) => c,
        Err(_) => { eprintln!("NATS not available, skipping integration test"); return; }
    };
    let mut events = client.subscribe("modelops.events.package_state_changed").await.unwrap();
    let payload = serde_json::to_vec(&serde_json::json!({
        "modelArtifactS3Key": "iris/a.tar.gz",
        "codeStorageS3Key": "iris/c.tar.gz",
        "modelPackageGroupName": "iris-events",
        "transformInstanceType": "ml.m5.large",
        "inferenceInstanceType": "ml.t2.medium"
    }))
    .unwrap();
    client.request("modelops.registry.register", payload.into()).await.unwrap();
    let msg = tokio::time::timeout(Duration::from_secs(5), events.next()).await.unwrap().unwrap();
    let body: serde_json::Value = serde_json::from_slice(&msg.payload).unwrap();
    assert_eq!(body["type"], "package_state_changed");
    assert_eq!(body["package"]["group"], "iris-events");
}
