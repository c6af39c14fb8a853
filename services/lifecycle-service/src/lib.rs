//! Event-driven runtime: NATS request handlers in, lifecycle events out.

use anyhow::Result;
use futures::StreamExt;
use modelops_core::{
    clear_ready, init_tracing, mark_not_live, mark_ready, start_health_server, BatchInferenceRequest, EndpointRef, InstanceSpec, LifecycleConfig,
    LifecycleResult, LifecycleSystem, ModelRegistrationRequest, PackageRef,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

pub const SERVICE: &str = "lifecycle-service";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision { Approve, Reject }

/// Manual approval gate payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalDecision {
    pub group: String,
    pub version: u64,
    pub decision: Decision,
}

pub fn handle_registration(sys: &LifecycleSystem, payload: &[u8]) -> LifecycleResult<serde_json::Value> {
    let req: ModelRegistrationRequest = serde_json::from_slice(payload)?;
    let package = sys.registration.register(&req)?;
    Ok(serde_json::to_value(package)?)
}

pub fn handle_approval(sys: &LifecycleSystem, payload: &[u8]) -> LifecycleResult<serde_json::Value> {
    let d: ApprovalDecision = serde_json::from_slice(payload)?;
    let package = PackageRef::new(d.group, d.version);
    match d.decision {
        Decision::Approve => sys.registry.approve(&package)?,
        Decision::Reject => sys.registry.reject(&package)?,
    }
    let status = sys.registry.package(&package)?.status;
    Ok(serde_json::json!({ "package": package, "status": status }))
}

pub fn handle_batch_trigger(sys: &LifecycleSystem, payload: &[u8]) -> LifecycleResult<serde_json::Value> {
    let req: BatchInferenceRequest = serde_json::from_slice(payload)?;
    let execution = sys.batch.trigger(req)?;
    Ok(serde_json::json!({ "executionName": execution }))
}

/// Create the group's endpoint from its latest approved package.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateEndpointRequest {
    pub model_package_group_name: String,
    pub instance_type: String,
    #[serde(default)]
    pub instance_count: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateMultiModelEndpointRequest {
    pub packages: Vec<PackageRef>,
    pub instance_type: String,
    #[serde(default)]
    pub instance_count: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvokeEndpointRequest {
    pub endpoint_name: String,
    #[serde(default)]
    pub target_model: Option<String>,
    pub body: String,
}

fn instance(sys: &LifecycleSystem, instance_type: String, count: Option<u32>) -> InstanceSpec {
    InstanceSpec::new(instance_type, count.unwrap_or(sys.cfg.default_instance_count))
}

pub async fn handle_endpoint_create(sys: &LifecycleSystem, payload: &[u8]) -> LifecycleResult<serde_json::Value> {
    let req: CreateEndpointRequest = serde_json::from_slice(payload)?;
    let spec = instance(sys, req.instance_type, req.instance_count);
    let endpoint = sys.endpoints.create_endpoint_for_group(&req.model_package_group_name, &spec).await?;
    Ok(serde_json::json!({ "endpointName": endpoint.name }))
}

pub async fn handle_endpoint_create_multi_model(sys: &LifecycleSystem, payload: &[u8]) -> LifecycleResult<serde_json::Value> {
    let req: CreateMultiModelEndpointRequest = serde_json::from_slice(payload)?;
    let spec = instance(sys, req.instance_type, req.instance_count);
    let endpoint = sys.endpoints.create_multi_model_endpoint(&req.packages, &spec).await?;
    Ok(serde_json::json!({ "endpointName": endpoint.name }))
}

/// Replies with the endpoint's response, as JSON when it parses.
pub async fn handle_endpoint_invoke(sys: &LifecycleSystem, payload: &[u8]) -> LifecycleResult<serde_json::Value> {
    let req: InvokeEndpointRequest = serde_json::from_slice(payload)?;
    let endpoint = EndpointRef::new(req.endpoint_name);
    let bytes = sys.endpoints.invoke_endpoint(&endpoint, req.body.into_bytes(), req.target_model.as_deref()).await?;
    Ok(serde_json::from_slice(&bytes).unwrap_or_else(|_| serde_json::Value::String(String::from_utf8_lossy(&bytes).into_owned())))
}

fn reply_body(result: LifecycleResult<serde_json::Value>) -> serde_json::Value {
    match result {
        Ok(v) => serde_json::json!({ "ok": true, "result": v }),
        Err(e) => serde_json::json!({ "ok": false, "error": e.to_string() }),
    }
}

async fn publish_json<T: Serialize>(nc: &async_nats::Client, subject: async_nats::Subject, value: &T) {
    match serde_json::to_vec(value) {
        Ok(bytes) => {
            if let Err(e) = nc.publish(subject.clone(), bytes.into()).await { warn!(error = %e, %subject, "publish_failed"); }
        }
        Err(e) => warn!(error=?e, %subject, "serialize_error"),
    }
}

async fn serve_requests<F, Fut>(nc: async_nats::Client, subject: String, handler: F)
where
    F: Fn(Vec<u8>) -> Fut + Send + 'static,
    Fut: Future<Output = LifecycleResult<serde_json::Value>> + Send,
{
    let mut sub = match nc.subscribe(subject.clone()).await { Ok(s) => s, Err(e) => { warn!(error=?e, %subject, "subscribe_failed"); return; } };
    info!(%subject, "handler_subscribed");
    while let Some(msg) = sub.next().await {
        let result = handler(msg.payload.to_vec()).await;
        if let Err(e) = &result { warn!(%subject, error = %e, "request_rejected"); }
        let Some(reply) = msg.reply else { continue };
        publish_json(&nc, reply, &reply_body(result)).await;
    }
    debug!(%subject, "handler_stopped");
}

/// Republish every lifecycle event as JSON on `<prefix>.<kind>`.
async fn forward_events(nc: async_nats::Client, sys: Arc<LifecycleSystem>) {
    let mut rx = sys.events.subscribe();
    let prefix = sys.cfg.subjects.events_prefix.clone();
    loop {
        match rx.recv().await {
            Ok(event) => publish_json(&nc, format!("{prefix}.{}", event.kind()).into(), &event).await,
            Err(RecvError::Lagged(missed)) => warn!(missed, "event_forwarder_lagged"),
            Err(RecvError::Closed) => break,
        }
    }
}

fn spawn_bridge(nc: async_nats::Client, sys: Arc<LifecycleSystem>) {
    let subjects = sys.cfg.subjects.clone();
    let s = sys.clone();
    tokio::spawn(serve_requests(nc.clone(), subjects.registration, move |p| { let s = s.clone(); async move { handle_registration(&s, &p) } }));
    let s = sys.clone();
    tokio::spawn(serve_requests(nc.clone(), subjects.approval, move |p| { let s = s.clone(); async move { handle_approval(&s, &p) } }));
    let s = sys.clone();
    tokio::spawn(serve_requests(nc.clone(), subjects.batch_trigger, move |p| { let s = s.clone(); async move { handle_batch_trigger(&s, &p) } }));
    let s = sys.clone();
    tokio::spawn(serve_requests(nc.clone(), subjects.endpoint_create, move |p| { let s = s.clone(); async move { handle_endpoint_create(&s, &p).await } }));
    let s = sys.clone();
    tokio::spawn(serve_requests(nc.clone(), subjects.endpoint_create_multi_model, move |p| {
        let s = s.clone();
        async move { handle_endpoint_create_multi_model(&s, &p).await }
    }));
    let s = sys.clone();
    tokio::spawn(serve_requests(nc.clone(), subjects.endpoint_invoke, move |p| { let s = s.clone(); async move { handle_endpoint_invoke(&s, &p).await } }));
    tokio::spawn(forward_events(nc, sys));
}

fn run_once() -> bool { std::env::var("MODELOPS_RUN_ONCE").map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(false) }

pub async fn run() -> Result<()> {
    init_tracing(SERVICE)?;
    let cfg = LifecycleConfig::load()?;
    let sys = Arc::new(LifecycleSystem::in_memory(cfg)?);
    let addr = start_health_server(sys.cfg.health_port).await?;
    let convergence = sys.spawn_convergence();
    info!(target: "lifecycle-service", nats_url = %sys.cfg.nats_url, health = %addr, "Starting lifecycle-service");

    match async_nats::connect(sys.cfg.nats_url.as_str()).await {
        Ok(nc) => {
            info!(target: "lifecycle-service", "Connected to NATS");
            spawn_bridge(nc, sys.clone());
        }
        Err(e) => warn!(target: "lifecycle-service", error = %e, "NATS unavailable - running degraded mode"),
    }
    mark_ready();

    if run_once() {
        convergence.abort();
        clear_ready();
        return Ok(());
    }
    tokio::signal::ctrl_c().await?;
    info!("shutdown_signal_received");
    clear_ready();
    mark_not_live();
    convergence.abort();
    Ok(())
}
