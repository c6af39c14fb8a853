//! Core lifecycle library for ModelOps services: model registry, endpoint
//! convergence, batch inference and the process-level telemetry they share.

use anyhow::Result;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::{routing::get, Router};
use once_cell::sync::OnceCell;
use prometheus::{Encoder, TextEncoder};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;
use tracing_subscriber::prelude::*;

static TRACING_INIT: OnceCell<()> = OnceCell::new();
static NODE_LIVENESS: AtomicBool = AtomicBool::new(true);
static NODE_READINESS: AtomicBool = AtomicBool::new(false);

pub fn mark_ready() { NODE_READINESS.store(true, Ordering::SeqCst); }
pub fn clear_ready() { NODE_READINESS.store(false, Ordering::SeqCst); }
pub fn mark_not_live() { NODE_LIVENESS.store(false, Ordering::SeqCst); }
pub fn is_ready() -> bool { NODE_READINESS.load(Ordering::SeqCst) }
pub fn is_live() -> bool { NODE_LIVENESS.load(Ordering::SeqCst) }

/// Install the global subscriber once. `MODELOPS_JSON_LOG=1|true` switches to JSON lines.
pub fn init_tracing(service: &str) -> Result<()> {
    TRACING_INIT.get_or_try_init(|| {
        let json = std::env::var("MODELOPS_JSON_LOG").ok().map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(false);
        let json_layer = json.then(|| {
            tracing_subscriber::fmt::layer()
                .json()
                .flatten_event(true)
                .with_current_span(true)
                .with_span_list(false)
        });
        let text_layer = (!json).then(|| {
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_line_number(true)
        });
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        tracing_subscriber::registry().with(env_filter).with(json_layer).with(text_layer).try_init()?;
        Ok::<(), anyhow::Error>(())
    })?;
    info!(target: "modelops", service, "tracing initialized");
    Ok(())
}

/// Serve `/live`, `/ready`, `/status` and `/metrics`. Returns the bound address
/// (port 0 picks a free one).
pub async fn start_health_server(port: u16) -> Result<SocketAddr> {
    let app = Router::new()
        .route("/live", get(|| async { axum::Json(serde_json::json!({"live": NODE_LIVENESS.load(Ordering::SeqCst)})) }))
        .route("/ready", get(|| async { axum::Json(serde_json::json!({"ready": NODE_READINESS.load(Ordering::SeqCst)})) }))
        .route("/status", get(|| async {
            axum::Json(serde_json::json!({
                "live": NODE_LIVENESS.load(Ordering::SeqCst),
                "ready": NODE_READINESS.load(Ordering::SeqCst),
                "version": env!("CARGO_PKG_VERSION"),
            }))
        }))
        .route("/metrics", get(metrics_handler));
    let listener = tokio::net::TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], port))).await?;
    let addr = listener.local_addr()?;
    tracing::info!(?addr, "Health server listening");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error=?e, "Health server failed");
        }
    });
    Ok(addr)
}

async fn metrics_handler() -> axum::response::Response {
    once_cell::sync::Lazy::force(&metrics::LIFECYCLE_METRICS);
    let families = metrics::METRICS_REGISTRY.gather();
    let mut buf = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&families, &mut buf) {
        return (StatusCode::INTERNAL_SERVER_ERROR, format!("encode error: {e}")).into_response();
    }
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], buf).into_response()
}

pub mod batch;
pub mod compute;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod metrics;
pub mod model_registry;
pub mod provisioner;
pub mod resilience;
pub mod storage;
pub mod system;

pub use batch::{BatchInferenceRequest, BatchInferenceWorkflow, OutputCollector, PostProcessor, WorkflowContext, WorkflowExecution};
pub use compute::{ComputeClient, InMemoryCompute, TransformJobState, TransformScript};
pub use crate::config::LifecycleConfig;
pub use endpoint::{decide_update, EndpointController, EndpointKind, EndpointRef, InstanceSpec, ServingEndpoint, UpdateOutcome};
pub use error::{LifecycleError, LifecycleResult, ResourceKind};
pub use events::{EventBus, LifecycleEvent};
pub use lifecycle::{WorkflowFailure, WorkflowPhase, WorkflowStep};
pub use model_registry::{ApprovalStatus, ModelPackage, ModelRegistration, ModelRegistrationRequest, ModelRegistry, PackageRef, PackageSpec, SupportedTypes};
pub use provisioner::{AccessMode, ExecutionEnvironmentProvisioner, ExecutionIdentity, IdentityRequest, ScopedProvisioner, StorageScope};
pub use resilience::{retry_if, BreakerState, CircuitBreaker, ResilientCompute, RetryConfig};
pub use storage::{InMemoryObjectStore, ObjectLocation, ObjectStore};
pub use system::LifecycleSystem;
