//! Lifecycle metric groups, registered in a dedicated Prometheus registry.
//!
//! Exposed on `/metrics` by the health server.

use once_cell::sync::Lazy;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry};

pub struct RegistryMetrics {
    pub packages_registered_total: IntCounterVec,
    pub approval_transitions_total: IntCounterVec,
}

pub struct EndpointMetrics {
    pub submissions_total: IntCounterVec,
    pub stale_updates_total: IntCounter,
}

pub struct WorkflowMetrics {
    pub finished_total: IntCounterVec,
    pub duration_seconds: Histogram,
}

pub struct ComputeMetrics {
    pub retries_total: IntCounter,
    pub breaker_open_total: IntCounter,
}

pub struct LifecycleMetrics {
    pub registry: RegistryMetrics,
    pub endpoint: EndpointMetrics,
    pub workflow: WorkflowMetrics,
    pub compute: ComputeMetrics,
}

impl LifecycleMetrics {
    pub fn register(reg: &Registry) -> prometheus::Result<Self> {
        let packages_registered_total = IntCounterVec::new(Opts::new("modelops_packages_registered_total", "Model package versions appended"), &["group"])?;
        let approval_transitions_total = IntCounterVec::new(Opts::new("modelops_approval_transitions_total", "Package approval status transitions"), &["status"])?;
        let submissions_total = IntCounterVec::new(Opts::new("modelops_endpoint_submissions_total", "Endpoint create/update submissions"), &["operation", "outcome"])?;
        let stale_updates_total = IntCounter::new("modelops_endpoint_stale_updates_total", "Updates skipped because a newer version is bound")?;
        let finished_total = IntCounterVec::new(Opts::new("modelops_workflows_finished_total", "Batch workflows reaching a terminal state"), &["phase"])?;
        let duration_seconds = Histogram::with_opts(
            HistogramOpts::new("modelops_workflow_duration_seconds", "Batch workflow wall time")
                .buckets(vec![1.0, 10.0, 60.0, 300.0, 900.0, 1800.0, 3600.0]),
        )?;
        let retries_total = IntCounter::new("modelops_compute_retries_total", "Compute submissions retried")?;
        let breaker_open_total = IntCounter::new("modelops_compute_breaker_open_total", "Compute circuit breaker openings")?;

        reg.register(Box::new(packages_registered_total.clone()))?;
        reg.register(Box::new(approval_transitions_total.clone()))?;
        reg.register(Box::new(submissions_total.clone()))?;
        reg.register(Box::new(stale_updates_total.clone()))?;
        reg.register(Box::new(finished_total.clone()))?;
        reg.register(Box::new(duration_seconds.clone()))?;
        reg.register(Box::new(retries_total.clone()))?;
        reg.register(Box::new(breaker_open_total.clone()))?;

        Ok(Self {
            registry: RegistryMetrics { packages_registered_total, approval_transitions_total },
            endpoint: EndpointMetrics { submissions_total, stale_updates_total },
            workflow: WorkflowMetrics { finished_total, duration_seconds },
            compute: ComputeMetrics { retries_total, breaker_open_total },
        })
    }
}

pub static METRICS_REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static LIFECYCLE_METRICS: Lazy<LifecycleMetrics> =
    Lazy::new(|| LifecycleMetrics::register(&METRICS_REGISTRY).expect("lifecycle metrics registered once into a fresh registry"));

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_into_fresh_registry() {
        let reg = Registry::new();
        let m = LifecycleMetrics::register(&reg).unwrap();
        m.endpoint.submissions_total.with_label_values(&["create", "ok"]).inc();
        assert!(reg.gather().iter().any(|f| f.get_name() == "modelops_endpoint_submissions_total"));
        assert!(LifecycleMetrics::register(&reg).is_err());
    }
}
