//! Lifecycle configuration: defaults, optional file, then `MODELOPS__*` environment overrides.
//!
//! The struct is built once and handed to each component as `Arc<LifecycleConfig>`.

use crate::error::{LifecycleError, LifecycleResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputeConfig {
    pub submit_retries: usize,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub breaker_failure_threshold: usize,
    pub breaker_open_secs: u64,
}

impl Default for ComputeConfig {
    fn default() -> Self { Self { submit_retries: 2, retry_base_delay_ms: 100, retry_max_delay_ms: 2_000, breaker_failure_threshold: 5, breaker_open_secs: 30 } }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubjectConfig {
    pub registration: String,
    pub approval: String,
    pub batch_trigger: String,
    pub endpoint_create: String,
    pub endpoint_create_multi_model: String,
    pub endpoint_invoke: String,
    pub events_prefix: String,
}

impl Default for SubjectConfig {
    fn default() -> Self {
        Self {
            registration: "modelops.registry.register".into(),
            approval: "modelops.registry.decision".into(),
            batch_trigger: "modelops.batch.trigger".into(),
            endpoint_create: "modelops.endpoint.create".into(),
            endpoint_create_multi_model: "modelops.endpoint.create_multi_model".into(),
            endpoint_invoke: "modelops.endpoint.invoke".into(),
            events_prefix: "modelops.events".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    pub service_name: String,
    pub region: String,
    pub model_artifact_bucket: String,
    pub code_storage_bucket: String,
    pub inference_bucket: String,
    pub inference_image: String,
    pub default_instance_count: u32,
    pub workflow_timeout_secs: u64,
    pub transform_poll_interval_ms: u64,
    pub health_port: u16,
    pub nats_url: String,
    pub compute: ComputeConfig,
    pub subjects: SubjectConfig,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            service_name: "lifecycle-service".into(),
            region: "ap-northeast-2".into(),
            model_artifact_bucket: "model-artifacts".into(),
            code_storage_bucket: "code-storage".into(),
            inference_bucket: "inference".into(),
            inference_image: "366743142698.dkr.ecr.ap-northeast-2.amazonaws.com/sagemaker-scikit-learn:1.2-1-cpu-py3".into(),
            default_instance_count: 1,
            workflow_timeout_secs: 30 * 60,
            transform_poll_interval_ms: 5_000,
            health_port: 9095,
            nats_url: "127.0.0.1:4222".into(),
            compute: ComputeConfig::default(),
            subjects: SubjectConfig::default(),
        }
    }
}

impl LifecycleConfig {
    /// Layer defaults, `MODELOPS_CONFIG_FILE` (if set) and `MODELOPS__` env vars.
    pub fn load() -> LifecycleResult<Self> {
        let mut builder = config::Config::builder().add_source(config::Config::try_from(&Self::default())?);
        if let Ok(file) = std::env::var("MODELOPS_CONFIG_FILE") {
            builder = builder.add_source(config::File::with_name(&file).required(false));
        }
        builder = builder.add_source(config::Environment::with_prefix("MODELOPS").separator("__").try_parsing(true));
        let cfg: Self = builder.build()?.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> LifecycleResult<()> {
        for (field, value) in [("model_artifact_bucket", &self.model_artifact_bucket), ("code_storage_bucket", &self.code_storage_bucket), ("inference_bucket", &self.inference_bucket)] {
            if value.trim().is_empty() { return Err(LifecycleError::InvalidRequest(format!("{field} must be set"))); }
        }
        if self.workflow_timeout_secs == 0 { return Err(LifecycleError::InvalidRequest("workflow_timeout_secs must be positive".into())); }
        if self.default_instance_count == 0 { return Err(LifecycleError::InvalidRequest("default_instance_count must be positive".into())); }
        Ok(())
    }

    pub fn workflow_timeout(&self) -> Duration { Duration::from_secs(self.workflow_timeout_secs) }

    pub fn transform_poll_interval(&self) -> Duration { Duration::from_millis(self.transform_poll_interval_ms.max(1)) }
}
