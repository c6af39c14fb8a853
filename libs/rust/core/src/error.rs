//! Error taxonomy shared by the registry, endpoint controller and batch workflow.
//!
//! Precondition violations (`NotFound`, `InvalidTransition`, `NotApproved`,
//! `AlreadyExists`) fail fast and are never retried. Only the transient
//! compute/storage variants report `is_retryable`. Provisioning failures are
//! asynchronous and travel as `LifecycleEvent::ProvisioningFailed` instead.

use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind { PackageGroup, ModelPackage, Endpoint, TransformJob, Execution, Object, Model, EndpointConfig }

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceKind::PackageGroup => "model package group",
            ResourceKind::ModelPackage => "model package",
            ResourceKind::Endpoint => "endpoint",
            ResourceKind::TransformJob => "transform job",
            ResourceKind::Execution => "workflow execution",
            ResourceKind::Object => "object",
            ResourceKind::Model => "model",
            ResourceKind::EndpointConfig => "endpoint config",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("{kind} not found: {name}")]
    NotFound { kind: ResourceKind, name: String },

    #[error("invalid transition for {resource}: {from} -> {to}")]
    InvalidTransition { resource: String, from: String, to: String },

    #[error("model package {0} is not approved")]
    NotApproved(String),

    #[error("{kind} already exists: {name}")]
    AlreadyExists { kind: ResourceKind, name: String },

    #[error("registration failed: {0}")]
    Registration(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("compute layer unavailable: {0}")]
    ComputeUnavailable(String),

    #[error("compute request failed: {0}")]
    Compute(String),

    #[error("storage request failed: {0}")]
    Storage(String),

    #[error(transparent)]
    Config(#[from] config::ConfigError),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

pub type LifecycleResult<T> = Result<T, LifecycleError>;

impl LifecycleError {
    pub fn not_found(kind: ResourceKind, name: impl Into<String>) -> Self { Self::NotFound { kind, name: name.into() } }

    pub fn already_exists(kind: ResourceKind, name: impl Into<String>) -> Self { Self::AlreadyExists { kind, name: name.into() } }

    pub fn invalid_transition(resource: impl fmt::Display, from: impl fmt::Display, to: impl fmt::Display) -> Self {
        Self::InvalidTransition { resource: resource.to_string(), from: from.to_string(), to: to.to_string() }
    }

    /// Transient failures of an external collaborator. Safe to resubmit.
    pub fn is_retryable(&self) -> bool { matches!(self, Self::Compute(_) | Self::Storage(_)) }
}
