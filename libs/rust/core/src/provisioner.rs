//! Execution Environment Provisioner: capability set in, scoped identity out.
//!
//! Every identity carries the fixed baseline (logs, metrics, network attachment,
//! image pull) plus exactly the storage grants of its own request. Nothing is
//! cached or merged across calls.

use crate::error::{LifecycleError, LifecycleResult};
use crate::storage::ObjectLocation;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AccessMode { Read, ReadWrite }

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StorageScope {
    pub bucket: String,
    pub prefix: Option<String>,
}

impl StorageScope {
    pub fn bucket(bucket: impl Into<String>) -> Self { Self { bucket: bucket.into(), prefix: None } }

    pub fn prefix(bucket: impl Into<String>, prefix: impl Into<String>) -> Self { Self { bucket: bucket.into(), prefix: Some(prefix.into()) } }

    /// Scope covering exactly one object key.
    pub fn object(loc: &ObjectLocation) -> Self { Self::prefix(loc.bucket.clone(), loc.key.clone()) }

    pub fn contains(&self, loc: &ObjectLocation) -> bool {
        self.bucket == loc.bucket && self.prefix.as_deref().map_or(true, |p| loc.key.starts_with(p))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageGrant {
    pub scope: StorageScope,
    pub mode: AccessMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Capability { LogEmission, MetricEmission, NetworkAttachment, ImagePull }

pub const BASELINE_CAPABILITIES: [Capability; 4] = [Capability::LogEmission, Capability::MetricEmission, Capability::NetworkAttachment, Capability::ImagePull];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityRequest {
    pub purpose: String,
    pub grants: Vec<StorageGrant>,
}

impl IdentityRequest {
    pub fn new(purpose: impl Into<String>) -> Self { Self { purpose: purpose.into(), grants: Vec::new() } }

    pub fn read(mut self, scope: StorageScope) -> Self { self.grants.push(StorageGrant { scope, mode: AccessMode::Read }); self }

    pub fn read_write(mut self, scope: StorageScope) -> Self { self.grants.push(StorageGrant { scope, mode: AccessMode::ReadWrite }); self }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionIdentity {
    pub id: String,
    pub purpose: String,
    pub region: String,
    pub baseline: Vec<Capability>,
    pub grants: Vec<StorageGrant>,
    pub issued_at: DateTime<Utc>,
}

impl ExecutionIdentity {
    pub fn permits(&self, loc: &ObjectLocation, mode: AccessMode) -> bool {
        self.grants.iter().any(|g| g.mode >= mode && g.scope.contains(loc))
    }

    pub fn has(&self, cap: Capability) -> bool { self.baseline.contains(&cap) }
}

#[async_trait]
pub trait ExecutionEnvironmentProvisioner: Send + Sync {
    async fn provision(&self, request: IdentityRequest) -> LifecycleResult<ExecutionIdentity>;
}

/// Issues identities locally. Stands in for the IAM-style role service.
pub struct ScopedProvisioner {
    region: String,
    issued: AtomicU64,
}

impl ScopedProvisioner {
    pub fn new(region: impl Into<String>) -> Self { Self { region: region.into(), issued: AtomicU64::new(0) } }

    pub fn issued(&self) -> u64 { self.issued.load(Ordering::SeqCst) }
}

#[async_trait]
impl ExecutionEnvironmentProvisioner for ScopedProvisioner {
    async fn provision(&self, request: IdentityRequest) -> LifecycleResult<ExecutionIdentity> {
        if request.purpose.trim().is_empty() { return Err(LifecycleError::InvalidRequest("identity purpose must be set".into())); }
        // strongest explicitly requested mode per scope
        let mut scopes: BTreeMap<StorageScope, AccessMode> = BTreeMap::new();
        for g in request.grants {
            if g.scope.bucket.is_empty() { return Err(LifecycleError::InvalidRequest("storage grant without bucket".into())); }
            let mode = scopes.entry(g.scope).or_insert(g.mode);
            if g.mode > *mode { *mode = g.mode; }
        }
        let grants: Vec<StorageGrant> = scopes.into_iter().map(|(scope, mode)| StorageGrant { scope, mode }).collect();
        self.issued.fetch_add(1, Ordering::SeqCst);
        let identity = ExecutionIdentity {
            id: format!("{}-exec-{}", request.purpose, Uuid::new_v4()),
            purpose: request.purpose,
            region: self.region.clone(),
            baseline: BASELINE_CAPABILITIES.to_vec(),
            grants,
            issued_at: Utc::now(),
        };
        debug!(identity = %identity.id, grants = identity.grants.len(), "execution_identity_issued");
        Ok(identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn read_grant_never_allows_write() {
        let p = ScopedProvisioner::new("eu");
        let artifact = ObjectLocation::new("model-artifacts", "iris/a.tar.gz");
        let id = p.provision(IdentityRequest::new("iris").read(StorageScope::object(&artifact))).await.unwrap();
        assert!(id.permits(&artifact, AccessMode::Read));
        assert!(!id.permits(&artifact, AccessMode::ReadWrite));
        assert!(!id.permits(&ObjectLocation::new("model-artifacts", "other/b.tar.gz"), AccessMode::Read));
        assert!(id.has(Capability::ImagePull) && id.has(Capability::NetworkAttachment));
    }

    #[tokio::test]
    async fn duplicate_scopes_collapse_to_strongest() {
        let p = ScopedProvisioner::new("eu");
        let scope = StorageScope::prefix("inference", "output/run-1/");
        let id = p.provision(IdentityRequest::new("batch").read(scope.clone()).read_write(scope.clone()).read(StorageScope::bucket("code"))).await.unwrap();
        assert_eq!(id.grants.len(), 2);
        assert!(id.permits(&ObjectLocation::new("inference", "output/run-1/x.out"), AccessMode::ReadWrite));
        assert!(!id.permits(&ObjectLocation::new("code", "c.tar.gz"), AccessMode::ReadWrite));
    }

    #[tokio::test]
    async fn each_call_yields_fresh_identity() {
        let p = ScopedProvisioner::new("eu");
        let a = p.provision(IdentityRequest::new("x").read(StorageScope::bucket("one"))).await.unwrap();
        let b = p.provision(IdentityRequest::new("x").read(StorageScope::bucket("two"))).await.unwrap();
        assert_ne!(a.id, b.id);
        assert!(!b.permits(&ObjectLocation::new("one", "k"), AccessMode::Read));
        assert_eq!(p.issued(), 2);
    }
}
