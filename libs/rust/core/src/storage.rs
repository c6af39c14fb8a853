//! Object storage seam. Keys are append-only: a `put` on an existing key fails.

use crate::error::{LifecycleError, LifecycleResult, ResourceKind};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectLocation {
    pub bucket: String,
    pub key: String,
}

impl ObjectLocation {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self { bucket: bucket.into(), key: key.into().trim_start_matches('/').to_string() }
    }

    /// Parse `s3://bucket/key`.
    pub fn parse(uri: &str) -> LifecycleResult<Self> {
        let rest = uri.strip_prefix("s3://").ok_or_else(|| LifecycleError::InvalidRequest(format!("not an s3 uri: {uri}")))?;
        let (bucket, key) = rest.split_once('/').unwrap_or((rest, ""));
        if bucket.is_empty() { return Err(LifecycleError::InvalidRequest(format!("missing bucket in {uri}"))); }
        Ok(Self::new(bucket, key))
    }

    pub fn join(&self, child: &str) -> Self {
        let child = child.trim_start_matches('/');
        if self.key.is_empty() { return Self::new(self.bucket.clone(), child); }
        Self::new(self.bucket.clone(), format!("{}/{}", self.key.trim_end_matches('/'), child))
    }

    /// Last path segment of the key.
    pub fn file_name(&self) -> &str { self.key.rsplit('/').next().unwrap_or(&self.key) }
}

impl fmt::Display for ObjectLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "s3://{}/{}", self.bucket, self.key) }
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, loc: &ObjectLocation) -> LifecycleResult<Vec<u8>>;
    /// Fails with `AlreadyExists` rather than overwrite.
    async fn put(&self, loc: &ObjectLocation, body: Vec<u8>) -> LifecycleResult<()>;
    async fn list(&self, bucket: &str, prefix: &str) -> LifecycleResult<Vec<ObjectLocation>>;
    async fn exists(&self, loc: &ObjectLocation) -> LifecycleResult<bool>;
}

#[derive(Default)]
pub struct InMemoryObjectStore {
    objects: RwLock<BTreeMap<ObjectLocation, Vec<u8>>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self { Self::default() }

    pub fn len(&self) -> usize { self.objects.read().len() }

    pub fn is_empty(&self) -> bool { self.objects.read().is_empty() }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn get(&self, loc: &ObjectLocation) -> LifecycleResult<Vec<u8>> {
        self.objects.read().get(loc).cloned().ok_or_else(|| LifecycleError::not_found(ResourceKind::Object, loc.to_string()))
    }

    async fn put(&self, loc: &ObjectLocation, body: Vec<u8>) -> LifecycleResult<()> {
        let mut objects = self.objects.write();
        if objects.contains_key(loc) { return Err(LifecycleError::already_exists(ResourceKind::Object, loc.to_string())); }
        objects.insert(loc.clone(), body);
        Ok(())
    }

    async fn list(&self, bucket: &str, prefix: &str) -> LifecycleResult<Vec<ObjectLocation>> {
        let prefix = prefix.trim_start_matches('/');
        Ok(self.objects.read().keys().filter(|l| l.bucket == bucket && l.key.starts_with(prefix)).cloned().collect())
    }

    async fn exists(&self, loc: &ObjectLocation) -> LifecycleResult<bool> { Ok(self.objects.read().contains_key(loc)) }
}
