use async_trait::async_trait;

use eno_domain::{
    Composition, Metadata, NamespacedName, ResourceSlice, ResourceSliceStatus,
};

use crate::error::ApiError;

/// Status-only view of a ResourceSlice. Informer caches prune slice spec
/// to bound memory, so anything that only needs existence + status must go
/// through this read; the full spec comes from [`UpstreamApi::get_slice`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SliceMeta {
    pub metadata: Metadata,
    pub status: ResourceSliceStatus,
}

impl SliceMeta {
    pub fn namespaced_name(&self) -> NamespacedName {
        self.metadata.namespaced_name()
    }
}

/// The upstream API server: Compositions and ResourceSlices. The engine
/// reads both and writes nothing but slice status.
#[async_trait]
pub trait UpstreamApi: Send + Sync + 'static {
    async fn get_composition(
        &self,
        name: &NamespacedName,
    ) -> Result<Option<Composition>, ApiError>;

    async fn list_compositions(&self) -> Result<Vec<Composition>, ApiError>;

    /// Abbreviated slice read: metadata and status only.
    async fn get_slice_meta(&self, name: &NamespacedName) -> Result<Option<SliceMeta>, ApiError>;

    /// Full slice read including spec, bypassing any pruning cache.
    async fn get_slice(&self, name: &NamespacedName) -> Result<Option<ResourceSlice>, ApiError>;

    /// Replace a slice's status under optimistic concurrency. A stale
    /// `resource_version` yields [`ApiError::Conflict`].
    async fn update_slice_status(
        &self,
        name: &NamespacedName,
        resource_version: &str,
        status: &ResourceSliceStatus,
    ) -> Result<(), ApiError>;
}
