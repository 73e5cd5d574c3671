pub mod annotations;
pub mod error;
pub mod readiness;
pub mod resource;
pub mod types;
pub mod upstream;

pub use error::DomainError;
pub use readiness::{aggregate_ready_times, ReadinessCheck, ReadyTime};
pub use resource::{Override, Resource, ResourcePatch};
pub use types::{Gvk, ManifestRef, NamespacedName, ResourceRef, SynthesisRef};
pub use upstream::{
    Composition, CompositionSpec, CompositionStatus, Manifest, Metadata, ResourceSlice,
    ResourceSliceSpec, ResourceSliceStatus, ResourceState, SliceRef, Synthesis,
};

/// Field-manager name recorded by server-side apply for every write this
/// engine performs.
pub const FIELD_MANAGER: &str = "eno";

/// API group/version of the engine's own CRDs.
pub const API_GROUP: &str = "eno.azure.io";
pub const API_VERSION: &str = "v1";
