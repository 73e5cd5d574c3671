pub mod discovery;
pub mod downstream;
pub mod error;
pub mod http;
pub mod kubeconfig;
pub mod local;
pub mod pacer;
pub mod upstream;

pub use discovery::{DiscoveryCache, OpenApiSchema, PatchStrategy};
pub use downstream::{plural, resource_path, DownstreamApi, ObjectMeta, PatchType};
pub use error::ApiError;
pub use http::{HttpDownstream, HttpUpstream, RestClient};
pub use kubeconfig::RestConfig;
pub use local::{InMemoryUpstream, LocalDownstream, StrategicKind};
pub use pacer::Pacer;
pub use upstream::{SliceMeta, UpstreamApi};
