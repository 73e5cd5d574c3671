use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use eno_domain::{Gvk, ResourceRef};

use crate::error::ApiError;

/// Content type selected for a PATCH against the downstream server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchType {
    StrategicMerge,
    Merge,
    Json,
}

impl PatchType {
    pub fn content_type(&self) -> &'static str {
        match self {
            PatchType::StrategicMerge => "application/strategic-merge-patch+json",
            PatchType::Merge => "application/merge-patch+json",
            PatchType::Json => "application/json-patch+json",
        }
    }
}

/// The metadata-only view used by the resourceVersion fast path.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectMeta {
    pub resource_version: Option<String>,
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

impl ObjectMeta {
    pub fn from_object(obj: &Value) -> Self {
        ObjectMeta {
            resource_version: obj
                .pointer("/metadata/resourceVersion")
                .and_then(Value::as_str)
                .map(str::to_string),
            deletion_timestamp: obj
                .pointer("/metadata/deletionTimestamp")
                .and_then(Value::as_str)
                .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
                .map(|t| t.with_timezone(&Utc)),
        }
    }

    pub fn deleting(&self) -> bool {
        self.deletion_timestamp.is_some()
    }
}

/// The downstream API server: the cluster this engine drives toward the
/// desired state. Objects are shared with arbitrary other writers, so all
/// mutations go through apply or computed patches — never a blind PUT
/// except under the explicit replace annotation.
#[async_trait]
pub trait DownstreamApi: Send + Sync + 'static {
    async fn get(&self, gvk: &Gvk, target: &ResourceRef) -> Result<Option<Value>, ApiError>;

    /// Metadata-only read; cheaper than `get` for the fast path.
    async fn get_metadata(
        &self,
        gvk: &Gvk,
        target: &ResourceRef,
    ) -> Result<Option<ObjectMeta>, ApiError>;

    async fn create(&self, gvk: &Gvk, obj: &Value) -> Result<Value, ApiError>;

    /// Server-side apply. `force` takes contested fields from other apply
    /// managers.
    async fn apply(
        &self,
        gvk: &Gvk,
        target: &ResourceRef,
        obj: &Value,
        force: bool,
    ) -> Result<Value, ApiError>;

    async fn patch(
        &self,
        gvk: &Gvk,
        target: &ResourceRef,
        patch_type: PatchType,
        body: &Value,
    ) -> Result<Value, ApiError>;

    /// Full replacement (PUT); only reached via the replace annotation.
    async fn replace(
        &self,
        gvk: &Gvk,
        target: &ResourceRef,
        obj: &Value,
    ) -> Result<Value, ApiError>;

    /// Delete. An already-gone target is success.
    async fn delete(&self, gvk: &Gvk, target: &ResourceRef) -> Result<(), ApiError>;

    /// Overwrite `metadata.managedFields`; the update-manager migration
    /// path rewrites entries directly.
    async fn update_managed_fields(
        &self,
        gvk: &Gvk,
        target: &ResourceRef,
        managed_fields: &Value,
    ) -> Result<(), ApiError>;

    /// The server's OpenAPI v2 document, feeding the discovery cache.
    async fn fetch_openapi(&self) -> Result<Value, ApiError>;
}

/// Derive the REST resource name (lowercase plural) for a kind. Covers the
/// regular English cases; kinds with irregular plurals are not reconciled
/// by this engine's own CRD set.
pub fn plural(kind: &str) -> String {
    let lower = kind.to_ascii_lowercase();
    if lower.ends_with('s')
        || lower.ends_with('x')
        || lower.ends_with('z')
        || lower.ends_with("ch")
        || lower.ends_with("sh")
    {
        format!("{}es", lower)
    } else if lower.ends_with('y')
        && !lower
            .chars()
            .rev()
            .nth(1)
            .map_or(false, |c| "aeiou".contains(c))
    {
        format!("{}ies", &lower[..lower.len() - 1])
    } else {
        format!("{}s", lower)
    }
}

/// REST path for a resource or collection.
pub fn resource_path(gvk: &Gvk, namespace: &str, name: Option<&str>) -> String {
    let mut path = if gvk.group.is_empty() {
        format!("/api/{}", gvk.version)
    } else {
        format!("/apis/{}/{}", gvk.group, gvk.version)
    };
    if !namespace.is_empty() {
        path.push_str("/namespaces/");
        path.push_str(namespace);
    }
    path.push('/');
    path.push_str(&plural(&gvk.kind));
    if let Some(name) = name {
        path.push('/');
        path.push_str(name);
    }
    path
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn plurals() {
        assert_eq!(plural("ConfigMap"), "configmaps");
        assert_eq!(plural("Ingress"), "ingresses");
        assert_eq!(plural("NetworkPolicy"), "networkpolicies");
        assert_eq!(plural("Gateway"), "gateways");
        assert_eq!(plural("Deployment"), "deployments");
    }

    #[test]
    fn paths() {
        let cm = Gvk::new("", "v1", "ConfigMap");
        assert_eq!(
            resource_path(&cm, "apps", Some("cm")),
            "/api/v1/namespaces/apps/configmaps/cm"
        );
        let deploy = Gvk::new("apps", "v1", "Deployment");
        assert_eq!(
            resource_path(&deploy, "apps", None),
            "/apis/apps/v1/namespaces/apps/deployments"
        );
        let crd = Gvk::new("apiextensions.k8s.io", "v1", "CustomResourceDefinition");
        assert_eq!(
            resource_path(&crd, "", Some("widgets.example.com")),
            "/apis/apiextensions.k8s.io/v1/customresourcedefinitions/widgets.example.com"
        );
    }

    #[test]
    fn object_meta_extraction() {
        let obj = json!({"metadata": {
            "resourceVersion": "42",
            "deletionTimestamp": "2024-04-01T10:00:00Z",
        }});
        let meta = ObjectMeta::from_object(&obj);
        assert_eq!(meta.resource_version.as_deref(), Some("42"));
        assert!(meta.deleting());

        let meta = ObjectMeta::from_object(&json!({"metadata": {}}));
        assert!(!meta.deleting());
        assert!(meta.resource_version.is_none());
    }
}
