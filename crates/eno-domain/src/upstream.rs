use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::annotations;
use crate::types::{NamespacedName, SynthesisRef};

// ── Object metadata ───────────────────────────────────────────────────────────

/// The subset of Kubernetes object metadata the engine reads.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Metadata {
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation: Option<i64>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

impl Metadata {
    pub fn namespaced_name(&self) -> NamespacedName {
        NamespacedName::new(self.namespace.clone(), self.name.clone())
    }
}

// ── Composition ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Composition {
    pub metadata: Metadata,
    pub spec: CompositionSpec,
    pub status: CompositionStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CompositionSpec {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub synthesizer: String,
    pub suspend: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CompositionStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_synthesis: Option<Synthesis>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_synthesis: Option<Synthesis>,
}

impl Composition {
    pub fn namespaced_name(&self) -> NamespacedName {
        self.metadata.namespaced_name()
    }

    pub fn suspended(&self) -> bool {
        self.spec.suspend
    }

    pub fn deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Composition-level deletion strategy: `orphan` means downstream
    /// objects are released, not deleted, when the composition goes away.
    pub fn orphans_on_deletion(&self) -> bool {
        self.metadata
            .annotations
            .get(annotations::DELETION_STRATEGY)
            .map(|v| v == "orphan")
            .unwrap_or(false)
    }

    /// Composition-level fail-open default, overridable per resource.
    pub fn fail_open_default(&self) -> bool {
        self.metadata
            .annotations
            .get(annotations::FAIL_OPEN)
            .map(|v| v == "true")
            .unwrap_or(false)
    }

    pub fn current_synthesis_ref(&self) -> Option<SynthesisRef> {
        self.status.current_synthesis.as_ref().map(|s| SynthesisRef {
            composition: self.namespaced_name(),
            uuid: s.uuid,
        })
    }

    pub fn previous_synthesis_ref(&self) -> Option<SynthesisRef> {
        self.status.previous_synthesis.as_ref().map(|s| SynthesisRef {
            composition: self.namespaced_name(),
            uuid: s.uuid,
        })
    }
}

/// One synthesis run recorded in composition status. Immutable once its
/// slice list is populated: the engine treats `(composition, uuid)` as a
/// snapshot identity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Synthesis {
    pub uuid: Uuid,
    pub observed_composition_generation: i64,
    pub observed_synthesizer_generation: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub synthesized: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ready: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconciled: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub resource_slices: Vec<SliceRef>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SliceRef {
    pub name: String,
}

// ── ResourceSlice ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceSlice {
    pub metadata: Metadata,
    pub spec: ResourceSliceSpec,
    pub status: ResourceSliceStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceSliceSpec {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<Manifest>,
}

/// One desired resource: a JSON-serialized Kubernetes object plus a flag
/// marking it for deletion.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Manifest {
    pub manifest: String,
    pub deleted: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceSliceStatus {
    /// Parallel to `spec.resources`; indices identify resources.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<ResourceState>,
}

impl ResourceSlice {
    /// The recorded state for one index, if status has been written yet.
    pub fn resource_state(&self, index: usize) -> Option<&ResourceState> {
        self.status.resources.get(index)
    }
}

/// Per-resource reconciliation state stored in slice status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ready: Option<DateTime<Utc>>,
    pub reconciled: bool,
    pub deleted: bool,
}
