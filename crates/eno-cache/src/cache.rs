use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, RwLock};

use tracing::{debug, warn};
use uuid::Uuid;

use eno_domain::{
    ManifestRef, NamespacedName, Resource, ResourceRef, ResourceSlice, Synthesis, SynthesisRef,
};
use eno_queue::Queue;

/// One unit of reconciliation work: a single resource of a single
/// composition.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Request {
    pub composition: NamespacedName,
    pub manifest_ref: ManifestRef,
}

impl std::fmt::Display for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.composition, self.manifest_ref)
    }
}

/// One synthesis UUID's reconstituted resources. Immutable after
/// publication; readers clone the `Arc` and work lock-free.
struct SynthesisState {
    resources: HashMap<ManifestRef, Arc<Resource>>,
    /// Slice names change across syntheses; prior-version lookups go by
    /// downstream identity.
    by_resource_ref: HashMap<ResourceRef, ManifestRef>,
    by_readiness_group: BTreeMap<i64, Vec<ManifestRef>>,
    slices: HashSet<NamespacedName>,
}

#[derive(Default)]
struct CompositionEntry {
    syntheses: HashMap<Uuid, Arc<SynthesisState>>,
}

/// Per-composition, version-indexed store of desired resources. Holds at
/// most the current and previous synthesis per composition; superseded
/// UUIDs are purged and any queue item still referencing them is dropped
/// by the reconciler's cache-miss path.
#[derive(Default)]
pub struct ReconstitutionCache {
    inner: RwLock<HashMap<NamespacedName, CompositionEntry>>,
}

impl ReconstitutionCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<NamespacedName, CompositionEntry>> {
        match self.inner.read() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<NamespacedName, CompositionEntry>> {
        match self.inner.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Whether `synthesis` is already populated for every slice it lists.
    /// Cheap; safe to call on every composition reconcile.
    pub fn visit(&self, composition: &NamespacedName, synthesis: &Synthesis) -> bool {
        let guard = self.read();
        let state = match guard
            .get(composition)
            .and_then(|e| e.syntheses.get(&synthesis.uuid))
        {
            Some(s) => s,
            None => return false,
        };
        synthesis
            .resource_slices
            .iter()
            .all(|s| state.slices.contains(&NamespacedName::new(
                composition.namespace.clone(),
                s.name.clone(),
            )))
    }

    /// Parse `slices` into Resources, publish them under the synthesis
    /// UUID, and enqueue one request per resource. Malformed manifests are
    /// logged and skipped — they terminate that work item only.
    pub fn fill(
        &self,
        composition: &NamespacedName,
        synthesis: &Synthesis,
        slices: &[ResourceSlice],
        queue: &Queue<Request>,
    ) {
        let mut resources = HashMap::new();
        let mut by_resource_ref = HashMap::new();
        let mut by_readiness_group: BTreeMap<i64, Vec<ManifestRef>> = BTreeMap::new();
        let mut slice_names = HashSet::new();

        for slice in slices {
            let slice_name = slice.metadata.namespaced_name();
            slice_names.insert(slice_name.clone());
            for (index, manifest) in slice.spec.resources.iter().enumerate() {
                match Resource::from_manifest(slice_name.clone(), index, manifest) {
                    Ok(resource) => {
                        let mref = resource.manifest_ref.clone();
                        by_readiness_group
                            .entry(resource.readiness_group)
                            .or_default()
                            .push(mref.clone());
                        by_resource_ref.insert(resource.resource_ref.clone(), mref.clone());
                        resources.insert(mref, Arc::new(resource));
                    }
                    Err(e) => {
                        warn!(
                            composition = %composition,
                            slice = %slice_name,
                            index,
                            error = %e,
                            "skipping malformed manifest"
                        );
                    }
                }
            }
        }

        debug!(
            composition = %composition,
            synthesis = %synthesis.uuid,
            resources = resources.len(),
            "filled reconstitution cache"
        );

        let refs: Vec<ManifestRef> = resources.keys().cloned().collect();
        let state = Arc::new(SynthesisState {
            resources,
            by_resource_ref,
            by_readiness_group,
            slices: slice_names,
        });

        self.write()
            .entry(composition.clone())
            .or_default()
            .syntheses
            .insert(synthesis.uuid, state);

        for manifest_ref in refs {
            queue.add(Request {
                composition: composition.clone(),
                manifest_ref,
            });
        }
    }

    /// Drop everything not referenced by `keep` (the composition as
    /// currently observed); `None` drops the composition entirely.
    pub fn purge(&self, composition: &NamespacedName, keep: Option<&eno_domain::Composition>) {
        let mut guard = self.write();
        let referenced: HashSet<Uuid> = keep
            .map(|c| {
                c.status
                    .current_synthesis
                    .iter()
                    .chain(c.status.previous_synthesis.iter())
                    .map(|s| s.uuid)
                    .collect()
            })
            .unwrap_or_default();

        if referenced.is_empty() {
            guard.remove(composition);
            return;
        }
        if let Some(entry) = guard.get_mut(composition) {
            entry.syntheses.retain(|uuid, _| referenced.contains(uuid));
        }
    }

    pub fn get(
        &self,
        synthesis: &SynthesisRef,
        manifest_ref: &ManifestRef,
    ) -> Option<Arc<Resource>> {
        self.read()
            .get(&synthesis.composition)?
            .syntheses
            .get(&synthesis.uuid)?
            .resources
            .get(manifest_ref)
            .cloned()
    }

    /// Identity-keyed lookup, used for previous-version resolution: a
    /// re-synthesis stores the same downstream object under fresh slice
    /// names.
    pub fn get_by_ref(
        &self,
        synthesis: &SynthesisRef,
        resource_ref: &ResourceRef,
    ) -> Option<Arc<Resource>> {
        let guard = self.read();
        let state = guard
            .get(&synthesis.composition)?
            .syntheses
            .get(&synthesis.uuid)?;
        state
            .resources
            .get(state.by_resource_ref.get(resource_ref)?)
            .cloned()
    }

    /// Members of the greatest readiness group strictly below `group`;
    /// these must all be Ready before `group` may be created or updated.
    pub fn previous_readiness_group(
        &self,
        synthesis: &SynthesisRef,
        group: i64,
    ) -> Vec<ManifestRef> {
        self.neighbor_group(synthesis, group, true)
    }

    /// Members of the smallest readiness group strictly above `group`.
    pub fn next_readiness_group(&self, synthesis: &SynthesisRef, group: i64) -> Vec<ManifestRef> {
        self.neighbor_group(synthesis, group, false)
    }

    fn neighbor_group(
        &self,
        synthesis: &SynthesisRef,
        group: i64,
        previous: bool,
    ) -> Vec<ManifestRef> {
        let guard = self.read();
        let state = match guard
            .get(&synthesis.composition)
            .and_then(|e| e.syntheses.get(&synthesis.uuid))
        {
            Some(s) => s,
            None => return Vec::new(),
        };
        let neighbor = if previous {
            state.by_readiness_group.range(..group).next_back()
        } else {
            state
                .by_readiness_group
                .range((std::ops::Bound::Excluded(group), std::ops::Bound::Unbounded))
                .next()
        };
        neighbor.map(|(_, refs)| refs.clone()).unwrap_or_default()
    }

    /// Every cached resource of one synthesis, for whole-composition scans
    /// (deletion ordering).
    pub fn list(&self, synthesis: &SynthesisRef) -> Vec<Arc<Resource>> {
        let guard = self.read();
        guard
            .get(&synthesis.composition)
            .and_then(|e| e.syntheses.get(&synthesis.uuid))
            .map(|s| s.resources.values().cloned().collect())
            .unwrap_or_default()
    }
}
