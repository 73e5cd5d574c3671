use std::collections::HashMap;
use std::sync::Arc;

use eno_api::{ApiError, UpstreamApi};
use eno_cache::ReconstitutionCache;
use eno_domain::{ManifestRef, NamespacedName, Resource, SynthesisRef};

/// Forward-path gate: before creating or updating a resource, every member
/// of the next-lower readiness group must be Ready in slice status.
/// Returns the first blocking sibling, if any.
pub async fn readiness_gate_blocked(
    upstream: &Arc<dyn UpstreamApi>,
    cache: &ReconstitutionCache,
    synthesis: &SynthesisRef,
    resource: &Resource,
) -> Result<Option<ManifestRef>, ApiError> {
    let siblings = cache.previous_readiness_group(synthesis, resource.readiness_group);
    if siblings.is_empty() {
        return Ok(None);
    }

    let mut by_slice: HashMap<NamespacedName, Vec<ManifestRef>> = HashMap::new();
    for sibling in siblings {
        by_slice.entry(sibling.slice.clone()).or_default().push(sibling);
    }
    for (slice, refs) in by_slice {
        let meta = upstream.get_slice_meta(&slice).await?;
        for r in refs {
            let ready = meta
                .as_ref()
                .and_then(|m| m.status.resources.get(r.index))
                .and_then(|s| s.ready);
            if ready.is_none() {
                return Ok(Some(r));
            }
        }
    }
    Ok(None)
}

/// Reverse-path gate, evaluated only while the composition is being
/// deleted and the resource carries an explicit deletion group: deletion
/// is blocked while any resource in a lower group is not yet Deleted.
/// Scans every cached resource of the current synthesis. Returns a
/// human-readable reason when blocked.
pub async fn deletion_blocked(
    upstream: &Arc<dyn UpstreamApi>,
    cache: &ReconstitutionCache,
    synthesis: &SynthesisRef,
    resource: &Resource,
) -> Result<Option<String>, ApiError> {
    let group = match resource.deletion_group {
        Some(g) => g,
        None => return Ok(None),
    };

    let lower: Vec<Arc<Resource>> = cache
        .list(synthesis)
        .into_iter()
        .filter(|r| r.deletion_group_or_default() < group)
        .collect();
    if lower.is_empty() {
        return Ok(None);
    }

    let mut slice_cache: HashMap<NamespacedName, Option<eno_api::SliceMeta>> = HashMap::new();
    for other in lower {
        let slice = &other.manifest_ref.slice;
        if !slice_cache.contains_key(slice) {
            slice_cache.insert(slice.clone(), upstream.get_slice_meta(slice).await?);
        }
        let deleted = slice_cache
            .get(slice)
            .and_then(|m| m.as_ref())
            .and_then(|m| m.status.resources.get(other.manifest_ref.index))
            .map(|s| s.deleted)
            .unwrap_or(false);
        if !deleted {
            return Ok(Some(format!(
                "waiting for deletion of {} (group {})",
                other.resource_ref,
                other.deletion_group_or_default()
            )));
        }
    }
    Ok(None)
}
