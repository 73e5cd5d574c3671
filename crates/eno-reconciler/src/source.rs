use std::sync::Arc;

use tracing::{debug, warn};

use eno_api::{ApiError, UpstreamApi};
use eno_cache::{ReconstitutionCache, Request};
use eno_domain::{Composition, NamespacedName};
use eno_queue::Queue;

/// Reconstitute one composition: visit/fill the previous synthesis first,
/// then the current one, then purge whatever the composition no longer
/// references. Syntheses without slices yet (still being synthesized) are
/// skipped without error.
pub async fn sync_composition(
    upstream: &Arc<dyn UpstreamApi>,
    cache: &ReconstitutionCache,
    queue: &Queue<Request>,
    comp: &Composition,
) -> Result<(), ApiError> {
    let name = comp.namespaced_name();
    let syntheses = [
        comp.status.previous_synthesis.as_ref(),
        comp.status.current_synthesis.as_ref(),
    ];
    for synthesis in syntheses.into_iter().flatten() {
        if synthesis.resource_slices.is_empty() {
            continue;
        }
        if cache.visit(&name, synthesis) {
            continue;
        }

        // Informer caches may prune slice spec; the fill path always goes
        // through the full reader.
        let mut slices = Vec::with_capacity(synthesis.resource_slices.len());
        let mut complete = true;
        for slice_ref in &synthesis.resource_slices {
            let slice_name = NamespacedName::new(name.namespace.clone(), slice_ref.name.clone());
            match upstream.get_slice(&slice_name).await? {
                Some(slice) => slices.push(slice),
                None => {
                    warn!(composition = %name, slice = %slice_name, "referenced slice not found");
                    complete = false;
                    break;
                }
            }
        }
        if complete {
            debug!(composition = %name, synthesis = %synthesis.uuid, "filling cache");
            cache.fill(&name, synthesis, &slices, queue);
        }
    }

    cache.purge(&name, Some(comp));
    Ok(())
}

/// Drop a deleted composition from the cache entirely.
pub fn forget_composition(cache: &ReconstitutionCache, name: &NamespacedName) {
    cache.purge(name, None);
}
