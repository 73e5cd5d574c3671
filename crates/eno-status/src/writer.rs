use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, warn};

use eno_api::UpstreamApi;
use eno_domain::{ManifestRef, NamespacedName, ResourceState};

/// A status mutation for one slice index. Returning `None` means "no
/// change; drop". Mutators may run more than once when a write conflicts
/// and is retried against a refreshed slice.
pub type Mutator = Box<dyn Fn(&ResourceState) -> Option<ResourceState> + Send + Sync>;

const CONFLICT_RETRIES: u32 = 3;

#[derive(Default)]
struct Pending {
    by_slice: HashMap<NamespacedName, Vec<(usize, Mutator)>>,
}

/// Debounced writer for ResourceSlice status.
///
/// All status mutations flow through one instance; a single drain task
/// coalesces everything pending per slice into one write. Mutators for the
/// same index apply in submission order.
pub struct StatusWriter {
    api: Arc<dyn UpstreamApi>,
    interval: Duration,
    pending: Mutex<Pending>,
    notify: Notify,
}

impl StatusWriter {
    pub fn new(api: Arc<dyn UpstreamApi>, interval: Duration) -> Arc<Self> {
        Arc::new(StatusWriter {
            api,
            interval,
            pending: Mutex::new(Pending::default()),
            notify: Notify::new(),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Pending> {
        match self.pending.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Queue a status mutation; it lands on the next drain.
    pub fn patch_status_async(&self, manifest_ref: &ManifestRef, mutator: Mutator) {
        let was_empty = {
            let mut pending = self.lock();
            let was_empty = pending.by_slice.is_empty();
            pending
                .by_slice
                .entry(manifest_ref.slice.clone())
                .or_default()
                .push((manifest_ref.index, mutator));
            was_empty
        };
        // Wake the drain task when going idle → busy, so the first write
        // after a quiet period is low-latency.
        if was_empty {
            self.notify.notify_one();
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.lock().by_slice.is_empty()
    }

    /// The drain loop. Spawn once; runs until the task is dropped.
    pub async fn run(self: Arc<Self>) {
        loop {
            self.notify.notified().await;
            self.drain_once().await;
            while self.has_pending() {
                tokio::time::sleep(self.interval).await;
                self.drain_once().await;
            }
        }
    }

    /// Flush everything currently pending. Public so shutdown paths and
    /// tests can force a synchronous flush.
    pub async fn drain_once(&self) {
        let batches: Vec<(NamespacedName, Vec<(usize, Mutator)>)> = {
            let mut pending = self.lock();
            pending.by_slice.drain().collect()
        };
        for (slice, mutators) in batches {
            if let Err(requeue) = self.flush_slice(&slice, &mutators).await {
                if requeue {
                    let mut pending = self.lock();
                    pending.by_slice.entry(slice).or_default().extend(mutators);
                }
            }
        }
    }

    /// One slice's coalesced write. `Err(true)` asks the caller to requeue
    /// the mutators for the next tick.
    async fn flush_slice(
        &self,
        slice: &NamespacedName,
        mutators: &[(usize, Mutator)],
    ) -> Result<(), bool> {
        for attempt in 0..=CONFLICT_RETRIES {
            let meta = match self.api.get_slice_meta(slice).await {
                Ok(Some(meta)) => meta,
                Ok(None) => {
                    // Slice deleted: nothing left to report against.
                    debug!(slice = %slice, "dropping status for deleted slice");
                    return Ok(());
                }
                Err(e) => {
                    warn!(slice = %slice, error = %e, "reading slice for status write");
                    return Err(true);
                }
            };

            let mut status = meta.status.clone();
            let mut changed = false;
            for (index, mutator) in mutators {
                while status.resources.len() <= *index {
                    status.resources.push(ResourceState::default());
                }
                let current = &status.resources[*index];
                if let Some(next) = mutator(current) {
                    if next != *current {
                        status.resources[*index] = next;
                        changed = true;
                    }
                }
            }
            if !changed {
                return Ok(());
            }

            let rv = meta.metadata.resource_version.clone().unwrap_or_default();
            match self.api.update_slice_status(slice, &rv, &status).await {
                Ok(()) => {
                    debug!(slice = %slice, mutations = mutators.len(), "flushed slice status");
                    return Ok(());
                }
                Err(e) if e.is_conflict() && attempt < CONFLICT_RETRIES => {
                    debug!(slice = %slice, attempt, "slice status conflict, refetching");
                    continue;
                }
                Err(e) => {
                    warn!(slice = %slice, error = %e, "slice status write failed");
                    return Err(true);
                }
            }
        }
        Err(true)
    }
}
