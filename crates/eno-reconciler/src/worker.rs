use std::sync::Arc;

use tracing::{debug, warn};

use eno_cache::Request;
use eno_queue::{jittered, Queue};

use crate::reconciler::{Action, DeferReason, Outcome, Reconciler};

/// One worker: dequeue, reconcile, apply the requeue policy, repeat until
/// the queue shuts down. Run several of these on the same queue; the
/// queue's in-flight exclusion keeps any one ManifestRef on a single
/// worker at a time.
pub async fn run_worker(reconciler: Arc<Reconciler>, queue: Arc<Queue<Request>>) {
    while let Some(req) = queue.get().await {
        let result = reconciler.reconcile(&req).await;
        queue.done(&req);
        match result {
            Ok(outcome) => apply_requeue_policy(&reconciler, &queue, req, outcome),
            Err(e) if e.is_terminal() => {
                // Wrong until its inputs change; an informer event will
                // re-enqueue it.
                warn!(request = %req, error = %e, "terminal reconcile error");
            }
            Err(e) => {
                debug!(request = %req, error = %e, "reconcile failed, backing off");
                queue.add_rate_limited(req);
            }
        }
    }
}

fn apply_requeue_policy(
    reconciler: &Reconciler,
    queue: &Queue<Request>,
    req: Request,
    outcome: Outcome,
) {
    let opts = &reconciler.options;
    match outcome {
        Outcome::Drop => {
            queue.forget(&req);
        }
        Outcome::Deferred(DeferReason::DeletionOrdering(reason)) => {
            debug!(request = %req, %reason, "deletion blocked");
            queue.add_rate_limited(req);
        }
        Outcome::Deferred(_) => {
            queue.add_after(req, jittered(opts.readiness_poll_interval));
        }
        Outcome::Done {
            action,
            ready,
            reconcile_interval,
        } => {
            queue.forget(&req);
            if action != Action::NoOp {
                // Something changed downstream: converge again immediately.
                queue.add(req);
            } else if !ready {
                queue.add_after(req, jittered(opts.readiness_poll_interval));
            } else if let Some(interval) = reconcile_interval {
                let interval = interval.max(opts.min_reconcile_interval);
                queue.add_after(req, jittered(interval));
            }
        }
    }
}
