pub mod error;
pub mod options;
pub mod ordering;
pub mod overrides;
pub mod reconciler;
pub mod source;
pub mod worker;

pub use error::ReconcileError;
pub use options::{Migration, Options};
pub use reconciler::{Action, DeferReason, Outcome, Reconciler};
pub use source::{forget_composition, sync_composition};
pub use worker::run_worker;
