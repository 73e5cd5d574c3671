//! Reconstitution: exploding a composition's resource slices into
//! individually addressable, immutable work items.

pub mod cache;

pub use cache::{ReconstitutionCache, Request};
