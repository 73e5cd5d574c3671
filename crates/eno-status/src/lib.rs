//! Buffered, coalesced ResourceSlice status writes.

pub mod writer;

pub use writer::{Mutator, StatusWriter};
