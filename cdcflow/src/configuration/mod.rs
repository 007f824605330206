//! Read only access to workflow definitions.
//!
//! Definitions are published as immutable, versioned [`ConfigSnapshot`]s. A reload swaps the
//! whole snapshot; definitions already handed to workers are never mutated.

mod base;
pub mod memory;

pub use base::*;
