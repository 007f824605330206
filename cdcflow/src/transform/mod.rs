//! Invocation of workflow transformers.

mod base;
pub mod executor;
pub mod process;
mod registry;

pub use base::*;
pub use registry::*;
