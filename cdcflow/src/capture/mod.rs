//! Change capture: reading a source from its checkpoint and tracking source progress.

mod adapter;
mod progress;

pub use adapter::*;
pub use progress::*;
