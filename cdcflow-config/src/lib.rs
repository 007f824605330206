//! Configuration types and loading for cdcflow pipelines and the runner binary.

mod environment;
mod load;
mod secret;
pub mod shared;

pub use environment::*;
pub use load::*;
pub use secret::*;
