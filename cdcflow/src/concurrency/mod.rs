//! Coordination primitives shared by the pipeline workers.

pub mod backoff;
pub mod retry;
pub mod shutdown;
