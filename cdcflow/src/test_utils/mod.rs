//! Helpers for tests driving whole pipelines against in-memory components.
//!
//! Pipelines are assembled from [`crate::source::memory::MemoryChangeSource`],
//! [`crate::store::memory::MemoryStore`],
//! [`crate::configuration::memory::MemoryConfigurationStore`] and
//! [`crate::delivery::memory::MemoryEndpoint`]. Workers run asynchronously, so assertions
//! poll with [`wait::wait_for`] instead of sleeping for a fixed time.
//!
//! [`database::TestDatabase`] creates a throwaway Postgres database for the tests of the
//! Postgres store and change source.

pub mod database;
#[cfg(feature = "failpoints")]
pub mod failpoints;
pub mod pipeline;
pub mod transformer;
pub mod wait;
pub mod workflow;
