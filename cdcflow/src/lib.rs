//! Change data capture pipelines delivering row changes to webhook endpoints.
//!
//! A [`pipeline::Pipeline`] reads the changes of one source in order, routes each change to
//! every workflow subscribed to its table and runs every workflow in its own lane:
//! transformation, then delivery with at-least-once or exactly-once (transactional outbox)
//! semantics. Progress is checkpointed per workflow, so a slow or failing workflow never
//! holds back another one.

pub mod capture;
pub mod concurrency;
pub mod configuration;
pub mod dead_letter;
pub mod delivery;
pub mod error;
pub mod failpoints;
mod macros;
pub mod metrics;
pub mod migrations;
pub mod outbox;
pub mod pipeline;
pub mod router;
pub mod source;
pub mod store;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod transform;
pub mod types;
pub mod workers;
