//! Asynchronous delivery of the transactional outbox of exactly-once workflows.

mod relay;

pub use relay::{OutboxRelay, RelayReport};
