//! Durable state of the pipeline: checkpoints, the transactional outbox and dead letters.
//!
//! Each concern has its own trait so that stages only depend on what they use. The
//! [`memory::MemoryStore`] and [`postgres::PostgresStore`] implement all three.

mod checkpoint;
mod dead_letter;
pub mod memory;
mod outbox;
pub mod postgres;

pub use checkpoint::CheckpointStore;
pub use dead_letter::DeadLetterStore;
pub use outbox::OutboxStore;

/// Every store the pipeline needs, bundled for generic bounds.
pub trait StateStore:
    CheckpointStore + OutboxStore + DeadLetterStore + Clone + Send + Sync + 'static
{
}

impl<T> StateStore for T where
    T: CheckpointStore + OutboxStore + DeadLetterStore + Clone + Send + Sync + 'static
{
}
