//! Workers of a pipeline: the capture worker of the source, one lane per workflow and one
//! outbox relay per exactly-once workflow.

pub mod base;
pub mod capture;
pub mod dispatcher;
pub mod health;
pub mod policy;
pub mod pool;
pub mod workflow;
