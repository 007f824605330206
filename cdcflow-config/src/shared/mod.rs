mod base;
mod capture;
mod circuit_breaker;
mod connection;
mod outbox;
mod pipeline;
mod retry;
mod runner;
mod source;
mod state_store;
mod transformer;
mod workflow;

pub use base::*;
pub use capture::*;
pub use circuit_breaker::*;
pub use connection::*;
pub use outbox::*;
pub use pipeline::*;
pub use retry::*;
pub use runner::*;
pub use source::*;
pub use state_store::*;
pub use transformer::*;
pub use workflow::*;
