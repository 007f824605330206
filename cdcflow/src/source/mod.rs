//! Change sources feeding the capture adapter.

mod base;
pub mod memory;
pub mod postgres;

pub use base::*;
