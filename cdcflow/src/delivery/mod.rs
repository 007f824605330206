//! Delivery of transformed payloads to workflow endpoints.

pub mod circuit;
pub mod client;
pub mod engine;
pub mod http;
pub mod memory;

pub use client::{EndpointClient, EndpointRequest, EndpointStatus};
pub use engine::{DeliveryEngine, DeliveryOutcome, DeliveryResolution};
