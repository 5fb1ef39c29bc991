//! Dispatch - event ingestion pipeline
//!
//! Drivers adapt external event sources into canonical envelopes and hand
//! them to a local sidecar over HTTP. The sidecar validates each envelope and
//! publishes it to a broker transport, routed by organization and topic.
//!
//! ```text
//! [event source] -> [driver] --(HTTP POST)--> [sidecar] -> [transport] -> subscribers
//! ```
//!
//! The envelope model, validation and the sidecar client live in the
//! `dispatch-client` crate so drivers can link without broker libraries.

pub mod bus;
pub mod config;
pub mod driver;
pub mod sidecar;
pub mod utils;

pub use dispatch_client::{Envelope, EventSender, SidecarClient};
