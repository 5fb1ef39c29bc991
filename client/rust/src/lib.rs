//! Event envelope model and sidecar client for the dispatch pipeline.
//!
//! This crate holds everything a driver process needs without pulling in
//! broker libraries: the canonical [`Envelope`], its validation rules, the
//! request-body parser shared with the sidecar, trace propagation helpers,
//! and the HTTP [`SidecarClient`].
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use dispatch_client::{ClientOptions, Envelope, EventSender, SidecarClient};
//! use serde_json::json;
//!
//! async fn example() -> dispatch_client::Result<()> {
//!     // Blocks until the sidecar answers its health check
//!     let client = SidecarClient::connect(ClientOptions::from_env()).await?;
//!
//!     let event = Envelope::new("vcenter", "vm.created", "vcenter", "vc-01", json!({"vm": "web-1"}));
//!     client.send_one(&event).await?;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod envelope;
pub mod error;
pub mod parser;
pub mod trace;
pub mod validation;

// Re-export main types at crate root
pub use client::{ClientOptions, EventSender, SidecarClient};
pub use envelope::{new_event_id, Envelope, ENVELOPE_VERSION};
pub use error::{ClientError, Result};
pub use parser::{parse, parse_slice, JsonStreamParser, ParseError, StreamParser};
pub use validation::{
    default_validator, validate, validate_all, BatchValidationError, FieldError, ValidationError,
    Validator,
};
