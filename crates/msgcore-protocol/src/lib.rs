//! Wire types shared by Gateway, Logic, and TaskRunner: client-facing JSON
//! frames (spec §6), bus envelopes, and error codes. No business logic lives
//! here — this crate is the contract, not an implementation.

pub mod constants;
pub mod envelopes;
pub mod error_codes;
pub mod frames;

pub use constants::*;
pub use envelopes::{DownstreamEnvelope, DownstreamPayload, TaskEnvelope, UpstreamEnvelope};
pub use frames::{ClientFrame, ErrorShape, ServerFrame};
