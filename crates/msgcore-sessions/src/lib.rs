//! SessionRegistry: `user_id -> {gateway_instance_id, connected_at}`
//! directory, spec §3 SessionPointer / §4.5.
//!
//! Generalizes moltis-sessions (previously: `SessionKey` +
//! a JSONL-file-backed `SessionMetadata` index keyed by agent/channel/peer)
//! into the spec's TTL'd, in-memory pointer directory keyed by `UserId`.
//! The JSONL-on-disk lineage doesn't fit here — `SessionPointer` is
//! explicitly allowed to be lost and TTL-reaped on crash (spec §3 ownership
//! rules), so a durable file store would be solving a problem the spec
//! doesn't have.

pub mod pointer;
pub mod registry;

pub use pointer::SessionPointer;
pub use registry::{InProcessSessionRegistry, SessionRegistry, SessionRegistryError};
