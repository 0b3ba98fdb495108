//! Shared primitives used by every msgcore crate: stable identifiers,
//! conversation-id derivation, error-severity classification, deadline /
//! cancellation helpers, and a bounded-retry-with-backoff utility.
//!
//! Nothing here talks to a bus, a store, or a socket — it is the vocabulary
//! the other crates share, not a service.

pub mod ids;
pub mod retry;
pub mod severity;
pub mod time;

pub use ids::{ConversationId, ConversationKind, GroupId, MessageId, UserId};
pub use retry::{Backoff, retry_with_backoff};
pub use severity::{Classify, Severity};
pub use time::now_ms;

/// Re-exported so downstream crates don't need a direct `tokio-util` dependency
/// just to accept a cancellation token at a call boundary.
pub use tokio_util::sync::CancellationToken;
