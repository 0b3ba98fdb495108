//! Gateway: WebSocket session lifecycle, upstream producer, downstream
//! consumer, spec §4.1.
//!
//! Lifecycle:
//! 1. Load + validate config
//! 2. Resolve auth, bind address
//! 3. Start HTTP server (`/health`, `/ws`, `/conversations`, `/messages`,
//!    `/read`)
//! 4. On upgrade: authenticate, acquire the session, spawn `read_pump` +
//!    `write_pump`
//! 5. One downstream-consumer task per instance feeds connected sessions
//!    from `downstream-{instance_id}`
//!
//! All persistence and routing logic lives behind `Arc<dyn Repo>` and
//! `msgcore-bus`; this crate only owns connection lifecycle and wire framing.

pub mod auth;
pub mod downstream;
pub mod error;
pub mod ingress;
pub mod ratelimit;
pub mod rpc;
pub mod server;
pub mod session;
pub mod state;
