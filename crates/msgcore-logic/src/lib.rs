//! Logic: the ingress pipeline between `upstream` and `downstream`/`task`,
//! spec §4.2.
//!
//! [`worker::LogicWorker`] is the whole component — one instance per
//! `upstream` partition, run to exhaustion by [`crate::worker::LogicWorker::run`].
//! Everything else in this crate (config, error classification) exists to
//! support that one worker loop.

pub mod config;
pub mod error;
pub mod worker;

pub use config::LogicConfig;
pub use error::LogicError;
pub use worker::LogicWorker;
