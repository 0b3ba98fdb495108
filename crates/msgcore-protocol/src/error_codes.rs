//! Stable string codes carried in [`crate::ErrorShape`] / `error` frames.

pub const RATE_LIMITED: &str = "rate_limited";
pub const FRAME_TOO_LARGE: &str = "frame_too_large";
pub const INVALID_FRAME: &str = "invalid_frame";
pub const SEND_FAILED: &str = "send_failed";
pub const UNAUTHORIZED: &str = "unauthorized";
pub const INVALID_REQUEST: &str = "invalid_request";
pub const INTERNAL: &str = "internal";
