use std::time::{Duration, SystemTime};

/// Directory entry mapping a user to the gateway instance currently owning
/// their live session, spec §3.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionPointer {
    pub gateway_instance_id: String,
    pub connected_at: SystemTime,
    pub expires_at: SystemTime,
}

impl SessionPointer {
    pub fn new(gateway_instance_id: impl Into<String>, now: SystemTime, ttl: Duration) -> Self {
        Self {
            gateway_instance_id: gateway_instance_id.into(),
            connected_at: now,
            expires_at: now + ttl,
        }
    }

    pub fn is_expired(&self, now: SystemTime) -> bool {
        now >= self.expires_at
    }

    pub fn refreshed(&self, now: SystemTime, ttl: Duration) -> Self {
        Self {
            gateway_instance_id: self.gateway_instance_id.clone(),
            connected_at: self.connected_at,
            expires_at: now + ttl,
        }
    }
}
