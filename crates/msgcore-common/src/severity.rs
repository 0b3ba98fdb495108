/// Abstract error kind per spec §7. Every crate-local error type implements
/// [`Classify`] so callers (Logic, Gateway, TaskRunner) can decide
/// retry/backoff/dead-letter behavior without matching on concrete error
/// enums from crates they otherwise don't depend on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Network, broker, cache hiccups. Retry with bounded exponential backoff.
    Transient,
    /// Dedup hit, unique-constraint violation. Treat as success.
    Conflict,
    /// Retry budget consumed. Dead-letter or surface as `send_failed`.
    Exhaustion,
    /// Rate limit, size limit, authn failure. Surface to the client, no retry.
    Policy,
    /// Clock regression, configuration inconsistency. Refuse to start.
    Fatal,
}

impl Severity {
    pub fn is_retriable(self) -> bool {
        matches!(self, Severity::Transient)
    }
}

pub trait Classify {
    fn severity(&self) -> Severity;
}
