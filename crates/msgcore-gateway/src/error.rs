use msgcore_bus::BusError;
use msgcore_common::{Severity, severity::Classify};
use msgcore_repo::RepoError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("malformed client frame: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("repo: {0}")]
    Repo(#[from] RepoError),
    #[error("bus: {0}")]
    Bus(#[from] BusError),
}

impl Classify for GatewayError {
    fn severity(&self) -> Severity {
        match self {
            GatewayError::Decode(_) => Severity::Policy,
            GatewayError::Repo(e) => e.severity(),
            GatewayError::Bus(e) => e.severity(),
        }
    }
}
