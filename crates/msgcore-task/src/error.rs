use msgcore_bus::BusError;
use msgcore_common::{Severity, severity::Classify};
use msgcore_repo::RepoError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("malformed task envelope: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("repo: {0}")]
    Repo(#[from] RepoError),
    #[error("bus: {0}")]
    Bus(#[from] BusError),
}

impl Classify for TaskError {
    fn severity(&self) -> Severity {
        match self {
            TaskError::Decode(_) => Severity::Policy,
            TaskError::Repo(e) => e.severity(),
            TaskError::Bus(e) => e.severity(),
        }
    }
}
