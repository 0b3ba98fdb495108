use msgcore_common::{Severity, severity::Classify};
use msgcore_bus::BusError;
use msgcore_dedup::DedupError;
use msgcore_idgen::IdGenError;
use msgcore_repo::RepoError;
use msgcore_seqalloc::SeqAllocError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LogicError {
    #[error("malformed upstream envelope: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("dedup store: {0}")]
    Dedup(#[from] DedupError),
    #[error("sequence allocation: {0}")]
    SeqAlloc(#[from] SeqAllocError),
    #[error("id generation: {0}")]
    IdGen(#[from] IdGenError),
    #[error("repo: {0}")]
    Repo(#[from] RepoError),
    #[error("bus: {0}")]
    Bus(#[from] BusError),
}

impl Classify for LogicError {
    fn severity(&self) -> Severity {
        match self {
            LogicError::Decode(_) => Severity::Policy,
            LogicError::Dedup(e) => match e {},
            LogicError::SeqAlloc(e) => e.severity(),
            LogicError::IdGen(e) => e.severity(),
            LogicError::Repo(e) => e.severity(),
            LogicError::Bus(e) => e.severity(),
        }
    }
}
