//! Node-id acquisition. The real coordinator (etcd/ZooKeeper-style exclusive
//! lease service) is an external collaborator per spec §1/§6; this module
//! ships the trait plus a config-supplied static lease and a single-host
//! file-based lease for the common "one process per node id" deployment.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::IdGenError;

#[async_trait]
pub trait NodeLease: Send + Sync {
    async fn acquire_node_id(&self) -> Result<u16, IdGenError>;
}

/// Node id supplied directly by configuration or an orchestrator (e.g. a
/// Kubernetes StatefulSet's pod ordinal). No coordination needed.
pub struct StaticNodeLease(pub u16);

#[async_trait]
impl NodeLease for StaticNodeLease {
    async fn acquire_node_id(&self) -> Result<u16, IdGenError> {
        Ok(self.0)
    }
}

/// Acquires the first free node id (0..1024) by exclusively creating a lease
/// file `<dir>/node-<id>.lease`. Suitable for a single host running several
/// Logic/Gateway processes; a multi-host deployment should use a real
/// coordinator behind the same [`NodeLease`] trait.
pub struct FileLeaseCoordinator {
    dir: PathBuf,
}

impl FileLeaseCoordinator {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn lease_path(&self, node_id: u16) -> PathBuf {
        self.dir.join(format!("node-{node_id}.lease"))
    }
}

#[async_trait]
impl NodeLease for FileLeaseCoordinator {
    async fn acquire_node_id(&self) -> Result<u16, IdGenError> {
        let dir = self.dir.clone();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| IdGenError::LeaseFailed(format!("create lease dir: {e}")))?;

        for node_id in 0u16..1024 {
            let path = self.lease_path(node_id);
            match try_create_exclusive(&path, std::process::id()).await {
                Ok(()) => return Ok(node_id),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(IdGenError::LeaseFailed(e.to_string())),
            }
        }
        Err(IdGenError::LeaseFailed("no free node id in 0..1024".into()))
    }
}

async fn try_create_exclusive(path: &Path, pid: u32) -> std::io::Result<()> {
    use tokio::io::AsyncWriteExt;

    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await?;
    file.write_all(format!("{pid}").as_bytes()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_lease_returns_configured_id() {
        let lease = StaticNodeLease(7);
        assert_eq!(lease.acquire_node_id().await.unwrap(), 7);
    }

    #[tokio::test]
    async fn file_lease_hands_out_distinct_ids() {
        let dir = tempfile::tempdir().unwrap();
        let a = FileLeaseCoordinator::new(dir.path());
        let b = FileLeaseCoordinator::new(dir.path());
        let id_a = a.acquire_node_id().await.unwrap();
        let id_b = b.acquire_node_id().await.unwrap();
        assert_ne!(id_a, id_b);
    }
}
