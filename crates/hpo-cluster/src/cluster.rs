//! Local worker cluster lifecycle.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::Sender;
use dashmap::DashMap;
use hpo_types::{ClusterError, TtResult};
use tracing::{info, warn};
use uuid::Uuid;

use crate::client::Client;
use crate::worker::{BlockKey, WorkerHandle, WorkerId, WorkerMessage};

/// Sizing and placement of a local cluster.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterSpec {
    pub n_workers: usize,
    /// Parent of the per-cluster scratch directory.
    pub scratch_root: PathBuf,
    /// Prefix of worker thread names.
    pub name: String,
}

impl ClusterSpec {
    pub fn new(n_workers: usize, scratch_root: impl Into<PathBuf>) -> Self {
        Self {
            n_workers,
            scratch_root: scratch_root.into(),
            name: "hpo".to_string(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// State shared between a cluster and the clients connected to it.
pub(crate) struct ClusterShared {
    pub(crate) id: Uuid,
    pub(crate) senders: Vec<(WorkerId, Sender<WorkerMessage>)>,
    pub(crate) running: AtomicBool,
    pub(crate) has_what: DashMap<WorkerId, Vec<BlockKey>>,
}

/// A set of worker threads, one per provisioned accelerator.
pub struct LocalCluster {
    spec: ClusterSpec,
    shared: Arc<ClusterShared>,
    workers: Vec<WorkerHandle>,
    scratch_dir: PathBuf,
}

impl LocalCluster {
    /// Spawn `spec.n_workers` workers and create the scratch directory.
    pub fn start(spec: ClusterSpec) -> TtResult<Self> {
        if spec.n_workers == 0 {
            return Err(ClusterError::StartupFailed {
                message: "a cluster needs at least one worker".to_string(),
            }
            .into());
        }

        let id = Uuid::new_v4();
        let scratch_dir = spec
            .scratch_root
            .join("worker-space")
            .join(id.to_string());
        std::fs::create_dir_all(&scratch_dir).map_err(|e| ClusterError::StartupFailed {
            message: format!("cannot create scratch directory {}: {}", scratch_dir.display(), e),
        })?;

        let mut workers = Vec::with_capacity(spec.n_workers);
        for i in 0..spec.n_workers {
            match WorkerHandle::spawn(WorkerId(i), &spec.name) {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    for w in &workers {
                        let _ = w.sender.send(WorkerMessage::Shutdown);
                    }
                    let _ = std::fs::remove_dir_all(&scratch_dir);
                    return Err(e);
                }
            }
        }

        let has_what = DashMap::new();
        for w in &workers {
            has_what.insert(w.id, Vec::new());
        }

        let shared = Arc::new(ClusterShared {
            id,
            senders: workers.iter().map(|w| (w.id, w.sender.clone())).collect(),
            running: AtomicBool::new(true),
            has_what,
        });

        info!(
            cluster = %id,
            workers = spec.n_workers,
            scratch = %scratch_dir.display(),
            "local cluster started"
        );

        Ok(Self {
            spec,
            shared,
            workers,
            scratch_dir,
        })
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn n_workers(&self) -> usize {
        self.spec.n_workers
    }

    pub fn spec(&self) -> &ClusterSpec {
        &self.spec
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Connect a new client to this cluster.
    pub fn client(&self) -> Client {
        Client::connect(Arc::clone(&self.shared))
    }

    /// Stop every worker, wait for the threads to exit and remove the scratch
    /// directory. Blocks held by the workers are dropped.
    pub async fn close(mut self) -> TtResult<()> {
        let cluster_id = self.shared.id;
        self.shared.running.store(false, Ordering::SeqCst);

        let workers = std::mem::take(&mut self.workers);
        for w in &workers {
            let _ = w.sender.send(WorkerMessage::Shutdown);
        }

        let panicked = tokio::task::spawn_blocking(move || {
            let mut panicked = Vec::new();
            for mut w in workers {
                if let Some(thread) = w.thread.take() {
                    if thread.join().is_err() {
                        panicked.push(w.id);
                    }
                }
            }
            panicked
        })
        .await
        .map_err(|e| ClusterError::TeardownFailed {
            message: format!("join task for cluster {} failed: {}", cluster_id, e),
        })?;

        self.shared.has_what.clear();

        if tokio::fs::try_exists(&self.scratch_dir).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(&self.scratch_dir)
                .await
                .map_err(|e| ClusterError::TeardownFailed {
                    message: format!(
                        "cannot remove scratch directory {}: {}",
                        self.scratch_dir.display(),
                        e
                    ),
                })?;
        }

        if !panicked.is_empty() {
            let names: Vec<String> = panicked.iter().map(WorkerId::to_string).collect();
            warn!(cluster = %cluster_id, workers = ?names, "workers exited abnormally");
            return Err(ClusterError::TeardownFailed {
                message: format!("workers panicked: {}", names.join(", ")),
            }
            .into());
        }

        info!(cluster = %cluster_id, "local cluster closed");
        Ok(())
    }
}

impl Drop for LocalCluster {
    fn drop(&mut self) {
        // not closed explicitly: ask the workers to stop, do not wait
        if !self.workers.is_empty() {
            self.shared.running.store(false, Ordering::SeqCst);
            for w in &self.workers {
                let _ = w.sender.send(WorkerMessage::Shutdown);
            }
            if let Err(e) = std::fs::remove_dir_all(&self.scratch_dir) {
                warn!(
                    scratch = %self.scratch_dir.display(),
                    error = %e,
                    "scratch directory left behind by a dropped cluster"
                );
            }
        }
    }
}

impl std::fmt::Debug for LocalCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalCluster")
            .field("id", &self.shared.id)
            .field("n_workers", &self.spec.n_workers)
            .field("running", &self.is_running())
            .field("scratch_dir", &self.scratch_dir)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hpo_types::TrialError;

    #[tokio::test]
    async fn start_and_close() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = LocalCluster::start(ClusterSpec::new(3, dir.path())).unwrap();
        assert_eq!(cluster.n_workers(), 3);
        assert!(cluster.is_running());
        assert!(cluster.scratch_dir().exists());

        let scratch = cluster.scratch_dir().to_path_buf();
        let client = cluster.client();
        cluster.close().await.unwrap();

        assert!(!scratch.exists());
        assert!(client.is_closed());
        let err = client.run_on(WorkerId(0), |_| Ok(())).unwrap_err();
        assert!(matches!(err, TrialError::Cluster(ClusterError::ClusterClosed { .. })));
    }

    #[test]
    fn zero_workers_is_a_startup_failure() {
        let dir = tempfile::tempdir().unwrap();
        let err = LocalCluster::start(ClusterSpec::new(0, dir.path())).unwrap_err();
        assert!(matches!(err, TrialError::Cluster(ClusterError::StartupFailed { .. })));
    }

    #[test]
    fn dropping_an_open_cluster_removes_its_scratch_dir() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = LocalCluster::start(ClusterSpec::new(2, dir.path())).unwrap();
        let scratch = cluster.scratch_dir().to_path_buf();
        let client = cluster.client();
        drop(cluster);

        assert!(!scratch.exists());
        assert!(client.is_closed());
    }

    #[tokio::test]
    async fn each_cluster_gets_its_own_scratch_dir() {
        let dir = tempfile::tempdir().unwrap();
        let a = LocalCluster::start(ClusterSpec::new(1, dir.path())).unwrap();
        let b = LocalCluster::start(ClusterSpec::new(1, dir.path())).unwrap();
        assert_ne!(a.id(), b.id());
        assert_ne!(a.scratch_dir(), b.scratch_dir());
        a.close().await.unwrap();
        assert!(b.scratch_dir().exists());
        b.close().await.unwrap();
    }
}
