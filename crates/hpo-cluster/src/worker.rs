//! Worker threads and their resident block stores.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};
use hpo_types::{ClusterError, DenseMatrix, TrialError, TtResult};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Tracing target for worker lifecycle events.
pub const WORKER_TARGET: &str = "hpo_cluster::worker";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerId(pub usize);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Key of a block held in a worker's store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockKey(Uuid);

impl BlockKey {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for BlockKey {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BlockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Data resident on a worker.
#[derive(Debug, Clone, PartialEq)]
pub enum Block {
    Matrix(DenseMatrix),
    Series(Vec<f64>),
}

impl Block {
    pub fn n_rows(&self) -> usize {
        match self {
            Self::Matrix(m) => m.n_rows(),
            Self::Series(s) => s.len(),
        }
    }
}

/// Everything a worker holds: persisted blocks plus named task state that
/// survives between jobs (e.g. per-round training buffers).
pub struct WorkerStore {
    worker: WorkerId,
    blocks: HashMap<BlockKey, Block>,
    state: HashMap<String, Box<dyn Any + Send>>,
}

impl WorkerStore {
    pub fn new(worker: WorkerId) -> Self {
        Self {
            worker,
            blocks: HashMap::new(),
            state: HashMap::new(),
        }
    }

    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    pub fn put(&mut self, key: BlockKey, block: Block) {
        self.blocks.insert(key, block);
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn get(&self, key: &BlockKey) -> TtResult<&Block> {
        self.blocks.get(key).ok_or_else(|| {
            ClusterError::BlockNotFound {
                worker: self.worker.to_string(),
                key: key.to_string(),
            }
            .into()
        })
    }

    pub fn matrix(&self, key: &BlockKey) -> TtResult<&DenseMatrix> {
        match self.get(key)? {
            Block::Matrix(m) => Ok(m),
            Block::Series(_) => Err(self.wrong_kind(key, "matrix")),
        }
    }

    pub fn series(&self, key: &BlockKey) -> TtResult<&[f64]> {
        match self.get(key)? {
            Block::Series(s) => Ok(s),
            Block::Matrix(_) => Err(self.wrong_kind(key, "series")),
        }
    }

    fn wrong_kind(&self, key: &BlockKey, expected: &str) -> TrialError {
        ClusterError::TaskFailed {
            worker: self.worker.to_string(),
            message: format!("block {} is not a {}", key, expected),
        }
        .into()
    }

    pub fn state_count(&self) -> usize {
        self.state.len()
    }

    pub fn put_state<T: Any + Send>(&mut self, name: &str, value: T) {
        self.state.insert(name.to_string(), Box::new(value));
    }

    pub fn state_mut<T: Any + Send>(&mut self, name: &str) -> TtResult<&mut T> {
        let worker = self.worker;
        self.state
            .get_mut(name)
            .and_then(|s| s.downcast_mut::<T>())
            .ok_or_else(|| missing_state(worker, name))
    }

    pub fn state<T: Any + Send>(&self, name: &str) -> TtResult<&T> {
        self.state
            .get(name)
            .and_then(|s| s.downcast_ref::<T>())
            .ok_or_else(|| missing_state(self.worker, name))
    }

    pub fn take_state<T: Any + Send>(&mut self, name: &str) -> Option<T> {
        let boxed = self.state.remove(name)?;
        boxed.downcast::<T>().ok().map(|b| *b)
    }
}

fn missing_state(worker: WorkerId, name: &str) -> TrialError {
    ClusterError::TaskFailed {
        worker: worker.to_string(),
        message: format!("no task state named '{}'", name),
    }
    .into()
}

pub(crate) type Job = Box<dyn FnOnce(&mut WorkerStore) + Send + 'static>;

pub(crate) enum WorkerMessage {
    Run(Job),
    Shutdown,
}

/// Coordinator-side handle to one worker thread.
pub(crate) struct WorkerHandle {
    pub(crate) id: WorkerId,
    pub(crate) sender: Sender<WorkerMessage>,
    pub(crate) thread: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub(crate) fn spawn(id: WorkerId, cluster_name: &str) -> TtResult<Self> {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let thread = std::thread::Builder::new()
            .name(format!("{}-{}", cluster_name, id))
            .spawn(move || worker_loop(id, receiver))
            .map_err(|e| ClusterError::StartupFailed {
                message: format!("failed to spawn {}: {}", id, e),
            })?;

        Ok(Self {
            id,
            sender,
            thread: Some(thread),
        })
    }
}

fn worker_loop(id: WorkerId, receiver: Receiver<WorkerMessage>) {
    let mut store = WorkerStore::new(id);
    tracing::debug!(target: WORKER_TARGET, worker = %id, "worker started");

    for message in receiver.iter() {
        match message {
            WorkerMessage::Run(job) => job(&mut store),
            WorkerMessage::Shutdown => break,
        }
    }

    tracing::debug!(
        target: WORKER_TARGET,
        worker = %id,
        blocks = store.block_count(),
        "worker stopped"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_typed_access() {
        let mut store = WorkerStore::new(WorkerId(0));
        let m = BlockKey::new();
        let s = BlockKey::new();
        store.put(m, Block::Matrix(DenseMatrix::from_row_major(1, 2, vec![1.0, 2.0]).unwrap()));
        store.put(s, Block::Series(vec![3.0]));

        assert_eq!(store.matrix(&m).unwrap().n_cols(), 2);
        assert_eq!(store.series(&s).unwrap(), &[3.0]);
        assert!(store.series(&m).is_err());
        assert!(store.matrix(&BlockKey::new()).is_err());
        assert_eq!(store.block_count(), 2);
    }

    #[test]
    fn store_task_state() {
        let mut store = WorkerStore::new(WorkerId(1));
        store.put_state("margins", vec![0.0f64; 3]);
        store.state_mut::<Vec<f64>>("margins").unwrap()[1] = 2.0;
        assert_eq!(store.state::<Vec<f64>>("margins").unwrap()[1], 2.0);
        // wrong type is reported, not panicked on
        assert!(store.state::<Vec<u32>>("margins").is_err());
        assert_eq!(store.take_state::<Vec<f64>>("margins").unwrap().len(), 3);
        assert!(store.take_state::<Vec<f64>>("margins").is_none());
    }

    #[test]
    fn worker_ids_display() {
        assert_eq!(WorkerId(3).to_string(), "worker-3");
    }
}
