//! Client handle: task submission, data placement and gathering.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use hpo_types::{ClusterError, TtResult};
use uuid::Uuid;

use crate::cluster::ClusterShared;
use crate::distributed::{Chunk, DistributedSeries};
use crate::worker::{Block, BlockKey, Job, WorkerId, WorkerMessage, WorkerStore};

/// A client bound to one [`LocalCluster`](crate::LocalCluster).
///
/// All work is expressed as closures run on a worker against its
/// [`WorkerStore`]. A client stops accepting work once it or its cluster is
/// closed.
pub struct Client {
    id: Uuid,
    shared: Arc<ClusterShared>,
    closed: AtomicBool,
}

/// Result of a submitted task, not yet waited on.
pub struct Pending<R> {
    worker: WorkerId,
    reply: Receiver<TtResult<R>>,
}

impl<R> Pending<R> {
    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    /// Block until the worker answers.
    pub fn wait(self) -> TtResult<R> {
        self.reply.recv().map_err(|_| ClusterError::WorkerLost {
            worker: self.worker.to_string(),
        })?
    }
}

impl Client {
    pub(crate) fn connect(shared: Arc<ClusterShared>) -> Self {
        let id = Uuid::new_v4();
        tracing::debug!(client = %id, cluster = %shared.id, "client connected");
        Self {
            id,
            shared,
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn cluster_id(&self) -> Uuid {
        self.shared.id
    }

    pub fn workers(&self) -> Vec<WorkerId> {
        self.shared.senders.iter().map(|(id, _)| *id).collect()
    }

    pub fn n_workers(&self) -> usize {
        self.shared.senders.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || !self.shared.running.load(Ordering::SeqCst)
    }

    /// Disconnect. Data already on the workers stays there until the cluster closes.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::debug!(client = %self.id, cluster = %self.shared.id, "client closed");
        }
    }

    fn sender(&self, worker: WorkerId) -> TtResult<&Sender<WorkerMessage>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ClusterError::ClientClosed.into());
        }
        if !self.shared.running.load(Ordering::SeqCst) {
            return Err(ClusterError::ClusterClosed {
                cluster_id: self.shared.id.to_string(),
            }
            .into());
        }
        self.shared
            .senders
            .iter()
            .find(|(id, _)| *id == worker)
            .map(|(_, s)| s)
            .ok_or_else(|| {
                ClusterError::WorkerNotFound {
                    worker: worker.to_string(),
                }
                .into()
            })
    }

    /// Queue `task` on `worker` without waiting for it.
    pub fn submit<R, F>(&self, worker: WorkerId, task: F) -> TtResult<Pending<R>>
    where
        R: Send + 'static,
        F: FnOnce(&mut WorkerStore) -> TtResult<R> + Send + 'static,
    {
        let sender = self.sender(worker)?;
        let (tx, rx) = crossbeam_channel::bounded(1);
        let job: Job = Box::new(move |store| {
            let _ = tx.send(task(store));
        });
        sender
            .send(WorkerMessage::Run(job))
            .map_err(|_| ClusterError::WorkerLost {
                worker: worker.to_string(),
            })?;
        Ok(Pending { worker, reply: rx })
    }

    /// Run `task` on `worker` and wait for its result.
    pub fn run_on<R, F>(&self, worker: WorkerId, task: F) -> TtResult<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut WorkerStore) -> TtResult<R> + Send + 'static,
    {
        self.submit(worker, task)?.wait()
    }

    /// Run one task per `(worker, payload)` pair concurrently; results come
    /// back in input order. The first failure is returned after every task
    /// has finished.
    pub fn map_tasks<T, R, F>(&self, tasks: Vec<(WorkerId, T)>, task: F) -> TtResult<Vec<R>>
    where
        T: Send + 'static,
        R: Send + 'static,
        F: Fn(&mut WorkerStore, T) -> TtResult<R> + Send + Sync + 'static,
    {
        let task = Arc::new(task);
        let mut pending = Vec::with_capacity(tasks.len());
        for (worker, payload) in tasks {
            let task = Arc::clone(&task);
            pending.push(self.submit(worker, move |store| task(store, payload)));
        }

        let mut results = Vec::with_capacity(pending.len());
        let mut first_error = None;
        for p in pending {
            match p.and_then(Pending::wait) {
                Ok(r) => results.push(r),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(results),
        }
    }

    /// Run `task` once on every worker, results in worker order.
    pub fn map_workers<R, F>(&self, task: F) -> TtResult<Vec<R>>
    where
        R: Send + 'static,
        F: Fn(&mut WorkerStore) -> TtResult<R> + Send + Sync + 'static,
    {
        let tasks = self.workers().into_iter().map(|w| (w, ())).collect();
        self.map_tasks(tasks, move |store, ()| task(store))
    }

    /// Materialise groups of blocks on the workers.
    ///
    /// A group is `(slot, blocks)`; it is placed on worker `slot % n_workers`
    /// and its blocks stay together. Returns the chunks of every group in
    /// input order.
    pub fn persist_across_workers(
        &self,
        groups: Vec<(usize, Vec<Block>)>,
    ) -> TtResult<Vec<Vec<Chunk>>> {
        let workers = self.workers();
        if workers.is_empty() {
            return Err(ClusterError::ClusterClosed {
                cluster_id: self.shared.id.to_string(),
            }
            .into());
        }

        let tasks: Vec<(WorkerId, Vec<(BlockKey, Block)>)> = groups
            .into_iter()
            .map(|(slot, blocks)| {
                let worker = workers[slot % workers.len()];
                let keyed = blocks.into_iter().map(|b| (BlockKey::new(), b)).collect();
                (worker, keyed)
            })
            .collect();

        let placed = self.map_tasks(tasks, |store, keyed: Vec<(BlockKey, Block)>| {
            let worker = store.worker();
            let chunks = keyed
                .into_iter()
                .map(|(key, block)| {
                    let n_rows = block.n_rows();
                    store.put(key, block);
                    Chunk {
                        worker,
                        key,
                        n_rows,
                    }
                })
                .collect::<Vec<_>>();
            Ok(chunks)
        })?;

        for chunks in &placed {
            for chunk in chunks {
                self.shared
                    .has_what
                    .entry(chunk.worker)
                    .or_default()
                    .push(chunk.key);
            }
        }

        Ok(placed)
    }

    /// Snapshot of which blocks every worker holds.
    pub fn has_what(&self) -> HashMap<WorkerId, Vec<BlockKey>> {
        self.shared
            .has_what
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect()
    }

    /// Collect a distributed series to the caller, in chunk order.
    pub fn gather_series(&self, series: &DistributedSeries) -> TtResult<Vec<f64>> {
        let tasks = series.chunks().iter().map(|c| (c.worker, c.key)).collect();
        let parts = self.map_tasks(tasks, |store, key: BlockKey| Ok(store.series(&key)?.to_vec()))?;
        Ok(parts.into_iter().flatten().collect())
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("cluster", &self.shared.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}
