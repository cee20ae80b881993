//! # hpo-cluster
//!
//! In-process compute cluster for HPO trials.
//!
//! A [`LocalCluster`] runs one worker thread per provisioned accelerator. Data
//! is persisted onto workers as blocks and referenced from the coordinator
//! through [`DistributedMatrix`] / [`DistributedSeries`] handles; work is
//! shipped to the data through a [`Client`].

mod accelerator;
mod client;
mod cluster;
mod distributed;
mod worker;

pub use accelerator::{detect_accelerators, plan_worker_count, WorkerPlan, VISIBLE_DEVICES_ENV};
pub use client::{Client, Pending};
pub use cluster::{ClusterSpec, LocalCluster};
pub use distributed::{Chunk, DistributedMatrix, DistributedSeries};
pub use worker::{Block, BlockKey, WorkerId, WorkerStore, WORKER_TARGET};

/// Log directive silencing worker chatter below error level.
pub const QUIET_WORKER_DIRECTIVE: &str = "hpo_cluster::worker=error";
