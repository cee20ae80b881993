//! Handles to data materialised on cluster workers.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::worker::{BlockKey, WorkerId};

/// One persisted block and where it lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub worker: WorkerId,
    pub key: BlockKey,
    pub n_rows: usize,
}

/// Row-partitioned feature matrix whose chunks are resident on workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistributedMatrix {
    columns: Vec<String>,
    chunks: Vec<Chunk>,
}

impl DistributedMatrix {
    pub fn new(columns: Vec<String>, chunks: Vec<Chunk>) -> Self {
        Self { columns, chunks }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn n_cols(&self) -> usize {
        self.columns.len()
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn n_rows(&self) -> usize {
        self.chunks.iter().map(|c| c.n_rows).sum()
    }

    /// Workers holding at least one chunk.
    pub fn workers(&self) -> BTreeSet<WorkerId> {
        self.chunks.iter().map(|c| c.worker).collect()
    }
}

/// Row-partitioned column (labels) whose chunks are resident on workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistributedSeries {
    name: String,
    chunks: Vec<Chunk>,
}

impl DistributedSeries {
    pub fn new(name: impl Into<String>, chunks: Vec<Chunk>) -> Self {
        Self {
            name: name.into(),
            chunks,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn len(&self) -> usize {
        self.chunks.iter().map(|c| c.n_rows).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True when chunk `i` of `self` sits on the same worker, with the same
    /// row count, as chunk `i` of `features`.
    pub fn is_aligned_with(&self, features: &DistributedMatrix) -> bool {
        self.chunks.len() == features.chunks().len()
            && self
                .chunks
                .iter()
                .zip(features.chunks())
                .all(|(a, b)| a.worker == b.worker && a.n_rows == b.n_rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(worker: usize, n_rows: usize) -> Chunk {
        Chunk {
            worker: WorkerId(worker),
            key: BlockKey::new(),
            n_rows,
        }
    }

    #[test]
    fn sizes_and_workers() {
        let m = DistributedMatrix::new(
            vec!["a".into(), "b".into()],
            vec![chunk(0, 3), chunk(1, 4), chunk(0, 2)],
        );
        assert_eq!(m.n_rows(), 9);
        assert_eq!(m.n_cols(), 2);
        assert_eq!(m.workers().len(), 2);
    }

    #[test]
    fn alignment_check() {
        let m = DistributedMatrix::new(vec!["a".into()], vec![chunk(0, 3), chunk(1, 4)]);
        let aligned = DistributedSeries::new("y", vec![chunk(0, 3), chunk(1, 4)]);
        let moved = DistributedSeries::new("y", vec![chunk(1, 3), chunk(1, 4)]);
        assert!(aligned.is_aligned_with(&m));
        assert!(!moved.is_aligned_with(&m));
        assert_eq!(aligned.len(), 7);
    }
}
