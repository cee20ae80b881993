//! Seeded train/test partitioning of a cleaned frame.

use hpo_types::{DataError, DenseMatrix, Frame, Partition, Precision, TtResult};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

/// Train/test rows of one source partition, already cast to the target precision.
#[derive(Debug, Clone, PartialEq)]
pub struct SplitChunk {
    pub partition: usize,
    /// Row indices within the source partition, in shuffled order.
    pub train_rows: Vec<usize>,
    pub test_rows: Vec<usize>,
    pub x_train: DenseMatrix,
    pub y_train: Vec<f64>,
    pub x_test: DenseMatrix,
    pub y_test: Vec<f64>,
}

/// Host-side result of a split, before it is persisted on workers.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalSplit {
    pub feature_names: Vec<String>,
    pub label_name: String,
    pub chunks: Vec<SplitChunk>,
}

impl LocalSplit {
    pub fn n_train(&self) -> usize {
        self.chunks.iter().map(|c| c.y_train.len()).sum()
    }

    pub fn n_test(&self) -> usize {
        self.chunks.iter().map(|c| c.y_test.len()).sum()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TrainTestSplitter {
    test_fraction: f64,
    dtype: Precision,
}

impl TrainTestSplitter {
    pub fn new(test_fraction: f64, dtype: Precision) -> Self {
        Self {
            test_fraction,
            dtype,
        }
    }

    /// Shuffle each partition with a generator keyed by `(seed, partition)`
    /// and cut off the leading `round(n * test_fraction)` rows as test rows.
    pub fn split(&self, frame: &Frame, label_column: &str, seed: u64) -> TtResult<LocalSplit> {
        let label_idx = frame
            .column_index(label_column)
            .ok_or_else(|| DataError::InvalidFormat {
                message: format!("label column '{}' not in dataset", label_column),
            })?;

        if frame.len() < 2 {
            return Err(DataError::InsufficientData {
                message: format!("cannot split {} rows into train and test", frame.len()),
            }
            .into());
        }

        let feature_idx: Vec<usize> = (0..frame.schema().len())
            .filter(|&i| i != label_idx)
            .collect();
        let feature_names = feature_idx
            .iter()
            .map(|&i| frame.schema()[i].clone())
            .collect();

        let mut chunks = Vec::with_capacity(frame.n_partitions());
        for (p, part) in frame.partitions().iter().enumerate() {
            let mut rows: Vec<usize> = (0..part.n_rows()).collect();
            rows.shuffle(&mut partition_rng(seed, p));

            let n_test = ((part.n_rows() as f64) * self.test_fraction).round() as usize;
            let (test_rows, train_rows) = rows.split_at(n_test.min(rows.len()));

            chunks.push(SplitChunk {
                partition: p,
                x_train: self.features(part, train_rows, &feature_idx)?,
                y_train: self.labels(part, train_rows, label_idx)?,
                x_test: self.features(part, test_rows, &feature_idx)?,
                y_test: self.labels(part, test_rows, label_idx)?,
                train_rows: train_rows.to_vec(),
                test_rows: test_rows.to_vec(),
            });
        }

        let split = LocalSplit {
            feature_names,
            label_name: label_column.to_string(),
            chunks,
        };

        if split.n_train() == 0 || split.n_test() == 0 {
            return Err(DataError::InsufficientData {
                message: format!(
                    "split left {} train and {} test rows",
                    split.n_train(),
                    split.n_test()
                ),
            }
            .into());
        }

        Ok(split)
    }

    fn features(&self, part: &Partition, rows: &[usize], cols: &[usize]) -> TtResult<DenseMatrix> {
        let mut values = Vec::with_capacity(rows.len() * cols.len());
        for &r in rows {
            for &c in cols {
                values.push(self.dtype.cast(present(part, r, c)?));
            }
        }
        DenseMatrix::from_row_major(rows.len(), cols.len(), values)
    }

    fn labels(&self, part: &Partition, rows: &[usize], label_idx: usize) -> TtResult<Vec<f64>> {
        rows.iter()
            .map(|&r| present(part, r, label_idx).map(|v| self.dtype.cast(v)))
            .collect()
    }
}

fn present(part: &Partition, row: usize, col: usize) -> TtResult<f64> {
    part.value(row, col).ok_or_else(|| {
        DataError::InvalidFormat {
            message: format!(
                "missing value at row {} column {}; drop missing rows before splitting",
                row, col
            ),
        }
        .into()
    })
}

fn partition_rng(seed: u64, partition: usize) -> ChaCha8Rng {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    rng.set_stream(partition as u64);
    rng
}
