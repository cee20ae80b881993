//! Partitioned tabular data and dense numeric blocks.

use serde::{Deserialize, Serialize};

use crate::errors::{DataError, TtResult};

/// One partition of a [`Frame`], stored column-major.
///
/// `None` marks a missing value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Partition {
    columns: Vec<Vec<Option<f64>>>,
    n_rows: usize,
}

impl Partition {
    pub fn new(columns: Vec<Vec<Option<f64>>>) -> TtResult<Self> {
        let n_rows = columns.first().map(Vec::len).unwrap_or(0);
        if let Some(bad) = columns.iter().position(|c| c.len() != n_rows) {
            return Err(DataError::InvalidFormat {
                message: format!(
                    "column {} has {} rows, expected {}",
                    bad,
                    columns[bad].len(),
                    n_rows
                ),
            }
            .into());
        }
        Ok(Self { columns, n_rows })
    }

    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    pub fn n_cols(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.n_rows == 0
    }

    pub fn column(&self, idx: usize) -> &[Option<f64>] {
        &self.columns[idx]
    }

    pub fn value(&self, row: usize, col: usize) -> Option<f64> {
        self.columns[col][row]
    }

    /// True when every field of `row` is present.
    pub fn row_is_complete(&self, row: usize) -> bool {
        self.columns.iter().all(|c| c[row].is_some())
    }

    /// Keep only the rows whose index satisfies `keep`, preserving order.
    pub fn filter_rows(&self, mut keep: impl FnMut(usize) -> bool) -> Self {
        let kept: Vec<usize> = (0..self.n_rows).filter(|&r| keep(r)).collect();
        self.take_rows(&kept)
    }

    /// Gather the given rows, in the given order.
    pub fn take_rows(&self, rows: &[usize]) -> Self {
        let columns = self
            .columns
            .iter()
            .map(|col| rows.iter().map(|&r| col[r]).collect())
            .collect();
        Self {
            columns,
            n_rows: rows.len(),
        }
    }
}

/// A lazily-shaped, partitioned table: a schema and one partition per source file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    schema: Vec<String>,
    partitions: Vec<Partition>,
}

impl Frame {
    pub fn new(schema: Vec<String>, partitions: Vec<Partition>) -> TtResult<Self> {
        for (i, part) in partitions.iter().enumerate() {
            if part.n_cols() != schema.len() {
                return Err(DataError::InvalidFormat {
                    message: format!(
                        "partition {} has {} columns, schema has {}",
                        i,
                        part.n_cols(),
                        schema.len()
                    ),
                }
                .into());
            }
        }
        Ok(Self { schema, partitions })
    }

    pub fn schema(&self) -> &[String] {
        &self.schema
    }

    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    pub fn n_partitions(&self) -> usize {
        self.partitions.len()
    }

    /// Total number of rows across all partitions.
    pub fn len(&self) -> usize {
        self.partitions.iter().map(Partition::n_rows).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.schema.iter().position(|c| c == name)
    }

    /// Apply `f` to every partition, keeping the schema.
    pub fn map_partitions(&self, f: impl Fn(&Partition) -> Partition) -> Self {
        Self {
            schema: self.schema.clone(),
            partitions: self.partitions.iter().map(f).collect(),
        }
    }
}

/// Dense row-major matrix of features.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DenseMatrix {
    n_rows: usize,
    n_cols: usize,
    values: Vec<f64>,
}

impl DenseMatrix {
    pub fn from_row_major(n_rows: usize, n_cols: usize, values: Vec<f64>) -> TtResult<Self> {
        if values.len() != n_rows * n_cols {
            return Err(DataError::InvalidFormat {
                message: format!(
                    "matrix of {}x{} needs {} values, got {}",
                    n_rows,
                    n_cols,
                    n_rows * n_cols,
                    values.len()
                ),
            }
            .into());
        }
        Ok(Self {
            n_rows,
            n_cols,
            values,
        })
    }

    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    pub fn n_cols(&self) -> usize {
        self.n_cols
    }

    pub fn row(&self, idx: usize) -> &[f64] {
        let start = idx * self.n_cols;
        &self.values[start..start + self.n_cols]
    }

    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.values[row * self.n_cols + col]
    }

    pub fn rows(&self) -> impl Iterator<Item = &[f64]> {
        (0..self.n_rows).map(move |r| self.row(r))
    }

    pub fn column_values(&self, col: usize) -> impl Iterator<Item = f64> + '_ {
        (0..self.n_rows).map(move |r| self.get(r, col))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn partition() -> Partition {
        Partition::new(vec![
            vec![Some(1.0), None, Some(3.0)],
            vec![Some(10.0), Some(20.0), Some(30.0)],
        ])
        .unwrap()
    }

    #[test]
    fn partition_rejects_ragged_columns() {
        let result = Partition::new(vec![vec![Some(1.0)], vec![Some(1.0), Some(2.0)]]);
        assert!(result.is_err());
    }

    #[test]
    fn filter_rows_keeps_order() {
        let part = partition();
        let complete = part.filter_rows(|r| part.row_is_complete(r));
        assert_eq!(complete.n_rows(), 2);
        assert_eq!(complete.column(0), &[Some(1.0), Some(3.0)]);
        assert_eq!(complete.column(1), &[Some(10.0), Some(30.0)]);
    }

    #[test]
    fn frame_checks_schema_width() {
        let err = Frame::new(vec!["a".into()], vec![partition()]);
        assert!(err.is_err());

        let empty = Partition::new(vec![Vec::new(), Vec::new()]).unwrap();
        let frame = Frame::new(vec!["a".into(), "b".into()], vec![partition(), empty]).unwrap();
        assert_eq!(frame.len(), 3);
        assert_eq!(frame.n_partitions(), 2);
        assert_eq!(frame.column_index("b"), Some(1));
    }

    #[test]
    fn dense_matrix_rows() {
        let m = DenseMatrix::from_row_major(2, 3, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        assert_eq!(m.row(1), &[4.0, 5.0, 6.0]);
        assert_eq!(m.rows().count(), 2);
        assert_eq!(m.column_values(2).collect::<Vec<_>>(), vec![3.0, 6.0]);
        assert!(DenseMatrix::from_row_major(2, 2, vec![1.0]).is_err());
    }
}
