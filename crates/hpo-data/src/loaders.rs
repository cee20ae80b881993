use std::fs;
use std::path::{Path, PathBuf};

use arrow::array::{Array, Float64Array};
use arrow::compute::cast;
use arrow::datatypes::DataType;
use arrow::record_batch::RecordBatch;
use hpo_types::{DataError, Frame, InputFormat, Partition, TrialError, TtResult};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ProjectionMask;

/// Tokens read as a missing value in delimited text.
const MISSING_TOKENS: &[&str] = &["", "NA", "N/A", "NaN", "nan", "null", "NULL", "None"];

/// Reads a set of input files into a [`Frame`], one partition per file.
#[derive(Debug, Clone)]
pub struct FrameLoader {
    columns: Vec<String>,
    batch_size: usize,
}

impl FrameLoader {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            batch_size: 8192,
        }
    }

    /// Load every file in `files` with the given format.
    pub fn load(&self, files: &[PathBuf], format: InputFormat) -> TtResult<Frame> {
        let mut partitions = Vec::with_capacity(files.len());
        for path in files {
            let partition = match format {
                InputFormat::Parquet => self.load_parquet_file(path)?,
                InputFormat::Csv => self.load_csv_file(path)?,
            };
            partitions.push(partition);
        }
        Frame::new(self.columns.clone(), partitions)
    }

    /// Load the configured columns from a Parquet file.
    ///
    /// Every projected column is cast to `Float64`; nulls and NaNs become
    /// missing values.
    pub fn load_parquet_file<P: AsRef<Path>>(&self, file_path: P) -> TtResult<Partition> {
        let path = file_path.as_ref();
        tracing::debug!("Loading Parquet data from: {}", path.display());

        if !path.exists() {
            return Err(DataError::SourceNotFound(path.display().to_string()).into());
        }

        let file = fs::File::open(path)?;
        let builder = ParquetRecordBatchReaderBuilder::try_new(file).map_err(|e| {
            DataError::LoadingFailed {
                message: format!("Failed to create Parquet reader for {}: {}", path.display(), e),
            }
        })?;

        for name in &self.columns {
            if builder.schema().field_with_name(name).is_err() {
                return Err(DataError::InvalidFormat {
                    message: format!("column '{}' not found in {}", name, path.display()),
                }
                .into());
            }
        }

        let mask = ProjectionMask::columns(
            builder.parquet_schema(),
            self.columns.iter().map(String::as_str),
        );
        let reader = builder
            .with_projection(mask)
            .with_batch_size(self.batch_size)
            .build()
            .map_err(|e| TrialError::Parquet(format!("Failed to build Parquet reader: {}", e)))?;

        let mut columns: Vec<Vec<Option<f64>>> = vec![Vec::new(); self.columns.len()];
        for batch_result in reader {
            let batch = batch_result.map_err(|e| DataError::LoadingFailed {
                message: format!("Failed to read Parquet batch: {}", e),
            })?;
            self.append_record_batch(&batch, &mut columns)?;
        }

        let partition = Partition::new(columns)?;
        tracing::debug!(
            "Loaded {} rows from Parquet file: {}",
            partition.n_rows(),
            path.display()
        );
        Ok(partition)
    }

    fn append_record_batch(
        &self,
        batch: &RecordBatch,
        columns: &mut [Vec<Option<f64>>],
    ) -> TtResult<()> {
        let schema = batch.schema();
        for (out, name) in columns.iter_mut().zip(&self.columns) {
            let idx = schema
                .index_of(name)
                .map_err(|e| TrialError::Arrow(e.to_string()))?;
            let as_f64 = cast(batch.column(idx), &DataType::Float64).map_err(|e| {
                DataError::InvalidFormat {
                    message: format!("column '{}' is not numeric: {}", name, e),
                }
            })?;
            let values = as_f64
                .as_any()
                .downcast_ref::<Float64Array>()
                .ok_or_else(|| DataError::InvalidFormat {
                    message: format!("column '{}' did not cast to Float64", name),
                })?;

            out.extend((0..values.len()).map(|i| {
                if values.is_null(i) || values.value(i).is_nan() {
                    None
                } else {
                    Some(values.value(i))
                }
            }));
        }
        Ok(())
    }

    /// Load a delimited-text file. The configured column names replace the
    /// file's own header row, which is skipped.
    pub fn load_csv_file<P: AsRef<Path>>(&self, file_path: P) -> TtResult<Partition> {
        use csv::ReaderBuilder;

        let path = file_path.as_ref();
        tracing::debug!("Loading CSV data from: {}", path.display());

        if !path.exists() {
            return Err(DataError::SourceNotFound(path.display().to_string()).into());
        }

        let mut rdr = ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_path(path)
            .map_err(|e| DataError::LoadingFailed {
                message: format!("Failed to open CSV file {}: {}", path.display(), e),
            })?;

        let mut columns: Vec<Vec<Option<f64>>> = vec![Vec::new(); self.columns.len()];
        for (line_num, result) in rdr.records().enumerate() {
            // header occupies line 1
            let line = line_num + 2;
            let record = result.map_err(|e| DataError::LoadingFailed {
                message: format!("Failed to read CSV record at line {}: {}", line, e),
            })?;

            if record.len() != self.columns.len() {
                return Err(DataError::ParseError {
                    message: format!(
                        "CSV record at line {} has {} fields, expected {}",
                        line,
                        record.len(),
                        self.columns.len()
                    ),
                }
                .into());
            }

            for ((out, field), name) in columns.iter_mut().zip(record.iter()).zip(&self.columns) {
                out.push(parse_field(field, name, line)?);
            }
        }

        let partition = Partition::new(columns)?;
        tracing::debug!(
            "Loaded {} rows from CSV file: {}",
            partition.n_rows(),
            path.display()
        );
        Ok(partition)
    }
}

/// Parse one delimited field; missing tokens map to `None`.
fn parse_field(field: &str, column: &str, line: usize) -> TtResult<Option<f64>> {
    let trimmed = field.trim();
    if MISSING_TOKENS.contains(&trimmed) {
        return Ok(None);
    }
    match trimmed {
        "true" | "True" => return Ok(Some(1.0)),
        "false" | "False" => return Ok(Some(0.0)),
        _ => {}
    }
    trimmed
        .parse::<f64>()
        .map(|v| if v.is_nan() { None } else { Some(v) })
        .map_err(|e| {
            DataError::ParseError {
                message: format!(
                    "Could not parse {} value '{}' at line {}: {}",
                    column, trimmed, line, e
                ),
            }
            .into()
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{ArrayRef, Float32Array, Int64Array};
    use arrow::datatypes::{Field, Schema};
    use parquet::arrow::ArrowWriter;
    use std::io::Write;
    use std::sync::Arc;

    fn write_csv(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(body.as_bytes()).unwrap();
        path
    }

    fn write_parquet(dir: &Path, name: &str) -> PathBuf {
        let schema = Arc::new(Schema::new(vec![
            Field::new("a", DataType::Float32, true),
            Field::new("unused", DataType::Int64, false),
            Field::new("y", DataType::Int64, true),
        ]));
        let a: ArrayRef = Arc::new(Float32Array::from(vec![Some(1.5), None, Some(3.0)]));
        let unused: ArrayRef = Arc::new(Int64Array::from(vec![7, 8, 9]));
        let y: ArrayRef = Arc::new(Int64Array::from(vec![Some(0), Some(1), Some(1)]));
        let batch = RecordBatch::try_new(schema.clone(), vec![a, unused, y]).unwrap();

        let path = dir.join(name);
        let file = fs::File::create(&path).unwrap();
        let mut writer = ArrowWriter::try_new(file, schema, None).unwrap();
        writer.write(&batch).unwrap();
        writer.close().unwrap();
        path
    }

    #[test]
    fn csv_uses_configured_names_and_skips_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_csv(dir.path(), "d.csv", "col_a,col_b,label\n1,2.5,0\n3,,1\n4,NA,0\n");
        let loader = FrameLoader::new(vec!["x0".into(), "x1".into(), "y".into()]);

        let part = loader.load_csv_file(&path).unwrap();
        assert_eq!(part.n_rows(), 3);
        assert_eq!(part.column(0), &[Some(1.0), Some(3.0), Some(4.0)]);
        assert_eq!(part.column(1), &[Some(2.5), None, None]);
        assert_eq!(part.column(2), &[Some(0.0), Some(1.0), Some(0.0)]);
    }

    #[test]
    fn csv_rejects_unparsable_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_csv(dir.path(), "bad.csv", "a,y\nabc,1\n");
        let loader = FrameLoader::new(vec!["a".into(), "y".into()]);
        let err = loader.load_csv_file(&path).unwrap_err();
        assert!(matches!(err, TrialError::Data(DataError::ParseError { .. })));
    }

    #[test]
    fn csv_rejects_wrong_field_count() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_csv(dir.path(), "short.csv", "a,b,y\n1,2\n");
        let loader = FrameLoader::new(vec!["a".into(), "b".into(), "y".into()]);
        assert!(loader.load_csv_file(&path).is_err());
    }

    #[test]
    fn missing_file_is_source_not_found() {
        let loader = FrameLoader::new(vec!["a".into()]);
        let err = loader.load_csv_file("/definitely/not/here.csv").unwrap_err();
        assert!(matches!(err, TrialError::Data(DataError::SourceNotFound(_))));
        let err = loader.load_parquet_file("/definitely/not/here.parquet").unwrap_err();
        assert!(matches!(err, TrialError::Data(DataError::SourceNotFound(_))));
    }

    #[test]
    fn parquet_projects_and_casts_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_parquet(dir.path(), "d.parquet");
        // requested order differs from file order
        let loader = FrameLoader::new(vec!["y".into(), "a".into()]);

        let part = loader.load_parquet_file(&path).unwrap();
        assert_eq!(part.n_cols(), 2);
        assert_eq!(part.column(0), &[Some(0.0), Some(1.0), Some(1.0)]);
        assert_eq!(part.column(1), &[Some(1.5), None, Some(3.0)]);
    }

    #[test]
    fn parquet_missing_column_is_invalid_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_parquet(dir.path(), "d.parquet");
        let loader = FrameLoader::new(vec!["a".into(), "nope".into()]);
        let err = loader.load_parquet_file(&path).unwrap_err();
        assert!(matches!(err, TrialError::Data(DataError::InvalidFormat { .. })));
    }

    #[test]
    fn load_builds_one_partition_per_file() {
        let dir = tempfile::tempdir().unwrap();
        let files = vec![
            write_csv(dir.path(), "p0.csv", "a,y\n1,0\n2,1\n"),
            write_csv(dir.path(), "p1.csv", "a,y\n3,1\n"),
        ];
        let loader = FrameLoader::new(vec!["a".into(), "y".into()]);
        let frame = loader.load(&files, InputFormat::Csv).unwrap();
        assert_eq!(frame.n_partitions(), 2);
        assert_eq!(frame.len(), 3);
    }
}
