pub mod cache;
pub mod clean;
pub mod loaders;
pub mod split;

pub use cache::*;
pub use clean::*;
pub use loaders::*;
pub use split::*;

use std::sync::Arc;

use hpo_types::{Frame, InputConfig, TtResult};

/// Data manager coordinates ingestion and the per-trial dataset cache
#[derive(Debug)]
pub struct DataManager {
    pub input: InputConfig,
    pub loader: loaders::FrameLoader,
    pub cache: cache::DatasetCache,
}

impl DataManager {
    pub fn new(input: InputConfig, columns: Vec<String>) -> Self {
        Self {
            input,
            loader: loaders::FrameLoader::new(columns),
            cache: cache::DatasetCache::new(),
        }
    }

    /// Return the cached dataset, reading the input files only on first use.
    pub fn ingest(&self) -> TtResult<Arc<Frame>> {
        let mut loaded = false;
        let frame = self.cache.get_or_load(|| {
            loaded = true;
            tracing::info!(
                format = %self.input.format,
                files = self.input.files.len(),
                "data ingestion"
            );
            self.loader.load(&self.input.files, self.input.format)
        })?;

        if loaded {
            tracing::info!(
                rows = frame.len(),
                partitions = frame.n_partitions(),
                "dataset loaded"
            );
        } else {
            tracing::info!("skipping ingestion, using cache");
        }
        Ok(frame)
    }
}
