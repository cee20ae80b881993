//! # hpo-models
//!
//! Tree-ensemble classifiers trained on data resident in an
//! [`hpo_cluster::LocalCluster`].
//!
//! - [`gbdt`]: histogram gradient boosting with a logistic objective
//! - [`forest`]: random forest grown locally on each worker
//! - [`metrics`]: thresholding and accuracy

pub mod binning;
pub mod forest;
pub mod gbdt;
pub mod metrics;
pub mod tree;

use std::path::{Path, PathBuf};

use hpo_types::{ModelFamily, TtResult};
use tracing::info;

pub use forest::RandomForestClassifier;
pub use gbdt::{Booster, DMatrix};
pub use metrics::{accuracy_score, binarize};
pub use tree::{Node, Tree};

/// Probability above which the boosted-tree family predicts class 1.
pub const DEFAULT_THRESHOLD: f64 = 0.5;

/// A fitted model of either family.
#[derive(Debug, Clone, PartialEq)]
pub enum TrainedModel {
    Booster(Booster),
    Forest(RandomForestClassifier),
}

impl TrainedModel {
    pub fn family(&self) -> ModelFamily {
        match self {
            Self::Booster(_) => ModelFamily::XGBoost,
            Self::Forest(_) => ModelFamily::RandomForest,
        }
    }

    pub fn num_trees(&self) -> usize {
        match self {
            Self::Booster(b) => b.num_trees(),
            Self::Forest(f) => f.num_trees(),
        }
    }

    /// Where a model called `name` is stored under `dir`.
    pub fn file_path(&self, dir: &Path, name: &str) -> PathBuf {
        dir.join(format!("{}{}", name, self.family().file_suffix()))
    }

    /// Write the model under `dir`, replacing any earlier file of the same
    /// name. Creates `dir` when missing.
    pub fn save(&self, dir: &Path, name: &str) -> TtResult<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let path = self.file_path(dir, name);
        match self {
            Self::Booster(b) => b.save_model(&path)?,
            Self::Forest(f) => f.save_model(&path)?,
        }
        info!(path = %path.display(), family = %self.family(), "model saved");
        Ok(path)
    }
}

impl From<Booster> for TrainedModel {
    fn from(b: Booster) -> Self {
        Self::Booster(b)
    }
}

impl From<RandomForestClassifier> for TrainedModel {
    fn from(f: RandomForestClassifier) -> Self {
        Self::Forest(f)
    }
}
