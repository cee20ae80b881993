//! Random-forest classifier whose trees are grown where the data lives.
//!
//! The ensemble is split across the workers holding training chunks; each
//! worker bootstraps from its own rows only and grows its share of trees in
//! parallel. Fitted trees are gathered back into one model.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

use hpo_cluster::{BlockKey, Client, DistributedMatrix, DistributedSeries, WorkerId, WorkerStore};
use hpo_types::{internal_error, DenseMatrix, ModelError, RandomForestParams, TtResult};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::binning::{sorted_column, FeatureCuts};
use crate::tree::{Node, Tree};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RandomForestClassifier {
    params: RandomForestParams,
    /// Observed label values, ascending. Trees vote with indices into it.
    classes: Vec<usize>,
    feature_names: Vec<String>,
    trees: Vec<Tree>,
}

impl RandomForestClassifier {
    /// Fit on persisted features `x` and aligned labels `y`. Labels must be
    /// non-negative integers; only the values actually present become classes.
    pub fn fit(
        client: &Client,
        params: &RandomForestParams,
        x: &DistributedMatrix,
        y: &DistributedSeries,
    ) -> TtResult<Self> {
        params.validate()?;
        if x.n_cols() == 0 || x.n_rows() == 0 {
            return Err(ModelError::EmptyInput {
                message: format!("cannot fit a forest on {}x{} data", x.n_rows(), x.n_cols()),
            }
            .into());
        }
        if !y.is_aligned_with(x) {
            return Err(internal_error!(
                "labels '{}' are not co-located with the training features",
                y.name()
            ));
        }

        let mut parts: BTreeMap<WorkerId, Vec<(BlockKey, BlockKey)>> = BTreeMap::new();
        for (xc, yc) in x.chunks().iter().zip(y.chunks()) {
            parts.entry(xc.worker).or_default().push((xc.key, yc.key));
        }

        let scan_tasks = parts.iter().map(|(w, keys)| (*w, keys.clone())).collect();
        let observed = client.map_tasks(scan_tasks, |store, keys: Vec<(BlockKey, BlockKey)>| {
            observed_labels(store, &keys)
        })?;
        let classes: Vec<usize> = observed
            .into_iter()
            .flatten()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let seed = params.seed.unwrap_or_else(|| rand::thread_rng().gen());
        let shares = allocate_trees(params.n_estimators, parts.len());

        info!(
            rows = x.n_rows(),
            features = x.n_cols(),
            classes = classes.len(),
            trees = params.n_estimators,
            workers = parts.len(),
            "training random forest"
        );

        let mut first_tree = 0;
        let mut grow_tasks = Vec::new();
        for ((worker, keys), n_trees) in parts.into_iter().zip(shares) {
            if n_trees > 0 {
                grow_tasks.push((worker, (keys, first_tree, n_trees)));
            }
            first_tree += n_trees;
        }

        let settings = Arc::new(GrowSettings {
            max_depth: params.max_depth,
            max_features: params.max_features,
            n_bins: params.n_bins,
            classes: classes.clone(),
            seed,
        });
        let grown = client.map_tasks(
            grow_tasks,
            move |store, (keys, first, n_trees): (Vec<(BlockKey, BlockKey)>, usize, usize)| {
                grow_local_trees(store, &keys, first, n_trees, &settings)
            },
        )?;
        let trees: Vec<Tree> = grown.into_iter().flatten().collect();

        info!(trees = trees.len(), "random forest trained");
        Ok(Self {
            params: params.clone(),
            classes,
            feature_names: x.columns().to_vec(),
            trees,
        })
    }

    pub fn n_classes(&self) -> usize {
        self.classes.len()
    }

    pub fn classes(&self) -> &[usize] {
        &self.classes
    }

    pub fn num_trees(&self) -> usize {
        self.trees.len()
    }

    pub fn num_features(&self) -> usize {
        self.feature_names.len()
    }

    pub fn params(&self) -> &RandomForestParams {
        &self.params
    }

    /// Majority vote of the trees; ties go to the lowest label.
    pub fn predict_row(&self, row: &[f64]) -> f64 {
        let mut votes = vec![0usize; self.classes.len().max(1)];
        for tree in &self.trees {
            let class = tree.predict_row(row) as usize;
            if let Some(v) = votes.get_mut(class) {
                *v += 1;
            }
        }
        self.classes.get(argmax(&votes)).copied().unwrap_or(0) as f64
    }

    pub fn predict_local(&self, features: &DenseMatrix) -> TtResult<Vec<f64>> {
        if features.n_cols() != self.num_features() {
            return Err(ModelError::ShapeMismatch {
                expected: self.num_features(),
                actual: features.n_cols(),
            }
            .into());
        }
        Ok(features.rows().map(|row| self.predict_row(row)).collect())
    }

    /// Predicted label per row of `features`, in chunk order.
    pub fn predict(&self, client: &Client, features: &DistributedMatrix) -> TtResult<Vec<f64>> {
        let model = Arc::new(self.clone());
        let tasks = features.chunks().iter().map(|c| (c.worker, c.key)).collect();
        let parts = client.map_tasks(tasks, move |store, key: BlockKey| {
            model.predict_local(store.matrix(&key)?)
        })?;
        Ok(parts.into_iter().flatten().collect())
    }

    pub fn save_model(&self, path: impl AsRef<Path>) -> TtResult<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn load_model(path: impl AsRef<Path>) -> TtResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

/// Trees per worker: an even share, remainder to the first workers.
pub fn allocate_trees(n_estimators: usize, n_workers: usize) -> Vec<usize> {
    if n_workers == 0 {
        return Vec::new();
    }
    let base = n_estimators / n_workers;
    let extra = n_estimators % n_workers;
    (0..n_workers).map(|i| base + usize::from(i < extra)).collect()
}

/// Integer class label of a label value.
pub fn coerce_label(value: f64) -> TtResult<usize> {
    let rounded = value.round();
    if !value.is_finite()
        || rounded < 0.0
        || (value - rounded).abs() > 1e-6
        || rounded > i32::MAX as f64
    {
        return Err(ModelError::InvalidLabel {
            message: format!("{} is not a class label", value),
        }
        .into());
    }
    Ok(rounded as i32 as usize)
}

fn argmax(counts: &[usize]) -> usize {
    let mut best = 0;
    for (i, &c) in counts.iter().enumerate() {
        if c > counts[best] {
            best = i;
        }
    }
    best
}

fn gini(counts: &[usize], n: usize) -> f64 {
    if n == 0 {
        return 0.0;
    }
    let n = n as f64;
    1.0 - counts.iter().map(|&c| (c as f64 / n).powi(2)).sum::<f64>()
}

fn observed_labels(
    store: &mut WorkerStore,
    parts: &[(BlockKey, BlockKey)],
) -> TtResult<BTreeSet<usize>> {
    let mut labels = BTreeSet::new();
    for (_, yk) in parts {
        for &label in store.series(yk)? {
            labels.insert(coerce_label(label)?);
        }
    }
    Ok(labels)
}

#[derive(Debug, Clone)]
struct GrowSettings {
    max_depth: usize,
    max_features: f64,
    n_bins: usize,
    classes: Vec<usize>,
    seed: u64,
}

impl GrowSettings {
    fn n_classes(&self) -> usize {
        self.classes.len()
    }

    fn class_index(&self, label: usize) -> TtResult<usize> {
        self.classes
            .binary_search(&label)
            .map_err(|_| internal_error!("label {} was not seen when scanning classes", label))
    }
}

/// A worker's training rows copied out of its store.
struct LocalRows {
    n_features: usize,
    values: Vec<f64>,
    labels: Vec<usize>,
    thresholds: Vec<Vec<f64>>,
}

impl LocalRows {
    fn value(&self, row: usize, feature: usize) -> f64 {
        self.values[row * self.n_features + feature]
    }
}

fn grow_local_trees(
    store: &mut WorkerStore,
    parts: &[(BlockKey, BlockKey)],
    first_tree: usize,
    n_trees: usize,
    settings: &GrowSettings,
) -> TtResult<Vec<Tree>> {
    let mut values = Vec::new();
    let mut labels = Vec::new();
    let mut n_features = 0;
    for (xk, yk) in parts {
        let x = store.matrix(xk)?;
        n_features = x.n_cols();
        for row in x.rows() {
            values.extend_from_slice(row);
        }
        for &label in store.series(yk)? {
            labels.push(settings.class_index(coerce_label(label)?)?);
        }
    }
    if labels.is_empty() {
        return Ok(Vec::new());
    }

    let thresholds = (0..n_features)
        .map(|f| {
            let column = sorted_column(values.iter().skip(f).step_by(n_features).copied());
            FeatureCuts::cuts_from_sorted(&column, settings.n_bins)
        })
        .collect();
    let rows = LocalRows {
        n_features,
        values,
        labels,
        thresholds,
    };

    let trees: Vec<Tree> = (first_tree..first_tree + n_trees)
        .into_par_iter()
        .map(|index| grow_tree(&rows, settings, index))
        .collect();

    debug!(
        worker = %store.worker(),
        rows = rows.labels.len(),
        trees = trees.len(),
        "local trees grown"
    );
    Ok(trees)
}

fn grow_tree(rows: &LocalRows, settings: &GrowSettings, index: usize) -> Tree {
    let mut rng = ChaCha8Rng::seed_from_u64(settings.seed);
    rng.set_stream(index as u64);

    let n = rows.labels.len();
    let mut sample: Vec<usize> = (0..n).map(|_| rng.gen_range(0..n)).collect();
    let mut nodes = Vec::new();
    grow_node(rows, settings, &mut rng, &mut nodes, &mut sample, 0);
    Tree::from_nodes(nodes)
}

fn grow_node(
    rows: &LocalRows,
    settings: &GrowSettings,
    rng: &mut ChaCha8Rng,
    nodes: &mut Vec<Node>,
    sample: &mut [usize],
    depth: usize,
) -> usize {
    let mut counts = vec![0usize; settings.n_classes()];
    for &r in sample.iter() {
        counts[rows.labels[r]] += 1;
    }

    let idx = nodes.len();
    nodes.push(Node::Leaf {
        value: argmax(&counts) as f64,
    });

    let pure = counts.iter().filter(|&&c| c > 0).count() <= 1;
    if depth >= settings.max_depth || sample.len() < 2 || pure {
        return idx;
    }
    let Some((feature, threshold)) = best_split(rows, settings, rng, sample, &counts) else {
        return idx;
    };

    let mut mid = 0;
    for i in 0..sample.len() {
        if rows.value(sample[i], feature) <= threshold {
            sample.swap(i, mid);
            mid += 1;
        }
    }
    let (left_rows, right_rows) = sample.split_at_mut(mid);
    let left = grow_node(rows, settings, rng, nodes, left_rows, depth + 1);
    let right = grow_node(rows, settings, rng, nodes, right_rows, depth + 1);
    nodes[idx] = Node::Split {
        feature,
        threshold,
        left,
        right,
    };
    idx
}

/// Lowest weighted Gini impurity over a random subset of features, if any
/// candidate improves on the parent.
fn best_split(
    rows: &LocalRows,
    settings: &GrowSettings,
    rng: &mut ChaCha8Rng,
    sample: &[usize],
    parent: &[usize],
) -> Option<(usize, f64)> {
    let n_features = rows.n_features;
    let k = ((settings.max_features * n_features as f64).round() as usize).clamp(1, n_features);
    let n = sample.len();
    let n_classes = settings.n_classes();

    let mut best_impurity = gini(parent, n) - 1e-12;
    let mut best = None;

    for feature in sample_features(rng, n_features, k) {
        let cuts = &rows.thresholds[feature];
        if cuts.is_empty() {
            continue;
        }

        let mut hist = vec![0usize; (cuts.len() + 1) * n_classes];
        for &r in sample {
            let v = rows.value(r, feature);
            let bin = cuts.partition_point(|&c| c < v);
            hist[bin * n_classes + rows.labels[r]] += 1;
        }

        let mut left = vec![0usize; n_classes];
        let mut n_left = 0;
        for (bin, &threshold) in cuts.iter().enumerate() {
            for c in 0..n_classes {
                let count = hist[bin * n_classes + c];
                left[c] += count;
                n_left += count;
            }
            let n_right = n - n_left;
            if n_left == 0 || n_right == 0 {
                continue;
            }
            let right: Vec<usize> = parent.iter().zip(&left).map(|(p, l)| p - l).collect();
            let impurity = (n_left as f64 * gini(&left, n_left)
                + n_right as f64 * gini(&right, n_right))
                / n as f64;
            if impurity < best_impurity {
                best_impurity = impurity;
                best = Some((feature, threshold));
            }
        }
    }
    best
}

fn sample_features(rng: &mut ChaCha8Rng, n_features: usize, k: usize) -> Vec<usize> {
    if k >= n_features {
        return (0..n_features).collect();
    }
    let mut picked = rand::seq::index::sample(rng, n_features, k).into_vec();
    picked.sort_unstable();
    picked
}
