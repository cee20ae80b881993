//! Gradient-boosted trees trained across cluster workers.
//!
//! Training follows the histogram method: feature values are bucketed by
//! global quantile cuts, every worker accumulates gradient/hessian histograms
//! over its own rows, and the coordinator reduces them to pick splits. Rows
//! never leave the worker they were persisted on.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use hpo_cluster::{BlockKey, Client, DistributedMatrix, DistributedSeries, WorkerId, WorkerStore};
use hpo_types::{internal_error, DenseMatrix, ModelError, TtResult, XgboostParams};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::binning::{quantile_points, sorted_column, FeatureCuts};
use crate::tree::{Node, Tree};

const HESS_MIN: f64 = 1e-6;

static TRAINING_SEQ: AtomicU64 = AtomicU64::new(0);

/// Training data: features plus aligned labels, resident on the workers.
#[derive(Debug, Clone)]
pub struct DMatrix {
    features: DistributedMatrix,
    labels: DistributedSeries,
}

impl DMatrix {
    /// Wrap persisted training data. Every worker of `client` must hold at
    /// least one chunk; a worker without data cannot take part in training.
    pub fn new(
        client: &Client,
        features: DistributedMatrix,
        labels: DistributedSeries,
    ) -> TtResult<Self> {
        if features.n_cols() == 0 {
            return Err(ModelError::EmptyInput {
                message: "training data has no feature columns".to_string(),
            }
            .into());
        }
        if features.n_rows() == 0 {
            return Err(ModelError::EmptyInput {
                message: "training data has no rows".to_string(),
            }
            .into());
        }
        if !labels.is_aligned_with(&features) {
            return Err(internal_error!(
                "labels '{}' are not co-located with the training features",
                labels.name()
            ));
        }

        let holding = features.workers();
        if let Some(idle) = client.workers().into_iter().find(|w| !holding.contains(w)) {
            return Err(ModelError::EmptyWorkerPartition {
                worker: idle.to_string(),
            }
            .into());
        }

        Ok(Self { features, labels })
    }

    pub fn num_row(&self) -> usize {
        self.features.n_rows()
    }

    pub fn num_col(&self) -> usize {
        self.features.n_cols()
    }

    pub fn feature_names(&self) -> &[String] {
        self.features.columns()
    }

    /// (feature block, label block) pairs grouped by worker.
    fn local_parts(&self) -> BTreeMap<WorkerId, Vec<(BlockKey, BlockKey)>> {
        let mut parts: BTreeMap<WorkerId, Vec<(BlockKey, BlockKey)>> = BTreeMap::new();
        for (x, y) in self.features.chunks().iter().zip(self.labels.chunks()) {
            parts.entry(x.worker).or_default().push((x.key, y.key));
        }
        parts
    }
}

/// A fitted boosted-tree ensemble for binary classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Booster {
    objective: String,
    base_margin: f64,
    feature_names: Vec<String>,
    params: XgboostParams,
    trees: Vec<Tree>,
}

impl Booster {
    pub fn num_trees(&self) -> usize {
        self.trees.len()
    }

    pub fn num_features(&self) -> usize {
        self.feature_names.len()
    }

    pub fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    pub fn params(&self) -> &XgboostParams {
        &self.params
    }

    pub fn trees(&self) -> &[Tree] {
        &self.trees
    }

    pub fn predict_margin_row(&self, row: &[f64]) -> f64 {
        self.base_margin + self.trees.iter().map(|t| t.predict_row(row)).sum::<f64>()
    }

    /// Positive-class probability of `row`.
    pub fn predict_row(&self, row: &[f64]) -> f64 {
        sigmoid(self.predict_margin_row(row))
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

/// Fit a booster on `dtrain` using the workers of `client`.
pub fn train(client: &Client, params: &XgboostParams, dtrain: &DMatrix) -> TtResult<Booster> {
    params.validate()?;

    let parts = dtrain.local_parts();
    let workers: Vec<WorkerId> = parts.keys().copied().collect();
    let n_features = dtrain.num_col();
    let state_key = format!("gbdt-train-{}", TRAINING_SEQ.fetch_add(1, Ordering::Relaxed));

    info!(
        rows = dtrain.num_row(),
        features = n_features,
        workers = workers.len(),
        rounds = params.num_boost_round,
        max_depth = params.max_depth,
        "training boosted trees"
    );

    let part_tasks = || -> Vec<(WorkerId, Vec<(BlockKey, BlockKey)>)> {
        parts.iter().map(|(w, keys)| (*w, keys.clone())).collect()
    };

    let max_bin = params.max_bin;
    let summaries = client.map_tasks(part_tasks(), move |store, keys| {
        summarise(store, &keys, max_bin)
    })?;

    let sketches: Vec<Vec<Vec<f64>>> = summaries.iter().map(|s| s.sketch.clone()).collect();
    let cuts = Arc::new(FeatureCuts::from_summaries(&sketches, n_features, params.max_bin));
    let label_sum: f64 = summaries.iter().map(|s| s.label_sum).sum();
    let n_rows: usize = summaries.iter().map(|s| s.n_rows).sum();
    let base_margin = initial_margin(label_sum / n_rows as f64);
    debug!(base_margin, bins = cuts.total_bins(), "quantile cuts ready");

    let prepared = {
        let cuts = Arc::clone(&cuts);
        let key = state_key.clone();
        client.map_tasks(part_tasks(), move |store, keys| {
            prepare(store, &keys, &cuts, base_margin, &key)
        })
    };

    let trees = prepared.and_then(|_| {
        let mut trees = Vec::with_capacity(params.num_boost_round);
        for round in 0..params.num_boost_round {
            let tree = grow_tree(client, &workers, &state_key, &cuts, params)?;
            debug!(round, leaves = tree.n_leaves(), depth = tree.depth(), "boosting round done");

            let shared = Arc::new(tree.clone());
            let key = state_key.clone();
            client.map_tasks(unit_tasks(&workers), move |store, ()| {
                apply_tree(store, &key, &shared)
            })?;
            trees.push(tree);
        }
        Ok(trees)
    });

    let key = state_key.clone();
    let released = client.map_tasks(unit_tasks(&workers), move |store, ()| {
        store.take_state::<LocalTrainState>(&key);
        Ok(())
    });

    let trees = trees?;
    released?;

    info!(trees = trees.len(), "boosted trees trained");
    Ok(Booster {
        objective: params.objective.clone(),
        base_margin,
        feature_names: dtrain.feature_names().to_vec(),
        params: params.clone(),
        trees,
    })
}

/// Positive-class probabilities for every row of `features`, in chunk order.
/// Inference runs on the workers holding the chunks.
pub fn predict(
    client: &Client,
    booster: &Booster,
    features: &DistributedMatrix,
) -> TtResult<Vec<f64>> {
    if features.n_cols() != booster.num_features() {
        return Err(ModelError::ShapeMismatch {
            expected: booster.num_features(),
            actual: features.n_cols(),
        }
        .into());
    }
    let model = Arc::new(booster.clone());
    let tasks = features.chunks().iter().map(|c| (c.worker, c.key)).collect();
    let parts = client.map_tasks(tasks, move |store, key: BlockKey| {
        model.predict_local(store.matrix(&key)?)
    })?;
    Ok(parts.into_iter().flatten().collect())
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

fn initial_margin(mean_label: f64) -> f64 {
    let p = mean_label.clamp(1e-7, 1.0 - 1e-7);
    (p / (1.0 - p)).ln()
}

fn unit_tasks(workers: &[WorkerId]) -> Vec<(WorkerId, ())> {
    workers.iter().map(|w| (*w, ())).collect()
}

// ---------------------------------------------------------------------------
// gradient statistics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct GradStats {
    grad: f64,
    hess: f64,
    count: u64,
}

impl GradStats {
    fn add(&mut self, other: GradStats) {
        self.grad += other.grad;
        self.hess += other.hess;
        self.count += other.count;
    }

    fn minus(self, other: GradStats) -> GradStats {
        GradStats {
            grad: self.grad - other.grad,
            hess: self.hess - other.hess,
            count: self.count.saturating_sub(other.count),
        }
    }
}

/// Per-bin gradient sums of one tree node, all features laid end to end.
#[derive(Debug, Clone)]
struct Histogram {
    offsets: Vec<usize>,
    bins: Vec<GradStats>,
}

impl Histogram {
    fn new(cuts: &FeatureCuts) -> Self {
        let mut offsets = Vec::with_capacity(cuts.n_features() + 1);
        let mut total = 0;
        offsets.push(0);
        for f in 0..cuts.n_features() {
            total += cuts.n_bins(f);
            offsets.push(total);
        }
        Self {
            offsets,
            bins: vec![GradStats::default(); total],
        }
    }

    fn n_features(&self) -> usize {
        self.offsets.len() - 1
    }

    fn accumulate(&mut self, row_bins: &[u32], grad: f64, hess: f64) {
        for (f, &b) in row_bins.iter().enumerate() {
            let slot = &mut self.bins[self.offsets[f] + b as usize];
            slot.grad += grad;
            slot.hess += hess;
            slot.count += 1;
        }
    }

    fn merge(&mut self, other: &Histogram) {
        for (a, b) in self.bins.iter_mut().zip(&other.bins) {
            a.add(*b);
        }
    }

    fn feature(&self, f: usize) -> &[GradStats] {
        &self.bins[self.offsets[f]..self.offsets[f + 1]]
    }

    fn totals(&self) -> GradStats {
        let mut total = GradStats::default();
        if self.n_features() > 0 {
            for s in self.feature(0) {
                total.add(*s);
            }
        }
        total
    }
}

// ---------------------------------------------------------------------------
// coordinator side
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct SplitCandidate {
    feature: usize,
    bin: usize,
    gain: f64,
    left: GradStats,
    right: GradStats,
}

fn split_gain(left: GradStats, right: GradStats, parent: GradStats, params: &XgboostParams) -> f64 {
    let score = |s: GradStats| s.grad * s.grad / (s.hess + params.lambda);
    0.5 * (score(left) + score(right) - score(parent)) - params.gamma
}

fn leaf_weight(stats: GradStats, params: &XgboostParams) -> f64 {
    let g = stats.grad;
    let shrunk = (g.abs() - params.alpha).max(0.0);
    -g.signum() * shrunk / (stats.hess + params.lambda)
}

fn best_split(hist: &Histogram, params: &XgboostParams) -> Option<SplitCandidate> {
    let parent = hist.totals();
    let mut best: Option<SplitCandidate> = None;

    for f in 0..hist.n_features() {
        let bins = hist.feature(f);
        let mut left = GradStats::default();
        for (b, stats) in bins.iter().enumerate().take(bins.len().saturating_sub(1)) {
            left.add(*stats);
            let right = parent.minus(left);
            if left.count == 0 || right.count == 0 {
                continue;
            }
            if left.hess < params.min_child_weight || right.hess < params.min_child_weight {
                continue;
            }
            let gain = split_gain(left, right, parent, params);
            if gain > best.map_or(0.0, |c| c.gain) {
                best = Some(SplitCandidate {
                    feature: f,
                    bin: b,
                    gain,
                    left,
                    right,
                });
            }
        }
    }
    best
}

fn grow_tree(
    client: &Client,
    workers: &[WorkerId],
    state_key: &str,
    cuts: &Arc<FeatureCuts>,
    params: &XgboostParams,
) -> TtResult<Tree> {
    let key = state_key.to_string();
    let roots = client.map_tasks(unit_tasks(workers), move |store, ()| begin_round(store, &key))?;
    let mut root = GradStats::default();
    for r in roots {
        root.add(r);
    }

    let make_leaf = |stats: GradStats| Node::Leaf {
        value: leaf_weight(stats, params) * params.learning_rate,
    };

    let mut nodes = vec![make_leaf(root)];
    let mut stats = vec![root];
    let mut frontier = vec![0usize];

    for _depth in 0..params.max_depth {
        if frontier.is_empty() {
            break;
        }

        let hists = {
            let key = state_key.to_string();
            let cuts = Arc::clone(cuts);
            let nodes_wanted = Arc::new(frontier.clone());
            let local = client.map_tasks(unit_tasks(workers), move |store, ()| {
                build_histograms(store, &key, &nodes_wanted, &cuts)
            })?;
            reduce_histograms(local)?
        };

        let mut next = Vec::new();
        let mut applied = Vec::new();
        for (node, hist) in frontier.iter().copied().zip(&hists) {
            let Some(split) = best_split(hist, params) else {
                continue;
            };
            let left = nodes.len();
            let right = left + 1;
            nodes.push(make_leaf(split.left));
            nodes.push(make_leaf(split.right));
            stats.push(split.left);
            stats.push(split.right);
            nodes[node] = Node::Split {
                feature: split.feature,
                threshold: cuts.threshold(split.feature, split.bin),
                left,
                right,
            };
            applied.push(AppliedSplit {
                node,
                feature: split.feature,
                bin: split.bin,
                left,
                right,
            });
            next.push(left);
            next.push(right);
        }

        if applied.is_empty() {
            break;
        }
        let key = state_key.to_string();
        let applied = Arc::new(applied);
        client.map_tasks(unit_tasks(workers), move |store, ()| {
            apply_splits(store, &key, &applied)
        })?;
        frontier = next;
    }

    debug_assert_eq!(nodes.len(), stats.len());
    Ok(Tree::from_nodes(nodes))
}

fn reduce_histograms(per_worker: Vec<Vec<Histogram>>) -> TtResult<Vec<Histogram>> {
    let mut iter = per_worker.into_iter();
    let mut total = iter
        .next()
        .ok_or_else(|| internal_error!("no worker returned histograms"))?;
    for local in iter {
        if local.len() != total.len() {
            return Err(internal_error!(
                "histogram count mismatch: {} vs {}",
                local.len(),
                total.len()
            ));
        }
        for (t, l) in total.iter_mut().zip(&local) {
            t.merge(l);
        }
    }
    Ok(total)
}

// ---------------------------------------------------------------------------
// worker side
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct AppliedSplit {
    node: usize,
    feature: usize,
    bin: usize,
    left: usize,
    right: usize,
}

struct LocalSummary {
    sketch: Vec<Vec<f64>>,
    label_sum: f64,
    n_rows: usize,
}

/// Row-major bin indices plus the per-row training buffers of one worker.
struct LocalTrainState {
    n_features: usize,
    bins: Vec<u32>,
    labels: Vec<f64>,
    margins: Vec<f64>,
    grad: Vec<f64>,
    hess: Vec<f64>,
    positions: Vec<usize>,
}

impl LocalTrainState {
    fn row_bins(&self, row: usize) -> &[u32] {
        &self.bins[row * self.n_features..(row + 1) * self.n_features]
    }
}

fn summarise(
    store: &mut WorkerStore,
    parts: &[(BlockKey, BlockKey)],
    max_bin: usize,
) -> TtResult<LocalSummary> {
    let mut label_sum = 0.0;
    let mut n_rows = 0;
    let mut columns: Vec<Vec<f64>> = Vec::new();

    for (xk, yk) in parts {
        let x = store.matrix(xk)?;
        let y = store.series(yk)?;
        if columns.is_empty() {
            columns = vec![Vec::new(); x.n_cols()];
        }
        for &label in y {
            if !(0.0..=1.0).contains(&label) {
                return Err(ModelError::InvalidLabel {
                    message: format!("logistic objective needs labels in [0, 1], got {}", label),
                }
                .into());
            }
            label_sum += label;
        }
        n_rows += x.n_rows();
        for (f, column) in columns.iter_mut().enumerate() {
            column.extend(x.column_values(f));
        }
    }

    let sketch = columns
        .into_iter()
        .map(|c| quantile_points(&sorted_column(c.into_iter()), max_bin))
        .collect();

    Ok(LocalSummary {
        sketch,
        label_sum,
        n_rows,
    })
}

fn prepare(
    store: &mut WorkerStore,
    parts: &[(BlockKey, BlockKey)],
    cuts: &FeatureCuts,
    base_margin: f64,
    state_key: &str,
) -> TtResult<()> {
    let n_features = cuts.n_features();
    let mut bins = Vec::new();
    let mut labels = Vec::new();

    for (xk, yk) in parts {
        let x = store.matrix(xk)?;
        let y = store.series(yk)?;
        for row in x.rows() {
            bins.extend(row.iter().enumerate().map(|(f, &v)| cuts.bin(f, v) as u32));
        }
        labels.extend_from_slice(y);
    }

    let n = labels.len();
    debug!(worker = %store.worker(), rows = n, "training rows binned");
    store.put_state(
        state_key,
        LocalTrainState {
            n_features,
            bins,
            labels,
            margins: vec![base_margin; n],
            grad: vec![0.0; n],
            hess: vec![0.0; n],
            positions: vec![0; n],
        },
    );
    Ok(())
}

/// Logistic gradients of the current margins; every row goes back to the root.
fn begin_round(store: &mut WorkerStore, state_key: &str) -> TtResult<GradStats> {
    let state = store.state_mut::<LocalTrainState>(state_key)?;
    let mut total = GradStats::default();
    for i in 0..state.labels.len() {
        let p = sigmoid(state.margins[i]);
        state.grad[i] = p - state.labels[i];
        state.hess[i] = (p * (1.0 - p)).max(HESS_MIN);
        state.positions[i] = 0;
        total.add(GradStats {
            grad: state.grad[i],
            hess: state.hess[i],
            count: 1,
        });
    }
    Ok(total)
}

fn build_histograms(
    store: &mut WorkerStore,
    state_key: &str,
    frontier: &[usize],
    cuts: &FeatureCuts,
) -> TtResult<Vec<Histogram>> {
    let state = store.state::<LocalTrainState>(state_key)?;
    let slot: HashMap<usize, usize> = frontier.iter().enumerate().map(|(i, &n)| (n, i)).collect();
    let mut hists = vec![Histogram::new(cuts); frontier.len()];
    for row in 0..state.labels.len() {
        if let Some(&i) = slot.get(&state.positions[row]) {
            hists[i].accumulate(state.row_bins(row), state.grad[row], state.hess[row]);
        }
    }
    Ok(hists)
}

fn apply_splits(store: &mut WorkerStore, state_key: &str, splits: &[AppliedSplit]) -> TtResult<()> {
    let state = store.state_mut::<LocalTrainState>(state_key)?;
    let by_node: HashMap<usize, &AppliedSplit> = splits.iter().map(|s| (s.node, s)).collect();
    for row in 0..state.positions.len() {
        if let Some(split) = by_node.get(&state.positions[row]) {
            let bin = state.bins[row * state.n_features + split.feature] as usize;
            state.positions[row] = if bin <= split.bin { split.left } else { split.right };
        }
    }
    Ok(())
}

fn apply_tree(store: &mut WorkerStore, state_key: &str, tree: &Tree) -> TtResult<()> {
    let worker = store.worker();
    let state = store.state_mut::<LocalTrainState>(state_key)?;
    for row in 0..state.positions.len() {
        match tree.nodes().get(state.positions[row]) {
            Some(Node::Leaf { value }) => state.margins[row] += value,
            _ => {
                return Err(internal_error!(
                    "row {} on {} did not finish in a leaf",
                    row,
                    worker
                ))
            }
        }
    }
    Ok(())
}
