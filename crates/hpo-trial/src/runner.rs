//! The trial pipeline: provision, ingest, clean, split, fit, predict, score,
//! persist, recycle, report.

use std::io::Write;
use std::sync::Arc;

use chrono::Utc;
use hpo_cluster::{
    detect_accelerators, Block, Chunk, Client, ClusterSpec, DistributedMatrix, DistributedSeries,
    LocalCluster, WorkerPlan,
};
use hpo_data::{drop_missing, DataManager, LocalSplit, TrainTestSplitter};
use hpo_models::{
    accuracy_score, binarize, gbdt, DMatrix, RandomForestClassifier, TrainedModel,
    DEFAULT_THRESHOLD,
};
use hpo_types::{internal_error, ClusterError, Frame, ModelConfig, TrialConfig, TtResult};
use tracing::{debug, error, info, warn};

use crate::report::{write_report, TrialSummary};
use crate::session::TrialSession;
use crate::timing::{timed, timed_async};

/// Train/test features and labels persisted on the cluster workers.
#[derive(Debug, Clone, PartialEq)]
pub struct SplitHandles {
    pub x_train: DistributedMatrix,
    pub y_train: DistributedSeries,
    pub x_test: DistributedMatrix,
    pub y_test: DistributedSeries,
}

/// Runs one HPO trial for a fixed configuration.
#[derive(Debug)]
pub struct TrialRunner {
    config: TrialConfig,
    data: DataManager,
    splitter: TrainTestSplitter,
    session: TrialSession,
}

impl TrialRunner {
    /// Validate `config` and provision the first cluster.
    pub fn new(config: TrialConfig) -> TtResult<Self> {
        config.validate()?;

        let data = DataManager::new(config.input.clone(), config.dataset_columns.clone());
        let splitter = TrainTestSplitter::new(config.test_fraction, config.dataset_dtype);
        let mut runner = Self {
            config,
            data,
            splitter,
            session: TrialSession::new(),
        };

        info!(
            trial = %runner.session.trial_id,
            model = %runner.config.family(),
            folds = runner.config.cv_folds,
            "trial created"
        );

        let (cluster, client) = runner.initialize_cluster()?;
        runner.install(cluster, client);
        Ok(runner)
    }

    pub fn config(&self) -> &TrialConfig {
        &self.config
    }

    pub fn session(&self) -> &TrialSession {
        &self.session
    }

    pub fn data(&self) -> &DataManager {
        &self.data
    }

    /// The live client, or an error once the cluster has been torn down.
    pub fn client(&self) -> TtResult<&Client> {
        self.session
            .client
            .as_ref()
            .ok_or_else(|| ClusterError::ClientClosed.into())
    }

    pub fn worker_plan(&self) -> WorkerPlan {
        let accelerators = self.config.accelerators.unwrap_or_else(detect_accelerators);
        WorkerPlan::new(
            accelerators,
            self.config.input.files.len(),
            self.config.family().is_partition_sensitive(),
        )
    }

    /// Start a local cluster sized by [`worker_plan`](Self::worker_plan) and
    /// connect a client to it.
    pub fn initialize_cluster(&mut self) -> TtResult<(LocalCluster, Client)> {
        let plan = self.worker_plan();
        info!(
            accelerators = plan.accelerators,
            input_files = plan.input_files,
            workers = plan.n_workers,
            capped = plan.is_capped(),
            "initializing cluster"
        );

        let spec = ClusterSpec::new(plan.n_workers, &self.config.output_artifacts_directory);
        let cluster = LocalCluster::start(spec)?;
        let client = cluster.client();
        self.session.plan = Some(plan);
        Ok((cluster, client))
    }

    fn install(&mut self, cluster: LocalCluster, client: Client) {
        self.session.cluster = Some(cluster);
        self.session.client = Some(client);
    }

    /// Load the dataset, reusing the cached frame after the first call.
    pub fn ingest(&self) -> TtResult<Arc<Frame>> {
        self.data.ingest()
    }

    /// Copy of `frame` without rows that have a missing value.
    pub fn handle_missing(&self, frame: &Frame) -> Frame {
        let cleaned = drop_missing(frame);
        info!(
            rows_before = frame.len(),
            rows_after = cleaned.len(),
            "dropped rows with missing values"
        );
        cleaned
    }

    /// Split `frame` with `seed` and persist the four outputs across the
    /// current workers, partition `i` on worker `i mod n_workers`.
    pub fn split(&self, frame: &Frame, seed: u64) -> TtResult<SplitHandles> {
        let local = self.splitter.split(frame, &self.config.label_column, seed)?;
        info!(
            seed,
            train_rows = local.n_train(),
            test_rows = local.n_test(),
            "dataset split"
        );
        self.persist_split(local)
    }

    fn persist_split(&self, local: LocalSplit) -> TtResult<SplitHandles> {
        let client = self.client()?;

        let mut train_groups = Vec::new();
        let mut test_groups = Vec::new();
        for chunk in local.chunks {
            if !chunk.y_train.is_empty() {
                train_groups.push((
                    chunk.partition,
                    vec![Block::Matrix(chunk.x_train), Block::Series(chunk.y_train)],
                ));
            }
            if !chunk.y_test.is_empty() {
                test_groups.push((
                    chunk.partition,
                    vec![Block::Matrix(chunk.x_test), Block::Series(chunk.y_test)],
                ));
            }
        }

        let train = client.persist_across_workers(train_groups)?;
        let test = client.persist_across_workers(test_groups)?;
        debug!(
            blocks = client.has_what().values().map(Vec::len).sum::<usize>(),
            "split persisted"
        );

        let (x_train, y_train) = handles(&local.feature_names, &local.label_name, &train)?;
        let (x_test, y_test) = handles(&local.feature_names, &local.label_name, &test)?;
        Ok(SplitHandles {
            x_train,
            y_train,
            x_test,
            y_test,
        })
    }

    /// Fit the configured model family on the training handles.
    pub fn fit(&self, split: &SplitHandles) -> TtResult<TrainedModel> {
        let client = self.client()?;
        let model = match &self.config.model {
            ModelConfig::XGBoost(params) => {
                let dtrain = DMatrix::new(client, split.x_train.clone(), split.y_train.clone())?;
                TrainedModel::Booster(gbdt::train(client, params, &dtrain)?)
            }
            ModelConfig::RandomForest(params) => TrainedModel::Forest(RandomForestClassifier::fit(
                client,
                params,
                &split.x_train,
                &split.y_train,
            )?),
        };
        info!(family = %model.family(), trees = model.num_trees(), "model fitted");
        Ok(model)
    }

    /// Predictions for `x_test` in chunk order. Boosted-tree probabilities are
    /// binarised at `threshold`; forest predictions are class indices.
    pub fn predict(
        &self,
        model: &TrainedModel,
        x_test: &DistributedMatrix,
        threshold: f64,
    ) -> TtResult<Vec<f64>> {
        let client = self.client()?;
        let predictions = match model {
            TrainedModel::Booster(booster) => {
                binarize(&gbdt::predict(client, booster, x_test)?, threshold)
            }
            TrainedModel::Forest(forest) => forest.predict(client, x_test)?,
        };
        debug!(rows = predictions.len(), "predictions gathered");
        Ok(predictions)
    }

    /// Accuracy of `predictions` against the persisted ground truth; appended
    /// to the session's score log.
    pub fn score(&mut self, y_test: &DistributedSeries, predictions: &[f64]) -> TtResult<f64> {
        let dtype = self.config.dataset_dtype;
        let truth: Vec<f64> = self
            .client()?
            .gather_series(y_test)?
            .into_iter()
            .map(|v| dtype.cast(v))
            .collect();
        let predicted: Vec<f64> = predictions.iter().map(|&v| dtype.cast(v)).collect();

        let score = accuracy_score(&truth, &predicted)?;
        self.session.scores.push(score);
        info!(score, fold = self.session.scores.len() - 1, "fold scored");
        Ok(score)
    }

    /// Persist `model` when `score` beats the best so far. Returns whether a
    /// file was written.
    pub fn save_best(&mut self, score: f64, model: &TrainedModel) -> TtResult<bool> {
        if !self.session.best.is_improved_by(score) {
            debug!(score, best = self.session.best.best_score, "model not saved");
            return Ok(false);
        }
        let path = model.save(&self.config.model_store_directory, &self.config.model_name)?;
        self.session.best.record(score, path);
        Ok(true)
    }

    /// End-of-fold barrier: close the client and cluster, then provision a
    /// fresh pair unless `fold` is the last one.
    pub async fn cleanup(&mut self, fold: usize) -> TtResult<()> {
        if let Some(client) = self.session.client.take() {
            client.close();
        }
        if let Some(cluster) = self.session.cluster.take() {
            cluster.close().await?;
        }

        if fold + 1 >= self.config.cv_folds {
            info!(fold, "cluster released");
            return Ok(());
        }

        let (cluster, client) = self.initialize_cluster()?;
        self.install(cluster, client);
        info!(fold, "cluster reinitialized");
        Ok(())
    }

    /// Run every fold, then report. A failing fold aborts the trial: the
    /// cluster is torn down and nothing is written to `out`.
    pub async fn run(&mut self, out: &mut impl Write) -> TtResult<TrialSummary> {
        for fold in 0..self.config.cv_folds {
            info!(fold, folds = self.config.cv_folds, "starting fold");

            if let Err(e) = self.run_fold(fold) {
                error!(fold, error = %e, "fold failed, aborting trial");
                self.abort().await;
                return Err(e);
            }

            let (cleaned_up, timing) = timed_async("cleanup", fold, self.cleanup(fold)).await;
            self.session.timings.push(timing);
            cleaned_up?;
        }

        self.emit_summary(out)
    }

    fn run_fold(&mut self, fold: usize) -> TtResult<()> {
        let frame = self.stage("ingest", fold, |r| r.ingest())?;
        let cleaned = self.stage("handle_missing", fold, |r| Ok(r.handle_missing(&frame)))?;
        let split = self.stage("split", fold, |r| r.split(&cleaned, fold as u64))?;
        let model = self.stage("fit", fold, |r| r.fit(&split))?;
        let predictions = self.stage("predict", fold, |r| {
            r.predict(&model, &split.x_test, DEFAULT_THRESHOLD)
        })?;
        let score = self.stage("score", fold, |r| r.score(&split.y_test, &predictions))?;

        self.save_best(score, &model)?;
        Ok(())
    }

    /// Close whatever handles are still installed. Teardown failures are
    /// logged so the error that caused the abort is the one returned.
    async fn abort(&mut self) {
        if let Some(client) = self.session.client.take() {
            client.close();
        }
        if let Some(cluster) = self.session.cluster.take() {
            if let Err(e) = cluster.close().await {
                warn!(error = %e, "cluster teardown after a failed fold");
            }
        }
    }

    fn stage<T>(
        &mut self,
        name: &str,
        fold: usize,
        f: impl FnOnce(&mut Self) -> TtResult<T>,
    ) -> TtResult<T> {
        let (result, timing) = timed(name, fold, || f(self));
        self.session.timings.push(timing);
        result
    }

    /// Write the report lines to `out` and return the summary.
    pub fn emit_summary(&self, out: &mut impl Write) -> TtResult<TrialSummary> {
        let final_score = self
            .session
            .scores
            .mean()
            .ok_or_else(|| internal_error!("no fold was scored"))?;

        let summary = TrialSummary {
            trial_id: self.session.trial_id,
            model_family: self.config.family(),
            started_at: self.session.started_at,
            finished_at: Utc::now(),
            elapsed_seconds: self.session.elapsed_seconds(),
            fold_scores: self.session.scores.scores().to_vec(),
            final_score,
            best_score: self.session.best.best_score,
            model_path: self.session.best.model_path.clone(),
            stage_timings: self.session.timings.clone(),
        };

        write_report(out, &summary, self.config.cv_folds)?;
        let cache = serde_json::to_string(&self.data.cache.get_stats())?;
        debug!(%cache, "dataset cache");
        info!(final_score, elapsed = summary.elapsed_seconds, "trial finished");
        Ok(summary)
    }
}

fn handles(
    feature_names: &[String],
    label_name: &str,
    groups: &[Vec<Chunk>],
) -> TtResult<(DistributedMatrix, DistributedSeries)> {
    let mut x = Vec::with_capacity(groups.len());
    let mut y = Vec::with_capacity(groups.len());
    for group in groups {
        match group.as_slice() {
            [features, labels] => {
                x.push(*features);
                y.push(*labels);
            }
            other => {
                return Err(internal_error!(
                    "expected a feature and a label block, got {} blocks",
                    other.len()
                ))
            }
        }
    }
    Ok((
        DistributedMatrix::new(feature_names.to_vec(), x),
        DistributedSeries::new(label_name, y),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hpo_types::{
        InputFormat, ModelError, ModelFamily, RandomForestParams, TrialError, XgboostParams,
    };
    use std::path::{Path, PathBuf};
    use std::time::Duration;
    use tracing_subscriber::EnvFilter;

    /// Two features and a label that is 1 when `f1 > 0.5`. Every tenth row
    /// has a missing `f2`.
    fn write_csv(dir: &Path, name: &str, offset: usize, rows: usize) -> PathBuf {
        let mut text = String::from("f1,f2,label\n");
        for i in 0..rows {
            let f1 = ((i * 37 + offset * 13) % 100) as f64 / 100.0;
            let f2 = ((i * 53 + offset) % 100) as f64 / 100.0;
            let label = if f1 > 0.5 { 1 } else { 0 };
            if i % 10 == 9 {
                text.push_str(&format!("{},,{}\n", f1, label));
            } else {
                text.push_str(&format!("{},{},{}\n", f1, f2, label));
            }
        }
        let path = dir.join(name);
        std::fs::write(&path, text).unwrap();
        path
    }

    fn config(dir: &Path, model: ModelConfig, files: usize, accelerators: usize) -> TrialConfig {
        let files = (0..files)
            .map(|i| write_csv(dir, &format!("part-{}.csv", i), i, 120))
            .collect();
        TrialConfig::new(
            model,
            files,
            InputFormat::Csv,
            vec!["f1".into(), "f2".into(), "label".into()],
            "label",
        )
        .with_accelerators(accelerators)
        .with_directories(dir.join("output"), dir.join("model"))
    }

    fn xgboost() -> ModelConfig {
        ModelConfig::XGBoost(XgboostParams {
            num_boost_round: 10,
            max_depth: 3,
            ..XgboostParams::default()
        })
    }

    fn forest() -> ModelConfig {
        ModelConfig::RandomForest(RandomForestParams {
            n_estimators: 8,
            max_depth: 5,
            seed: Some(3),
            ..RandomForestParams::default()
        })
    }

    #[tokio::test]
    async fn every_fold_is_scored_and_averaged() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path(), forest(), 2, 3).with_cv_folds(3);
        let mut runner = TrialRunner::new(cfg).unwrap();

        let mut out = Vec::new();
        let summary = runner.run(&mut out).await.unwrap();

        assert_eq!(summary.fold_scores.len(), 3);
        let mean = summary.fold_scores.iter().sum::<f64>() / 3.0;
        assert!((summary.final_score - mean).abs() < 1e-12);
        assert!(summary.final_score > 0.8);
        assert_eq!(summary.model_family, ModelFamily::RandomForest);

        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("fold scores : ["));
        let last = text.lines().last().unwrap();
        assert_eq!(last, format!("final-score: {:?};", summary.final_score));

        // the dataset was read once and served from the cache afterwards
        let stats = runner.data().cache.get_stats();
        assert_eq!(stats.stores, 1);
        assert_eq!(stats.hits, 2);

        // the last fold leaves nothing running
        assert!(!runner.session().has_live_handles());
        assert!(runner.client().is_err());

        for stage in ["ingest", "handle_missing", "split", "fit", "predict", "score", "cleanup"] {
            assert_eq!(
                summary.stage_timings.iter().filter(|t| t.stage == stage).count(),
                3,
                "stage {}",
                stage
            );
        }
        assert!(summary.model_path.unwrap().ends_with("saved_model_mgpu_rf"));
    }

    #[tokio::test]
    async fn boosted_trees_run_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path(), xgboost(), 2, 4);
        let mut runner = TrialRunner::new(cfg).unwrap();

        // capped at the number of input files
        assert_eq!(runner.session().plan.unwrap().n_workers, 2);

        let mut out = Vec::new();
        let summary = runner.run(&mut out).await.unwrap();
        assert_eq!(summary.fold_scores.len(), 1);
        assert!(summary.final_score > 0.8);

        let text = String::from_utf8(out).unwrap();
        assert!(!text.contains("fold scores"));
        assert!(dir.path().join("model").join("saved_model_mgpu_xgb").exists());
    }

    #[tokio::test]
    async fn forest_uses_every_accelerator() {
        let dir = tempfile::tempdir().unwrap();
        let runner = TrialRunner::new(config(dir.path(), forest(), 2, 4)).unwrap();
        let plan = runner.session().plan.unwrap();
        assert_eq!(plan.n_workers, 4);
        assert_eq!(runner.client().unwrap().n_workers(), 4);
    }

    #[tokio::test]
    async fn same_seed_gives_same_split() {
        let dir = tempfile::tempdir().unwrap();
        let runner = TrialRunner::new(config(dir.path(), forest(), 2, 2)).unwrap();
        let frame = runner.handle_missing(&runner.ingest().unwrap());

        let client = runner.client().unwrap();
        let a = runner.split(&frame, 5).unwrap();
        let b = runner.split(&frame, 5).unwrap();
        let c = runner.split(&frame, 6).unwrap();

        let ya = client.gather_series(&a.y_test).unwrap();
        let yb = client.gather_series(&b.y_test).unwrap();
        assert_eq!(ya, yb);
        assert_eq!(a.x_test.n_rows(), b.x_test.n_rows());
        assert_eq!(a.x_train.n_rows() + a.x_test.n_rows(), frame.len());
        // 10% of each 108-row partition is held out
        assert_eq!(a.x_test.n_rows(), 22);
        assert!(a.y_train.is_aligned_with(&a.x_train));

        let local_a = runner.splitter.split(&frame, "label", 5).unwrap();
        let local_c = runner.splitter.split(&frame, "label", 6).unwrap();
        assert_ne!(local_a.chunks[0].test_rows, local_c.chunks[0].test_rows);
        assert_eq!(c.x_test.n_rows(), 22);
    }

    #[tokio::test]
    async fn save_best_only_writes_on_improvement() {
        let dir = tempfile::tempdir().unwrap();
        let mut runner = TrialRunner::new(config(dir.path(), forest(), 1, 1)).unwrap();
        let frame = runner.handle_missing(&runner.ingest().unwrap());
        let split = runner.split(&frame, 0).unwrap();
        let model = runner.fit(&split).unwrap();

        let written: Vec<bool> = [0.70, 0.65, 0.90, 0.88]
            .into_iter()
            .map(|s| runner.save_best(s, &model).unwrap())
            .collect();
        assert_eq!(written, vec![true, false, true, false]);
        assert_eq!(runner.session().best.writes, 2);
        assert_eq!(runner.session().best.best_score, 0.90);

        let path = runner.session().best.model_path.clone().unwrap();
        assert_eq!(path, dir.path().join("model").join("saved_model_mgpu_rf"));
        let saved = RandomForestClassifier::load_model(&path).unwrap();
        assert_eq!(TrainedModel::Forest(saved), model);
    }

    #[tokio::test]
    async fn cleanup_recycles_until_the_last_fold() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path(), forest(), 1, 2).with_cv_folds(2);
        let mut runner = TrialRunner::new(cfg).unwrap();
        let first = runner.session().cluster().unwrap().id();

        runner.cleanup(0).await.unwrap();
        assert!(runner.session().has_live_handles());
        let second = runner.session().cluster().unwrap().id();
        assert_ne!(first, second);
        assert!(!runner.client().unwrap().is_closed());

        runner.cleanup(1).await.unwrap();
        assert!(!runner.session().has_live_handles());
        assert!(matches!(
            runner.client(),
            Err(TrialError::Cluster(ClusterError::ClientClosed))
        ));
        // scratch space of both clusters is gone
        let scratch = dir.path().join("output").join("worker-space");
        assert_eq!(std::fs::read_dir(scratch).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn boosted_trees_reject_an_idle_worker() {
        let dir = tempfile::tempdir().unwrap();
        // bypass the cap: one file spread over three workers
        let mut runner = TrialRunner::new(config(dir.path(), xgboost(), 1, 1)).unwrap();
        let cluster = LocalCluster::start(ClusterSpec::new(3, dir.path().join("output"))).unwrap();
        let client = cluster.client();
        if let Some(old) = runner.session.cluster.take() {
            old.close().await.unwrap();
        }
        runner.install(cluster, client);

        let frame = runner.handle_missing(&runner.ingest().unwrap());
        let split = runner.split(&frame, 0).unwrap();
        let err = runner.fit(&split).unwrap_err();
        assert!(matches!(err, TrialError::Model(ModelError::EmptyWorkerPartition { .. })));
        runner.cleanup(0).await.unwrap();
    }

    #[tokio::test]
    async fn failed_fold_aborts_and_releases_the_cluster() {
        let dir = tempfile::tempdir().unwrap();
        // 2 is not a valid boosted-tree label
        let path = dir.path().join("bad.csv");
        let mut text = String::from("f1,f2,label\n");
        for i in 0..50 {
            text.push_str(&format!("{},{},2\n", i as f64 / 50.0, (i % 7) as f64));
        }
        std::fs::write(&path, text).unwrap();
        let cfg = TrialConfig::new(
            xgboost(),
            vec![path],
            InputFormat::Csv,
            vec!["f1".into(), "f2".into(), "label".into()],
            "label",
        )
        .with_cv_folds(2)
        .with_accelerators(1)
        .with_directories(dir.path().join("output"), dir.path().join("model"));
        let mut runner = TrialRunner::new(cfg).unwrap();

        let mut out = Vec::new();
        let err = runner.run(&mut out).await.unwrap_err();
        assert!(matches!(err, TrialError::Model(ModelError::InvalidLabel { .. })));

        assert!(out.is_empty());
        assert!(runner.session().scores.is_empty());
        assert!(!runner.session().has_live_handles());
        let scratch = dir.path().join("output").join("worker-space");
        assert_eq!(std::fs::read_dir(scratch).unwrap().count(), 0);
        assert!(!dir.path().join("model").exists());
    }

    #[test]
    fn debug_logging_leaves_stdout_to_the_report() {
        let _ = tracing::subscriber::set_global_default(crate::log_subscriber(EnvFilter::new(
            "debug",
        )));
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path(), xgboost(), 2, 2);

        // workers log at debug while stdout is owned by someone else
        let stdout = std::io::stdout();
        let guard = stdout.lock();
        let (tx, rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let rt = tokio::runtime::Runtime::new().unwrap();
            let result = rt.block_on(async {
                let mut runner = TrialRunner::new(cfg)?;
                runner.run(&mut Vec::<u8>::new()).await
            });
            let _ = tx.send(result);
        });
        let finished = rx.recv_timeout(Duration::from_secs(120));
        drop(guard);

        let summary = finished.expect("trial blocked on stdout").unwrap();
        assert!(summary.final_score > 0.8);
    }

    #[tokio::test]
    async fn summary_needs_a_scored_fold() {
        let dir = tempfile::tempdir().unwrap();
        let mut runner = TrialRunner::new(config(dir.path(), forest(), 1, 1)).unwrap();
        let err = runner.emit_summary(&mut Vec::<u8>::new()).unwrap_err();
        assert!(matches!(err, TrialError::Internal(_)));
        runner.cleanup(0).await.unwrap();
    }

    #[test]
    fn invalid_config_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path(), forest(), 1, 1).with_cv_folds(0);
        assert!(matches!(TrialRunner::new(cfg), Err(TrialError::Config(_))));
    }
}
