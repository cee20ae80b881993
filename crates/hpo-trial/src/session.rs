//! Mutable state of one trial: live cluster handles, scores, best model.

use std::path::PathBuf;
use std::time::Instant;

use chrono::{DateTime, Utc};
use hpo_cluster::{Client, LocalCluster, WorkerPlan};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::timing::StageTiming;

/// Append-only accuracies, one per completed fold.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreLog {
    scores: Vec<f64>,
}

impl ScoreLog {
    pub fn push(&mut self, score: f64) {
        self.scores.push(score);
    }

    pub fn scores(&self) -> &[f64] {
        &self.scores
    }

    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    /// Arithmetic mean, `None` before the first fold completes.
    pub fn mean(&self) -> Option<f64> {
        if self.scores.is_empty() {
            return None;
        }
        Some(self.scores.iter().sum::<f64>() / self.scores.len() as f64)
    }
}

/// Best score seen so far and the model file written for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BestState {
    pub best_score: f64,
    pub model_path: Option<PathBuf>,
    pub writes: usize,
}

impl Default for BestState {
    fn default() -> Self {
        Self {
            best_score: -1.0,
            model_path: None,
            writes: 0,
        }
    }
}

impl BestState {
    pub fn is_improved_by(&self, score: f64) -> bool {
        score > self.best_score
    }

    pub fn record(&mut self, score: f64, path: PathBuf) {
        self.best_score = score;
        self.model_path = Some(path);
        self.writes += 1;
    }
}

/// Everything a trial accumulates between construction and the report.
pub struct TrialSession {
    pub trial_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub(crate) clock: Instant,
    pub(crate) cluster: Option<LocalCluster>,
    pub(crate) client: Option<Client>,
    pub plan: Option<WorkerPlan>,
    pub scores: ScoreLog,
    pub best: BestState,
    pub timings: Vec<StageTiming>,
}

impl TrialSession {
    pub fn new() -> Self {
        Self {
            trial_id: Uuid::new_v4(),
            started_at: Utc::now(),
            clock: Instant::now(),
            cluster: None,
            client: None,
            plan: None,
            scores: ScoreLog::default(),
            best: BestState::default(),
            timings: Vec::new(),
        }
    }

    pub fn elapsed_seconds(&self) -> f64 {
        self.clock.elapsed().as_secs_f64()
    }

    pub fn cluster(&self) -> Option<&LocalCluster> {
        self.cluster.as_ref()
    }

    pub fn client(&self) -> Option<&Client> {
        self.client.as_ref()
    }

    /// True while a cluster and a client are installed.
    pub fn has_live_handles(&self) -> bool {
        self.cluster.is_some() && self.client.is_some()
    }
}

impl Default for TrialSession {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TrialSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrialSession")
            .field("trial_id", &self.trial_id)
            .field("cluster", &self.cluster)
            .field("scores", &self.scores)
            .field("best", &self.best)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mean_of_fold_scores() {
        let mut log = ScoreLog::default();
        assert_eq!(log.mean(), None);
        for s in [0.81, 0.83, 0.80] {
            log.push(s);
        }
        assert_eq!(log.len(), 3);
        assert!((log.mean().unwrap() - 0.813_333_333).abs() < 1e-6);
    }

    #[test]
    fn best_state_starts_below_any_accuracy() {
        let best = BestState::default();
        assert!(best.is_improved_by(0.0));
        assert_eq!(best.writes, 0);
    }

    #[test]
    fn improvement_is_strict() {
        let mut best = BestState::default();
        best.record(0.7, PathBuf::from("m"));
        assert!(!best.is_improved_by(0.7));
        assert!(best.is_improved_by(0.7000001));
    }
}
