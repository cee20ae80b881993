//! End-of-trial summary and the score line read by the HPO controller.

use std::io::Write;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use hpo_types::{ModelFamily, TtResult};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::timing::StageTiming;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialSummary {
    pub trial_id: Uuid,
    pub model_family: ModelFamily,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed_seconds: f64,
    pub fold_scores: Vec<f64>,
    pub final_score: f64,
    pub best_score: f64,
    pub model_path: Option<PathBuf>,
    pub stage_timings: Vec<StageTiming>,
}

/// The exact line the controller scrapes for the objective value. The score
/// always carries a decimal point, so a perfect fold prints `1.0`.
pub fn final_score_line(score: f64) -> String {
    format!("final-score: {:?};", score)
}

/// Print the human summary. Fold scores are listed only for multi-fold trials.
pub fn write_report(out: &mut impl Write, summary: &TrialSummary, cv_folds: usize) -> TtResult<()> {
    writeln!(out, "total_time = {:.4} seconds", summary.elapsed_seconds)?;
    if cv_folds > 1 {
        writeln!(out, "fold scores : {:?}", summary.fold_scores)?;
    }
    writeln!(out, "{}", final_score_line(summary.final_score))?;
    out.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(scores: Vec<f64>) -> TrialSummary {
        let n = scores.len() as f64;
        TrialSummary {
            trial_id: Uuid::new_v4(),
            model_family: ModelFamily::XGBoost,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            elapsed_seconds: 1.5,
            final_score: scores.iter().sum::<f64>() / n,
            best_score: 0.83,
            fold_scores: scores,
            model_path: None,
            stage_timings: vec![
                StageTiming { stage: "fit".into(), fold: 0, seconds: 1.0 },
                StageTiming { stage: "fit".into(), fold: 1, seconds: 0.25 },
                StageTiming { stage: "score".into(), fold: 0, seconds: 0.1 },
            ],
        }
    }

    #[test]
    fn score_line_format() {
        assert_eq!(final_score_line(0.75), "final-score: 0.75;");
        assert_eq!(final_score_line(1.0), "final-score: 1.0;");
        assert_eq!(final_score_line(0.0), "final-score: 0.0;");
    }

    #[test]
    fn multi_fold_report_lists_scores() {
        let mut out = Vec::new();
        write_report(&mut out, &summary(vec![0.81, 0.83, 0.80]), 3).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "total_time = 1.5000 seconds");
        assert_eq!(lines[1], "fold scores : [0.81, 0.83, 0.8]");
        assert!(lines[2].starts_with("final-score: 0.8133"));
        assert!(lines[2].ends_with(';'));
    }

    #[test]
    fn single_fold_report_omits_fold_list() {
        let mut out = Vec::new();
        write_report(&mut out, &summary(vec![0.9]), 1).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text.lines().count(), 2);
        assert!(text.contains("final-score: 0.9;"));
    }
}
