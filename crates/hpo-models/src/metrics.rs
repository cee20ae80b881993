//! Classification metrics.

use hpo_types::{ModelError, TtResult};

/// Map probabilities to hard labels: `p > threshold` is class 1.
pub fn binarize(probabilities: &[f64], threshold: f64) -> Vec<f64> {
    probabilities
        .iter()
        .map(|&p| if p > threshold { 1.0 } else { 0.0 })
        .collect()
}

/// Fraction of positions where prediction and truth are exactly equal.
pub fn accuracy_score(y_true: &[f64], y_pred: &[f64]) -> TtResult<f64> {
    if y_true.len() != y_pred.len() {
        return Err(ModelError::ShapeMismatch {
            expected: y_true.len(),
            actual: y_pred.len(),
        }
        .into());
    }
    if y_true.is_empty() {
        return Err(ModelError::EmptyInput {
            message: "accuracy of an empty prediction set".to_string(),
        }
        .into());
    }
    let correct = y_true.iter().zip(y_pred).filter(|(t, p)| t == p).count();
    Ok(correct as f64 / y_true.len() as f64)
}
