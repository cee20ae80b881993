//! Quantile cut points used to discretise features.

use serde::{Deserialize, Serialize};

/// Up to `max_points` evenly spaced quantiles of `sorted` (ascending, no NaN),
/// deduplicated. Short inputs are returned whole.
pub fn quantile_points(sorted: &[f64], max_points: usize) -> Vec<f64> {
    if sorted.is_empty() || max_points == 0 {
        return Vec::new();
    }
    let mut points: Vec<f64> = if sorted.len() <= max_points {
        sorted.to_vec()
    } else {
        let last = sorted.len() - 1;
        (1..=max_points)
            .map(|i| sorted[i * last / max_points])
            .collect()
    };
    points.dedup();
    points
}

/// Sort a column for sketching.
pub fn sorted_column(values: impl Iterator<Item = f64>) -> Vec<f64> {
    let mut column: Vec<f64> = values.collect();
    column.sort_by(|a, b| a.total_cmp(b));
    column
}

/// Strictly increasing candidate thresholds per feature.
///
/// A value `v` of feature `f` falls in bin `b` = number of cuts below `v`, so
/// the feature has `cuts.len() + 1` bins and "bin <= b" is the same test as
/// `v <= cuts[b]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureCuts {
    cuts: Vec<Vec<f64>>,
}

impl FeatureCuts {
    /// Merge per-worker quantile summaries (`summaries[worker][feature]`)
    /// into global cuts with at most `max_bin` bins per feature.
    pub fn from_summaries(summaries: &[Vec<Vec<f64>>], n_features: usize, max_bin: usize) -> Self {
        let cuts = (0..n_features)
            .map(|f| {
                let merged = sorted_column(
                    summaries
                        .iter()
                        .filter_map(|s| s.get(f))
                        .flat_map(|points| points.iter().copied()),
                );
                Self::cuts_from_sorted(&merged, max_bin)
            })
            .collect();
        Self { cuts }
    }

    /// Cuts for a single sorted column.
    pub fn cuts_from_sorted(sorted: &[f64], max_bin: usize) -> Vec<f64> {
        let mut points = quantile_points(sorted, max_bin);
        // nothing lies above the maximum, so it is never a useful threshold
        if let (Some(&last), Some(&max)) = (points.last(), sorted.last()) {
            if last >= max {
                points.pop();
            }
        }
        points
    }

    pub fn n_features(&self) -> usize {
        self.cuts.len()
    }

    pub fn n_bins(&self, feature: usize) -> usize {
        self.cuts[feature].len() + 1
    }

    pub fn total_bins(&self) -> usize {
        (0..self.n_features()).map(|f| self.n_bins(f)).sum()
    }

    pub fn bin(&self, feature: usize, value: f64) -> usize {
        self.cuts[feature].partition_point(|&c| c < value)
    }

    /// Raw threshold equivalent to splitting after `bin`.
    pub fn threshold(&self, feature: usize, bin: usize) -> f64 {
        self.cuts[feature][bin]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_columns_keep_every_distinct_value() {
        assert_eq!(quantile_points(&[1.0, 1.0, 2.0, 3.0], 8), vec![1.0, 2.0, 3.0]);
        assert!(quantile_points(&[], 8).is_empty());
    }

    #[test]
    fn long_columns_are_sketched() {
        let sorted: Vec<f64> = (0..1000).map(f64::from).collect();
        let points = quantile_points(&sorted, 4);
        assert_eq!(points.len(), 4);
        assert_eq!(*points.last().unwrap(), 999.0);
    }

    #[test]
    fn bins_agree_with_thresholds() {
        let cuts = FeatureCuts::from_summaries(&[vec![vec![1.0, 2.0, 3.0, 4.0]]], 1, 16);
        assert_eq!(cuts.n_bins(0), 4);
        for v in [0.5, 1.0, 1.5, 2.0, 3.0, 3.5, 4.0, 9.0] {
            let b = cuts.bin(0, v);
            for split in 0..cuts.n_bins(0) - 1 {
                assert_eq!(b <= split, v <= cuts.threshold(0, split));
            }
        }
    }

    #[test]
    fn constant_feature_has_one_bin() {
        let cuts = FeatureCuts::from_summaries(&[vec![vec![5.0]], vec![vec![5.0]]], 1, 16);
        assert_eq!(cuts.n_bins(0), 1);
        assert_eq!(cuts.bin(0, 5.0), 0);
    }

    #[test]
    fn summaries_from_several_workers_merge() {
        let cuts = FeatureCuts::from_summaries(
            &[vec![vec![1.0, 3.0], vec![0.0]], vec![vec![2.0, 4.0], vec![1.0]]],
            2,
            256,
        );
        assert_eq!(cuts.n_bins(0), 4);
        assert_eq!(cuts.n_bins(1), 2);
        assert_eq!(cuts.total_bins(), 6);
    }
}
