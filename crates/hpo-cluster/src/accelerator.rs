//! Accelerator discovery and worker-count planning.

use serde::{Deserialize, Serialize};

/// Environment variable listing the visible accelerator devices.
pub const VISIBLE_DEVICES_ENV: &str = "CUDA_VISIBLE_DEVICES";

/// Number of accelerators available to this process.
///
/// Uses the visible-devices list when it is set and non-empty, otherwise the
/// host's available parallelism.
pub fn detect_accelerators() -> usize {
    if let Ok(devices) = std::env::var(VISIBLE_DEVICES_ENV) {
        let n = count_devices(&devices);
        if n > 0 {
            return n;
        }
    }
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn count_devices(list: &str) -> usize {
    list.split(',').filter(|d| !d.trim().is_empty()).count()
}

/// Worker count for a cluster: one per accelerator, capped at the number of
/// input files when the model family cannot tolerate a worker without data.
/// Never below one.
pub fn plan_worker_count(
    accelerators: usize,
    input_files: usize,
    partition_sensitive: bool,
) -> usize {
    let n = if partition_sensitive {
        accelerators.min(input_files)
    } else {
        accelerators
    };
    n.max(1)
}

/// How a cluster was sized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerPlan {
    pub accelerators: usize,
    pub input_files: usize,
    pub n_workers: usize,
}

impl WorkerPlan {
    pub fn new(accelerators: usize, input_files: usize, partition_sensitive: bool) -> Self {
        Self {
            accelerators,
            input_files,
            n_workers: plan_worker_count(accelerators, input_files, partition_sensitive),
        }
    }

    /// True when the plan provisions fewer workers than accelerators.
    pub fn is_capped(&self) -> bool {
        self.n_workers < self.accelerators
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_sensitive_family_is_capped_at_file_count() {
        assert_eq!(plan_worker_count(8, 3, true), 3);
        assert_eq!(plan_worker_count(2, 5, true), 2);
        assert_eq!(plan_worker_count(4, 4, true), 4);
    }

    #[test]
    fn other_family_uses_all_accelerators() {
        assert_eq!(plan_worker_count(8, 3, false), 8);
        assert_eq!(plan_worker_count(1, 10, false), 1);
    }

    #[test]
    fn never_plans_zero_workers() {
        assert_eq!(plan_worker_count(0, 3, false), 1);
        assert_eq!(plan_worker_count(4, 0, true), 1);
    }

    #[test]
    fn worker_plan_reports_capping() {
        let plan = WorkerPlan::new(4, 2, true);
        assert_eq!(plan.n_workers, 2);
        assert!(plan.is_capped());
        assert!(!WorkerPlan::new(4, 2, false).is_capped());
    }

    #[test]
    fn device_list_counting() {
        assert_eq!(count_devices("0,1,2"), 3);
        assert_eq!(count_devices("0"), 1);
        assert_eq!(count_devices(""), 0);
        assert_eq!(count_devices(" , "), 0);
    }

    #[test]
    fn detection_returns_at_least_one() {
        assert!(detect_accelerators() >= 1);
    }
}
