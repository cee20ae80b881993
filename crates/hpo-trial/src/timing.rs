//! Uniform stage instrumentation.

use std::future::Future;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageTiming {
    pub stage: String,
    pub fold: usize,
    pub seconds: f64,
}

/// Run `f`, log how long it took and return its result with the timing.
pub fn timed<T>(stage: &str, fold: usize, f: impl FnOnce() -> T) -> (T, StageTiming) {
    let start = Instant::now();
    let result = f();
    (result, finish(stage, fold, start))
}

/// Async counterpart of [`timed`].
pub async fn timed_async<T, F>(stage: &str, fold: usize, fut: F) -> (T, StageTiming)
where
    F: Future<Output = T>,
{
    let start = Instant::now();
    let result = fut.await;
    (result, finish(stage, fold, start))
}

fn finish(stage: &str, fold: usize, start: Instant) -> StageTiming {
    let seconds = start.elapsed().as_secs_f64();
    info!(stage, fold, seconds, "{} time", stage);
    StageTiming {
        stage: stage.to_string(),
        fold,
        seconds,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_stage_and_result() {
        let (value, timing) = timed("fit", 2, || 40 + 2);
        assert_eq!(value, 42);
        assert_eq!(timing.stage, "fit");
        assert_eq!(timing.fold, 2);
        assert!(timing.seconds >= 0.0);
    }

    #[tokio::test]
    async fn async_stages_are_timed_too() {
        let (value, timing) = timed_async("cleanup", 0, async {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            "done"
        })
        .await;
        assert_eq!(value, "done");
        assert!(timing.seconds >= 0.005);
    }
}
