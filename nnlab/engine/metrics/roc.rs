use ndarray::ArrayViewD;
use serde::{Deserialize, Serialize};

use crate::{
    dataset::Split,
    error::EngineResult,
    tensor::{score, Predictor, Scored},
};

/// Fewest thresholds accepted.
pub const MIN_ROC_STEPS: usize = 2;
/// Most thresholds accepted.
pub const MAX_ROC_STEPS: usize = 1001;

/// Micro-averaged ROC curve.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RocCurve {
    /// Split the curve was computed on.
    pub dataset: Split,
    /// Samples scored.
    pub sample_count: usize,
    /// Classes pooled.
    pub num_classes: usize,
    /// Trapezoidal area under the curve.
    pub auc: f64,
    /// `[fpr, tpr]` pairs sorted by FPR.
    pub points: Vec<[f64; 2]>,
}

impl RocCurve {
    /// Tags the curve with the split it belongs to.
    #[must_use]
    pub const fn with_dataset(mut self, dataset: Split) -> Self {
        self.dataset = dataset;
        self
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Counts {
    tp: usize,
    fp: usize,
    tn: usize,
    fn_: usize,
}

#[allow(clippy::cast_precision_loss)]
fn rate(hits: usize, misses: usize) -> f64 {
    let total = hits + misses;
    if total == 0 {
        0.0
    } else {
        hits as f64 / total as f64
    }
}

/// Micro-averaged ROC over the first `max_samples` rows; `step_count` is clamped to
/// [`MIN_ROC_STEPS`]..=[`MAX_ROC_STEPS`].
pub fn compute_roc_micro<P>(
    predictor: &P,
    x: &ArrayViewD<'_, f32>,
    y: &ArrayViewD<'_, f32>,
    max_samples: Option<usize>,
    step_count: usize,
    batch_size: usize,
) -> EngineResult<RocCurve>
where
    P: Predictor + ?Sized,
{
    let scored = score(predictor, x, y, max_samples, batch_size)?;
    Ok(roc_from_scored(&scored, step_count))
}

#[allow(clippy::cast_precision_loss)]
fn roc_from_scored(scored: &Scored, step_count: usize) -> RocCurve {
    let steps = step_count.clamp(MIN_ROC_STEPS, MAX_ROC_STEPS);
    // Every (sample, class) pair is one binary observation.
    let pool: Vec<(bool, f32)> = scored
        .probabilities
        .rows()
        .into_iter()
        .zip(&scored.labels)
        .flat_map(|(row, label)| {
            row.iter()
                .enumerate()
                .map(|(class, score)| (class == *label, *score))
                .collect::<Vec<_>>()
        })
        .collect();

    let mut points: Vec<[f64; 2]> = (0..steps)
        .map(|step| {
            let threshold = step as f64 / (steps - 1) as f64;
            let counts = pool
                .iter()
                .fold(Counts::default(), |mut acc, (positive, score)| {
                    let predicted = f64::from(*score) >= threshold;
                    match (*positive, predicted) {
                        (true, true) => acc.tp += 1,
                        (true, false) => acc.fn_ += 1,
                        (false, true) => acc.fp += 1,
                        (false, false) => acc.tn += 1,
                    }
                    acc
                });
            [rate(counts.fp, counts.tn), rate(counts.tp, counts.fn_)]
        })
        .collect();
    points.sort_by(|a, b| a[0].total_cmp(&b[0]).then(a[1].total_cmp(&b[1])));

    let auc = points
        .windows(2)
        .map(|pair| (pair[1][0] - pair[0][0]) * (pair[0][1] + pair[1][1]) / 2.0)
        .sum::<f64>()
        .clamp(0.0, 1.0);

    RocCurve {
        dataset: Split::Test,
        sample_count: scored.sample_count(),
        num_classes: scored.num_classes(),
        auc,
        points,
    }
}
