use ndarray::ArrayViewD;
use serde::{Deserialize, Serialize};

use crate::{
    dataset::Split,
    error::EngineResult,
    tensor::{score, Predictor},
};

/// Per-class counts read off the confusion matrix.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClassStats {
    /// Class index.
    pub class: usize,
    /// Correctly predicted samples of this class.
    pub true_positives: usize,
    /// Samples of other classes predicted as this class.
    pub false_positives: usize,
    /// Samples of this class predicted as something else.
    pub false_negatives: usize,
    /// `tp / (tp + fp)`, 0 when the class was never predicted.
    pub precision: f64,
    /// `tp / (tp + fn)`, 0 when the class never occurs.
    pub recall: f64,
}

/// Confusion matrix with accuracy and macro-averaged precision/recall.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConfusionSummary {
    /// Matrix side length.
    pub num_classes: usize,
    /// Samples tallied.
    pub sample_count: usize,
    /// Rows are true classes, columns predicted classes.
    pub matrix: Vec<Vec<usize>>,
    /// Trace over sample count.
    pub accuracy: f64,
    /// Mean of per-class precision.
    pub macro_precision: f64,
    /// Mean of per-class recall.
    pub macro_recall: f64,
    /// Per-class breakdown.
    pub per_class: Vec<ClassStats>,
}

/// Harmonic mean of precision and recall; 0 when both are 0.
#[must_use]
pub fn f1_score(precision: f64, recall: f64) -> f64 {
    let sum = precision + recall;
    if sum > 0.0 {
        2.0 * precision * recall / sum
    } else {
        0.0
    }
}

#[allow(clippy::cast_precision_loss)]
fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

/// Tallies true/predicted class pairs into a summary.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn confusion_from_indices(
    truth: &[usize],
    predicted: &[usize],
    num_classes: usize,
) -> ConfusionSummary {
    let mut matrix = vec![vec![0_usize; num_classes]; num_classes];
    for (actual, guess) in truth.iter().zip(predicted) {
        if *actual < num_classes && *guess < num_classes {
            matrix[*actual][*guess] += 1;
        }
    }
    let sample_count: usize = matrix.iter().flatten().sum();
    let trace: usize = (0..num_classes).map(|idx| matrix[idx][idx]).sum();

    let per_class: Vec<ClassStats> = (0..num_classes)
        .map(|class| {
            let tp = matrix[class][class];
            let predicted_total: usize = matrix.iter().map(|row| row[class]).sum();
            let actual_total: usize = matrix[class].iter().sum();
            ClassStats {
                class,
                true_positives: tp,
                false_positives: predicted_total - tp,
                false_negatives: actual_total - tp,
                precision: ratio(tp, predicted_total),
                recall: ratio(tp, actual_total),
            }
        })
        .collect();

    let classes = num_classes.max(1) as f64;
    ConfusionSummary {
        num_classes,
        sample_count,
        accuracy: ratio(trace, sample_count),
        macro_precision: per_class.iter().map(|stats| stats.precision).sum::<f64>() / classes,
        macro_recall: per_class.iter().map(|stats| stats.recall).sum::<f64>() / classes,
        matrix,
        per_class,
    }
}

/// Confusion matrix over the first `max_samples` rows of `x`/`y`.
pub fn compute_confusion_matrix<P>(
    predictor: &P,
    x: &ArrayViewD<'_, f32>,
    y: &ArrayViewD<'_, f32>,
    max_samples: Option<usize>,
    batch_size: usize,
) -> EngineResult<ConfusionSummary>
where
    P: Predictor + ?Sized,
{
    let scored = score(predictor, x, y, max_samples, batch_size)?;
    Ok(confusion_from_indices(
        &scored.labels,
        &scored.predicted(),
        scored.num_classes(),
    ))
}

/// Persistable evaluation record for one model and split.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EvaluationResult {
    /// Evaluated model.
    pub model_id: String,
    /// Split evaluated.
    pub dataset: Split,
    /// Class count.
    pub num_classes: usize,
    /// Samples evaluated.
    pub sample_count: usize,
    /// Rows are true classes, columns predicted classes.
    pub confusion_matrix: Vec<Vec<usize>>,
    /// Accuracy.
    pub accuracy: f64,
    /// Macro precision.
    pub macro_precision: f64,
    /// Macro recall.
    pub macro_recall: f64,
    /// F1 of the macro precision/recall.
    pub f1: f64,
    /// Per-class breakdown.
    pub per_class: Vec<ClassStats>,
}

impl EvaluationResult {
    /// Wraps a summary with its model id and split.
    #[must_use]
    pub fn from_summary(
        model_id: impl Into<String>,
        dataset: Split,
        summary: ConfusionSummary,
    ) -> Self {
        Self {
            model_id: model_id.into(),
            dataset,
            num_classes: summary.num_classes,
            sample_count: summary.sample_count,
            f1: f1_score(summary.macro_precision, summary.macro_recall),
            accuracy: summary.accuracy,
            macro_precision: summary.macro_precision,
            macro_recall: summary.macro_recall,
            confusion_matrix: summary.matrix,
            per_class: summary.per_class,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array2, Axis};

    fn always_class_zero(x: ArrayViewD<'_, f32>) -> anyhow::Result<Array2<f32>> {
        let rows = x.len_of(Axis(0));
        Ok(Array2::from_shape_fn((rows, 2), |(_, col)| {
            if col == 0 {
                0.9
            } else {
                0.1
            }
        }))
    }

    #[test]
    fn constant_predictor_scores_zero_precision_without_nan() {
        let x = array![[0.0_f32], [1.0], [2.0], [3.0]].into_dyn();
        let y = array![0.0_f32, 0.0, 1.0, 1.0].into_dyn();
        let summary =
            compute_confusion_matrix(&always_class_zero, &x.view(), &y.view(), None, 2).unwrap();
        assert_eq!(summary.matrix, vec![vec![2, 0], vec![2, 0]]);
        assert!((summary.accuracy - 0.5).abs() < 1e-12);
        assert_eq!(summary.per_class[1].precision, 0.0);
        assert!(summary.macro_precision.is_finite());
        assert!((summary.macro_precision - 0.25).abs() < 1e-12);
        assert!((summary.macro_recall - 0.5).abs() < 1e-12);
    }

    #[test]
    fn max_samples_takes_leading_rows() {
        let x = array![[0.0_f32], [1.0], [2.0], [3.0]].into_dyn();
        let y = array![[1.0_f32, 0.0], [1.0, 0.0], [0.0, 1.0], [0.0, 1.0]].into_dyn();
        let summary =
            compute_confusion_matrix(&always_class_zero, &x.view(), &y.view(), Some(2), 8)
                .unwrap();
        assert_eq!(summary.sample_count, 2);
        assert_eq!(summary.matrix, vec![vec![2, 0], vec![0, 0]]);
        assert!((summary.accuracy - 1.0).abs() < 1e-12);
    }

    #[test]
    fn f1_handles_zero_inputs() {
        assert_eq!(f1_score(0.0, 0.0), 0.0);
        assert!((f1_score(0.5, 0.5) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn evaluation_record_carries_f1() {
        let summary = confusion_from_indices(&[0, 1, 1], &[0, 1, 0], 2);
        let result = EvaluationResult::from_summary("m-1", Split::Test, summary);
        assert_eq!(result.sample_count, 3);
        let expected = f1_score(result.macro_precision, result.macro_recall);
        assert!((result.f1 - expected).abs() < 1e-12);
        let row_sums: usize = result.confusion_matrix.iter().flatten().sum();
        assert_eq!(row_sums, 3);
    }
}
