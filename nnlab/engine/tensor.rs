//! Tensor helpers shared by the metrics engine: predictor seam, label decoding,
//! deterministic head slicing and batched prediction.

use ndarray::{concatenate, Array2, ArrayView1, ArrayViewD, Axis, Ix2, Slice};

use crate::error::{EngineError, EngineResult};

/// Anything that maps a feature batch (samples on axis 0) to class probabilities `[n, classes]`.
pub trait Predictor {
    /// Runs a forward pass over the batch.
    fn predict(&self, x: ArrayViewD<'_, f32>) -> anyhow::Result<Array2<f32>>;
}

impl<F> Predictor for F
where
    F: Fn(ArrayViewD<'_, f32>) -> anyhow::Result<Array2<f32>>,
{
    fn predict(&self, x: ArrayViewD<'_, f32>) -> anyhow::Result<Array2<f32>> {
        self(x)
    }
}

/// Index of the largest value; NaNs never win and ties keep the first index.
#[must_use]
pub fn argmax(row: ArrayView1<'_, f32>) -> usize {
    let mut best = 0;
    let mut best_value = f32::NEG_INFINITY;
    for (idx, value) in row.iter().enumerate() {
        if *value > best_value {
            best = idx;
            best_value = *value;
        }
    }
    best
}

/// Decodes labels into class indices: rank 2 one-hot rows via arg-max, rank 1 as sparse indices.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn label_indices(y: &ArrayViewD<'_, f32>) -> EngineResult<Vec<usize>> {
    match y.ndim() {
        1 => y
            .iter()
            .map(|value| {
                if value.is_finite() && *value >= 0.0 {
                    Ok(value.round() as usize)
                } else {
                    Err(EngineError::invalid(format!("invalid sparse label {value}")))
                }
            })
            .collect(),
        2 => {
            let rows = y.view().into_dimensionality::<Ix2>()?;
            Ok(rows.rows().into_iter().map(argmax).collect())
        }
        rank => Err(EngineError::rank("labels", "1 (sparse) or 2 (one-hot)", rank)),
    }
}

/// First `max_samples` rows along the sample axis (all rows when `None`).
#[must_use]
pub fn head<'a>(x: &ArrayViewD<'a, f32>, max_samples: Option<usize>) -> ArrayViewD<'a, f32> {
    let rows = x.len_of(Axis(0));
    let take = max_samples.map_or(rows, |cap| cap.min(rows));
    let mut view = x.clone();
    view.slice_axis_inplace(Axis(0), Slice::from(..take));
    view
}

/// Runs the predictor over `x` in chunks of `batch_size` rows and stitches the outputs.
pub fn predict_batched<P>(
    predictor: &P,
    x: &ArrayViewD<'_, f32>,
    batch_size: usize,
) -> EngineResult<Array2<f32>>
where
    P: Predictor + ?Sized,
{
    if x.ndim() == 0 {
        return Err(EngineError::rank("features", ">= 1", 0));
    }
    let rows = x.len_of(Axis(0));
    if rows == 0 {
        return Err(EngineError::invalid("feature tensor has no samples"));
    }
    let mut outputs = Vec::new();
    for chunk in x.axis_chunks_iter(Axis(0), batch_size.max(1)) {
        let expected = chunk.len_of(Axis(0));
        let probs = predictor
            .predict(chunk)
            .map_err(|err| EngineError::model(&err))?;
        if probs.nrows() != expected {
            return Err(EngineError::Model(format!(
                "predict returned {} rows for a batch of {expected}",
                probs.nrows()
            )));
        }
        outputs.push(probs);
    }
    let views: Vec<_> = outputs.iter().map(Array2::view).collect();
    Ok(concatenate(Axis(0), &views)?)
}

/// Predictions and decoded labels for one evaluation pass.
#[derive(Debug, Clone)]
pub struct Scored {
    /// Class probabilities `[n, classes]`.
    pub probabilities: Array2<f32>,
    /// True class per sample.
    pub labels: Vec<usize>,
}

impl Scored {
    /// Number of classes (probability columns).
    #[must_use]
    pub fn num_classes(&self) -> usize {
        self.probabilities.ncols()
    }

    /// Number of scored samples.
    #[must_use]
    pub fn sample_count(&self) -> usize {
        self.labels.len()
    }

    /// Predicted class per sample.
    #[must_use]
    pub fn predicted(&self) -> Vec<usize> {
        self.probabilities.rows().into_iter().map(argmax).collect()
    }
}

/// Predicts on the head slice of `x` and validates it against `y`.
pub fn score<P>(
    predictor: &P,
    x: &ArrayViewD<'_, f32>,
    y: &ArrayViewD<'_, f32>,
    max_samples: Option<usize>,
    batch_size: usize,
) -> EngineResult<Scored>
where
    P: Predictor + ?Sized,
{
    if x.ndim() == 0 || y.ndim() == 0 {
        return Err(EngineError::invalid("features and labels must have a sample axis"));
    }
    if x.len_of(Axis(0)) != y.len_of(Axis(0)) {
        return Err(EngineError::invalid(format!(
            "features have {} samples but labels have {}",
            x.len_of(Axis(0)),
            y.len_of(Axis(0))
        )));
    }
    let x = head(x, max_samples);
    let y = head(y, max_samples);
    let probabilities = predict_batched(predictor, &x, batch_size)?;
    let classes = probabilities.ncols();
    if classes == 0 {
        return Err(EngineError::invalid("predictor returned zero classes"));
    }
    if y.ndim() == 2 && y.len_of(Axis(1)) != classes {
        return Err(EngineError::invalid(format!(
            "one-hot labels have {} classes but predictions have {classes}",
            y.len_of(Axis(1))
        )));
    }
    let labels = label_indices(&y)?;
    if let Some(bad) = labels.iter().find(|label| **label >= classes) {
        return Err(EngineError::invalid(format!(
            "label {bad} out of range for {classes} classes"
        )));
    }
    Ok(Scored {
        probabilities,
        labels,
    })
}

/// Share of samples whose arg-max prediction equals the label.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn accuracy(probabilities: &Array2<f32>, labels: &[usize]) -> f64 {
    if labels.is_empty() {
        return 0.0;
    }
    let correct = probabilities
        .rows()
        .into_iter()
        .zip(labels)
        .filter(|(row, label)| argmax(*row) == **label)
        .count();
    correct as f64 / labels.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array1, ArrayD, IxDyn};

    fn echo(x: ArrayViewD<'_, f32>) -> anyhow::Result<Array2<f32>> {
        Ok(x.into_dimensionality::<ndarray::Ix2>()?.to_owned())
    }

    #[test]
    fn argmax_prefers_first_of_ties_and_skips_nan() {
        assert_eq!(argmax(array![0.2, 0.7, 0.7].view()), 1);
        assert_eq!(argmax(array![f32::NAN, 0.1].view()), 1);
    }

    #[test]
    fn decodes_sparse_and_one_hot_labels() {
        let sparse = Array1::from(vec![2.0_f32, 0.0, 1.0]).into_dyn();
        assert_eq!(label_indices(&sparse.view()).unwrap(), vec![2, 0, 1]);
        let one_hot = array![[0.0_f32, 1.0], [1.0, 0.0]].into_dyn();
        assert_eq!(label_indices(&one_hot.view()).unwrap(), vec![1, 0]);
        let cube = ArrayD::<f32>::zeros(IxDyn(&[2, 2, 2]));
        assert!(matches!(
            label_indices(&cube.view()),
            Err(EngineError::UnsupportedTensorRank { actual: 3, .. })
        ));
    }

    #[test]
    fn batched_prediction_matches_single_pass() {
        let x = ArrayD::from_shape_fn(IxDyn(&[7, 3]), |idx| (idx[0] * 3 + idx[1]) as f32);
        let batched = predict_batched(&echo, &x.view(), 2).unwrap();
        let whole = predict_batched(&echo, &x.view(), 100).unwrap();
        assert_eq!(batched, whole);
        assert_eq!(batched.nrows(), 7);
    }

    #[test]
    fn score_rejects_label_width_mismatch() {
        let x = array![[0.9_f32, 0.1], [0.2, 0.8]].into_dyn();
        let y = array![[1.0_f32, 0.0, 0.0], [0.0, 1.0, 0.0]].into_dyn();
        let err = score(&echo, &x.view(), &y.view(), None, 8).unwrap_err();
        assert_eq!(err.kind(), "invalid_input");
    }

    #[test]
    fn head_slices_first_rows() {
        let x = ArrayD::from_shape_fn(IxDyn(&[5, 2]), |idx| idx[0] as f32);
        let view = x.view();
        let sliced = head(&view, Some(3));
        assert_eq!(sliced.shape(), &[3, 2]);
        assert_eq!(sliced[[2, 0]], 2.0);
        assert_eq!(head(&view, Some(50)).shape(), &[5, 2]);
    }
}
