//! Dense softmax classifier used as the stand-in tensor runtime.

use anyhow::{bail, Context};
use ndarray::{s, Array1, Array2, ArrayView2, ArrayViewD, Axis};
use rand::{rngs::SmallRng, Rng, SeedableRng};

use crate::{
    model::{
        EpochCallback, EpochMetrics, FitOptions, ModelRecord, TrainableModel, TrainingHistory,
        ValidationData,
    },
    tensor::{accuracy, argmax, label_indices},
};

const LOG_FLOOR: f32 = 1e-7;

/// Single dense layer followed by softmax, trained with mini-batch gradient descent.
#[derive(Debug, Clone)]
pub struct SoftmaxRegression {
    weights: Array2<f32>,
    bias: Array1<f32>,
    learning_rate: f32,
}

impl SoftmaxRegression {
    /// Randomly initialized model; the seed makes runs reproducible.
    #[must_use]
    pub fn new(inputs: usize, classes: usize, seed: u64) -> Self {
        let mut rng = SmallRng::seed_from_u64(seed);
        let weights = Array2::from_shape_fn((inputs, classes), |_| rng.gen_range(-0.1..0.1));
        Self {
            weights,
            bias: Array1::zeros(classes),
            learning_rate: 0.1,
        }
    }

    /// Sizes the layer from a registry record.
    #[must_use]
    pub fn from_record(record: &ModelRecord, seed: u64) -> Self {
        let inputs = record.input_shape.iter().product::<usize>().max(1);
        Self::new(inputs, record.num_classes.max(1), seed)
            .with_learning_rate(record.compile.learning_rate)
    }

    /// Overrides the default learning rate.
    #[must_use]
    pub const fn with_learning_rate(mut self, learning_rate: f32) -> Self {
        self.learning_rate = learning_rate;
        self
    }

    /// Input width.
    #[must_use]
    pub fn inputs(&self) -> usize {
        self.weights.nrows()
    }

    /// Output classes.
    #[must_use]
    pub fn classes(&self) -> usize {
        self.weights.ncols()
    }

    fn flatten(&self, x: &ArrayViewD<'_, f32>) -> anyhow::Result<Array2<f32>> {
        let rows = x.len_of(Axis(0));
        let width = if rows == 0 { 0 } else { x.len() / rows };
        if width != self.inputs() {
            bail!(
                "expected {} input values per sample, got {width}",
                self.inputs()
            );
        }
        Ok(x.to_shape((rows, width))
            .context("flattening features")?
            .into_owned())
    }

    fn targets(&self, y: &ArrayViewD<'_, f32>) -> anyhow::Result<Array2<f32>> {
        let labels = label_indices(y)?;
        if let Some(bad) = labels.iter().find(|label| **label >= self.classes()) {
            bail!("label {bad} out of range for {} classes", self.classes());
        }
        let mut one_hot = Array2::zeros((labels.len(), self.classes()));
        for (row, label) in labels.iter().enumerate() {
            one_hot[[row, *label]] = 1.0;
        }
        Ok(one_hot)
    }

    fn forward(&self, x: &ArrayView2<'_, f32>) -> Array2<f32> {
        let mut logits = x.dot(&self.weights) + &self.bias;
        for mut row in logits.rows_mut() {
            let peak = row.fold(f32::NEG_INFINITY, |acc, v| acc.max(*v));
            row.mapv_inplace(|v| (v - peak).exp());
            let total = row.sum();
            row.mapv_inplace(|v| v / total);
        }
        logits
    }

    fn sgd_step(&mut self, x: &ArrayView2<'_, f32>, targets: &ArrayView2<'_, f32>, lr: f32) {
        #[allow(clippy::cast_precision_loss)]
        let scale = lr / x.nrows().max(1) as f32;
        let grad = self.forward(x) - targets;
        self.weights.scaled_add(-scale, &x.t().dot(&grad));
        self.bias.scaled_add(-scale, &grad.sum_axis(Axis(0)));
    }

    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    fn loss_and_accuracy(
        &self,
        x: &ArrayView2<'_, f32>,
        targets: &ArrayView2<'_, f32>,
    ) -> (f32, f32) {
        let probs = self.forward(x);
        let rows = x.nrows().max(1);
        let total: f32 = probs
            .iter()
            .zip(targets.iter())
            .map(|(p, t)| -t * p.max(LOG_FLOOR).ln())
            .sum();
        let labels: Vec<usize> = targets.rows().into_iter().map(argmax).collect();
        (total / rows as f32, accuracy(&probs, &labels) as f32)
    }
}

impl TrainableModel for SoftmaxRegression {
    fn fit(
        &mut self,
        x: ArrayViewD<'_, f32>,
        y: ArrayViewD<'_, f32>,
        options: &FitOptions<'_>,
        on_epoch_end: &mut EpochCallback<'_>,
    ) -> anyhow::Result<TrainingHistory> {
        let features = self.flatten(&x)?;
        let targets = self.targets(&y)?;
        let rows = features.nrows();

        let (train_rows, validation) = match &options.validation {
            ValidationData::None => (rows, None),
            ValidationData::Split(fraction) => {
                #[allow(
                    clippy::cast_precision_loss,
                    clippy::cast_possible_truncation,
                    clippy::cast_sign_loss
                )]
                let held = ((rows as f32) * fraction.clamp(0.0, 1.0)).round() as usize;
                let held = held.min(rows.saturating_sub(1));
                if held == 0 {
                    (rows, None)
                } else {
                    let cut = rows - held;
                    let val = (
                        features.slice(s![cut.., ..]).to_owned(),
                        targets.slice(s![cut.., ..]).to_owned(),
                    );
                    (cut, Some(val))
                }
            }
            ValidationData::Data { x, y } => (rows, Some((self.flatten(x)?, self.targets(y)?))),
        };
        if train_rows == 0 {
            bail!("no training samples");
        }

        let train_x = features.slice(s![..train_rows, ..]);
        let train_y = targets.slice(s![..train_rows, ..]);
        let lr = options.learning_rate.unwrap_or(self.learning_rate);
        let batch = options.batch_size.max(1);
        let mut history = TrainingHistory::default();

        for epoch in 0..options.epochs {
            for (bx, by) in train_x
                .axis_chunks_iter(Axis(0), batch)
                .zip(train_y.axis_chunks_iter(Axis(0), batch))
            {
                self.sgd_step(&bx, &by, lr);
            }
            let (loss, acc) = self.loss_and_accuracy(&train_x, &train_y);
            let (val_loss, val_acc) = match &validation {
                Some((vx, vy)) => {
                    let (l, a) = self.loss_and_accuracy(&vx.view(), &vy.view());
                    (Some(l), Some(a))
                }
                None => (None, None),
            };
            let metrics = EpochMetrics {
                loss,
                acc,
                val_loss,
                val_acc,
            };
            history.record(&metrics);
            on_epoch_end(epoch, &metrics);
        }
        Ok(history)
    }

    fn predict(&self, x: ArrayViewD<'_, f32>) -> anyhow::Result<Array2<f32>> {
        let features = self.flatten(&x)?;
        Ok(self.forward(&features.view()))
    }

    fn evaluate(
        &self,
        x: ArrayViewD<'_, f32>,
        y: ArrayViewD<'_, f32>,
    ) -> anyhow::Result<(f32, f32)> {
        let features = self.flatten(&x)?;
        let targets = self.targets(&y)?;
        Ok(self.loss_and_accuracy(&features.view(), &targets.view()))
    }

    fn dense_kernel(&self) -> Option<Array2<f32>> {
        Some(self.weights.clone())
    }

    fn summary(&self) -> String {
        format!("softmax_regression({}->{})", self.inputs(), self.classes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{ArrayD, IxDyn};

    fn separable(rows: usize) -> (ArrayD<f32>, ArrayD<f32>) {
        let x = ArrayD::from_shape_fn(IxDyn(&[rows, 2]), |idx| {
            let sign = if idx[0] % 2 == 0 { -1.0 } else { 1.0 };
            if idx[1] == 0 {
                sign
            } else {
                0.5
            }
        });
        #[allow(clippy::cast_precision_loss)]
        let y = ArrayD::from_shape_fn(IxDyn(&[rows]), |idx| (idx[0] % 2) as f32);
        (x, y)
    }

    #[test]
    fn learns_a_separable_problem() {
        let (x, y) = separable(20);
        let mut model = SoftmaxRegression::new(2, 2, 3).with_learning_rate(0.5);
        let mut seen = Vec::new();
        let options = FitOptions {
            epochs: 30,
            batch_size: 4,
            learning_rate: None,
            validation: ValidationData::Split(0.2),
        };
        let history = model
            .fit(x.view(), y.view(), &options, &mut |epoch, metrics| {
                seen.push((epoch, metrics.val_loss.is_some()));
            })
            .unwrap();
        assert_eq!(history.epochs(), 30);
        assert_eq!(history.val_loss.len(), 30);
        assert_eq!(seen.len(), 30);
        assert_eq!(seen[0], (0, true));
        assert!(history.loss[29] < history.loss[0]);
        let (_, acc) = model.evaluate(x.view(), y.view()).unwrap();
        assert!(acc > 0.9);
    }

    #[test]
    fn predictions_are_probabilities() {
        let (x, _) = separable(5);
        let model = SoftmaxRegression::new(2, 3, 1);
        let probs = model.predict(x.view()).unwrap();
        assert_eq!(probs.dim(), (5, 3));
        for row in probs.rows() {
            assert!((row.sum() - 1.0).abs() < 1e-5);
        }
        assert_eq!(model.dense_kernel().unwrap().dim(), (2, 3));
    }

    #[test]
    fn rejects_wrong_input_width() {
        let model = SoftmaxRegression::new(4, 2, 1);
        let x = ArrayD::<f32>::zeros(IxDyn(&[3, 2]));
        assert!(model.predict(x.view()).is_err());
    }

    #[test]
    fn image_inputs_are_flattened() {
        let model = SoftmaxRegression::new(8, 2, 1);
        let x = ArrayD::<f32>::zeros(IxDyn(&[3, 2, 2, 2]));
        assert_eq!(model.predict(x.view()).unwrap().nrows(), 3);
        assert_eq!(model.summary(), "softmax_regression(8->2)");
    }
}
