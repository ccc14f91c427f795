//! Label supervision over inferred categorical heads.

use std::collections::BTreeSet;

use anyhow::{bail, ensure, Context, Result};

use super::{align_value_to_params, Criterion, Metrics, PerplexityMeter, StepState};
use crate::dist::Params;
use crate::tensor::Number;

/// Cross entropy between inferred class predictions and observed labels.
///
/// Fires only for targets whose labels are present in the inference trace,
/// so the same criterion serves mixed labeled/unlabeled batches: an
/// unlabeled batch contributes a zero loss. All-zero label rows are padding
/// and count neither for the loss nor for accuracy.
pub struct Supervision {
    name: String,
    weight: f64,
    targets: BTreeSet<String>,
    metrics: Metrics,
    perplexity: PerplexityMeter,
}

impl Supervision {
    pub fn new<I, S>(name: impl Into<String>, targets: I) -> Supervision
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Supervision {
            name: name.into(),
            weight: 1.0,
            targets: targets.into_iter().map(Into::into).collect(),
            metrics: Metrics::new(),
            perplexity: PerplexityMeter::new(),
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Supervision {
        self.weight = weight;
        self
    }

    pub fn get_perplexity(&self) -> f64 {
        self.perplexity.value()
    }

    pub fn reset_perplexity(&mut self) {
        self.perplexity.reset();
    }
}

/// First maximum wins on ties.
fn argmax<N: Number>(row: &[N]) -> usize {
    let mut best = 0;
    for (index, value) in row.iter().enumerate() {
        if value.to_f64() > row[best].to_f64() {
            best = index;
        }
    }
    best
}

impl<N: Number> Criterion<N> for Supervision {
    fn name(&self) -> &str {
        &self.name
    }

    fn weight(&self) -> f64 {
        self.weight
    }

    fn get_loss(&mut self, state: &StepState<'_, N>, _actual: bool) -> Result<f64> {
        self.metrics.clear();
        let mut total = 0.0;
        for target in &self.targets {
            let Some(star) = state.inference.observed(target) else {
                continue;
            };
            let params = state.inference.params(target).with_context(|| {
                format!("supervised variable {target:?} has no inferred parameters")
            })?;
            let logits = match params {
                Params::Categorical { logits } | Params::MultiCategorical { logits } => logits,
                Params::Gaussian { .. } => {
                    bail!("supervision expects a categorical prediction for {target:?}")
                }
            };
            let star = align_value_to_params(star, params)?;
            ensure!(
                star.shape() == logits.shape(),
                "labels for {target:?} have shape {:?}, predictions {:?}",
                star.shape(),
                logits.shape()
            );
            let log_probs = logits.log_softmax_last_axis()?;
            let classes = *log_probs
                .shape()
                .last()
                .context("categorical logits cannot be rank 0")?;

            let mut rows = 0usize;
            let mut correct = 0usize;
            let mut nll = 0.0;
            for (predicted, label) in log_probs
                .data()
                .chunks(classes)
                .zip(star.data().chunks(classes))
            {
                if label.iter().all(|&v| v == N::ZERO) {
                    continue;
                }
                rows += 1;
                nll -= predicted
                    .iter()
                    .zip(label)
                    .map(|(&lp, &s)| lp.to_f64() * s.to_f64())
                    .sum::<f64>();
                if argmax(predicted) == argmax(label) {
                    correct += 1;
                }
            }
            if rows == 0 {
                continue;
            }
            let cross_entropy = nll / rows as f64;
            let accuracy = correct as f64 / rows as f64;
            self.metrics
                .insert(format!("cross_entropy/{target}"), cross_entropy);
            self.metrics.insert(format!("accuracy/{target}"), accuracy);
            self.perplexity.observe(nll, rows as f64);
            total += cross_entropy;
        }
        self.metrics.insert("loss".into(), total);
        Ok(total)
    }

    fn metrics(&self) -> &Metrics {
        &self.metrics
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::graph::Trace;
    use crate::tensor::Tensor;
    use crate::testing::assert_close;

    fn labeled_trace() -> Trace<f32> {
        let mut trace = Trace::new(1);
        // identical peaked predictions for every row
        trace.record_params(
            "y",
            Params::Categorical {
                logits: Tensor::new(
                    &[3, 3],
                    vec![5.0, 0.0, 0.0, 5.0, 0.0, 0.0, 5.0, 0.0, 0.0],
                )
                .unwrap(),
            },
        );
        // row 0 labeled 0, row 1 labeled 2, row 2 is padding
        trace.record_observed(
            "y",
            Tensor::new(&[3, 3], vec![1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0]).unwrap(),
        );
        trace
    }

    fn state<'a>(inference: &'a Trace<f32>, generative: &'a Trace<f32>) -> StepState<'a, f32> {
        StepState {
            inference,
            generative,
            step: 0,
            external_posteriors: None,
        }
    }

    #[test]
    fn unlabeled_batches_contribute_nothing() {
        let mut trace = Trace::new(1);
        trace.record_params(
            "y",
            Params::Categorical {
                logits: Tensor::zeros(&[2, 3]),
            },
        );
        let other = Trace::new(1);
        let mut supervision = Supervision::new("labels", ["y"]);
        let loss = supervision.get_loss(&state(&trace, &other), false).unwrap();
        assert_eq!(loss, 0.0);
        assert!(supervision.get_perplexity().is_nan());
    }

    #[test]
    fn cross_entropy_and_accuracy_skip_padding_rows() {
        let inference = labeled_trace();
        let other = Trace::new(1);
        let mut supervision = Supervision::new("labels", ["y"]);
        let loss = supervision
            .get_loss(&state(&inference, &other), false)
            .unwrap();
        // log softmax of [5, 0, 0]: index 0 costs ~0.0134 nats, index 2
        // costs ~5.0134; the padding row is excluded from the mean
        let expected = (0.013_385_9 + 5.013_385_9) / 2.0;
        assert_close(loss, expected, 1e-3);
        let metrics = Criterion::<f32>::metrics(&supervision);
        assert_close(metrics["accuracy/y"], 0.5, 1e-12);
        assert_close(metrics["cross_entropy/y"], expected, 1e-3);
        // two events with the same total: perplexity is exp of the mean
        assert_close(
            supervision.get_perplexity(),
            metrics["cross_entropy/y"].exp(),
            1e-6,
        );
    }

    #[test]
    fn gaussian_predictions_are_rejected() {
        let mut inference = Trace::new(1);
        inference.record_params(
            "y",
            Params::Gaussian {
                loc: Tensor::zeros(&[2, 3]),
                scale: Tensor::filled(&[2, 3], 1.0f32),
            },
        );
        inference.record_observed("y", Tensor::zeros(&[2, 3]));
        let other = Trace::new(1);
        let mut supervision = Supervision::new("labels", ["y"]);
        let err = supervision
            .get_loss(&state(&inference, &other), false)
            .unwrap_err();
        assert!(err.to_string().contains("categorical prediction"));
    }
}
