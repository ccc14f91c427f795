//! Training objectives over evaluation traces.
//!
//! A [`Criterion`] reads the traces of one step and turns them into a scalar
//! loss plus reporting metrics. Criteria never walk the graph themselves;
//! membership is declared explicitly at construction, so the same trace pair
//! can feed several objectives with different variable sets.

pub mod elbo;
pub mod supervision;

use std::collections::BTreeMap;

use anyhow::{bail, ensure, Result};

use crate::dist::Params;
use crate::graph::Trace;
use crate::tensor::{Number, Tensor};

pub use elbo::{Elbo, IwElbo};
pub use supervision::Supervision;

/// Scalar reporting values keyed by metric name.
pub type Metrics = BTreeMap<String, f64>;

/// Everything a criterion may read for one training step.
pub struct StepState<'a, N: Number> {
    /// Trace of the inference pass (posteriors conditioned on data).
    pub inference: &'a Trace<N>,
    /// Trace of the generative pass.
    pub generative: &'a Trace<N>,
    /// Global step, drives annealing schedules.
    pub step: usize,
    /// Posteriors of another model, for cross-model consistency terms.
    pub external_posteriors: Option<&'a BTreeMap<String, Params<N>>>,
}

/// One objective over a step. `get_loss` with `actual = false` returns the
/// training surrogate (annealed, clipped); with `actual = true` the
/// unmodified bound used for reporting and model comparison.
pub trait Criterion<N: Number> {
    fn name(&self) -> &str;

    /// Multiplier the trainer applies when summing criteria.
    fn weight(&self) -> f64;

    fn get_loss(&mut self, state: &StepState<'_, N>, actual: bool) -> Result<f64>;

    /// Metrics from the most recent `get_loss` call.
    fn metrics(&self) -> &Metrics;
}

/// Linear KL annealing: 0 before `start`, 1 from `end` on, linear between.
pub fn kl_weight(step: usize, start: usize, end: usize) -> f64 {
    if step < start {
        0.0
    } else if step >= end {
        1.0
    } else {
        (step - start) as f64 / (end - start) as f64
    }
}

/// Running perplexity: exp of the accumulated negative log likelihood per
/// event.
#[derive(Debug, Default, Clone)]
pub struct PerplexityMeter {
    total_nll: f64,
    events: f64,
}

impl PerplexityMeter {
    pub fn new() -> PerplexityMeter {
        PerplexityMeter::default()
    }

    pub fn observe(&mut self, nll: f64, events: f64) {
        self.total_nll += nll;
        self.events += events;
    }

    /// NaN until at least one event was observed.
    pub fn value(&self) -> f64 {
        if self.events > 0.0 {
            (self.total_nll / self.events).exp()
        } else {
            f64::NAN
        }
    }

    pub fn reset(&mut self) {
        self.total_nll = 0.0;
        self.events = 0.0;
    }
}

/// Sums a contribution tensor down to one value per example. With an
/// importance axis the example index is `(k, batch)`, otherwise `batch`;
/// everything further right (time, event dimensions) is summed.
pub(crate) fn per_example_sums<N: Number>(tensor: &Tensor<N>, iw: usize) -> Result<Vec<f64>> {
    let keep = if iw > 1 { 2 } else { 1 };
    ensure!(
        tensor.rank() >= keep,
        "expected at least {keep} leading axes for per-example reduction, got shape {:?}",
        tensor.shape()
    );
    let (_, sums) = tensor.reduce_sum_trailing(keep)?;
    Ok(sums)
}

pub(crate) fn mean_of(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

/// Broadcasts `value` onto the leading importance axis of `params` when it
/// is exactly one axis short.
pub(crate) fn align_value_to_params<N: Number>(
    value: &Tensor<N>,
    params: &Params<N>,
) -> Result<Tensor<N>> {
    let target = params.value_shape();
    if value.rank() == target.len() {
        Ok(value.clone())
    } else if value.rank() + 1 == target.len() {
        Ok(value.broadcast_leading(target[0]))
    } else {
        bail!(
            "cannot align a value of shape {:?} with parameters of shape {:?}",
            value.shape(),
            target
        );
    }
}

/// Broadcasts prior-side parameters onto the posterior's importance axis
/// when they are exactly one axis short.
pub(crate) fn align_params_to<N: Number>(
    prior: &Params<N>,
    posterior: &Params<N>,
) -> Result<Params<N>> {
    let target = posterior.value_shape();
    let have = prior.value_shape();
    if have.len() == target.len() {
        Ok(prior.clone())
    } else if have.len() + 1 == target.len() {
        Ok(prior.broadcast_leading(target[0]))
    } else {
        bail!(
            "cannot align prior parameters of shape {have:?} with a posterior of shape {target:?}"
        );
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testing::assert_close;

    #[test]
    fn kl_weight_is_linear_between_the_boundaries() {
        assert_eq!(kl_weight(0, 5_000, 25_000), 0.0);
        assert_eq!(kl_weight(4_999, 5_000, 25_000), 0.0);
        assert_close(kl_weight(15_000, 5_000, 25_000), 0.5, 1e-12);
        assert_eq!(kl_weight(25_000, 5_000, 25_000), 1.0);
        assert_eq!(kl_weight(1_000_000, 5_000, 25_000), 1.0);
        // degenerate schedule behaves as a hard switch
        assert_eq!(kl_weight(9, 10, 10), 0.0);
        assert_eq!(kl_weight(10, 10, 10), 1.0);
    }

    #[test]
    fn perplexity_is_exp_of_the_mean_nll() {
        let mut meter = PerplexityMeter::new();
        assert!(meter.value().is_nan());
        meter.observe(6.0 * 4.0f64.ln(), 6.0);
        assert_close(meter.value(), 4.0, 1e-9);
        meter.reset();
        assert!(meter.value().is_nan());
    }

    #[test]
    fn per_example_reduction_respects_the_importance_axis() {
        let t = Tensor::new(&[2, 2, 3], vec![1.0f32; 12]).unwrap();
        assert_eq!(per_example_sums(&t, 1).unwrap(), vec![6.0, 6.0]);
        assert_eq!(per_example_sums(&t, 2).unwrap(), vec![3.0; 4]);
    }

    #[test]
    fn alignment_broadcasts_exactly_one_missing_axis() {
        let params = Params::Gaussian {
            loc: Tensor::new(&[3, 2, 2], vec![0.0f32; 12]).unwrap(),
            scale: Tensor::new(&[3, 2, 2], vec![1.0f32; 12]).unwrap(),
        };
        let value = Tensor::new(&[2, 2], vec![1.0f32; 4]).unwrap();
        let aligned = align_value_to_params(&value, &params).unwrap();
        assert_eq!(aligned.shape(), &[3, 2, 2]);

        let flat = Tensor::new(&[2], vec![1.0f32; 2]).unwrap();
        assert!(align_value_to_params(&flat, &params).is_err());
    }
}
