//! Evidence lower bound objectives: the classic single-sample surrogate and
//! the importance-weighted bound.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{bail, ensure, Context, Result};

use super::{
    align_params_to, align_value_to_params, kl_weight, mean_of, per_example_sums, Criterion,
    Metrics, PerplexityMeter, StepState,
};
use crate::dist::Params;
use crate::tensor::{Number, Tensor};
use crate::variable::{Family, Prior};

/// Prior parameters for a latent, in resolution order: the generative trace,
/// then external posteriors, then the declared prior materialized at the
/// posterior's shape.
fn resolve_prior<N: Number>(
    name: &str,
    posterior: &Params<N>,
    declared: &BTreeMap<String, (Prior, Family)>,
    state: &StepState<'_, N>,
) -> Result<Params<N>> {
    if let Some(p) = state.generative.params(name) {
        return align_params_to(p, posterior);
    }
    if let Some(p) = state.external_posteriors.and_then(|m| m.get(name)) {
        return align_params_to(p, posterior);
    }
    if let Some((prior, family)) = declared.get(name) {
        return prior.materialize(*family, posterior.value_shape());
    }
    bail!(
        "no prior available for latent {name:?}: the generative trace, external \
         posteriors and declared priors all lack it"
    )
}

/// One-hot rows with at least one nonzero entry; padding rows do not count
/// as events.
fn occupied_rows<N: Number>(value: &Tensor<N>) -> f64 {
    let Some(&classes) = value.shape().last() else {
        return 0.0;
    };
    if classes == 0 {
        return 0.0;
    }
    value
        .data()
        .chunks(classes)
        .filter(|row| row.iter().any(|&v| v != N::ZERO))
        .count() as f64
}

fn accumulate(acc: &mut Option<Vec<f64>>, sums: Vec<f64>) -> Result<()> {
    match acc {
        None => *acc = Some(sums),
        Some(running) => {
            ensure!(
                running.len() == sums.len(),
                "criterion members disagree on the per-example count ({} vs {})",
                running.len(),
                sums.len()
            );
            for (r, s) in running.iter_mut().zip(sums) {
                *r += s;
            }
        }
    }
    Ok(())
}

/// Single-sample evidence lower bound.
///
/// The likelihood part means the generative log probability of every
/// observation member; the posterior part is the analytic KL of each latent
/// member against its resolved prior. The training surrogate anneals the KL
/// with [`kl_weight`] and clips each latent's KL from below when free bits
/// are set; `actual = true` bypasses both.
pub struct Elbo {
    name: String,
    weight: f64,
    latents: BTreeSet<String>,
    observations: BTreeSet<String>,
    declared_priors: BTreeMap<String, (Prior, Family)>,
    anneal: Option<(usize, usize)>,
    free_bits: Option<f64>,
    metrics: Metrics,
    perplexity: PerplexityMeter,
}

impl Elbo {
    pub fn new<L, O, S, T>(name: impl Into<String>, latents: L, observations: O) -> Elbo
    where
        L: IntoIterator<Item = S>,
        S: Into<String>,
        O: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Elbo {
            name: name.into(),
            weight: 1.0,
            latents: latents.into_iter().map(Into::into).collect(),
            observations: observations.into_iter().map(Into::into).collect(),
            declared_priors: BTreeMap::new(),
            anneal: None,
            free_bits: None,
            metrics: Metrics::new(),
            perplexity: PerplexityMeter::new(),
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Elbo {
        self.weight = weight;
        self
    }

    /// Linear KL annealing between the two steps.
    pub fn with_anneal(mut self, start: usize, end: usize) -> Elbo {
        self.anneal = Some((start, end));
        self
    }

    /// Clips each latent's KL from below in the surrogate.
    pub fn with_free_bits(mut self, nats: f64) -> Elbo {
        self.free_bits = Some(nats);
        self
    }

    /// Fallback prior for a latent the generative trace does not cover.
    pub fn with_declared_prior(mut self, name: impl Into<String>, prior: Prior, family: Family) -> Elbo {
        self.declared_priors.insert(name.into(), (prior, family));
        self
    }

    pub fn get_perplexity(&self) -> f64 {
        self.perplexity.value()
    }

    pub fn reset_perplexity(&mut self) {
        self.perplexity.reset();
    }
}

impl<N: Number> Criterion<N> for Elbo {
    fn name(&self) -> &str {
        &self.name
    }

    fn weight(&self) -> f64 {
        self.weight
    }

    fn get_loss(&mut self, state: &StepState<'_, N>, actual: bool) -> Result<f64> {
        self.metrics.clear();

        let mut ll_mean = 0.0;
        for name in &self.observations {
            let params = state
                .generative
                .params(name)
                .with_context(|| format!("observation {name:?} has no generative parameters"))?;
            let value = state
                .generative
                .sample(name)
                .with_context(|| format!("observation {name:?} was not realized"))?;
            let value = align_value_to_params(value, params)?;
            let ll = params.log_prob(&value)?;
            let sums = per_example_sums(&ll, state.generative.iw())?;
            ll_mean += mean_of(&sums);
            if matches!(
                params,
                Params::Categorical { .. } | Params::MultiCategorical { .. }
            ) {
                let nll = -sums.iter().sum::<f64>();
                self.perplexity.observe(nll, occupied_rows(&value));
            }
        }

        let beta = match (self.anneal, actual) {
            (Some((start, end)), false) => kl_weight(state.step, start, end),
            _ => 1.0,
        };

        let mut kl_total = 0.0;
        let mut kl_surrogate = 0.0;
        for name in &self.latents {
            let posterior = state
                .inference
                .params(name)
                .with_context(|| format!("latent {name:?} has no inferred posterior"))?;
            let prior = resolve_prior(name, posterior, &self.declared_priors, state)?;
            let kl = posterior.kl_to(&prior)?;
            let sums = per_example_sums(&kl, state.inference.iw())?;
            let kl_mean = mean_of(&sums);
            self.metrics.insert(format!("kl/{name}"), kl_mean);
            kl_total += kl_mean;
            kl_surrogate += match self.free_bits {
                Some(nats) => kl_mean.max(nats),
                None => kl_mean,
            };
        }

        let loss = if actual {
            kl_total - ll_mean
        } else {
            beta * kl_surrogate - ll_mean
        };
        self.metrics.insert("log_likelihood".into(), ll_mean);
        self.metrics.insert("kl".into(), kl_total);
        self.metrics.insert("kl_weight".into(), beta);
        self.metrics.insert("loss".into(), loss);
        let perplexity = self.perplexity.value();
        if !perplexity.is_nan() {
            self.metrics.insert("perplexity".into(), perplexity);
        }
        Ok(loss)
    }

    fn metrics(&self) -> &Metrics {
        &self.metrics
    }
}

/// Importance-weighted evidence bound.
///
/// Per batch element, the bound is the log mean over `k` importance samples
/// of `exp(log p(x, z) - log q(z | x))`, accumulated across every member
/// variable. At `k = 1` it degenerates to the single-sample bound. The
/// bound is exact, so no surrogate distinction exists.
pub struct IwElbo {
    name: String,
    weight: f64,
    latents: BTreeSet<String>,
    observations: BTreeSet<String>,
    declared_priors: BTreeMap<String, (Prior, Family)>,
    metrics: Metrics,
    perplexity: PerplexityMeter,
}

impl IwElbo {
    pub fn new<L, O, S, T>(name: impl Into<String>, latents: L, observations: O) -> IwElbo
    where
        L: IntoIterator<Item = S>,
        S: Into<String>,
        O: IntoIterator<Item = T>,
        T: Into<String>,
    {
        IwElbo {
            name: name.into(),
            weight: 1.0,
            latents: latents.into_iter().map(Into::into).collect(),
            observations: observations.into_iter().map(Into::into).collect(),
            declared_priors: BTreeMap::new(),
            metrics: Metrics::new(),
            perplexity: PerplexityMeter::new(),
        }
    }

    pub fn with_weight(mut self, weight: f64) -> IwElbo {
        self.weight = weight;
        self
    }

    pub fn with_declared_prior(
        mut self,
        name: impl Into<String>,
        prior: Prior,
        family: Family,
    ) -> IwElbo {
        self.declared_priors.insert(name.into(), (prior, family));
        self
    }

    pub fn get_perplexity(&self) -> f64 {
        self.perplexity.value()
    }

    pub fn reset_perplexity(&mut self) {
        self.perplexity.reset();
    }
}

impl<N: Number> Criterion<N> for IwElbo {
    fn name(&self) -> &str {
        &self.name
    }

    fn weight(&self) -> f64 {
        self.weight
    }

    fn get_loss(&mut self, state: &StepState<'_, N>, _actual: bool) -> Result<f64> {
        self.metrics.clear();
        let iw = state.inference.iw();
        ensure!(
            state.generative.iw() == iw,
            "inference and generative traces ran under different importance sample counts"
        );

        let mut acc: Option<Vec<f64>> = None;
        let mut all_categorical = !self.observations.is_empty();
        let mut events = 0.0;
        for name in &self.observations {
            let params = state
                .generative
                .params(name)
                .with_context(|| format!("observation {name:?} has no generative parameters"))?;
            let value = state
                .generative
                .sample(name)
                .with_context(|| format!("observation {name:?} was not realized"))?;
            let value = align_value_to_params(value, params)?;
            let ll = params.log_prob(&value)?;
            accumulate(&mut acc, per_example_sums(&ll, iw)?)?;
            if matches!(
                params,
                Params::Categorical { .. } | Params::MultiCategorical { .. }
            ) {
                // the importance axis replicates rows, count each once
                events += occupied_rows(&value) / iw as f64;
            } else {
                all_categorical = false;
            }
        }
        for name in &self.latents {
            let posterior = state
                .inference
                .params(name)
                .with_context(|| format!("latent {name:?} has no inferred posterior"))?;
            let sample = state
                .inference
                .sample(name)
                .with_context(|| format!("latent {name:?} was not realized"))?;
            let prior = resolve_prior(name, posterior, &self.declared_priors, state)?;
            let log_q = per_example_sums(&posterior.log_prob(sample)?, iw)?;
            let log_p = per_example_sums(&prior.log_prob(sample)?, iw)?;
            let diff: Vec<f64> = log_p.iter().zip(&log_q).map(|(p, q)| p - q).collect();
            accumulate(&mut acc, diff)?;
        }

        let per_example = acc.context("importance bound needs at least one member variable")?;
        let per_batch = if iw > 1 {
            let batch = per_example.len() / iw;
            ensure!(
                batch * iw == per_example.len(),
                "per-example count {} is not divisible by k={iw}",
                per_example.len()
            );
            (0..batch)
                .map(|bi| {
                    let mut peak = f64::NEG_INFINITY;
                    for ki in 0..iw {
                        peak = peak.max(per_example[ki * batch + bi]);
                    }
                    let sum_exp: f64 = (0..iw)
                        .map(|ki| (per_example[ki * batch + bi] - peak).exp())
                        .sum();
                    peak + (sum_exp / iw as f64).ln()
                })
                .collect()
        } else {
            per_example
        };

        let bound = mean_of(&per_batch);
        let loss = -bound;
        if all_categorical {
            self.perplexity
                .observe(-per_batch.iter().sum::<f64>(), events);
        }
        self.metrics.insert("bound".into(), bound);
        self.metrics.insert("loss".into(), loss);
        let perplexity = self.perplexity.value();
        if !perplexity.is_nan() {
            self.metrics.insert("perplexity".into(), perplexity);
        }
        Ok(loss)
    }

    fn metrics(&self) -> &Metrics {
        &self.metrics
    }
}
