//! A model pairs an inference network with a generation network.
//!
//! One forward pass runs inference on the observed batch, feeds the realized
//! samples into the generation network (observed ground truth wins over the
//! inference copy, so downstream edges are teacher forced), and returns both
//! traces. Criteria then read the pair; nothing in here accumulates state
//! between steps beyond the recurrent link states the caller explicitly
//! carries.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{ensure, Result};
use rand::Rng;
use tracing::debug;

use crate::criteria::{Criterion, Metrics, StepState};
use crate::dist::Params;
use crate::graph::engine::harmonize_inputs;
use crate::graph::{BayesNet, EvalOptions, Trace};
use crate::links::LinkState;
use crate::tensor::{Number, Tensor};

/// Per-call knobs of [`Model::forward`].
///
/// Substituted values and planted posteriors apply to the generation pass and
/// are given at their natural rank; the pass broadcasts them over the
/// importance axis itself when one is in play. The forced-importance set
/// applies to the inference pass, where the independent draws happen.
#[derive(Debug, Clone)]
pub struct ForwardOptions<N: Number> {
    step: usize,
    n_importance_samples: usize,
    force_importance_on: Option<BTreeSet<String>>,
    eval_mode: bool,
    substituted_values: BTreeMap<String, Tensor<N>>,
    planted_posteriors: BTreeMap<String, Params<N>>,
    extra_generative_inputs: BTreeMap<String, Tensor<N>>,
    previous_inference_state: BTreeMap<String, LinkState<N>>,
    previous_generative_state: BTreeMap<String, LinkState<N>>,
}

impl<N: Number> Default for ForwardOptions<N> {
    fn default() -> Self {
        ForwardOptions {
            step: 0,
            n_importance_samples: 1,
            force_importance_on: None,
            eval_mode: false,
            substituted_values: BTreeMap::new(),
            planted_posteriors: BTreeMap::new(),
            extra_generative_inputs: BTreeMap::new(),
            previous_inference_state: BTreeMap::new(),
            previous_generative_state: BTreeMap::new(),
        }
    }
}

impl<N: Number> ForwardOptions<N> {
    pub fn new() -> ForwardOptions<N> {
        ForwardOptions::default()
    }

    /// Current training step, driving the annealing-phase gate.
    pub fn with_step(mut self, step: usize) -> Self {
        self.step = step;
        self
    }

    pub fn with_importance_samples(mut self, k: usize) -> Self {
        self.n_importance_samples = k;
        self
    }

    /// Restricts independent importance draws to the named inference
    /// variables.
    pub fn with_forced_importance<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.force_importance_on = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_eval_mode(mut self, eval_mode: bool) -> Self {
        self.eval_mode = eval_mode;
        self
    }

    /// Pins a generation-side sample, e.g. to a value drawn by another model.
    pub fn with_substituted_value(mut self, name: impl Into<String>, value: Tensor<N>) -> Self {
        self.substituted_values.insert(name.into(), value);
        self
    }

    /// Overrides a generation-side posterior, e.g. with statistics of another
    /// model's samples.
    pub fn with_planted_posterior(mut self, name: impl Into<String>, params: Params<N>) -> Self {
        self.planted_posteriors.insert(name.into(), params);
        self
    }

    /// Additional generation-pass input, overriding any inference sample of
    /// the same name.
    pub fn with_extra_generative_input(mut self, name: impl Into<String>, value: Tensor<N>) -> Self {
        self.extra_generative_inputs.insert(name.into(), value);
        self
    }

    /// Recurrent states carried from the previous chunk's inference pass.
    pub fn with_previous_inference_state(mut self, states: BTreeMap<String, LinkState<N>>) -> Self {
        self.previous_inference_state = states;
        self
    }

    /// Recurrent states carried from the previous chunk's generation pass.
    pub fn with_previous_generative_state(mut self, states: BTreeMap<String, LinkState<N>>) -> Self {
        self.previous_generative_state = states;
        self
    }

    pub fn step(&self) -> usize {
        self.step
    }

    pub fn importance_samples(&self) -> usize {
        self.n_importance_samples
    }
}

/// Both traces of one forward pass.
#[derive(Debug, Clone)]
pub struct ForwardOutcome<N: Number> {
    pub inference: Trace<N>,
    pub generative: Trace<N>,
}

impl<N: Number> ForwardOutcome<N> {
    /// View over the pair that criteria consume.
    pub fn step_state(&self, step: usize) -> StepState<'_, N> {
        StepState {
            inference: &self.inference,
            generative: &self.generative,
            step,
            external_posteriors: None,
        }
    }
}

/// An inference network and a generation network over a shared variable
/// vocabulary, plus the names that steer the forward pass.
#[derive(Debug)]
pub struct Model<N: Number> {
    name: String,
    inference: BayesNet<N>,
    generative: BayesNet<N>,
    generated: String,
    supervised: BTreeSet<String>,
    gen_input_exclude: BTreeSet<String>,
    anneal_start: Option<usize>,
}

impl<N: Number> Model<N> {
    /// Pairs the two networks. The generation network must designate exactly
    /// one generated variable; supervised variables are read off the
    /// inference network's declarations.
    pub fn new(
        name: impl Into<String>,
        inference: BayesNet<N>,
        generative: BayesNet<N>,
    ) -> Result<Model<N>> {
        let name = name.into();
        let generated: Vec<&str> = generative
            .variables()
            .values()
            .filter(|v| v.is_generated())
            .map(|v| v.name())
            .collect();
        ensure!(
            generated.len() == 1,
            "model {name:?} must designate exactly one generated variable, found {:?}",
            generated
        );
        let supervised = inference
            .variables()
            .values()
            .filter(|v| v.is_supervised())
            .map(|v| v.name().to_string())
            .collect();
        Ok(Model {
            name,
            generated: generated[0].to_string(),
            supervised,
            inference,
            generative,
            gen_input_exclude: BTreeSet::new(),
            anneal_start: None,
        })
    }

    /// Names never forwarded from the inference pass into the generation
    /// pass, even when the inference trace realized them.
    pub fn with_gen_input_exclude<I, S>(mut self, names: I) -> Model<N>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.gen_input_exclude = names.into_iter().map(Into::into).collect();
        self
    }

    /// Before this step, the generation pass is restricted to the generated
    /// variable and whatever it depends on (pure reconstruction phase).
    pub fn with_anneal_start(mut self, step: usize) -> Model<N> {
        self.anneal_start = Some(step);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn inference(&self) -> &BayesNet<N> {
        &self.inference
    }

    pub fn generative(&self) -> &BayesNet<N> {
        &self.generative
    }

    pub fn generated(&self) -> &str {
        &self.generated
    }

    pub fn supervised(&self) -> &BTreeSet<String> {
        &self.supervised
    }

    /// L2 norm over every link parameter of both networks.
    pub fn parameter_norm(&self) -> f64 {
        let mut groups = self.inference.parameters();
        groups.extend(self.generative.parameters());
        utils::l2_norm(groups)
    }

    /// One full pass: inference on `inputs`, then generation conditioned on
    /// the inference samples.
    pub fn forward<R: Rng>(
        &self,
        inputs: &BTreeMap<String, Tensor<N>>,
        options: &ForwardOptions<N>,
        rng: &mut R,
    ) -> Result<ForwardOutcome<N>> {
        let k = options.n_importance_samples;
        let mut infer_options = EvalOptions::new()
            .with_importance_samples(k)
            .with_eval_mode(options.eval_mode)
            .with_previous_state(options.previous_inference_state.clone());
        if let Some(forced) = &options.force_importance_on {
            infer_options = infer_options.with_forced_importance(forced.iter().cloned());
        }
        let inference = self.inference.evaluate(inputs, &infer_options, rng)?;

        // realized inference samples condition the generation pass; ground
        // truth and extra inputs win over the inference copy of a name
        let mut gen_inputs: BTreeMap<String, Tensor<N>> = BTreeMap::new();
        let mut bearing: BTreeSet<String> = BTreeSet::new();
        for (name, hat) in inference.samples() {
            if self.gen_input_exclude.contains(name) {
                continue;
            }
            gen_inputs.insert(name.clone(), hat.clone());
            if k > 1 {
                bearing.insert(name.clone());
            }
        }
        for (name, value) in inputs {
            if self.gen_input_exclude.contains(name) {
                continue;
            }
            gen_inputs.insert(name.clone(), value.clone());
            bearing.remove(name);
        }
        for (name, value) in &options.extra_generative_inputs {
            gen_inputs.insert(name.clone(), value.clone());
            bearing.remove(name);
        }
        harmonize_inputs(&mut gen_inputs, &bearing, k);

        let mut gen_options = EvalOptions::new()
            .with_importance_samples(k)
            .with_eval_mode(options.eval_mode)
            .with_previous_state(options.previous_generative_state.clone())
            .with_inputs_bearing_iw_axis(k > 1);
        for (name, params) in &options.planted_posteriors {
            let params = if k > 1 {
                params.broadcast_leading(k)
            } else {
                params.clone()
            };
            gen_options = gen_options.with_planted_posterior(name.clone(), params);
        }
        for (name, value) in &options.substituted_values {
            let value = if k > 1 {
                value.broadcast_leading(k)
            } else {
                value.clone()
            };
            gen_options = gen_options.with_substituted_value(name.clone(), value);
        }
        if let Some(start) = self.anneal_start {
            if options.step < start {
                debug!(
                    "step {} < {start}: generation restricted to {:?}",
                    options.step, self.generated
                );
                gen_options = gen_options.with_target_subset([self.generated.clone()]);
            }
        }
        let generative = self.generative.evaluate(&gen_inputs, &gen_options, rng)?;
        Ok(ForwardOutcome {
            inference,
            generative,
        })
    }
}

fn run_criteria<N: Number>(
    criteria: &mut [Box<dyn Criterion<N>>],
    state: &StepState<'_, N>,
    actual: bool,
    scope: &str,
) -> Result<(f64, Metrics)> {
    let mut total = 0.0;
    let mut merged = Metrics::new();
    for criterion in criteria.iter_mut() {
        let loss = criterion.get_loss(state, actual)?;
        total += criterion.weight() * loss;
        for (metric, value) in criterion.metrics() {
            merged.insert(format!("{}/{metric}", criterion.name()), *value);
        }
    }
    utils::log_metrics(scope, &merged);
    Ok((total, merged))
}

/// Weighted training surrogate over a set of criteria, with every diagnostic
/// merged under `criterion-name/metric`.
pub fn training_step<N: Number>(
    criteria: &mut [Box<dyn Criterion<N>>],
    state: &StepState<'_, N>,
) -> Result<(f64, Metrics)> {
    run_criteria(criteria, state, false, "train")
}

/// Same shape as [`training_step`] but with the unscaled, directly
/// interpretable bounds (no annealing, no free bits).
pub fn evaluation_step<N: Number>(
    criteria: &mut [Box<dyn Criterion<N>>],
    state: &StepState<'_, N>,
) -> Result<(f64, Metrics)> {
    run_criteria(criteria, state, true, "test")
}
