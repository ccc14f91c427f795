//! Evaluation passes over a [`BayesNet`].
//!
//! One pass walks the topologically ordered edges and realizes every needed
//! variable exactly once. Posterior parameters come from the variable's link
//! unless a planted posterior overrides it (the link is then not invoked).
//! The realized sample follows its own precedence: a substituted value wins
//! over an observation, an observation wins over drawing from the
//! parameters, and only the last resort touches the RNG. Substitution alone
//! replaces the sampling step but still fires the link, so criteria can
//! score a forced value under the link's parameters; combine it with
//! planting to keep the link out entirely. Roots with a declared prior are
//! realized by ancestral sampling when nothing else supplies them.
//!
//! Draws happen in a fixed order (roots by name, then edges topologically)
//! and randomness is drawn once per variable per pass, so seeded runs
//! reproduce exactly.
//!
//! Importance sampling prepends one axis of size `k` to every realized
//! tensor. The axis is born either when a variable draws `k` independent
//! noise slices or when an external tensor is broadcast on entry; once born
//! it flows through links untouched. With `k == 1` no axis exists anywhere
//! and the pass is bit-for-bit identical to a plain evaluation.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{bail, ensure, Context, Result};
use rand::Rng;
use tracing::{debug, trace};

use super::{BayesNet, Trace};
use crate::dist::{draw_noise, Params};
use crate::links::{LinkInput, LinkState};
use crate::tensor::{Number, Tensor};
use crate::variable::Variable;

/// Everything one evaluation pass can be told to do differently.
#[derive(Debug, Clone)]
pub struct EvalOptions<N: Number> {
    n_importance_samples: usize,
    force_importance_on: Option<BTreeSet<String>>,
    eval_mode: bool,
    target_subset: Option<BTreeSet<String>>,
    previous_state: BTreeMap<String, LinkState<N>>,
    planted_posteriors: BTreeMap<String, Params<N>>,
    substituted_values: BTreeMap<String, Tensor<N>>,
    inputs_carry_iw_axis: bool,
}

impl<N: Number> Default for EvalOptions<N> {
    fn default() -> Self {
        EvalOptions {
            n_importance_samples: 1,
            force_importance_on: None,
            eval_mode: false,
            target_subset: None,
            previous_state: BTreeMap::new(),
            planted_posteriors: BTreeMap::new(),
            substituted_values: BTreeMap::new(),
            inputs_carry_iw_axis: false,
        }
    }
}

impl<N: Number> EvalOptions<N> {
    pub fn new() -> EvalOptions<N> {
        EvalOptions::default()
    }

    /// Number of importance samples `k`. With the default `1` no importance
    /// axis exists anywhere in the pass.
    pub fn with_importance_samples(mut self, k: usize) -> Self {
        self.n_importance_samples = k;
        self
    }

    /// Restricts fresh per-sample noise to the named variables; everything
    /// else replicates a single draw across the importance axis. Without
    /// this call every drawn variable gets fresh noise per sample.
    pub fn with_forced_importance<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.force_importance_on = Some(names.into_iter().map(Into::into).collect());
        self
    }

    /// Discrete draws for categorical variables instead of relaxed ones.
    pub fn with_eval_mode(mut self, eval_mode: bool) -> Self {
        self.eval_mode = eval_mode;
        self
    }

    /// Restricts the pass to the named variables and whatever they depend
    /// on; every other edge is skipped.
    pub fn with_target_subset<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.target_subset = Some(names.into_iter().map(Into::into).collect());
        self
    }

    /// Recurrent link states from the previous chunk, keyed by target.
    pub fn with_previous_state(mut self, states: BTreeMap<String, LinkState<N>>) -> Self {
        self.previous_state = states;
        self
    }

    /// Records `params` for the named variable instead of firing its link,
    /// and draws its value from them.
    pub fn with_planted_posterior(mut self, name: impl Into<String>, params: Params<N>) -> Self {
        self.planted_posteriors.insert(name.into(), params);
        self
    }

    /// Pins the named variable's realized sample to `value`. Its link still
    /// fires (parameters are recorded); plant a posterior as well to skip
    /// the link.
    pub fn with_substituted_value(mut self, name: impl Into<String>, value: Tensor<N>) -> Self {
        self.substituted_values.insert(name.into(), value);
        self
    }

    /// Declares that every external tensor (inputs, substitutions, planted
    /// parameters) already carries the leading importance axis, so the pass
    /// must not broadcast them again.
    pub fn with_inputs_bearing_iw_axis(mut self, bearing: bool) -> Self {
        self.inputs_carry_iw_axis = bearing;
        self
    }

    pub fn importance_samples(&self) -> usize {
        self.n_importance_samples
    }

    pub fn is_eval(&self) -> bool {
        self.eval_mode
    }

    pub fn substitutions(&self) -> &BTreeMap<String, Tensor<N>> {
        &self.substituted_values
    }
}

/// Prepends a replicated importance axis to every entry not already bearing
/// one, so mixed maps line up before a pass run with
/// [`EvalOptions::with_inputs_bearing_iw_axis`].
pub fn harmonize_inputs<N: Number>(
    inputs: &mut BTreeMap<String, Tensor<N>>,
    bearing: &BTreeSet<String>,
    k: usize,
) {
    if k <= 1 {
        return;
    }
    for (name, value) in inputs.iter_mut() {
        if !bearing.contains(name) {
            *value = value.broadcast_leading(k);
        }
    }
}

impl<N: Number> BayesNet<N> {
    /// Runs one pass over the network.
    ///
    /// `inputs` supplies observed values by variable name; entries naming
    /// undeclared variables are ignored, so a caller can pass a full
    /// realization map from another graph. Observed values pin their
    /// variable (teacher forcing) while the produced parameters are still
    /// recorded for likelihood terms.
    pub fn evaluate<R: Rng>(
        &self,
        inputs: &BTreeMap<String, Tensor<N>>,
        options: &EvalOptions<N>,
        rng: &mut R,
    ) -> Result<Trace<N>> {
        self.run(inputs, options, None, rng)
    }

    /// Ancestral sampling for qualitative evaluation: like [`evaluate`],
    /// but prior-realized roots take their batch shape from `batch_dims`
    /// instead of inferring it from the inputs. Runs without an importance
    /// axis.
    ///
    /// [`evaluate`]: BayesNet::evaluate
    pub fn prior_sample<R: Rng>(
        &self,
        batch_dims: &[usize],
        seed_inputs: &BTreeMap<String, Tensor<N>>,
        options: &EvalOptions<N>,
        rng: &mut R,
    ) -> Result<Trace<N>> {
        ensure!(
            options.n_importance_samples == 1,
            "prior sampling runs without an importance axis"
        );
        self.run(seed_inputs, options, Some(batch_dims), rng)
    }

    fn run<R: Rng>(
        &self,
        inputs: &BTreeMap<String, Tensor<N>>,
        options: &EvalOptions<N>,
        batch_hint: Option<&[usize]>,
        rng: &mut R,
    ) -> Result<Trace<N>> {
        let k = options.n_importance_samples;
        ensure!(k >= 1, "importance sample count must be at least 1");
        self.check_options(options)?;

        let expand = k > 1;
        let external_bearing = options.inputs_carry_iw_axis;
        let externalize = |t: &Tensor<N>| -> Tensor<N> {
            if expand && !external_bearing {
                t.broadcast_leading(k)
            } else {
                t.clone()
            }
        };
        let externalize_params = |p: &Params<N>| -> Params<N> {
            if expand && !external_bearing {
                p.broadcast_leading(k)
            } else {
                p.clone()
            }
        };

        debug!(
            "evaluating {} edges (k={}, eval={}, {} inputs)",
            self.edges.len(),
            k,
            options.eval_mode,
            inputs.len()
        );

        // Which variables must hold a value by the end of the pass. Parents
        // of a needed, link-fired target are needed too; planted targets do
        // not fire their link, so their parents are not pulled in.
        let mut needed: BTreeSet<String> = match &options.target_subset {
            Some(subset) => subset.clone(),
            None => self.variables.keys().cloned().collect(),
        };
        for edge in self.edges.iter().rev() {
            let target = edge.target();
            if needed.contains(target) && !options.planted_posteriors.contains_key(target) {
                for parent in edge.parents() {
                    needed.insert(parent.name.clone());
                }
            }
        }

        let mut eval = Trace::new(k);
        let mut values: BTreeMap<String, Tensor<N>> = BTreeMap::new();

        for (name, value) in inputs {
            match self.variables.get(name) {
                Some(variable) => {
                    let event = variable.family().event_shape();
                    ensure!(
                        value.shape().ends_with(&event),
                        "input {name:?} has shape {:?}, expected a {:?} event suffix",
                        value.shape(),
                        event
                    );
                    eval.record_observed(name, value.clone());
                }
                None => trace!("input {name:?} is not declared in this graph, ignoring"),
            }
        }

        for root in self.roots() {
            let name = root.name();
            if !needed.contains(name) {
                continue;
            }
            let planted = options
                .planted_posteriors
                .get(name)
                .map(&externalize_params);
            let value = if let Some(sub) = options.substituted_values.get(name) {
                externalize(sub)
            } else if let Some(star) = inputs.get(name) {
                externalize(star)
            } else if let Some(params) = &planted {
                draw_value(root, params, options, rng)?
            } else if let Some(prior) = root.prior() {
                let mut shape = self.resolve_batch_dims(batch_hint, inputs)?;
                shape.extend(root.family().event_shape());
                let params = externalize_params(&prior.materialize(root.family(), &shape)?);
                let value = draw_value(root, &params, options, rng)?;
                eval.record_params(name, params);
                values.insert(name.to_string(), value.clone());
                eval.record_sample(name, value);
                continue;
            } else {
                bail!(
                    "root variable {name:?} has no value; provide an observation, a \
                     substituted value, a planted posterior, or declare a prior"
                );
            };
            if let Some(params) = planted {
                eval.record_params(name, params);
            }
            values.insert(name.to_string(), value.clone());
            eval.record_sample(name, value);
        }

        for edge in self.edges.iter() {
            let target = edge.target();
            if !needed.contains(target) {
                debug!("skipping edge into {target:?}, outside the target subset");
                continue;
            }
            let variable = &self.variables[target];

            let params = if let Some(planted) = options.planted_posteriors.get(target) {
                trace!(
                    "planting the posterior of {target:?}, {} not invoked",
                    edge.link().describe()
                );
                if let Some(prev) = options.previous_state.get(target) {
                    eval.record_state(target, prev.clone());
                }
                externalize_params(planted)
            } else {
                let mut resolved = Vec::with_capacity(edge.parents().len());
                for parent in edge.parents() {
                    let value = if let Some(sub) = options.substituted_values.get(&parent.name) {
                        externalize(sub)
                    } else if let Some(hat) = values.get(&parent.name) {
                        hat.clone()
                    } else if let Some(star) = inputs.get(&parent.name) {
                        let value = externalize(star);
                        values.insert(parent.name.clone(), value.clone());
                        eval.record_sample(&parent.name, value.clone());
                        value
                    } else {
                        bail!(
                            "variable {:?} needed by the edge into {:?} has no value: \
                             it was neither realized upstream, observed, nor substituted",
                            parent.name,
                            target
                        );
                    };
                    resolved.push((parent.name.as_str(), parent.role, value));
                }
                let link_inputs: Vec<LinkInput<'_, N>> = resolved
                    .iter()
                    .map(|&(name, role, ref value)| LinkInput { name, role, value })
                    .collect();
                let (params, state) = edge
                    .link()
                    .forward(&link_inputs, options.previous_state.get(target))
                    .with_context(|| format!("firing {} into {target:?}", edge.link().describe()))?;
                trace!("fired {} into {target:?}", edge.link().describe());
                match state {
                    Some(state) => eval.record_state(target, state),
                    None => {
                        if let Some(prev) = options.previous_state.get(target) {
                            eval.record_state(target, prev.clone());
                        }
                    }
                }
                params
            };

            let value = if let Some(sub) = options.substituted_values.get(target) {
                trace!("substituting the sample of {target:?}");
                externalize(sub)
            } else if let Some(star) = inputs.get(target) {
                externalize(star)
            } else {
                draw_value(variable, &params, options, rng)?
            };
            eval.record_params(target, params);
            values.insert(target.to_string(), value.clone());
            eval.record_sample(target, value);
        }

        Ok(eval)
    }

    /// Batch shape for prior-realized roots: an explicit hint, or the batch
    /// part of any declared input.
    fn resolve_batch_dims(
        &self,
        hint: Option<&[usize]>,
        inputs: &BTreeMap<String, Tensor<N>>,
    ) -> Result<Vec<usize>> {
        if let Some(hint) = hint {
            return Ok(hint.to_vec());
        }
        for (name, value) in inputs {
            if let Some(variable) = self.variables.get(name) {
                let event = variable.family().event_shape();
                if value.rank() >= event.len() {
                    return Ok(value.shape()[..value.rank() - event.len()].to_vec());
                }
            }
        }
        bail!(
            "cannot infer batch dimensions for prior sampling: no declared inputs are \
             present (use prior_sample with explicit batch dimensions)"
        )
    }

    fn check_options(&self, options: &EvalOptions<N>) -> Result<()> {
        if let Some(subset) = &options.target_subset {
            for name in subset {
                ensure!(
                    self.variables.contains_key(name),
                    "target subset names unknown variable {name:?}"
                );
            }
        }
        if let Some(forced) = &options.force_importance_on {
            for name in forced {
                ensure!(
                    self.variables.contains_key(name),
                    "forced importance set names unknown variable {name:?}"
                );
            }
        }
        for (name, params) in &options.planted_posteriors {
            let variable = self
                .variables
                .get(name)
                .with_context(|| format!("planted posterior names unknown variable {name:?}"))?;
            params
                .matches_family(variable.family())
                .with_context(|| format!("planted posterior for {name:?}"))?;
        }
        for (name, value) in &options.substituted_values {
            let variable = self
                .variables
                .get(name)
                .with_context(|| format!("substituted value names unknown variable {name:?}"))?;
            let event = variable.family().event_shape();
            ensure!(
                value.shape().ends_with(&event),
                "substituted value for {name:?} has shape {:?}, expected a {:?} event suffix",
                value.shape(),
                event
            );
        }
        Ok(())
    }
}

/// Draws a value under the importance-sampling noise protocol: forced
/// variables get fresh noise per importance sample, unforced ones replicate
/// a single slice draw across the axis.
fn draw_value<N: Number, R: Rng>(
    variable: &Variable,
    params: &Params<N>,
    options: &EvalOptions<N>,
    rng: &mut R,
) -> Result<Tensor<N>> {
    let k = options.n_importance_samples;
    let mode = variable.sample_mode(options.eval_mode);
    let forced = options
        .force_importance_on
        .as_ref()
        .map_or(true, |set| set.contains(variable.name()));
    let noise = if k > 1 && !forced {
        // params are importance-bearing here, so the slice shape drops the
        // leading axis
        let shape = params.value_shape();
        draw_noise(params.noise_kind(), &shape[1..], rng)?.broadcast_leading(k)
    } else {
        draw_noise(params.noise_kind(), params.value_shape(), rng)?
    };
    params.draw_with_noise(&noise, mode)
}

#[cfg(test)]
mod test {
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    use super::*;
    use crate::graph::Edge;
    use crate::links::{AffineLink, Link, Parent};
    use crate::testing::{ramp, seeded_rng, AccumulatorLink, SpyLink};
    use crate::variable::{Family, Prior, Variable};

    fn affine(in_dim: usize, dim: usize, seed: u64) -> Arc<dyn Link<f32>> {
        Arc::new(AffineLink::<f32>::seeded(in_dim, Family::Gaussian { dim }, seed).unwrap())
    }

    /// z (observed at evaluation time) -> x
    fn chain() -> BayesNet<f32> {
        BayesNet::builder()
            .with_variable(Variable::new("z", Family::Gaussian { dim: 3 }))
            .with_variable(Variable::new("x", Family::Gaussian { dim: 2 }).generated())
            .with_edge(Edge::new("x", vec![Parent::new("z")], affine(3, 2, 1)))
            .build()
            .unwrap()
    }

    fn spied_chain() -> (BayesNet<f32>, Arc<std::sync::atomic::AtomicUsize>) {
        let (spy, fired) = SpyLink::new(affine(3, 2, 1));
        let net = BayesNet::builder()
            .with_variable(Variable::new("z", Family::Gaussian { dim: 3 }))
            .with_variable(Variable::new("x", Family::Gaussian { dim: 2 }))
            .with_edge(Edge::new("x", vec![Parent::new("z")], Arc::new(spy)))
            .build()
            .unwrap();
        (net, fired)
    }

    fn z_inputs() -> BTreeMap<String, Tensor<f32>> {
        BTreeMap::from([("z".to_string(), ramp::<f32>(4, 3))])
    }

    #[test]
    fn missing_root_values_are_reported() {
        let net = chain();
        let err = net
            .evaluate(&BTreeMap::new(), &EvalOptions::default(), &mut seeded_rng(0))
            .unwrap_err();
        assert!(err.to_string().contains("root variable \"z\" has no value"));
    }

    #[test]
    fn observed_roots_feed_children() {
        let net = chain();
        let trace = net
            .evaluate(&z_inputs(), &EvalOptions::default(), &mut seeded_rng(0))
            .unwrap();
        assert_eq!(trace.iw(), 1);
        assert_eq!(trace.sample("z").unwrap(), &ramp::<f32>(4, 3));
        assert_eq!(trace.observed("z").unwrap(), &ramp::<f32>(4, 3));
        assert_eq!(trace.sample("x").unwrap().shape(), &[4, 2]);
        assert!(trace.params("x").is_some());
        assert!(trace.params("z").is_none());
    }

    #[test]
    fn seeded_passes_reproduce() {
        let net = chain();
        let a = net
            .evaluate(&z_inputs(), &EvalOptions::default(), &mut seeded_rng(7))
            .unwrap();
        let b = net
            .evaluate(&z_inputs(), &EvalOptions::default(), &mut seeded_rng(7))
            .unwrap();
        let c = net
            .evaluate(&z_inputs(), &EvalOptions::default(), &mut seeded_rng(8))
            .unwrap();
        assert_eq!(a.sample("x"), b.sample("x"));
        assert_ne!(a.sample("x"), c.sample("x"));
    }

    #[test]
    fn observed_targets_are_pinned_to_their_observations() {
        let net = chain();
        let mut inputs = z_inputs();
        inputs.insert("x".to_string(), ramp::<f32>(4, 2));
        let trace = net
            .evaluate(&inputs, &EvalOptions::default(), &mut seeded_rng(0))
            .unwrap();
        assert_eq!(trace.sample("x").unwrap(), &ramp::<f32>(4, 2));
        // parameters are still produced for likelihood terms
        assert!(trace.params("x").is_some());
    }

    #[test]
    fn importance_axis_spans_every_realized_tensor() {
        utils::init_test_tracing();
        let net = chain();
        let options = EvalOptions::default().with_importance_samples(4);
        let trace = net
            .evaluate(&z_inputs(), &options, &mut seeded_rng(0))
            .unwrap();
        assert_eq!(trace.iw(), 4);
        assert_eq!(trace.sample("z").unwrap().shape(), &[4, 4, 3]);
        assert_eq!(trace.sample("x").unwrap().shape(), &[4, 4, 2]);
        // the observed map keeps the caller's shapes
        assert_eq!(trace.observed("z").unwrap().shape(), &[4, 3]);
    }

    #[test]
    fn forced_variables_draw_fresh_noise_per_sample() {
        let net = chain();
        let options = EvalOptions::default().with_importance_samples(3);
        let trace = net
            .evaluate(&z_inputs(), &options, &mut seeded_rng(0))
            .unwrap();
        let x = trace.sample("x").unwrap();
        assert_ne!(
            x.index_leading(0).unwrap(),
            x.index_leading(1).unwrap(),
            "default forcing must decorrelate the importance samples"
        );
    }

    #[test]
    fn unforced_variables_share_one_draw_across_samples() {
        let net = chain();
        let options = EvalOptions::default()
            .with_importance_samples(3)
            .with_forced_importance(Vec::<String>::new());
        let trace = net
            .evaluate(&z_inputs(), &options, &mut seeded_rng(0))
            .unwrap();
        let x = trace.sample("x").unwrap();
        let first = x.index_leading(0).unwrap();
        for i in 1..3 {
            assert_eq!(x.index_leading(i).unwrap(), first);
        }
    }

    #[test]
    fn single_importance_sample_matches_the_plain_pass() {
        let net = chain();
        let plain = net
            .evaluate(&z_inputs(), &EvalOptions::default(), &mut seeded_rng(5))
            .unwrap();
        let one = net
            .evaluate(
                &z_inputs(),
                &EvalOptions::default().with_importance_samples(1),
                &mut seeded_rng(5),
            )
            .unwrap();
        assert_eq!(plain.sample("x"), one.sample("x"));
        assert_eq!(plain.sample("x").unwrap().shape(), &[4, 2]);
    }

    #[test]
    fn pre_expanded_inputs_are_not_broadcast_again() {
        let net = chain();
        let mut inputs = z_inputs();
        let mut bearing = BTreeSet::new();
        harmonize_inputs(&mut inputs, &bearing, 2);
        bearing.insert("z".to_string());
        // idempotent on bearing entries
        harmonize_inputs(&mut inputs, &bearing, 2);
        let options = EvalOptions::default()
            .with_importance_samples(2)
            .with_inputs_bearing_iw_axis(true);
        let trace = net.evaluate(&inputs, &options, &mut seeded_rng(0)).unwrap();
        assert_eq!(trace.sample("z").unwrap().shape(), &[2, 4, 3]);
        assert_eq!(trace.sample("x").unwrap().shape(), &[2, 4, 2]);
    }

    #[test]
    fn substitution_pins_the_sample_but_still_fires_the_link() {
        let (net, fired) = spied_chain();
        let mut inputs = z_inputs();
        inputs.insert("x".to_string(), ramp::<f32>(4, 2));
        let substituted = Tensor::filled(&[4, 2], 9.0f32);
        let options = EvalOptions::default().with_substituted_value("x", substituted.clone());
        let trace = net.evaluate(&inputs, &options, &mut seeded_rng(0)).unwrap();
        // the sample is forced, the observation loses, the link still ran
        assert_eq!(trace.sample("x").unwrap(), &substituted);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(trace.params("x").is_some());
    }

    #[test]
    fn planting_and_substituting_together_skip_the_link() {
        let (net, fired) = spied_chain();
        let planted = Params::Gaussian {
            loc: Tensor::filled(&[4, 2], 0.3f32),
            scale: Tensor::filled(&[4, 2], 1.0f32),
        };
        let substituted = Tensor::filled(&[4, 2], 9.0f32);
        let options = EvalOptions::default()
            .with_planted_posterior("x", planted.clone())
            .with_substituted_value("x", substituted.clone())
            // no value for z on purpose: a planted target pulls in no parents
            .with_target_subset(["x"]);
        let trace = net
            .evaluate(&BTreeMap::new(), &options, &mut seeded_rng(0))
            .unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(trace.sample("x").unwrap(), &substituted);
        assert_eq!(trace.params("x").unwrap(), &planted);
        assert!(trace.sample("z").is_none());
    }

    #[test]
    fn planted_posteriors_replace_the_link_parameters() {
        let (net, fired) = spied_chain();
        let planted = Params::Gaussian {
            loc: Tensor::filled(&[4, 2], 0.3f32),
            scale: Tensor::filled(&[4, 2], 1.0f32),
        };
        let options = EvalOptions::default().with_planted_posterior("x", planted.clone());
        let trace = net
            .evaluate(&z_inputs(), &options, &mut seeded_rng(0))
            .unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(trace.params("x").unwrap(), &planted);
        assert_eq!(trace.sample("x").unwrap().shape(), &[4, 2]);
    }

    #[test]
    fn target_subsets_skip_unneeded_branches() {
        let (spy_w, fired_w) = SpyLink::new(affine(3, 2, 2));
        let net = BayesNet::builder()
            .with_variable(Variable::new("z", Family::Gaussian { dim: 3 }))
            .with_variable(Variable::new("h", Family::Gaussian { dim: 3 }))
            .with_variable(Variable::new("x", Family::Gaussian { dim: 2 }))
            .with_variable(Variable::new("w", Family::Gaussian { dim: 2 }))
            .with_edge(Edge::new("h", vec![Parent::new("z")], affine(3, 3, 1)))
            .with_edge(Edge::new("x", vec![Parent::new("h")], affine(3, 2, 3)))
            .with_edge(Edge::new("w", vec![Parent::new("z")], Arc::new(spy_w)))
            .build()
            .unwrap();
        let options = EvalOptions::default().with_target_subset(["x"]);
        let trace = net
            .evaluate(&z_inputs(), &options, &mut seeded_rng(0))
            .unwrap();
        assert_eq!(fired_w.load(Ordering::SeqCst), 0);
        assert!(trace.sample("w").is_none());
        assert!(trace.sample("h").is_some());
        assert!(trace.sample("x").is_some());
    }

    #[test]
    fn recurrent_state_chains_across_chunks() {
        let net = BayesNet::builder()
            .with_variable(Variable::new("c", Family::Gaussian { dim: 3 }))
            .with_variable(Variable::new("s", Family::Gaussian { dim: 3 }))
            .with_edge(Edge::new(
                "s",
                vec![Parent::new("c")],
                Arc::new(AccumulatorLink),
            ))
            .build()
            .unwrap();
        let a = ramp::<f32>(2, 3);
        let b = Tensor::filled(&[2, 3], 0.5f32);

        let first = net
            .evaluate(
                &BTreeMap::from([("c".to_string(), a.clone())]),
                &EvalOptions::default(),
                &mut seeded_rng(0),
            )
            .unwrap();
        let second = net
            .evaluate(
                &BTreeMap::from([("c".to_string(), b.clone())]),
                &EvalOptions::default().with_previous_state(first.into_states()),
                &mut seeded_rng(1),
            )
            .unwrap();
        let oneshot = net
            .evaluate(
                &BTreeMap::from([("c".to_string(), a.add(&b).unwrap())]),
                &EvalOptions::default(),
                &mut seeded_rng(2),
            )
            .unwrap();
        assert_eq!(second.params("s"), oneshot.params("s"));
        assert_eq!(second.state("s"), oneshot.state("s"));
    }

    #[test]
    fn declared_priors_backfill_missing_roots() {
        let net = BayesNet::builder()
            .with_variable(
                Variable::new("z", Family::Gaussian { dim: 3 }).with_prior(Prior::StandardGaussian),
            )
            .with_variable(Variable::new("x", Family::Gaussian { dim: 2 }).generated())
            .with_edge(Edge::new("x", vec![Parent::new("z")], affine(3, 2, 1)))
            .build()
            .unwrap();
        // batch dims inferred from the observed x
        let inputs = BTreeMap::from([("x".to_string(), ramp::<f32>(4, 2))]);
        let trace = net
            .evaluate(&inputs, &EvalOptions::default(), &mut seeded_rng(0))
            .unwrap();
        assert_eq!(trace.sample("z").unwrap().shape(), &[4, 3]);
        assert!(trace.params("z").is_some());
        assert!(trace.observed("z").is_none());

        // explicit batch dims without any input at all
        let trace = net
            .prior_sample(
                &[5],
                &BTreeMap::new(),
                &EvalOptions::default(),
                &mut seeded_rng(0),
            )
            .unwrap();
        assert_eq!(trace.sample("z").unwrap().shape(), &[5, 3]);
        assert_eq!(trace.sample("x").unwrap().shape(), &[5, 2]);
    }

    #[test]
    fn prior_sampling_without_a_prior_or_seed_is_an_error() {
        let net = chain();
        let err = net
            .prior_sample(
                &[2],
                &BTreeMap::new(),
                &EvalOptions::default(),
                &mut seeded_rng(0),
            )
            .unwrap_err();
        assert!(err.to_string().contains("root variable \"z\" has no value"));

        let trace = net
            .prior_sample(&[4], &z_inputs(), &EvalOptions::default(), &mut seeded_rng(0))
            .unwrap();
        assert_eq!(trace.sample("x").unwrap().shape(), &[4, 2]);
    }

    #[test]
    fn unknown_names_in_options_are_rejected() {
        let net = chain();
        let err = net
            .evaluate(
                &z_inputs(),
                &EvalOptions::default().with_target_subset(["ghost"]),
                &mut seeded_rng(0),
            )
            .unwrap_err();
        assert!(err.to_string().contains("unknown variable \"ghost\""));
        let err = net
            .evaluate(
                &z_inputs(),
                &EvalOptions::default().with_substituted_value("ghost", ramp::<f32>(1, 1)),
                &mut seeded_rng(0),
            )
            .unwrap_err();
        assert!(err.to_string().contains("unknown variable \"ghost\""));
    }
}
