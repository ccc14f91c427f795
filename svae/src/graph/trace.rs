//! Record of one evaluation pass over a network.

use std::collections::BTreeMap;

use crate::dist::Params;
use crate::links::LinkState;
use crate::tensor::{Number, Tensor};

/// Everything an evaluation produced, keyed by variable name.
///
/// `samples` holds realized values (drawn, substituted or copied from
/// observations), `observed` the externally supplied values, `params` the
/// distribution parameters each realized variable was drawn under, and
/// `states` the recurrent link state per target, ready to seed the next
/// chunk of a sequence.
#[derive(Debug, Clone)]
pub struct Trace<N: Number> {
    samples: BTreeMap<String, Tensor<N>>,
    observed: BTreeMap<String, Tensor<N>>,
    params: BTreeMap<String, Params<N>>,
    states: BTreeMap<String, LinkState<N>>,
    iw: usize,
}

impl<N: Number> Trace<N> {
    pub(crate) fn new(iw: usize) -> Trace<N> {
        Trace {
            samples: BTreeMap::new(),
            observed: BTreeMap::new(),
            params: BTreeMap::new(),
            states: BTreeMap::new(),
            iw,
        }
    }

    /// Importance-sample count the pass ran under; 1 means no extra axis
    /// anywhere in the trace.
    pub fn iw(&self) -> usize {
        self.iw
    }

    pub fn sample(&self, name: &str) -> Option<&Tensor<N>> {
        self.samples.get(name)
    }

    pub fn observed(&self, name: &str) -> Option<&Tensor<N>> {
        self.observed.get(name)
    }

    pub fn params(&self, name: &str) -> Option<&Params<N>> {
        self.params.get(name)
    }

    pub fn state(&self, name: &str) -> Option<&LinkState<N>> {
        self.states.get(name)
    }

    pub fn samples(&self) -> &BTreeMap<String, Tensor<N>> {
        &self.samples
    }

    pub fn observations(&self) -> &BTreeMap<String, Tensor<N>> {
        &self.observed
    }

    /// Carries the recurrent states out for the next sequence chunk.
    pub fn into_states(self) -> BTreeMap<String, LinkState<N>> {
        self.states
    }

    pub(crate) fn record_sample(&mut self, name: &str, value: Tensor<N>) {
        self.samples.insert(name.to_string(), value);
    }

    pub(crate) fn record_observed(&mut self, name: &str, value: Tensor<N>) {
        self.observed.insert(name.to_string(), value);
    }

    pub(crate) fn record_params(&mut self, name: &str, params: Params<N>) {
        self.params.insert(name.to_string(), params);
    }

    pub(crate) fn record_state(&mut self, name: &str, state: LinkState<N>) {
        self.states.insert(name.to_string(), state);
    }
}
