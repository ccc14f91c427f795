//! Shared fixtures for unit tests and downstream experiments.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use rand::{rngs::StdRng, SeedableRng};

use crate::dist::Params;
use crate::links::{Link, LinkInput, LinkState};
use crate::tensor::{Number, Tensor};

pub fn seeded_rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

/// `[batch, dim]` tensor filled with a small deterministic ramp.
pub fn ramp<N: Number>(batch: usize, dim: usize) -> Tensor<N> {
    let data = (0..batch * dim)
        .map(|i| N::from_f64(0.1 * i as f64))
        .collect();
    Tensor::new(&[batch, dim], data).expect("ramp dimensions are consistent")
}

/// `[labels.len(), classes]` one-hot rows.
pub fn one_hot_batch<N: Number>(classes: usize, labels: &[usize]) -> Tensor<N> {
    let mut data = vec![N::ZERO; labels.len() * classes];
    for (row, &label) in labels.iter().enumerate() {
        data[row * classes + label % classes] = N::ONE;
    }
    Tensor::new(&[labels.len(), classes], data).expect("one-hot dimensions are consistent")
}

pub fn assert_close(actual: f64, expected: f64, tol: f64) {
    assert!(
        (actual - expected).abs() <= tol,
        "expected {expected} within {tol}, got {actual}"
    );
}

/// Ignores its parents and returns a fixed parameter set verbatim. Callers
/// manage leading axes themselves.
pub struct ScriptedLink<N: Number> {
    params: Params<N>,
}

impl<N: Number> ScriptedLink<N> {
    pub fn new(params: Params<N>) -> ScriptedLink<N> {
        ScriptedLink { params }
    }
}

impl<N: Number> Link<N> for ScriptedLink<N> {
    fn forward(
        &self,
        _parents: &[LinkInput<'_, N>],
        _state: Option<&LinkState<N>>,
    ) -> Result<(Params<N>, Option<LinkState<N>>)> {
        Ok((self.params.clone(), None))
    }

    fn describe(&self) -> String {
        format!("Scripted({})", self.params.family_name())
    }
}

/// Wraps another link and counts how often it fires.
pub struct SpyLink<N: Number> {
    inner: Arc<dyn Link<N>>,
    fired: Arc<AtomicUsize>,
}

impl<N: Number> SpyLink<N> {
    pub fn new(inner: Arc<dyn Link<N>>) -> (SpyLink<N>, Arc<AtomicUsize>) {
        let fired = Arc::new(AtomicUsize::new(0));
        let spy = SpyLink {
            inner,
            fired: Arc::clone(&fired),
        };
        (spy, fired)
    }
}

impl<N: Number> Link<N> for SpyLink<N> {
    fn forward(
        &self,
        parents: &[LinkInput<'_, N>],
        state: Option<&LinkState<N>>,
    ) -> Result<(Params<N>, Option<LinkState<N>>)> {
        self.fired.fetch_add(1, Ordering::SeqCst);
        self.inner.forward(parents, state)
    }

    fn parameters(&self) -> Vec<&[N]> {
        self.inner.parameters()
    }

    fn describe(&self) -> String {
        format!("Spy({})", self.inner.describe())
    }
}

/// Additive recurrence: the carried state is the running sum of the summed
/// parents and the produced Gaussian is centered on it with unit scale.
/// Consuming two chunks then matches one pass over their sum exactly, which
/// makes continuation tests deterministic.
pub struct AccumulatorLink;

impl<N: Number> Link<N> for AccumulatorLink {
    fn forward(
        &self,
        parents: &[LinkInput<'_, N>],
        state: Option<&LinkState<N>>,
    ) -> Result<(Params<N>, Option<LinkState<N>>)> {
        anyhow::ensure!(!parents.is_empty(), "accumulator link called with no parents");
        let mut total = parents[0].value.clone();
        for parent in &parents[1..] {
            total = total.add(parent.value)?;
        }
        if let Some(carried) = state.and_then(|s| s.tensors().first()) {
            total = total.add(carried)?;
        }
        let scale = Tensor::filled(total.shape(), N::ONE);
        let params = Params::Gaussian {
            loc: total.clone(),
            scale,
        };
        Ok((params, Some(LinkState::single(total))))
    }

    fn describe(&self) -> String {
        "Accumulator".to_string()
    }
}
