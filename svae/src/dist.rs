//! Distribution parameters and the sampling and scoring kernels behind them.
//!
//! A [`Params`] value is what a link produces and what a variable is sampled
//! from. Sampling is split into two halves: drawing a noise tensor
//! ([`draw_noise`]) and deterministically transforming it into a sample
//! ([`Params::draw_with_noise`]). The engine relies on that split to share one
//! noise draw across importance slices when a variable is not being
//! independently resampled.

use anyhow::{Result, bail, ensure};
use once_cell::sync::Lazy;
use rand::Rng;
use rand::distributions::Distribution;
use statrs::distribution::Normal;

use crate::tensor::{Number, Tensor};
use crate::variable::{Family, Prior};

static STD_NORMAL: Lazy<Normal> =
    Lazy::new(|| Normal::new(0.0, 1.0).expect("unit normal parameters are valid"));

/// Keeps uniform draws inside the open interval before the double log.
const UNIFORM_EPS: f64 = 1e-12;

const HALF_LN_TWO_PI: f64 = 0.918_938_533_204_672_7;

/// How a draw realizes a categorical-family variable.
///
/// Gaussian variables reparameterize the same way in both modes; the mode only
/// changes what is done with Gumbel-perturbed logits.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SampleMode {
    /// Gumbel-softmax relaxation at the given temperature. Differentiable,
    /// used during training.
    Relaxed { temperature: f64 },
    /// Exact one-hot draw via the Gumbel-max trick. Used in evaluation.
    Discrete,
}

/// The per-element noise a family consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoiseKind {
    Normal,
    Gumbel,
}

/// Draws a noise tensor of the given shape.
///
/// Normal noise feeds the Gaussian reparameterization; Gumbel noise feeds both
/// relaxed and discrete categorical draws.
pub fn draw_noise<R: Rng>(kind: NoiseKind, shape: &[usize], rng: &mut R) -> Result<Tensor<f64>> {
    let len = shape.iter().product::<usize>();
    let data = match kind {
        NoiseKind::Normal => (0..len).map(|_| STD_NORMAL.sample(rng)).collect(),
        NoiseKind::Gumbel => (0..len)
            .map(|_| {
                let u = rng.gen::<f64>().clamp(UNIFORM_EPS, 1.0 - UNIFORM_EPS);
                -(-u.ln()).ln()
            })
            .collect(),
    };
    Ok(Tensor::new(shape, data)?)
}

/// Parameters of one variable's distribution.
///
/// Tensors use the convention that the trailing axes are the event (one axis
/// for Gaussian and plain categorical, `[groups, classes]` for the
/// multi-categorical family) and everything before them is batch-like,
/// including an optional leading importance-sample axis.
#[derive(Debug, Clone, PartialEq)]
pub enum Params<N: Number> {
    Gaussian { loc: Tensor<N>, scale: Tensor<N> },
    Categorical { logits: Tensor<N> },
    MultiCategorical { logits: Tensor<N> },
}

impl<N: Number> Params<N> {
    pub fn family_name(&self) -> &'static str {
        match self {
            Params::Gaussian { .. } => "Gaussian",
            Params::Categorical { .. } => "Categorical",
            Params::MultiCategorical { .. } => "MultiCategorical",
        }
    }

    /// Shape a sample drawn from these parameters will have.
    pub fn value_shape(&self) -> &[usize] {
        match self {
            Params::Gaussian { loc, .. } => loc.shape(),
            Params::Categorical { logits } | Params::MultiCategorical { logits } => logits.shape(),
        }
    }

    pub fn noise_kind(&self) -> NoiseKind {
        match self {
            Params::Gaussian { .. } => NoiseKind::Normal,
            Params::Categorical { .. } | Params::MultiCategorical { .. } => NoiseKind::Gumbel,
        }
    }

    /// Checks internal consistency and agreement with a declared family.
    pub fn matches_family(&self, family: Family) -> Result<()> {
        match (self, family) {
            (Params::Gaussian { loc, scale }, Family::Gaussian { dim }) => {
                ensure!(
                    loc.shape() == scale.shape(),
                    "gaussian loc shape {:?} and scale shape {:?} differ",
                    loc.shape(),
                    scale.shape()
                );
                ensure!(
                    loc.shape().last() == Some(&dim),
                    "gaussian parameters end in {:?}, variable declares dim {}",
                    loc.shape(),
                    dim
                );
                Ok(())
            }
            (Params::Categorical { logits }, Family::Categorical { classes }) => {
                ensure!(
                    logits.shape().last() == Some(&classes),
                    "categorical logits end in {:?}, variable declares {} classes",
                    logits.shape(),
                    classes
                );
                Ok(())
            }
            (Params::MultiCategorical { logits }, Family::MultiCategorical { groups, classes }) => {
                let shape = logits.shape();
                ensure!(
                    shape.len() >= 2
                        && shape[shape.len() - 1] == classes
                        && shape[shape.len() - 2] == groups,
                    "multi-categorical logits {:?} do not end in [{}, {}]",
                    shape,
                    groups,
                    classes
                );
                Ok(())
            }
            (params, family) => bail!(
                "{} parameters do not fit a {} variable",
                params.family_name(),
                family.name()
            ),
        }
    }

    /// Attaches a leading importance axis to every parameter tensor.
    pub fn broadcast_leading(&self, k: usize) -> Params<N> {
        match self {
            Params::Gaussian { loc, scale } => Params::Gaussian {
                loc: loc.broadcast_leading(k),
                scale: scale.broadcast_leading(k),
            },
            Params::Categorical { logits } => Params::Categorical {
                logits: logits.broadcast_leading(k),
            },
            Params::MultiCategorical { logits } => Params::MultiCategorical {
                logits: logits.broadcast_leading(k),
            },
        }
    }

    /// Deterministically transforms pre-drawn noise into a sample.
    pub fn draw_with_noise(&self, noise: &Tensor<f64>, mode: SampleMode) -> Result<Tensor<N>> {
        ensure!(
            noise.shape() == self.value_shape(),
            "noise shape {:?} does not match parameter shape {:?}",
            noise.shape(),
            self.value_shape()
        );
        match self {
            Params::Gaussian { loc, scale } => {
                let data = loc
                    .data()
                    .iter()
                    .zip(scale.data())
                    .zip(noise.data())
                    .map(|((&m, &s), &e)| N::from_f64(m.to_f64() + s.to_f64() * e))
                    .collect();
                Ok(Tensor::new(loc.shape(), data)?)
            }
            Params::Categorical { logits } | Params::MultiCategorical { logits } => {
                let perturbed_data = logits
                    .data()
                    .iter()
                    .zip(noise.data())
                    .map(|(&l, &g)| N::from_f64(l.to_f64() + g))
                    .collect::<Vec<N>>();
                let perturbed = Tensor::new(logits.shape(), perturbed_data)?;
                match mode {
                    SampleMode::Discrete => Ok(perturbed.one_hot_argmax_last_axis()?),
                    SampleMode::Relaxed { temperature } => {
                        ensure!(
                            temperature > 0.0,
                            "relaxation temperature must be positive, got {}",
                            temperature
                        );
                        let scaled = perturbed.map(|v| N::from_f64(v.to_f64() / temperature));
                        Ok(scaled.softmax_last_axis()?)
                    }
                }
            }
        }
    }

    /// Draws a sample with fresh noise.
    pub fn draw<R: Rng>(&self, mode: SampleMode, rng: &mut R) -> Result<Tensor<N>> {
        let noise = draw_noise(self.noise_kind(), self.value_shape(), rng)?;
        self.draw_with_noise(&noise, mode)
    }

    /// Elementwise log density of `value` under these parameters.
    ///
    /// For categorical families this is `value ⊙ log_softmax(logits)`: a
    /// one-hot row contributes the log probability of its class and an
    /// all-zero padding row contributes nothing.
    pub fn log_prob(&self, value: &Tensor<N>) -> Result<Tensor<N>> {
        match self {
            Params::Gaussian { loc, scale } => {
                ensure!(
                    value.shape() == loc.shape(),
                    "value shape {:?} does not match gaussian parameter shape {:?}",
                    value.shape(),
                    loc.shape()
                );
                let data = value
                    .data()
                    .iter()
                    .zip(loc.data())
                    .zip(scale.data())
                    .map(|((&x, &m), &s)| {
                        let sf = s.to_f64();
                        let d = (x.to_f64() - m.to_f64()) / sf;
                        N::from_f64(-HALF_LN_TWO_PI - sf.ln() - 0.5 * d * d)
                    })
                    .collect();
                Ok(Tensor::new(value.shape(), data)?)
            }
            Params::Categorical { logits } | Params::MultiCategorical { logits } => {
                let ls = logits.log_softmax_last_axis()?;
                Ok(value.zip_map(&ls, |x, l| x * l)?)
            }
        }
    }

    /// Elementwise KL divergence `KL(self ‖ other)`.
    ///
    /// Defined between matching families only: Gaussian pairs in closed form
    /// per coordinate, categorical pairs as `softmax(q) ⊙ (log_softmax(q) −
    /// log_softmax(p))` per class entry.
    pub fn kl_to(&self, other: &Params<N>) -> Result<Tensor<N>> {
        match (self, other) {
            (
                Params::Gaussian { loc: lq, scale: sq },
                Params::Gaussian { loc: lp, scale: sp },
            ) => {
                ensure!(
                    lq.shape() == lp.shape() && sq.shape() == sp.shape(),
                    "KL operand shapes differ: {:?} vs {:?}",
                    lq.shape(),
                    lp.shape()
                );
                let mut data = Vec::with_capacity(lq.len());
                for i in 0..lq.len() {
                    let mq = lq.data()[i].to_f64();
                    let sqv = sq.data()[i].to_f64();
                    let mp = lp.data()[i].to_f64();
                    let spv = sp.data()[i].to_f64();
                    let val = (spv / sqv).ln()
                        + (sqv * sqv + (mq - mp) * (mq - mp)) / (2.0 * spv * spv)
                        - 0.5;
                    data.push(N::from_f64(val));
                }
                Ok(Tensor::new(lq.shape(), data)?)
            }
            (Params::Categorical { logits: q }, Params::Categorical { logits: p })
            | (Params::MultiCategorical { logits: q }, Params::MultiCategorical { logits: p }) => {
                ensure!(
                    q.shape() == p.shape(),
                    "KL operand shapes differ: {:?} vs {:?}",
                    q.shape(),
                    p.shape()
                );
                let probs = q.softmax_last_axis()?;
                let lq = q.log_softmax_last_axis()?;
                let lp = p.log_softmax_last_axis()?;
                let diff = lq.zip_map(&lp, |a, b| a - b)?;
                Ok(probs.zip_map(&diff, |a, b| a * b)?)
            }
            (q, p) => bail!(
                "KL between {} and {} parameters is not defined",
                q.family_name(),
                p.family_name()
            ),
        }
    }
}

impl Prior {
    /// Fills a declared prior out to concrete parameter tensors of the given
    /// sample shape.
    pub fn materialize<N: Number>(self, family: Family, value_shape: &[usize]) -> Result<Params<N>> {
        let params = match (self, family) {
            (Prior::StandardGaussian, Family::Gaussian { .. }) => Params::Gaussian {
                loc: Tensor::zeros(value_shape),
                scale: Tensor::filled(value_shape, N::ONE),
            },
            (Prior::Gaussian { loc, scale }, Family::Gaussian { .. }) => {
                ensure!(scale > 0.0, "prior scale must be positive, got {}", scale);
                Params::Gaussian {
                    loc: Tensor::filled(value_shape, N::from_f64(loc)),
                    scale: Tensor::filled(value_shape, N::from_f64(scale)),
                }
            }
            (Prior::UniformLogits, Family::Categorical { .. }) => Params::Categorical {
                logits: Tensor::zeros(value_shape),
            },
            (Prior::UniformLogits, Family::MultiCategorical { .. }) => Params::MultiCategorical {
                logits: Tensor::zeros(value_shape),
            },
            (prior, family) => bail!(
                "prior {:?} does not fit a {} variable",
                prior,
                family.name()
            ),
        };
        params.matches_family(family)?;
        Ok(params)
    }
}
