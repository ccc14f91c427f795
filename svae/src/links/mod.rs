//! The conditional-mapping contract between variables.
//!
//! A [`Link`] consumes resolved parent values and produces the target
//! variable's distribution parameters. The engine never looks past this
//! trait: recurrent, attention-based and feed-forward transformations are all
//! interchangeable behind it. Two reference implementations live here so that
//! factories and tests have something concrete to wire; real neural links are
//! expected to be supplied by the caller through the same trait.

pub mod affine;
pub mod recurrent;

use anyhow::Result;
use derive_more::From;

use crate::dist::Params;
use crate::tensor::{Number, Tensor};
use crate::variable::Family;

pub use affine::AffineLink;
pub use recurrent::ElmanLink;

/// Role a parent plays for a link. Opaque to the engine; links may use it to
/// treat inputs differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParentRole {
    /// Consumed elementwise along the batch.
    #[default]
    Sequence,
    /// Consumed as a fixed set of context values.
    Memory,
    /// Used for gating or attention keys.
    Key,
}

/// A parent declaration on an edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parent {
    pub name: String,
    pub role: ParentRole,
}

impl Parent {
    pub fn new(name: impl Into<String>) -> Parent {
        Parent {
            name: name.into(),
            role: ParentRole::Sequence,
        }
    }

    pub fn with_role(mut self, role: ParentRole) -> Parent {
        self.role = role;
        self
    }
}

/// One resolved parent value handed to a link.
#[derive(Debug, Clone, Copy)]
pub struct LinkInput<'a, N: Number> {
    pub name: &'a str,
    pub role: ParentRole,
    pub value: &'a Tensor<N>,
}

/// Recurrent state carried by a link across evaluation cycles.
///
/// Multi-tensor so that links with several recurrent slots (an LSTM-style
/// cell) fit; the reference links use a single tensor.
#[derive(Debug, Clone, PartialEq, From)]
pub struct LinkState<N: Number>(Vec<Tensor<N>>);

impl<N: Number> LinkState<N> {
    pub fn single(tensor: Tensor<N>) -> LinkState<N> {
        LinkState(vec![tensor])
    }

    pub fn tensors(&self) -> &[Tensor<N>] {
        &self.0
    }
}

/// The single contract every conditional transformation satisfies.
///
/// Implementations must be deterministic given `(parents, state)` and their
/// internal parameters, and free of side effects.
pub trait Link<N: Number>: Send + Sync {
    /// Produces the target variable's distribution parameters, plus updated
    /// recurrent state when the link carries one.
    fn forward(
        &self,
        parents: &[LinkInput<'_, N>],
        state: Option<&LinkState<N>>,
    ) -> Result<(Params<N>, Option<LinkState<N>>)>;

    /// Flat views over learned parameter groups, for norm reporting.
    fn parameters(&self) -> Vec<&[N]> {
        Vec::new()
    }

    /// Short description used in logs and error reports.
    fn describe(&self) -> String;
}

/// Width of the raw affine row a family head consumes.
pub(crate) fn head_width(head: Family) -> usize {
    match head {
        Family::Gaussian { dim } => 2 * dim,
        Family::Categorical { classes } => classes,
        Family::MultiCategorical { groups, classes } => groups * classes,
    }
}

/// Floor on produced Gaussian scales.
pub(crate) const MIN_SCALE: f64 = 1e-4;

/// Numerically stable ln(1 + e^x).
pub(crate) fn softplus(x: f64) -> f64 {
    if x > 0.0 {
        x + (-x).exp().ln_1p()
    } else {
        x.exp().ln_1p()
    }
}

/// Splits a raw `[..., head_width]` activation into family parameters.
///
/// Gaussian heads halve the trailing axis into location and softplus-mapped
/// scale; categorical heads pass logits through, reshaping the
/// multi-categorical block to `[..., groups, classes]`.
pub(crate) fn split_head<N: Number>(raw: Tensor<N>, head: Family) -> Result<Params<N>> {
    match head {
        Family::Gaussian { dim } => {
            let shape = raw.shape();
            let mut out_shape = shape[..shape.len() - 1].to_vec();
            out_shape.push(dim);
            let mut loc = Vec::with_capacity(raw.len() / 2);
            let mut scale = Vec::with_capacity(raw.len() / 2);
            for row in raw.data().chunks(2 * dim) {
                loc.extend(row[..dim].iter().copied());
                scale.extend(
                    row[dim..]
                        .iter()
                        .map(|v| N::from_f64(softplus(v.to_f64()) + MIN_SCALE)),
                );
            }
            Ok(Params::Gaussian {
                loc: Tensor::new(&out_shape, loc)?,
                scale: Tensor::new(&out_shape, scale)?,
            })
        }
        Family::Categorical { .. } => Ok(Params::Categorical { logits: raw }),
        Family::MultiCategorical { groups, classes } => {
            let mut shape = raw.shape().to_vec();
            shape.pop();
            shape.push(groups);
            shape.push(classes);
            Ok(Params::MultiCategorical {
                logits: raw.reshape(&shape)?,
            })
        }
    }
}
