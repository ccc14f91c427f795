//! Feed-forward reference link: one affine map into a family-shaped head.

use anyhow::{ensure, Context, Result};
use itertools::Itertools;
use rand::{rngs::StdRng, Rng, SeedableRng};

use super::{head_width, split_head, Link, LinkInput, LinkState};
use crate::dist::Params;
use crate::tensor::{Number, Tensor};
use crate::variable::Family;

/// Concatenates its parents along the trailing axis, applies a single affine
/// map and splits the result into the head family's parameters.
#[derive(Debug, Clone)]
pub struct AffineLink<N: Number> {
    weight: Tensor<N>,
    bias: Tensor<N>,
    head: Family,
}

impl<N: Number> AffineLink<N> {
    pub fn new(weight: Tensor<N>, bias: Tensor<N>, head: Family) -> Result<AffineLink<N>> {
        ensure!(
            weight.rank() == 2,
            "affine weight must be [input, output], got {:?}",
            weight.shape()
        );
        let width = head_width(head);
        ensure!(
            weight.shape()[1] == width,
            "affine weight output width {} does not match the {} head width {}",
            weight.shape()[1],
            head.name(),
            width
        );
        ensure!(
            bias.rank() == 1 && bias.shape()[0] == width,
            "affine bias shape {:?} does not match head width {}",
            bias.shape(),
            width
        );
        Ok(AffineLink { weight, bias, head })
    }

    /// Fresh link with uniform weights in `[-1/sqrt(in_dim), 1/sqrt(in_dim)]`
    /// and zero bias, deterministic in `seed`.
    pub fn seeded(in_dim: usize, head: Family, seed: u64) -> Result<AffineLink<N>> {
        let width = head_width(head);
        let mut rng = StdRng::seed_from_u64(seed);
        let bound = 1.0 / (in_dim.max(1) as f64).sqrt();
        let data = (0..in_dim * width)
            .map(|_| N::from_f64(rng.gen_range(-bound..=bound)))
            .collect_vec();
        let weight = Tensor::new(&[in_dim, width], data)?;
        let bias = Tensor::zeros(&[width]);
        AffineLink::new(weight, bias, head)
    }

    pub fn in_dim(&self) -> usize {
        self.weight.shape()[0]
    }

    pub fn head(&self) -> Family {
        self.head
    }
}

impl<N: Number> Link<N> for AffineLink<N> {
    fn forward(
        &self,
        parents: &[LinkInput<'_, N>],
        _state: Option<&LinkState<N>>,
    ) -> Result<(Params<N>, Option<LinkState<N>>)> {
        ensure!(!parents.is_empty(), "affine link called with no parents");
        let values = parents.iter().map(|p| p.value).collect_vec();
        let x = Tensor::concat_last(&values).context("concatenating affine link parents")?;
        let in_dim = self.in_dim();
        ensure!(
            x.shape().last() == Some(&in_dim),
            "affine link expects trailing input width {}, parents concatenate to {:?}",
            in_dim,
            x.shape()
        );
        let raw = x.matmul_last(&self.weight)?.add_bias(&self.bias)?;
        Ok((split_head(raw, self.head)?, None))
    }

    fn parameters(&self) -> Vec<&[N]> {
        vec![self.weight.data(), self.bias.data()]
    }

    fn describe(&self) -> String {
        format!(
            "Affine({} -> {} head, {:?})",
            self.in_dim(),
            self.head.name(),
            self.head.event_shape()
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn seeded_is_deterministic() {
        let a = AffineLink::<f32>::seeded(3, Family::Gaussian { dim: 2 }, 7).unwrap();
        let b = AffineLink::<f32>::seeded(3, Family::Gaussian { dim: 2 }, 7).unwrap();
        let c = AffineLink::<f32>::seeded(3, Family::Gaussian { dim: 2 }, 8).unwrap();
        assert_eq!(a.parameters(), b.parameters());
        assert_ne!(a.parameters(), c.parameters());
    }

    #[test]
    fn forward_produces_gaussian_parameters_with_positive_scale() {
        let link = AffineLink::<f32>::seeded(4, Family::Gaussian { dim: 3 }, 1).unwrap();
        let x = Tensor::new(&[2, 4], vec![0.5f32; 8]).unwrap();
        let input = LinkInput {
            name: "x",
            role: Default::default(),
            value: &x,
        };
        let (params, state) = link.forward(&[input], None).unwrap();
        assert!(state.is_none());
        match params {
            Params::Gaussian { loc, scale } => {
                assert_eq!(loc.shape(), &[2, 3]);
                assert_eq!(scale.shape(), &[2, 3]);
                assert!(scale.data().iter().all(|&s| s > 0.0));
            }
            other => panic!("expected gaussian parameters, got {}", other.family_name()),
        }
    }

    #[test]
    fn parents_concatenate_along_the_trailing_axis() {
        let link = AffineLink::<f32>::seeded(5, Family::Categorical { classes: 4 }, 2).unwrap();
        let a = Tensor::new(&[2, 2], vec![1.0f32; 4]).unwrap();
        let b = Tensor::new(&[2, 3], vec![2.0f32; 6]).unwrap();
        let inputs = [
            LinkInput {
                name: "a",
                role: Default::default(),
                value: &a,
            },
            LinkInput {
                name: "b",
                role: Default::default(),
                value: &b,
            },
        ];
        let (params, _) = link.forward(&inputs, None).unwrap();
        assert_eq!(params.value_shape(), &[2, 4]);
    }

    #[test]
    fn mismatched_input_width_is_reported() {
        let link = AffineLink::<f32>::seeded(4, Family::Categorical { classes: 2 }, 3).unwrap();
        let x = Tensor::new(&[2, 3], vec![0.0f32; 6]).unwrap();
        let input = LinkInput {
            name: "x",
            role: Default::default(),
            value: &x,
        };
        let err = link.forward(&[input], None).unwrap_err();
        assert!(err.to_string().contains("trailing input width 4"));
    }

    #[test]
    fn parameter_groups_feed_norm_reporting() {
        let link = AffineLink::<f32>::seeded(3, Family::Categorical { classes: 2 }, 4).unwrap();
        let norm = utils::l2_norm(link.parameters());
        assert!(norm > 0.0);
    }
}
