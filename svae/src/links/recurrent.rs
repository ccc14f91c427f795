//! Recurrent reference link: an Elman cell over evaluation cycles.

use anyhow::{ensure, Context, Result};
use itertools::Itertools;
use rand::{rngs::StdRng, Rng, SeedableRng};

use super::{head_width, split_head, Link, LinkInput, LinkState};
use crate::dist::Params;
use crate::tensor::{Number, Tensor};
use crate::variable::Family;

/// Single-layer tanh recurrence. Each evaluation cycle consumes one chunk of
/// parent values and advances the hidden state; a missing state means the
/// start of a sequence and is treated as zeros.
#[derive(Debug, Clone)]
pub struct ElmanLink<N: Number> {
    input_weight: Tensor<N>,
    state_weight: Tensor<N>,
    bias: Tensor<N>,
    head_weight: Tensor<N>,
    head_bias: Tensor<N>,
    head: Family,
}

impl<N: Number> ElmanLink<N> {
    /// Fresh cell with uniform weights scaled by the fan-in, deterministic in
    /// `seed`.
    pub fn seeded(in_dim: usize, hidden: usize, head: Family, seed: u64) -> Result<ElmanLink<N>> {
        ensure!(hidden > 0, "elman link needs a nonzero hidden width");
        let width = head_width(head);
        let mut rng = StdRng::seed_from_u64(seed);
        let mut draw = |rows: usize, cols: usize| -> Result<Tensor<N>> {
            let bound = 1.0 / (rows.max(1) as f64).sqrt();
            let data = (0..rows * cols)
                .map(|_| N::from_f64(rng.gen_range(-bound..=bound)))
                .collect_vec();
            Tensor::new(&[rows, cols], data).map_err(Into::into)
        };
        Ok(ElmanLink {
            input_weight: draw(in_dim, hidden)?,
            state_weight: draw(hidden, hidden)?,
            bias: Tensor::zeros(&[hidden]),
            head_weight: draw(hidden, width)?,
            head_bias: Tensor::zeros(&[width]),
            head,
        })
    }

    pub fn in_dim(&self) -> usize {
        self.input_weight.shape()[0]
    }

    pub fn hidden(&self) -> usize {
        self.state_weight.shape()[0]
    }
}

impl<N: Number> Link<N> for ElmanLink<N> {
    fn forward(
        &self,
        parents: &[LinkInput<'_, N>],
        state: Option<&LinkState<N>>,
    ) -> Result<(Params<N>, Option<LinkState<N>>)> {
        ensure!(!parents.is_empty(), "elman link called with no parents");
        let values = parents.iter().map(|p| p.value).collect_vec();
        let x = Tensor::concat_last(&values).context("concatenating elman link parents")?;
        let in_dim = self.in_dim();
        ensure!(
            x.shape().last() == Some(&in_dim),
            "elman link expects trailing input width {}, parents concatenate to {:?}",
            in_dim,
            x.shape()
        );
        let pre = x.matmul_last(&self.input_weight)?;
        let h_prev = match state {
            Some(s) => {
                let carried = s
                    .tensors()
                    .first()
                    .context("elman link handed an empty state")?;
                ensure!(
                    carried.shape() == pre.shape(),
                    "carried state shape {:?} does not match current batch shape {:?}",
                    carried.shape(),
                    pre.shape()
                );
                carried.clone()
            }
            None => Tensor::zeros(pre.shape()),
        };
        let rec = h_prev.matmul_last(&self.state_weight)?;
        let h = pre
            .add(&rec)?
            .add_bias(&self.bias)?
            .map(|v| N::from_f64(v.to_f64().tanh()));
        let raw = h.matmul_last(&self.head_weight)?.add_bias(&self.head_bias)?;
        Ok((split_head(raw, self.head)?, Some(LinkState::single(h))))
    }

    fn parameters(&self) -> Vec<&[N]> {
        vec![
            self.input_weight.data(),
            self.state_weight.data(),
            self.bias.data(),
            self.head_weight.data(),
            self.head_bias.data(),
        ]
    }

    fn describe(&self) -> String {
        format!(
            "Elman({} -> {} hidden -> {} head)",
            self.in_dim(),
            self.hidden(),
            self.head.name()
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn chunk() -> Tensor<f32> {
        Tensor::new(&[2, 3], vec![0.1, 0.2, 0.3, -0.1, -0.2, -0.3]).unwrap()
    }

    #[test]
    fn missing_state_behaves_as_zeros() {
        let link = ElmanLink::<f32>::seeded(3, 4, Family::Gaussian { dim: 2 }, 11).unwrap();
        let x = chunk();
        let input = LinkInput {
            name: "x",
            role: Default::default(),
            value: &x,
        };
        let (fresh, _) = link.forward(&[input], None).unwrap();
        let zeros = LinkState::single(Tensor::zeros(&[2, 4]));
        let (explicit, _) = link.forward(&[input], Some(&zeros)).unwrap();
        assert_eq!(fresh, explicit);
    }

    #[test]
    fn carried_state_changes_the_next_cycle() {
        let link = ElmanLink::<f32>::seeded(3, 4, Family::Gaussian { dim: 2 }, 11).unwrap();
        let x = chunk();
        let input = LinkInput {
            name: "x",
            role: Default::default(),
            value: &x,
        };
        let (first, state) = link.forward(&[input], None).unwrap();
        let state = state.unwrap();
        assert_eq!(state.tensors()[0].shape(), &[2, 4]);
        let (second, _) = link.forward(&[input], Some(&state)).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn stale_state_shape_is_reported() {
        let link = ElmanLink::<f32>::seeded(3, 4, Family::Gaussian { dim: 2 }, 11).unwrap();
        let x = chunk();
        let input = LinkInput {
            name: "x",
            role: Default::default(),
            value: &x,
        };
        let stale = LinkState::single(Tensor::zeros(&[5, 4]));
        let err = link.forward(&[input], Some(&stale)).unwrap_err();
        assert!(err.to_string().contains("carried state shape"));
    }
}
