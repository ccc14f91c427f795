//! Dense row-major tensors generic over the scalar type.
//!
//! Every value the execution engine moves around (observed batches, sampled
//! latents, distribution parameters) is a [`Tensor`]. The type is deliberately
//! small: shape bookkeeping, the handful of elementwise and reduction kernels
//! the engine and the criteria need, and nothing resembling autograd. Heavier
//! row kernels (softmax and the affine matmul) run on rayon.

mod error;

use std::fmt::Debug;
use std::ops::{Add, Div, Mul, Neg, Sub};

use rayon::prelude::*;

pub use error::TensorError;

/// Tensor dimensions, outermost axis first.
pub type Shape = Vec<usize>;

/// Scalar types the engine can run on.
///
/// Internal kernels accumulate in `f64` regardless of `N` and cast back on the
/// way out, so `f32` models do not pay a precision tax inside reductions.
pub trait Number:
    Copy
    + Debug
    + PartialEq
    + Send
    + Sync
    + 'static
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Div<Output = Self>
    + Neg<Output = Self>
    + Into<f64>
{
    const ZERO: Self;
    const ONE: Self;

    fn from_f64(value: f64) -> Self;

    fn to_f64(self) -> f64 {
        self.into()
    }
}

macro_rules! impl_number {
    ($($t:ty),*) => {
        $(impl Number for $t {
            const ZERO: Self = 0.0;
            const ONE: Self = 1.0;

            fn from_f64(value: f64) -> Self {
                value as $t
            }
        })*
    };
}

impl_number!(f32, f64);

#[derive(Debug, Clone, PartialEq)]
pub struct Tensor<N: Number> {
    /// The dimensions of the tensor
    shape: Shape,
    /// The actual data, row-major
    data: Vec<N>,
}

impl<N: Number> Tensor<N> {
    /// Builds a tensor checking that `data` fills `shape` exactly.
    pub fn new(shape: &[usize], data: Vec<N>) -> Result<Tensor<N>, TensorError> {
        let expected = shape.iter().product::<usize>();
        if data.len() != expected {
            return Err(TensorError::DataLength {
                shape: shape.to_vec(),
                expected,
                got: data.len(),
            });
        }
        Ok(Tensor {
            shape: shape.to_vec(),
            data,
        })
    }

    pub fn zeros(shape: &[usize]) -> Tensor<N> {
        Self::filled(shape, N::ZERO)
    }

    pub fn filled(shape: &[usize], value: N) -> Tensor<N> {
        let len = shape.iter().product::<usize>();
        Tensor {
            shape: shape.to_vec(),
            data: vec![value; len],
        }
    }

    /// Getter for the shape of the tensor
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Getter for the rank of the tensor (how many dimensions it has)
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Number of elements held.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Getter for the inner data
    pub fn data(&self) -> &[N] {
        &self.data
    }

    /// Converts a position given in coordinate form to the index into the flat
    /// data vector.
    pub fn get_index(&self, coords: &[usize]) -> Result<usize, TensorError> {
        if coords.len() != self.shape.len() {
            return Err(TensorError::Parameter(format!(
                "coordinate count {} does not match tensor rank {}",
                coords.len(),
                self.shape.len()
            )));
        }
        let (index, _) = coords.iter().zip(self.shape.iter()).rev().try_fold(
            (0usize, 1usize),
            |(index_acc, dim_acc), (&coord, &dim)| {
                if coord >= dim {
                    return Err(TensorError::Parameter(format!(
                        "coordinate {} was not below the axis size {}",
                        coord, dim
                    )));
                }
                Ok((index_acc + dim_acc * coord, dim_acc * dim))
            },
        )?;
        Ok(index)
    }

    pub fn get(&self, coords: &[usize]) -> Result<N, TensorError> {
        let index = self.get_index(coords)?;
        Ok(self.data[index])
    }

    /// Reinterprets the data under a new shape of the same total size.
    pub fn reshape(&self, shape: &[usize]) -> Result<Tensor<N>, TensorError> {
        let expected = shape.iter().product::<usize>();
        if expected != self.data.len() {
            return Err(TensorError::DataLength {
                shape: shape.to_vec(),
                expected,
                got: self.data.len(),
            });
        }
        Ok(Tensor {
            shape: shape.to_vec(),
            data: self.data.clone(),
        })
    }

    /// Prepends an axis of size `k`, replicating the whole tensor `k` times.
    ///
    /// This is how the importance-sample axis is attached to values that do
    /// not yet carry it.
    pub fn broadcast_leading(&self, k: usize) -> Tensor<N> {
        let mut shape = Vec::with_capacity(self.rank() + 1);
        shape.push(k);
        shape.extend_from_slice(&self.shape);
        let mut data = Vec::with_capacity(self.data.len() * k);
        for _ in 0..k {
            data.extend_from_slice(&self.data);
        }
        Tensor { shape, data }
    }

    /// Stacks equally shaped tensors along a new leading axis.
    pub fn stack(parts: &[Tensor<N>]) -> Result<Tensor<N>, TensorError> {
        let first = parts.first().ok_or_else(|| {
            TensorError::Parameter("cannot stack an empty collection of tensors".to_string())
        })?;
        for part in &parts[1..] {
            if part.shape != first.shape {
                return Err(TensorError::ShapeMismatch(
                    first.shape.clone(),
                    part.shape.clone(),
                ));
            }
        }
        let mut shape = vec![parts.len()];
        shape.extend_from_slice(&first.shape);
        let mut data = Vec::with_capacity(first.data.len() * parts.len());
        for part in parts {
            data.extend_from_slice(&part.data);
        }
        Ok(Tensor { shape, data })
    }

    /// Extracts one slice of the leading axis.
    pub fn index_leading(&self, index: usize) -> Result<Tensor<N>, TensorError> {
        let leading = *self.shape.first().ok_or_else(|| {
            TensorError::Parameter("cannot index the leading axis of a rank-0 tensor".to_string())
        })?;
        if index >= leading {
            return Err(TensorError::Parameter(format!(
                "leading index {} is out of range for an axis of size {}",
                index, leading
            )));
        }
        let chunk = self.data.len() / leading;
        let data = self.data[index * chunk..(index + 1) * chunk].to_vec();
        Ok(Tensor {
            shape: self.shape[1..].to_vec(),
            data,
        })
    }

    /// Concatenates tensors along their trailing axis. All leading axes must
    /// agree.
    pub fn concat_last(parts: &[&Tensor<N>]) -> Result<Tensor<N>, TensorError> {
        let first = parts.first().ok_or_else(|| {
            TensorError::Parameter("cannot concatenate an empty collection of tensors".to_string())
        })?;
        if first.rank() == 0 {
            return Err(TensorError::Parameter(
                "cannot concatenate rank-0 tensors".to_string(),
            ));
        }
        let lead = &first.shape[..first.rank() - 1];
        let mut last = 0usize;
        for part in parts {
            if part.rank() == 0 || &part.shape[..part.rank() - 1] != lead {
                return Err(TensorError::ShapeMismatch(
                    first.shape.clone(),
                    part.shape.clone(),
                ));
            }
            last += part.shape[part.rank() - 1];
        }
        let rows = lead.iter().product::<usize>();
        let mut shape = lead.to_vec();
        shape.push(last);
        let mut data = Vec::with_capacity(rows * last);
        for row in 0..rows {
            for part in parts {
                let width = part.shape[part.rank() - 1];
                data.extend_from_slice(&part.data[row * width..(row + 1) * width]);
            }
        }
        Ok(Tensor { shape, data })
    }

    /// Matrix product against the trailing axis: `self` is treated as rows of
    /// length `in_dim` and `weight` must be `[in_dim, out_dim]`.
    pub fn matmul_last(&self, weight: &Tensor<N>) -> Result<Tensor<N>, TensorError> {
        if weight.rank() != 2 {
            return Err(TensorError::Parameter(format!(
                "matmul weight must have rank 2, got shape {:?}",
                weight.shape
            )));
        }
        let in_dim = *self.shape.last().ok_or_else(|| {
            TensorError::Parameter("matmul input must have rank at least 1".to_string())
        })?;
        if in_dim == 0 || weight.shape[0] != in_dim {
            return Err(TensorError::ShapeMismatch(
                self.shape.clone(),
                weight.shape.clone(),
            ));
        }
        let out_dim = weight.shape[1];
        let mut shape = self.shape.clone();
        let rank = shape.len();
        shape[rank - 1] = out_dim;
        let rows = self.data.len() / in_dim;
        let mut out = vec![N::ZERO; rows * out_dim];
        if out_dim > 0 {
            out.par_chunks_mut(out_dim)
                .zip(self.data.par_chunks(in_dim))
                .for_each(|(dst, row)| {
                    for (o, slot) in dst.iter_mut().enumerate() {
                        let mut acc = 0.0f64;
                        for (i, value) in row.iter().enumerate() {
                            acc += value.to_f64() * weight.data[i * out_dim + o].to_f64();
                        }
                        *slot = N::from_f64(acc);
                    }
                });
        }
        Tensor::new(&shape, out)
    }

    /// Adds a rank-1 bias along the trailing axis.
    pub fn add_bias(&self, bias: &Tensor<N>) -> Result<Tensor<N>, TensorError> {
        let last = self.shape.last().copied().unwrap_or(0);
        if last == 0 || bias.rank() != 1 || bias.shape[0] != last {
            return Err(TensorError::ShapeMismatch(
                self.shape.clone(),
                bias.shape.clone(),
            ));
        }
        let data = self
            .data
            .chunks(last)
            .flat_map(|row| row.iter().zip(bias.data.iter()).map(|(&v, &b)| v + b))
            .collect::<Vec<N>>();
        Ok(Tensor {
            shape: self.shape.clone(),
            data,
        })
    }

    pub fn map<F: Fn(N) -> N>(&self, f: F) -> Tensor<N> {
        Tensor {
            shape: self.shape.clone(),
            data: self.data.iter().map(|&v| f(v)).collect(),
        }
    }

    /// Combines two same-shape tensors elementwise.
    pub fn zip_map<F: Fn(N, N) -> N>(
        &self,
        other: &Tensor<N>,
        f: F,
    ) -> Result<Tensor<N>, TensorError> {
        if self.shape != other.shape {
            return Err(TensorError::ShapeMismatch(
                self.shape.clone(),
                other.shape.clone(),
            ));
        }
        let data = self
            .data
            .iter()
            .zip(other.data.iter())
            .map(|(&a, &b)| f(a, b))
            .collect();
        Ok(Tensor {
            shape: self.shape.clone(),
            data,
        })
    }

    pub fn add(&self, other: &Tensor<N>) -> Result<Tensor<N>, TensorError> {
        self.zip_map(other, |a, b| a + b)
    }

    fn trailing_axis_len(&self) -> Result<usize, TensorError> {
        let classes = self.shape.last().copied().unwrap_or(0);
        if classes == 0 {
            return Err(TensorError::Parameter(
                "operation requires a non-empty trailing axis".to_string(),
            ));
        }
        Ok(classes)
    }

    /// Softmax over the trailing axis, max-subtracted for stability.
    pub fn softmax_last_axis(&self) -> Result<Tensor<N>, TensorError> {
        let classes = self.trailing_axis_len()?;
        let mut out = vec![N::ZERO; self.data.len()];
        out.par_chunks_mut(classes)
            .zip(self.data.par_chunks(classes))
            .for_each(|(dst, row)| {
                let max = row
                    .iter()
                    .map(|v| v.to_f64())
                    .fold(f64::NEG_INFINITY, f64::max);
                let mut total = 0.0f64;
                let exps = row
                    .iter()
                    .map(|v| {
                        let e = (v.to_f64() - max).exp();
                        total += e;
                        e
                    })
                    .collect::<Vec<f64>>();
                for (slot, e) in dst.iter_mut().zip(exps) {
                    *slot = N::from_f64(e / total);
                }
            });
        Tensor::new(&self.shape, out)
    }

    /// Log-softmax over the trailing axis.
    pub fn log_softmax_last_axis(&self) -> Result<Tensor<N>, TensorError> {
        let classes = self.trailing_axis_len()?;
        let mut out = vec![N::ZERO; self.data.len()];
        out.par_chunks_mut(classes)
            .zip(self.data.par_chunks(classes))
            .for_each(|(dst, row)| {
                let max = row
                    .iter()
                    .map(|v| v.to_f64())
                    .fold(f64::NEG_INFINITY, f64::max);
                let log_total = row
                    .iter()
                    .map(|v| (v.to_f64() - max).exp())
                    .sum::<f64>()
                    .ln()
                    + max;
                for (slot, value) in dst.iter_mut().zip(row) {
                    *slot = N::from_f64(value.to_f64() - log_total);
                }
            });
        Tensor::new(&self.shape, out)
    }

    /// One-hot of the trailing-axis argmax; ties resolve to the first maximum.
    pub fn one_hot_argmax_last_axis(&self) -> Result<Tensor<N>, TensorError> {
        let classes = self.trailing_axis_len()?;
        let mut out = vec![N::ZERO; self.data.len()];
        out.chunks_mut(classes)
            .zip(self.data.chunks(classes))
            .for_each(|(dst, row)| {
                let mut best = 0usize;
                for (i, value) in row.iter().enumerate() {
                    if value.to_f64() > row[best].to_f64() {
                        best = i;
                    }
                }
                dst[best] = N::ONE;
            });
        Tensor::new(&self.shape, out)
    }

    pub fn sum(&self) -> f64 {
        self.data.iter().map(|v| v.to_f64()).sum()
    }

    pub fn mean(&self) -> f64 {
        if self.data.is_empty() {
            return f64::NAN;
        }
        self.sum() / self.data.len() as f64
    }

    /// Sums away every axis after the first `keep`, returning the kept shape
    /// and one `f64` total per kept position.
    pub fn reduce_sum_trailing(&self, keep: usize) -> Result<(Shape, Vec<f64>), TensorError> {
        if keep > self.rank() {
            return Err(TensorError::Parameter(format!(
                "cannot keep {} leading axes of a rank-{} tensor",
                keep,
                self.rank()
            )));
        }
        let kept = self.shape[..keep].to_vec();
        let rows = kept.iter().product::<usize>();
        let chunk = self.shape[keep..].iter().product::<usize>();
        if chunk == 0 {
            return Ok((kept, vec![0.0; rows]));
        }
        let sums = self
            .data
            .chunks(chunk)
            .map(|c| c.iter().map(|v| v.to_f64()).sum())
            .collect::<Vec<f64>>();
        Ok((kept, sums))
    }

    fn axis_split(&self, axis: usize) -> Result<(usize, usize, usize), TensorError> {
        if axis >= self.rank() {
            return Err(TensorError::AxisOutOfRange {
                axis,
                rank: self.rank(),
            });
        }
        let outer = self.shape[..axis].iter().product();
        let len = self.shape[axis];
        let inner = self.shape[axis + 1..].iter().product();
        Ok((outer, len, inner))
    }

    /// Mean along one axis, dropping it from the shape.
    pub fn mean_axis(&self, axis: usize) -> Result<Tensor<N>, TensorError> {
        let (outer, len, inner) = self.axis_split(axis)?;
        if len == 0 {
            return Err(TensorError::Parameter(
                "cannot reduce an empty axis".to_string(),
            ));
        }
        let mut out = vec![0.0f64; outer * inner];
        for o in 0..outer {
            for j in 0..len {
                let base = (o * len + j) * inner;
                for i in 0..inner {
                    out[o * inner + i] += self.data[base + i].to_f64();
                }
            }
        }
        let mut shape = self.shape.clone();
        shape.remove(axis);
        let data = out
            .into_iter()
            .map(|v| N::from_f64(v / len as f64))
            .collect();
        Tensor::new(&shape, data)
    }

    /// Unbiased standard deviation along one axis, dropping it from the shape.
    /// The axis must hold at least two entries.
    pub fn std_axis(&self, axis: usize) -> Result<Tensor<N>, TensorError> {
        let (outer, len, inner) = self.axis_split(axis)?;
        if len < 2 {
            return Err(TensorError::Parameter(format!(
                "standard deviation needs at least two entries along axis {}, it has {}",
                axis, len
            )));
        }
        let mean = self.mean_axis(axis)?;
        let mut out = vec![0.0f64; outer * inner];
        for o in 0..outer {
            for j in 0..len {
                let base = (o * len + j) * inner;
                for i in 0..inner {
                    let d = self.data[base + i].to_f64() - mean.data[o * inner + i].to_f64();
                    out[o * inner + i] += d * d;
                }
            }
        }
        let mut shape = self.shape.clone();
        shape.remove(axis);
        let data = out
            .into_iter()
            .map(|v| N::from_f64((v / (len - 1) as f64).sqrt()))
            .collect();
        Tensor::new(&shape, data)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn t(shape: &[usize], data: Vec<f32>) -> Tensor<f32> {
        Tensor::new(shape, data).unwrap()
    }

    #[test]
    fn construction_rejects_wrong_data_length() {
        let err = Tensor::new(&[2, 3], vec![1.0f32; 5]).unwrap_err();
        assert!(matches!(err, TensorError::DataLength { expected: 6, got: 5, .. }));
    }

    #[test]
    fn coordinates_enumerate_row_major() {
        let shape = [2, 4, 3];
        let size = shape.iter().product::<usize>();
        let tensor = t(&shape, vec![0.0; size]);
        let mut flat = 0usize;
        for a in 0..2 {
            for b in 0..4 {
                for c in 0..3 {
                    assert_eq!(tensor.get_index(&[a, b, c]).unwrap(), flat);
                    flat += 1;
                }
            }
        }
    }

    #[test]
    fn broadcast_leading_replicates_whole_tensor() {
        let x = t(&[2], vec![1.0, 2.0]);
        let y = x.broadcast_leading(3);
        assert_eq!(y.shape(), &[3, 2]);
        assert_eq!(y.data(), &[1.0, 2.0, 1.0, 2.0, 1.0, 2.0]);
    }

    #[test]
    fn stack_and_index_leading_agree() {
        let a = t(&[2], vec![1.0, 2.0]);
        let b = t(&[2], vec![3.0, 4.0]);
        let s = Tensor::stack(&[a.clone(), b.clone()]).unwrap();
        assert_eq!(s.shape(), &[2, 2]);
        assert_eq!(s.index_leading(0).unwrap(), a);
        assert_eq!(s.index_leading(1).unwrap(), b);
        assert!(s.index_leading(2).is_err());
    }

    #[test]
    fn stack_rejects_mixed_shapes() {
        let a = t(&[2], vec![1.0, 2.0]);
        let b = t(&[3], vec![3.0, 4.0, 5.0]);
        assert!(Tensor::stack(&[a, b]).is_err());
    }

    #[test]
    fn concat_last_interleaves_rows() {
        let a = t(&[2, 1], vec![1.0, 3.0]);
        let b = t(&[2, 2], vec![10.0, 11.0, 30.0, 31.0]);
        let c = Tensor::concat_last(&[&a, &b]).unwrap();
        assert_eq!(c.shape(), &[2, 3]);
        assert_eq!(c.data(), &[1.0, 10.0, 11.0, 3.0, 30.0, 31.0]);
    }

    #[test]
    fn matmul_last_matches_hand_computation() {
        let x = t(&[2, 2], vec![1.0, 2.0, 3.0, 4.0]);
        let w = t(&[2, 2], vec![1.0, 0.0, 0.0, 2.0]);
        let y = x.matmul_last(&w).unwrap();
        assert_eq!(y.data(), &[1.0, 4.0, 3.0, 8.0]);
    }

    #[test]
    fn add_bias_applies_per_row() {
        let x = t(&[2, 2], vec![0.0, 0.0, 1.0, 1.0]);
        let bias = t(&[2], vec![0.5, -0.5]);
        let y = x.add_bias(&bias).unwrap();
        assert_eq!(y.data(), &[0.5, -0.5, 1.5, 0.5]);
    }

    #[test]
    fn softmax_rows_are_distributions() {
        let x = t(&[2, 3], vec![1.0, 2.0, 3.0, -1.0, 0.0, 1.0]);
        let p = x.softmax_last_axis().unwrap();
        for row in p.data().chunks(3) {
            let total: f32 = row.iter().sum();
            assert!((total - 1.0).abs() < 1e-6);
            assert!(row.iter().all(|&v| v > 0.0));
        }
    }

    #[test]
    fn log_softmax_is_log_of_softmax() {
        let x = t(&[1, 4], vec![0.3, -2.0, 1.7, 0.0]);
        let p = x.softmax_last_axis().unwrap();
        let lp = x.log_softmax_last_axis().unwrap();
        for (a, b) in p.data().iter().zip(lp.data()) {
            assert!((a.ln() - b).abs() < 1e-5);
        }
    }

    #[test]
    fn one_hot_argmax_takes_first_maximum() {
        let x = t(&[2, 3], vec![0.1, 0.9, 0.9, 5.0, 1.0, 2.0]);
        let y = x.one_hot_argmax_last_axis().unwrap();
        assert_eq!(y.data(), &[0.0, 1.0, 0.0, 1.0, 0.0, 0.0]);
    }

    #[test]
    fn reduce_sum_trailing_keeps_leading_axes() {
        let x = t(&[2, 2, 2], (1..=8).map(|v| v as f32).collect());
        let (shape, sums) = x.reduce_sum_trailing(1).unwrap();
        assert_eq!(shape, vec![2]);
        assert_eq!(sums, vec![10.0, 26.0]);
        let (shape2, sums2) = x.reduce_sum_trailing(2).unwrap();
        assert_eq!(shape2, vec![2, 2]);
        assert_eq!(sums2, vec![3.0, 7.0, 11.0, 15.0]);
    }

    #[test]
    fn axis_reductions_drop_the_axis() {
        let x = t(&[2, 2], vec![1.0, 2.0, 3.0, 4.0]);
        let mean = x.mean_axis(0).unwrap();
        assert_eq!(mean.shape(), &[2]);
        assert_eq!(mean.data(), &[2.0, 3.0]);
        let std = x.std_axis(0).unwrap();
        // Unbiased: sqrt(((1-2)^2 + (3-2)^2) / 1) = sqrt(2)
        assert!((std.data()[0] - 2.0f32.sqrt()).abs() < 1e-6);
    }

    #[test]
    fn std_axis_needs_two_entries() {
        let x = t(&[1, 2], vec![1.0, 2.0]);
        assert!(x.std_axis(0).is_err());
    }
}
