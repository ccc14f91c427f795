//! Error type for [`Tensor`](super::Tensor) construction and shape manipulation.

use super::Shape;

#[derive(thiserror::Error, Debug, Clone)]
pub enum TensorError {
    /// Returned when the supplied data length does not match the product of the
    /// requested shape.
    #[error(
        "could not construct tensor, shape {shape:?} expects {expected} elements, data had length {got}"
    )]
    DataLength {
        shape: Shape,
        expected: usize,
        got: usize,
    },
    /// Returned when two operand shapes cannot be combined elementwise.
    #[error("shape mismatch between operands: {0:?} vs {1:?}")]
    ShapeMismatch(Shape, Shape),
    /// Returned when an axis argument is outside the tensor's rank.
    #[error("axis {axis} is outside valid range for tensor of rank {rank}")]
    AxisOutOfRange { axis: usize, rank: usize },
    /// Returned when parameters to a tensor method are otherwise incorrect.
    #[error("incorrect parameters to tensor method: {0}")]
    Parameter(String),
}
