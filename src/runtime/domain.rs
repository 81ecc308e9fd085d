//! Index-space helpers shared by the configurator and the executor.

use crate::subgraph::MAX_RANK;

/// Rank every shape is padded to before configuration.
pub const TENSOR_RANK: usize = MAX_RANK;

/// An N-d index space in row-major order where every dimension carries a
/// stride. Mapping a linear index to an offset is a pure function of the
/// (extent, stride) pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Strided {
    dims: Vec<(usize, i64)>,
}

impl Strided {
    /// Dimensions outermost first.
    pub fn new(dims: Vec<(usize, i64)>) -> Self {
        Self { dims }
    }

    pub fn from_parts(extents: &[usize], strides: &[i64]) -> Self {
        Self::new(extents.iter().copied().zip(strides.iter().copied()).collect())
    }

    pub fn dims(&self) -> &[(usize, i64)] {
        &self.dims
    }

    /// Number of points in the space.
    pub fn len(&self) -> usize {
        self.dims.iter().map(|(extent, _)| *extent).product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Offset of the point with row-major index `linear`.
    pub fn offset_of(&self, linear: usize) -> i64 {
        let mut rem = linear;
        let mut offset = 0i64;
        for &(extent, stride) in self.dims.iter().rev() {
            if extent == 0 {
                return 0;
            }
            offset += (rem % extent) as i64 * stride;
            rem /= extent;
        }
        offset
    }
}

/// Index tuple of row-major index `linear` in `extents`.
pub fn unravel(mut linear: usize, extents: &[usize], out: &mut [usize]) {
    for (slot, &extent) in out.iter_mut().zip(extents).rev() {
        let extent = extent.max(1);
        *slot = linear % extent;
        linear /= extent;
    }
}

/// Left-pad `shape` with ones up to `rank`.
pub fn pad_shape(shape: &[usize], rank: usize) -> Vec<usize> {
    let mut padded = vec![1; rank.saturating_sub(shape.len())];
    padded.extend_from_slice(shape);
    padded
}

/// Row-major element strides of a dense tensor.
pub fn dense_strides(shape: &[usize]) -> Vec<i64> {
    let mut strides = vec![0i64; shape.len()];
    let mut acc = 1i64;
    for (stride, &extent) in strides.iter_mut().zip(shape).rev() {
        *stride = acc;
        acc *= extent as i64;
    }
    strides
}

/// Zero the strides of extent-1 dimensions so they broadcast.
pub fn broadcast_strides(shape: &[usize], strides: &[i64]) -> Vec<i64> {
    shape
        .iter()
        .zip(strides)
        .map(|(&extent, &stride)| if extent == 1 { 0 } else { stride })
        .collect()
}
