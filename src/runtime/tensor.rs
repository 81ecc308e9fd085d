//! Host tensors passed to and from the executor.

use snipjit_lir::Precision;

use crate::error::RuntimeError;
use crate::subgraph::Layout;

/// A dense host tensor. `shape` is the logical shape; `data` is stored in
/// the tensor's layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tensor {
    shape: Vec<usize>,
    precision: Precision,
    layout: Layout,
    data: Vec<u8>,
}

impl Tensor {
    pub fn zeros(shape: &[usize], precision: Precision) -> Self {
        let len: usize = shape.iter().product();
        Self {
            shape: shape.to_vec(),
            precision,
            layout: Layout::Planar,
            data: vec![0; len * precision.size_bytes()],
        }
    }

    pub fn from_bytes(shape: &[usize], precision: Precision, layout: Layout, data: Vec<u8>) -> Result<Self, RuntimeError> {
        let expected = shape.iter().product::<usize>() * precision.size_bytes();
        if data.len() != expected {
            return Err(RuntimeError::DataSize {
                expected,
                found: data.len(),
            });
        }
        Ok(Self {
            shape: shape.to_vec(),
            precision,
            layout,
            data,
        })
    }

    pub fn from_f32(shape: &[usize], values: &[f32]) -> Result<Self, RuntimeError> {
        Self::from_f32_with_layout(shape, Layout::Planar, values)
    }

    /// `values` are given in storage order of `layout`.
    pub fn from_f32_with_layout(shape: &[usize], layout: Layout, values: &[f32]) -> Result<Self, RuntimeError> {
        let data = values.iter().flat_map(|v| v.to_ne_bytes()).collect();
        Self::from_bytes(shape, Precision::F32, layout, data)
    }

    pub fn from_i32(shape: &[usize], values: &[i32]) -> Result<Self, RuntimeError> {
        let data = values.iter().flat_map(|v| v.to_ne_bytes()).collect();
        Self::from_bytes(shape, Precision::I32, Layout::Planar, data)
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn precision(&self) -> Precision {
        self.precision
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    /// Element count.
    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.data.as_ptr()
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.data.as_mut_ptr()
    }

    /// Values in storage order.
    pub fn to_f32_vec(&self) -> Vec<f32> {
        self.data
            .chunks_exact(4)
            .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    pub fn to_i32_vec(&self) -> Vec<i32> {
        self.data
            .chunks_exact(4)
            .map(|c| i32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }
}
