//! Scratch memory for buffers, spill slots and repacked inputs.

use std::alloc::{self, Layout};
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::error::RuntimeError;

/// Alignment of every scratch allocation.
pub const SCRATCH_ALIGNMENT: usize = 64;

/// A zeroed, aligned heap region.
pub struct ScratchBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
}

// The buffer is plain memory; the executor partitions it between workers.
unsafe impl Send for ScratchBuffer {}
unsafe impl Sync for ScratchBuffer {}

impl ScratchBuffer {
    /// Allocate `size` zeroed bytes from the global allocator.
    pub fn zeroed(size: usize) -> Result<Self, RuntimeError> {
        let layout =
            Layout::from_size_align(size, SCRATCH_ALIGNMENT).map_err(|_| RuntimeError::Allocation { size })?;
        let ptr = if size == 0 {
            NonNull::<u8>::dangling()
        } else {
            NonNull::new(unsafe { alloc::alloc_zeroed(layout) }).ok_or(RuntimeError::Allocation { size })?
        };
        Ok(Self { ptr, layout })
    }

    pub fn len(&self) -> usize {
        self.layout.size()
    }

    pub fn is_empty(&self) -> bool {
        self.layout.size() == 0
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }
}

impl Drop for ScratchBuffer {
    fn drop(&mut self) {
        if self.layout.size() > 0 {
            unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
        }
    }
}

impl fmt::Debug for ScratchBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScratchBuffer").field("len", &self.len()).finish()
    }
}

pub trait ScratchAllocator: Send + Sync + fmt::Debug {
    fn allocate(&self, size: usize) -> Result<Arc<ScratchBuffer>, RuntimeError>;
}

/// Global-allocator backed scratch.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapAllocator;

impl ScratchAllocator for HeapAllocator {
    fn allocate(&self, size: usize) -> Result<Arc<ScratchBuffer>, RuntimeError> {
        ScratchBuffer::zeroed(size).map(Arc::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heap_allocation_is_aligned_and_zeroed() {
        let buffer = HeapAllocator.allocate(256).unwrap();
        assert_eq!(buffer.len(), 256);
        assert_eq!(buffer.as_mut_ptr() as usize % SCRATCH_ALIGNMENT, 0);
        let bytes = unsafe { std::slice::from_raw_parts(buffer.as_mut_ptr(), 256) };
        assert!(bytes.iter().all(|b| *b == 0));
    }

    #[test]
    fn test_empty_allocation() {
        let buffer = HeapAllocator.allocate(0).unwrap();
        assert!(buffer.is_empty());
    }
}
