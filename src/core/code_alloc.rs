//! Output buffer allocation.
//!
//! Before the emission pass writes any byte it asks a [`CodeAllocator`] for
//! the hot code, cold code and read-only data buffers, sized exactly to what
//! relaxation computed. Buffers are fixed-size and never grow.

use super::error::{EmitError, EmitResult};

/// Buffer sizes requested by the emission pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeRequest {
    pub hot_size: u32,
    pub cold_size: u32,
    pub data_size: u32,
    /// The data section holds 8-byte aligned constants.
    pub data_align8: bool,
}

/// Buffers handed back by the allocator, with their load addresses.
#[derive(Debug)]
pub struct CodeBlocks {
    pub hot: Box<[u8]>,
    pub cold: Box<[u8]>,
    pub data: Box<[u8]>,
    pub hot_addr: u64,
    pub cold_addr: u64,
    pub data_addr: u64,
}

/// Supplier of output buffers.
pub trait CodeAllocator {
    fn allocate(&mut self, request: &CodeRequest) -> EmitResult<CodeBlocks>;
}

/// Allocates zeroed heap buffers and hands out synthetic, distinct load
/// addresses for each region.
#[derive(Debug, Clone)]
pub struct HeapCodeAllocator {
    next_addr: u64,
    /// Refuse requests whose total exceeds this many bytes.
    pub max_total: Option<usize>,
}

impl HeapCodeAllocator {
    pub fn new() -> Self {
        Self {
            next_addr: 0x1000_0000,
            max_total: None,
        }
    }

    fn take_addr(&mut self, size: u32, align: u64) -> u64 {
        let addr = self.next_addr.next_multiple_of(align);
        // Keep regions a page apart so hot and cold never touch.
        self.next_addr = (addr + size as u64 + 0x1000).next_multiple_of(0x1000);
        addr
    }
}

impl Default for HeapCodeAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl CodeAllocator for HeapCodeAllocator {
    fn allocate(&mut self, request: &CodeRequest) -> EmitResult<CodeBlocks> {
        let total = request.hot_size as usize + request.cold_size as usize + request.data_size as usize;
        if self.max_total.is_some_and(|max| total > max) {
            return Err(EmitError::OutOfMemory { requested: total });
        }
        let data_align = if request.data_align8 { 8 } else { 4 };
        Ok(CodeBlocks {
            hot_addr: self.take_addr(request.hot_size, 16),
            cold_addr: self.take_addr(request.cold_size, 16),
            data_addr: self.take_addr(request.data_size, data_align),
            hot: vec![0; request.hot_size as usize].into_boxed_slice(),
            cold: vec![0; request.cold_size as usize].into_boxed_slice(),
            data: vec![0; request.data_size as usize].into_boxed_slice(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_sizes_and_distinct_addresses() {
        let mut alloc = HeapCodeAllocator::new();
        let blocks = alloc
            .allocate(&CodeRequest {
                hot_size: 100,
                cold_size: 20,
                data_size: 12,
                data_align8: true,
            })
            .unwrap();
        assert_eq!(blocks.hot.len(), 100);
        assert_eq!(blocks.cold.len(), 20);
        assert_eq!(blocks.data.len(), 12);
        assert_ne!(blocks.hot_addr, blocks.cold_addr);
        assert_eq!(blocks.data_addr % 8, 0);
    }

    #[test]
    fn test_allocation_cap() {
        let mut alloc = HeapCodeAllocator {
            max_total: Some(64),
            ..HeapCodeAllocator::new()
        };
        let request = CodeRequest {
            hot_size: 100,
            cold_size: 0,
            data_size: 0,
            data_align8: false,
        };
        assert!(matches!(
            alloc.allocate(&request),
            Err(EmitError::OutOfMemory { requested: 100 })
        ));
    }
}
