use crate::pfn::PFN;

/// Flags a caller can ask an allocator to apply while servicing a request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocFlags {
    pub zero: bool,
    /// Restrict the allocation to the low zone (addressable by 16-bit DMA,
    /// < 16MiB), as `PMM_FLAG_ZONE_LOW` does in the reference allocator.
    pub low: bool,
}

/// The contract a physical page allocator (the PMM) exposes to its clients
/// (the slab allocator, the VM layer). Kept separate from any concrete
/// buddy-allocator implementation so tests can substitute a fake.
pub trait FrameAlloc {
    /// Allocate `2^order` contiguous pages, or `None` if no block of that
    /// order is available.
    fn alloc_order(&self, order: u8, flags: AllocFlags) -> Option<PFN>;

    /// Free a block previously returned by `alloc_order` with the same
    /// `order`.
    ///
    /// # Safety
    /// `pfn` must be a block this allocator actually handed out at `order`,
    /// not yet freed.
    unsafe fn dealloc(&self, pfn: PFN, order: u8);
}
