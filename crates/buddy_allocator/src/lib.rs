#![cfg_attr(not(test), no_std)]

//! Two-zone binary buddy allocator over [`kmm::PageDb`].
//!
//! Grounded on the reference kernel's `kernel/memory/pmm.{c,h}`: two zones
//! (`LOW`, below 16MiB, for legacy DMA; `NORMAL`, everything else), a
//! `region_add` that walks a raw range picking the largest aligned order at
//! each step, and a classic split-on-alloc/merge-on-free buddy tree. `Zone`
//! itself (the per-zone lock and free-list array) lives in [`zone`]; this
//! module adds the two-zone split and the `FrameAlloc` trait impl.

mod free_area;
mod zone;

pub use zone::Zone;

use kmm::{AllocFlags, FrameAlloc, PageDb, PAddr, PFN, PAGE_SIZE};

/// One more than the highest buddy order a zone will track (orders
/// `0..=MAX_ORDER`), matching `PMM_MAX_ORDER` in the reference allocator:
/// a block of order 7 is 128 pages, 512KiB.
pub const MAX_ORDER: usize = 7;

/// Physical addresses below this boundary belong to the `LOW` zone (usable
/// by legacy 16-bit/24-bit DMA controllers); everything at or above it is
/// `NORMAL`.
pub const LOW_ZONE_LIMIT: usize = 16 * 1024 * 1024;

/// What happens when a request cannot be satisfied. Mirrors the caller
/// having to decide, per §4.1's failure policy, whether out-of-memory is
/// fatal to them or should be reported back as `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OomPolicy {
    Panic,
    ReturnNone,
}

/// Rounds a page count up to the order of the smallest power-of-two block
/// that contains it, the same `pagecount_to_order` trick as the reference
/// allocator (`clzll` on `pages - 1`), centralized here instead of sprinkled
/// at call sites.
pub fn pagecount_to_order(pages: usize) -> u8 {
    if pages <= 1 {
        return 0;
    }
    (usize::BITS - (pages - 1).leading_zeros()) as u8
}

pub struct BuddyAllocator {
    low: Zone,
    normal: Zone,
    page_db: &'static PageDb,
}

impl BuddyAllocator {
    pub const fn new(page_db: &'static PageDb) -> Self {
        Self {
            low: Zone::new("LOW", PFN::from_val(0), page_db),
            normal: Zone::new("NORMAL", PFN::from_val(0), page_db),
            page_db,
        }
    }

    fn zone_for(&self, paddr: PAddr) -> &Zone {
        if paddr.addr() < LOW_ZONE_LIMIT {
            &self.low
        } else {
            &self.normal
        }
    }

    /// Hand a raw `[base, base+len)` physical range to the allocator at
    /// boot, splitting it at the LOW/NORMAL boundary if it straddles one.
    /// `used_pages` pages at the very start of the whole range (not of each
    /// split half) are marked reserved rather than linked onto a free list,
    /// matching `pmm_region_add`'s `used` parameter (kernel image,
    /// early-boot bitmap, ...).
    ///
    /// # Safety
    /// See [`Zone::add_region`]; the same requirements apply to whichever
    /// sub-ranges this call splits `[base, base+len)` into.
    pub unsafe fn region_add(&mut self, base: PAddr, len: usize, used_pages: usize) {
        assert!(base.is_aligned(PAGE_SIZE) && len % PAGE_SIZE == 0);

        let mut remaining_used = used_pages;
        for (zone, zone_start, zone_end) in [
            (&mut self.low as *mut Zone, 0usize, LOW_ZONE_LIMIT),
            (&mut self.normal as *mut Zone, LOW_ZONE_LIMIT, usize::MAX),
        ] {
            let region_start = base.addr();
            let region_end = base.addr() + len;
            if region_end <= zone_start || region_start >= zone_end {
                continue;
            }
            let local_start = region_start.max(zone_start);
            let local_end = region_end.min(zone_end);
            let page_count = (local_end - local_start) / PAGE_SIZE;
            if page_count == 0 {
                continue;
            }

            let used_here = remaining_used.min(page_count);
            remaining_used -= used_here;

            unsafe {
                (*zone).add_region(PFN::from(PAddr::new(local_start)), page_count, used_here);
            }
        }
    }

    /// Allocate `2^order` contiguous pages from the requested zone.
    pub fn alloc_order(&self, order: u8, flags: AllocFlags, oom: OomPolicy) -> Option<PFN> {
        assert!(order as usize <= MAX_ORDER);
        let zone = if flags.low { &self.low } else { &self.normal };

        let pfn = match zone.alloc_order(order) {
            Some(pfn) => pfn,
            None => match oom {
                OomPolicy::Panic => panic!("PMM: out of memory (zone {}, order {order})", zone.name),
                OomPolicy::ReturnNone => return None,
            },
        };

        if flags.zero {
            let base: PAddr = pfn.into();
            let len = (1usize << order) * PAGE_SIZE;
            unsafe { self.zero_range(base, len) };
        }

        Some(pfn)
    }

    /// Round `n` up to the next power of two and allocate that many pages.
    pub fn alloc_pages(&self, n: usize, flags: AllocFlags, oom: OomPolicy) -> Option<PFN> {
        self.alloc_order(pagecount_to_order(n), flags, oom)
    }

    /// # Safety
    /// `base` must be zero-fillable: mapped through the HHDM (or otherwise
    /// addressable) for `len` bytes, and not concurrently accessed.
    unsafe fn zero_range(&self, base: PAddr, len: usize) {
        // The HHDM mapping that turns a physical address into a dereferenceable
        // pointer is a boot-time collaborator outside this crate; callers that
        // pass `AllocFlags { zero: true, .. }` are expected to be running with
        // that window already installed (true for every in-kernel caller).
        let ptr = kmm_hhdm::phys_to_virt(base).addr() as *mut u8;
        unsafe { core::ptr::write_bytes(ptr, 0, len) };
    }

    pub fn free_pages(&self) -> usize {
        self.low.free_pages() + self.normal.free_pages()
    }
}

impl FrameAlloc for BuddyAllocator {
    fn alloc_order(&self, order: u8, flags: AllocFlags) -> Option<PFN> {
        self.alloc_order(order, flags, OomPolicy::ReturnNone)
    }

    unsafe fn dealloc(&self, pfn: PFN, order: u8) {
        let paddr: PAddr = pfn.into();
        unsafe { self.zone_for(paddr).dealloc(pfn, order) };
    }
}

/// Trivial seam so this crate does not hard-depend on a concrete HHDM
/// offset: the kernel binds this to its real boot-time HHDM window.
/// Substituted by a test double in unit tests.
mod kmm_hhdm {
    use kmm::{PAddr, VAddr};
    use core::sync::atomic::{AtomicUsize, Ordering};

    static HHDM_OFFSET: AtomicUsize = AtomicUsize::new(0);

    pub fn set_offset(offset: usize) {
        HHDM_OFFSET.store(offset, Ordering::Release);
    }

    pub fn phys_to_virt(paddr: PAddr) -> VAddr {
        VAddr::new(paddr.addr() + HHDM_OFFSET.load(Ordering::Acquire))
    }
}

pub use kmm_hhdm::set_offset as set_hhdm_offset;

#[cfg(test)]
mod tests {
    use super::*;
    use kmm::{Frame, PageDb};
    use std::boxed::Box;

    fn make_db(pages: usize) -> (&'static PageDb, *mut Frame) {
        let mut frames: Box<[Frame]> = (0..pages).map(|_| Frame::new()).collect();
        let ptr = frames.as_mut_ptr();
        core::mem::forget(frames);
        let db: &'static PageDb =
            Box::leak(Box::new(unsafe { PageDb::new(PFN::from_val(0), ptr, pages) }));
        (db, ptr)
    }

    #[test]
    fn pagecount_rounds_to_next_pow2() {
        assert_eq!(pagecount_to_order(1), 0);
        assert_eq!(pagecount_to_order(2), 1);
        assert_eq!(pagecount_to_order(3), 2);
        assert_eq!(pagecount_to_order(16), 4);
        assert_eq!(pagecount_to_order(17), 5);
    }

    #[test]
    fn buddy_coalesce_scenario() {
        // Scenario 1 from spec.md §8: add a 16-page region, alloc order=0
        // sixteen times, free in reverse order; the zone must end up with
        // one order-4 block.
        let pages = 16 + LOW_ZONE_LIMIT / PAGE_SIZE;
        let (db, _ptr) = make_db(pages);
        let mut allocator = BuddyAllocator::new(db);
        unsafe {
            allocator.region_add(PAddr::new(LOW_ZONE_LIMIT), 16 * PAGE_SIZE, 0);
        }

        let mut blocks = std::vec::Vec::new();
        for _ in 0..16 {
            let pfn = allocator
                .alloc_order(0, AllocFlags::default(), OomPolicy::ReturnNone)
                .expect("block available");
            blocks.push(pfn);
        }
        assert_eq!(
            allocator
                .alloc_order(0, AllocFlags::default(), OomPolicy::ReturnNone),
            None,
            "zone should be fully allocated"
        );

        for pfn in blocks.into_iter().rev() {
            unsafe { FrameAlloc::dealloc(&allocator, pfn, 0) };
        }

        assert_eq!(allocator.normal.free_pages(), 16);
        let pfn16 = allocator
            .alloc_order(4, AllocFlags::default(), OomPolicy::ReturnNone)
            .expect("single order-4 block after full coalesce");
        unsafe { FrameAlloc::dealloc(&allocator, pfn16, 4) };
    }

    #[test]
    fn alloc_free_roundtrip_may_return_same_block() {
        let pages = 4 + LOW_ZONE_LIMIT / PAGE_SIZE;
        let (db, _ptr) = make_db(pages);
        let mut allocator = BuddyAllocator::new(db);
        unsafe {
            allocator.region_add(PAddr::new(LOW_ZONE_LIMIT), 4 * PAGE_SIZE, 0);
        }

        let first = allocator
            .alloc_order(1, AllocFlags::default(), OomPolicy::ReturnNone)
            .unwrap();
        unsafe { FrameAlloc::dealloc(&allocator, first, 1) };
        let second = allocator
            .alloc_order(1, AllocFlags::default(), OomPolicy::ReturnNone)
            .unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn region_straddling_low_boundary_splits_zones() {
        let pages = (LOW_ZONE_LIMIT / PAGE_SIZE) + 8;
        let (db, _ptr) = make_db(pages);
        let mut allocator = BuddyAllocator::new(db);
        unsafe {
            allocator.region_add(
                PAddr::new(LOW_ZONE_LIMIT - 4 * PAGE_SIZE),
                8 * PAGE_SIZE,
                0,
            );
        }
        assert_eq!(allocator.low.free_pages(), 4);
        assert_eq!(allocator.normal.free_pages(), 4);
    }
}
