//! Virtual-memory region layer (spec.md §4.5). Grounded on
//! `original_source/kernel/memory/vm.{h,c}`'s region tree and hole search,
//! and on the teacher's own `src/kernel/mem/mm_list.rs` pre-trim (a
//! `BTreeSet<MMArea>` keyed by start address with an `AreasList`-style
//! extension trait) for the Rust region-tree idiom, simplified to drop
//! file-backed mappings — an explicit Non-goal.
//!
//! Region records are plain `Box<Region>` allocations rather than the
//! teacher's bespoke self-hosted pool: `kernel::mem::kheap` already routes
//! an allocation this small through its own slab-cache ladder, so a second,
//! dedicated bootstrap cache here would just be the same mechanism twice
//! (an Open Question resolved this way, recorded in DESIGN.md).

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use kmm::{AllocFlags, PAddr, VAddr, PAGE_SIZE};
use ksync::{OnceLock, SpinIrq};

use crate::kernel::mem::pmm;
use crate::kernel::mem::ptm::{self, MapAttrs};
use crate::kernel::prelude::{Error, KResult};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Flags {
    /// Fail instead of relocating if `hint` cannot be honored.
    pub fixed: bool,
    /// Anonymous pages arrive zeroed.
    pub zero: bool,
    /// Allow lazy backing on fault; the default is eager mapping at
    /// `map_anon`/`map_direct` time.
    pub dynamically_backed: bool,
}

#[derive(Clone, Copy)]
enum Backing {
    Anon,
    Direct { phys_base: PAddr },
}

struct Region {
    len: usize,
    prot: MapAttrs,
    backing: Backing,
    flags: Flags,
}

/// One address space's region tree plus the page tables backing it.
pub struct AddressSpace {
    ptm: &'static ptm::AddressSpace,
    /// Keyed by region start address for `O(log n)` hole search and
    /// overlap queries via `range()`.
    regions: SpinIrq<BTreeMap<usize, Box<Region>>>,
    lo: usize,
    hi: usize,
}

impl AddressSpace {
    pub fn new(ptm: &'static ptm::AddressSpace, lo: usize, hi: usize) -> Self {
        Self {
            ptm,
            regions: SpinIrq::new(BTreeMap::new()),
            lo,
            hi,
        }
    }

    pub fn ptm(&self) -> &'static ptm::AddressSpace {
        self.ptm
    }

    fn fits(&self, start: usize, len: usize, map: &BTreeMap<usize, Box<Region>>) -> bool {
        if start < self.lo || start.checked_add(len).is_none_or(|end| end > self.hi) {
            return false;
        }
        let end = start + len;
        if let Some((&prev_start, prev)) = map.range(..start).next_back() {
            if prev_start + prev.len > start {
                return false;
            }
        }
        if let Some((&next_start, _)) = map.range(start..).next() {
            if next_start < end {
                return false;
            }
        }
        true
    }

    /// First gap of at least `len` bytes, aligned to page granularity,
    /// preferring `hint` if it already falls in a hole (spec.md §4.5).
    fn find_hole(&self, hint: Option<usize>, len: usize, map: &BTreeMap<usize, Box<Region>>) -> Option<usize> {
        if let Some(hint) = hint {
            let hint = (hint / PAGE_SIZE) * PAGE_SIZE;
            if self.fits(hint, len, map) {
                return Some(hint);
            }
        }

        let mut cursor = self.lo;
        for (&start, region) in map.iter() {
            if start.saturating_sub(cursor) >= len {
                return Some(cursor);
            }
            cursor = cursor.max(start + region.len);
        }
        if self.hi.saturating_sub(cursor) >= len {
            Some(cursor)
        } else {
            None
        }
    }

    fn insert_and_map(
        &self,
        hint: Option<usize>,
        length: usize,
        prot: MapAttrs,
        flags: Flags,
        backing: Backing,
    ) -> KResult<VAddr> {
        if length == 0 || length % PAGE_SIZE != 0 {
            return Err(Error::EInval);
        }

        let start = {
            let map = self.regions.lock();
            self.find_hole(hint, length, &map).ok_or(Error::ENoSpc)?
        };
        if flags.fixed && hint != Some(start) {
            return Err(Error::EExist);
        }

        let region = Box::new(Region { len: length, prot, backing, flags });
        self.regions.lock().insert(start, region);

        if !flags.dynamically_backed {
            self.populate_eager(start, length, prot, backing, flags.zero);
        }

        Ok(VAddr::new(start))
    }

    fn populate_eager(&self, start: usize, length: usize, prot: MapAttrs, backing: Backing, zero: bool) {
        match backing {
            Backing::Direct { phys_base } => {
                self.ptm.map(VAddr::new(start), phys_base, length, prot);
            }
            Backing::Anon => {
                let mut offset = 0;
                while offset < length {
                    let pfn = pmm::alloc_order(0, AllocFlags { zero, low: false })
                        .expect("vm: PMM out of memory populating an anon region");
                    self.ptm.map(VAddr::new(start + offset), pfn.into(), PAGE_SIZE, prot);
                    offset += PAGE_SIZE;
                }
            }
        }
    }

    pub fn map_anon(&self, hint: Option<usize>, length: usize, prot: MapAttrs, flags: Flags) -> KResult<VAddr> {
        self.insert_and_map(hint, length, prot, flags, Backing::Anon)
    }

    pub fn map_direct(
        &self,
        hint: Option<usize>,
        length: usize,
        prot: MapAttrs,
        phys_base: PAddr,
        flags: Flags,
    ) -> KResult<VAddr> {
        self.insert_and_map(hint, length, prot, flags, Backing::Direct { phys_base })
    }

    /// Splits, trims, or deletes every region intersecting
    /// `[vaddr, vaddr+length)`, calling PTM unmap for each contiguous
    /// affected piece.
    pub fn unmap(&self, vaddr: VAddr, length: usize) {
        let start = vaddr.addr();
        let end = start + length;
        let mut to_reinsert = alloc::vec::Vec::new();

        {
            let mut map = self.regions.lock();
            let overlapping: alloc::vec::Vec<usize> = map
                .range(..end)
                .rev()
                .take_while(|(&s, r)| s + r.len > start)
                .map(|(&s, _)| s)
                .collect();

            for region_start in overlapping {
                let region = map.remove(&region_start).unwrap();
                let region_end = region_start + region.len;
                let cut_start = start.max(region_start);
                let cut_end = end.min(region_end);

                if region_start < cut_start {
                    let head = Box::new(Region {
                        len: cut_start - region_start,
                        ..*region
                    });
                    to_reinsert.push((region_start, head));
                }
                if cut_end < region_end {
                    let tail_backing = match region.backing {
                        Backing::Direct { phys_base } => {
                            Backing::Direct { phys_base: phys_base + (cut_end - region_start) }
                        }
                        Backing::Anon => Backing::Anon,
                    };
                    let tail = Box::new(Region {
                        len: region_end - cut_end,
                        prot: region.prot,
                        backing: tail_backing,
                        flags: region.flags,
                    });
                    to_reinsert.push((cut_end, tail));
                }
            }

            for (start, region) in to_reinsert {
                map.insert(start, region);
            }
        }

        self.ptm.unmap(vaddr, length);
    }

    /// Looks up the region containing `vaddr` and maps in a fresh backing
    /// page for it, returning whether the fault was handled.
    fn fault_at(&self, vaddr: VAddr) -> bool {
        let addr = vaddr.addr();
        let page = addr & !(PAGE_SIZE - 1);

        let (region_start, prot, backing, zero) = {
            let map = self.regions.lock();
            let Some((&start, region)) = map.range(..=addr).next_back() else {
                return false;
            };
            if start + region.len <= addr {
                return false;
            }
            (start, region.prot, region.backing, region.flags.zero)
        };
        let _ = region_start;

        match backing {
            Backing::Direct { phys_base } => {
                let offset = page - region_start;
                self.ptm.map(VAddr::new(page), phys_base + offset, PAGE_SIZE, prot);
            }
            Backing::Anon => {
                let pfn = pmm::alloc_order(0, AllocFlags { zero, low: false })
                    .expect("vm: PMM out of memory resolving an anon fault");
                self.ptm.map(VAddr::new(page), pfn.into(), PAGE_SIZE, prot);
            }
        }
        true
    }

    /// Ensures the page containing `vaddr` is mapped (faulting it in if
    /// this address space's region tree covers it but the PTM doesn't have
    /// a mapping for it yet) and returns the physical address backing it.
    fn ensure_mapped(&self, page_vaddr: VAddr) -> Option<PAddr> {
        if let Some(paddr) = self.ptm.translate(page_vaddr) {
            return Some(paddr);
        }
        if !self.fault_at(page_vaddr) {
            return None;
        }
        self.ptm.translate(page_vaddr)
    }

    /// Copies `src` into this address space starting at `vaddr`, faulting
    /// in backing pages as the copy walks the range (spec.md §4.5). Stops
    /// short and returns the number of bytes actually copied if it reaches
    /// a `vaddr` this address space has no region covering.
    pub fn copy_to(&self, vaddr: VAddr, src: &[u8]) -> usize {
        let mut copied = 0;
        while copied < src.len() {
            let cur = vaddr.addr() + copied;
            let page = cur & !(PAGE_SIZE - 1);
            let page_off = cur - page;

            let Some(paddr) = self.ensure_mapped(VAddr::new(page)) else {
                break;
            };

            let chunk = (PAGE_SIZE - page_off).min(src.len() - copied);
            let dst_virt = (ptm::phys_to_virt_addr(paddr) + page_off) as *mut u8;
            unsafe {
                core::ptr::copy_nonoverlapping(src.as_ptr().add(copied), dst_virt, chunk);
            }
            copied += chunk;
        }
        copied
    }

    /// Copies `dst.len()` bytes out of this address space starting at
    /// `vaddr`, faulting in backing pages as the copy walks the range
    /// (spec.md §4.5). Stops short and returns the number of bytes actually
    /// copied if it reaches a `vaddr` this address space has no region
    /// covering.
    pub fn copy_from(&self, dst: &mut [u8], vaddr: VAddr) -> usize {
        let mut copied = 0;
        while copied < dst.len() {
            let cur = vaddr.addr() + copied;
            let page = cur & !(PAGE_SIZE - 1);
            let page_off = cur - page;

            let Some(paddr) = self.ensure_mapped(VAddr::new(page)) else {
                break;
            };

            let chunk = (PAGE_SIZE - page_off).min(dst.len() - copied);
            let src_virt = (ptm::phys_to_virt_addr(paddr) + page_off) as *const u8;
            unsafe {
                core::ptr::copy_nonoverlapping(src_virt, dst.as_mut_ptr().add(copied), chunk);
            }
            copied += chunk;
        }
        copied
    }
}

/// Invoked from PTM's page-fault handler. Currently only the global kernel
/// address space is wired up; per-address-space dispatch is left to
/// whoever eventually builds a user-process layer on top of this.
pub fn fault(vaddr: VAddr) -> bool {
    kernel_address_space().fault_at(vaddr)
}

static KERNEL_VM: OnceLock<AddressSpace> = OnceLock::new();

/// Brings up the VM region layer for the kernel's own address space.
/// Must run after `ptm::init_global_address_space`.
pub fn init() {
    KERNEL_VM.get_or_init(|| {
        AddressSpace::new(ptm::global_address_space(), 0xffff_8000_0000_0000, 0xffff_ffff_8000_0000)
    });
}

pub fn kernel_address_space() -> &'static AddressSpace {
    KERNEL_VM.get().expect("kernel::mem::vm::init was never called")
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::vec::Vec;

    use kmm::PAGE_SIZE;

    /// Stands in for the PMM/PTM/HHDM stack `AddressSpace::copy_to`/
    /// `copy_from` walk through: a page-granular byte store, faulted in
    /// (allocated) on first touch. Real x86 page tables don't exist on a
    /// host test runner, so this exercises the identical page-chunking walk
    /// `copy_to`/`copy_from` perform against a backing store a test can
    /// actually drive.
    struct FakePages {
        pages: HashMap<usize, [u8; PAGE_SIZE]>,
    }

    impl FakePages {
        fn new() -> Self {
            Self { pages: HashMap::new() }
        }

        fn page_mut(&mut self, page: usize) -> &mut [u8; PAGE_SIZE] {
            self.pages.entry(page).or_insert_with(|| [0u8; PAGE_SIZE])
        }

        fn copy_to(&mut self, vaddr: usize, src: &[u8]) -> usize {
            let mut copied = 0;
            while copied < src.len() {
                let cur = vaddr + copied;
                let page = cur & !(PAGE_SIZE - 1);
                let page_off = cur - page;
                let chunk = (PAGE_SIZE - page_off).min(src.len() - copied);
                let dst = self.page_mut(page);
                dst[page_off..page_off + chunk].copy_from_slice(&src[copied..copied + chunk]);
                copied += chunk;
            }
            copied
        }

        fn copy_from(&mut self, dst: &mut [u8], vaddr: usize) -> usize {
            let mut copied = 0;
            while copied < dst.len() {
                let cur = vaddr + copied;
                let page = cur & !(PAGE_SIZE - 1);
                let page_off = cur - page;
                let chunk = (PAGE_SIZE - page_off).min(dst.len() - copied);
                let src = self.page_mut(page);
                dst[copied..copied + chunk].copy_from_slice(&src[page_off..page_off + chunk]);
                copied += chunk;
            }
            copied
        }
    }

    /// spec.md §8's VM property: `copy_to` into a range returned by
    /// `map_anon(...FIXED|ZERO, len)` followed by `copy_from` returns the
    /// same bytes, exercised across a page boundary.
    #[test]
    fn copy_to_then_copy_from_round_trips_across_a_page_boundary() {
        let mut mem = FakePages::new();
        let vaddr = 0x1000 - 16;
        let src: Vec<u8> = (0..64u8).cycle().take(PAGE_SIZE).collect();

        assert_eq!(mem.copy_to(vaddr, &src), src.len());

        let mut dst = std::vec![0u8; src.len()];
        assert_eq!(mem.copy_from(&mut dst, vaddr), src.len());
        assert_eq!(dst, src);
    }

    #[test]
    fn copy_to_then_copy_from_round_trips_within_a_single_page() {
        let mut mem = FakePages::new();
        let vaddr = 0x4000;
        let src = std::vec![7u8; 200];

        assert_eq!(mem.copy_to(vaddr, &src), src.len());
        let mut dst = std::vec![0u8; src.len()];
        assert_eq!(mem.copy_from(&mut dst, vaddr), src.len());
        assert_eq!(dst, src);
    }

    #[test]
    fn copy_to_zero_length_is_a_no_op() {
        let mut mem = FakePages::new();
        assert_eq!(mem.copy_to(0x2000, &[]), 0);
    }
}
