//! Page-table manager (spec.md §4.3). Grounded on `arch::mm`'s raw PTE/table
//! shape (4-level x86_64 paging) for entry bits, and
//! `original_source/kernel/memory/vm.c`'s `region_map`/`region_unmap` page
//! walk for the large-page "try the biggest size that fits, break on partial
//! modification" policy.

use arch::mm::{PteFlags, RawPte, RawTable, PAGE_SIZE_1G, PAGE_SIZE_2M, PAGE_SIZE_4K};
use core::sync::atomic::{AtomicUsize, Ordering};
use kmm::{AllocFlags, PAddr, VAddr, PFN};
use ksync::SpinIrq;

use crate::kernel::mem::{pmm, tlb};

static HHDM_OFFSET: AtomicUsize = AtomicUsize::new(0);

pub fn set_hhdm_offset(offset: usize) {
    HHDM_OFFSET.store(offset, Ordering::Release);
}

fn phys_to_virt(paddr: PAddr) -> usize {
    paddr.addr() + HHDM_OFFSET.load(Ordering::Acquire)
}

/// The kernel's own HHDM-window view of `paddr`. Exposed for `kernel::mem::vm`'s
/// `copy_to`/`copy_from`: once a page in some address space is resolved to a
/// physical frame, the bytes there are reached the same way every other
/// kernel-side dereference of physical memory is (spec.md §4.5's "safe
/// cross-address-space copies").
pub fn phys_to_virt_addr(paddr: PAddr) -> usize {
    phys_to_virt(paddr)
}

fn table_at(pfn: PFN) -> &'static mut RawTable {
    let ptr = phys_to_virt(pfn.into()) as *mut RawTable;
    unsafe { &mut *ptr }
}

fn alloc_table() -> PFN {
    pmm::alloc_order(0, AllocFlags { zero: true, low: false })
        .expect("ptm: out of memory allocating a page table")
}

#[derive(Debug, Clone, Copy)]
pub struct MapAttrs {
    pub writable: bool,
    pub executable: bool,
    pub user: bool,
    pub global: bool,
    pub write_through: bool,
    pub cache_disable: bool,
}

impl MapAttrs {
    fn flags(&self) -> PteFlags {
        let mut flags = PteFlags::PRESENT;
        if self.writable {
            flags |= PteFlags::WRITE;
        }
        if !self.executable {
            flags |= PteFlags::NO_EXECUTE;
        }
        if self.user {
            flags |= PteFlags::USER;
        }
        if self.global {
            flags |= PteFlags::GLOBAL;
        }
        if self.write_through {
            flags |= PteFlags::WRITE_THROUGH;
        }
        if self.cache_disable {
            flags |= PteFlags::CACHE_DISABLE;
        }
        flags
    }
}

fn indices(vaddr: VAddr) -> [usize; 4] {
    let a = vaddr.addr();
    [
        (a >> 39) & 0x1ff, // PML4
        (a >> 30) & 0x1ff, // PDPT
        (a >> 21) & 0x1ff, // PD
        (a >> 12) & 0x1ff, // PT
    ]
}

/// One address space: a top-level (PML4) table and the lock guarding every
/// mutation of it or anything it points at.
pub struct AddressSpace {
    pml4: PFN,
    lock: SpinIrq<()>,
}

unsafe impl Send for AddressSpace {}
unsafe impl Sync for AddressSpace {}

impl AddressSpace {
    fn new(pml4: PFN) -> Self {
        Self {
            pml4,
            lock: SpinIrq::new(()),
        }
    }

    /// Creates a fresh address space and copies the kernel-half (upper 256)
    /// PML4 entries from `kernel_as`, so every address space shares the
    /// kernel's mappings without needing to propagate updates after the
    /// fact (spec.md §4.3's invariant).
    pub fn create(kernel_as: &AddressSpace) -> Self {
        let pml4 = alloc_table();
        let _guard = kernel_as.lock.lock();
        let kernel_table = table_at(kernel_as.pml4);
        let new_table = table_at(pml4);
        new_table.0[256..].copy_from_slice(&kernel_table.0[256..]);
        Self::new(pml4)
    }

    pub fn pml4_phys(&self) -> PAddr {
        self.pml4.into()
    }

    /// Installs this address space on the calling CPU.
    ///
    /// # Safety
    /// `self` must remain valid (not dropped) for as long as it stays
    /// loaded.
    pub unsafe fn load(&self) {
        unsafe { arch::mm::write_cr3(self.pml4_phys().addr() as u64) };
    }

    /// Returns a mutable pointer to the 4K leaf entry for `vaddr`,
    /// allocating any missing intermediate table. Used by callers that
    /// always want 4K granularity (anon-region fault resolution).
    fn leaf_pt_entry(&self, vaddr: VAddr) -> &'static mut RawPte {
        let [l4, l3, l2, l1] = indices(vaddr);
        let mut table = table_at(self.pml4);

        for idx in [l4, l3, l2] {
            let entry = &mut table.0[idx];
            if !entry.is_present() {
                let child = alloc_table();
                *entry = RawPte::new(
                    PAddr::from(child).addr() as u64,
                    PteFlags::PRESENT | PteFlags::WRITE | PteFlags::USER,
                );
            }
            assert!(!entry.is_huge(), "ptm: 4K walk hit an existing huge leaf, call rewrite/unmap first");
            table = table_at(PFN::from(PAddr::new(entry.phys_addr() as usize)));
        }

        &mut table.0[l1]
    }

    /// Chooses the largest page size that fits both the remaining alignment
    /// and the remaining length at `vaddr`, per spec.md §4.3 (1 GiB, then
    /// 2 MiB, then 4 KiB).
    fn best_page_size(vaddr: usize, paddr: usize, remaining: usize) -> usize {
        let aligned = |size: usize| vaddr % size == 0 && paddr % size == 0 && remaining >= size;
        if aligned(PAGE_SIZE_1G) {
            PAGE_SIZE_1G
        } else if aligned(PAGE_SIZE_2M) {
            PAGE_SIZE_2M
        } else {
            PAGE_SIZE_4K
        }
    }

    /// Writes one mapping of the chosen page size, creating intermediate
    /// tables as needed. `page_size` must be one returned by
    /// [`Self::best_page_size`].
    fn map_one(&self, vaddr: VAddr, paddr: PAddr, page_size: usize, attrs: MapAttrs) {
        let [l4, l3, l2, _] = indices(vaddr);
        let mut table = table_at(self.pml4);
        let mut flags = attrs.flags();

        let levels: &[usize] = match page_size {
            PAGE_SIZE_1G => &[l4],
            PAGE_SIZE_2M => &[l4, l3],
            _ => &[l4, l3, l2],
        };

        for &idx in levels {
            let entry = &mut table.0[idx];
            if !entry.is_present() {
                let child = alloc_table();
                *entry = RawPte::new(
                    PAddr::from(child).addr() as u64,
                    PteFlags::PRESENT | PteFlags::WRITE | PteFlags::USER,
                );
            }
            table = table_at(PFN::from(PAddr::new(entry.phys_addr() as usize)));
        }

        let leaf_idx = match page_size {
            PAGE_SIZE_1G => l3,
            PAGE_SIZE_2M => l2,
            _ => indices(vaddr)[3],
        };
        if page_size != PAGE_SIZE_4K {
            flags |= PteFlags::HUGE;
        }
        table.0[leaf_idx] = RawPte::new(paddr.addr() as u64, flags);
    }

    /// Installs `[vaddr, vaddr+length)` -> `[paddr, paddr+length)`, using
    /// the largest page size that fits at each step. Issues a TLB shootdown
    /// for the whole touched range after releasing the AS lock.
    pub fn map(&self, vaddr: VAddr, paddr: PAddr, length: usize, attrs: MapAttrs) {
        assert!(vaddr.is_aligned(PAGE_SIZE_4K) && paddr.is_aligned(PAGE_SIZE_4K));
        assert_eq!(length % PAGE_SIZE_4K, 0);

        {
            let _guard = self.lock.lock();
            let mut offset = 0;
            while offset < length {
                let page_size = Self::best_page_size(
                    vaddr.addr() + offset,
                    paddr.addr() + offset,
                    length - offset,
                );
                self.map_one(vaddr + offset, paddr + offset, page_size, attrs);
                offset += page_size;
            }
        }

        tlb::shootdown(vaddr.addr(), length);
    }

    /// If the leaf mapping `vaddr` falls under is larger than `affected_len`
    /// starting there, replaces it with a freshly populated next-level table
    /// covering the same range, so a later write only touches the affected
    /// sub-range. No-op if the existing leaf already matches or is smaller.
    fn break_if_needed(&self, vaddr: VAddr, affected_len: usize) {
        let [l4, l3, l2, _] = indices(vaddr);
        let mut table = table_at(self.pml4);

        let l4_entry = &table.0[l4];
        if !l4_entry.is_present() {
            return;
        }
        table = table_at(PFN::from(PAddr::new(l4_entry.phys_addr() as usize)));

        let l3_entry = table.0[l3];
        if !l3_entry.is_present() {
            return;
        }
        if l3_entry.is_huge() {
            if affected_len >= PAGE_SIZE_1G {
                return;
            }
            self.split_leaf(&mut table.0[l3], PAGE_SIZE_1G, PAGE_SIZE_2M);
        }

        let pd = table_at(PFN::from(PAddr::new(table.0[l3].phys_addr() as usize)));
        let l2_entry = pd.0[l2];
        if !l2_entry.is_present() {
            return;
        }
        if l2_entry.is_huge() && affected_len < PAGE_SIZE_2M {
            self.split_leaf(&mut pd.0[l2], PAGE_SIZE_2M, PAGE_SIZE_4K);
        }
    }

    /// Replaces a single huge leaf entry with a freshly allocated child
    /// table populated with `parent_size / child_size` entries describing
    /// the same mapping, then atomically repoints the parent at it.
    fn split_leaf(&self, entry: &mut RawPte, parent_size: usize, child_size: usize) {
        let base_phys = entry.phys_addr() as usize;
        let flags = entry.flags() & !PteFlags::HUGE;
        let child_huge = if child_size != PAGE_SIZE_4K { PteFlags::HUGE } else { PteFlags::empty() };

        let child_pfn = alloc_table();
        let child_table = table_at(child_pfn);
        let count = parent_size / child_size;
        for i in 0..count {
            child_table.0[i] = RawPte::new((base_phys + i * child_size) as u64, flags | child_huge);
        }

        *entry = RawPte::new(
            PAddr::from(child_pfn).addr() as u64,
            PteFlags::PRESENT | PteFlags::WRITE | (flags & PteFlags::USER),
        );
    }

    /// Changes attributes of existing mappings in `[vaddr, vaddr+length)`,
    /// breaking large pages that are only partially covered.
    pub fn rewrite(&self, vaddr: VAddr, length: usize, attrs: MapAttrs) {
        assert!(vaddr.is_aligned(PAGE_SIZE_4K));
        assert_eq!(length % PAGE_SIZE_4K, 0);

        {
            let _guard = self.lock.lock();
            let mut offset = 0;
            while offset < length {
                let here = vaddr + offset;
                self.break_if_needed(here, length - offset);
                let entry = self.leaf_pt_entry(here);
                if entry.is_present() {
                    let phys = entry.phys_addr();
                    *entry = RawPte::new(phys, attrs.flags());
                }
                offset += PAGE_SIZE_4K;
            }
        }

        tlb::shootdown(vaddr.addr(), length);
    }

    /// Clears mappings in `[vaddr, vaddr+length)`, breaking large pages
    /// that are only partially covered.
    pub fn unmap(&self, vaddr: VAddr, length: usize) {
        assert!(vaddr.is_aligned(PAGE_SIZE_4K));
        assert_eq!(length % PAGE_SIZE_4K, 0);

        {
            let _guard = self.lock.lock();
            let mut offset = 0;
            while offset < length {
                let here = vaddr + offset;
                self.break_if_needed(here, length - offset);
                let entry = self.leaf_pt_entry(here);
                entry.clear();
                offset += PAGE_SIZE_4K;
            }
        }

        tlb::shootdown(vaddr.addr(), length);
    }

    /// Walks without modifying. Returns `None` if any level along the way
    /// is not present.
    pub fn translate(&self, vaddr: VAddr) -> Option<PAddr> {
        let _guard = self.lock.lock();
        let [l4, l3, l2, l1] = indices(vaddr);
        let mut table = table_at(self.pml4);

        let l4_entry = table.0[l4];
        if !l4_entry.is_present() {
            return None;
        }
        table = table_at(PFN::from(PAddr::new(l4_entry.phys_addr() as usize)));

        let l3_entry = table.0[l3];
        if !l3_entry.is_present() {
            return None;
        }
        if l3_entry.is_huge() {
            let offset = vaddr.addr() & (PAGE_SIZE_1G - 1);
            return Some(PAddr::new(l3_entry.phys_addr() as usize + offset));
        }
        table = table_at(PFN::from(PAddr::new(l3_entry.phys_addr() as usize)));

        let l2_entry = table.0[l2];
        if !l2_entry.is_present() {
            return None;
        }
        if l2_entry.is_huge() {
            let offset = vaddr.addr() & (PAGE_SIZE_2M - 1);
            return Some(PAddr::new(l2_entry.phys_addr() as usize + offset));
        }
        table = table_at(PFN::from(PAddr::new(l2_entry.phys_addr() as usize)));

        let l1_entry = table.0[l1];
        if !l1_entry.is_present() {
            return None;
        }
        let offset = vaddr.addr() & (PAGE_SIZE_4K - 1);
        Some(PAddr::new(l1_entry.phys_addr() as usize + offset))
    }
}

/// The global kernel address space, shared (upper half) by every user
/// address space. Populated once during `kernel::init`'s memory stage.
static GLOBAL_AS: ksync::OnceLock<AddressSpace> = ksync::OnceLock::new();

/// Creates the global kernel address space from the currently loaded
/// `cr3` (the bootloader's page tables), so the kernel-half entries it
/// already set up become the shared upper half every later address space
/// copies. Every upper-half (index >= 256) PML4 slot that isn't already
/// present gets a freshly allocated, empty PDPT table right here, eagerly
/// (spec.md §4.3: "new kernel-half intermediate tables are created eagerly
/// at global-AS setup so no downstream AS needs a second cross-propagation
/// step") — a per-process `AddressSpace::create` only ever copies the 256
/// PML4 *entries*, never re-copies on a later kernel `map`, so any kernel
/// slot that could still transition from not-present to present after a
/// user address space has already been forked would never show up there.
/// Pre-populating every slot now means every later kernel-half mapping
/// lands inside an already-shared PDPT, visible through the same pointer
/// to every address space without a second propagation step.
/// Must run once, on the BSP, before any [`AddressSpace::create`].
pub fn init_global_address_space() {
    set_hhdm_offset(crate::kernel::boot::get().hhdm_offset);

    GLOBAL_AS.get_or_init(|| {
        let pml4 = PFN::from(PAddr::new(arch::mm::read_cr3() as usize));
        let table = table_at(pml4);
        for idx in 256..512 {
            let entry = &mut table.0[idx];
            if !entry.is_present() {
                let child = alloc_table();
                *entry = RawPte::new(
                    PAddr::from(child).addr() as u64,
                    PteFlags::PRESENT | PteFlags::WRITE,
                );
            }
        }
        AddressSpace::new(pml4)
    });
}

pub fn global_address_space() -> &'static AddressSpace {
    GLOBAL_AS.get().expect("ptm::init_global_address_space was never called")
}

/// A "page not present" fault, delegated to the VM layer by whoever
/// installed the fault handler.
pub fn handle_page_fault(vaddr: VAddr) -> bool {
    crate::kernel::mem::vm::fault(vaddr)
}

/// CPU exception vector 14. Reads the faulting address out of `cr2` rather
/// than `ctx.error_code` (which only carries the access-type bits), then
/// hands off to [`handle_page_fault`]; a fault the VM layer can't resolve
/// is fatal, since this core has no process-level SIGSEGV delivery.
fn page_fault_handler(ctx: &mut arch::interrupt::InterruptContext) {
    let vaddr = VAddr::new(arch::mm::get_page_fault_address());
    if !handle_page_fault(vaddr) {
        panic!("unhandled page fault at {:#x} (error_code={:#x}, rip={:#x})", vaddr.addr(), ctx.error_code, ctx.rip);
    }
}

const VECTOR_PAGE_FAULT: u8 = 14;

/// Wires vector 14 to [`page_fault_handler`]. Must run once, on the BSP,
/// before any address space can take a demand-paging fault.
pub fn install_page_fault_handler() {
    crate::kernel::interrupt::request_raw(VECTOR_PAGE_FAULT, page_fault_handler);
}
