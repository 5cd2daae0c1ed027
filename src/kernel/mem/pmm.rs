//! Physical memory manager (spec.md §4.1): the kernel-core binding of
//! `crates/buddy_allocator` to the boot memory map.

use buddy_allocator::BuddyAllocator;
use core::mem::MaybeUninit;
use kmm::{AllocFlags, Frame, FrameAlloc, PAddr, PageDb, PFN, PAGE_SIZE};
use ksync::OnceLock;

use crate::kernel::boot::BootInfo;

/// Upper bound on the number of physical frames this build can track
/// (`MAX_FRAMES * PAGE_SIZE` = 2 GiB). A production bootstrap carves the
/// PageDB array itself out of usable RAM reported by the memory map; a
/// fixed-size static array is the simplification this rewrite makes
/// instead (recorded as an Open Question resolution in DESIGN.md).
const MAX_FRAMES: usize = 512 * 1024;

static mut FRAME_STORE: [MaybeUninit<Frame>; MAX_FRAMES] =
    [const { MaybeUninit::uninit() }; MAX_FRAMES];

static PAGE_DB: OnceLock<PageDb> = OnceLock::new();
static ALLOCATOR: OnceLock<BuddyAllocator> = OnceLock::new();

/// Brings up the PMM from the boot memory map. Must run exactly once, on
/// the BSP, before any other kernel-core component allocates a frame.
pub fn init(boot: &BootInfo) {
    buddy_allocator::set_hhdm_offset(boot.hhdm_offset);

    let highest_byte = boot
        .memory_map
        .iter()
        .map(|e| e.base.addr() + e.len)
        .max()
        .unwrap_or(0);
    let frame_count = (highest_byte.div_ceil(PAGE_SIZE)).min(MAX_FRAMES);

    let frames_ptr = unsafe {
        for frame in &mut FRAME_STORE[..frame_count] {
            frame.write(Frame::new());
        }
        core::ptr::addr_of_mut!(FRAME_STORE) as *mut Frame
    };

    let page_db = PAGE_DB
        .get_or_init(|| unsafe { PageDb::new(PFN::from_val(0), frames_ptr, frame_count) });

    ALLOCATOR.get_or_init(|| {
        let mut allocator = BuddyAllocator::new(page_db);
        for entry in boot.usable_regions() {
            let base = entry.base.page_align_up();
            let end_addr = (entry.base.addr() + entry.len) & !(PAGE_SIZE - 1);
            if end_addr <= base.addr() {
                continue;
            }
            unsafe { allocator.region_add(base, end_addr - base.addr(), 0) };
        }
        allocator
    });
}

fn concrete() -> &'static BuddyAllocator {
    ALLOCATOR.get().expect("kernel::mem::pmm::init was never called")
}

/// Whether [`init`] has run yet. Consulted by `kheap`'s global allocator to
/// decide between its early bump region and the real slab/page-backed path.
pub fn is_ready() -> bool {
    ALLOCATOR.get().is_some()
}

pub fn page_db() -> &'static PageDb {
    PAGE_DB.get().expect("kernel::mem::pmm::init was never called")
}

pub fn allocator() -> &'static dyn FrameAlloc {
    concrete()
}

pub fn alloc_order(order: u8, flags: AllocFlags) -> Option<PFN> {
    concrete().alloc_order(order, flags, buddy_allocator::OomPolicy::ReturnNone)
}

/// # Safety
/// `pfn` must be a block this allocator actually handed out at `order`,
/// not yet freed.
pub unsafe fn dealloc(pfn: PFN, order: u8) {
    unsafe { FrameAlloc::dealloc(concrete(), pfn, order) };
}

pub fn free_pages() -> usize {
    concrete().free_pages()
}
