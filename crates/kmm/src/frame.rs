use crate::pfn::PFN;
use bitflags::bitflags;
use core::sync::atomic::{AtomicU32, Ordering};
use intrusive_list::Link;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct FrameFlags: u8 {
        /// Backed by real memory and tracked by the allocator (as opposed
        /// to a hole in the physical address space, e.g. MMIO).
        const PRESENT = 1 << 0;
        /// Currently sitting on a buddy free list.
        const FREE    = 1 << 1;
        /// The *head* of a buddy pair currently linked into a free list
        /// (distinguishes "this frame is free" from "this frame is the
        /// representative of a free block starting here").
        const BUDDY   = 1 << 2;
        /// Reserved by early boot-time accounting (kernel image, the
        /// `PageDB` array itself) before the allocator owns this frame.
        const RESERVED = 1 << 3;
    }
}

/// One entry of the physical frame metadata array (`PageDB`). Mirrors the
/// bitfield layout of a classic `pmm_block_t`: order of the buddy block
/// this frame currently heads (if any), the order the region it came from
/// was carved at (its ceiling when coalescing), a reference count for
/// pages handed out to the slab/VM layers, and a free-list link.
#[repr(C)]
pub struct Frame {
    pub link: Link,
    flags: FrameFlags,
    order: u8,
    max_order: u8,
    refcount: AtomicU32,
}

impl Frame {
    pub const fn new() -> Self {
        Self {
            link: Link::new(),
            flags: FrameFlags::empty(),
            order: 0,
            max_order: 0,
            refcount: AtomicU32::new(0),
        }
    }

    pub fn flags(&self) -> FrameFlags {
        self.flags
    }

    pub fn set_flags(&mut self, flags: FrameFlags) {
        self.flags = flags;
    }

    pub fn insert_flags(&mut self, flags: FrameFlags) {
        self.flags.insert(flags);
    }

    pub fn remove_flags(&mut self, flags: FrameFlags) {
        self.flags.remove(flags);
    }

    pub fn order(&self) -> u8 {
        self.order
    }

    pub fn set_order(&mut self, order: u8) {
        self.order = order;
    }

    pub fn max_order(&self) -> u8 {
        self.max_order
    }

    pub fn set_max_order(&mut self, max_order: u8) {
        self.max_order = max_order;
    }

    pub fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::Relaxed)
    }

    pub fn inc_ref(&self) -> u32 {
        self.refcount.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Returns the refcount after the decrement.
    pub fn dec_ref(&self) -> u32 {
        let prev = self.refcount.fetch_sub(1, Ordering::AcqRel);
        assert_ne!(prev, 0, "frame refcount underflow");
        prev - 1
    }
}

/// The physical frame metadata array. Backed by memory mapped once at boot
/// (outside this crate's concern) and never moved or resized afterwards, so
/// `&'static mut` slices into it are sound to hand out one frame at a time.
pub struct PageDb {
    base_pfn: PFN,
    frames: *mut Frame,
    count: usize,
}

unsafe impl Send for PageDb {}
unsafe impl Sync for PageDb {}

impl PageDb {
    /// # Safety
    /// `frames` must point to `count` consecutive, already-initialized
    /// `Frame` values that stay mapped and exclusively owned by the
    /// `PageDB` for the lifetime of the kernel, starting at `base_pfn`.
    pub const unsafe fn new(base_pfn: PFN, frames: *mut Frame, count: usize) -> Self {
        Self {
            base_pfn,
            frames,
            count,
        }
    }

    pub fn base_pfn(&self) -> PFN {
        self.base_pfn
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn contains(&self, pfn: PFN) -> bool {
        pfn >= self.base_pfn && pfn.index() - self.base_pfn.index() < self.count
    }

    pub fn get(&self, pfn: PFN) -> &Frame {
        assert!(self.contains(pfn), "pfn out of PageDB range");
        let idx = pfn.index() - self.base_pfn.index();
        unsafe { &*self.frames.add(idx) }
    }

    /// # Safety
    /// The caller must not create overlapping `&mut Frame`s for the same
    /// pfn (frames are otherwise `Send + Sync` via `AtomicU32`/owner
    /// discipline, not real interior mutability for `flags`/`order`).
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get_mut(&self, pfn: PFN) -> &mut Frame {
        assert!(self.contains(pfn), "pfn out of PageDB range");
        let idx = pfn.index() - self.base_pfn.index();
        &mut *self.frames.add(idx)
    }

    pub fn pfn_of(&self, frame: &Frame) -> PFN {
        let idx = (frame as *const Frame as usize - self.frames as usize) / size_of::<Frame>();
        self.base_pfn + idx
    }
}
