use crate::free_area::FreeArea;
use crate::MAX_ORDER;
use intrusive_list::container_of;
use kmm::{Frame, FrameFlags, PageDb, PFN};
use ksync::SpinIrq;

struct ZoneInner {
    areas: [FreeArea; MAX_ORDER + 1],
    free_pages: usize,
}

impl ZoneInner {
    const fn new() -> Self {
        Self {
            areas: [const { FreeArea::new() }; MAX_ORDER + 1],
            free_pages: 0,
        }
    }
}

/// A contiguous range of frames managed as one buddy tree. The reference
/// kernel this was modeled after splits physical memory into exactly two
/// such zones (see [`crate::BuddyAllocator`]): a small "low" zone usable by
/// legacy DMA, and everything above it.
pub struct Zone {
    pub name: &'static str,
    start_pfn: PFN,
    num_pages: usize,
    page_db: &'static PageDb,
    inner: SpinIrq<ZoneInner>,
}

impl Zone {
    pub const fn new(name: &'static str, start_pfn: PFN, page_db: &'static PageDb) -> Self {
        Self {
            name,
            start_pfn,
            num_pages: 0,
            page_db,
            inner: SpinIrq::new(ZoneInner::new()),
        }
    }

    pub fn start_pfn(&self) -> PFN {
        self.start_pfn
    }

    pub fn free_pages(&self) -> usize {
        self.inner.lock().free_pages
    }

    /// Bring `num_pages` starting at `start_pfn` under this zone's
    /// management. The first `used_pages` of the region are marked
    /// `PRESENT | RESERVED` (already spoken for by the kernel image, an
    /// early-boot bitmap, or similar) rather than handed to the free lists,
    /// mirroring `pmm_region_add`'s `used`-prefix parameter.
    ///
    /// # Safety
    /// `[start_pfn, start_pfn + num_pages)` must be real, currently
    /// unmanaged memory backed by valid `Frame` entries in `page_db`, not
    /// overlapping any region already added to any zone.
    pub unsafe fn add_region(&mut self, start_pfn: PFN, num_pages: usize, used_pages: usize) {
        if self.num_pages == 0 {
            self.start_pfn = start_pfn;
        }
        self.num_pages = self.num_pages.max(start_pfn.index() + num_pages - self.start_pfn.index());

        let mut inner = self.inner.lock();

        let mut pfn = start_pfn;
        let mut remaining = num_pages;
        let mut used = used_pages;

        while remaining > 0 {
            if used > 0 {
                let frame = unsafe { self.page_db.get_mut(pfn) };
                frame.set_flags(FrameFlags::PRESENT | FrameFlags::RESERVED);
                pfn = pfn + 1;
                remaining -= 1;
                used -= 1;
                continue;
            }

            let mut order = MAX_ORDER as u8;
            loop {
                let block = 1usize << order;
                let rel = pfn.index() - self.start_pfn.index();
                if block <= remaining && rel % block == 0 {
                    break;
                }
                if order == 0 {
                    break;
                }
                order -= 1;
            }

            self.link_free_new_region(&mut inner, pfn, order);
            let block = 1usize << order;
            pfn = pfn + block;
            remaining -= block;
        }
    }

    /// Links a freshly-carved block onto its free list, stamping
    /// `max_order` from the caller (region creation: the block's natural
    /// alignment ceiling) or, for merge and split paths that are just
    /// moving an already-carved block around, leaving the existing
    /// `max_order` untouched.
    fn link_free(&self, inner: &mut ZoneInner, pfn: PFN, order: u8) {
        let frame = unsafe { self.page_db.get_mut(pfn) };
        frame.set_flags(FrameFlags::PRESENT | FrameFlags::FREE);
        frame.set_order(order);
        inner.areas[order as usize].free_list.insert(&mut frame.link);
        inner.free_pages += 1usize << order;
    }

    /// Like `link_free`, but also stamps `max_order`. Only called from
    /// `add_region`: a block's `max_order` is fixed for its whole lifetime
    /// from here on, so merging in `dealloc` never coalesces across the
    /// region boundary that produced it.
    fn link_free_new_region(&self, inner: &mut ZoneInner, pfn: PFN, order: u8) {
        let frame = unsafe { self.page_db.get_mut(pfn) };
        frame.set_max_order(order);
        self.link_free(inner, pfn, order);
    }

    fn pop_free(&self, inner: &mut ZoneInner, order: u8) -> Option<PFN> {
        let link = inner.areas[order as usize].free_list.pop()?;
        let frame = unsafe { container_of!(link as *const _, Frame, link).as_ref() };
        Some(self.page_db.pfn_of(frame))
    }

    pub fn alloc_order(&self, req_order: u8) -> Option<PFN> {
        let mut inner = self.inner.lock();

        let mut order = req_order;
        while order as usize <= MAX_ORDER && inner.areas[order as usize].is_empty() {
            order += 1;
        }
        if order as usize > MAX_ORDER {
            return None;
        }

        let pfn = self.pop_free(&mut inner, order)?;
        inner.free_pages -= 1usize << order;
        let max_order = self.page_db.get(pfn).max_order();

        let mut cur_order = order;
        let cur_pfn = pfn;
        while cur_order > req_order {
            cur_order -= 1;
            let half_pfn = cur_pfn + (1usize << cur_order);
            self.link_free(&mut inner, half_pfn, cur_order);
            // The buddy carved off here belongs to the same region as the
            // block we split, so it inherits the same merge ceiling.
            unsafe { self.page_db.get_mut(half_pfn) }.set_max_order(max_order);
        }

        let frame = unsafe { self.page_db.get_mut(pfn) };
        frame.remove_flags(FrameFlags::FREE);
        frame.set_order(req_order);
        frame.set_max_order(max_order);

        Some(pfn)
    }

    /// # Safety
    /// `pfn` must be the start of a block this zone previously handed out
    /// at exactly `order` via `alloc_order`, not yet freed.
    pub unsafe fn dealloc(&self, pfn: PFN, order: u8) {
        let mut inner = self.inner.lock();

        let mut cur_pfn = pfn;
        let mut cur_order = order;
        // A block never merges past the order it was carved at in
        // `add_region`: that ceiling is what keeps coalescing from
        // crossing a region boundary (§4.1).
        let max_order = self.page_db.get(pfn).max_order();

        while cur_order < max_order {
            let rel = cur_pfn.index() - self.start_pfn.index();
            let buddy_rel = rel ^ (1usize << cur_order);
            if buddy_rel + (1usize << cur_order) > self.num_pages {
                break;
            }
            let buddy_pfn = self.start_pfn + buddy_rel;

            let buddy_frame = self.page_db.get(buddy_pfn);
            if !buddy_frame.flags().contains(FrameFlags::FREE)
                || buddy_frame.order() != cur_order
                || buddy_frame.max_order() != max_order
            {
                break;
            }

            let buddy_frame = unsafe { self.page_db.get_mut(buddy_pfn) };
            inner.areas[cur_order as usize]
                .free_list
                .remove(&mut buddy_frame.link);
            inner.free_pages -= 1usize << cur_order;
            buddy_frame.remove_flags(FrameFlags::FREE);

            if buddy_rel < rel {
                cur_pfn = buddy_pfn;
            }
            cur_order += 1;
        }

        self.link_free(&mut inner, cur_pfn, cur_order);
    }
}
