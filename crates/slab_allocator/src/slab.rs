use intrusive_list::{container_of, Link, List};

/// Lives at the base of every slab (a PMM block carved into fixed-size
/// objects). The free objects within a slab are threaded through their own
/// first 8 bytes, so an empty slab costs nothing beyond this header: no
/// separate bitmap or side array, matching the reference allocator's
/// embedded-freelist slab layout.
#[repr(C)]
pub struct SlabHeader {
    pub link: Link,
    free_head: *mut u8,
    free_count: u16,
    total_count: u16,
}

impl SlabHeader {
    pub fn is_empty_of_objects(&self) -> bool {
        self.free_count == self.total_count
    }

    pub fn is_full(&self) -> bool {
        self.free_count == 0
    }

    fn pop_free(&mut self) -> *mut u8 {
        debug_assert!(!self.free_head.is_null());
        let obj = self.free_head;
        self.free_head = unsafe { *(obj as *mut *mut u8) };
        self.free_count -= 1;
        obj
    }

    fn push_free(&mut self, obj: *mut u8) {
        unsafe { *(obj as *mut *mut u8) = self.free_head };
        self.free_head = obj;
        self.free_count += 1;
    }
}

/// Where a cache's slabs live: `partial` has both free and live objects and
/// is served first, `full` has none free, `empty` is all-free and kept
/// around (instead of returned to the PMM immediately) so a cache that
/// oscillates around one working set doesn't thrash the page allocator.
pub struct SlabLists {
    pub partial: List,
    pub full: List,
    pub empty: List,
}

impl SlabLists {
    pub const fn new() -> Self {
        Self {
            partial: List::new(),
            full: List::new(),
            empty: List::new(),
        }
    }
}

unsafe fn header_of(link: &mut Link) -> &mut SlabHeader {
    unsafe { container_of!(link as *const _, SlabHeader, link).as_mut() }
}

/// Carves a freshly backed block of memory (`base`, `block_size` bytes)
/// into a header followed by `objects_per_slab` objects of `object_size`
/// bytes, threading every object onto the header's free list. `header_size`
/// has already been rounded up to keep the first object aligned.
///
/// # Safety
/// `base` must point at `block_size` writable bytes, exclusively owned by
/// the caller, for the lifetime of the slab.
pub unsafe fn format_slab(
    base: *mut u8,
    header_size: usize,
    object_size: usize,
    objects_per_slab: usize,
) -> &'static mut SlabHeader {
    let header = base as *mut SlabHeader;
    unsafe {
        header.write(SlabHeader {
            link: Link::new(),
            free_head: core::ptr::null_mut(),
            free_count: 0,
            total_count: objects_per_slab as u16,
        });
    }
    let header = unsafe { &mut *header };

    for i in (0..objects_per_slab).rev() {
        let obj = unsafe { base.add(header_size + i * object_size) };
        header.push_free(obj);
    }

    header
}

/// Pops one free object out of whichever slab is cheapest to use (partial
/// before empty; `grow` is only called once both are exhausted), moving the
/// slab between `partial`/`full` as its occupancy changes.
pub fn take_one(lists: &mut SlabLists) -> Option<*mut u8> {
    let (link, from_empty) = if !lists.partial.is_empty() {
        (lists.partial.head()?, false)
    } else if !lists.empty.is_empty() {
        (lists.empty.head()?, true)
    } else {
        return None;
    };

    let header = unsafe { header_of(link) };
    let obj = header.pop_free();

    if from_empty {
        lists.empty.remove(&mut header.link);
        if header.is_full() {
            lists.full.insert(&mut header.link);
        } else {
            lists.partial.insert(&mut header.link);
        }
    } else if header.is_full() {
        lists.partial.remove(&mut header.link);
        lists.full.insert(&mut header.link);
    }

    Some(obj)
}

/// Returns `obj` to the slab it belongs to (the slab header lives at the
/// start of the power-of-two-sized, power-of-two-aligned PMM block that
/// contains it), moving the slab between `full`/`partial`/`empty` as
/// needed.
///
/// # Safety
/// `obj` must be a live object previously returned by this cache's
/// `allocate`, and `block_size` must be this cache's actual slab size.
pub unsafe fn give_back(lists: &mut SlabLists, obj: *mut u8, block_size: usize) {
    let block_base = (obj as usize) & !(block_size - 1);
    let header = unsafe { &mut *(block_base as *mut SlabHeader) };

    let was_full = header.is_full();
    header.push_free(obj);

    if was_full {
        lists.full.remove(&mut header.link);
        lists.partial.insert(&mut header.link);
    } else if header.is_empty_of_objects() {
        lists.partial.remove(&mut header.link);
        lists.empty.insert(&mut header.link);
    }
}
