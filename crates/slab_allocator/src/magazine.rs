use intrusive_list::{container_of, Link, List};

/// Per-CPU magazine capacity (`M` in spec.md §4.2). 32 matches the
/// reference allocator's `SLAB_MAGAZINE_SIZE`.
pub const MAGAZINE_SIZE: usize = 32;

/// A small LIFO stack of free object pointers, the unit the per-CPU cache
/// and the global depot trade in two at a time. Magazines themselves come
/// from the cache-of-magazines bootstrap cache (see [`crate::magazine_cache`]),
/// never from the general heap, so growing the depot never recurses back
/// into this allocator.
#[repr(C)]
pub struct Magazine {
    pub link: Link,
    count: u16,
    objects: [*mut u8; MAGAZINE_SIZE],
}

unsafe impl Send for Magazine {}

impl Magazine {
    pub const fn empty() -> Self {
        Self {
            link: Link::new(),
            count: 0,
            objects: [core::ptr::null_mut(); MAGAZINE_SIZE],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn is_full(&self) -> bool {
        self.count as usize == MAGAZINE_SIZE
    }

    pub fn push(&mut self, obj: *mut u8) -> bool {
        if self.is_full() {
            return false;
        }
        self.objects[self.count as usize] = obj;
        self.count += 1;
        true
    }

    pub fn pop(&mut self) -> Option<*mut u8> {
        if self.count == 0 {
            return None;
        }
        self.count -= 1;
        Some(self.objects[self.count as usize])
    }
}

/// A CPU's two magazines: `primary` is drained/filled first, `secondary`
/// is the backup swapped in when `primary` runs dry/full. Splitting the
/// per-CPU cache into two lets a CPU absorb a burst of N <= M frees right
/// after a burst of N <= M allocs without touching the global depot at all
/// (the classic magazine-layer amortization, spec.md §4.2).
pub struct MagazinePair {
    pub primary: *mut Magazine,
    pub secondary: *mut Magazine,
}

unsafe impl Send for MagazinePair {}

impl MagazinePair {
    pub const fn empty() -> Self {
        Self {
            primary: core::ptr::null_mut(),
            secondary: core::ptr::null_mut(),
        }
    }
}

/// Global pool of spare magazines shared by all CPUs using one cache,
/// split into ones that still hold objects (`full`) and ones that don't
/// (`empty`). A CPU that exhausts its pair first tries `full` (an instant
/// refill); a CPU whose pair is both full first tries `empty` (somewhere
/// to dump the overflow) before falling back to allocating a fresh
/// magazine from the cache-of-magazines.
pub struct Depot {
    full: List,
    empty: List,
}

impl Depot {
    pub const fn new() -> Self {
        Self {
            full: List::new(),
            empty: List::new(),
        }
    }

    pub fn take_full(&mut self) -> Option<*mut Magazine> {
        self.full.pop().map(|link| unsafe {
            container_of!(link as *const _, Magazine, link).as_ptr()
        })
    }

    pub fn take_empty(&mut self) -> Option<*mut Magazine> {
        self.empty.pop().map(|link| unsafe {
            container_of!(link as *const _, Magazine, link).as_ptr()
        })
    }

    pub fn put_full(&mut self, mag: *mut Magazine) {
        self.full.insert(unsafe { &mut (*mag).link });
    }

    pub fn put_empty(&mut self, mag: *mut Magazine) {
        self.empty.insert(unsafe { &mut (*mag).link });
    }
}
