#![cfg_attr(not(test), no_std)]

//! Per-CPU-magazine slab allocator, grounded on the reference kernel's
//! `kernel/memory/slab.{c,h}` (see spec.md §4.2) and built on top of the
//! buddy allocator's [`kmm::FrameAlloc`] contract rather than the generic
//! size-class buckets the teacher's original `slab_allocator` crate had.
//!
//! A [`Cache`] serves one fixed object size out of PMM blocks ("slabs")
//! split into a header plus an embedded free list. Above that sits a
//! per-CPU pair of magazines (small LIFO stacks of free pointers, §4.2)
//! fed from a global depot, so the hot alloc/free path almost never touches
//! the cache's own lock. Two bootstrap caches break the chicken-and-egg
//! problem of "allocating a `Cache` needs a `Cache`, allocating a
//! `Magazine` needs a `Magazine`": they serve `Cache`- and
//! `Magazine`-sized objects directly off their slab lists, with no
//! magazine layer of their own.

mod magazine;
mod slab;

use core::mem::{align_of, size_of};
use kmm::{AllocFlags, FrameAlloc, PAGE_SIZE};
use ksync::{OnceLock, Spin, SpinIrq};
use magazine::{Depot, Magazine, MagazinePair, MAGAZINE_SIZE};
use slab::{format_slab, SlabHeader, SlabLists};

/// Objects must be large enough to hold a free-list next-pointer (spec.md
/// §4.2).
pub const MIN_OBJECT_SIZE: usize = size_of::<*mut u8>();

struct CacheInner {
    alloc: OnceLock<&'static dyn FrameAlloc>,
    object_size: usize,
    header_size: usize,
    objects_per_slab: usize,
    block_order: u8,
    block_size: usize,
    bootstrap: bool,
}

pub struct Cache {
    name: &'static str,
    inner: CacheInner,
    slabs: SpinIrq<SlabLists>,
    depot: SpinIrq<Depot>,
    magazines: [Spin<MagazinePair>; percpu::MAX_CPUS],
}

unsafe impl Sync for Cache {}

impl Cache {
    const fn new_raw(name: &'static str, object_size: usize, block_order: u8, bootstrap: bool) -> Self {
        let object_size = if object_size < MIN_OBJECT_SIZE {
            MIN_OBJECT_SIZE
        } else {
            object_size
        };
        let header_size = align_up(size_of::<SlabHeader>(), align_of::<SlabHeader>());
        let block_size = PAGE_SIZE << block_order;
        let objects_per_slab = (block_size - header_size) / object_size;

        Self {
            name,
            inner: CacheInner {
                alloc: OnceLock::new(),
                object_size,
                header_size,
                objects_per_slab,
                block_order,
                block_size,
                bootstrap,
            },
            slabs: SpinIrq::new(SlabLists::new()),
            depot: SpinIrq::new(Depot::new()),
            magazines: [const { Spin::new(MagazinePair::empty()) }; percpu::MAX_CPUS],
        }
    }

    /// Bind the allocator that backs this cache's slabs. Bootstrap caches
    /// are declared as `static`s before any [`FrameAlloc`] exists, so this
    /// is called once, explicitly, during early kernel init
    /// ([`init_bootstrap_caches`]); caches created after that point via
    /// [`Cache::create`] bind it at construction time.
    fn bind(&self, alloc: &'static dyn FrameAlloc) {
        self.inner.alloc.get_or_init(|| alloc);
    }

    fn allocator(&self) -> &'static dyn FrameAlloc {
        *self
            .inner
            .alloc
            .get()
            .expect("slab cache used before its backing allocator was bound")
    }

    /// Allocate and format one new slab, returning it already on the
    /// `partial` list.
    fn grow(&self) {
        let pfn = self
            .allocator()
            .alloc_order(self.inner.block_order, AllocFlags::default())
            .expect("slab allocator: PMM out of memory");
        let base = hhdm::phys_to_virt(pfn) as *mut u8;
        let header = unsafe {
            format_slab(
                base,
                self.inner.header_size,
                self.inner.object_size,
                self.inner.objects_per_slab,
            )
        };
        self.slabs.lock().partial.insert(&mut header.link);
    }

    /// Pull one object straight off the slab free lists, growing the cache
    /// from the PMM if both `partial` and `empty` are drained. This is the
    /// bootstrap caches' entire `allocate`, and the ordinary caches' magazine
    /// refill path.
    fn allocate_from_slabs(&self) -> *mut u8 {
        loop {
            if let Some(obj) = slab::take_one(&mut self.slabs.lock()) {
                return obj;
            }
            self.grow();
        }
    }

    /// # Safety
    /// `ptr` must be a live object this cache previously handed out.
    unsafe fn free_to_slabs(&self, ptr: *mut u8) {
        unsafe { slab::give_back(&mut self.slabs.lock(), ptr, self.inner.block_size) };
    }

    fn alloc_magazine(&self) -> *mut Magazine {
        magazine_cache().allocate() as *mut Magazine
    }

    /// The fast path: pop from the calling CPU's primary magazine, falling
    /// back to swapping in the secondary, then the global depot, then a
    /// fresh slab object, in that order (spec.md §4.2).
    fn allocate_magazine_layer(&self) -> *mut u8 {
        let mut pair = self.magazines[percpu::id() as usize].lock();

        if let Some(obj) = unsafe { pair.primary.as_mut() }.and_then(Magazine::pop) {
            return obj;
        }

        if unsafe { pair.secondary.as_ref() }.is_some_and(|m| !m.is_empty()) {
            core::mem::swap(&mut pair.primary, &mut pair.secondary);
            if let Some(obj) = unsafe { pair.primary.as_mut() }.and_then(Magazine::pop) {
                return obj;
            }
        }

        if let Some(full) = self.depot.lock().take_full() {
            if !pair.primary.is_null() {
                self.depot.lock().put_empty(pair.primary);
            }
            pair.primary = full;
            if let Some(obj) = unsafe { &mut *pair.primary }.pop() {
                return obj;
            }
        }

        drop(pair);
        self.allocate_from_slabs()
    }

    /// The fast path's mirror: push onto `primary`, then `secondary`, then
    /// hand a full magazine to the depot and start a fresh one, then fall
    /// back to returning the object straight to its slab.
    fn free_magazine_layer(&self, obj: *mut u8) {
        let mut pair = self.magazines[percpu::id() as usize].lock();

        if pair.primary.is_null() {
            pair.primary = self.alloc_magazine();
        }
        if unsafe { &mut *pair.primary }.push(obj) {
            return;
        }

        if !pair.secondary.is_null() && unsafe { &mut *pair.secondary }.push(obj) {
            core::mem::swap(&mut pair.primary, &mut pair.secondary);
            return;
        }

        let full = pair.primary;
        pair.primary = match self.depot.lock().take_empty() {
            Some(empty) => empty,
            None => self.alloc_magazine(),
        };
        self.depot.lock().put_full(full);
        unsafe { &mut *pair.primary }.push(obj);
    }

    pub fn allocate(&self) -> *mut u8 {
        if self.inner.bootstrap {
            self.allocate_from_slabs()
        } else {
            self.allocate_magazine_layer()
        }
    }

    /// # Safety
    /// `ptr` must be a live object previously returned by [`Cache::allocate`]
    /// on this same cache.
    pub unsafe fn free(&self, ptr: *mut u8) {
        if self.inner.bootstrap {
            unsafe { self.free_to_slabs(ptr) };
        } else {
            self.free_magazine_layer(ptr);
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn object_size(&self) -> usize {
        self.inner.object_size
    }

    /// Create a new general-purpose cache. The `Cache` record itself is
    /// allocated out of the cache-of-caches bootstrap cache, so this never
    /// touches the general heap.
    pub fn create(
        name: &'static str,
        object_size: usize,
        block_order: u8,
        alloc: &'static dyn FrameAlloc,
    ) -> &'static Cache {
        let raw = CACHE_CACHE.allocate() as *mut Cache;
        unsafe {
            raw.write(Cache::new_raw(name, object_size, block_order, false));
            (*raw).bind(alloc);
            &*raw
        }
    }
}

const fn align_up(val: usize, align: usize) -> usize {
    (val + align - 1) & !(align - 1)
}

static CACHE_CACHE: Cache = Cache::new_raw("kmem_cache", size_of::<Cache>(), 0, true);
static MAGAZINE_CACHE: Cache = Cache::new_raw("kmem_magazine", size_of::<Magazine>(), 0, true);

fn magazine_cache() -> &'static Cache {
    &MAGAZINE_CACHE
}

/// Binds both bootstrap caches to the real PMM. Must run once, early in
/// kernel init, before any call to [`Cache::create`] or `allocate`/`free`
/// on any cache.
pub fn init_bootstrap_caches(alloc: &'static dyn FrameAlloc) {
    CACHE_CACHE.bind(alloc);
    MAGAZINE_CACHE.bind(alloc);
}

/// Seam over the HHDM (physical -> kernel virtual) window, bound once at
/// boot. Kept local to this crate rather than shared with `buddy_allocator`
/// so the two stay independently testable; both are fed the same offset by
/// `kernel::mem::init` in practice.
mod hhdm {
    use core::sync::atomic::{AtomicUsize, Ordering};
    use kmm::PFN;

    static HHDM_OFFSET: AtomicUsize = AtomicUsize::new(0);

    pub fn set_offset(offset: usize) {
        HHDM_OFFSET.store(offset, Ordering::Release);
    }

    pub fn phys_to_virt(pfn: PFN) -> usize {
        (pfn.index() << 12) + HHDM_OFFSET.load(Ordering::Acquire)
    }
}

pub use hhdm::set_offset as set_hhdm_offset;

#[cfg(test)]
mod tests {
    use super::*;
    use std::boxed::Box;
    use std::vec::Vec;

    struct BumpAlloc {
        regions: SpinIrq<Vec<Box<[u8]>>>,
    }

    impl BumpAlloc {
        fn new() -> Self {
            Self {
                regions: SpinIrq::new(Vec::new()),
            }
        }
    }

    impl FrameAlloc for BumpAlloc {
        fn alloc_order(&self, order: u8, _flags: AllocFlags) -> Option<kmm::PFN> {
            let size = PAGE_SIZE << order;
            let layout = std::alloc::Layout::from_size_align(size, size).unwrap();
            let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
            let mut boxed = unsafe { Box::from_raw(core::ptr::slice_from_raw_parts_mut(ptr, size)) };
            let addr = boxed.as_mut_ptr() as usize;
            self.regions.lock().push(boxed);
            Some(kmm::PFN::from_val(addr >> 12))
        }

        unsafe fn dealloc(&self, _pfn: kmm::PFN, _order: u8) {}
    }

    fn make_alloc() -> &'static BumpAlloc {
        Box::leak(Box::new(BumpAlloc::new()))
    }

    #[test]
    fn bootstrap_cache_alloc_free_roundtrip() {
        set_hhdm_offset(0);
        let alloc = make_alloc();
        init_bootstrap_caches(alloc);

        let a = CACHE_CACHE.allocate();
        let b = CACHE_CACHE.allocate();
        assert_ne!(a, b);
        unsafe {
            CACHE_CACHE.free(a);
            CACHE_CACHE.free(b);
        }
    }

    #[test]
    fn created_cache_serves_distinct_objects() {
        set_hhdm_offset(0);
        let alloc = make_alloc();
        init_bootstrap_caches(alloc);

        let cache = Cache::create("test_objs", 64, 0, alloc);
        let mut ptrs = Vec::new();
        for _ in 0..100 {
            let p = cache.allocate();
            assert!(!ptrs.contains(&p));
            ptrs.push(p);
        }
        for p in ptrs {
            unsafe { cache.free(p) };
        }

        // Reallocating after freeing everything should stay within the
        // same working set instead of growing forever.
        let mut ptrs2 = Vec::new();
        for _ in 0..100 {
            ptrs2.push(cache.allocate());
        }
        for p in ptrs2 {
            unsafe { cache.free(p) };
        }
    }

    #[test]
    fn magazine_layer_survives_alloc_free_bursts_across_the_cpu_cap() {
        set_hhdm_offset(0);
        let alloc = make_alloc();
        init_bootstrap_caches(alloc);
        let cache = Cache::create("burst", 32, 1, alloc);

        for _ in 0..(MAGAZINE_SIZE * 4) {
            let p = cache.allocate();
            unsafe { cache.free(p) };
        }
    }
}
