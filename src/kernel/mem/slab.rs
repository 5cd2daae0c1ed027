//! Slab allocator binding (spec.md §4.2): wires `crates/slab_allocator`'s
//! bootstrap caches to this kernel's PMM.

pub use slab_allocator::Cache;

use crate::kernel::boot::BootInfo;
use crate::kernel::mem::pmm;

/// Binds the HHDM window and the two bootstrap caches to the real PMM.
/// Must run once, after [`pmm::init`], before any [`Cache::create`] or
/// `allocate`/`free` call anywhere in the kernel.
pub fn init(boot: &BootInfo) {
    slab_allocator::set_hhdm_offset(boot.hhdm_offset);
    slab_allocator::init_bootstrap_caches(pmm::allocator());
}

/// Create a new cache serving fixed-size `object_size` objects, backed by
/// the PMM.
pub fn create_cache(name: &'static str, object_size: usize, block_order: u8) -> &'static Cache {
    Cache::create(name, object_size, block_order, pmm::allocator())
}
