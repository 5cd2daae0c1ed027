//! A process: an address space plus the set of threads running inside it
//! (spec.md §3). Grounded on the teacher's own `Process`
//! (`src/kernel/task/process_list.rs`, pre-trim), stripped down to what
//! this kernel-core actually needs to hand a thread an address space to
//! fault into — no VFS-backed file table, no session/group, no signal
//! disposition table.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};
use ksync::SpinIrq;

use crate::kernel::mem::{ptm, vm};
use crate::kernel::task::thread::Thread;

/// User half of the 64-bit address space: kept well clear of the kernel's
/// own 0xffff_8000_0000_0000-and-up half mapped into every address space
/// (spec.md §4.3's shared-upper-half invariant).
const USER_LO: usize = 0x1000;
const USER_HI: usize = 0x0000_7fff_ffff_f000;

static NEXT_PID: AtomicU32 = AtomicU32::new(1);

pub struct Process {
    pub id: u32,
    vm: &'static vm::AddressSpace,
    threads: SpinIrq<Vec<Arc<Thread>>>,
}

impl Process {
    /// Builds a fresh address space (copying the kernel's upper half) and
    /// an empty thread set. The address space is leaked to get a `'static`
    /// handle threads can fault into from any CPU; [`Process::destroy`]
    /// reclaims it.
    pub fn new() -> Arc<Self> {
        let kernel_ptm = ptm::global_address_space();
        let ptm_as = Box::leak(Box::new(ptm::AddressSpace::create(kernel_ptm)));
        let vm_as = Box::leak(Box::new(vm::AddressSpace::new(ptm_as, USER_LO, USER_HI)));

        Arc::new(Self {
            id: NEXT_PID.fetch_add(1, Ordering::Relaxed),
            vm: vm_as,
            threads: SpinIrq::new(Vec::new()),
        })
    }

    pub fn address_space(&self) -> &'static vm::AddressSpace {
        self.vm
    }

    pub(super) fn adopt(&self, thread: &Arc<Thread>) {
        self.threads.lock().push(thread.clone());
    }

    /// Drops `thread` from this process's thread set. Returns `true` if
    /// that was the last one, meaning the process is ready for
    /// [`Process::destroy`].
    pub(super) fn forget(&self, thread_id: u32) -> bool {
        let mut threads = self.threads.lock();
        threads.retain(|t| t.id != thread_id);
        threads.is_empty()
    }

    /// Installs this process's page tables on the calling CPU. Call before
    /// switching to one of its threads.
    pub fn activate(&self) {
        unsafe { self.vm.ptm().load() };
    }

    /// Reclaims the leaked address space once every thread in this process
    /// has reached `Zombie` and been reaped. Only the region bookkeeping
    /// and page-table frames themselves are freed here; the physical pages
    /// those page tables still point at are not walked and returned to the
    /// PMM, a gap for whoever adds process teardown accounting on top of
    /// this.
    pub(super) unsafe fn destroy(self: Arc<Self>) {
        debug_assert!(self.threads.lock().is_empty(), "process destroyed with threads still attached");
        let vm_ptr = self.vm as *const vm::AddressSpace as *mut vm::AddressSpace;
        let ptm_ptr = self.vm.ptm() as *const ptm::AddressSpace as *mut ptm::AddressSpace;
        unsafe {
            drop(Box::from_raw(vm_ptr));
            drop(Box::from_raw(ptm_ptr));
        }
    }
}
