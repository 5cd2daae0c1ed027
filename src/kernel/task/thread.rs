//! A bare kernel thread (spec.md §4.6): an independently schedulable
//! execution context with its own kernel stack and saved register state.
//! Grounded on the teacher's own `Thread`/`ThreadState`
//! (`src/kernel/task/thread.rs`, pre-trim), stripped of everything that
//! belonged to the process/session/signal model layered on top of it there
//! — this kernel-core has no userspace, no VFS-backed file table, no
//! process groups; `Process`/`Session`/`ProcessGroup`/`WaitList`/signals
//! are syscall-layer concerns this spec does not describe.

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU32, Ordering};
use ksync::Spin;

use super::process::Process;

const KERNEL_STACK_SIZE: usize = 64 * 1024;

/// Monotonic, atomically-issued thread IDs. Id 0 is reserved for idle
/// threads (spec.md §4.6) and is never handed out here; the first real
/// thread gets id 1.
static NEXT_ID: AtomicU32 = AtomicU32::new(1);

fn alloc_id() -> u32 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// A plain heap-backed kernel stack. Not page-table-mapped specially: it
/// lives in the kernel's own address space, like every other kernel
/// allocation.
struct KernelStack {
    mem: Box<[u8]>,
}

impl KernelStack {
    fn new() -> Self {
        Self {
            mem: alloc::vec![0u8; KERNEL_STACK_SIZE].into_boxed_slice(),
        }
    }

    fn top(&self) -> usize {
        self.mem.as_ptr() as usize + self.mem.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Ready,
    Running,
    /// Sleeping, woken only by an explicit `uwake` (e.g. waiting on a
    /// condition variable or a lock).
    USleep,
    /// Sleeping, woken by `iwake` from interrupt context (e.g. waiting on
    /// an I/O completion).
    ISleep,
    Zombie,
}

pub struct Thread {
    pub id: u32,
    /// The CPU this thread's factory assigned it to, round-robin
    /// (spec.md §4.6). The scheduler only ever enqueues a thread onto its
    /// own affinity's ready queue.
    pub affinity: u32,
    /// `None` for kernel threads (idle, reaper, deferred-work helpers);
    /// `Some` for anything created by [`Thread::new_user`].
    pub process: Option<Arc<Process>>,
    state: Spin<ThreadState>,
    context: UnsafeCell<arch::context::TaskContext>,
    kstack: KernelStack,
}

// SAFETY: `context` is only ever touched by the scheduler while holding
// the owning `PerCpuScheduler`'s ready-queue lock, or by the one CPU
// currently running this thread.
unsafe impl Send for Thread {}
unsafe impl Sync for Thread {}

impl Thread {
    /// Thread 0 on each CPU: the one thread never handed out by
    /// [`alloc_id`], reserved for that CPU's idle loop.
    pub(super) fn new_idle(entry: extern "C" fn() -> !, affinity: u32) -> Arc<Self> {
        Self::build(0, None, affinity, entry as usize, None)
    }

    /// A new kernel thread that will start executing `entry` the first
    /// time it is switched to. `entry` must never return. Assigned to
    /// `affinity` by the caller (the round-robin factory in
    /// `kernel::task`).
    pub fn new_kernel(entry: extern "C" fn() -> !, affinity: u32) -> Arc<Self> {
        Self::build(alloc_id(), None, affinity, entry as usize, None)
    }

    /// A new thread that starts in ring 3 at `entry_ip` running on
    /// `user_sp`, inside `process`'s address space.
    pub fn new_user(process: Arc<Process>, entry_ip: usize, user_sp: usize, affinity: u32) -> Arc<Self> {
        let thread = Self::build(alloc_id(), Some(process.clone()), affinity, entry_ip, Some(user_sp));
        process.adopt(&thread);
        thread
    }

    fn build(id: u32, process: Option<Arc<Process>>, affinity: u32, entry: usize, user_sp: Option<usize>) -> Arc<Self> {
        let kstack = KernelStack::new();
        let mut context = arch::context::TaskContext::new();
        match user_sp {
            Some(user_sp) => unsafe { context.init_user(entry, user_sp, kstack.top()) },
            None => unsafe { context.init(entry, kstack.top()) },
        }

        Arc::new(Self {
            id,
            affinity,
            process,
            state: Spin::new(ThreadState::Ready),
            context: UnsafeCell::new(context),
            kstack,
        })
    }

    pub fn state(&self) -> ThreadState {
        *self.state.lock()
    }

    pub(super) fn set_state(&self, state: ThreadState) {
        *self.state.lock() = state;
    }

    pub(super) fn compare_and_set_state(&self, expect: ThreadState, set: ThreadState) {
        let mut guard = self.state.lock();
        assert_eq!(*guard, expect, "invalid thread state transition for thread {}", self.id);
        *guard = set;
    }

    /// # Safety
    /// Caller must guarantee this thread is not concurrently being switched
    /// to or from on another CPU.
    pub(super) unsafe fn context_mut(&self) -> &mut arch::context::TaskContext {
        unsafe { &mut *self.context.get() }
    }
}
