#![cfg_attr(not(test), no_std)]

//! Minimal per-CPU core record and the architecture-independent preempt
//! counter built on top of it.
//!
//! The record is reached the same way `cpu_t` is reached in the reference
//! kernel this core was modeled after: each CPU's `%gs` base points at its
//! own [`CpuLocalCore`], whose first field is a self-pointer, so a single
//! `mov %gs:0, reg` both proves which CPU we are on and hands back a usable
//! reference without a table lookup.

use core::cell::Cell;
use core::ptr::NonNull;

/// Upper bound on the number of CPUs this build can track. Chosen generously;
/// actual topology comes from the boot-time CPU list.
pub const MAX_CPUS: usize = 64;

#[repr(C)]
pub struct CpuLocalCore {
    self_ptr: Cell<*const CpuLocalCore>,
    id: Cell<u32>,
    preempt_count: Cell<usize>,
    yield_immediately: Cell<bool>,
    dw_disable_count: Cell<usize>,
    in_interrupt_hard: Cell<bool>,
    in_interrupt_soft: Cell<bool>,
    /// Set once SMP bring-up has IPI'd every other CPU online. Before that
    /// point shootdowns and IPIs are uniprocessor no-ops.
    threaded: Cell<bool>,
}

// SAFETY: a `CpuLocalCore` is only ever read or mutated by the CPU whose
// `%gs` base points at it; the `Sync` bound just lets it live in a `static`.
unsafe impl Sync for CpuLocalCore {}

impl CpuLocalCore {
    const fn zeroed() -> Self {
        Self {
            self_ptr: Cell::new(core::ptr::null()),
            id: Cell::new(0),
            preempt_count: Cell::new(0),
            yield_immediately: Cell::new(false),
            dw_disable_count: Cell::new(0),
            in_interrupt_hard: Cell::new(false),
            in_interrupt_soft: Cell::new(false),
            threaded: Cell::new(false),
        }
    }

    pub fn id(&self) -> u32 {
        self.id.get()
    }

    pub fn is_threaded(&self) -> bool {
        self.threaded.get()
    }

    pub fn set_threaded(&self, threaded: bool) {
        self.threaded.set(threaded);
    }

    pub fn in_hard_irq(&self) -> bool {
        self.in_interrupt_hard.get()
    }

    pub fn in_soft_irq(&self) -> bool {
        self.in_interrupt_soft.get()
    }

    pub fn set_in_hard_irq(&self, v: bool) {
        self.in_interrupt_hard.set(v);
    }

    pub fn set_in_soft_irq(&self, v: bool) {
        self.in_interrupt_soft.set(v);
    }

    /// Mark that the current thread should yield as soon as preemption is
    /// re-enabled. Consumed (and cleared) by whoever calls
    /// [`take_yield_immediately`](Self::take_yield_immediately).
    pub fn request_yield_immediately(&self) {
        self.yield_immediately.set(true);
    }

    pub fn take_yield_immediately(&self) -> bool {
        let v = self.yield_immediately.get();
        self.yield_immediately.set(false);
        v
    }

    pub fn dw_status_disable(&self) -> usize {
        let n = self.dw_disable_count.get() + 1;
        self.dw_disable_count.set(n);
        n
    }

    /// Returns the new counter value; the caller should drain the deferred
    /// work queue when this reaches zero.
    pub fn dw_status_enable(&self) -> usize {
        let n = self.dw_disable_count.get();
        assert_ne!(n, 0, "deferred work status counter underflow");
        let n = n - 1;
        self.dw_disable_count.set(n);
        n
    }

    pub fn dw_enabled(&self) -> bool {
        self.dw_disable_count.get() == 0
    }
}

static mut CORES: [CpuLocalCore; MAX_CPUS] = [const { CpuLocalCore::zeroed() }; MAX_CPUS];

/// Bring up the per-CPU core record for the CPU we are currently running on
/// and point `%gs` at it. Must be called exactly once per CPU, early in that
/// CPU's boot path, before any code that touches [`current`] runs.
///
/// # Safety
/// Must be called on the CPU being initialized, exactly once, with a unique
/// `id` in `0..MAX_CPUS`.
pub unsafe fn init_this_cpu(id: usize) -> &'static CpuLocalCore {
    assert!(id < MAX_CPUS, "cpu id {id} out of range");

    let slot_ptr = core::ptr::addr_of_mut!(CORES[id]);
    let slot = &mut *slot_ptr;
    slot.id.set(id as u32);
    slot.self_ptr.set(slot_ptr as *const CpuLocalCore);

    arch::percpu::init_current(NonNull::new_unchecked(slot_ptr as *mut u8));

    &*slot_ptr
}

/// Returns the calling CPU's local core record.
///
/// # Panics
/// Panics (by dereferencing a null pointer) if called before
/// [`init_this_cpu`] has run on this CPU.
pub fn current() -> &'static CpuLocalCore {
    unsafe {
        let ptr = arch::percpu::current_ptr() as *const CpuLocalCore;
        &*ptr
    }
}

pub fn id() -> u32 {
    current().id()
}

/// Scheduler hook consulted by [`preempt::enable`] whenever the counter
/// falls back to zero and [`CpuLocalCore::take_yield_immediately`] is set.
/// Stored as a raw address rather than `Option<fn()>` behind a `ksync`
/// lock because `ksync` itself depends on this crate (`percpu` sits below
/// the lock layer); `kernel::task::scheduler` registers the real
/// implementation once, during its init stage, with
/// [`set_yield_hook`].
static YIELD_HOOK: core::sync::atomic::AtomicUsize = core::sync::atomic::AtomicUsize::new(0);

/// Registers the function called when a deferred preemption (spec.md
/// §4.6's "yield-immediately" flag) becomes due. Must be called once,
/// before interrupts are enabled on any CPU.
pub fn set_yield_hook(hook: fn()) {
    YIELD_HOOK.store(hook as usize, core::sync::atomic::Ordering::Release);
}

fn call_yield_hook() {
    let addr = YIELD_HOOK.load(core::sync::atomic::Ordering::Acquire);
    if addr != 0 {
        let f: fn() = unsafe { core::mem::transmute::<usize, fn()>(addr) };
        f();
    }
}

/// Generic preemption counter, architecture- and scheduler-independent.
///
/// [`enable`] itself is what consults
/// [`request_yield_immediately`](CpuLocalCore::request_yield_immediately):
/// the instant the count returns to zero, any timer tick that arrived
/// while the count was held > 0 gets to run the scheduler's yield hook
/// right here, whether `enable` was reached through a lock release or
/// directly from the interrupt-dispatch epilogue (spec.md §4.6).
pub mod preempt {
    use super::{call_yield_hook, current};
    use core::sync::atomic::{compiler_fence, Ordering};

    pub fn disable() {
        let cpu = current();
        cpu.preempt_count.set(cpu.preempt_count.get() + 1);
        compiler_fence(Ordering::SeqCst);
    }

    /// Returns the preempt count *after* decrementing.
    pub fn enable() -> usize {
        compiler_fence(Ordering::SeqCst);
        let cpu = current();
        let count = cpu.preempt_count.get();
        assert_ne!(count, 0, "preempt count underflow");
        let count = count - 1;
        cpu.preempt_count.set(count);

        if count == 0 && cpu.take_yield_immediately() {
            call_yield_hook();
        }

        count
    }

    pub fn count() -> usize {
        current().preempt_count.get()
    }
}

#[macro_export]
macro_rules! assert_preempt_enabled {
    () => {
        assert_eq!($crate::preempt::count(), 0, "preempt should be enabled")
    };
}

#[macro_export]
macro_rules! assert_preempt_disabled {
    () => {
        assert_ne!($crate::preempt::count(), 0, "preempt should be disabled")
    };
}
