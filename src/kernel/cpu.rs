//! The kernel-owned per-CPU extension record (spec.md §4.9), layered on
//! top of [`percpu::CpuLocalCore`]. `percpu::CpuLocalCore` only knows about
//! the architecture-independent preempt/interrupt-depth bookkeeping every
//! lock strategy needs; everything a *subsystem* hangs off a CPU (its
//! ready queue, its event tree, its deferred-work queue, its clock
//! frequencies) lives here instead, grounded on
//! `original_source/include/sys/cpu.h`'s `cpu_t` and
//! `arch/src/x86_64/init.rs`'s `CPU` bring-up record.

use crate::kernel::dw;
use crate::kernel::task::scheduler::PerCpuScheduler;
use crate::kernel::timer::EventQueue;
use arch::gdt::{Gdt, Tss, IST_CRITICAL};
use arch::interrupt::Idt;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU64, Ordering};
use ksync::OnceLock;

/// Size of the stack critical-priority traps (and the TLB shootdown IPI)
/// run on via `IST_CRITICAL`, so they never execute on a possibly-corrupted
/// kernel stack (spec.md §4.9).
const IST_CRITICAL_STACK_SIZE: usize = 16 * 1024;

pub struct Core {
    id: u32,
    pub scheduler: PerCpuScheduler,
    pub timer: EventQueue,
    pub dw: dw::Queue,
    lapic_freq_hz: AtomicU64,
    tsc_freq_hz: AtomicU64,
    /// Architecture bring-up state: this CPU's own GDT/TSS/IDT and the
    /// stack its IST slot points at. `UnsafeCell` rather than a lock because
    /// only the owning CPU ever touches its own entry (this record is
    /// reached through `%gs`, never shared), and `Gdt::load`/`Idt::load`
    /// require `&'static` stability that a lock guard can't provide past
    /// the call that installs them.
    gdt: UnsafeCell<Gdt>,
    tss: UnsafeCell<Tss>,
    idt: UnsafeCell<Idt>,
    ist_critical_stack: UnsafeCell<[u8; IST_CRITICAL_STACK_SIZE]>,
}

// SAFETY: the arch bring-up fields are only ever touched by the CPU that
// owns this `Core`, from `arch_bringup`; `Sync` just lets the record live in
// a `static`.
unsafe impl Sync for Core {}

impl Core {
    const fn zeroed(id: u32) -> Self {
        Self {
            id,
            scheduler: PerCpuScheduler::new(),
            timer: EventQueue::new(),
            dw: dw::Queue::new(),
            lapic_freq_hz: AtomicU64::new(0),
            tsc_freq_hz: AtomicU64::new(0),
            gdt: UnsafeCell::new(Gdt::new()),
            tss: UnsafeCell::new(Tss::new()),
            idt: UnsafeCell::new(Idt::new()),
            ist_critical_stack: UnsafeCell::new([0; IST_CRITICAL_STACK_SIZE]),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Loads this CPU's GDT, TSS and IDT, and points the IST-critical slot
    /// at this record's own stack. Must run once per CPU, with interrupts
    /// disabled, after `init_this_cpu` and before `sti`.
    ///
    /// # Safety
    /// Must be called on the CPU that owns `self` (i.e. the one `current()`
    /// would return), exactly once.
    pub unsafe fn arch_bringup(&'static self) {
        let tss = unsafe { &mut *self.tss.get() };
        let stack_top = self.ist_critical_stack.get() as usize + IST_CRITICAL_STACK_SIZE;
        tss.set_ist(IST_CRITICAL, stack_top as u64);

        let gdt = unsafe { &mut *self.gdt.get() };
        gdt.set_tss(tss);
        unsafe { gdt.load() };

        let idt = unsafe { &mut *self.idt.get() };
        idt.init_defaults(&crate::kernel::interrupt::critical_vectors());
        unsafe { idt.load() };
    }

    pub fn lapic_freq_hz(&self) -> u64 {
        self.lapic_freq_hz.load(Ordering::Relaxed)
    }

    pub fn set_lapic_freq_hz(&self, hz: u64) {
        self.lapic_freq_hz.store(hz, Ordering::Relaxed);
    }

    pub fn tsc_freq_hz(&self) -> u64 {
        self.tsc_freq_hz.load(Ordering::Relaxed)
    }

    pub fn set_tsc_freq_hz(&self, hz: u64) {
        self.tsc_freq_hz.store(hz, Ordering::Relaxed);
    }
}

/// One [`Core`] per slot in `percpu`'s core table, populated lazily as
/// each CPU brings itself up. `OnceLock` rather than a const array of
/// `Core` because `Core` isn't meaningfully default-constructible without
/// knowing its `id`; `init_this_cpu` supplies it.
static CORES: [OnceLock<Core>; percpu::MAX_CPUS] = [const { OnceLock::new() }; percpu::MAX_CPUS];

/// Brings up both the architecture-level `%gs` self-pointer
/// ([`percpu::init_this_cpu`]) and this kernel-level extension record for
/// the calling CPU. Must run exactly once per CPU, before any code on that
/// CPU touches [`current`].
///
/// # Safety
/// Same requirements as [`percpu::init_this_cpu`].
pub unsafe fn init_this_cpu(id: usize) -> &'static Core {
    unsafe { percpu::init_this_cpu(id) };
    CORES[id].get_or_init(|| Core::zeroed(id as u32))
}

pub fn current() -> &'static Core {
    let id = percpu::id() as usize;
    CORES[id]
        .get()
        .expect("kernel::cpu::current() called before init_this_cpu on this CPU")
}

pub fn by_id(id: u32) -> Option<&'static Core> {
    CORES.get(id as usize).and_then(OnceLock::get)
}
