//! TLB shootdown (spec.md §4.4), ported close to 1:1 from
//! `original_source/arch/x86_64/tlb.c`: a single kernel-wide shootdown
//! operation at a time, a status lock guarding the published range and the
//! per-CPU done bitmap, and a retry interval that re-IPIs any CPU whose
//! done bit is still clear.

use arch::interrupt::InterruptContext;
use arch::lapic::LocalApic;
use core::sync::atomic::{AtomicUsize, Ordering};
use kmm::PAGE_SIZE;
use ksync::{OnceLock, SpinIrq};
use percpu::MAX_CPUS;

use crate::kernel::interrupt::{self, Priority};

struct Status {
    vaddr: usize,
    len: usize,
    done: [bool; MAX_CPUS],
    cpu_count: usize,
}

static SHOOTDOWN_LOCK: SpinIrq<()> = SpinIrq::new(());
static STATUS: SpinIrq<Status> = SpinIrq::new(Status {
    vaddr: 0,
    len: 0,
    done: [false; MAX_CPUS],
    cpu_count: 0,
});
static COMPLETION_COUNT: AtomicUsize = AtomicUsize::new(0);

static LAPIC: OnceLock<LocalApic> = OnceLock::new();
static IPI_VECTOR: OnceLock<u8> = OnceLock::new();

/// Online CPUs' `(kernel id, local APIC id)`, set once at SMP bring-up.
static ONLINE: SpinIrq<[(u32, u32); MAX_CPUS]> = SpinIrq::new([(0, 0); MAX_CPUS]);
static ONLINE_COUNT: AtomicUsize = AtomicUsize::new(0);

/// Re-IPI cadence. The original measures this in elapsed nanoseconds
/// (`RETRY_AFTER_NS`); without a calibrated cycle counter at this point in
/// boot this core counts spin iterations instead, which is the same "don't
/// IPI on every single poll" throttle in spirit.
const RETRY_SPINS: usize = 10_000;

/// Registers the shootdown IPI vector at critical priority. Must run once
/// on the BSP before any other CPU comes online.
pub fn init(lapic: LocalApic) {
    LAPIC.get_or_init(|| lapic);
    IPI_VECTOR.get_or_init(|| interrupt::request(Priority::Critical, ipi_handler));
}

/// Number of CPUs marked online so far. Used by the thread factory's
/// round-robin affinity assignment, not just shootdowns.
pub fn online_cpu_count() -> usize {
    ONLINE_COUNT.load(Ordering::Acquire)
}

/// Registers `(cpu_id, apic_id)` as online, to be IPI'd by future
/// shootdowns. Called once per CPU as it finishes bring-up.
pub fn mark_cpu_online(cpu_id: u32, apic_id: u32) {
    let mut online = ONLINE.lock();
    let idx = ONLINE_COUNT.fetch_add(1, Ordering::AcqRel);
    online[idx] = (cpu_id, apic_id);
}

fn invalidate_local(vaddr: usize, len: usize) {
    if len > 64 * PAGE_SIZE {
        arch::mm::invlpg_all();
        return;
    }
    let start = vaddr & !(PAGE_SIZE - 1);
    let end = (vaddr + len + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
    let mut addr = start;
    while addr < end {
        arch::mm::invlpg(addr);
        addr += PAGE_SIZE;
    }
}

/// Invalidate `[vaddr, vaddr+len)` on every online CPU.
///
/// On a uniprocessor, or before SMP bring-up has marked this CPU threaded,
/// invalidates locally and returns.
pub fn shootdown(vaddr: usize, len: usize) {
    let cpu = percpu::current();
    if !cpu.is_threaded() {
        invalidate_local(vaddr, len);
        return;
    }

    percpu::preempt::disable();
    assert!(arch::interrupt::irqs_enabled(), "shootdown issued with interrupts disabled");

    let _g = SHOOTDOWN_LOCK.lock();
    let online_count = ONLINE_COUNT.load(Ordering::Acquire);
    let online = *ONLINE.lock();

    {
        let mut status = STATUS.lock();
        status.vaddr = vaddr;
        status.len = len;
        status.cpu_count = online_count;
        for done in status.done.iter_mut() {
            *done = false;
        }
    }
    COMPLETION_COUNT.store(0, Ordering::Release);

    invalidate_local(vaddr, len);
    {
        let mut status = STATUS.lock();
        status.done[cpu.id() as usize] = true;
    }
    COMPLETION_COUNT.fetch_add(1, Ordering::AcqRel);

    let lapic = LAPIC.get().expect("tlb::init was never called");
    let vector = *IPI_VECTOR.get().expect("tlb::init was never called");
    for &(id, apic_id) in online.iter().take(online_count) {
        if id != cpu.id() {
            lapic.send_ipi(apic_id, vector);
        }
    }

    loop {
        if COMPLETION_COUNT.load(Ordering::Acquire) >= online_count {
            break;
        }
        for _ in 0..RETRY_SPINS {
            if COMPLETION_COUNT.load(Ordering::Acquire) >= online_count {
                break;
            }
            core::hint::spin_loop();
        }
        if COMPLETION_COUNT.load(Ordering::Acquire) >= online_count {
            break;
        }
        let status = STATUS.lock();
        for &(id, apic_id) in online.iter().take(online_count) {
            if id != cpu.id() && !status.done[id as usize] {
                lapic.send_ipi(apic_id, vector);
            }
        }
    }

    percpu::preempt::enable();
}

extern "C" fn ipi_handler(_ctx: &mut InterruptContext) {
    let id = percpu::id() as usize;
    let (vaddr, len) = {
        let mut status = STATUS.lock();
        status.done[id] = true;
        (status.vaddr, status.len)
    };
    invalidate_local(vaddr, len);
    COMPLETION_COUNT.fetch_add(1, Ordering::AcqRel);
    LAPIC.get().expect("tlb::init was never called").end_of_interrupt();
}
