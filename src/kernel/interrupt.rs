//! Interrupt request registration and the top-level dispatch/IPL discipline
//! (spec.md §4.9). Grounded on `arch::interrupt::InterruptContext` for the
//! raw trap frame and `original_source/include/sys/interrupt.h`'s four
//! disjoint priority classes, each given a 16-entry vector range.

use arch::interrupt::InterruptContext;
use ksync::SpinIrq;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Low,
    Normal,
    Event,
    Critical,
}

impl Priority {
    const fn base_vector(self) -> u8 {
        match self {
            Priority::Low => 0x20,
            Priority::Normal => 0x30,
            Priority::Event => 0x40,
            Priority::Critical => 0x50,
        }
    }
}

pub const VECTORS_PER_PRIORITY: usize = 16;
const TABLE_LEN: usize = 256;

pub type Handler = fn(&mut InterruptContext);

struct Table {
    handlers: [Option<Handler>; TABLE_LEN],
}

static TABLE: SpinIrq<Table> = SpinIrq::new(Table {
    handlers: [None; TABLE_LEN],
});

/// Registers `handler` at the next free vector in `priority`'s range.
///
/// # Panics
/// If `priority`'s 16-entry range is exhausted.
pub fn request(priority: Priority, handler: Handler) -> u8 {
    let base = priority.base_vector();
    let mut table = TABLE.lock();
    for offset in 0..VECTORS_PER_PRIORITY as u8 {
        let vector = base + offset;
        if table.handlers[vector as usize].is_none() {
            table.handlers[vector as usize] = Some(handler);
            return vector;
        }
    }
    panic!("interrupt::request: priority {priority:?} vector range exhausted");
}

/// Registers `handler` at a specific vector rather than the next free slot
/// in a priority class. Used for the fixed CPU-exception vectors (0-0x1f,
/// e.g. the page fault at 14) that the architecture layer's IDT wires to
/// the shared trampoline regardless of what the kernel-core puts there.
///
/// # Panics
/// If `vector` already has a handler.
pub fn request_raw(vector: u8, handler: Handler) {
    let mut table = TABLE.lock();
    assert!(table.handlers[vector as usize].is_none(), "vector {vector} already registered");
    table.handlers[vector as usize] = Some(handler);
}

/// Vector the local APIC's spurious-interrupt register is programmed to
/// (spec.md §4.9 hands this class no real work); registered as a no-op so
/// an unlucky spurious IRQ doesn't hit the "unhandled vector" panic.
pub const SPURIOUS_VECTOR: u8 = 0xff;

fn spurious_handler(_ctx: &mut InterruptContext) {}

/// Points the architecture trap trampoline at [`dispatch`], and wires the
/// spurious vector to a no-op. Must run exactly once, on the BSP, before
/// `sti` runs anywhere.
pub fn install_dispatch() {
    unsafe { arch::interrupt::set_trap_handler(dispatch) };
    request_raw(SPURIOUS_VECTOR, spurious_handler);
}

pub fn enable() {
    arch::interrupt::enable_irqs();
}

pub fn disable() {
    arch::interrupt::disable_irqs();
}

pub fn state() -> bool {
    arch::interrupt::irqs_enabled()
}

/// Vectors critical-priority handlers (and the TLB shootdown IPI) run on,
/// wired to `arch::gdt::IST_CRITICAL` so they never execute on a possibly
/// corrupted kernel stack.
pub fn critical_vectors() -> [u8; VECTORS_PER_PRIORITY] {
    core::array::from_fn(|i| Priority::Critical.base_vector() + i as u8)
}

/// The single entry point `arch`'s trap trampoline calls into. Implements
/// the top-level handler discipline from spec.md §4.9: mark the CPU
/// in-hard-irq (if threaded), raise the preempt counter, disable deferred
/// work, dispatch, then unwind all three and drain deferred work before
/// returning.
pub extern "C" fn dispatch(ctx: &mut InterruptContext) {
    let cpu = percpu::current();
    let threaded = cpu.is_threaded();

    if threaded {
        cpu.set_in_hard_irq(true);
        percpu::preempt::disable();
        crate::kernel::dw::disable();
    }

    let vector = ctx.int_no as usize;
    let handler = TABLE.lock().handlers[vector];
    match handler {
        Some(handler) => handler(ctx),
        None => panic!("unhandled interrupt vector {vector}"),
    }

    if threaded {
        crate::kernel::dw::enable();
        percpu::preempt::enable();
        cpu.set_in_hard_irq(false);

        assert_eq!(
            percpu::preempt::count(),
            0,
            "preempt count must be 0 before returning from interrupt"
        );
        assert!(
            cpu.dw_enabled(),
            "deferred work must be enabled before returning from interrupt"
        );
    }
}
