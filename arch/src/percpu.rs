//! `%gs`-base self-pointer mechanism backing the `percpu` crate's
//! [`CpuLocalCore`](../../percpu/struct.CpuLocalCore.html).

use core::arch::asm;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, Ordering};

const IA32_GS_BASE: u32 = 0xC000_0101;

/// Set the first time any CPU calls [`init_current`]. Lets code that might
/// run before `%gs` is set up on the *calling* CPU (notably the panic
/// handler) avoid dereferencing an unset segment base. Global rather than
/// per-CPU: good enough to protect the very early boot window, at the cost
/// of not covering an AP that panics before its own `init_current` while
/// the BSP's has already run.
static ANY_CPU_INITIALIZED: AtomicBool = AtomicBool::new(false);

pub fn is_initialized() -> bool {
    ANY_CPU_INITIALIZED.load(Ordering::Acquire)
}

fn wrmsr(msr: u32, value: u64) {
    let lo = value as u32;
    let hi = (value >> 32) as u32;
    unsafe {
        asm!("wrmsr", in("ecx") msr, in("eax") lo, in("edx") hi, options(att_syntax));
    }
}

/// Read a model-specific register. Used by `kernel::cpu` to find the local
/// APIC's physical MMIO base (`IA32_APIC_BASE`) without needing an ACPI
/// table walk.
pub fn rdmsr(msr: u32) -> u64 {
    let lo: u32;
    let hi: u32;
    unsafe {
        asm!("rdmsr", in("ecx") msr, out("eax") lo, out("edx") hi, options(att_syntax));
    }
    (hi as u64) << 32 | lo as u64
}

/// Point `%gs` at `base` for the calling CPU, and additionally store the
/// pointer at `%gs:0` so that `current_ptr` can read it back with a single
/// segment-relative load rather than an `rdmsr`.
///
/// # Safety
/// Must run with interrupts disabled, on the CPU being initialized, and
/// `base` must stay valid forever (it points into a `'static` array slot).
pub unsafe fn init_current(base: NonNull<u8>) {
    wrmsr(IA32_GS_BASE, base.as_ptr() as u64);
    asm!(
        "movq {0}, %gs:0",
        in(reg) base.as_ptr(),
        options(att_syntax)
    );
    ANY_CPU_INITIALIZED.store(true, Ordering::Release);
}

/// Reads the self-pointer stored at `%gs:0`.
pub fn current_ptr() -> *mut u8 {
    let ptr: u64;
    unsafe {
        asm!(
            "movq %gs:0, {0}",
            out(reg) ptr,
            options(att_syntax)
        );
    }
    ptr as *mut u8
}
