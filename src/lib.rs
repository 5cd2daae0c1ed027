#![cfg_attr(not(test), no_std)]
#![feature(alloc_error_handler)]

//! Entry surface for this kernel-core `staticlib` (spec.md §1: boot-info
//! parsing belongs to whatever external loader links this archive into a
//! bootable image; this crate only needs a fully populated
//! [`kernel::boot::BootInfo`] handed to it). Grounded on the teacher's own
//! `src/lib.rs` bring-up shape (`#[eonix_hal::main]`/`#[eonix_hal::ap_main]`
//! splitting BSP from AP bring-up, SSE enable, then dropping into a
//! never-returning main loop) with the process/VFS/driver bring-up that
//! followed it in the teacher dropped along with those subsystems (see
//! DESIGN.md).

extern crate alloc;

mod kernel;
mod panic;
mod prelude;

use kernel::boot::BootInfo;

/// Brings up the architecture-level state that every later line of kernel
/// code depends on just to run at all: the `%gs`-based per-CPU self
/// pointer, and this CPU's own GDT/TSS/IDT (spec.md §4.9's IST-critical
/// stack in particular must be live before `sti`, since the TLB shootdown
/// IPI and other critical-priority vectors use it unconditionally).
///
/// # Safety
/// Must run on the CPU being brought up, exactly once, with interrupts
/// still disabled (the architecture starts that way; nothing here turns
/// them on).
unsafe fn cpu_bringup(id: u32) -> &'static kernel::cpu::Core {
    arch::io::enable_sse();
    let core = unsafe { kernel::cpu::init_this_cpu(id as usize) };
    unsafe { core.arch_bringup() };
    core
}

/// Entry point for the bootstrap processor. The loader calls this exactly
/// once, with interrupts disabled, after constructing `boot_info` from
/// whatever boot protocol it speaks.
pub fn kernel_main(boot_info: BootInfo) -> ! {
    let bsp_id = boot_info.bsp().id;
    kernel::boot::set(boot_info);

    unsafe { cpu_bringup(bsp_id) };

    kernel::init_targets::register_all();
    kernel::init::run_bsp();

    kernel::interrupt::enable();
    kernel::task::run_idle_on_this_cpu()
}

/// Entry point for an application processor, called once per AP after the
/// loader's SMP bring-up has sent it the startup IPI. Must not run before
/// [`kernel_main`] has finished registering and running the BSP-scoped
/// init targets, since `kernel::init::run_ap` replays the same registry's
/// `AllCpus`-scoped targets against an already-populated list.
pub fn ap_main(id: u32) -> ! {
    unsafe { cpu_bringup(id) };

    kernel::init::run_ap();

    kernel::interrupt::enable();
    kernel::task::run_idle_on_this_cpu()
}
