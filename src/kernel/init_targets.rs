//! Wires the staged [`super::init`] registry to this crate's actual
//! subsystems. Kept as its own module rather than inlined at the call site
//! so the dependency graph between memory, interrupt and scheduling
//! bring-up reads as a flat list instead of being buried in the platform
//! entry point.
//!
//! CPU-identity-dependent bring-up (the `%gs` self-pointer, the per-CPU
//! GDT/TSS/IDT) is deliberately *not* represented here: `init::Target`
//! handlers take no arguments, and that bring-up has to run before the
//! first lock acquisition anywhere in this crate (every [`ksync::Lock`]
//! strategy touches the preempt counter behind `%gs`). It happens as a
//! direct call in `kernel_main`/`ap_main`, before [`super::init::run_bsp`]
//! or [`super::init::run_ap`] ever runs.

use super::init::{register, Scope, Stage, Target};
use super::{boot, cpu, interrupt, mem};

fn init_pmm() {
    mem::pmm::init(boot::get());
}

fn init_kheap() {
    mem::kheap::init(boot::get());
}

fn init_slab() {
    mem::slab::init(boot::get());
}

fn init_ptm_global_address_space() {
    mem::ptm::init_global_address_space();
}

fn init_page_fault_handler() {
    mem::ptm::install_page_fault_handler();
}

fn init_vm_kernel_address_space() {
    mem::vm::init();
}

fn init_interrupt_dispatch() {
    interrupt::install_dispatch();
}

fn init_tlb() {
    let lapic = unsafe { arch::lapic::LocalApic::from_apic_base_msr(boot::get().hhdm_offset) };
    lapic.enable(interrupt::SPURIOUS_VECTOR);
    mem::tlb::init(lapic);
}

fn init_task_this_cpu() {
    let is_bsp = cpu::current().id() == boot::get().bsp().id;
    super::task::init_this_cpu(is_bsp);
}

fn mark_this_cpu_online() {
    let core = cpu::current();
    let apic_id = boot::get()
        .cpus
        .iter()
        .find(|c| c.id == core.id())
        .map(|c| c.lapic_id)
        .unwrap_or(core.id());
    mem::tlb::mark_cpu_online(core.id(), apic_id);
}

/// Registers every staged target. Must run exactly once, on the BSP,
/// before the first call to [`super::init::run_bsp`].
pub fn register_all() {
    register(Target {
        name: "pmm",
        stage: Stage::Boot,
        scope: Scope::Bsp,
        depends_on: &[],
        handler: init_pmm,
    });
    register(Target {
        name: "kheap",
        stage: Stage::Boot,
        scope: Scope::Bsp,
        depends_on: &["pmm"],
        handler: init_kheap,
    });
    register(Target {
        name: "slab",
        stage: Stage::Boot,
        scope: Scope::Bsp,
        depends_on: &["pmm"],
        handler: init_slab,
    });
    register(Target {
        name: "interrupt_dispatch",
        stage: Stage::Boot,
        scope: Scope::Bsp,
        depends_on: &[],
        handler: init_interrupt_dispatch,
    });
    register(Target {
        name: "ptm_global_address_space",
        stage: Stage::Early,
        scope: Scope::Bsp,
        depends_on: &["pmm", "slab"],
        handler: init_ptm_global_address_space,
    });
    register(Target {
        name: "page_fault_handler",
        stage: Stage::Early,
        scope: Scope::Bsp,
        depends_on: &["ptm_global_address_space", "interrupt_dispatch"],
        handler: init_page_fault_handler,
    });
    register(Target {
        name: "vm_kernel_address_space",
        stage: Stage::Early,
        scope: Scope::Bsp,
        depends_on: &["ptm_global_address_space"],
        handler: init_vm_kernel_address_space,
    });
    register(Target {
        name: "tlb",
        stage: Stage::Early,
        scope: Scope::Bsp,
        depends_on: &["interrupt_dispatch"],
        handler: init_tlb,
    });
    register(Target {
        name: "task_this_cpu",
        stage: Stage::Main,
        scope: Scope::AllCpus,
        depends_on: &[],
        handler: init_task_this_cpu,
    });
    register(Target {
        name: "mark_cpu_online",
        stage: Stage::Main,
        scope: Scope::AllCpus,
        depends_on: &["task_this_cpu"],
        handler: mark_this_cpu_online,
    });
}
