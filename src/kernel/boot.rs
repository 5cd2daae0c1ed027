//! The external boot contract (spec.md §6): everything the bootloader
//! collaborator hands the kernel before [`crate::kernel::init`] runs the
//! staged init targets. Grounded on `original_source/include/sys/boot.h`
//! (the memory-map/CPU-list shape) translated into owned, `'static`-lived
//! Rust collections instead of a C array-of-structs the loader hands over
//! raw.

use alloc::vec::Vec;
use kmm::PAddr;
use ksync::OnceLock;

/// One physical memory-map entry as the firmware/bootloader reported it,
/// before the PMM has reconciled it with the kernel image and early
/// allocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryMapEntry {
    pub base: PAddr,
    pub len: usize,
    pub usable: bool,
}

/// A CPU the bootloader/ACPI MADT enumerated, not yet brought up.
#[derive(Debug, Clone, Copy)]
pub struct CpuDescriptor {
    pub id: u32,
    pub lapic_id: u32,
    pub is_bsp: bool,
}

/// A segment of the kernel image itself, reported so the PMM can mark it
/// `RESERVED` instead of handing it out.
#[derive(Debug, Clone, Copy)]
pub struct KernelSegment {
    pub phys_base: PAddr,
    pub len: usize,
}

/// Linear framebuffer descriptor, if the bootloader set a graphical mode.
/// This crate never touches the bytes; it only threads the descriptor
/// through to whatever driver binds a [`klog::ConsoleWrite`] sink.
#[derive(Debug, Clone, Copy)]
pub struct FramebufferInfo {
    pub phys_base: PAddr,
    pub width: u32,
    pub height: u32,
    pub pitch: u32,
    pub bpp: u8,
}

/// A boot module (initrd, symbol file, ...) the loader staged in memory.
#[derive(Debug, Clone, Copy)]
pub struct ModuleInfo {
    pub phys_base: PAddr,
    pub len: usize,
}

/// Everything [`crate::kernel::init`] needs to bring the kernel up,
/// assembled once by the platform-specific entry point and consumed by the
/// staged init targets. Intentionally owns no behavior: it is a snapshot,
/// not a collaborator.
pub struct BootInfo {
    pub memory_map: Vec<MemoryMapEntry>,
    pub hhdm_offset: usize,
    pub hhdm_size: usize,
    pub bsp_index: usize,
    pub cpus: Vec<CpuDescriptor>,
    pub kernel_segments: Vec<KernelSegment>,
    pub framebuffer: Option<FramebufferInfo>,
    pub rsdp: Option<PAddr>,
    pub modules: Vec<ModuleInfo>,
}

impl BootInfo {
    pub fn bsp(&self) -> &CpuDescriptor {
        &self.cpus[self.bsp_index]
    }

    pub fn usable_regions(&self) -> impl Iterator<Item = &MemoryMapEntry> {
        self.memory_map.iter().filter(|e| e.usable)
    }
}

static BOOT_INFO: OnceLock<BootInfo> = OnceLock::new();

/// Stashes `info` for the staged init targets to read. Called exactly once,
/// by the platform entry point, before `kernel::init::run_bsp`.
pub fn set(info: BootInfo) {
    BOOT_INFO.get_or_init(|| info);
}

/// Panics if called before [`set`]: every init target that needs boot data
/// only ever runs after the entry point has stashed it.
pub fn get() -> &'static BootInfo {
    BOOT_INFO.get().expect("kernel::boot::set was never called")
}
