//! Minimal local APIC register access: enough to send a fixed-vector IPI,
//! signal end-of-interrupt, and read the local APIC id. The MMIO window is
//! supplied by the kernel-core (it owns the HHDM mapping of the APIC's
//! physical base); this module only knows the register offsets.

use core::ptr::{read_volatile, write_volatile};

const REG_ID: usize = 0x020;
const REG_EOI: usize = 0x0b0;
const REG_SPURIOUS: usize = 0x0f0;
const REG_ICR_LOW: usize = 0x300;
const REG_ICR_HIGH: usize = 0x310;

const ICR_DELIVERY_FIXED: u32 = 0 << 8;
const ICR_DEST_PHYSICAL: u32 = 0 << 11;
const ICR_ASSERT: u32 = 1 << 14;
const ICR_LEVEL_EDGE: u32 = 0 << 15;

/// # Safety
/// `base` must be a valid pointer to the local APIC's 4KiB MMIO window,
/// mapped uncached, for as long as any `LocalApic` built from it is used.
#[derive(Clone, Copy)]
pub struct LocalApic {
    base: *mut u32,
}

unsafe impl Send for LocalApic {}
unsafe impl Sync for LocalApic {}

/// `IA32_APIC_BASE`: bits 12-35 hold the local APIC's physical MMIO base
/// (the low 12 bits, enable bit aside, are always zero since the window is
/// 4KiB-aligned).
const IA32_APIC_BASE_MSR: u32 = 0x1b;
const APIC_BASE_ADDR_MASK: u64 = 0x0000_000f_ffff_f000;

impl LocalApic {
    /// # Safety
    /// See the struct's safety section.
    pub const unsafe fn new(base: *mut u8) -> Self {
        Self { base: base as *mut u32 }
    }

    /// Discover the local APIC's MMIO window straight from `IA32_APIC_BASE`
    /// rather than walking an ACPI MADT (out of scope here, spec.md §1):
    /// the physical base is always identity-accessible through the HHDM,
    /// so the caller only needs to add the kernel's HHDM offset.
    ///
    /// # Safety
    /// `hhdm_offset` must be the offset of a direct map that covers the
    /// local APIC's physical page, mapped uncached.
    pub unsafe fn from_apic_base_msr(hhdm_offset: usize) -> Self {
        let apic_base = crate::percpu::rdmsr(IA32_APIC_BASE_MSR);
        let phys = (apic_base & APIC_BASE_ADDR_MASK) as usize;
        unsafe { Self::new((hhdm_offset + phys) as *mut u8) }
    }

    fn read(&self, reg: usize) -> u32 {
        unsafe { read_volatile(self.base.byte_add(reg)) }
    }

    fn write(&self, reg: usize, value: u32) {
        unsafe { write_volatile(self.base.byte_add(reg), value) };
    }

    pub fn id(&self) -> u32 {
        self.read(REG_ID) >> 24
    }

    /// Enable the local APIC and set the spurious-interrupt vector.
    pub fn enable(&self, spurious_vector: u8) {
        self.write(REG_SPURIOUS, 1 << 8 | spurious_vector as u32);
    }

    pub fn end_of_interrupt(&self) {
        self.write(REG_EOI, 0);
    }

    /// Send a fixed-vector, physical-destination IPI to `apic_id`. Returns
    /// once the CPU has accepted the write; it does not wait for the target
    /// to actually run the handler.
    pub fn send_ipi(&self, apic_id: u32, vector: u8) {
        self.write(REG_ICR_HIGH, apic_id << 24);
        self.write(
            REG_ICR_LOW,
            vector as u32 | ICR_DELIVERY_FIXED | ICR_DEST_PHYSICAL | ICR_ASSERT | ICR_LEVEL_EDGE,
        );
        while self.read(REG_ICR_LOW) & (1 << 12) != 0 {
            core::hint::spin_loop();
        }
    }
}
