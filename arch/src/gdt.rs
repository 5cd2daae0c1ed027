use core::arch::asm;

#[repr(transparent)]
#[derive(Debug, Clone, Copy)]
pub struct GdtEntry(u64);

impl GdtEntry {
    const NULL: Self = Self(0);
    const KERNEL_CODE64: Self = Self::new(0, 0, 0x9a, 0x2);
    const KERNEL_DATA64: Self = Self::new(0, 0, 0x92, 0x0);
    /// Ring-3 data/code, DPL=3 (access byte bit 5-6). Used only by the
    /// first-entry-to-userspace trampoline in `context.rs`; everything
    /// else in this kernel-core runs at ring 0.
    const USER_DATA64: Self = Self::new(0, 0, 0xf2, 0x0);
    const USER_CODE64: Self = Self::new(0, 0, 0xfa, 0x2);

    pub const fn new(base: u32, limit: u32, access: u8, flags: u8) -> Self {
        let mut entry = 0u64;
        entry |= (limit & 0x0000_ffff) as u64;
        entry |= ((limit & 0x000f_0000) as u64) << 32;
        entry |= ((base & 0x00ff_ffff) as u64) << 16;
        entry |= ((base & 0xff00_0000) as u64) << 32;
        entry |= (access as u64) << 40;
        entry |= (flags as u64) << 52;
        Self(entry)
    }

    const fn new_tss(base: u64, limit: u32) -> [Self; 2] {
        let first = Self::new(base as u32, limit, 0x89, 0x0);
        let second = Self(base >> 32);
        [first, second]
    }
}

/// The seven interrupt-stack slots available to the IDT's IST field.
/// Index 0 ("IST1") is reserved for non-maskable/critical-priority traps
/// that must never run on a possibly-corrupted kernel stack; the rest are
/// free for the kernel-core IPL layer to assign as needed.
pub const IST_CRITICAL: u8 = 1;

#[repr(C, packed)]
pub struct Tss {
    _reserved0: u32,
    rsp: [u64; 3],
    _reserved1: u64,
    ist: [u64; 7],
    _reserved2: u64,
    _reserved3: u16,
    iomap_base: u16,
}

impl Tss {
    pub const fn new() -> Self {
        Self {
            _reserved0: 0,
            rsp: [0; 3],
            _reserved1: 0,
            ist: [0; 7],
            _reserved2: 0,
            _reserved3: 0,
            iomap_base: size_of::<Tss>() as u16,
        }
    }

    pub fn set_rsp0(&mut self, rsp: u64) {
        self.rsp[0] = rsp;
    }

    /// `ist` is 1-based per the IDT/TSS convention (0 means "don't switch
    /// stacks").
    pub fn set_ist(&mut self, ist: u8, stack_top: u64) {
        assert!((1..=7).contains(&ist));
        self.ist[ist as usize - 1] = stack_top;
    }
}

const GDT_LEN: usize = 7;
const TSS_INDEX: usize = 5;

pub const KERNEL_CS: u16 = 1 * 8;
pub const KERNEL_DS: u16 = 2 * 8;
/// RPL=3 baked into the selector, matching how `iretq` expects it.
pub const USER_DS: u16 = 3 * 8 | 3;
pub const USER_CS: u16 = 4 * 8 | 3;

#[repr(C, align(16))]
pub struct Gdt([GdtEntry; GDT_LEN]);

impl Gdt {
    pub const fn new() -> Self {
        Self([GdtEntry::NULL; GDT_LEN])
    }

    pub fn set_tss(&mut self, tss: &Tss) {
        let entries = GdtEntry::new_tss(tss as *const _ as u64, size_of::<Tss>() as u32 - 1);
        self.0[TSS_INDEX] = entries[0];
        self.0[TSS_INDEX + 1] = entries[1];
    }

    /// Load this GDT and the TSS selector it carries at `TSS_INDEX`.
    ///
    /// # Safety
    /// `self` must outlive every future `lgdt`/`ltr` on this CPU, i.e. it
    /// must live in the CPU's (never-freed) local record.
    pub unsafe fn load(&mut self) {
        self.0[1] = GdtEntry::KERNEL_CODE64;
        self.0[2] = GdtEntry::KERNEL_DATA64;
        self.0[3] = GdtEntry::USER_DATA64;
        self.0[4] = GdtEntry::USER_CODE64;

        let limit = (GDT_LEN * 8 - 1) as u16;
        let descriptor: [u64; 2] = [(limit as u64) << 48, self.0.as_ptr() as u64];
        let descriptor_addr = &descriptor as *const _ as usize + 6;

        asm!(
            "lgdt ({0})",
            "mov $0x10, %ax",
            "mov %ax, %ds",
            "mov %ax, %es",
            "mov %ax, %ss",
            "ltr %cx",
            in(reg) descriptor_addr,
            in("cx") (TSS_INDEX as u16) * 8,
            out("ax") _,
            options(att_syntax),
        );
    }
}
