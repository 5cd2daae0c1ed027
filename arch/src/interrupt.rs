use core::arch::{asm, global_asm};

/// Saved register state at trap entry, readable/writable by the kernel-core
/// dispatch hook (e.g. to change the return address, or inspect a fault's
/// `cr2`-equivalent `error_code`/`int_no`).
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct InterruptContext {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rbp: u64,

    pub int_no: u64,
    pub error_code: u64,

    // Pushed by the CPU itself.
    pub rip: u64,
    pub cs: u64,
    pub eflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

pub fn enable_irqs() {
    unsafe { asm!("sti", options(nomem, nostack)) }
}

pub fn disable_irqs() {
    unsafe { asm!("cli", options(nomem, nostack)) }
}

pub fn irqs_enabled() -> bool {
    let flags: u64;
    unsafe {
        asm!("pushf", "pop {0}", out(reg) flags, options(nomem));
    }
    flags & 0x200 != 0
}

#[repr(C, packed)]
struct IdtEntry {
    offset_low: u16,
    selector: u16,
    ist: u8,
    type_attr: u8,
    offset_mid: u16,
    offset_high: u32,
    reserved: u32,
}

impl IdtEntry {
    const fn missing() -> Self {
        Self {
            offset_low: 0,
            selector: 0,
            ist: 0,
            type_attr: 0,
            offset_mid: 0,
            offset_high: 0,
            reserved: 0,
        }
    }

    fn set(&mut self, handler: usize, ist: u8) {
        self.offset_low = handler as u16;
        self.offset_mid = (handler >> 16) as u16;
        self.offset_high = (handler >> 32) as u32;
        self.selector = 0x08; // kernel code64 selector, matches Gdt layout
        self.ist = ist & 0x7;
        self.type_attr = 0x8e; // present, ring 0, 64-bit interrupt gate
    }
}

const IDT_LEN: usize = 256;

#[repr(C, align(16))]
pub struct Idt([IdtEntry; IDT_LEN]);

impl Idt {
    pub const fn new() -> Self {
        Self([const { IdtEntry::missing() }; IDT_LEN])
    }

    /// Wire every vector to the shared trampoline (`isr_stub_table`,
    /// generated below), using `ist` for the small set of priority classes
    /// that must never run on a possibly-corrupted stack (see
    /// [`crate::gdt::IST_CRITICAL`]); every other vector runs on the
    /// current stack (`ist = 0`).
    pub fn init_defaults(&mut self, critical_vectors: &[u8]) {
        for vec in 0..IDT_LEN {
            let handler = unsafe { isr_stub_table[vec] };
            let ist = if critical_vectors.contains(&(vec as u8)) {
                crate::gdt::IST_CRITICAL
            } else {
                0
            };
            self.0[vec].set(handler, ist);
        }
    }

    /// # Safety
    /// `self` must outlive every future use of this CPU's IDT, i.e. it must
    /// live in the CPU's (never-freed) local record.
    pub unsafe fn load(&self) {
        let limit = (IDT_LEN * size_of::<IdtEntry>() - 1) as u16;
        let descriptor: [u64; 2] = [(limit as u64) << 48, self.0.as_ptr() as u64];
        let descriptor_addr = &descriptor as *const _ as usize + 6;
        asm!("lidt ({0})", in(reg) descriptor_addr, options(att_syntax));
    }
}

/// Installed by the kernel-core interrupt/IPL layer; called with interrupts
/// disabled on the vector's designated stack.
pub type TrapHandler = extern "C" fn(&mut InterruptContext);

static mut TRAP_HANDLER: Option<TrapHandler> = None;

/// # Safety
/// Must be called before `sti` runs anywhere, and only once (there is a
/// single global dispatch entry point; per-vector routing happens on the
/// Rust side inside the installed handler).
pub unsafe fn set_trap_handler(handler: TrapHandler) {
    TRAP_HANDLER = Some(handler);
}

#[no_mangle]
extern "C" fn isr_common_rust(ctx: &mut InterruptContext) {
    let handler = unsafe { TRAP_HANDLER }.expect("trap handler not installed");
    handler(ctx);
}

global_asm!(
    r#"
    .altmacro
    .macro isr_stub vec, has_err
    .align 16
    isr_stub_\vec:
        .if \has_err == 0
        pushq $0
        .endif
        pushq ${vec}
        push %rbp
        push %r15
        push %r14
        push %r13
        push %r12
        push %r11
        push %r10
        push %r9
        push %r8
        push %rsi
        push %rdi
        push %rdx
        push %rcx
        push %rbx
        push %rax
        mov %rsp, %rdi
        call isr_common_rust
        pop %rax
        pop %rbx
        pop %rcx
        pop %rdx
        pop %rdi
        pop %rsi
        pop %r8
        pop %r9
        pop %r10
        pop %r11
        pop %r12
        pop %r13
        pop %r14
        pop %r15
        pop %rbp
        add $16, %rsp
        iretq
    .endm

    .set i, 0
    .rept 256
        .if i == 8 || i == 10 || i == 11 || i == 12 || i == 13 || i == 14 || i == 17 || i == 21
            isr_stub %i, 1
        .else
            isr_stub %i, 0
        .endif
    .set i, i+1
    .endr

    .section .rodata
    .align 8
    isr_stub_table:
    .set i, 0
    .rept 256
        .quad isr_stub_%i
    .set i, i+1
    .endr
    .text
    "#,
    options(att_syntax),
);

extern "C" {
    static isr_stub_table: [usize; IDT_LEN];
}
