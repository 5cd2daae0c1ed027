use core::arch::asm;

/// Callee-saved registers plus `rflags`, laid out in push order so the
/// trampoline below can be a straight line of pushes and pops.
#[repr(C)]
#[derive(Debug, Default)]
struct ContextSwitchFrame {
    r15: u64,
    r14: u64,
    r13: u64,
    r12: u64,
    rbx: u64,
    rbp: u64,
    rflags: u64,
    rip: u64,
}

/// Hardware state that survives a context switch. Extended (FP/SIMD) state
/// is saved/restored separately by whoever owns the FPU lazily-switching
/// policy, not here.
pub struct TaskContext {
    rsp: u64,
}

impl TaskContext {
    pub const fn new() -> Self {
        Self { rsp: 0 }
    }

    /// Prepare a brand new kernel stack so that the first `switch_to` into
    /// this context starts executing at `entry`.
    ///
    /// # Safety
    /// `kstack_top` must be the top (highest address, 16-byte aligned) of a
    /// stack allocation at least large enough for one `ContextSwitchFrame`.
    pub unsafe fn init(&mut self, entry: usize, kstack_top: usize) {
        let frame_ptr = (kstack_top as *mut ContextSwitchFrame).sub(1);
        core::ptr::write(
            frame_ptr,
            ContextSwitchFrame {
                rip: entry as u64,
                rflags: 0x200, // IF set: new threads start with interrupts enabled
                ..Default::default()
            },
        );
        self.rsp = frame_ptr as u64;
    }

    /// Switch from `self` to `next`, saving callee-saved registers and the
    /// kernel stack pointer of the outgoing context and restoring them for
    /// the incoming one.
    ///
    /// # Safety
    /// `next` must be a context previously initialized by [`init`](Self::init)
    /// or previously switched away from by this same function.
    #[inline(always)]
    pub unsafe fn switch_to(&mut self, next: &mut Self) {
        switch_to_raw(&mut self.rsp, &mut next.rsp);
    }

    /// Prepare a brand new kernel stack so that the first `switch_to` into
    /// this context drops straight into ring 3 at `entry`, running on
    /// `user_sp`.
    ///
    /// The `ContextSwitchFrame`'s `rip` points at [`user_entry_trampoline`]
    /// rather than directly at `entry`: `switch_to_raw`'s final `ret` only
    /// knows how to jump to executable code, so the trampoline sits between
    /// it and the `iretq` frame parked just below, which `switch_to_raw`
    /// leaves `%rsp` pointing at once that `ret` has popped the
    /// `ContextSwitchFrame` off.
    ///
    /// # Safety
    /// `kstack_top` must be the top (highest address, 16-byte aligned) of a
    /// stack allocation at least large enough for one `ContextSwitchFrame`
    /// plus one `IretqFrame`.
    pub unsafe fn init_user(&mut self, entry: usize, user_sp: usize, kstack_top: usize) {
        let iretq_ptr = (kstack_top as *mut IretqFrame).sub(1);
        core::ptr::write(
            iretq_ptr,
            IretqFrame {
                rip: entry as u64,
                cs: crate::gdt::USER_CS as u64,
                rflags: 0x202, // IF set, reserved bit 1 always set
                rsp: user_sp as u64,
                ss: crate::gdt::USER_DS as u64,
            },
        );

        let frame_ptr = (iretq_ptr as *mut ContextSwitchFrame).sub(1);
        core::ptr::write(
            frame_ptr,
            ContextSwitchFrame {
                rip: user_entry_trampoline as usize as u64,
                rflags: 0x200,
                ..Default::default()
            },
        );
        self.rsp = frame_ptr as u64;
    }
}

/// Hardware `iretq` frame, in the exact order the instruction expects to pop
/// it: `rip`, `cs`, `rflags`, `rsp`, `ss`.
#[repr(C)]
struct IretqFrame {
    rip: u64,
    cs: u64,
    rflags: u64,
    rsp: u64,
    ss: u64,
}

/// Landing pad for a thread's very first trip into userspace. Reached by
/// `switch_to_raw`'s `ret` with `%rsp` already pointing at an [`IretqFrame`]
/// built by [`TaskContext::init_user`]; data segment selectors are left as
/// whatever ring 0 loaded; long mode does not segment-check them, and `ss`
/// is restored by `iretq` itself.
#[naked]
unsafe extern "C" fn user_entry_trampoline() -> ! {
    asm!("iretq", options(att_syntax, noreturn));
}

#[naked]
unsafe extern "C" fn switch_to_raw(current_sp: &mut u64, next_sp: &mut u64) {
    asm!(
        "pushf",
        "push %rbp",
        "push %rbx",
        "push %r12",
        "push %r13",
        "push %r14",
        "push %r15",
        "mov %rsp, (%rdi)",
        "mov (%rsi), %rsp",
        "pop %r15",
        "pop %r14",
        "pop %r13",
        "pop %r12",
        "pop %rbx",
        "pop %rbp",
        "popf",
        "ret",
        options(att_syntax, noreturn),
    );
}
