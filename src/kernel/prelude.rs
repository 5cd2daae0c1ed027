//! Error handling (spec.md "REDESIGN FLAGS"/ambient error-handling):
//! recoverable APIs return `Result<T, Error>` where `Error` is a small
//! POSIX-flavoured errno subset, directly modeled on the teacher's own
//! `prelude.rs` and the errno constants it carried in
//! `src/kernel/constants.rs` pre-trim. Allocator exhaustion and other
//! invariant violations still panic (`kernel::panic` renders the dump);
//! this type is only for calls with a legitimate, recoverable failure
//! mode.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Error {
    /// Invalid argument (bad alignment, zero length, ...).
    EInval = 22,
    /// Out of memory (PMM/slab exhaustion that a caller asked to handle
    /// rather than treat as fatal).
    ENoMem = 12,
    /// The requested mapping would collide with an existing one and
    /// `Flags::fixed` was set.
    EExist = 17,
    /// A faulting address has no backing region.
    EFault = 14,
    /// Requested range doesn't fit inside the address space's bounds.
    ENoSpc = 28,
}

pub type KResult<T> = Result<T, Error>;
