#![cfg_attr(not(test), no_std)]

mod lock;
mod once;

pub use lock::{Guard, Lock, LockStrategy, Preempt, PreemptIrq, Spin, SpinIrq};
pub use once::{LazyLock, OnceLock};
