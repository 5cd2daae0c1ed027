#![cfg_attr(not(test), no_std)]

//! `println!`/`println_warn!`/`println_debug!` over a swappable sink,
//! generalized from the teacher's `crates/eonix_log/src/lib.rs`: the same
//! shape, rebuilt on this workspace's own [`ksync::SpinIrq`] instead of
//! `eonix_sync`/`eonix_spin_irq`.
//!
//! The sink itself (framebuffer, serial port) is an out-of-scope
//! collaborator per spec.md §1; this crate only owns the
//! `Arc<dyn ConsoleWrite>` indirection and the locking around it.

extern crate alloc;

use alloc::sync::Arc;
use core::fmt::{self, Write};
use ksync::SpinIrq;

pub trait ConsoleWrite: Send + Sync {
    fn write(&self, s: &str);
}

struct Console {
    sink: Option<Arc<dyn ConsoleWrite>>,
}

static CONSOLE: SpinIrq<Console> = SpinIrq::new(Console { sink: None });

impl Write for Console {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        if let Some(sink) = self.sink.as_ref() {
            sink.write(s);
        }
        Ok(())
    }
}

/// Installed once at boot by the framebuffer/serial collaborator.
pub fn set_console(console: Arc<dyn ConsoleWrite>) {
    CONSOLE.lock().sink.replace(console);
}

#[doc(hidden)]
pub fn do_print(args: fmt::Arguments) {
    let _ = CONSOLE.lock().write_fmt(args);
}

#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {
        $crate::do_print(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! println {
    () => {
        $crate::print!("\n")
    };
    ($($arg:tt)*) => {
        $crate::print!("{}\n", format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! println_warn {
    ($($arg:tt)*) => {
        $crate::println!("[kernel: warn] {}", format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! println_debug {
    ($($arg:tt)*) => {
        $crate::println!("[kernel:debug] {}", format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! println_info {
    ($($arg:tt)*) => {
        $crate::println!("[kernel: info] {}", format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! println_fatal {
    () => {
        $crate::println!("[kernel:fatal] ")
    };
    ($($arg:tt)*) => {
        $crate::println!("[kernel:fatal] {}", format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! println_trace {
    ($feat:literal) => {
        #[cfg(feature = $feat)]
        $crate::println!("[kernel:trace] ")
    };
    ($feat:literal, $($arg:tt)*) => {
        #[cfg(feature = $feat)]
        $crate::println!("[kernel:trace] {}", format_args!($($arg)*))
    };
}
