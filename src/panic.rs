//! The `#[panic_handler]` lang item. Must live at the crate root of
//! whichever binary is linked last; the actual dump logic is
//! `kernel::panic::dump_and_freeze`. Gated out under `cfg(test)`: the host
//! test harness supplies its own via std, and a second `#[panic_handler]`
//! would conflict with it.

#[cfg(not(test))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    crate::kernel::panic::dump_and_freeze(info)
}
