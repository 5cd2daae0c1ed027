//! Deferred work (spec.md §4.7): a bottom-half queue for work an interrupt
//! handler wants to run with interrupts enabled and out of hard-IRQ
//! context, without waiting for the next timer tick. Grounded on
//! `original_source/include/sys/dw.h` + `kernel/sys/dw.c`: a disable
//! counter gates draining, and re-enabling it to zero while the queue is
//! non-empty drains immediately instead of waiting for the next natural
//! drain point.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use ksync::SpinIrq;

/// Per-CPU deferred-work queue, one instance living in
/// [`crate::kernel::cpu::Core`]. Kept per-CPU (rather than global) so
/// draining it never needs cross-CPU synchronization: an interrupt handler
/// always schedules work onto the CPU it is running on.
pub struct Queue {
    items: SpinIrq<VecDeque<Box<dyn FnOnce() + Send>>>,
}

impl Queue {
    pub const fn new() -> Self {
        Self {
            items: SpinIrq::new(VecDeque::new()),
        }
    }

    fn push(&self, item: Box<dyn FnOnce() + Send>) {
        self.items.lock().push_back(item);
    }

    fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Runs every queued item, including ones scheduled by an item that
    /// ran earlier in the same drain.
    fn drain(&self) {
        loop {
            let item = self.items.lock().pop_front();
            match item {
                Some(f) => f(),
                None => break,
            }
        }
    }
}

/// Queue `f` to run on the calling CPU once deferred work is next enabled
/// (immediately, if it already is).
pub fn schedule<F: FnOnce() + Send + 'static>(f: F) {
    let core = crate::kernel::cpu::current();
    core.dw.push(Box::new(f));
    if percpu::current().dw_enabled() {
        core.dw.drain();
    }
}

/// Disable draining on the calling CPU. Nestable: work scheduled while
/// disabled waits for the matching number of [`enable`] calls.
pub fn disable() {
    percpu::current().dw_status_disable();
}

/// Re-enable draining on the calling CPU. If the counter reaches zero and
/// the queue is non-empty, drains immediately rather than waiting for the
/// next natural drain point (an interrupt return, say).
pub fn enable() {
    let now_enabled = percpu::current().dw_status_enable() == 0;
    let core = crate::kernel::cpu::current();
    if now_enabled && !core.dw.is_empty() {
        core.dw.drain();
    }
}
