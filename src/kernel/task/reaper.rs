//! Zombie cleanup (spec.md §4.6). `Zombie` threads cannot free their own
//! kernel stack — they're still running on it — so `set_zombie` only
//! parks the thread on a global queue; one dedicated kernel thread per
//! system (not per CPU, since teardown is cheap and rare) drains it and
//! drops the last `Arc<Thread>` reference, which is what actually frees
//! the kernel stack, and tears down the owning process once every one of
//! its threads has been reaped.
//!
//! Grounded on the teacher's `reap_zombie`/`ProcessList` zombie handling
//! (`src/kernel/task/thread.rs`, `process_list.rs`, pre-trim), simplified
//! to a single global queue since this core has no wait()/exit-status
//! protocol for a parent to observe.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use ksync::{OnceLock, SpinIrq};

use super::thread::{Thread, ThreadState};

static QUEUE: SpinIrq<VecDeque<Arc<Thread>>> = SpinIrq::new(VecDeque::new());
static REAPER: OnceLock<Arc<Thread>> = OnceLock::new();

/// Hands a `Zombie` thread off for reaping, waking the reaper thread if it
/// was parked waiting for work. Safe to call from any context, including
/// interrupt context (the queue lock is a `SpinIrq`).
pub fn submit(thread: Arc<Thread>) {
    QUEUE.lock().push_back(thread);
    if let Some(reaper) = REAPER.get() {
        if let Some(cpu) = crate::kernel::cpu::by_id(reaper.affinity) {
            cpu.scheduler.iwake(reaper);
        }
    }
}

fn drain_one() -> Option<Arc<Thread>> {
    QUEUE.lock().pop_front()
}

fn reap(thread: Arc<Thread>) {
    debug_assert_eq!(thread.state(), ThreadState::Zombie);
    if let Some(process) = thread.process.clone() {
        let thread_id = thread.id;
        drop(thread);
        if process.forget(thread_id) {
            unsafe { process.destroy() };
        }
    } else {
        drop(thread);
    }
}

/// Body of the reaper kernel thread. Never returns.
extern "C" fn reaper_main() -> ! {
    loop {
        match drain_one() {
            Some(thread) => reap(thread),
            None => {
                let this = REAPER.get().expect("reaper_main running before its own thread was registered");
                let cpu = crate::kernel::cpu::current();
                cpu.scheduler.isleep(this);
                percpu::preempt::disable();
                cpu.scheduler.schedule();
            }
        }
    }
}

/// Creates and registers the reaper thread on the calling CPU. Called once
/// during kernel init, after the scheduler is up.
pub fn spawn(affinity: u32) -> Arc<Thread> {
    let thread = Thread::new_kernel(reaper_main, affinity);
    REAPER.get_or_init(|| thread.clone());
    thread
}
