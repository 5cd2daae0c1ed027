//! The scheduler (spec.md §4.6): bare kernel threads, processes, and one
//! ready queue per CPU.

pub mod process;
mod reaper;
pub mod scheduler;
pub mod thread;

pub use process::Process;
pub use scheduler::{schedule as schedule_away, schedule_noreturn};
pub use thread::{Thread, ThreadState};

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, Ordering};

/// Round-robin cursor for the thread-creation factory (spec.md §4.6: "Each
/// thread has an affinity set by the factory, round-robin across CPUs").
static NEXT_AFFINITY: AtomicU32 = AtomicU32::new(0);

fn next_affinity() -> u32 {
    let online = crate::kernel::mem::tlb::online_cpu_count().max(1) as u32;
    NEXT_AFFINITY.fetch_add(1, Ordering::Relaxed) % online
}

/// Creates a new kernel thread, assigns it a CPU by round robin, and puts
/// it on that CPU's ready queue.
pub fn thread_create_kernel(entry: extern "C" fn() -> !) -> Arc<Thread> {
    let affinity = next_affinity();
    let thread = Thread::new_kernel(entry, affinity);
    place(&thread);
    thread
}

/// Creates a new thread inside `process` that starts in ring 3 at
/// `entry_ip` on `user_sp`, assigns it a CPU by round robin, and puts it on
/// that CPU's ready queue.
pub fn thread_create_user(process: Arc<Process>, entry_ip: usize, user_sp: usize) -> Arc<Thread> {
    let affinity = next_affinity();
    let thread = Thread::new_user(process, entry_ip, user_sp, affinity);
    place(&thread);
    thread
}

fn place(thread: &Arc<Thread>) {
    let cpu = crate::kernel::cpu::by_id(thread.affinity)
        .expect("thread factory assigned an affinity with no matching online cpu");
    cpu.scheduler.place_new(thread);
}

/// The thread currently running on the calling CPU.
pub fn current() -> Arc<Thread> {
    crate::kernel::cpu::current().scheduler.current()
}

/// Puts the calling thread into `new_state` and gives up the CPU. Callers
/// already holding a lock must drop it first; control may not return here
/// for an arbitrarily long time.
pub fn yield_with(new_state: ThreadState) {
    let cpu = crate::kernel::cpu::current();
    let current = cpu.scheduler.current();
    match new_state {
        ThreadState::Ready => cpu.scheduler.put_ready(&current),
        ThreadState::USleep => cpu.scheduler.usleep(&current),
        ThreadState::ISleep => cpu.scheduler.isleep(&current),
        ThreadState::Zombie => exit(),
        ThreadState::Running => return,
    }
    percpu::preempt::disable();
    schedule_away();
}

/// Marks the calling thread `Zombie` and hands it to the reaper. Never
/// returns.
pub fn exit() -> ! {
    let cpu = crate::kernel::cpu::current();
    let current = cpu.scheduler.current();
    cpu.scheduler.set_zombie(&current);
    reaper::submit(current);
    schedule_noreturn()
}

/// Brings up the scheduler on the calling CPU: installs the idle thread
/// (blocking forever in [`scheduler::run_idle_on_this_cpu`]'s caller) and,
/// on the bootstrap CPU only, the global reaper thread and the
/// `percpu` yield hook. Call once per CPU, after `kernel::cpu::init_this_cpu`
/// and before enabling interrupts on that CPU.
pub fn init_this_cpu(is_bsp: bool) {
    if is_bsp {
        percpu::set_yield_hook(scheduler::yield_now);
        let reaper = reaper::spawn(crate::kernel::cpu::current().id());
        place(&reaper);
    }
}

pub use scheduler::run_idle_on_this_cpu;
