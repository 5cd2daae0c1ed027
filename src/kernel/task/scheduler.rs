//! Per-CPU ready queue and context switch (spec.md §4.6). One
//! [`PerCpuScheduler`] lives inside each [`crate::kernel::cpu::Core`];
//! unlike the teacher's original single global `Scheduler` (grounded here
//! in `src/kernel/task/scheduler.rs` pre-trim, which tracked `IDLE_TASK`/
//! `CURRENT` in CPU-unsafe `static mut`s with `TODO!!!` markers asking for
//! exactly this generalization) a thread only ever moves between CPUs by
//! being placed on another CPU's ready queue, never preempted mid-switch
//! across CPUs. Preempt-counter and deferred-yield semantics follow
//! `original_source/kernel/sched/sched.c`'s `sched_preempt_inc/dec`.

use super::thread::{Thread, ThreadState};
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use ksync::{OnceLock, Spin, SpinIrq};

pub struct PerCpuScheduler {
    ready: SpinIrq<VecDeque<Arc<Thread>>>,
    current: Spin<Option<Arc<Thread>>>,
    idle: OnceLock<Arc<Thread>>,
}

impl PerCpuScheduler {
    pub const fn new() -> Self {
        Self {
            ready: SpinIrq::new(VecDeque::new()),
            current: Spin::new(None),
            idle: OnceLock::new(),
        }
    }

    /// Registers the idle thread for this CPU. Must run once, before
    /// [`schedule`] is ever called on this CPU. The idle thread is never
    /// placed on the ready queue; `idle_task` falls back to it directly.
    pub fn set_idle(&self, idle: Arc<Thread>) {
        self.idle.get_or_init(|| idle);
        self.current.lock().get_or_insert_with(|| self.idle_task().clone());
    }

    fn idle_task(&self) -> &Arc<Thread> {
        self.idle
            .get()
            .expect("PerCpuScheduler::set_idle was never called for this cpu")
    }

    pub fn current(&self) -> Arc<Thread> {
        self.current
            .lock()
            .clone()
            .expect("no current thread on this cpu yet")
    }

    fn enqueue(&self, thread: &Arc<Thread>) {
        self.ready.lock().push_back(thread.clone());
    }

    pub fn usleep(&self, thread: &Arc<Thread>) {
        thread.compare_and_set_state(ThreadState::Running, ThreadState::USleep);
    }

    pub fn uwake(&self, thread: &Arc<Thread>) {
        thread.compare_and_set_state(ThreadState::USleep, ThreadState::Ready);
        self.enqueue(thread);
    }

    pub fn isleep(&self, thread: &Arc<Thread>) {
        thread.compare_and_set_state(ThreadState::Running, ThreadState::ISleep);
    }

    /// Safe to call from hard interrupt context. A no-op if the thread has
    /// already been woken by a concurrent `uwake`.
    pub fn iwake(&self, thread: &Arc<Thread>) {
        match thread.state() {
            ThreadState::USleep => return,
            ThreadState::ISleep => {
                thread.set_state(ThreadState::Ready);
                self.enqueue(thread);
            }
            state => panic!("invalid transition from state {state:?} to `Ready`"),
        }
    }

    /// Put the `Running` thread back into `Ready` and enqueue it. Used for
    /// plain timeslice preemption, as opposed to a voluntary sleep.
    pub fn put_ready(&self, thread: &Arc<Thread>) {
        thread.compare_and_set_state(ThreadState::Running, ThreadState::Ready);
        self.enqueue(thread);
    }

    fn set_running(&self, thread: &Arc<Thread>) {
        thread.compare_and_set_state(ThreadState::Ready, ThreadState::Running);
    }

    pub fn set_zombie(&self, thread: &Arc<Thread>) {
        thread.compare_and_set_state(ThreadState::Running, ThreadState::Zombie);
    }

    /// Places a freshly created (still `Ready`) thread on this CPU's ready
    /// queue. Distinct from [`put_ready`](Self::put_ready) and
    /// [`uwake`](Self::uwake): there is no prior state to assert, the
    /// thread has simply never run yet.
    pub fn place_new(&self, thread: &Arc<Thread>) {
        self.enqueue(thread);
    }

    /// Give up the CPU. Call with `preempt::count() == 1`; the count is
    /// decremented by this function before it returns.
    ///
    /// # Safety
    /// Drop everything that owns a resource before calling this: control
    /// might not return here for an arbitrarily long time.
    pub fn schedule(&self) {
        assert_eq!(percpu::preempt::count(), 1, "schedule() called with preempt not held once");
        core::sync::atomic::compiler_fence(core::sync::atomic::Ordering::SeqCst);

        let from = self.current();
        unsafe { context_switch(&from, self.idle_task()) };
        percpu::preempt::enable();
    }

    pub fn schedule_noreturn(&self) -> ! {
        percpu::preempt::disable();
        self.schedule();
        panic!("PerCpuScheduler::schedule_noreturn: should never return")
    }

    /// The body of this CPU's idle thread: picks the next ready thread (if
    /// any) and switches to it, looping forever. Never called directly;
    /// installed as the idle thread's entry point by whoever brings this
    /// CPU up.
    fn idle_loop(&self) -> ! {
        loop {
            debug_assert_eq!(percpu::preempt::count(), 1);

            let current = self.current();
            if current.state() == ThreadState::Running {
                if self.ready.lock().is_empty() {
                    unsafe { context_switch(self.idle_task(), &current) };
                    continue;
                }
                self.put_ready(&current);
            }

            let next = match self.ready.lock().pop_front() {
                Some(next) => next,
                None => {
                    arch::halt();
                    continue;
                }
            };
            self.set_running(&next);
            *self.current.lock() = Some(next.clone());

            unsafe { context_switch(self.idle_task(), &next) };
        }
    }
}

unsafe fn context_switch(from: &Arc<Thread>, to: &Arc<Thread>) {
    unsafe { from.context_mut().switch_to(to.context_mut()) };
}

/// Schedules away from the current thread on the calling CPU.
pub fn schedule() {
    crate::kernel::cpu::current().scheduler.schedule();
}

pub fn schedule_noreturn() -> ! {
    crate::kernel::cpu::current().scheduler.schedule_noreturn()
}

/// Called from [`percpu::set_yield_hook`] whenever a deferred preemption
/// (spec.md §4.6) becomes due the instant the preempt count drops back to
/// zero. Puts the running thread back on its own CPU's ready queue and
/// gives up the CPU once; by construction this only ever runs with
/// `preempt::count() == 0`, so it must raise the count itself first.
pub fn yield_now() {
    percpu::preempt::disable();
    let cpu = crate::kernel::cpu::current();
    let current = cpu.scheduler.current();
    if current.state() == ThreadState::Running {
        cpu.scheduler.schedule();
    } else {
        percpu::preempt::enable();
    }
}

/// Spins up and installs this CPU's idle thread, then falls directly into
/// its loop. Called once per CPU at the end of that CPU's bring-up path;
/// never returns.
pub fn run_idle_on_this_cpu() -> ! {
    extern "C" fn idle_entry() -> ! {
        crate::kernel::cpu::current().scheduler.idle_loop()
    }

    let cpu_id = crate::kernel::cpu::current().id();
    let idle = Thread::new_idle(idle_entry, cpu_id);
    let scheduler = &crate::kernel::cpu::current().scheduler;
    scheduler.set_idle(idle);
    scheduler.idle_loop()
}
