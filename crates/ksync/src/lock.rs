use core::cell::UnsafeCell;
use core::hint;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

/// What a lock does besides the spin itself: disable preemption, and
/// optionally interrupts, for as long as the lock is held. Implementors
/// must guarantee `on_lock`/`on_unlock` are balanced and non-reentrant.
///
/// # Safety
/// `on_unlock` must restore exactly the state `on_lock` observed, using the
/// context it returned.
pub unsafe trait LockStrategy {
    type GuardContext;

    fn on_lock() -> Self::GuardContext;

    /// # Safety
    /// Must only be called once, with the context returned by the matching
    /// `on_lock`.
    unsafe fn on_unlock(ctx: Self::GuardContext);
}

/// Disables preemption on the owning CPU for the duration of the critical
/// section. Does not touch the interrupt flag: an interrupt handler that
/// tries to take the same lock will spin forever on this CPU, so this
/// strategy must never be used to protect data also touched from interrupt
/// context (use [`PreemptIrq`] there).
pub struct Preempt;

unsafe impl LockStrategy for Preempt {
    type GuardContext = ();

    fn on_lock() {
        percpu::preempt::disable();
    }

    unsafe fn on_unlock(_ctx: ()) {
        percpu::preempt::enable();
    }
}

/// Disables both preemption and interrupts. Safe to use for data shared
/// with interrupt handlers (the TLB shootdown state, the deferred-work
/// queue, the event tree).
pub struct PreemptIrq;

unsafe impl LockStrategy for PreemptIrq {
    /// Whether interrupts were enabled before we disabled them, so we only
    /// re-enable if they were on in the first place (nested locks of this
    /// kind must not turn interrupts on early).
    type GuardContext = bool;

    fn on_lock() -> bool {
        let was_enabled = arch::interrupt::irqs_enabled();
        arch::interrupt::disable_irqs();
        percpu::preempt::disable();
        was_enabled
    }

    unsafe fn on_unlock(was_enabled: bool) {
        percpu::preempt::enable();
        if was_enabled {
            arch::interrupt::enable_irqs();
        }
    }
}

pub struct Lock<T: ?Sized, S: LockStrategy = Preempt> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
    _strategy: core::marker::PhantomData<S>,
}

unsafe impl<T: ?Sized + Send, S: LockStrategy> Send for Lock<T, S> {}
unsafe impl<T: ?Sized + Send, S: LockStrategy> Sync for Lock<T, S> {}

impl<T, S: LockStrategy> Lock<T, S> {
    pub const fn new(data: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(data),
            _strategy: core::marker::PhantomData,
        }
    }
}

impl<T: ?Sized, S: LockStrategy> Lock<T, S> {
    pub fn lock(&self) -> Guard<'_, T, S> {
        let ctx = S::on_lock();
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.locked.load(Ordering::Relaxed) {
                hint::spin_loop();
            }
        }
        Guard { lock: self, ctx: Some(ctx) }
    }

    pub fn try_lock(&self) -> Option<Guard<'_, T, S>> {
        let ctx = S::on_lock();
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(Guard { lock: self, ctx: Some(ctx) })
        } else {
            unsafe { S::on_unlock(ctx) };
            None
        }
    }

    /// # Safety
    /// The caller must already hold whatever external exclusion this lock
    /// would otherwise provide (used only at boot, before other CPUs run).
    pub unsafe fn get_mut_unchecked(&self) -> &mut T {
        &mut *self.data.get()
    }
}

pub struct Guard<'a, T: ?Sized, S: LockStrategy> {
    lock: &'a Lock<T, S>,
    ctx: Option<S::GuardContext>,
}

impl<'a, T: ?Sized, S: LockStrategy> Deref for Guard<'a, T, S> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T: ?Sized, S: LockStrategy> DerefMut for Guard<'a, T, S> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<'a, T: ?Sized, S: LockStrategy> Drop for Guard<'a, T, S> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
        unsafe { S::on_unlock(self.ctx.take().unwrap()) };
    }
}

pub type Spin<T> = Lock<T, Preempt>;
pub type SpinIrq<T> = Lock<T, PreemptIrq>;
