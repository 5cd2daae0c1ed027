//! Per-CPU event timer (spec.md §4.8): a deadline-ordered tree of
//! one-shot callbacks, grounded on `original_source/include/sys/event.h` +
//! `kernel/sys/event.c`. Kept per-CPU (one [`EventQueue`] per
//! [`crate::kernel::cpu::Core`]) rather than global, matching the
//! reference kernel's per-CPU `struct timer_event_list`: a CPU only ever
//! cancels or fires events it scheduled on itself.
//!
//! Events are keyed by absolute deadline in a `BTreeMap` rather than a
//! hand-rolled red-black tree (the teacher's `intrusive-collections`
//! dependency is dropped along with it — nothing else in this workspace
//! needs an intrusive RB-tree, so a `BTreeMap` keyed by deadline is the
//! straightforward idiomatic choice here). Cancelling from hard-interrupt
//! context never touches the tree directly — deleting a node there would
//! mean deallocating in a context where that isn't safe — it just parks
//! the id in `cancelled`, reaped the next time [`EventQueue::schedule_at`]
//! or [`EventQueue::fire_due`] runs (spec.md §4.8's "free-later" list).
//!
//! Programming the LAPIC/HPET/PIT in one-shot mode is the "arm a timer"
//! external collaborator spec.md §1 carves out of this core's scope, so
//! [`arm_hardware`] is a stub: the earliest-deadline decision spec.md §4.8
//! describes ("insertion re-arms the hardware only if the new event
//! becomes the earliest"; `events_process` "arms the hardware for the next
//! earliest deadline") is computed here and handed to that seam on every
//! `schedule_at`/`fire_due`. The periodic BSP tick below still drives
//! `fire_due` itself — without a real one-shot LAPIC timer driver in this
//! workspace's `arch` crate, something has to keep calling it — so it
//! remains as the actual wakeup mechanism underneath the decision logic.

use alloc::boxed::Box;
use alloc::collections::{BTreeMap, BTreeSet};
use core::sync::atomic::{AtomicU64, Ordering};
use ksync::SpinIrq;

/// Nanoseconds since boot. Advanced once per BSP timer tick; APs read it,
/// only the BSP writes it (mirrors the reference kernel routing the PIT/
/// LAPIC periodic tick through CPU 0 alone).
static NOW_NS: AtomicU64 = AtomicU64::new(0);

pub const NS_PER_TICK: u64 = 1_000_000; // 1ms ticks.

/// The "arm a timer" collaborator from spec.md §1: programs whatever
/// hardware one-shot timer is available for the next earliest deadline, or
/// disarms it if `deadline_ns` is `None`. No-op until a real LAPIC/HPET
/// one-shot driver lands in `arch`; the periodic tick covers for it in the
/// meantime.
fn arm_hardware(_deadline_ns: Option<u64>) {}

pub fn now_ns() -> u64 {
    NOW_NS.load(Ordering::Acquire)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct EventId(u64);

struct Inner {
    tree: BTreeMap<u64, alloc::vec::Vec<(EventId, Box<dyn FnOnce() + Send>)>>,
    cancelled: BTreeSet<EventId>,
    next_id: u64,
}

impl Inner {
    /// Structurally removes every tree entry whose id is parked in
    /// `cancelled`, then empties the set. A no-op if nothing is parked.
    /// This is the actual reclaim spec.md §4.8 means by "reclaimed in
    /// `events_process`": a parked id that's never reached by `fire_due`
    /// (its event already fired, or its deadline is still far off) would
    /// otherwise sit in `cancelled` forever.
    fn reap_cancelled(&mut self) {
        if self.cancelled.is_empty() {
            return;
        }
        let cancelled = &self.cancelled;
        self.tree.retain(|_, bucket| {
            bucket.retain(|(id, _)| !cancelled.contains(id));
            !bucket.is_empty()
        });
        self.cancelled.clear();
    }
}

pub struct EventQueue {
    inner: SpinIrq<Inner>,
}

impl EventQueue {
    pub const fn new() -> Self {
        Self {
            inner: SpinIrq::new(Inner {
                tree: BTreeMap::new(),
                cancelled: BTreeSet::new(),
                next_id: 0,
            }),
        }
    }

    /// Schedule `f` to run (from timer-interrupt context, on this CPU)
    /// once `now_ns() >= deadline_ns`. Opportunistically drains the whole
    /// `cancelled` free-later set first when it's non-empty, matching the
    /// reference kernel's `event_queue`: a CPU already holding the lock to
    /// insert is a free place to reclaim ids parked by earlier hard-IRQ
    /// cancellations, rather than waiting for `fire_due` to get to them.
    pub fn schedule_at<F: FnOnce() + Send + 'static>(&self, deadline_ns: u64, f: F) -> EventId {
        let mut inner = self.inner.lock();
        inner.reap_cancelled();

        let id = EventId(inner.next_id);
        inner.next_id += 1;
        inner
            .tree
            .entry(deadline_ns)
            .or_default()
            .push((id, Box::new(f)));

        let becomes_earliest = inner.tree.keys().next() == Some(&deadline_ns);
        drop(inner);
        if becomes_earliest {
            arm_hardware(Some(deadline_ns));
        }

        id
    }

    pub fn schedule_after<F: FnOnce() + Send + 'static>(&self, delay_ns: u64, f: F) -> EventId {
        self.schedule_at(now_ns() + delay_ns, f)
    }

    /// Cancel a previously scheduled event. Safe to call from hard
    /// interrupt context: it only ever records the id for later reaping,
    /// never mutates the tree itself.
    pub fn cancel(&self, id: EventId) {
        self.inner.lock().cancelled.insert(id);
    }

    /// Queue the deferred-work item of every event whose deadline has
    /// passed, then reclaims the free-later set and arms the hardware for
    /// whatever deadline is now earliest (spec.md §4.8's `events_process`).
    /// Called from the timer interrupt handler (hard-IRQ context): per
    /// spec.md §4.8 a fired event's callback is never run here directly,
    /// only handed to [`crate::kernel::dw`] to run later with interrupts
    /// enabled.
    pub fn fire_due(&self, now: u64) {
        loop {
            let due = {
                let mut inner = self.inner.lock();
                let Some((&deadline, _)) = inner.tree.iter().next() else {
                    break;
                };
                if deadline > now {
                    break;
                }
                inner.tree.remove(&deadline).unwrap()
            };

            for (id, f) in due {
                let was_cancelled = {
                    let mut inner = self.inner.lock();
                    inner.cancelled.remove(&id)
                };
                if !was_cancelled {
                    crate::kernel::dw::schedule(f);
                }
            }
        }

        let mut inner = self.inner.lock();
        inner.reap_cancelled();
        let next_earliest = inner.tree.keys().next().copied();
        drop(inner);
        arm_hardware(next_earliest);
    }

    /// Publicly exposed reclaim pass, for callers outside the timer
    /// interrupt path that want to force a reap (e.g. before querying
    /// [`EventQueue::is_idle`]). `fire_due` already calls this on every
    /// pass; see [`Inner::reap_cancelled`] for what it actually does.
    pub fn reap_cancelled(&self) {
        self.inner.lock().reap_cancelled();
    }

    pub fn is_idle(&self) -> bool {
        let inner = self.inner.lock();
        inner.tree.is_empty()
    }
}

/// Advances the global clock and fires due events on the calling CPU.
/// Only the BSP's timer interrupt should drive the clock forward; every
/// CPU fires its own due events off the resulting `now_ns()`.
pub fn timer_interrupt(is_bsp: bool) {
    if is_bsp {
        NOW_NS.fetch_add(NS_PER_TICK, Ordering::AcqRel);
    }

    let now = now_ns();
    crate::kernel::cpu::current().timer.fire_due(now);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering as StdOrdering};
    use std::sync::Arc;

    #[test]
    fn cancelled_event_never_fires_even_if_never_reached_by_fire_due() {
        let q = EventQueue::new();
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();

        let id = q.schedule_at(1_000, move || fired2.store(true, StdOrdering::SeqCst));
        q.cancel(id);

        // Cancelling from hard-IRQ context only parks the id; nothing has
        // reached the tree entry yet.
        assert_eq!(q.inner.lock().tree.len(), 1);

        q.fire_due(2_000);
        assert!(!fired.load(StdOrdering::SeqCst));
    }

    #[test]
    fn schedule_at_drains_cancelled_and_removes_the_matching_tree_entry() {
        let q = EventQueue::new();
        let id = q.schedule_at(1_000, || {});
        q.cancel(id);

        q.schedule_at(2_000, || {});

        let inner = q.inner.lock();
        assert!(inner.cancelled.is_empty());
        assert!(!inner.tree.values().flatten().any(|(eid, _)| *eid == id));
    }

    #[test]
    fn fire_due_reaps_cancelled_ids_whose_deadline_is_still_far_off() {
        let q = EventQueue::new();
        let due_id = q.schedule_at(500, || {});
        let far_id = q.schedule_at(10_000, || {});
        q.cancel(far_id);

        q.fire_due(500);

        let inner = q.inner.lock();
        assert!(inner.cancelled.is_empty());
        assert!(!inner.tree.values().flatten().any(|(eid, _)| *eid == far_id));
        let _ = due_id;
    }

    #[test]
    fn is_idle_reflects_an_empty_tree() {
        let q = EventQueue::new();
        assert!(q.is_idle());
        let id = q.schedule_at(1_000, || {});
        assert!(!q.is_idle());
        q.cancel(id);
        q.reap_cancelled();
        assert!(q.is_idle());
    }
}
