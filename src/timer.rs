//! Monotonic-time min-ordered timer set: one-shot, recurring, and
//! conditional timers, plus clock-rollback detection.
//!
//! [`crate::io_manager::IOManager`] owns one [`TimerManager`] alongside its
//! [`crate::scheduler::Scheduler`], driving `drain_expired` once per idle
//! loop iteration and using [`TimerManager::set_on_first_changed`] to
//! `tickle()` itself awake when an insert lands ahead of whatever deadline
//! it was last waiting on.

use std::any::Any;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use crate::clock::monotonic_ms;

/// Sentinel `next_deadline_ms()` returns when no timer is pending.
pub const NO_DEADLINE: i64 = i64::MAX;

/// `original_source/zero/timer.cc`'s rollback window: a plain "more than an
/// hour back" diff, guarded by `now < previous_now` first so the
/// subtraction can't be reordered into nonsense around the i64 boundary.
const ROLLBACK_WINDOW_MS: i64 = 60 * 60 * 1000;

type Callback = Arc<dyn Fn() + Send + Sync>;

/// A single scheduled callback. Reference-counted: held by the manager's
/// ordered set while pending, and by whoever holds the [`TimerHandle`]
/// returned from `add_timer`.
pub struct Timer {
    id: u64,
    fire_time_ms: AtomicI64,
    interval_ms: i64,
    recurring: bool,
    original_start_ms: i64,
    callback: Mutex<Option<Callback>>,
    witness: Option<Weak<dyn Any + Send + Sync>>,
    manager: Weak<TimerManager>,
}

pub type TimerHandle = Arc<Timer>;

impl Timer {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_recurring(&self) -> bool {
        self.recurring
    }

    /// Absolute fire time in monotonic milliseconds, as of last insertion.
    pub fn fire_time_ms(&self) -> i64 {
        self.fire_time_ms.load(Ordering::SeqCst)
    }

    /// Clears the callback and removes this timer from its manager. A
    /// cancelled timer's callback is never invoked again, even if it was
    /// already popped and is awaiting firing on this same drain (the
    /// callback slot is what's checked, not set membership).
    pub fn cancel(self: &Arc<Self>) {
        if let Some(manager) = self.manager.upgrade() {
            manager.cancel_timer(self);
        } else {
            *self.callback.lock().unwrap() = None;
        }
    }

    /// Removes, recomputes fire time as `now + interval`, reinserts.
    pub fn refresh(self: &Arc<Self>) {
        if let Some(manager) = self.manager.upgrade() {
            manager.refresh_timer(self);
        }
    }

    /// Removes, recomputes fire time (`now + new_ms` if `from_now`,
    /// otherwise `original_start + new_ms`), reinserts.
    pub fn reset(self: &Arc<Self>, new_ms: i64, from_now: bool) {
        if let Some(manager) = self.manager.upgrade() {
            manager.reset_timer(self, new_ms, from_now);
        }
    }
}

/// Ordered by `(fire_time, id)`, per spec.md §3: fire time primary, stable
/// identity breaks ties.
struct TimerKey(Arc<Timer>);

impl PartialEq for TimerKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}
impl Eq for TimerKey {}
impl PartialOrd for TimerKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for TimerKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0
            .fire_time_ms
            .load(Ordering::SeqCst)
            .cmp(&other.0.fire_time_ms.load(Ordering::SeqCst))
            .then_with(|| self.0.id.cmp(&other.0.id))
    }
}

pub struct TimerManager {
    set: RwLock<BTreeSet<TimerKey>>,
    next_id: AtomicU64,
    previous_now: AtomicI64,
    /// Suppresses redundant `on_first_changed` notifications within a
    /// burst of inserts that all land ahead of the current front; reset
    /// whenever `next_deadline_ms` is next queried. Ported verbatim from
    /// the original's `m_tickled`.
    tickled: AtomicBool,
    on_first_changed: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
}

impl TimerManager {
    pub fn new() -> Arc<TimerManager> {
        Arc::new(TimerManager {
            set: RwLock::new(BTreeSet::new()),
            next_id: AtomicU64::new(1),
            previous_now: AtomicI64::new(monotonic_ms()),
            tickled: AtomicBool::new(false),
            on_first_changed: Mutex::new(None),
        })
    }

    /// Installs the callback invoked (outside any lock) the first time an
    /// insert changes the front of the set, once per "burst." `IOManager`
    /// wires this to `tickle()`.
    pub(crate) fn set_on_first_changed(&self, f: Box<dyn Fn() + Send + Sync>) {
        *self.on_first_changed.lock().unwrap() = Some(f);
    }

    /// Registers a timer firing `ms` milliseconds from now, repeating
    /// every `ms` if `recurring`.
    pub fn add_timer(self: &Arc<Self>, ms: i64, cb: impl Fn() + Send + Sync + 'static, recurring: bool) -> TimerHandle {
        self.insert_new(ms, Arc::new(cb), recurring, None)
    }

    /// Like [`add_timer`](Self::add_timer), but `cb` only runs if
    /// `witness` is still alive at fire time; once it isn't, the timer
    /// remains in the set (so a recurring one keeps its slot) with its
    /// callback reduced to a no-op until explicitly cancelled.
    pub fn add_conditional_timer(
        self: &Arc<Self>,
        ms: i64,
        cb: impl Fn() + Send + Sync + 'static,
        witness: Weak<dyn Any + Send + Sync>,
        recurring: bool,
    ) -> TimerHandle {
        self.insert_new(ms, Arc::new(cb), recurring, Some(witness))
    }

    fn insert_new(
        self: &Arc<Self>,
        ms: i64,
        cb: Callback,
        recurring: bool,
        witness: Option<Weak<dyn Any + Send + Sync>>,
    ) -> TimerHandle {
        let now = monotonic_ms();
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let timer = Arc::new(Timer {
            id,
            fire_time_ms: AtomicI64::new(now + ms),
            interval_ms: ms,
            recurring,
            original_start_ms: now,
            callback: Mutex::new(Some(cb)),
            witness,
            manager: Arc::downgrade(self),
        });
        self.insert_locked(timer.clone());
        timer
    }

    fn insert_locked(&self, timer: Arc<Timer>) {
        let became_front = {
            let mut set = self.set.write().unwrap();
            let is_new_front = set
                .iter()
                .next()
                .map_or(true, |front| timer.fire_time_ms.load(Ordering::SeqCst) < front.0.fire_time_ms.load(Ordering::SeqCst));
            set.insert(TimerKey(timer));
            is_new_front
        };
        // Only the insert that flips `tickled` false->true actually fires,
        // collapsing a burst of front-changing inserts into one notification.
        if became_front && !self.tickled.swap(true, Ordering::SeqCst) {
            if let Some(cb) = self.on_first_changed.lock().unwrap().as_ref() {
                cb();
            }
        }
    }

    fn cancel_timer(&self, timer: &Arc<Timer>) {
        *timer.callback.lock().unwrap() = None;
        self.set.write().unwrap().retain(|k| k.0.id != timer.id);
    }

    fn refresh_timer(&self, timer: &Arc<Timer>) {
        self.set.write().unwrap().retain(|k| k.0.id != timer.id);
        let now = monotonic_ms();
        timer.fire_time_ms.store(now + timer.interval_ms, Ordering::SeqCst);
        self.insert_locked(timer.clone());
    }

    fn reset_timer(&self, timer: &Arc<Timer>, new_ms: i64, from_now: bool) {
        self.set.write().unwrap().retain(|k| k.0.id != timer.id);
        let base = if from_now { monotonic_ms() } else { timer.original_start_ms };
        timer.fire_time_ms.store(base + new_ms, Ordering::SeqCst);
        self.insert_locked(timer.clone());
    }

    /// `0` if a timer is already due, the delta in milliseconds to the
    /// earliest timer otherwise, [`NO_DEADLINE`] if the set is empty.
    /// Querying this resets the tickle-suppression flag.
    pub fn next_deadline_ms(&self) -> i64 {
        self.tickled.store(false, Ordering::SeqCst);
        let set = self.set.read().unwrap();
        match set.iter().next() {
            None => NO_DEADLINE,
            Some(front) => {
                let fire = front.0.fire_time_ms.load(Ordering::SeqCst);
                let now = monotonic_ms();
                (fire - now).max(0)
            }
        }
    }

    /// Appends every expired timer's callback to `out`, reinserting
    /// recurring timers at `now + interval`. Uses the real monotonic
    /// clock; see [`drain_expired_at`](Self::drain_expired_at) for the
    /// explicit-clock variant tests use to simulate rollback.
    pub fn drain_expired(&self, out: &mut Vec<Box<dyn FnOnce() + Send>>) {
        self.drain_expired_at(monotonic_ms(), out);
    }

    /// Same as [`drain_expired`](Self::drain_expired) but takes `now`
    /// explicitly, so tests can simulate clock rollback without waiting on
    /// the real clock.
    pub fn drain_expired_at(&self, now: i64, out: &mut Vec<Box<dyn FnOnce() + Send>>) {
        let previous = self.previous_now.swap(now, Ordering::SeqCst);
        let rolled_back = now < previous && now < previous - ROLLBACK_WINDOW_MS;

        let expired = {
            let mut set = self.set.write().unwrap();
            let mut expired = Vec::new();
            loop {
                let due = match set.iter().next() {
                    None => false,
                    Some(front) => rolled_back || front.0.fire_time_ms.load(Ordering::SeqCst) <= now,
                };
                if !due {
                    break;
                }
                let TimerKey(timer) = set.pop_first().expect("checked non-empty above");
                expired.push(timer);
            }
            expired
        };

        for timer in expired {
            let cb = timer.callback.lock().unwrap().clone();
            let witness_alive = timer.witness.as_ref().map_or(true, |w| w.upgrade().is_some());
            if let Some(cb) = cb {
                if witness_alive {
                    out.push(Box::new(move || cb()));
                }
                if timer.recurring {
                    timer.fire_time_ms.store(now + timer.interval_ms, Ordering::SeqCst);
                    self.insert_locked(timer);
                }
            }
        }
    }

    /// True if no timer (recurring or not) remains registered.
    pub fn is_empty(&self) -> bool {
        self.set.read().unwrap().is_empty()
    }

    pub fn len(&self) -> usize {
        self.set.read().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn drain_expired_at_fires_due_timers_and_reinserts_recurring() {
        let manager = TimerManager::new();
        let fires = Arc::new(AtomicU32::new(0));
        let f = fires.clone();
        manager.add_timer(10, move || { f.fetch_add(1, Ordering::SeqCst); }, true);

        let mut out = Vec::new();
        manager.drain_expired_at(5, &mut out);
        assert!(out.is_empty());

        manager.drain_expired_at(10, &mut out);
        assert_eq!(out.len(), 1);
        out.pop().unwrap()();
        assert_eq!(fires.load(Ordering::SeqCst), 1);
        assert_eq!(manager.len(), 1, "recurring timer reinserted");
    }

    #[test]
    fn cancel_prevents_future_fires() {
        let manager = TimerManager::new();
        let fires = Arc::new(AtomicU32::new(0));
        let f = fires.clone();
        let handle = manager.add_timer(10, move || { f.fetch_add(1, Ordering::SeqCst); }, false);
        handle.cancel();
        let mut out = Vec::new();
        manager.drain_expired_at(100, &mut out);
        assert!(out.is_empty());
        assert!(manager.is_empty());
    }

    #[test]
    fn conditional_timer_is_noop_after_witness_dies() {
        let manager = TimerManager::new();
        let witness: Arc<dyn Any + Send + Sync> = Arc::new(());
        let weak = Arc::downgrade(&witness);
        let fires = Arc::new(AtomicU32::new(0));
        let f = fires.clone();
        manager.add_conditional_timer(10, move || { f.fetch_add(1, Ordering::SeqCst); }, weak, true);
        drop(witness);

        let mut out = Vec::new();
        manager.drain_expired_at(10, &mut out);
        assert!(out.is_empty());
        assert_eq!(manager.len(), 1, "conditional timer stays registered, just silenced");
    }

    #[test]
    fn clock_rollback_drains_everything() {
        let manager = TimerManager::new();
        manager.add_timer(1_000, || {}, false);
        manager.add_timer(2_000, || {}, false);

        let mut out = Vec::new();
        manager.drain_expired_at(0, &mut out);
        assert!(out.is_empty());

        manager.drain_expired_at(-(ROLLBACK_WINDOW_MS + 1_000), &mut out);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn next_deadline_reports_zero_when_due_and_sentinel_when_empty() {
        let manager = TimerManager::new();
        assert_eq!(manager.next_deadline_ms(), NO_DEADLINE);
        manager.add_timer(0, || {}, false);
        assert_eq!(manager.next_deadline_ms(), 0);
    }
}
