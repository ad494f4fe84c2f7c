//! A RetryQ is a queue of pending deadlines ordered by due time,
//! with cheap cancellation by key. The underlying storage is a
//! hashed hierarchical timer wheel, so insertion and popping of due
//! items stay cheap even with many thousands of pending deadlines.
//!
//! Cancellation never touches the wheel: the entry is dropped from a
//! lookup table keyed by the entry's id, which invalidates the weak
//! reference the wheel holds. A destination that is destroyed while
//! its back-off deadline is still pending is cancelled this way.

use hierarchical_hash_wheel_timer::wheels::quad_wheel::{PruneDecision, QuadWheelWithOverflow};
use hierarchical_hash_wheel_timer::wheels::{Skip, TimerEntryWithDelay};
pub use hierarchical_hash_wheel_timer::TimerError;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// An entry with an identity it can be cancelled by, due after
/// `delay` from the moment of insertion.
pub trait RetryEntry {
    type Id: Hash + Eq + Clone;

    fn id(&self) -> &Self::Id;
    fn delay(&self) -> Duration;
}

/// Keep wheel slots whose entry is still registered; cancelled
/// entries have lost their strong reference and are pruned.
fn weak_prune<E>(e: &Weak<E>) -> PruneDecision {
    if e.strong_count() > 0 {
        PruneDecision::Keep
    } else {
        PruneDecision::Drop
    }
}

struct WheelEntry<E> {
    entry: Weak<E>,
    delay: Duration,
}

impl<E> std::fmt::Debug for WheelEntry<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WheelEntry")
            .field("entry", &self.entry)
            .field("delay", &self.delay)
            .finish()
    }
}

impl<E> TimerEntryWithDelay for WheelEntry<E> {
    fn delay(&self) -> Duration {
        self.delay
    }
}

#[must_use]
pub enum PopResult<E> {
    /// These deadlines are due now.
    Due(Vec<Arc<E>>),
    /// Nothing is due for at least the given duration.
    Sleep(Duration),
    /// The queue is empty.
    Empty,
}

pub struct RetryQ<E: RetryEntry> {
    wheel: QuadWheelWithOverflow<WheelEntry<E>>,
    pending: HashMap<E::Id, Arc<E>>,
    last_check: Instant,
}

impl<E: RetryEntry> Default for RetryQ<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: RetryEntry> RetryQ<E> {
    pub fn new() -> Self {
        Self {
            wheel: QuadWheelWithOverflow::new(|e: &WheelEntry<E>| weak_prune(&e.entry)),
            pending: HashMap::new(),
            last_check: Instant::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn contains(&self, id: &E::Id) -> bool {
        self.pending.contains_key(id)
    }

    /// Schedule a deadline. An entry with the same id must not
    /// already be pending; callers cancel first when rescheduling.
    pub fn insert(&mut self, entry: E) -> Result<(), TimerError<E>> {
        let delay = entry.delay();
        let entry = Arc::new(entry);
        match self.wheel.insert_with_delay(
            WheelEntry {
                entry: Arc::downgrade(&entry),
                delay,
            },
            delay,
        ) {
            Ok(_) => {
                self.pending.insert(entry.id().clone(), entry);
                Ok(())
            }
            Err(TimerError::Expired(_)) => {
                let entry = Arc::try_unwrap(entry)
                    .unwrap_or_else(|_| unreachable!("entry was never shared"));
                Err(TimerError::Expired(entry))
            }
            Err(TimerError::NotFound) => Err(TimerError::NotFound),
        }
    }

    /// Cancel the deadline with the given id, if one is pending.
    /// Returns true when something was cancelled.
    pub fn cancel(&mut self, id: &E::Id) -> bool {
        self.pending.remove(id).is_some()
    }

    fn take(&mut self, weak: Weak<E>) -> Option<Arc<E>> {
        let entry = weak.upgrade()?;
        // A cancel may have raced the wheel tick; only entries still
        // in the pending table fire.
        self.pending.remove(entry.id())?;
        Some(entry)
    }

    /// Advance the wheel by however much wall clock has elapsed
    /// since the previous call, collecting due entries.
    pub fn pop(&mut self) -> PopResult<E> {
        let now = Instant::now();
        let elapsed = now - self.last_check;
        self.last_check = now;
        let mut elapsed_ms = elapsed.as_millis() as u32;

        let mut due = vec![];

        while elapsed_ms > 0 {
            match self.wheel.can_skip() {
                Skip::Empty => break,
                Skip::None => {
                    for slot in self.wheel.tick() {
                        if let Some(entry) = self.take(slot.entry) {
                            due.push(entry);
                        }
                    }
                    elapsed_ms -= 1;
                }
                Skip::Millis(m) => {
                    let amount = m.min(elapsed_ms);
                    self.wheel.skip(amount);
                    elapsed_ms -= amount;
                }
            }
        }

        if !due.is_empty() {
            return PopResult::Due(due);
        }

        match self.wheel.can_skip() {
            Skip::None => PopResult::Sleep(Duration::from_millis(1)),
            Skip::Empty => PopResult::Empty,
            Skip::Millis(ms) => PopResult::Sleep(Duration::from_millis(ms.into())),
        }
    }

    /// Return every pending entry regardless of due time, leaving
    /// the queue empty. Used at shutdown.
    pub fn drain(&mut self) -> Vec<Arc<E>> {
        loop {
            match self.wheel.can_skip() {
                Skip::Empty => break,
                Skip::None => {
                    self.wheel.tick();
                }
                Skip::Millis(m) => {
                    self.wheel.skip(m);
                }
            }
        }
        self.last_check = Instant::now();
        self.pending.drain().map(|(_, entry)| entry).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Deadline {
        site: &'static str,
        delay: Duration,
    }

    impl RetryEntry for Deadline {
        type Id = &'static str;

        fn id(&self) -> &&'static str {
            &self.site
        }

        fn delay(&self) -> Duration {
            self.delay
        }
    }

    fn entry(site: &'static str, ms: u64) -> Deadline {
        Deadline {
            site,
            delay: Duration::from_millis(ms),
        }
    }

    #[test]
    fn pops_in_due_order() {
        let mut q = RetryQ::new();
        q.insert(entry("one.example", 1)).unwrap();
        q.insert(entry("two.example", 200)).unwrap();
        assert_eq!(q.len(), 2);

        std::thread::sleep(Duration::from_millis(5));
        match q.pop() {
            PopResult::Due(due) => {
                assert_eq!(due.len(), 1);
                assert_eq!(*due[0].id(), "one.example");
            }
            _ => unreachable!(),
        }
        assert_eq!(q.len(), 1);

        std::thread::sleep(Duration::from_millis(250));
        match q.pop() {
            PopResult::Due(due) => {
                assert_eq!(due.len(), 1);
                assert_eq!(*due[0].id(), "two.example");
            }
            _ => unreachable!(),
        }
        assert!(q.is_empty());
        assert!(matches!(q.pop(), PopResult::Empty));
    }

    #[test]
    fn cancelled_deadline_never_fires() {
        let mut q = RetryQ::new();
        q.insert(entry("gone.example", 1)).unwrap();
        q.insert(entry("kept.example", 1)).unwrap();
        assert!(q.cancel(&"gone.example"));
        assert!(!q.cancel(&"gone.example"));

        std::thread::sleep(Duration::from_millis(10));
        match q.pop() {
            PopResult::Due(due) => {
                assert_eq!(due.len(), 1);
                assert_eq!(*due[0].id(), "kept.example");
            }
            _ => unreachable!(),
        }
        assert!(q.is_empty());
    }

    #[test]
    fn sleep_hint_reflects_pending_work() {
        let mut q: RetryQ<Deadline> = RetryQ::new();
        assert!(matches!(q.pop(), PopResult::Empty));

        q.insert(entry("later.example", 500)).unwrap();
        match q.pop() {
            PopResult::Sleep(d) => assert!(d <= Duration::from_millis(500)),
            _ => unreachable!(),
        }
    }

    #[test]
    fn drain_returns_everything() {
        let mut q = RetryQ::new();
        q.insert(entry("a.example", 50)).unwrap();
        q.insert(entry("b.example", 5000)).unwrap();
        let mut drained: Vec<_> = q.drain().iter().map(|e| *e.id()).collect();
        drained.sort();
        assert_eq!(drained, vec!["a.example", "b.example"]);
        assert!(q.is_empty());
        assert!(matches!(q.pop(), PopResult::Empty));
    }
}
