//! Engine-wide limit on concurrently active plans.
//!
//! Items beyond the limit are parked in FIFO order. Every mutation of the
//! active count, the waiting queue and an item's `active` flag happens under
//! one lock held only for O(1) bookkeeping. Waking an activated item is left
//! to the caller, outside the lock.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub trait Admittable: Send + Sync {
    fn admission_key(&self) -> String;

    fn is_active(&self) -> bool;

    /// Only called by the controller, under its lock.
    fn set_active(&self, active: bool);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Activated,
    /// Waiting behind `position` other parked items.
    Parked { position: usize },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionStats {
    pub max_active: usize,
    pub active: usize,
    pub waiting: usize,
    pub admitted: u64,
    pub parked: u64,
    pub peak_active: usize,
}

struct AdmissionState<T> {
    currently_active: usize,
    peak_active: usize,
    waiting: VecDeque<Arc<T>>,
}

pub struct AdmissionController<T: Admittable> {
    max_active: usize,
    state: Mutex<AdmissionState<T>>,
    admitted: AtomicU64,
    parked: AtomicU64,
}

impl<T: Admittable> AdmissionController<T> {
    pub fn new(max_active: usize) -> Self {
        Self {
            max_active: max_active.max(1),
            state: Mutex::new(AdmissionState {
                currently_active: 0,
                peak_active: 0,
                waiting: VecDeque::new(),
            }),
            admitted: AtomicU64::new(0),
            parked: AtomicU64::new(0),
        }
    }

    pub fn admit(&self, item: Arc<T>) -> Admission {
        let mut state = self.state.lock();
        if state.currently_active < self.max_active && state.waiting.is_empty() {
            state.currently_active += 1;
            state.peak_active = state.peak_active.max(state.currently_active);
            item.set_active(true);
            drop(state);
            self.admitted.fetch_add(1, Ordering::Relaxed);
            return Admission::Activated;
        }
        let position = state.waiting.len();
        state.waiting.push_back(item.clone());
        drop(state);

        self.parked.fetch_add(1, Ordering::Relaxed);
        debug!(
            target: "admission",
            item = %item.admission_key(),
            position,
            "Parked, active plan limit reached"
        );
        Admission::Parked { position }
    }

    /// Gives back `item`'s slot. Idempotent.
    ///
    /// Returns the oldest parked item, now active, which the caller must wake.
    pub fn release(&self, item: &T) -> Option<Arc<T>> {
        let mut state = self.state.lock();
        if !item.is_active() {
            return None;
        }
        item.set_active(false);
        state.currently_active -= 1;

        let next = state.waiting.pop_front()?;
        next.set_active(true);
        state.currently_active += 1;
        state.peak_active = state.peak_active.max(state.currently_active);
        drop(state);

        self.admitted.fetch_add(1, Ordering::Relaxed);
        debug!(target: "admission", item = %next.admission_key(), "Activated parked item");
        Some(next)
    }

    /// Removes a parked item. Returns false if it was not parked.
    pub fn withdraw(&self, item: &Arc<T>) -> bool {
        let mut state = self.state.lock();
        match state.waiting.iter().position(|w| Arc::ptr_eq(w, item)) {
            Some(index) => {
                state.waiting.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn stats(&self) -> AdmissionStats {
        let state = self.state.lock();
        AdmissionStats {
            max_active: self.max_active,
            active: state.currently_active,
            waiting: state.waiting.len(),
            admitted: self.admitted.load(Ordering::Relaxed),
            parked: self.parked.load(Ordering::Relaxed),
            peak_active: state.peak_active,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::AtomicBool;

    struct Item {
        id: usize,
        active: AtomicBool,
    }

    impl Item {
        fn new(id: usize) -> Arc<Self> {
            Arc::new(Self {
                id,
                active: AtomicBool::new(false),
            })
        }
    }

    impl Admittable for Item {
        fn admission_key(&self) -> String {
            self.id.to_string()
        }

        fn is_active(&self) -> bool {
            self.active.load(Ordering::SeqCst)
        }

        fn set_active(&self, active: bool) {
            self.active.store(active, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_release_activates_oldest_parked() {
        let controller = AdmissionController::new(1);
        let a = Item::new(1);
        let b = Item::new(2);
        let c = Item::new(3);

        assert_eq!(controller.admit(a.clone()), Admission::Activated);
        assert_eq!(controller.admit(b.clone()), Admission::Parked { position: 0 });
        assert_eq!(controller.admit(c.clone()), Admission::Parked { position: 1 });
        assert!(!b.is_active());

        let next = controller.release(&a).unwrap();
        assert_eq!(next.id, 2);
        assert!(b.is_active());
        assert!(!a.is_active());

        // Releasing twice is a no-op
        assert!(controller.release(&a).is_none());
        assert_eq!(controller.stats().active, 1);
    }

    #[test]
    fn test_withdraw_parked_item() {
        let controller = AdmissionController::new(1);
        let a = Item::new(1);
        let b = Item::new(2);
        controller.admit(a.clone());
        controller.admit(b.clone());

        assert!(controller.withdraw(&b));
        assert!(!controller.withdraw(&b));
        assert!(controller.release(&a).is_none());

        let stats = controller.stats();
        assert_eq!((stats.active, stats.waiting), (0, 0));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Submit,
        Finish(usize),
        Withdraw(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            3 => Just(Op::Submit),
            2 => (0usize..64).prop_map(Op::Finish),
            1 => (0usize..64).prop_map(Op::Withdraw),
        ]
    }

    proptest! {
        #[test]
        fn prop_active_never_exceeds_limit(max in 1usize..5, ops in prop::collection::vec(op(), 1..120)) {
            let controller = AdmissionController::new(max);
            let mut items: Vec<Arc<Item>> = Vec::new();
            let mut parked: VecDeque<usize> = VecDeque::new();

            for op in ops {
                match op {
                    Op::Submit => {
                        let item = Item::new(items.len());
                        items.push(item.clone());
                        if let Admission::Parked { .. } = controller.admit(item.clone()) {
                            parked.push_back(item.id);
                        }
                    }
                    Op::Finish(i) => {
                        if let Some(item) = items.get(i) {
                            let was_active = item.is_active();
                            let next = controller.release(item);
                            if was_active {
                                // The oldest parked item is activated immediately
                                prop_assert_eq!(next.map(|n| n.id), parked.pop_front());
                            } else {
                                prop_assert!(next.is_none());
                            }
                        }
                    }
                    Op::Withdraw(i) => {
                        if let Some(item) = items.get(i) {
                            let removed = controller.withdraw(item);
                            let expected = parked.iter().position(|p| *p == item.id);
                            prop_assert_eq!(removed, expected.is_some());
                            if let Some(index) = expected {
                                parked.remove(index);
                            }
                        }
                    }
                }

                let active = items.iter().filter(|i| i.is_active()).count();
                let stats = controller.stats();
                prop_assert!(stats.active <= max);
                prop_assert_eq!(stats.active, active);
                prop_assert_eq!(stats.waiting, parked.len());
                for id in &parked {
                    prop_assert!(!items[*id].is_active());
                }
            }
        }
    }
}
