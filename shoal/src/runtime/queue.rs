use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::fmt;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::resource::ObjectKey;

/// Something the runtime reconciles.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum ReconcileTarget {
    Campaign(ObjectKey),
    WorkUnit(ObjectKey),
}

impl ReconcileTarget {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Campaign(_) => "Campaign",
            Self::WorkUnit(_) => "WorkUnit",
        }
    }

    pub fn key(&self) -> &ObjectKey {
        match self {
            Self::Campaign(key) | Self::WorkUnit(key) => key,
        }
    }
}

impl fmt::Display for ReconcileTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind(), self.key())
    }
}

#[derive(Debug, Default)]
struct QueueState {
    /// Earliest due time per queued target; heap entries that disagree are stale.
    scheduled: HashMap<ReconcileTarget, Instant>,
    heap: BinaryHeap<Reverse<(Instant, u64, ReconcileTarget)>>,
    in_flight: HashSet<ReconcileTarget>,
    /// Targets re-added while in flight, released by `done`.
    deferred: HashMap<ReconcileTarget, Instant>,
    seq: u64,
}

impl QueueState {
    fn schedule(&mut self, target: ReconcileTarget, due: Instant) -> bool {
        if self.in_flight.contains(&target) {
            let slot = self.deferred.entry(target).or_insert(due);
            *slot = (*slot).min(due);
            return false;
        }
        if let Some(existing) = self.scheduled.get(&target)
            && *existing <= due
        {
            return false;
        }
        self.seq += 1;
        self.scheduled.insert(target.clone(), due);
        self.heap.push(Reverse((due, self.seq, target)));
        true
    }
}

/// De-duplicating delay queue of reconcile targets.
///
/// A target is queued at most once, at its earliest requested time, and is
/// never handed out while a previous hand-out has not been marked
/// [`done`](Self::done).
#[derive(Debug, Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, target: ReconcileTarget) {
        self.add_after(target, Duration::ZERO);
    }

    pub fn add_after(&self, target: ReconcileTarget, delay: Duration) {
        let due = Instant::now() + delay;
        if self.state.lock().schedule(target, due) {
            self.notify.notify_one();
        }
    }

    /// Waits for the next due target and marks it in flight.
    pub async fn next(&self) -> ReconcileTarget {
        loop {
            let wait = {
                let mut state = self.state.lock();
                let now = Instant::now();
                let mut wait = None;
                while let Some(Reverse((due, _, target))) = state.heap.peek().cloned() {
                    if state.scheduled.get(&target) != Some(&due) {
                        state.heap.pop();
                        continue;
                    }
                    if due <= now {
                        state.heap.pop();
                        state.scheduled.remove(&target);
                        state.in_flight.insert(target.clone());
                        return target;
                    }
                    wait = Some(due - now);
                    break;
                }
                wait
            };

            match wait {
                Some(wait) => {
                    tokio::select! {
                        _ = self.notify.notified() => {}
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
                None => self.notify.notified().await,
            }
        }
    }

    /// Releases a target handed out by [`next`](Self::next).
    pub fn done(&self, target: &ReconcileTarget) {
        let mut state = self.state.lock();
        state.in_flight.remove(target);
        if let Some(due) = state.deferred.remove(target) {
            state.schedule(target.clone(), due);
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Number of queued targets, excluding those in flight.
    pub fn len(&self) -> usize {
        self.state.lock().scheduled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_in_flight(&self, target: &ReconcileTarget) -> bool {
        self.state.lock().in_flight.contains(target)
    }
}
