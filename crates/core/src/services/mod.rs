//! Queue-backed services with a bounded number of concurrent operations
//!
//! Each service owns a FIFO of pending inputs, dispatches as many of them as
//! its slot budget allows on every `run()`, and collects outcomes in drainable
//! vectors that the runner empties once per tick.

pub mod check;
pub mod close;
pub mod open;
pub mod render;
pub mod resource_collection;

use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{trace, warn};

use crate::GridError;

pub use check::{CheckInput, CheckService};
pub use close::{CloseInput, CloseService};
pub use open::{OpenInput, OpenService};
pub use render::{RenderInput, RenderService};
pub use resource_collection::{CollectionInput, ResourceCollectionService};

/// When a dispatch slot is handed back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotRelease {
    /// As soon as the operation settles
    OnCompletion,
    /// Only through `decrement_concurrency`
    Explicit,
}

/// How one dispatched operation settled
#[derive(Debug)]
pub enum ServiceOutcome<I, O> {
    Done(O),
    Failed(GridError),
    /// Put the input back at the head of the queue until the given instant
    RetryAt(I, Instant),
    /// The input was handed elsewhere; nothing to report
    Parked,
}

struct Pending<K, I> {
    key: K,
    input: I,
    not_before: Option<Instant>,
}

struct ServiceState<K, I, O> {
    queue: VecDeque<Pending<K, I>>,
    in_flight: HashSet<K>,
    succeeded: Vec<(K, O)>,
    failed: Vec<(K, GridError)>,
    slots_in_use: usize,
    limit: Option<usize>,
}

impl<K, I, O> ServiceState<K, I, O> {
    fn has_free_slot(&self) -> bool {
        self.limit.map_or(true, |limit| self.slots_in_use < limit)
    }
}

/// Generic bounded-concurrency executor
pub struct BoundedService<K, I, O> {
    name: &'static str,
    release: SlotRelease,
    state: Mutex<ServiceState<K, I, O>>,
}

impl<K, I, O> BoundedService<K, I, O>
where
    K: Clone + Eq + Hash + fmt::Display + Send + 'static,
    I: Send + 'static,
    O: Send + 'static,
{
    /// Create a service; `limit = None` means unbounded
    pub fn new(name: &'static str, limit: Option<usize>, release: SlotRelease) -> Self {
        Self {
            name,
            release,
            state: Mutex::new(ServiceState {
                queue: VecDeque::new(),
                in_flight: HashSet::new(),
                succeeded: Vec::new(),
                failed: Vec::new(),
                slots_in_use: 0,
                limit,
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Enqueue work at the tail
    pub fn add_input(&self, key: K, input: I) {
        trace!("{}: queued {}", self.name, key);
        self.state.lock().queue.push_back(Pending {
            key,
            input,
            not_before: None,
        });
    }

    /// Enqueue work at the head, optionally held back until `not_before`
    pub fn requeue_front(&self, key: K, input: I, not_before: Option<Instant>) {
        self.state.lock().queue.push_front(Pending {
            key,
            input,
            not_before,
        });
    }

    /// Withdraw a queued item that has not been dispatched yet
    pub fn remove_pending(&self, key: &K) -> Option<I> {
        let mut state = self.state.lock();
        let index = state.queue.iter().position(|p| &p.key == key)?;
        state.queue.remove(index).map(|p| p.input)
    }

    /// Withdraw every queued item matching `pred`
    pub fn remove_pending_where(&self, pred: impl Fn(&K, &I) -> bool) -> Vec<(K, I)> {
        let mut state = self.state.lock();
        let mut kept = VecDeque::with_capacity(state.queue.len());
        let mut removed = Vec::new();
        for pending in state.queue.drain(..) {
            if pred(&pending.key, &pending.input) {
                removed.push((pending.key, pending.input));
            } else {
                kept.push_back(pending);
            }
        }
        state.queue = kept;
        removed
    }

    /// Pop queued items while slots remain, acquiring one slot per item.
    ///
    /// Stops at the first item held back by `not_before` so queue order is kept.
    pub fn take_ready(&self, now: Instant) -> Vec<(K, I)> {
        let mut state = self.state.lock();
        let mut ready = Vec::new();
        while state.has_free_slot() {
            match state.queue.front() {
                Some(front) if front.not_before.map_or(true, |at| at <= now) => {}
                _ => break,
            }
            let Some(pending) = state.queue.pop_front() else {
                break;
            };
            state.slots_in_use += 1;
            state.in_flight.insert(pending.key.clone());
            ready.push((pending.key, pending.input));
        }
        ready
    }

    /// Record how a dispatched operation ended
    pub fn settle(&self, key: K, outcome: ServiceOutcome<I, O>) {
        let mut state = self.state.lock();
        state.in_flight.remove(&key);
        let release = match outcome {
            ServiceOutcome::Done(output) => {
                state.succeeded.push((key, output));
                self.release == SlotRelease::OnCompletion
            }
            ServiceOutcome::Failed(err) => {
                state.failed.push((key, err));
                self.release == SlotRelease::OnCompletion
            }
            ServiceOutcome::RetryAt(input, at) => {
                state.queue.push_front(Pending {
                    key,
                    input,
                    not_before: Some(at),
                });
                true
            }
            ServiceOutcome::Parked => self.release == SlotRelease::OnCompletion,
        };
        if release {
            self.release_slot(&mut state);
        }
    }

    /// Dispatch everything the budget allows, one spawned task per item
    pub fn dispatch<F, Fut>(self: &Arc<Self>, op: F) -> usize
    where
        F: Fn(K, I) -> Fut,
        Fut: Future<Output = ServiceOutcome<I, O>> + Send + 'static,
    {
        let ready = self.take_ready(Instant::now());
        let count = ready.len();
        for (key, input) in ready {
            let service = Arc::clone(self);
            let fut = op(key.clone(), input);
            tokio::spawn(async move {
                let outcome = fut.await;
                service.settle(key, outcome);
            });
        }
        count
    }

    /// Drain outputs gathered since the last call
    pub fn get_succeeded_tasks(&self) -> Vec<(K, O)> {
        std::mem::take(&mut self.state.lock().succeeded)
    }

    /// Drain failures gathered since the last call
    pub fn get_failed_tasks(&self) -> Vec<(K, GridError)> {
        std::mem::take(&mut self.state.lock().failed)
    }

    /// Hand back one slot held under `SlotRelease::Explicit`
    pub fn decrement_concurrency(&self) {
        let mut state = self.state.lock();
        self.release_slot(&mut state);
    }

    fn release_slot(&self, state: &mut ServiceState<K, I, O>) {
        if state.slots_in_use == 0 {
            warn!("{}: slot released with none in use", self.name);
            return;
        }
        state.slots_in_use -= 1;
    }

    /// Change the limit; items already dispatched are unaffected
    pub fn set_concurrency_limit(&self, limit: Option<usize>) {
        self.state.lock().limit = limit;
    }

    pub fn concurrency_limit(&self) -> Option<usize> {
        self.state.lock().limit
    }

    pub fn slots_in_use(&self) -> usize {
        self.state.lock().slots_in_use
    }

    pub fn pending_len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    pub fn is_in_flight(&self, key: &K) -> bool {
        self.state.lock().in_flight.contains(key)
    }
}
