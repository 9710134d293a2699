//! Pluggable scheduling policies.
//!
//! The runtime only ever talks to a policy through [`Scheduler`]; what a pool
//! looks like inside is the policy's business. Policies are shared as
//! [`SchedulerRef`] so the runtime can tell whether a newly installed policy is
//! the one already active.

use std::{cell::RefCell, rc::Rc};

use crate::thread::Tid;

mod round_robin;

pub use round_robin::RoundRobin;

/// A scheduling policy over a pool of live threads.
///
/// Every method runs while the runtime's own state is borrowed, so an
/// implementation must not call back into the runtime.
pub trait Scheduler {
    /// Called once, before the first `admit`, when this policy becomes active.
    fn init(&mut self) {}

    /// Called once, after the last `remove`, when this policy stops being
    /// active.
    fn shutdown(&mut self) {}

    /// Adds a live thread to the pool. The runtime never admits a thread that
    /// is already there.
    fn admit(&mut self, tid: Tid);

    /// Evicts a thread previously handed to `admit`.
    fn remove(&mut self, tid: Tid);

    /// The thread that should run next, or `None` when the pool is empty.
    fn next(&mut self) -> Option<Tid>;

    /// Number of threads in the pool.
    fn qlen(&self) -> usize;
}

pub type SchedulerRef = Rc<RefCell<dyn Scheduler>>;

/// A fresh round-robin policy, the default for every runtime.
pub fn round_robin() -> SchedulerRef {
    Rc::new(RefCell::new(RoundRobin::new()))
}
