//! The runtime core.
//!
//! One [`Runtime`] value per OS thread holds the registries, the current
//! thread and the active scheduler. It lives in a thread-local slot, either
//! installed by [`enter`] or created with the default [`Config`] the first time
//! any operation needs it. Operations borrow it only for bookkeeping: the
//! borrow is always released before control leaves through a context switch.

use std::{
    cell::RefCell,
    marker::PhantomData,
    panic::{self, AssertUnwindSafe},
    rc::Rc,
};

use log::{debug, error, trace, warn};

use crate::{
    config::Config,
    context::Context,
    error::Error,
    registry::Registry,
    sched::{self, SchedulerRef},
    stack::Stack,
    thread::{Entry, Status, Thread, ThreadInfo, Tid, PANIC_EXIT_CODE},
};

thread_local! {
    static RUNTIME: RefCell<Option<Runtime>> = const { RefCell::new(None) };
}

/// Runs `f` against this OS thread's runtime, creating a default one if none
/// is installed yet.
pub(crate) fn with_runtime<R>(f: impl FnOnce(&mut Runtime) -> R) -> R {
    RUNTIME.with(|slot| {
        let mut slot = slot.borrow_mut();
        let runtime = slot.get_or_insert_with(|| Runtime::new(Config::default()));
        f(runtime)
    })
}

/// Installs a runtime built from `config` on the calling OS thread.
///
/// The runtime is torn down when the returned guard is dropped. Drop it from
/// the same context that called `enter`; any thread that has not been reaped
/// by then is discarded without being resumed.
pub fn enter(config: Config) -> Result<EnterGuard, Error> {
    RUNTIME.with(|slot| {
        let mut slot = slot.borrow_mut();
        if slot.is_some() {
            return Err(Error::AlreadyEntered);
        }
        *slot = Some(Runtime::new(config));
        Ok(EnterGuard {
            _not_send: PhantomData,
        })
    })
}

/// Keeps the runtime installed by [`enter`] alive.
#[must_use = "the runtime is torn down when the guard is dropped"]
#[derive(Debug)]
pub struct EnterGuard {
    _not_send: PhantomData<*const ()>,
}

impl Drop for EnterGuard {
    fn drop(&mut self) {
        // Dropped outside the borrow: thread entries may run arbitrary drops.
        // A drop that calls back into lwp lazily installs a fresh runtime,
        // which is discarded as well so the slot ends up empty.
        while let Ok(Some(runtime)) = RUNTIME.try_with(|slot| slot.borrow_mut().take()) {
            drop(runtime);
        }
    }
}

/// What `yield_now` has to do once the runtime borrow is released.
pub(crate) enum Switch {
    /// The scheduler picked the running thread again.
    Stay,
    Jump {
        save: *mut Context,
        load: *const Context,
    },
    /// Nothing left to run: end the process with this code.
    Drained(i32),
    /// The scheduler picked a thread the runtime does not know.
    Lost(Tid),
}

pub(crate) struct Runtime {
    config: Config,
    stack_size: usize,
    registry: Registry,
    current: Option<Tid>,
    scheduler: Option<SchedulerRef>,
    next_tid: u64,
    // where a context that was never a managed thread gets parked
    detached: Box<Context>,
}

impl Runtime {
    pub(crate) fn new(config: Config) -> Self {
        let stack_size = config.resolved_stack_size();
        Runtime {
            config,
            stack_size,
            registry: Registry::new(),
            current: None,
            scheduler: None,
            next_tid: 0,
            detached: Box::default(),
        }
    }

    fn allocate_tid(&mut self) -> Tid {
        let tid = Tid::from(self.next_tid);
        self.next_tid += 1;
        tid
    }

    /// The active scheduler, installing round-robin if there is none.
    pub(crate) fn scheduler(&mut self) -> SchedulerRef {
        self.scheduler
            .get_or_insert_with(|| {
                let scheduler = sched::round_robin();
                scheduler.borrow_mut().init();
                scheduler
            })
            .clone()
    }

    fn admit(&mut self, thread: Thread) -> Tid {
        let tid = self.registry.register_live(Box::new(thread));
        self.scheduler().borrow_mut().admit(tid);
        tid
    }

    /// Builds a thread that runs `entry` on a stack of its own.
    pub(crate) fn spawn(&mut self, entry: Entry) -> Result<Tid, Error> {
        let stack = Stack::map(self.stack_size, self.config.has_guard_page())?;
        let context = unsafe { Context::prepare(stack.top(), trampoline) };
        let tid = self.allocate_tid();
        let thread = Thread::new(tid, Some(stack), context, Some(entry));
        self.admit(thread);
        debug!("created thread {tid} with a {} byte stack", self.stack_size);
        Ok(tid)
    }

    /// Turns the calling context into a managed thread running on the host
    /// stack.
    pub(crate) fn adopt_host(&mut self) -> Result<Tid, Error> {
        if let Some(current) = self.current {
            return Err(Error::AlreadyStarted(current));
        }
        let tid = self.allocate_tid();
        self.admit(Thread::new(tid, None, Context::default(), None));
        self.current = Some(tid);
        debug!("host context adopted as thread {tid}");
        Ok(tid)
    }

    /// Picks the next thread and makes it current.
    pub(crate) fn prepare_switch(&mut self) -> Switch {
        let next = self.scheduler().borrow_mut().next();
        let Some(next) = next else {
            let status = self
                .current
                .and_then(|tid| self.registry.get(tid))
                .map_or(Status::Live, |thread| thread.status);
            return Switch::Drained(status.process_code());
        };
        if self.current == Some(next) {
            return Switch::Stay;
        }

        let load: *const Context = match self.registry.get(next) {
            Some(thread) if thread.status == Status::Live => &thread.context,
            _ => return Switch::Lost(next),
        };
        let save: *mut Context = match self.current.and_then(|tid| self.registry.get_mut(tid)) {
            Some(thread) => &mut thread.context,
            None => &mut *self.detached,
        };
        trace!("switching {:?} -> {next}", self.current);
        self.current = Some(next);
        Switch::Jump { save, load }
    }

    /// Moves the current thread from the scheduler and live set to the
    /// terminated queue. Returns `None` when no managed thread is running.
    pub(crate) fn retire(&mut self, code: i32) -> Option<Tid> {
        let tid = self.current?;
        self.scheduler().borrow_mut().remove(tid);
        self.registry.unlink(tid);
        if let Some(thread) = self.registry.get_mut(tid) {
            thread.status = Status::Terminated(code);
        }
        self.registry.register_terminated(tid);
        debug!("thread {tid} exited with {code}");
        Some(tid)
    }

    /// Reaps the oldest terminated thread, unmapping its stack.
    pub(crate) fn reap(&mut self) -> Result<Option<(Tid, Status)>, Error> {
        let Some(thread) = self.registry.pop_terminated() else {
            return Ok(None);
        };
        let Thread {
            id, status, stack, ..
        } = *thread;
        if let Some(stack) = stack {
            stack.release()?;
        }
        debug!("reaped thread {id}");
        Ok(Some((id, status)))
    }

    /// Hands out the entry of the current thread, at most once.
    fn take_entry(&mut self) -> Option<(Tid, Entry)> {
        let tid = self.current?;
        let entry = self.registry.get_mut(tid)?.entry.take()?;
        Some((tid, entry))
    }

    pub(crate) fn current(&self) -> Option<Tid> {
        self.current
    }

    pub(crate) fn thread_info(&self, tid: Tid) -> Option<ThreadInfo> {
        self.registry.find_by_id(tid).map(Thread::info)
    }

    pub(crate) fn qlen(&mut self) -> usize {
        self.scheduler().borrow().qlen()
    }

    /// Makes `new` (or a fresh round-robin) the active scheduler, migrating
    /// every thread of the old pool in the order the old policy yields them.
    pub(crate) fn set_scheduler(&mut self, new: Option<SchedulerRef>) {
        let new = new.unwrap_or_else(sched::round_robin);
        if let Some(old) = &self.scheduler {
            if Rc::ptr_eq(old, &new) {
                return;
            }
        }

        new.borrow_mut().init();
        if let Some(old) = self.scheduler.take() {
            let mut old = old.borrow_mut();
            let mut incoming = new.borrow_mut();
            let mut moved = 0;
            while let Some(tid) = old.next() {
                old.remove(tid);
                incoming.admit(tid);
                moved += 1;
            }
            old.shutdown();
            debug!("migrated {moved} threads to a new scheduler");
        }
        self.scheduler = Some(new);
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        let on_managed_stack = self
            .current
            .and_then(|tid| self.registry.get(tid))
            .is_some_and(|thread| thread.stack.is_some());
        if !on_managed_stack {
            return;
        }
        // unmapping the stack we are running on would pull it from under us
        warn!("runtime dropped from a managed thread, leaking its stacks");
        for thread in self.registry.threads_mut() {
            if let Some(stack) = thread.stack.take() {
                stack.leak();
            }
        }
    }
}

/// First frame of every created thread: runs the entry, then exits with its
/// result.
extern "C" fn trampoline() -> ! {
    let code = match with_runtime(Runtime::take_entry) {
        Some((tid, entry)) => match panic::catch_unwind(AssertUnwindSafe(entry)) {
            Ok(code) => code,
            Err(_) => {
                error!("thread {tid} panicked");
                PANIC_EXIT_CODE
            }
        },
        None => 0,
    };
    crate::exit(code)
}

#[cfg(test)]
impl Runtime {
    /// Registry consistency plus agreement between the live set and the
    /// scheduler pool.
    ///
    /// The pool is enumerated by calling `next` `qlen` times, which leaves a
    /// rotating policy where it started.
    pub(crate) fn check_invariants(&mut self) -> Result<(), String> {
        self.registry.check()?;
        let live = self.registry.live_ids();
        let scheduler = self.scheduler();
        let mut scheduler = scheduler.borrow_mut();
        let queued = scheduler.qlen();
        let pooled: std::collections::BTreeSet<Tid> =
            (0..queued).filter_map(|_| scheduler.next()).collect();
        if pooled.len() != queued {
            return Err(format!("{queued} scheduled but {} distinct", pooled.len()));
        }
        if pooled != live {
            return Err(format!("live threads {live:?} but scheduled {pooled:?}"));
        }
        if let Some(tid) = self.current {
            if self.registry.get(tid).map(|t| t.status) != Some(Status::Live) {
                return Err(format!("current thread {tid} is not live"));
            }
        }
        Ok(())
    }
}
