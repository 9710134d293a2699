//! Cooperative lightweight processes.
//!
//! Many logical threads share one OS thread and take turns: a thread runs
//! until it calls [`yield_now`] or [`exit`], then the active [`Scheduler`]
//! decides who goes next. Each created thread gets a stack of its own; the
//! context that calls [`start`] becomes a thread too and keeps using the stack
//! it already has.
//!
//! ```no_run
//! let worker = lwp::create(|| {
//!     lwp::yield_now();
//!     7
//! })
//! .unwrap();
//! lwp::start().unwrap();
//! while lwp::qlen() > 1 {
//!     lwp::yield_now();
//! }
//! assert_eq!(lwp::wait(), Some((worker, lwp::Status::Terminated(7))));
//! ```
//!
//! All state belongs to the calling OS thread. Scheduler callbacks run while
//! that state is borrowed and must not call back into this crate.

mod config;
mod context;
mod error;
mod registry;
mod runtime;
mod sched;
mod stack;
mod thread;

use log::{debug, error};

pub use config::{Config, DEFAULT_STACK_SIZE, MIN_STACK_SIZE};
pub use error::Error;
pub use runtime::{enter, EnterGuard};
pub use sched::{round_robin, RoundRobin, Scheduler, SchedulerRef};
pub use thread::{Status, ThreadInfo, Tid, PANIC_EXIT_CODE};

use runtime::{with_runtime, Switch};

/// Creates a thread that will run `entry` and exit with its return value.
///
/// The thread is admitted to the active scheduler but does not run until
/// someone yields to it.
pub fn create<F>(entry: F) -> Result<Tid, Error>
where
    F: FnOnce() -> i32 + 'static,
{
    with_runtime(|rt| rt.spawn(Box::new(entry)))
}

/// Turns the calling context into a managed thread, then yields.
///
/// Returns the caller's id once the scheduler comes back around to it.
pub fn start() -> Result<Tid, Error> {
    let tid = with_runtime(|rt| rt.adopt_host())?;
    yield_now();
    Ok(tid)
}

/// Gives the scheduler a chance to run another thread.
///
/// When the scheduler has nothing left to run the process exits, using the
/// exit code of the thread that was running last. A scheduler that picks a
/// thread which is not live ends the process with status 1.
pub fn yield_now() {
    match with_runtime(|rt| rt.prepare_switch()) {
        Switch::Stay => {}
        Switch::Jump { save, load } => unsafe { context::swap(save, load) },
        Switch::Drained(code) => {
            debug!("no runnable threads left, exiting with {code}");
            std::process::exit(code)
        }
        Switch::Lost(tid) => {
            error!("scheduler picked thread {tid}, which is not live");
            std::process::exit(1)
        }
    }
}

/// Terminates the calling thread with `code`.
///
/// Called outside any managed thread this exits the process instead.
pub fn exit(code: i32) -> ! {
    if with_runtime(|rt| rt.retire(code)).is_none() {
        std::process::exit(code);
    }
    yield_now();
    unreachable!("terminated thread was resumed")
}

/// Reaps the thread that terminated first, returning its id and status.
///
/// Returns `None` straight away when no thread has terminated.
pub fn wait() -> Option<(Tid, Status)> {
    match with_runtime(|rt| rt.reap()) {
        Ok(reaped) => reaped,
        Err(err) => {
            error!("{err}");
            std::process::exit(1)
        }
    }
}

/// Like [`wait`], but yields until some thread terminates for as long as
/// other threads are still runnable.
pub fn wait_blocking() -> Option<(Tid, Status)> {
    loop {
        if let Some(reaped) = wait() {
            return Some(reaped);
        }
        if gettid().is_none() || qlen() <= 1 {
            return None;
        }
        yield_now();
    }
}

/// Id of the running thread, `None` outside managed threads.
pub fn gettid() -> Option<Tid> {
    with_runtime(|rt| rt.current())
}

/// Looks up a thread that has not been reaped yet.
pub fn id_to_thread(tid: Tid) -> Option<ThreadInfo> {
    with_runtime(|rt| rt.thread_info(tid))
}

/// Replaces the active scheduler, moving every thread it holds over to the
/// new one. `None` installs a fresh round-robin scheduler.
pub fn set_scheduler(scheduler: Option<SchedulerRef>) {
    with_runtime(|rt| rt.set_scheduler(scheduler))
}

/// The active scheduler.
pub fn get_scheduler() -> SchedulerRef {
    with_runtime(|rt| rt.scheduler())
}

/// Number of threads in the active scheduler's pool.
pub fn qlen() -> usize {
    with_runtime(|rt| rt.qlen())
}

#[cfg(test)]
mod tests {
    use std::{
        cell::{Cell, RefCell},
        collections::VecDeque,
        process::Command,
        rc::Rc,
    };

    use rand::{rngs::StdRng, Rng, SeedableRng};

    use super::*;

    const TEST_STACK_SIZE: usize = 256 * 1024;
    const CHILD_ENV: &str = "LWP_TEST_CHILD";

    fn runtime() -> EnterGuard {
        enter(Config::new().stack_size(TEST_STACK_SIZE)).unwrap()
    }

    fn assert_invariants() {
        with_runtime(|rt| rt.check_invariants()).unwrap();
    }

    fn drain() -> Vec<(Tid, Status)> {
        std::iter::from_fn(wait_blocking).collect()
    }

    fn run_to_completion() {
        while qlen() > 1 {
            yield_now();
        }
    }

    /// Runs `test` again in a child process with `CHILD_ENV` set and returns
    /// its exit code.
    fn run_child(test: &str) -> Option<i32> {
        let status = Command::new(std::env::current_exe().unwrap())
            .args(["--exact", test, "--nocapture", "--test-threads=1"])
            .env(CHILD_ENV, test)
            .status()
            .unwrap();
        status.code()
    }

    fn is_child(test: &str) -> bool {
        std::env::var(CHILD_ENV).as_deref() == Ok(test)
    }

    #[derive(Default)]
    struct Fifo {
        queue: VecDeque<Tid>,
        inits: Rc<Cell<u32>>,
        shutdowns: Rc<Cell<u32>>,
    }

    impl Scheduler for Fifo {
        fn init(&mut self) {
            self.inits.set(self.inits.get() + 1);
        }

        fn shutdown(&mut self) {
            self.shutdowns.set(self.shutdowns.get() + 1);
        }

        fn admit(&mut self, tid: Tid) {
            self.queue.push_back(tid);
        }

        fn remove(&mut self, tid: Tid) {
            self.queue.retain(|&queued| queued != tid);
        }

        fn next(&mut self) -> Option<Tid> {
            let tid = self.queue.pop_front()?;
            self.queue.push_back(tid);
            Some(tid)
        }

        fn qlen(&self) -> usize {
            self.queue.len()
        }
    }

    #[test]
    fn first_threads_are_reaped_in_exit_order() {
        let _rt = runtime();
        let first = create(|| 7).unwrap();
        let second = create(|| exit(9)).unwrap();
        assert_eq!((first.as_u64(), second.as_u64()), (0, 1));

        let host = start().unwrap();
        assert_eq!(host.as_u64(), 2);
        assert_eq!(wait(), Some((first, Status::Terminated(7))));
        assert_eq!(wait(), Some((second, Status::Terminated(9))));
        assert_eq!(wait(), None);
    }

    #[test]
    fn start_thread_takes_the_first_id() {
        let _rt = runtime();
        assert_eq!(gettid(), None);
        let host = start().unwrap();
        assert_eq!(host.as_u64(), 0);
        assert_eq!(gettid(), Some(host));

        let child = create(|| gettid().map_or(-1, |tid| tid.as_u64() as i32)).unwrap();
        assert_eq!(child.as_u64(), 1);
        assert_eq!(wait_blocking(), Some((child, Status::Terminated(1))));
        assert_eq!(wait_blocking(), None);
        assert!(matches!(start(), Err(Error::AlreadyStarted(tid)) if tid == host));
    }

    #[test]
    fn threads_take_turns_in_admission_order() {
        let _rt = runtime();
        let trace = Rc::new(RefCell::new(Vec::new()));
        for _ in 0..3 {
            let trace = trace.clone();
            create(move || {
                for _ in 0..3 {
                    trace.borrow_mut().push(gettid().unwrap().as_u64());
                    yield_now();
                }
                0
            })
            .unwrap();
        }
        start().unwrap();

        let reaped: Vec<_> = drain().into_iter().map(|(tid, _)| tid.as_u64()).collect();
        assert_eq!(*trace.borrow(), [0, 1, 2, 0, 1, 2, 0, 1, 2]);
        assert_eq!(reaped, [0, 1, 2]);
    }

    #[test]
    fn wait_reaps_in_termination_order() {
        let _rt = runtime();
        start().unwrap();
        let exits = Rc::new(RefCell::new(Vec::new()));
        for (i, yields) in [2, 0, 1, 3, 0].into_iter().enumerate() {
            let exits = exits.clone();
            create(move || {
                for _ in 0..yields {
                    yield_now();
                }
                exits.borrow_mut().push(gettid().unwrap());
                i as i32
            })
            .unwrap();
        }
        run_to_completion();

        let reaped: Vec<_> = std::iter::from_fn(wait).map(|(tid, _)| tid).collect();
        assert_eq!(reaped, *exits.borrow());
        assert_eq!(reaped.len(), 5);
        assert_eq!(wait(), None);
    }

    #[test]
    fn thread_lookup_follows_the_lifecycle() {
        let _rt = runtime();
        let host = start().unwrap();
        let child = create(|| 3).unwrap();

        let info = id_to_thread(child).unwrap();
        assert_eq!(info.status, Status::Live);
        assert!(info.stack_size.unwrap() >= TEST_STACK_SIZE);
        assert_eq!(id_to_thread(host).unwrap().stack_size, None);

        run_to_completion();
        assert_eq!(id_to_thread(child).unwrap().status, Status::Terminated(3));
        assert_eq!(wait(), Some((child, Status::Terminated(3))));
        assert_eq!(id_to_thread(child), None);
        assert_eq!(id_to_thread(Tid::from(99)), None);
    }

    #[test]
    fn migration_keeps_every_thread_once_and_in_order() {
        let _rt = runtime();
        start().unwrap();
        for _ in 0..4 {
            create(|| {
                yield_now();
                yield_now();
                0
            })
            .unwrap();
        }
        assert_eq!(qlen(), 5);

        let fifo = Rc::new(RefCell::new(Fifo::default()));
        let (inits, shutdowns) = (fifo.borrow().inits.clone(), fifo.borrow().shutdowns.clone());
        let policy: SchedulerRef = fifo.clone();
        let old = get_scheduler();
        set_scheduler(Some(policy.clone()));

        assert_eq!(qlen(), 5);
        assert_eq!(old.borrow().qlen(), 0);
        let order: Vec<_> = fifo.borrow().queue.iter().map(|tid| tid.as_u64()).collect();
        assert_eq!(order, [0, 1, 2, 3, 4]);
        assert!(Rc::ptr_eq(&get_scheduler(), &policy));
        assert_eq!(inits.get(), 1);

        set_scheduler(Some(policy.clone()));
        assert_eq!(inits.get(), 1);
        assert_eq!(shutdowns.get(), 0);

        let mut reaped: Vec<_> = drain().into_iter().map(|(tid, _)| tid.as_u64()).collect();
        reaped.sort_unstable();
        assert_eq!(reaped, [1, 2, 3, 4]);

        set_scheduler(None);
        assert_eq!(shutdowns.get(), 1);
        assert_eq!(qlen(), 1);
        assert!(fifo.borrow().queue.is_empty());
    }

    #[test]
    fn a_pooled_thread_can_swap_the_scheduler() {
        let _rt = runtime();
        start().unwrap();
        for _ in 0..3 {
            create(|| {
                for _ in 0..3 {
                    yield_now();
                }
                0
            })
            .unwrap();
        }
        let policy: SchedulerRef = Rc::new(RefCell::new(Fifo::default()));
        let seen = Rc::new(Cell::new(0));
        let migrator = {
            let (policy, seen) = (policy.clone(), seen.clone());
            create(move || {
                set_scheduler(Some(policy));
                seen.set(qlen());
                yield_now();
                assert_invariants();
                0
            })
            .unwrap()
        };

        let reaped = drain();
        assert_eq!(seen.get(), 5);
        assert_eq!(reaped.len(), 4);
        assert!(reaped.iter().any(|&(tid, _)| tid == migrator));
        // a failed check inside a thread only shows up as its exit status
        assert!(reaped.iter().all(|&(_, status)| status == Status::Terminated(0)));
        assert!(Rc::ptr_eq(&get_scheduler(), &policy));
        assert_invariants();
    }

    #[test]
    fn panicking_thread_exits_with_panic_code() {
        let _rt = runtime();
        start().unwrap();
        let tid = create(|| -> i32 { panic!("boom") }).unwrap();
        assert_eq!(wait_blocking(), Some((tid, Status::Terminated(PANIC_EXIT_CODE))));
    }

    #[test]
    fn stack_allocation_failure_is_reported() {
        let _rt = enter(Config::new().stack_size(1 << 62)).unwrap();
        assert!(matches!(create(|| 0), Err(Error::StackAlloc(_))));
        assert_eq!(qlen(), 0);
        assert_eq!(wait(), None);
    }

    #[test]
    fn unmappable_stack_size_is_reported() {
        let _rt = enter(Config::new().stack_size(usize::MAX)).unwrap();
        assert!(matches!(create(|| 0), Err(Error::StackAlloc(_))));
        assert_eq!(qlen(), 0);
    }

    #[test]
    fn runtime_can_only_be_entered_once() {
        let _rt = runtime();
        assert!(matches!(enter(Config::default()), Err(Error::AlreadyEntered)));
        assert_eq!(qlen(), 0);
        assert!(Rc::ptr_eq(&get_scheduler(), &get_scheduler()));
    }

    #[test]
    fn teardown_leaves_the_slot_empty_when_entries_call_back() {
        struct Lookup(Rc<Cell<bool>>);

        impl Drop for Lookup {
            fn drop(&mut self) {
                gettid();
                self.0.set(true);
            }
        }

        let dropped = Rc::new(Cell::new(false));
        let rt = runtime();
        let lookup = Lookup(dropped.clone());
        create(move || {
            let _lookup = &lookup;
            0
        })
        .unwrap();
        drop(rt);

        assert!(dropped.get());
        let _rt = runtime();
        assert_eq!(qlen(), 0);
    }

    #[test]
    fn random_workloads_keep_registries_consistent() {
        let _rt = runtime();
        let mut rng = StdRng::seed_from_u64(0x1f0c);
        start().unwrap();

        let mut created = Vec::new();
        let mut reaped = Vec::new();
        for _ in 0..300 {
            match rng.gen_range(0..4) {
                0 => {
                    let yields = rng.gen_range(0..4);
                    let code = rng.gen_range(0..100);
                    let tid = create(move || {
                        for _ in 0..yields {
                            assert_invariants();
                            yield_now();
                        }
                        code
                    })
                    .unwrap();
                    created.push((tid, Status::Terminated(code)));
                }
                1 | 2 => yield_now(),
                _ => reaped.extend(wait()),
            }
            assert_invariants();
        }
        reaped.extend(drain());
        assert_invariants();

        reaped.sort_unstable_by_key(|(tid, _)| *tid);
        assert_eq!(reaped, created);
    }

    #[test]
    fn sole_thread_exit_ends_the_process_with_its_code() {
        const NAME: &str = "tests::sole_thread_exit_ends_the_process_with_its_code";
        if is_child(NAME) {
            start().unwrap();
            exit(42);
        }
        assert_eq!(run_child(NAME), Some(42));
    }

    #[test]
    fn last_thread_standing_decides_the_exit_code() {
        const NAME: &str = "tests::last_thread_standing_decides_the_exit_code";
        if is_child(NAME) {
            start().unwrap();
            create(|| 5).unwrap();
            exit(0);
        }
        assert_eq!(run_child(NAME), Some(5));
    }

    #[test]
    fn yield_outside_a_thread_parks_the_caller() {
        const NAME: &str = "tests::yield_outside_a_thread_parks_the_caller";
        if is_child(NAME) {
            create(|| 3).unwrap();
            yield_now();
            unreachable!("the detached caller is never resumed");
        }
        assert_eq!(run_child(NAME), Some(3));
    }

    #[test]
    fn exit_outside_a_thread_ends_the_process() {
        const NAME: &str = "tests::exit_outside_a_thread_ends_the_process";
        if is_child(NAME) {
            create(|| 0).unwrap();
            exit(4);
        }
        assert_eq!(run_child(NAME), Some(4));
    }

    #[test]
    fn scheduling_an_unknown_thread_ends_the_process() {
        const NAME: &str = "tests::scheduling_an_unknown_thread_ends_the_process";

        struct Stray;

        impl Scheduler for Stray {
            fn admit(&mut self, _tid: Tid) {}

            fn remove(&mut self, _tid: Tid) {}

            fn next(&mut self) -> Option<Tid> {
                Some(Tid::from(999))
            }

            fn qlen(&self) -> usize {
                0
            }
        }

        if is_child(NAME) {
            set_scheduler(Some(Rc::new(RefCell::new(Stray))));
            start().unwrap();
            unreachable!("thread 999 does not exist");
        }
        assert_eq!(run_child(NAME), Some(1));
    }
}
