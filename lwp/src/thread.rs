use std::fmt;

use crate::{context::Context, stack::Stack};

/// Uniquely identifies a thread. Ids are handed out in creation order and
/// never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Tid(u64);

impl Tid {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl From<u64> for Tid {
    fn from(id: u64) -> Self {
        Tid(id)
    }
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Admitted to a scheduler and eligible to run.
    Live,
    /// Exited with the given code and waiting to be reaped.
    Terminated(i32),
}

impl Status {
    pub fn is_terminated(self) -> bool {
        matches!(self, Status::Terminated(_))
    }

    /// The exit code, if the thread has exited.
    pub fn exit_code(self) -> Option<i32> {
        match self {
            Status::Live => None,
            Status::Terminated(code) => Some(code),
        }
    }

    /// Process exit status to use when this is the last thread standing.
    pub(crate) fn process_code(self) -> i32 {
        self.exit_code().unwrap_or(0)
    }
}

/// Code reported for a thread whose entry panicked.
pub const PANIC_EXIT_CODE: i32 = 101;

pub(crate) type Entry = Box<dyn FnOnce() -> i32>;

/// Which registry list a thread currently hangs off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Membership {
    Live,
    Terminated,
}

/// Registry membership. Scheduler membership is kept by the scheduler itself
/// and never shares these fields.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Links {
    pub(crate) list: Option<Membership>,
    pub(crate) prev: Option<Tid>,
    pub(crate) next: Option<Tid>,
}

/// Thread control block.
pub(crate) struct Thread {
    pub(crate) id: Tid,
    pub(crate) status: Status,
    // `None` for the thread adopted from the host context by `start`
    pub(crate) stack: Option<Stack>,
    pub(crate) context: Context,
    pub(crate) links: Links,
    // taken by the trampoline the first time the thread runs
    pub(crate) entry: Option<Entry>,
}

impl Thread {
    pub(crate) fn new(
        id: Tid,
        stack: Option<Stack>,
        context: Context,
        entry: Option<Entry>,
    ) -> Self {
        Thread {
            id,
            status: Status::Live,
            stack,
            context,
            links: Links::default(),
            entry,
        }
    }

    pub(crate) fn info(&self) -> ThreadInfo {
        ThreadInfo {
            id: self.id,
            status: self.status,
            stack_size: self.stack.as_ref().map(Stack::len),
        }
    }
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id)
            .field("status", &self.status)
            .field("stack", &self.stack)
            .field("links", &self.links)
            .field("started", &self.entry.is_none())
            .finish()
    }
}

/// Snapshot of a thread as returned by [`crate::id_to_thread`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadInfo {
    pub id: Tid,
    pub status: Status,
    /// Size of the thread's own stack mapping; `None` for the thread that
    /// runs on the host stack.
    pub stack_size: Option<usize>,
}
