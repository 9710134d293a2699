//! Global thread registries.
//!
//! Every thread that has not been reaped sits on exactly one of two lists:
//! the live set (unordered, new threads go in at the head) or the terminated
//! queue (FIFO, so reaping sees threads in the order they exited). Both are
//! doubly linked through the [`Links`] stored on each TCB; the TCBs themselves
//! are boxed so their saved contexts keep a fixed address.

use std::collections::HashMap;

use crate::thread::{Links, Membership, Thread, Tid};

#[derive(Debug, Default, Clone, Copy)]
struct List {
    head: Option<Tid>,
    tail: Option<Tid>,
}

#[derive(Debug, Default)]
pub(crate) struct Registry {
    threads: HashMap<Tid, Box<Thread>>,
    live: List,
    terminated: List,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn get(&self, tid: Tid) -> Option<&Thread> {
        self.threads.get(&tid).map(|t| &**t)
    }

    pub(crate) fn get_mut(&mut self, tid: Tid) -> Option<&mut Thread> {
        self.threads.get_mut(&tid).map(|t| &mut **t)
    }

    /// Takes ownership of a new thread and puts it at the head of the live set.
    pub(crate) fn register_live(&mut self, thread: Box<Thread>) -> Tid {
        let tid = thread.id;
        self.threads.insert(tid, thread);
        self.push_front(Membership::Live, tid);
        tid
    }

    /// Appends an unlinked thread to the tail of the terminated queue.
    pub(crate) fn register_terminated(&mut self, tid: Tid) {
        self.push_back(Membership::Terminated, tid);
    }

    /// Removes `tid` from whichever list holds it. The thread stays owned by
    /// the registry.
    pub(crate) fn unlink(&mut self, tid: Tid) {
        let Some(links) = self.threads.get(&tid).map(|t| t.links) else {
            return;
        };
        let Some(membership) = links.list else {
            return;
        };

        match links.prev {
            Some(prev) => self.links_mut(prev).next = links.next,
            None => self.list_mut(membership).head = links.next,
        }
        match links.next {
            Some(next) => self.links_mut(next).prev = links.prev,
            None => self.list_mut(membership).tail = links.prev,
        }
        *self.links_mut(tid) = Links::default();
    }

    /// Linear scan of the live set, then the terminated queue.
    pub(crate) fn find_by_id(&self, tid: Tid) -> Option<&Thread> {
        self.iter(Membership::Live)
            .chain(self.iter(Membership::Terminated))
            .find(|thread| thread.id == tid)
    }

    /// Detaches the oldest terminated thread and hands its TCB back.
    pub(crate) fn pop_terminated(&mut self) -> Option<Box<Thread>> {
        let tid = self.terminated.head?;
        self.unlink(tid);
        self.threads.remove(&tid)
    }

    /// All owned threads, in no particular order.
    pub(crate) fn threads_mut(&mut self) -> impl Iterator<Item = &mut Thread> {
        self.threads.values_mut().map(|t| &mut **t)
    }

    fn iter(&self, membership: Membership) -> impl Iterator<Item = &Thread> {
        let mut cursor = self.list(membership).head;
        std::iter::from_fn(move || {
            let thread = self.get(cursor?)?;
            cursor = thread.links.next;
            Some(thread)
        })
    }

    fn push_front(&mut self, membership: Membership, tid: Tid) {
        let head = self.list(membership).head;
        *self.links_mut(tid) = Links {
            list: Some(membership),
            prev: None,
            next: head,
        };
        match head {
            Some(head) => self.links_mut(head).prev = Some(tid),
            None => self.list_mut(membership).tail = Some(tid),
        }
        self.list_mut(membership).head = Some(tid);
    }

    fn push_back(&mut self, membership: Membership, tid: Tid) {
        let tail = self.list(membership).tail;
        *self.links_mut(tid) = Links {
            list: Some(membership),
            prev: tail,
            next: None,
        };
        match tail {
            Some(tail) => self.links_mut(tail).next = Some(tid),
            None => self.list_mut(membership).head = Some(tid),
        }
        self.list_mut(membership).tail = Some(tid);
    }

    fn list(&self, membership: Membership) -> &List {
        match membership {
            Membership::Live => &self.live,
            Membership::Terminated => &self.terminated,
        }
    }

    fn list_mut(&mut self, membership: Membership) -> &mut List {
        match membership {
            Membership::Live => &mut self.live,
            Membership::Terminated => &mut self.terminated,
        }
    }

    // every tid reachable through a list is owned by `threads`
    fn links_mut(&mut self, tid: Tid) -> &mut Links {
        &mut self
            .threads
            .get_mut(&tid)
            .expect("listed thread is owned by the registry")
            .links
    }
}

#[cfg(test)]
impl Registry {
    pub(crate) fn live_count(&self) -> usize {
        self.iter(Membership::Live).count()
    }

    pub(crate) fn live_ids(&self) -> std::collections::BTreeSet<Tid> {
        self.iter(Membership::Live).map(|thread| thread.id).collect()
    }

    pub(crate) fn terminated_count(&self) -> usize {
        self.iter(Membership::Terminated).count()
    }

    /// Walks both lists and checks that every owned thread is on exactly one
    /// of them, with consistent back links and a status matching its list.
    pub(crate) fn check(&self) -> Result<(), String> {
        let mut seen = std::collections::HashSet::new();
        for membership in [Membership::Live, Membership::Terminated] {
            let list = self.list(membership);
            let mut prev = None;
            for thread in self.iter(membership) {
                if !seen.insert(thread.id) {
                    return Err(format!("thread {} listed twice", thread.id));
                }
                if thread.links.list != Some(membership) {
                    return Err(format!("thread {} has wrong membership", thread.id));
                }
                if thread.links.prev != prev {
                    return Err(format!("thread {} has a stale prev link", thread.id));
                }
                if thread.status.is_terminated() != (membership == Membership::Terminated) {
                    return Err(format!("thread {} status does not match list", thread.id));
                }
                prev = Some(thread.id);
            }
            if list.tail != prev {
                return Err(format!("{membership:?} tail is stale"));
            }
        }
        if seen.len() != self.threads.len() {
            return Err(format!(
                "{} threads owned but {} listed",
                self.threads.len(),
                seen.len()
            ));
        }
        Ok(())
    }
}
