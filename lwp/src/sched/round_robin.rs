use std::collections::HashMap;

use super::Scheduler;
use crate::thread::Tid;

#[derive(Debug, Clone, Copy)]
struct Ring {
    prev: Tid,
    next: Tid,
}

/// Round-robin over a circular doubly linked pool.
///
/// New threads join just before the head, i.e. at the end of the rotation.
/// `next` hands out the thread under the cursor and moves the cursor on, so
/// with a stable pool every thread comes up once every `qlen()` calls.
#[derive(Debug, Default)]
pub struct RoundRobin {
    ring: HashMap<Tid, Ring>,
    head: Option<Tid>,
    cursor: Option<Tid>,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }

    fn ring_mut(&mut self, tid: Tid) -> &mut Ring {
        self.ring
            .get_mut(&tid)
            .expect("linked thread is in the ring")
    }
}

impl Scheduler for RoundRobin {
    fn admit(&mut self, tid: Tid) {
        let Some(head) = self.head else {
            self.ring.insert(tid, Ring { prev: tid, next: tid });
            self.head = Some(tid);
            self.cursor = Some(tid);
            return;
        };
        let tail = self.ring_mut(head).prev;
        self.ring.insert(tid, Ring { prev: tail, next: head });
        self.ring_mut(tail).next = tid;
        self.ring_mut(head).prev = tid;
    }

    fn remove(&mut self, tid: Tid) {
        let Some(victim) = self.ring.remove(&tid) else {
            return;
        };
        if victim.next == tid {
            self.head = None;
            self.cursor = None;
            return;
        }
        if self.head == Some(tid) {
            self.head = Some(victim.next);
        }
        if self.cursor == Some(tid) {
            self.cursor = Some(victim.next);
        }
        self.ring_mut(victim.prev).next = victim.next;
        self.ring_mut(victim.next).prev = victim.prev;
    }

    fn next(&mut self) -> Option<Tid> {
        let tid = self.cursor?;
        self.cursor = self.ring.get(&tid).map(|ring| ring.next);
        Some(tid)
    }

    fn qlen(&self) -> usize {
        let Some(head) = self.head else {
            return 0;
        };
        let mut len = 1;
        let mut at = head;
        while let Some(ring) = self.ring.get(&at) {
            if ring.next == head {
                break;
            }
            at = ring.next;
            len += 1;
        }
        len
    }
}
