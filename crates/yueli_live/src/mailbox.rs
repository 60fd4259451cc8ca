//! Bounded per-consumer priority queue.
//!
//! Consumers always receive the most urgent pending event first; among equal
//! priorities, the oldest. When full, the least urgent entry (queued or
//! offered) is the one dropped.

use crate::event::LiveEvent;
use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

/// Orders by priority, then by arrival (earlier first).
type Key = (i32, Reverse<u64>);

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Offer {
    Queued,
    /// Queued after evicting a less urgent event.
    Displaced(Arc<LiveEvent>),
    /// Full of events at least as urgent; the offered one is dropped.
    Rejected,
    Closed,
}

#[derive(Debug, Default)]
struct State {
    queue: BTreeMap<Key, Arc<LiveEvent>>,
    next_seq: u64,
    sender_gone: bool,
    receiver_gone: bool,
}

#[derive(Debug)]
struct Shared {
    capacity: usize,
    state: Mutex<State>,
    ready: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub(crate) fn mailbox(capacity: usize) -> (MailboxSender, LiveReceiver) {
    let shared = Arc::new(Shared {
        capacity: capacity.max(1),
        state: Mutex::new(State::default()),
        ready: Notify::new(),
    });
    (
        MailboxSender {
            shared: Arc::clone(&shared),
        },
        LiveReceiver { shared },
    )
}

/// Hub side of a mailbox. Never waits.
#[derive(Debug)]
pub(crate) struct MailboxSender {
    shared: Arc<Shared>,
}

impl MailboxSender {
    pub(crate) fn is_closed(&self) -> bool {
        self.shared.lock().receiver_gone
    }

    pub(crate) fn offer(&self, event: Arc<LiveEvent>) -> Offer {
        let mut state = self.shared.lock();
        if state.receiver_gone {
            return Offer::Closed;
        }

        let mut displaced = None;
        if state.queue.len() >= self.shared.capacity {
            let lowest = state.queue.first_key_value().map(|((p, _), _)| *p);
            match lowest {
                Some(p) if p < event.priority => displaced = state.queue.pop_first().map(|(_, e)| e),
                _ => return Offer::Rejected,
            }
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        state.queue.insert((event.priority, Reverse(seq)), event);
        drop(state);
        self.shared.ready.notify_one();

        match displaced {
            Some(e) => Offer::Displaced(e),
            None => Offer::Queued,
        }
    }
}

impl Drop for MailboxSender {
    fn drop(&mut self) {
        self.shared.lock().sender_gone = true;
        self.shared.ready.notify_one();
    }
}

/// Consumer side of a live subscription.
#[derive(Debug)]
pub struct LiveReceiver {
    shared: Arc<Shared>,
}

impl LiveReceiver {
    /// Next event by urgency. `None` once the hub is gone and the queue is
    /// drained.
    pub async fn recv(&mut self) -> Option<Arc<LiveEvent>> {
        loop {
            {
                let mut state = self.shared.lock();
                if let Some((_, event)) = state.queue.pop_last() {
                    return Some(event);
                }
                if state.sender_gone {
                    return None;
                }
            }
            self.shared.ready.notified().await;
        }
    }

    pub fn try_recv(&mut self) -> Option<Arc<LiveEvent>> {
        self.shared.lock().queue.pop_last().map(|(_, event)| event)
    }

    pub fn len(&self) -> usize {
        self.shared.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for LiveReceiver {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        state.receiver_gone = true;
        state.queue.clear();
    }
}
