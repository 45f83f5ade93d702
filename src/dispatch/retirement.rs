//! In-order retirement of out-of-order completions.
//!
//! Every dispatch reserves a [`Ticket`] in submission order. Completions may arrive in any
//! order; a completed value is released only once every earlier ticket has been released.
//! Marking an entry complete and draining the head-aligned run happen under one lock, so two
//! completers can never release values out of order or release one twice.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

/// Position of one dispatch in submission order. Consumed by [`RetirementQueue::complete`].
#[derive(Debug, PartialEq, Eq)]
#[must_use = "an uncompleted ticket blocks every later retirement"]
pub struct Ticket(u64);

impl Ticket {
    /// Submission sequence number.
    pub fn seq(&self) -> u64 {
        self.0
    }
}

struct Inner<T> {
    head: u64,
    next: u64,
    slots: VecDeque<Option<T>>,
    sink: Option<UnboundedSender<T>>,
}

/// FIFO of pending completions released in submission order.
pub struct RetirementQueue<T> {
    inner: Mutex<Inner<T>>,
}

impl<T> std::fmt::Debug for RetirementQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("RetirementQueue")
            .field("head", &inner.head)
            .field("next", &inner.next)
            .finish()
    }
}

impl<T> RetirementQueue<T> {
    /// Queue plus the receiver that observes retired values.
    pub fn new() -> (Self, UnboundedReceiver<T>) {
        let (tx, rx) = unbounded_channel();
        let queue = Self {
            inner: Mutex::new(Inner {
                head: 0,
                next: 0,
                slots: VecDeque::new(),
                sink: Some(tx),
            }),
        };
        (queue, rx)
    }

    /// Reserve the next position.
    pub fn reserve(&self) -> Ticket {
        let mut inner = self.inner.lock();
        let seq = inner.next;
        inner.next += 1;
        inner.slots.push_back(None);
        Ticket(seq)
    }

    /// Mark `ticket` complete with `value` and release every head-aligned completed entry.
    /// Returns how many values were released.
    pub fn complete(&self, ticket: Ticket, value: T) -> usize {
        let mut inner = self.inner.lock();
        let offset = (ticket.0 - inner.head) as usize;
        inner.slots[offset] = Some(value);

        let mut released = 0;
        while matches!(inner.slots.front(), Some(Some(_))) {
            let Some(Some(value)) = inner.slots.pop_front() else {
                break;
            };
            inner.head += 1;
            released += 1;
            if let Some(sink) = &inner.sink {
                // A dropped receiver means nobody waits for results any more.
                let _ = sink.send(value);
            }
        }
        if released > 0 {
            tracing::trace!(head = inner.head, released, "retired");
        }
        released
    }

    /// Entries reserved but not yet released.
    pub fn pending(&self) -> usize {
        self.inner.lock().slots.len()
    }

    /// Stop delivering; the receiver ends once it has drained what was released.
    pub fn close(&self) {
        self.inner.lock().sink = None;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use proptest::prelude::*;

    use super::*;

    fn drain(rx: &mut UnboundedReceiver<usize>) -> Vec<usize> {
        let mut out = Vec::new();
        while let Ok(v) = rx.try_recv() {
            out.push(v);
        }
        out
    }

    #[test]
    fn later_completion_waits_for_head() {
        let (queue, mut rx) = RetirementQueue::new();
        let first = queue.reserve();
        let second = queue.reserve();
        let third = queue.reserve();

        assert_eq!(queue.complete(second, 2), 0);
        assert!(drain(&mut rx).is_empty());
        assert_eq!(queue.pending(), 3);

        assert_eq!(queue.complete(first, 1), 2);
        assert_eq!(drain(&mut rx), vec![1, 2]);

        assert_eq!(queue.complete(third, 3), 1);
        assert_eq!(drain(&mut rx), vec![3]);
        assert_eq!(queue.pending(), 0);
    }

    #[test]
    fn close_ends_the_receiver() {
        let (queue, mut rx) = RetirementQueue::new();
        let t = queue.reserve();
        queue.complete(t, 7);
        queue.close();
        assert_eq!(rx.try_recv().ok(), Some(7));
        assert!(matches!(
            rx.try_recv(),
            Err(tokio::sync::mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn concurrent_completers_release_in_submission_order() {
        let (queue, mut rx) = RetirementQueue::new();
        let queue = Arc::new(queue);
        let tickets: Vec<(usize, Ticket)> = (0..64).map(|i| (i, queue.reserve())).collect();

        let handles: Vec<_> = tickets
            .into_iter()
            .rev()
            .map(|(i, ticket)| {
                let queue = Arc::clone(&queue);
                std::thread::spawn(move || {
                    queue.complete(ticket, i);
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("completer thread should finish");
        }

        assert_eq!(drain(&mut rx), (0..64).collect::<Vec<_>>());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(1000))]

        #[test]
        fn retirement_order_ignores_completion_order(
            order in (1usize..24).prop_flat_map(|n| Just((0..n).collect::<Vec<_>>()).prop_shuffle())
        ) {
            let (queue, mut rx) = RetirementQueue::new();
            let mut tickets: Vec<Option<Ticket>> = (0..order.len()).map(|_| Some(queue.reserve())).collect();
            for &i in &order {
                let ticket = tickets[i].take().expect("each ticket completes once");
                queue.complete(ticket, i);
            }
            prop_assert_eq!(drain(&mut rx), (0..order.len()).collect::<Vec<_>>());
            prop_assert_eq!(queue.pending(), 0);
        }
    }
}
