//! A fiber-cooperative multi-producer, multi-consumer channel.
//!
//! Adapted from the teacher's `coio::channel`, rebuilt on [`crate::fiber::Cond`]
//! rather than an OS condvar: `recv()` on an empty channel parks the calling
//! fiber instead of blocking the worker thread, so a channel with no
//! message ready never costs more than one idle worker slot.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::fiber::Cond;

struct Shared<T> {
    queue: Mutex<VecDeque<T>>,
    not_empty: Cond,
    senders: std::sync::atomic::AtomicUsize,
}

/// The sending half. Cloning increments a live-sender count that
/// [`Receiver::recv`] uses to tell "empty, wait" from "empty, and no one
/// can ever send again."
pub struct Sender<T> {
    shared: std::sync::Arc<Shared<T>>,
}

pub struct Receiver<T> {
    shared: std::sync::Arc<Shared<T>>,
}

/// Creates a channel with unbounded capacity.
pub fn channel<T>() -> (Sender<T>, Receiver<T>) {
    let shared = std::sync::Arc::new(Shared {
        queue: Mutex::new(VecDeque::new()),
        not_empty: Cond::new(),
        senders: std::sync::atomic::AtomicUsize::new(1),
    });
    (
        Sender { shared: shared.clone() },
        Receiver { shared },
    )
}

impl<T> Sender<T> {
    /// Pushes `value` and wakes one waiting receiver, if any.
    pub fn send(&self, value: T) {
        self.shared.queue.lock().unwrap().push_back(value);
        self.shared.not_empty.signal();
    }
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        self.shared.senders.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Sender { shared: self.shared.clone() }
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        if self.shared.senders.fetch_sub(1, std::sync::atomic::Ordering::SeqCst) == 1 {
            // Last sender gone: wake every parked receiver so they observe
            // the empty-and-disconnected state rather than waiting forever.
            self.shared.not_empty.broadcast();
        }
    }
}

/// Returned by [`Receiver::recv`] when the queue is empty and every
/// [`Sender`] has been dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Disconnected;

impl<T> Receiver<T> {
    /// Pops the next message, parking the calling fiber while the queue is
    /// empty and at least one sender is still alive.
    pub fn recv(&self) -> Result<T, Disconnected> {
        loop {
            if let Some(value) = self.shared.queue.lock().unwrap().pop_front() {
                return Ok(value);
            }
            if self.shared.senders.load(std::sync::atomic::Ordering::SeqCst) == 0 {
                return Err(Disconnected);
            }
            self.shared.not_empty.wait();
        }
    }

    /// Pops the next message without parking; `None` if the queue is
    /// currently empty, regardless of whether senders remain.
    pub fn try_recv(&self) -> Option<T> {
        self.shared.queue.lock().unwrap().pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber::Fiber;
    use crate::scheduler::Scheduler;
    use std::sync::Mutex as StdMutex;

    #[test]
    fn send_wakes_a_parked_receiver() {
        let scheduler = Scheduler::new(2, false, "chan-test");
        scheduler.start();
        let (tx, rx) = channel::<i32>();
        let received = std::sync::Arc::new(StdMutex::new(None));

        let r = received.clone();
        let receiver = Fiber::new("receiver", 65536, move || {
            *r.lock().unwrap() = rx.recv().ok();
        });
        scheduler.schedule_fiber(receiver, None);

        let sender = Fiber::new("sender", 65536, move || {
            tx.send(42);
        });
        scheduler.schedule_fiber(sender, None);

        scheduler.stop();
        assert_eq!(*received.lock().unwrap(), Some(42));
    }

    #[test]
    fn recv_reports_disconnected_once_every_sender_drops() {
        let scheduler = Scheduler::new(2, false, "chan-test-2");
        scheduler.start();
        let (tx, rx) = channel::<i32>();
        drop(tx);
        let result = std::sync::Arc::new(StdMutex::new(None));

        let r = result.clone();
        let receiver = Fiber::new("receiver", 65536, move || {
            *r.lock().unwrap() = Some(rx.recv());
        });
        scheduler.schedule_fiber(receiver, None);
        scheduler.stop();
        assert_eq!(*result.lock().unwrap(), Some(Err(Disconnected)));
    }
}
