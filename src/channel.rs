//! Bounded priority channels between pipeline stages.
//!
//! A channel holds at most `capacity` messages. Messages are delivered
//! highest priority first and, within one priority, in send order. Messages
//! are handle records (buffer descriptors), never pixel data.
//!
//! A full channel is the pipeline's backpressure signal: `send` blocks,
//! `send_timeout` gives up after the timeout, and `try_send` fails at once.
//! In every case a message that is not enqueued is handed back to the caller
//! inside the error, so the buffer it refers to is never lost.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Delivery class. Larger values are delivered first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(pub u32);

impl Priority {
    /// Class used for captured frames.
    pub const CAPTURE: Priority = Priority(30);
    /// Class used for detector output.
    pub const TICK: Priority = Priority(29);
}

impl Default for Priority {
    fn default() -> Self {
        Priority::CAPTURE
    }
}

/// A message that could not be enqueued, returned to the caller.
pub enum SendError<T> {
    /// The channel stayed full (immediately, or until the timeout).
    Full(T),
    /// The receiver is gone.
    Closed(T),
}

impl<T> SendError<T> {
    pub fn into_inner(self) -> T {
        match self {
            SendError::Full(msg) | SendError::Closed(msg) => msg,
        }
    }

    pub fn is_full(&self) -> bool {
        matches!(self, SendError::Full(_))
    }
}

impl<T> fmt::Debug for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::Full(_) => f.write_str("Full(..)"),
            SendError::Closed(_) => f.write_str("Closed(..)"),
        }
    }
}

impl<T> fmt::Display for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::Full(_) => f.write_str("channel full"),
            SendError::Closed(_) => f.write_str("channel closed"),
        }
    }
}

impl<T> std::error::Error for SendError<T> {}

/// Why a timed receive returned without a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecvTimeoutError {
    /// No message arrived before the timeout.
    Timeout,
    /// Every sender is gone and the queue is drained.
    Closed,
}

impl fmt::Display for RecvTimeoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecvTimeoutError::Timeout => f.write_str("timed out waiting on channel"),
            RecvTimeoutError::Closed => f.write_str("channel closed"),
        }
    }
}

impl std::error::Error for RecvTimeoutError {}

struct Entry<T> {
    priority: Priority,
    seq: u64,
    msg: T,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl<T> Eq for Entry<T> {}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Entry<T> {
    // Max-heap: higher priority first, then the older (smaller) sequence.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct State<T> {
    queue: BinaryHeap<Entry<T>>,
    next_seq: u64,
    senders: usize,
    receiver_alive: bool,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        // The queue stays structurally valid even if a holder panicked.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Create a channel holding at most `capacity` messages.
///
/// # Panics
///
/// Panics if `capacity` is zero.
pub fn bounded<T>(capacity: usize) -> (Sender<T>, Receiver<T>) {
    assert!(capacity > 0, "channel capacity must be non-zero");
    let shared = Arc::new(Shared {
        state: Mutex::new(State {
            queue: BinaryHeap::with_capacity(capacity),
            next_seq: 0,
            senders: 1,
            receiver_alive: true,
        }),
        not_empty: Condvar::new(),
        not_full: Condvar::new(),
        capacity,
    });
    (
        Sender {
            shared: Arc::clone(&shared),
        },
        Receiver { shared },
    )
}

/// Sending half. Cloneable; the channel closes for the receiver once every
/// sender is dropped.
pub struct Sender<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Sender<T> {
    /// Enqueue, blocking while the channel is full.
    pub fn send(&self, msg: T, priority: Priority) -> Result<(), SendError<T>> {
        self.send_until(msg, priority, None)
    }

    /// Enqueue, waiting at most `timeout` for space.
    pub fn send_timeout(
        &self,
        msg: T,
        priority: Priority,
        timeout: Duration,
    ) -> Result<(), SendError<T>> {
        self.send_until(msg, priority, Some(Instant::now() + timeout))
    }

    /// Enqueue only if there is space right now.
    pub fn try_send(&self, msg: T, priority: Priority) -> Result<(), SendError<T>> {
        self.send_until(msg, priority, Some(Instant::now()))
    }

    fn send_until(
        &self,
        msg: T,
        priority: Priority,
        deadline: Option<Instant>,
    ) -> Result<(), SendError<T>> {
        let mut state = self.shared.lock();
        loop {
            if !state.receiver_alive {
                return Err(SendError::Closed(msg));
            }
            if state.queue.len() < self.shared.capacity {
                break;
            }
            state = match deadline {
                None => self
                    .shared
                    .not_full
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(SendError::Full(msg));
                    }
                    self.shared
                        .not_full
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        state.queue.push(Entry { priority, seq, msg });
        drop(state);
        self.shared.not_empty.notify_one();
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.shared.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// True once the receiver is gone.
    pub fn is_closed(&self) -> bool {
        !self.shared.lock().receiver_alive
    }
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        self.shared.lock().senders += 1;
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        state.senders -= 1;
        if state.senders == 0 {
            drop(state);
            self.shared.not_empty.notify_all();
        }
    }
}

/// Receiving half. Dropping it closes the channel and drops queued messages.
pub struct Receiver<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Receiver<T> {
    /// Block until a message arrives. `None` once closed and drained.
    pub fn recv(&self) -> Option<T> {
        self.recv_until(None).ok()
    }

    /// Wait at most `timeout` for the highest-priority, oldest message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<T, RecvTimeoutError> {
        self.recv_until(Some(Instant::now() + timeout))
    }

    pub fn try_recv(&self) -> Result<T, RecvTimeoutError> {
        self.recv_until(Some(Instant::now()))
    }

    fn recv_until(&self, deadline: Option<Instant>) -> Result<T, RecvTimeoutError> {
        let mut state = self.shared.lock();
        loop {
            if let Some(entry) = state.queue.pop() {
                drop(state);
                self.shared.not_full.notify_one();
                return Ok(entry.msg);
            }
            if state.senders == 0 {
                return Err(RecvTimeoutError::Closed);
            }
            state = match deadline {
                None => self
                    .shared
                    .not_empty
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(RecvTimeoutError::Timeout);
                    }
                    self.shared
                        .not_empty
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }

    pub fn len(&self) -> usize {
        self.shared.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }
}

impl<T> Drop for Receiver<T> {
    fn drop(&mut self) {
        let drained: Vec<Entry<T>> = {
            let mut state = self.shared.lock();
            state.receiver_alive = false;
            state.queue.drain().collect()
        };
        self.shared.not_full.notify_all();
        // Queued messages are dropped outside the lock; their Drop may do I/O.
        drop(drained);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn fifo_within_one_priority() {
        let (tx, rx) = bounded(16);
        for i in 0..16 {
            tx.try_send(i, Priority::CAPTURE).unwrap();
        }
        let received: Vec<i32> = (0..16).map(|_| rx.try_recv().unwrap()).collect();
        assert_eq!(received, (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn higher_priority_delivered_first() {
        let (tx, rx) = bounded(8);
        tx.try_send("low-1", Priority(1)).unwrap();
        tx.try_send("high-1", Priority(9)).unwrap();
        tx.try_send("low-2", Priority(1)).unwrap();
        tx.try_send("high-2", Priority(9)).unwrap();
        let order: Vec<&str> = (0..4).map(|_| rx.try_recv().unwrap()).collect();
        assert_eq!(order, vec!["high-1", "high-2", "low-1", "low-2"]);
    }

    #[test]
    fn full_channel_hands_message_back() {
        let (tx, rx) = bounded(2);
        tx.try_send(1, Priority::CAPTURE).unwrap();
        tx.try_send(2, Priority::CAPTURE).unwrap();
        match tx.try_send(3, Priority::CAPTURE) {
            Err(SendError::Full(msg)) => assert_eq!(msg, 3),
            other => panic!("expected Full, got {:?}", other),
        }
        assert_eq!(tx.len(), 2);
        assert_eq!(rx.try_recv(), Ok(1));
        assert!(tx.try_send(3, Priority::CAPTURE).is_ok());
    }

    #[test]
    fn send_timeout_expires_when_full() {
        let (tx, _rx) = bounded(1);
        tx.send(1, Priority::CAPTURE).unwrap();
        let start = Instant::now();
        let err = tx
            .send_timeout(2, Priority::CAPTURE, Duration::from_millis(30))
            .unwrap_err();
        assert!(err.is_full());
        assert_eq!(err.into_inner(), 2);
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn recv_timeout_reports_no_message() {
        let (_tx, rx) = bounded::<u8>(1);
        assert_eq!(
            rx.recv_timeout(Duration::from_millis(10)),
            Err(RecvTimeoutError::Timeout)
        );
    }

    #[test]
    fn dropping_senders_closes_after_drain() {
        let (tx, rx) = bounded(4);
        let tx2 = tx.clone();
        tx.send(1, Priority::CAPTURE).unwrap();
        drop(tx);
        tx2.send(2, Priority::CAPTURE).unwrap();
        drop(tx2);
        assert_eq!(rx.recv(), Some(1));
        assert_eq!(rx.recv(), Some(2));
        assert_eq!(rx.recv(), None);
        assert_eq!(
            rx.recv_timeout(Duration::from_millis(1)),
            Err(RecvTimeoutError::Closed)
        );
    }

    #[test]
    fn dropping_receiver_unblocks_sender() {
        let (tx, rx) = bounded(1);
        tx.send(0u32, Priority::CAPTURE).unwrap();
        let handle = thread::spawn(move || tx.send(1, Priority::CAPTURE));
        thread::sleep(Duration::from_millis(20));
        drop(rx);
        match handle.join().unwrap() {
            Err(SendError::Closed(msg)) => assert_eq!(msg, 1),
            other => panic!("expected Closed, got {:?}", other),
        }
    }

    #[test]
    fn blocking_send_resumes_when_space_frees() {
        let (tx, rx) = bounded(1);
        tx.send(0u32, Priority::CAPTURE).unwrap();
        let producer = thread::spawn(move || {
            for i in 1..=50 {
                tx.send(i, Priority::CAPTURE).unwrap();
            }
        });
        let mut got = Vec::new();
        while let Some(v) = rx.recv() {
            got.push(v);
        }
        producer.join().unwrap();
        assert_eq!(got, (0..=50).collect::<Vec<_>>());
    }
}
