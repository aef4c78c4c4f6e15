//! Memory channel
//!
//! FIFO handoff of owned records between the block thread and worker
//! threads. Request channels are written with a consumer wakeup; the shared
//! reply channel is written without one because the block drains it by
//! periodic polling, which saves a condition-variable wakeup per completed
//! operation.

use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};

#[derive(Debug)]
pub struct MemoryChannel<T> {
    queue: Mutex<VecDeque<T>>,
    cond: Condvar,
}

impl<T> MemoryChannel<T> {
    pub fn new() -> MemoryChannel<T> {
        MemoryChannel {
            queue: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
        }
    }

    /// Enqueue and wake one blocked reader.
    pub fn write_channel(&self, item: T) {
        let mut queue = self.queue.lock();
        queue.push_back(item);
        drop(queue);
        self.cond.notify_one();
    }

    /// Enqueue without waking anyone. Only valid when the consumer polls
    /// with [`try_read_channel`](Self::try_read_channel).
    pub fn write_channel_no_signal(&self, item: T) {
        self.queue.lock().push_back(item);
    }

    /// Dequeue, blocking while the channel is empty.
    pub fn read_channel(&self) -> T {
        let mut queue = self.queue.lock();
        loop {
            if let Some(item) = queue.pop_front() {
                return item;
            }
            self.cond.wait(&mut queue);
        }
    }

    /// Non-blocking dequeue.
    pub fn try_read_channel(&self) -> Option<T> {
        self.queue.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}

impl<T> Default for MemoryChannel<T> {
    fn default() -> Self {
        Self::new()
    }
}
