use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// A thread-safe FIFO between the channel reader worker and the session
/// thread. `get` blocks; a negative timeout means wait forever.
pub struct MessageQueue<T> {
    messages: Mutex<VecDeque<T>>,
    ready: Condvar,
}

impl<T> MessageQueue<T> {
    pub fn new() -> MessageQueue<T> {
        MessageQueue {
            messages: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
        }
    }

    pub fn put(&self, message: T) {
        let mut messages = self.messages.lock().unwrap();
        messages.push_back(message);
        self.ready.notify_one();
    }

    pub fn get(&self, timeout_ms: i64) -> Option<T> {
        let mut messages = self.messages.lock().unwrap();
        if timeout_ms < 0 {
            while messages.is_empty() {
                messages = self.ready.wait(messages).unwrap();
            }
        } else {
            let deadline = Duration::from_millis(timeout_ms as u64);
            let (guard, result) = self
                .ready
                .wait_timeout_while(messages, deadline, |m| m.is_empty())
                .unwrap();
            messages = guard;
            if result.timed_out() && messages.is_empty() {
                return None;
            }
        }
        messages.pop_front()
    }

    /// Wait until the queue is non-empty. Note that `get` may still block
    /// afterwards if another consumer drains the queue first.
    pub fn wait(&self, timeout_ms: i64) -> bool {
        let messages = self.messages.lock().unwrap();
        if timeout_ms < 0 {
            let mut messages = messages;
            while messages.is_empty() {
                messages = self.ready.wait(messages).unwrap();
            }
            true
        } else {
            let deadline = Duration::from_millis(timeout_ms as u64);
            let (guard, _) = self
                .ready
                .wait_timeout_while(messages, deadline, |m| m.is_empty())
                .unwrap();
            !guard.is_empty()
        }
    }

    pub fn clear(&self) {
        self.messages.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn fifo_order() {
        let q = MessageQueue::new();
        q.put(1);
        q.put(2);
        q.put(3);
        assert_eq!(q.get(0), Some(1));
        assert_eq!(q.get(0), Some(2));
        assert_eq!(q.get(0), Some(3));
        assert_eq!(q.get(0), None);
    }

    #[test]
    fn timeout_expires_on_empty_queue() {
        let q: MessageQueue<u8> = MessageQueue::new();
        assert_eq!(q.get(10), None);
        assert!(!q.wait(10));
    }

    #[test]
    fn cross_thread_handoff() {
        let q = Arc::new(MessageQueue::new());
        let producer = Arc::clone(&q);
        let t = thread::spawn(move || {
            producer.put("stop".to_owned());
        });
        assert_eq!(q.get(-1), Some("stop".to_owned()));
        t.join().unwrap();
    }
}
