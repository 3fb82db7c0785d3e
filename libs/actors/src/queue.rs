//! Per-actor mailbox with three priority classes
//!
//! A queue holds three sub-lists: internal (protocol control), urgent and
//! regular. Push never fails and never blocks. Pop drains internal first,
//! then urgent, then regular, FIFO within each class. The optional
//! internal-only mode is what a paused actor uses to keep protocol traffic
//! flowing while application progress is stopped.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use types::{IFlags, Flags, Message};

/// Hook invoked (outside the queue lock) after every push; the master
/// actor uses this to wake its socket poll through a pipe
pub type PushHook = Box<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Lists {
    internal: VecDeque<Message>,
    urgent: VecDeque<Message>,
    regular: VecDeque<Message>,
}

impl Lists {
    fn len(&self) -> usize {
        self.internal.len() + self.urgent.len() + self.regular.len()
    }

    fn pop(&mut self, internal_only: bool) -> Option<Message> {
        if let Some(msg) = self.internal.pop_front() {
            return Some(msg);
        }
        if internal_only {
            return None;
        }
        self.urgent
            .pop_front()
            .or_else(|| self.regular.pop_front())
    }
}

/// One actor's mailbox
pub struct MessageQueue {
    name: String,
    threshold: usize,
    lists: Mutex<Lists>,
    available: Condvar,
    push_hook: Mutex<Option<PushHook>>,
}

impl MessageQueue {
    /// Create a queue with the given backpressure threshold
    pub fn new(name: impl Into<String>, threshold: usize) -> MessageQueue {
        assert!(threshold > 0, "queue threshold must be positive");
        MessageQueue {
            name: name.into(),
            threshold,
            lists: Mutex::new(Lists::default()),
            available: Condvar::new(),
            push_hook: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Install the post-push hook (master wake-up)
    pub fn set_push_hook(&self, hook: PushHook) {
        *self.push_hook.lock() = Some(hook);
    }

    /// Push a message into the sub-list selected by its class:
    /// internal > urgent > regular. Never fails, never blocks.
    pub fn push(&self, msg: Message) {
        {
            let mut lists = self.lists.lock();
            if msg.iflags().contains(IFlags::INTERNAL) {
                lists.internal.push_back(msg);
            } else if msg.flags().contains(Flags::URGENT) {
                lists.urgent.push_back(msg);
            } else {
                lists.regular.push_back(msg);
            }
            self.available.notify_one();
        }
        if let Some(hook) = self.push_hook.lock().as_ref() {
            hook();
        }
    }

    /// Pop the next message, blocking until one is available
    ///
    /// With `internal_only` set, urgent and regular messages are left
    /// untouched — used while the actor itself is paused by xoff.
    pub fn pop_blocking(&self, internal_only: bool) -> Message {
        let mut lists = self.lists.lock();
        loop {
            if let Some(msg) = lists.pop(internal_only) {
                return msg;
            }
            self.available.wait(&mut lists);
        }
    }

    /// Pop with a deadline: returns `None` if nothing eligible arrived
    /// within `timeout` (paused actors use this so their ntf-xon retry
    /// timer keeps ticking)
    pub fn pop_timeout(&self, internal_only: bool, timeout: std::time::Duration) -> Option<Message> {
        let deadline = std::time::Instant::now() + timeout;
        let mut lists = self.lists.lock();
        loop {
            if let Some(msg) = lists.pop(internal_only) {
                return Some(msg);
            }
            if self.available.wait_until(&mut lists, deadline).timed_out() {
                return lists.pop(internal_only);
            }
        }
    }

    /// Non-blocking pop
    pub fn try_pop(&self, internal_only: bool) -> Option<Message> {
        self.lists.lock().pop(internal_only)
    }

    /// Total size across all three sub-lists (point-in-time snapshot)
    pub fn len(&self) -> usize {
        self.lists.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Has the queue reached its backpressure threshold?
    pub fn is_over_high(&self) -> bool {
        self.len() >= self.threshold
    }

    /// Is the queue still at or above half its threshold? Senders are
    /// resumed once this turns false.
    pub fn is_over_low(&self) -> bool {
        self.len() >= self.threshold / 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use types::Flags;

    fn internal(n: u32) -> Message {
        Message::internal(format!("int-{n}"), "a@local", "b@local")
    }

    fn urgent(n: u32) -> Message {
        let mut msg = Message::new(format!("urg-{n}"), "b@local").with_flags(Flags::URGENT);
        msg.set_sender("a@local");
        msg
    }

    fn regular(n: u32) -> Message {
        let mut msg = Message::new(format!("reg-{n}"), "b@local");
        msg.set_sender("a@local");
        msg
    }

    #[test]
    fn pop_respects_class_precedence() {
        let queue = MessageQueue::new("test", 100);
        queue.push(regular(0));
        queue.push(urgent(0));
        queue.push(internal(0));
        queue.push(regular(1));
        queue.push(internal(1));

        let order: Vec<String> = std::iter::from_fn(|| queue.try_pop(false))
            .map(|m| m.name().to_string())
            .collect();
        assert_eq!(order, vec!["int-0", "int-1", "urg-0", "reg-0", "reg-1"]);
    }

    #[test]
    fn internal_only_mode_leaves_other_classes_queued() {
        let queue = MessageQueue::new("test", 100);
        queue.push(regular(0));
        queue.push(urgent(0));
        assert!(queue.try_pop(true).is_none());

        queue.push(internal(0));
        assert_eq!(queue.try_pop(true).unwrap().name(), "int-0");
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.try_pop(false).unwrap().name(), "urg-0");
    }

    #[test]
    fn thresholds_track_total_size() {
        let queue = MessageQueue::new("test", 4);
        assert!(!queue.is_over_high());
        for n in 0..3 {
            queue.push(regular(n));
        }
        assert!(!queue.is_over_high());
        assert!(queue.is_over_low());
        queue.push(internal(0)); // internal traffic counts too
        assert!(queue.is_over_high());

        while queue.try_pop(false).is_some() {}
        assert!(!queue.is_over_low());
    }

    #[test]
    fn blocking_pop_wakes_on_push() {
        let queue = std::sync::Arc::new(MessageQueue::new("test", 10));
        let q = queue.clone();
        let handle = std::thread::spawn(move || q.pop_blocking(false));
        std::thread::sleep(std::time::Duration::from_millis(20));
        queue.push(regular(7));
        assert_eq!(handle.join().unwrap().name(), "reg-7");
    }

    proptest! {
        /// Whatever the push interleaving, pop order is
        /// internal > urgent > regular with FIFO inside each class.
        #[test]
        fn pop_order_is_stable_per_class(classes in proptest::collection::vec(0u8..3, 0..40)) {
            let queue = MessageQueue::new("prop", 1000);
            let mut counters = [0u32; 3];
            for class in &classes {
                let n = counters[*class as usize];
                counters[*class as usize] += 1;
                match class {
                    0 => queue.push(internal(n)),
                    1 => queue.push(urgent(n)),
                    _ => queue.push(regular(n)),
                }
            }

            let popped: Vec<String> = std::iter::from_fn(|| queue.try_pop(false))
                .map(|m| m.name().to_string())
                .collect();

            let mut expected = Vec::new();
            for (prefix, count) in [("int", counters[0]), ("urg", counters[1]), ("reg", counters[2])] {
                for n in 0..count {
                    expected.push(format!("{prefix}-{n}"));
                }
            }
            prop_assert_eq!(popped, expected);
        }
    }
}
