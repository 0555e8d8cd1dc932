use crate::errors::{Channel, QuikError};
use crate::frames::Payload;

use serde_json::Value;
use std::fmt;
use std::sync::mpsc::{Receiver, Sender, channel};
use std::time::Duration;

/// Receiver of the transport's lifecycle, callback and error events.
///
/// Every method runs on the transport's listening thread and must return
/// promptly: the usual implementation only enqueues a [`Task`] for the
/// application's execution thread.
pub trait QuikListener: Send + Sync {
    /// Both sockets are open.
    fn on_open(&self);

    /// Both sockets were closed after having been open.
    fn on_close(&self);

    /// The terminal pushed a callback frame on the CB channel.
    fn on_callback(&self, frame: Value);

    /// The MN channel failed, or delivered a frame that could not be handled.
    fn on_exception_mn(&self, error: QuikError);

    /// The CB channel failed, or delivered a frame that could not be handled.
    fn on_exception_cb(&self, error: QuikError);
}

/// Blocking request API of the transport, as seen by the session manager.
pub trait QuikRequester: Send + Sync {
    /// Sends `payload` on `channel` and waits for the response frame.
    fn execute(
        &self,
        channel: Channel,
        payload: Payload,
        timeout: Duration,
    ) -> Result<Value, QuikError>;
}

/// Unit of work executed on the thread that owns `S`.
pub type Task<S> = Box<dyn FnOnce(&mut S) + Send + 'static>;

/// FIFO of [`Task`]s: filled from any thread, drained by the owner of `S`.
pub struct TaskQueue<S> {
    sender: Sender<Task<S>>,
    receiver: Receiver<Task<S>>,
}

impl<S> TaskQueue<S> {
    /// Creates an empty queue.
    pub fn new() -> Self {
        let (sender, receiver) = channel();
        Self { sender, receiver }
    }

    /// Handle that enqueues tasks from other threads.
    pub fn submitter(&self) -> TaskSubmitter<S> {
        TaskSubmitter {
            sender: self.sender.clone(),
        }
    }

    /// Enqueues a task.
    pub fn submit(&self, task: impl FnOnce(&mut S) + Send + 'static) {
        // Cannot fail: `self` owns the receiving end.
        let _ = self.sender.send(Box::new(task));
    }

    /// Takes the oldest task, if any.
    pub fn poll(&self) -> Option<Task<S>> {
        self.receiver.try_recv().ok()
    }
}

impl<S> Default for TaskQueue<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> fmt::Debug for TaskQueue<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskQueue").finish_non_exhaustive()
    }
}

/// Cloneable, thread-safe submitting end of a [`TaskQueue`].
pub struct TaskSubmitter<S> {
    sender: Sender<Task<S>>,
}

impl<S> TaskSubmitter<S> {
    /// Enqueues a task. Returns `false` if the queue no longer exists.
    pub fn submit(&self, task: impl FnOnce(&mut S) + Send + 'static) -> bool {
        self.sender.send(Box::new(task)).is_ok()
    }
}

impl<S> Clone for TaskSubmitter<S> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<S> fmt::Debug for TaskSubmitter<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskSubmitter").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_queue_is_fifo() {
        let queue: TaskQueue<Vec<u32>> = TaskQueue::new();
        queue.submit(|v| v.push(1));
        queue.submit(|v| v.push(2));
        queue.submit(|v| v.push(3));

        let mut state = Vec::new();
        while let Some(task) = queue.poll() {
            task(&mut state);
        }
        assert_eq!(state, vec![1, 2, 3]);
        assert!(queue.poll().is_none());
    }

    #[test]
    fn test_submitter_from_other_thread() {
        let queue: TaskQueue<String> = TaskQueue::new();
        let submitter = queue.submitter();

        thread::spawn(move || {
            assert!(submitter.submit(|s| s.push_str("from transport")));
        })
        .join()
        .unwrap();

        let mut state = String::new();
        queue.poll().unwrap()(&mut state);
        assert_eq!(state, "from transport");
    }

    #[test]
    fn test_submitter_after_queue_dropped() {
        let queue: TaskQueue<u8> = TaskQueue::new();
        let submitter = queue.submitter();
        drop(queue);
        assert!(!submitter.submit(|_| {}));
    }
}
