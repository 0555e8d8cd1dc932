use crate::errors::QuikError;

use serde_json::Value;
use std::collections::HashMap;
use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender, TryRecvError, sync_channel};
use std::time::{Duration, Instant};

/// Future response of one request sent to the terminal.
///
/// Resolves to the response frame, to [`QuikError::ResponseTimeout`] once the
/// caller's deadline has passed, or to the I/O error that prevented the
/// request from being written.
#[derive(Debug)]
pub struct ResponseFuture {
    id: Option<u64>,
    state: State,
}

#[derive(Debug)]
enum State {
    Pending {
        receiver: Receiver<Value>,
        /// `None` when the timeout is too long to be represented.
        deadline: Option<Instant>,
        timeout: Duration,
    },
    Failed(QuikError),
    Done,
}

impl ResponseFuture {
    pub(crate) fn failed(id: Option<u64>, error: QuikError) -> Self {
        Self {
            id,
            state: State::Failed(error),
        }
    }

    /// Id of the request, or `None` if no id was issued for it.
    pub fn id(&self) -> Option<u64> {
        self.id
    }

    /// Moment after which the future fails with a timeout. `None` once the
    /// future has resolved, or when the timeout is too long to have a deadline.
    pub fn deadline(&self) -> Option<Instant> {
        match &self.state {
            State::Pending { deadline, .. } => *deadline,
            _ => None,
        }
    }

    /// Blocks until the response arrives or the deadline passes. Without a
    /// deadline it blocks until the response arrives or the transport shuts down.
    pub fn wait(self) -> Result<Value, QuikError> {
        let id = self.id.unwrap_or_default();
        match self.state {
            State::Pending {
                receiver,
                deadline,
                timeout,
            } => match deadline {
                Some(deadline) => {
                    match receiver.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
                        Ok(frame) => Ok(frame),
                        Err(RecvTimeoutError::Timeout) => {
                            Err(QuikError::ResponseTimeout { id, timeout })
                        }
                        Err(RecvTimeoutError::Disconnected) => {
                            Err(abandoned(id, Some(deadline), timeout))
                        }
                    }
                }
                None => receiver.recv().map_err(|_| abandoned(id, None, timeout)),
            },
            State::Failed(error) => Err(error),
            State::Done => Err(QuikError::Cancelled(format!(
                "response to request {} was already taken",
                id
            ))),
        }
    }

    /// Returns the outcome if the future has resolved, without blocking.
    ///
    /// Once an outcome has been returned, the future is spent.
    pub fn try_wait(&mut self) -> Option<Result<Value, QuikError>> {
        let id = self.id.unwrap_or_default();
        let outcome = match &self.state {
            State::Pending {
                receiver,
                deadline,
                timeout,
            } => match receiver.try_recv() {
                Ok(frame) => Ok(frame),
                Err(TryRecvError::Empty) if !is_expired(*deadline, Instant::now()) => return None,
                Err(TryRecvError::Empty) => Err(QuikError::ResponseTimeout {
                    id,
                    timeout: *timeout,
                }),
                Err(TryRecvError::Disconnected) => Err(abandoned(id, *deadline, *timeout)),
            },
            State::Failed(_) | State::Done => Ok(Value::Null),
        };
        match std::mem::replace(&mut self.state, State::Done) {
            State::Pending { .. } => Some(outcome),
            State::Failed(error) => Some(Err(error)),
            State::Done => None,
        }
    }
}

/// Deadline `timeout` from now, or `None` if it cannot be represented.
pub(crate) fn deadline_after(timeout: Duration) -> Option<Instant> {
    Instant::now().checked_add(timeout)
}

fn is_expired(deadline: Option<Instant>, now: Instant) -> bool {
    deadline.is_some_and(|deadline| now >= deadline)
}

fn abandoned(id: u64, deadline: Option<Instant>, timeout: Duration) -> QuikError {
    if is_expired(deadline, Instant::now()) {
        QuikError::ResponseTimeout { id, timeout }
    } else {
        QuikError::Cancelled(format!("request {} was abandoned by the transport", id))
    }
}

#[derive(Debug)]
struct PendingEntry {
    sender: SyncSender<Value>,
    deadline: Option<Instant>,
}

/// Requests sent to the terminal that still wait for their response.
///
/// Keyed by request id. An entry leaves the table when its response arrives,
/// when a sweep finds its deadline passed, or when the transport shuts down.
#[derive(Debug, Default)]
pub(crate) struct PendingResponses {
    entries: HashMap<u64, PendingEntry>,
}

impl PendingResponses {
    /// Registers request `id` and returns the future its response completes.
    pub(crate) fn insert(&mut self, id: u64, timeout: Duration) -> ResponseFuture {
        let (sender, receiver) = sync_channel(1);
        let deadline = deadline_after(timeout);
        self.entries.insert(id, PendingEntry { sender, deadline });
        ResponseFuture {
            id: Some(id),
            state: State::Pending {
                receiver,
                deadline,
                timeout,
            },
        }
    }

    /// Completes request `id` with `frame`.
    ///
    /// Returns `false` if no live entry exists for `id`; the frame is dropped then.
    pub(crate) fn complete(&mut self, id: u64, frame: Value) -> bool {
        match self.entries.remove(&id) {
            Some(entry) if !is_expired(entry.deadline, Instant::now()) => {
                entry.sender.try_send(frame).is_ok()
            }
            _ => false,
        }
    }

    /// Drops every entry whose deadline has passed. Returns how many were dropped.
    pub(crate) fn sweep(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !is_expired(entry.deadline, now));
        before - self.entries.len()
    }

    /// Drops every entry; their futures resolve to [`QuikError::Cancelled`].
    pub(crate) fn cancel_all(&mut self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        count
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
