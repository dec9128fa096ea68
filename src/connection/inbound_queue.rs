use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use bytes::Bytes;
use tokio::sync::Notify;

use crate::error::ConnectionError;


/// A data packet received on a connection, tagged with the channel it arrived on
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ReceivedMessage {
    pub channel: u8,
    pub payload: Bytes,
}

struct QueueState {
    messages: VecDeque<ReceivedMessage>,
    closed: bool,
}

/// Unbounded FIFO of received messages for a single connection. Producers push from the
///  poll cycle, the connection's owner pops.
///
/// Closing the queue wakes a waiting consumer, but messages that were pushed before the close
///  are still handed out before [ConnectionError::ConnectionClosed] is reported.
pub struct InboundQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}
impl InboundQueue {
    pub fn new() -> InboundQueue {
        InboundQueue {
            state: Mutex::new(QueueState {
                messages: VecDeque::new(),
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    /// returns `false` (dropping the message) if the queue is closed
    pub fn push(&self, msg: ReceivedMessage) -> bool {
        {
            let mut state = self.lock();
            if state.closed {
                return false;
            }
            state.messages.push_back(msg);
        }
        self.notify.notify_one();
        true
    }

    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_waiters();
        // a consumer that checked the state but did not start waiting yet picks up the permit
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn try_pop(&self) -> Result<Option<ReceivedMessage>, ConnectionError> {
        let mut state = self.lock();
        match state.messages.pop_front() {
            Some(msg) => Ok(Some(msg)),
            None if state.closed => Err(ConnectionError::ConnectionClosed),
            None => Ok(None),
        }
    }

    pub async fn pop(&self) -> Result<ReceivedMessage, ConnectionError> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(msg) = self.try_pop()? {
                return Ok(msg);
            }
            notified.await;
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for InboundQueue {
    fn default() -> Self {
        Self::new()
    }
}
