//! FIFO hand-off between the reader tasks and the consumer.

use std::{
    collections::VecDeque,
    fmt,
    sync::{Mutex, MutexGuard, PoisonError},
};

use tokio::sync::Notify;

use super::registry::ConnectionId;
use crate::{frame::decode_ascii, transport::SharedTransport};

/// One completed frame and the connection it arrived on.
///
/// The connection may already have been pruned from the registry by the
/// time the frame is consumed; replies to it then simply fail.
#[derive(Clone)]
pub struct InboundFrame {
    pub id: ConnectionId,
    pub transport: SharedTransport,
    pub payload: Vec<u8>,
}

impl InboundFrame {
    /// The payload decoded as ASCII text.
    pub fn text(&self) -> String {
        decode_ascii(&self.payload)
    }
}

impl fmt::Debug for InboundFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundFrame")
            .field("id", &self.id)
            .field("peer", &self.transport.peer_address())
            .field("len", &self.payload.len())
            .finish()
    }
}

/// Global arrival-order queue of completed frames.
pub struct InboundQueue {
    frames: Mutex<VecDeque<InboundFrame>>,
    arrivals: Notify,
}

impl InboundQueue {
    pub fn new() -> Self {
        Self {
            frames: Mutex::new(VecDeque::new()),
            arrivals: Notify::new(),
        }
    }

    fn frames(&self) -> MutexGuard<'_, VecDeque<InboundFrame>> {
        self.frames.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, frame: InboundFrame) {
        self.frames().push_back(frame);
        self.arrivals.notify_one();
    }

    /// Removes the oldest frame, if any.
    pub fn pop(&self) -> Option<InboundFrame> {
        self.frames().pop_front()
    }

    /// Waits until a frame is available and removes it.
    pub async fn next(&self) -> InboundFrame {
        loop {
            if let Some(frame) = self.pop() {
                return frame;
            }
            self.arrivals.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.frames().len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames().is_empty()
    }
}

impl Default for InboundQueue {
    fn default() -> Self {
        Self::new()
    }
}
