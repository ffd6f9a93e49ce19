//! Lock-free acknowledgement queue
//!
//! Consumer transports report acknowledged ticks from their own threads; the
//! replication loop drains them once per tick before building updates.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

use crate::constants::client::DEFAULT_ACK_BUFFER_CAPACITY;
use crate::net::client::ClientId;
use crate::snapshot::Tick;

/// A consumer confirmed it applied the update for `tick`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckMessage {
    pub client: ClientId,
    pub tick: Tick,
}

/// Bounded MPSC queue of acknowledgements
pub struct AckBuffer {
    sender: Sender<AckMessage>,
    receiver: Receiver<AckMessage>,
    capacity: usize,
}

impl AckBuffer {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = bounded(capacity);
        Self {
            sender,
            receiver,
            capacity,
        }
    }

    /// Handle for one transport thread
    pub fn sender(&self) -> AckSender {
        AckSender {
            sender: self.sender.clone(),
        }
    }

    /// Returns false when the queue is full
    #[inline]
    pub fn try_submit(&self, client: ClientId, tick: Tick) -> bool {
        self.sender.try_send(AckMessage { client, tick }).is_ok()
    }

    /// Everything queued so far, in arrival order
    pub fn drain(&self) -> Vec<AckMessage> {
        self.receiver.try_iter().collect()
    }

    #[inline]
    pub fn pending_count(&self) -> usize {
        self.receiver.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for AckBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_ACK_BUFFER_CAPACITY)
    }
}

/// Clonable submit handle
#[derive(Clone)]
pub struct AckSender {
    sender: Sender<AckMessage>,
}

impl AckSender {
    #[inline]
    pub fn try_send(&self, client: ClientId, tick: Tick) -> Result<(), AckBufferError> {
        self.sender
            .try_send(AckMessage { client, tick })
            .map_err(|e| match e {
                TrySendError::Full(_) => AckBufferError::Full,
                TrySendError::Disconnected(_) => AckBufferError::Disconnected,
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AckBufferError {
    #[error("acknowledgement buffer full")]
    Full,
    #[error("replication loop stopped")]
    Disconnected,
}
