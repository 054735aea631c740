//! The byte-level link to the adapter.
//!
//! A [`Transport`] accepts raw writes and pushes raw notification bytes into
//! a [`NotificationSink`]. It makes no framing guarantees: a single adapter
//! reply may arrive split across any number of [`RawChunk`]s.

pub mod mock;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;
use tracing::{trace, warn};
use uuid::Uuid;

use crate::error::Result;

/// Default capacity of the notification queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// One notification payload as delivered by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawChunk {
    data: Bytes,
    received_at: Instant,
}

impl RawChunk {
    /// Create a chunk stamped with the current time.
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self::with_timestamp(data, Instant::now())
    }

    /// Create a chunk with an explicit arrival time.
    pub fn with_timestamp(data: impl Into<Bytes>, received_at: Instant) -> Self {
        Self {
            data: data.into(),
            received_at,
        }
    }

    /// The payload bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// When the chunk arrived.
    pub fn received_at(&self) -> Instant {
        self.received_at
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Callback handed to a transport for pushing notification bytes.
///
/// Delivery never blocks: when the queue is full the chunk is dropped and a
/// warning is logged, so the BLE notification path is never stalled.
#[derive(Debug, Clone)]
pub struct NotificationSink {
    tx: mpsc::Sender<RawChunk>,
}

impl NotificationSink {
    /// Create a sink and the receiving end of its queue.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<RawChunk>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Push a notification payload. Returns `false` if it was dropped.
    pub fn deliver(&self, data: impl Into<Bytes>) -> bool {
        let chunk = RawChunk::new(data);
        trace!(
            "Notification chunk: {} bytes, {:?}",
            chunk.len(),
            String::from_utf8_lossy(chunk.data())
        );

        match self.tx.try_send(chunk) {
            Ok(()) => true,
            Err(TrySendError::Full(chunk)) => {
                warn!(
                    "Notification queue full, dropping {} byte chunk",
                    chunk.len()
                );
                false
            }
            Err(TrySendError::Closed(_)) => {
                trace!("Notification queue closed, dropping chunk");
                false
            }
        }
    }

    /// Whether the receiving side has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Byte-level link to an adapter.
///
/// Implementations own discovery and GATT resolution; the rest of the crate
/// only writes bytes and receives notification chunks.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect to the adapter at `address` and subscribe to `characteristic`
    /// of `service`.
    async fn connect(&self, address: &str, service: Uuid, characteristic: Uuid) -> Result<()>;

    /// Write raw bytes. Fails when the link is down.
    async fn write(&self, bytes: &[u8]) -> Result<()>;

    /// Register where notification bytes go. Replaces any previous sink.
    fn on_notification(&self, sink: NotificationSink);

    /// Drop the link.
    async fn disconnect(&self) -> Result<()>;
}
