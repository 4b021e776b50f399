//! Message queuing for the acoustic link.
//!
//! Producers push encoded messages into per-type priority queues; the modem
//! driver pulls from the [`manager::QueueManager`] on demand, which packs one
//! or more user frames into a single modem frame within the requested byte
//! budget, tracks acknowledgements, and expires messages past their
//! time-to-live.

pub mod config;
pub mod manager;
pub mod queue;

pub use config::{QueueConfig, QueueKey, QueueKind};
pub use manager::QueueManager;
pub use queue::{Queue, QueueEntry};

use bytes::Bytes;
use thiserror::Error;

/// Broadcast destination: frames addressed here are delivered on every node.
pub const BROADCAST_ID: u16 = 0;

/// Field extension numbers understood by the queue layer. A field annotated
/// with one of these (value `HookValue::Bool(true)`) donates its value as the
/// message's source address, destination address or origination time when
/// pushed via [`QueueManager::push_dccl`].
pub const QUEUE_FIELD_IS_SRC: u32 = 1;
pub const QUEUE_FIELD_IS_DEST: u32 = 2;
pub const QUEUE_FIELD_IS_TIME: u32 = 3;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue {0:?} is full")]
    Full(QueueKey),
    #[error("no queue {0:?}")]
    NoSuchQueue(QueueKey),
    #[error("message of {size} bytes exceeds the {max} byte frame record limit")]
    TooBig { size: usize, max: usize },
    #[error(transparent)]
    Dccl(#[from] crate::dccl::DcclError),
}

pub type Result<T> = std::result::Result<T, QueueError>;

/// A request from the modem driver for outgoing data.
#[derive(Debug, Clone)]
pub struct ModemDataRequest {
    pub frame_number: u32,
    pub max_bytes: usize,
    pub src: u16,
    /// When set, only messages for this destination qualify.
    pub dest: Option<u16>,
}

/// One modem frame travelling in either direction between the queue manager
/// and the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModemFrame {
    pub src: u16,
    pub dest: u16,
    pub frame_number: u32,
    pub ack_requested: bool,
    pub data: Bytes,
}

/// A user frame delivered to a receive callback after unstitching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    pub key: QueueKey,
    pub src: u16,
    pub dest: u16,
    pub data: Bytes,
}
