use std::time::Duration;

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Which stack a queue carries: DCCL-encoded messages, legacy CCL messages,
/// or raw user data. The discriminant travels in the stitched frame header.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, IntoPrimitive, TryFromPrimitive,
)]
#[repr(u8)]
pub enum QueueKind {
    Dccl = 0,
    Ccl = 1,
    Data = 2,
}

/// Identity of a queue: kind plus the message id (for DCCL queues, the dccl
/// id).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QueueKey {
    pub kind: QueueKind,
    pub id: u16,
}

impl QueueKey {
    pub fn dccl(id: u16) -> QueueKey {
        QueueKey {
            kind: QueueKind::Dccl,
            id,
        }
    }

    pub fn ccl(id: u16) -> QueueKey {
        QueueKey {
            kind: QueueKind::Ccl,
            id,
        }
    }

    pub fn data(id: u16) -> QueueKey {
        QueueKey {
            kind: QueueKind::Data,
            id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub kind: QueueKind,
    pub id: u16,
    pub name: String,
    /// Maximum number of queued entries; 0 means unbounded.
    pub max_queue: usize,
    /// Entries older than this are expired, never transmitted.
    pub ttl: Duration,
    /// Scales this queue's priority against the others.
    pub value_base: f64,
    /// LIFO ordering within equal priority, and permission to displace the
    /// lowest-priority entry when full.
    pub newest_first: bool,
    /// Minimum interval between successive sends from this queue.
    pub blackout_time: Duration,
    /// Ask the data-on-demand callback at selection time instead of serving
    /// stored entries.
    pub on_demand: bool,
    /// Whether pushed messages request an acoustic acknowledgement unless
    /// overridden per message.
    pub ack: bool,
    /// Destination used when a pushed message does not carry one.
    pub dest: u16,
}

impl QueueConfig {
    pub fn new(kind: QueueKind, id: u16, name: &str) -> QueueConfig {
        QueueConfig {
            kind,
            id,
            name: name.to_string(),
            max_queue: 100,
            ttl: Duration::from_secs(1800),
            value_base: 1.0,
            newest_first: false,
            blackout_time: Duration::ZERO,
            on_demand: false,
            ack: false,
            dest: super::BROADCAST_ID,
        }
    }

    pub fn key(&self) -> QueueKey {
        QueueKey {
            kind: self.kind,
            id: self.id,
        }
    }
}
