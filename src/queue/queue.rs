use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;

use super::config::QueueConfig;
use super::{QueueError, Result};

/// One queued message awaiting transmission.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub data: Bytes,
    pub src: u16,
    pub dest: u16,
    pub ack_requested: bool,
    pub time_created: Duration,
    pub ttl: Duration,
    pub value_base: f64,
    /// Identity within the owning queue, assigned on push.
    pub(crate) sequence: u64,
}

impl QueueEntry {
    /// Time-growing priority: zero at creation, `value_base` at expiry.
    pub fn priority(&self, now: Duration) -> f64 {
        let age = now.saturating_sub(self.time_created);
        self.value_base * age.as_secs_f64() / self.ttl.as_secs_f64().max(f64::MIN_POSITIVE)
    }

    pub fn expired(&self, now: Duration) -> bool {
        now >= self.time_created + self.ttl
    }
}

/// A single priority queue. Selection blends value and age; entries past
/// their TTL are never handed out.
pub struct Queue {
    cfg: QueueConfig,
    entries: VecDeque<QueueEntry>,
    next_sequence: u64,
    last_send_time: Option<Duration>,
}

impl Queue {
    pub fn new(cfg: QueueConfig) -> Queue {
        Queue {
            cfg,
            entries: VecDeque::new(),
            next_sequence: 0,
            last_send_time: None,
        }
    }

    pub fn cfg(&self) -> &QueueConfig {
        &self.cfg
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert an entry, assigning its sequence number. When the queue is
    /// full, `newest_first` queues displace their lowest-priority entry (the
    /// displaced entry is returned so the manager can report it expired);
    /// other queues reject the push.
    pub fn push(&mut self, mut entry: QueueEntry, now: Duration) -> Result<Option<QueueEntry>> {
        entry.sequence = self.next_sequence;
        self.next_sequence += 1;

        let displaced = if self.cfg.max_queue > 0 && self.entries.len() >= self.cfg.max_queue {
            if !self.cfg.newest_first {
                return Err(QueueError::Full(self.cfg.key()));
            }
            let lowest = self
                .entries
                .iter()
                .enumerate()
                .min_by(|(_, a), (_, b)| {
                    a.priority(now)
                        .partial_cmp(&b.priority(now))
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .map(|(i, _)| i);
            lowest.and_then(|i| self.entries.remove(i))
        } else {
            None
        };

        self.entries.push_back(entry);
        Ok(displaced)
    }

    /// Index of the highest-priority live entry whose payload fits in
    /// `max_payload_bytes`, honoring the destination constraint and this
    /// queue's blackout. Entries whose sequence appears in `excluded` (those
    /// already stitched into the frame being built) are skipped. Ties go to
    /// the oldest entry unless `newest_first`.
    pub fn top_index(
        &self,
        now: Duration,
        max_payload_bytes: usize,
        dest: Option<u16>,
        excluded: &[u64],
    ) -> Option<usize> {
        if let Some(last) = self.last_send_time {
            if now < last + self.cfg.blackout_time {
                return None;
            }
        }

        let mut best: Option<(usize, f64)> = None;
        for (i, entry) in self.entries.iter().enumerate() {
            if entry.expired(now) {
                continue;
            }
            if entry.data.len() > max_payload_bytes {
                continue;
            }
            if excluded.contains(&entry.sequence) {
                continue;
            }
            if let Some(dest) = dest {
                if entry.dest != dest {
                    continue;
                }
            }

            let priority = entry.priority(now);
            let better = match best {
                None => true,
                // LIFO within equal priority when newest_first
                Some((_, best_priority)) if self.cfg.newest_first => priority >= best_priority,
                Some((_, best_priority)) => priority > best_priority,
            };
            if better {
                best = Some((i, priority));
            }
        }
        best.map(|(i, _)| i)
    }

    pub fn get(&self, index: usize) -> &QueueEntry {
        &self.entries[index]
    }

    /// Remove the entry with the given sequence number (ack, or transmit
    /// without ack requested).
    pub fn remove_sequence(&mut self, sequence: u64) -> Option<QueueEntry> {
        let index = self.entries.iter().position(|e| e.sequence == sequence)?;
        self.entries.remove(index)
    }

    /// Remove and return every expired entry.
    pub fn pop_expired(&mut self, now: Duration) -> Vec<QueueEntry> {
        let mut expired = Vec::new();
        let mut i = 0;
        while i < self.entries.len() {
            if self.entries[i].expired(now) {
                expired.push(self.entries.remove(i).unwrap());
            } else {
                i += 1;
            }
        }
        expired
    }

    pub fn mark_sent(&mut self, now: Duration) {
        self.last_send_time = Some(now);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
