use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tracing::{debug, trace, warn};

use crate::dccl::id_codec::{DefaultIdCodec, IdCodec};
use crate::dccl::{DcclCodec, FieldValue, MessageValue};
use crate::util::clock::Clock;

use super::config::{QueueConfig, QueueKey, QueueKind};
use super::queue::{Queue, QueueEntry};
use super::{
    ModemDataRequest, ModemFrame, QueueError, QueueMessage, Result, BROADCAST_ID,
    QUEUE_FIELD_IS_DEST, QUEUE_FIELD_IS_SRC,
};

type MessageCallback = Box<dyn FnMut(&QueueMessage)>;
type EntryCallback = Box<dyn FnMut(QueueKey, &QueueEntry)>;
type SizeCallback = Box<dyn FnMut(QueueKey, usize)>;
type OnDemandCallback = Box<dyn FnMut(QueueKey, &ModemDataRequest) -> Option<Bytes>>;

/// Arbitrates across queues, stitches user frames into modem frames, routes
/// inbound frames to per-queue receive callbacks, and matches acks.
///
/// Queues are owned by value, keyed by [`QueueKey`]; selection ties break by
/// ascending key order.
pub struct QueueManager {
    modem_id: u16,
    clock: Arc<dyn Clock>,
    queues: BTreeMap<QueueKey, Queue>,
    /// frame number -> entries whose ack is outstanding in that frame
    waiting_for_ack: FxHashMap<u32, Vec<(QueueKey, u64)>>,
    id_codec: DefaultIdCodec,
    stitch_errors: u64,

    cb_receive: Option<MessageCallback>,
    cb_receive_ccl: Option<MessageCallback>,
    cb_ack: Option<EntryCallback>,
    cb_expire: Option<EntryCallback>,
    cb_queue_size: Option<SizeCallback>,
    cb_on_demand: Option<OnDemandCallback>,
}

impl QueueManager {
    pub fn new(modem_id: u16, clock: Arc<dyn Clock>) -> QueueManager {
        QueueManager {
            modem_id,
            clock,
            queues: BTreeMap::new(),
            waiting_for_ack: FxHashMap::default(),
            id_codec: DefaultIdCodec,
            stitch_errors: 0,
            cb_receive: None,
            cb_receive_ccl: None,
            cb_ack: None,
            cb_expire: None,
            cb_queue_size: None,
            cb_on_demand: None,
        }
    }

    pub fn set_modem_id(&mut self, modem_id: u16) {
        self.modem_id = modem_id;
    }

    pub fn modem_id(&self) -> u16 {
        self.modem_id
    }

    /// Create (or replace) a queue. Queue ids must fit the wire id codec
    /// (at most 32767).
    pub fn add_queue(&mut self, cfg: QueueConfig) -> QueueKey {
        let key = cfg.key();
        if self.id_codec.validate(key.id).is_err() {
            warn!(?key, "queue id does not fit the wire header and will never be selected");
        }
        if self.queues.insert(key, Queue::new(cfg)).is_some() {
            warn!(?key, "replacing existing queue");
        }
        key
    }

    /// Callback for received DCCL and raw-data user frames.
    pub fn set_receive_cb(&mut self, cb: MessageCallback) {
        self.cb_receive = Some(cb);
    }

    /// Callback for received CCL user frames.
    pub fn set_receive_ccl_cb(&mut self, cb: MessageCallback) {
        self.cb_receive_ccl = Some(cb);
    }

    /// Callback invoked once per acknowledged entry.
    pub fn set_ack_cb(&mut self, cb: EntryCallback) {
        self.cb_ack = Some(cb);
    }

    /// Callback invoked exactly once per entry that exceeds its TTL (or is
    /// displaced from a full `newest_first` queue).
    pub fn set_expire_cb(&mut self, cb: EntryCallback) {
        self.cb_expire = Some(cb);
    }

    /// Callback invoked with the new size whenever a queue grows or shrinks.
    pub fn set_queue_size_cb(&mut self, cb: SizeCallback) {
        self.cb_queue_size = Some(cb);
    }

    /// Callback supplying data at selection time for `on_demand` queues.
    pub fn set_data_on_demand_cb(&mut self, cb: OnDemandCallback) {
        self.cb_on_demand = Some(cb);
    }

    /// Push an already-encoded message. `dest`/`ack` default from the queue
    /// config when not given.
    pub fn push_message(
        &mut self,
        key: QueueKey,
        data: Bytes,
        dest: Option<u16>,
        ack: Option<bool>,
    ) -> Result<()> {
        self.push_entry(key, data, None, dest, ack)
    }

    /// Encode a DCCL message and push it to its queue, harvesting src/dest
    /// from fields annotated with the queue extensions.
    pub fn push_dccl(&mut self, codec: &DcclCodec, msg: &MessageValue) -> Result<()> {
        let key = QueueKey::dccl(msg.descriptor().dccl_id);

        let mut src = None;
        let mut dest = None;
        crate::dccl::registry::for_each_extension(msg, &mut |number, value, ext| {
            if ext.as_bool() != Some(true) {
                return;
            }
            let as_u16 = match value {
                FieldValue::Int(v) if *v >= 0 => Some(*v as u16),
                FieldValue::UInt(v) => Some(*v as u16),
                _ => None,
            };
            match number {
                QUEUE_FIELD_IS_SRC => src = as_u16,
                QUEUE_FIELD_IS_DEST => dest = as_u16,
                _ => {}
            }
        });

        let data = codec.encode(msg)?;
        self.push_entry(key, data, src, dest, None)
    }

    fn push_entry(
        &mut self,
        key: QueueKey,
        data: Bytes,
        src: Option<u16>,
        dest: Option<u16>,
        ack: Option<bool>,
    ) -> Result<()> {
        let now = self.clock.now();
        let max_payload = 255 - 1 - self.id_codec.size(key.id);
        if data.len() > max_payload {
            return Err(QueueError::TooBig {
                size: data.len(),
                max: max_payload,
            });
        }

        let modem_id = self.modem_id;
        let queue = self
            .queues
            .get_mut(&key)
            .ok_or(QueueError::NoSuchQueue(key))?;
        let cfg = queue.cfg();
        let entry = QueueEntry {
            data,
            src: src.unwrap_or(modem_id),
            dest: dest.unwrap_or(cfg.dest),
            ack_requested: ack.unwrap_or(cfg.ack),
            time_created: now,
            ttl: cfg.ttl,
            value_base: cfg.value_base,
            sequence: 0,
        };

        let displaced = queue.push(entry, now)?;
        trace!(?key, "pushed message");
        if let Some(displaced) = displaced {
            debug!(?key, "full queue displaced its lowest priority entry");
            if let Some(cb) = &mut self.cb_expire {
                cb(key, &displaced);
            }
        }
        self.emit_queue_size(key);
        Ok(())
    }

    /// Select and pack outgoing user frames into one modem frame within the
    /// requested byte budget. Returns `None` when no queue has eligible data
    /// (no available destination).
    pub fn provide_outgoing_modem_data(
        &mut self,
        request: &ModemDataRequest,
    ) -> Option<ModemFrame> {
        self.run_on_demand(request);

        let now = self.clock.now();
        let mut out = BytesMut::new();
        let mut locked_dest = request.dest;
        let mut ack_requested = false;
        let mut taken: Vec<(QueueKey, u64)> = Vec::new();

        loop {
            let remaining = request.max_bytes - out.len();
            let first_record = out.is_empty();
            let Some((key, index)) = self.find_next_sender(now, remaining, locked_dest, first_record, &taken)
            else {
                break;
            };

            let mut header = vec![u8::from(key.kind)];
            self.id_codec
                .encode(key.id, &mut header)
                .expect("queue ids are validated against the id codec");

            let queue = self.queues.get_mut(&key).expect("selected queue exists");
            let entry = queue.get(index);
            let entry_dest = entry.dest;
            let entry_sequence = entry.sequence;
            let entry_ack = entry.ack_requested;
            let record_len = header.len() + entry.data.len();

            if first_record && 1 + record_len > remaining {
                // single-frame optimization: a first record filling the
                // budget exactly travels without its length prefix
                out.put_slice(&header);
                out.put_slice(&entry.data);
            } else {
                out.put_u8(record_len as u8);
                out.put_slice(&header);
                out.put_slice(&entry.data);
            }

            queue.mark_sent(now);
            if !entry_ack {
                queue.remove_sequence(entry_sequence);
                self.emit_queue_size(key);
            }

            locked_dest = Some(entry_dest);
            ack_requested |= entry_ack;
            taken.push((key, entry_sequence));
            if entry_ack {
                self.waiting_for_ack
                    .entry(request.frame_number)
                    .or_default()
                    .push((key, entry_sequence));
            }

            if out.len() >= request.max_bytes {
                break;
            }
        }

        if taken.is_empty() {
            return None;
        }

        debug!(
            frame = request.frame_number,
            user_frames = taken.len(),
            bytes = out.len(),
            "packed modem frame"
        );
        Some(ModemFrame {
            src: request.src,
            dest: locked_dest.unwrap_or(BROADCAST_ID),
            frame_number: request.frame_number,
            ack_requested,
            data: out.freeze(),
        })
    }

    fn run_on_demand(&mut self, request: &ModemDataRequest) {
        let Some(cb) = &mut self.cb_on_demand else {
            return;
        };

        let now = self.clock.now();
        let mut pushed = Vec::new();
        for (key, queue) in &mut self.queues {
            if !queue.cfg().on_demand || !queue.is_empty() {
                continue;
            }
            if let Some(data) = cb(*key, request) {
                let cfg = queue.cfg();
                let entry = QueueEntry {
                    data,
                    src: request.src,
                    dest: request.dest.unwrap_or(cfg.dest),
                    ack_requested: cfg.ack,
                    time_created: now,
                    ttl: cfg.ttl,
                    value_base: cfg.value_base,
                    sequence: 0,
                };
                if queue.push(entry, now).is_ok() {
                    pushed.push(*key);
                }
            }
        }
        for key in pushed {
            self.emit_queue_size(key);
        }
    }

    /// Scan all queues for the highest-priority eligible entry not already
    /// stitched into this frame. The record header (length prefix, kind,
    /// queue id) counts against the budget; the length prefix is waived for a
    /// first record that fills the frame exactly.
    fn find_next_sender(
        &self,
        now: Duration,
        remaining: usize,
        dest: Option<u16>,
        first_record: bool,
        taken: &[(QueueKey, u64)],
    ) -> Option<(QueueKey, usize)> {
        let mut best: Option<(f64, QueueKey, usize)> = None;
        for (key, queue) in &self.queues {
            if self.id_codec.validate(key.id).is_err() {
                continue;
            }
            let header_len = 1 + self.id_codec.size(key.id);
            let max_payload = if first_record {
                remaining.checked_sub(header_len)
            } else {
                remaining.checked_sub(1 + header_len)
            };
            let Some(max_payload) = max_payload else {
                continue;
            };

            let excluded: Vec<u64> = taken
                .iter()
                .filter(|(k, _)| k == key)
                .map(|(_, seq)| *seq)
                .collect();
            if let Some(index) = queue.top_index(now, max_payload, dest, &excluded) {
                let priority = queue.get(index).priority(now);
                let better = match &best {
                    None => true,
                    Some((best_priority, _, _)) => priority > *best_priority,
                };
                if better {
                    best = Some((priority, *key, index));
                }
            }
        }
        best.map(|(_, key, index)| (key, index))
    }

    /// The destination the next transmission would go to, for the MAC layer.
    pub fn request_next_destination(&mut self, max_bytes: usize) -> Option<u16> {
        let now = self.clock.now();
        self.find_next_sender(now, max_bytes, None, true, &[])
            .map(|(key, index)| self.queues[&key].get(index).dest)
    }

    /// Unstitch a received modem frame and deliver each user frame to the
    /// matching receive callback.
    pub fn receive_incoming_modem_data(&mut self, frame: &ModemFrame) {
        if frame.dest != self.modem_id && frame.dest != BROADCAST_ID {
            debug!(
                dest = frame.dest,
                modem_id = self.modem_id,
                "ignoring frame for another destination"
            );
            return;
        }

        let records = self.unstitch(&frame.data);
        for (key, payload) in records {
            let message = QueueMessage {
                key,
                src: frame.src,
                dest: frame.dest,
                data: payload,
            };
            let cb = match key.kind {
                QueueKind::Ccl => &mut self.cb_receive_ccl,
                _ => &mut self.cb_receive,
            };
            match cb {
                Some(cb) => cb(&message),
                None => debug!(?key, "received message but no receive callback is set"),
            }
        }
    }

    fn unstitch(&mut self, data: &Bytes) -> Vec<(QueueKey, Bytes)> {
        let mut records = Vec::new();
        let mut offset = 0usize;

        while offset < data.len() {
            let len = data[offset] as usize;
            let start = offset + 1;
            let parsed = if len == 0 || start + len > data.len() {
                None
            } else {
                self.parse_record(data.slice(start..start + len))
            };

            match parsed {
                Some(record) => {
                    records.push(record);
                    offset = start + len;
                }
                None if offset == 0 => {
                    // a first record that filled the frame exactly was sent
                    // without its length prefix
                    match self.parse_record(data.clone()) {
                        Some(record) => records.push(record),
                        None => {
                            self.stitch_errors += 1;
                            warn!("dropping unparseable modem frame {:?}", hex::encode(data));
                        }
                    }
                    return records;
                }
                None => {
                    self.stitch_errors += 1;
                    warn!(
                        offset,
                        "malformed user frame length, dropping remainder of modem frame"
                    );
                    return records;
                }
            }
        }
        records
    }

    fn parse_record(&self, record: Bytes) -> Option<(QueueKey, Bytes)> {
        let kind = QueueKind::try_from(*record.first()?).ok()?;
        let (id, id_len) = self.id_codec.decode(&record[1..]).ok()?;
        Some((QueueKey { kind, id }, record.slice(1 + id_len..)))
    }

    /// Match a modem acknowledgement against outstanding entries; each match
    /// fires the ack callback exactly once and removes the entry.
    pub fn handle_modem_ack(&mut self, frame_number: u32, src: u16, dest: u16) {
        let Some(waiting) = self.waiting_for_ack.remove(&frame_number) else {
            debug!(
                frame_number,
                src, dest, "acknowledgement for frame we were not expecting"
            );
            return;
        };

        for (key, sequence) in waiting {
            let Some(entry) = self
                .queues
                .get_mut(&key)
                .and_then(|q| q.remove_sequence(sequence))
            else {
                debug!(?key, sequence, "acknowledged entry already gone");
                continue;
            };
            debug!(?key, frame_number, "message acknowledged");
            if let Some(cb) = &mut self.cb_ack {
                cb(key, &entry);
            }
            self.emit_queue_size(key);
        }
    }

    /// Periodic tick: expire entries past their TTL.
    pub fn do_work(&mut self) {
        let now = self.clock.now();
        let keys: Vec<QueueKey> = self.queues.keys().copied().collect();
        for key in keys {
            let expired = self
                .queues
                .get_mut(&key)
                .map(|q| q.pop_expired(now))
                .unwrap_or_default();
            if expired.is_empty() {
                continue;
            }
            debug!(?key, count = expired.len(), "expired queued messages");
            for entry in &expired {
                if let Some(cb) = &mut self.cb_expire {
                    cb(key, entry);
                }
            }
            self.emit_queue_size(key);
        }
    }

    pub fn stitch_errors(&self) -> u64 {
        self.stitch_errors
    }

    /// Human readable roster of the loaded queues.
    pub fn summary(&self) -> String {
        let mut out = format!("queue manager for modem id {}\n", self.modem_id);
        for (key, queue) in &self.queues {
            out.push_str(&format!(
                "  {:?} {}: {} queued, ttl {:?}, value {}\n",
                key,
                queue.cfg().name,
                queue.len(),
                queue.cfg().ttl,
                queue.cfg().value_base,
            ));
        }
        out
    }

    fn emit_queue_size(&mut self, key: QueueKey) {
        let size = self.queues.get(&key).map(Queue::len).unwrap_or(0);
        if let Some(cb) = &mut self.cb_queue_size {
            cb(key, size);
        }
    }
}

#[cfg(test)]
mod test {
    use std::cell::RefCell;
    use std::rc::Rc;

    use crate::util::clock::SimClock;

    use super::*;

    fn manager_with_queue(modem_id: u16, cfg: QueueConfig) -> (QueueManager, SimClock) {
        let clock = SimClock::new();
        let mut manager = QueueManager::new(modem_id, Arc::new(clock.clone()));
        manager.add_queue(cfg);
        (manager, clock)
    }

    fn request(max_bytes: usize) -> ModemDataRequest {
        ModemDataRequest {
            frame_number: 0,
            max_bytes,
            src: 1,
            dest: None,
        }
    }

    #[test]
    fn test_loopback_push_then_pop() {
        let data = Bytes::from_static(&[
            0x20, 0x00, 0x80, 0x25, 0x00, 0x00, 0x61, 0x62, 0x63, 0x64, 0x31, 0x32, 0x33, 0x34,
        ]);
        let (mut manager, _clock) =
            manager_with_queue(1, QueueConfig::new(QueueKind::Dccl, 1, "simple"));

        manager
            .push_message(QueueKey::dccl(1), data.clone(), Some(1), None)
            .unwrap();

        let frame = manager.provide_outgoing_modem_data(&request(32)).unwrap();
        // one record: length prefix, then the queue header, then the payload
        assert_eq!(frame.dest, 1);
        assert_eq!(frame.data.len(), 1 + 2 + data.len());
        assert_eq!(frame.data[0], (2 + data.len()) as u8);
        assert_eq!(frame.data[1], 0x00); // dccl kind
        assert_eq!(frame.data[2], 0x01); // queue id 1
        assert_eq!(&frame.data[3..], &data[..]);

        let received = Rc::new(RefCell::new(Vec::new()));
        let received_in_cb = received.clone();
        manager.set_receive_cb(Box::new(move |msg| {
            received_in_cb.borrow_mut().push(msg.clone());
        }));

        manager.receive_incoming_modem_data(&frame);
        let received = received.borrow();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].key, QueueKey::dccl(1));
        assert_eq!(received[0].data, data);
    }

    #[test]
    fn test_no_data_returns_none() {
        let (mut manager, _clock) =
            manager_with_queue(1, QueueConfig::new(QueueKind::Dccl, 1, "simple"));
        assert!(manager.provide_outgoing_modem_data(&request(32)).is_none());
    }

    #[test]
    fn test_stitch_multiple_user_frames() {
        let (mut manager, _clock) =
            manager_with_queue(1, QueueConfig::new(QueueKind::Dccl, 1, "simple"));
        manager
            .push_message(QueueKey::dccl(1), Bytes::from_static(b"aaaa"), Some(2), None)
            .unwrap();
        manager
            .push_message(QueueKey::dccl(1), Bytes::from_static(b"bb"), Some(2), None)
            .unwrap();

        let frame = manager.provide_outgoing_modem_data(&request(32)).unwrap();
        // [6][0][1]aaaa [4][0][1]bb
        assert_eq!(
            &frame.data[..],
            &[6, 0, 1, b'a', b'a', b'a', b'a', 4, 0, 1, b'b', b'b'][..]
        );

        let received = Rc::new(RefCell::new(Vec::new()));
        let received_in_cb = received.clone();
        manager.set_receive_cb(Box::new(move |msg| {
            received_in_cb.borrow_mut().push(msg.data.clone());
        }));
        let mut inbound = frame.clone();
        inbound.dest = 1;
        manager.receive_incoming_modem_data(&inbound);
        assert_eq!(&*received.borrow(), &[Bytes::from_static(b"aaaa"), Bytes::from_static(b"bb")]);
    }

    #[test]
    fn test_dest_lock_excludes_other_destinations() {
        let (mut manager, _clock) =
            manager_with_queue(1, QueueConfig::new(QueueKind::Dccl, 1, "simple"));
        manager
            .push_message(QueueKey::dccl(1), Bytes::from_static(b"to2"), Some(2), None)
            .unwrap();
        manager
            .push_message(QueueKey::dccl(1), Bytes::from_static(b"to3"), Some(3), None)
            .unwrap();

        let frame = manager.provide_outgoing_modem_data(&request(32)).unwrap();
        assert_eq!(frame.dest, 2);
        assert!(frame.data.ends_with(b"to2"));
        // the second message stays queued for a later frame
        let frame2 = manager.provide_outgoing_modem_data(&request(32)).unwrap();
        assert_eq!(frame2.dest, 3);
    }

    #[test]
    fn test_single_frame_optimization_round_trip() {
        let (mut manager, _clock) =
            manager_with_queue(1, QueueConfig::new(QueueKind::Dccl, 1, "simple"));
        // record without prefix: kind (1) + id (1) + payload (6) == budget of 8
        manager
            .push_message(QueueKey::dccl(1), Bytes::from_static(b"abcdef"), Some(1), None)
            .unwrap();

        let frame = manager.provide_outgoing_modem_data(&request(8)).unwrap();
        assert_eq!(&frame.data[..], &[0, 1, b'a', b'b', b'c', b'd', b'e', b'f'][..]);

        let received = Rc::new(RefCell::new(Vec::new()));
        let received_in_cb = received.clone();
        manager.set_receive_cb(Box::new(move |msg| {
            received_in_cb.borrow_mut().push(msg.data.clone());
        }));
        manager.receive_incoming_modem_data(&frame);
        assert_eq!(&*received.borrow(), &[Bytes::from_static(b"abcdef")]);
    }

    #[test]
    fn test_malformed_length_drops_remainder() {
        let (mut manager, _clock) =
            manager_with_queue(1, QueueConfig::new(QueueKind::Dccl, 1, "simple"));
        let received = Rc::new(RefCell::new(Vec::new()));
        let received_in_cb = received.clone();
        manager.set_receive_cb(Box::new(move |msg| {
            received_in_cb.borrow_mut().push(msg.data.clone());
        }));

        // valid first record, then a length running past the end
        let frame = ModemFrame {
            src: 2,
            dest: 1,
            frame_number: 0,
            ack_requested: false,
            data: Bytes::from_static(&[3, 0, 1, b'x', 250, 0, 1]),
        };
        manager.receive_incoming_modem_data(&frame);

        assert_eq!(&*received.borrow(), &[Bytes::from_static(b"x")]);
        assert_eq!(manager.stitch_errors(), 1);
    }

    #[test]
    fn test_ack_round_trip() {
        let mut cfg = QueueConfig::new(QueueKind::Dccl, 1, "simple");
        cfg.ack = true;
        let (mut manager, _clock) = manager_with_queue(1, cfg);
        manager
            .push_message(QueueKey::dccl(1), Bytes::from_static(b"needs ack"), Some(2), None)
            .unwrap();

        let acked = Rc::new(RefCell::new(Vec::new()));
        let acked_in_cb = acked.clone();
        manager.set_ack_cb(Box::new(move |key, entry| {
            acked_in_cb.borrow_mut().push((key, entry.data.clone()));
        }));

        let frame = manager
            .provide_outgoing_modem_data(&ModemDataRequest {
                frame_number: 4,
                max_bytes: 32,
                src: 1,
                dest: None,
            })
            .unwrap();
        assert!(frame.ack_requested);

        // entry is retained until the ack arrives
        manager.handle_modem_ack(4, 2, 1);
        assert_eq!(
            &*acked.borrow(),
            &[(QueueKey::dccl(1), Bytes::from_static(b"needs ack"))]
        );
        // a duplicate ack is ignored
        manager.handle_modem_ack(4, 2, 1);
        assert_eq!(acked.borrow().len(), 1);
    }

    #[test]
    fn test_unmatched_ack_is_not_fatal() {
        let (mut manager, _clock) =
            manager_with_queue(1, QueueConfig::new(QueueKind::Dccl, 1, "simple"));
        manager.handle_modem_ack(9, 2, 1);
    }

    #[test]
    fn test_no_ack_entry_removed_on_transmit() {
        let (mut manager, _clock) =
            manager_with_queue(1, QueueConfig::new(QueueKind::Dccl, 1, "simple"));
        manager
            .push_message(QueueKey::dccl(1), Bytes::from_static(b"fire and forget"), Some(2), None)
            .unwrap();

        assert!(manager.provide_outgoing_modem_data(&request(32)).is_some());
        assert!(manager.provide_outgoing_modem_data(&request(32)).is_none());
    }

    #[test]
    fn test_ttl_expiry_fires_callback_once() {
        let mut cfg = QueueConfig::new(QueueKind::Dccl, 1, "simple");
        cfg.ttl = Duration::from_secs(5);
        let (mut manager, clock) = manager_with_queue(1, cfg);
        manager
            .push_message(QueueKey::dccl(1), Bytes::from_static(b"short lived"), Some(2), None)
            .unwrap();

        let expired = Rc::new(RefCell::new(0));
        let expired_in_cb = expired.clone();
        manager.set_expire_cb(Box::new(move |_, _| *expired_in_cb.borrow_mut() += 1));

        clock.advance(Duration::from_secs(6));
        manager.do_work();
        manager.do_work();

        assert_eq!(*expired.borrow(), 1);
        assert!(manager.provide_outgoing_modem_data(&request(32)).is_none());
    }

    #[test]
    fn test_queue_size_events_on_push_and_pop() {
        let (mut manager, _clock) =
            manager_with_queue(1, QueueConfig::new(QueueKind::Dccl, 1, "simple"));
        let sizes = Rc::new(RefCell::new(Vec::new()));
        let sizes_in_cb = sizes.clone();
        manager.set_queue_size_cb(Box::new(move |_, size| sizes_in_cb.borrow_mut().push(size)));

        manager
            .push_message(QueueKey::dccl(1), Bytes::from_static(b"x"), Some(2), None)
            .unwrap();
        manager.provide_outgoing_modem_data(&request(32)).unwrap();

        assert_eq!(&*sizes.borrow(), &[1, 0]);
    }

    #[test]
    fn test_higher_value_queue_wins() {
        let clock = SimClock::new();
        let mut manager = QueueManager::new(1, Arc::new(clock.clone()));
        let mut low = QueueConfig::new(QueueKind::Dccl, 1, "low");
        low.value_base = 1.0;
        let mut high = QueueConfig::new(QueueKind::Dccl, 2, "high");
        high.value_base = 10.0;
        manager.add_queue(low);
        manager.add_queue(high);

        manager
            .push_message(QueueKey::dccl(1), Bytes::from_static(b"low"), Some(2), None)
            .unwrap();
        manager
            .push_message(QueueKey::dccl(2), Bytes::from_static(b"high"), Some(2), None)
            .unwrap();
        clock.advance(Duration::from_secs(10));

        let frame = manager.provide_outgoing_modem_data(&request(8)).unwrap();
        assert!(frame.data.ends_with(b"high"));
    }

    #[test]
    fn test_request_next_destination() {
        let (mut manager, clock) =
            manager_with_queue(1, QueueConfig::new(QueueKind::Dccl, 1, "simple"));
        assert_eq!(manager.request_next_destination(32), None);
        manager
            .push_message(QueueKey::dccl(1), Bytes::from_static(b"x"), Some(7), None)
            .unwrap();
        clock.advance(Duration::from_secs(1));
        assert_eq!(manager.request_next_destination(32), Some(7));
    }

    #[test]
    fn test_frame_for_other_destination_ignored() {
        let (mut manager, _clock) =
            manager_with_queue(1, QueueConfig::new(QueueKind::Dccl, 1, "simple"));
        let hits = Rc::new(RefCell::new(0));
        let hits_in_cb = hits.clone();
        manager.set_receive_cb(Box::new(move |_| *hits_in_cb.borrow_mut() += 1));

        let frame = ModemFrame {
            src: 2,
            dest: 9,
            frame_number: 0,
            ack_requested: false,
            data: Bytes::from_static(&[3, 0, 1, b'x']),
        };
        manager.receive_incoming_modem_data(&frame);
        assert_eq!(*hits.borrow(), 0);
    }

    #[test]
    fn test_ccl_routes_to_ccl_callback() {
        let (mut manager, _clock) =
            manager_with_queue(1, QueueConfig::new(QueueKind::Ccl, 3, "ccl"));
        let ccl_hits = Rc::new(RefCell::new(0));
        let ccl_in_cb = ccl_hits.clone();
        manager.set_receive_ccl_cb(Box::new(move |_| *ccl_in_cb.borrow_mut() += 1));

        let frame = ModemFrame {
            src: 2,
            dest: 1,
            frame_number: 0,
            ack_requested: false,
            data: Bytes::from_static(&[3, 1, 3, b'z']),
        };
        manager.receive_incoming_modem_data(&frame);
        assert_eq!(*ccl_hits.borrow(), 1);
    }

    #[test]
    fn test_on_demand_queue_fills_at_request_time() {
        let mut cfg = QueueConfig::new(QueueKind::Data, 2, "ondemand");
        cfg.on_demand = true;
        cfg.dest = 5;
        let (mut manager, _clock) = manager_with_queue(1, cfg);
        manager.set_data_on_demand_cb(Box::new(|_, _| Some(Bytes::from_static(b"fresh"))));

        let frame = manager.provide_outgoing_modem_data(&request(16)).unwrap();
        assert!(frame.data.ends_with(b"fresh"));
        assert_eq!(frame.dest, 5);
    }
}
