use std::collections::{BTreeMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use chrono::{Datelike, Timelike};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, error, trace, warn};

use crate::queue::{ModemDataRequest, ModemFrame, BROADCAST_ID};
use crate::util::clock::Clock;
use crate::util::nmea::{parse_nmea_time, ChecksumMode, NmeaError, NmeaSentence};

use super::config::DriverConfig;
use super::link::LineLink;
use super::{
    AckEvent, ClockMode, DriverError, RangingReply, RangingRequest, RangingType, Result,
};

/// How long to wait for the serial echo of a sentence before resending.
pub const MODEM_WAIT: Duration = Duration::from_secs(3);
/// Settle time after the modem reports a reboot (`$CAREV,...,INIT`).
const WAIT_AFTER_REBOOT: Duration = Duration::from_secs(2);
/// Largest tolerated difference between modem and host clocks.
const ALLOWED_MS_DIFF: i64 = 2000;
/// Resends of a single sentence before it is dropped.
const RETRIES: u32 = 3;
/// Consecutive failures (without any modem traffic) before the link is
/// declared dead.
const MAX_FAILS_BEFORE_DEAD: u32 = 5;
const HYDROID_GATEWAY_GPS_REQUEST_INTERVAL: Duration = Duration::from_secs(30);
/// `#M<id>` on every line from the gateway buoy.
const HYDROID_GATEWAY_PREFIX_LENGTH: usize = 3;
const ROUGH_SPEED_OF_SOUND_M_S: f64 = 1500.0;

/// Frames per packet, indexed by packet type (rate) 0-5.
pub const PACKET_FRAME_COUNT: [u32; 6] = [1, 3, 3, 2, 2, 8];
/// Bytes per frame, indexed by packet type (rate) 0-5.
pub const PACKET_SIZE: [usize; 6] = [32, 32, 64, 256, 256, 256];

type DataRequestCallback = Box<dyn FnMut(&ModemDataRequest) -> Option<ModemFrame>>;
type ReceiveCallback = Box<dyn FnMut(&ModemFrame)>;
type AckCallback = Box<dyn FnMut(&AckEvent)>;
type RangeReplyCallback = Box<dyn FnMut(&RangingReply)>;
type RawCallback = Box<dyn FnMut(&str)>;
type DroppedCallback = Box<dyn FnMut(&NmeaSentence)>;

struct HydroidGateway {
    modem_prefix: String,
    gps_request: String,
    last_gps_request: Duration,
}

/// Driver for the WHOI Micro-Modem.
///
/// Sentence dispatch (incoming, by three-letter sentence id):
///
/// | Sentence   | Action |
/// |------------|--------|
/// | `REV`      | `INIT`: settle after reboot, invalidate clock. `AUV`: compare clocks. |
/// | `ERR`      | `NMEA` errors advance the retry accounting for the head sentence. |
/// | `CFG`/`CFQ`| Update the NVRAM shadow map. |
/// | `CLK`      | Mark the clock set if the modem's report matches ours. |
/// | `DRQ`      | Data request: answer `$CCTXD` from the frame cache, or empty. |
/// | `CYC`      | Cycle initiation; cache outgoing frames if we are the sender. |
/// | `RXD`/`MUA`| Deliver payload upward, folding any pending TOA. |
/// | `ACK`      | Match against frames awaiting ack. |
/// | `MPR`/`TTA`/`TOA` | Ranging replies. |
/// | `XST`      | Record the transmit-side clock mode. |
/// | `RXP`      | Discard a stale pending TOA. |
///
/// All waits run off the injected [`Clock`]; the only error that escapes
/// [`MicroModemDriver::do_work`] is [`DriverError::ModemUnresponsive`].
pub struct MicroModemDriver {
    cfg: DriverConfig,
    link: Box<dyn LineLink>,
    clock: Arc<dyn Clock>,

    startup_done: bool,
    clock_set: bool,
    waiting_for_modem: bool,
    last_write_time: Duration,
    present_fail: u32,
    global_fail: u32,
    nvram: FxHashMap<String, i32>,
    clk_mode: ClockMode,
    last_ranging_type: RangingType,
    /// set while a `$CCCYC` we wrote is in flight, so its echo does not
    /// trigger a second round of frame caching
    local_cccyc: bool,
    cached_frames: BTreeMap<u32, ModemFrame>,
    frames_awaiting_ack: FxHashSet<u32>,
    pending_toa: Option<RangingReply>,
    out_queue: VecDeque<NmeaSentence>,
    hydroid: Option<HydroidGateway>,

    cb_data_request: Option<DataRequestCallback>,
    cb_receive: Option<ReceiveCallback>,
    cb_ack: Option<AckCallback>,
    cb_range_reply: Option<RangeReplyCallback>,
    cb_raw_incoming: Option<RawCallback>,
    cb_raw_outgoing: Option<RawCallback>,
    cb_retries_exceeded: Option<DroppedCallback>,
}

impl MicroModemDriver {
    pub fn new(cfg: DriverConfig, link: Box<dyn LineLink>, clock: Arc<dyn Clock>) -> MicroModemDriver {
        let now = clock.now();
        MicroModemDriver {
            cfg,
            link,
            clock,
            startup_done: false,
            clock_set: false,
            waiting_for_modem: false,
            last_write_time: now,
            present_fail: 0,
            global_fail: 0,
            nvram: FxHashMap::default(),
            clk_mode: ClockMode::NoSyncClockBad,
            last_ranging_type: RangingType::TwoWayPing,
            local_cccyc: false,
            cached_frames: BTreeMap::new(),
            frames_awaiting_ack: FxHashSet::default(),
            pending_toa: None,
            out_queue: VecDeque::new(),
            hydroid: None,
            cb_data_request: None,
            cb_receive: None,
            cb_ack: None,
            cb_range_reply: None,
            cb_raw_incoming: None,
            cb_raw_outgoing: None,
            cb_retries_exceeded: None,
        }
    }

    /// Pull callback: asked for each frame of an outgoing packet.
    pub fn set_data_request_cb(&mut self, cb: DataRequestCallback) {
        self.cb_data_request = Some(cb);
    }

    pub fn set_receive_cb(&mut self, cb: ReceiveCallback) {
        self.cb_receive = Some(cb);
    }

    pub fn set_ack_cb(&mut self, cb: AckCallback) {
        self.cb_ack = Some(cb);
    }

    pub fn set_range_reply_cb(&mut self, cb: RangeReplyCallback) {
        self.cb_range_reply = Some(cb);
    }

    /// Tap on every line read from the modem (after gateway prefix
    /// stripping).
    pub fn set_raw_incoming_cb(&mut self, cb: RawCallback) {
        self.cb_raw_incoming = Some(cb);
    }

    /// Tap on every line written to the modem.
    pub fn set_raw_outgoing_cb(&mut self, cb: RawCallback) {
        self.cb_raw_outgoing = Some(cb);
    }

    /// Fired when a sentence is dropped after exhausting its resends.
    pub fn set_retries_exceeded_cb(&mut self, cb: DroppedCallback) {
        self.cb_retries_exceeded = Some(cb);
    }

    pub fn nvram(&self, key: &str) -> Option<i32> {
        self.nvram.get(key).copied()
    }

    pub fn clock_is_set(&self) -> bool {
        self.clock_set
    }

    /// Set the modem clock and apply the NVRAM configuration. Blocks briefly
    /// for clock alignment (see [`MicroModemDriver::set_clock`]).
    pub fn startup(&mut self) -> Result<()> {
        if self.startup_done {
            warn!("startup() called but driver is already started");
            return Ok(());
        }

        if let Some(id) = self.cfg.hydroid_gateway_id {
            debug!(id, "configuring Hydroid gateway prefix");
            self.hydroid = Some(HydroidGateway {
                modem_prefix: format!("#M{}", id),
                gps_request: format!("#G{}\r\n", id),
                last_gps_request: self.clock.now(),
            });
        }

        self.set_clock()?;
        self.clk_mode = ClockMode::NoSyncClockBad;

        self.write_cfg()?;
        self.query_all_cfg()?;

        self.startup_done = true;
        Ok(())
    }

    /// Synchronous and idempotent: closes the link and drops the outbound
    /// queue without invoking callbacks for discarded sentences.
    pub fn shutdown(&mut self) {
        self.startup_done = false;
        self.waiting_for_modem = false;
        self.out_queue.clear();
        self.link.close();
    }

    /// One cooperative tick: write pending sentences, retry stale ones, read
    /// and dispatch everything the modem sent. Per-sentence errors are logged
    /// and swallowed; only a dead modem escapes.
    pub fn do_work(&mut self) -> Result<()> {
        // don't set the clock while commands are queued: the time would be
        // stale by the time the CCCLK reaches the modem
        if !self.clock_set && self.out_queue.is_empty() {
            self.set_clock()?;
        }

        self.try_send()?;

        while let Some(line) = self.link.try_read_line() {
            let mut line = line.trim().to_string();
            if self.hydroid.is_some()
                && line.len() >= HYDROID_GATEWAY_PREFIX_LENGTH
                && line.is_char_boundary(HYDROID_GATEWAY_PREFIX_LENGTH)
            {
                line.drain(..HYDROID_GATEWAY_PREFIX_LENGTH);
            }

            if let Some(cb) = &mut self.cb_raw_incoming {
                guard("raw_incoming", || cb(&line));
            }

            match NmeaSentence::parse(&line, ChecksumMode::Validate) {
                Ok(nmea) => self.process_receive(&nmea),
                Err(e) => warn!("discarding unparseable line {:?}: {}", line, e),
            }
        }

        if let Some(hydroid) = &mut self.hydroid {
            if self.clock.now() >= hydroid.last_gps_request + HYDROID_GATEWAY_GPS_REQUEST_INTERVAL
            {
                hydroid.last_gps_request = self.clock.now();
                let request = hydroid.gps_request.clone();
                if let Err(e) = self.link.write_line(&request) {
                    warn!("failed to poll gateway GPS: {}", e);
                }
            }
        }

        Ok(())
    }

    //
    // MAC entry points
    //

    /// Initiate a data transmission cycle: pre-fetch up to the packet type's
    /// frame count from the data-request callback, then write `$CCCYC`.
    pub fn handle_initiate_transmission(&mut self, src: u16, dest: u16, rate: u32) -> Result<()> {
        let rate_index = (rate as usize).min(PACKET_SIZE.len() - 1);
        let num_frames = PACKET_FRAME_COUNT[rate_index];

        // we initiated this cycle, so the CACYC echo must not fetch again
        self.local_cccyc = true;
        self.cache_outgoing_data(src, dest, rate, num_frames);

        let is_local_cycle = src == self.cfg.modem_id;
        if is_local_cycle && self.cached_frames.is_empty() {
            debug!("not initiating transmission: no data to send");
            self.local_cccyc = false;
            return Ok(());
        }

        let first_cached = self.cached_frames.values().next();
        let (cycle_dest, cycle_ack) = match (is_local_cycle, first_cached) {
            (true, Some(frame)) => (frame.dest, frame.ack_requested as u8),
            _ => (dest, 1),
        };

        // $CCCYC,CMD,ADR1,ADR2,Packet Type,ACK,Npkt*CS
        let mut nmea = NmeaSentence::new("$CCCYC");
        nmea.push(0); // CMD: deprecated
        nmea.push(src);
        nmea.push(cycle_dest);
        nmea.push(rate);
        nmea.push(cycle_ack);
        nmea.push(num_frames);
        self.append_to_write_queue(nmea)
    }

    /// Initiate a ranging transaction. One-way synchronous ranging is
    /// passive and cannot be initiated here.
    pub fn handle_initiate_ranging(&mut self, request: &RangingRequest) -> Result<()> {
        match request.kind {
            RangingType::OneWaySynchronous => {
                warn!(
                    "cannot initiate one-way synchronous ranging manually; enable NVRAM \
                     \"TOA,1\" and \"SNV,1\" and times of arrival will be reported on all \
                     relevant receptions"
                );
                Ok(())
            }

            RangingType::TwoWayPing => {
                // $CCMPC,SRC,DEST*CS
                let mut nmea = NmeaSentence::new("$CCMPC");
                nmea.push(request.src);
                nmea.push(request.dest);
                self.last_ranging_type = RangingType::TwoWayPing;
                self.append_to_write_queue(nmea)
            }

            RangingType::RemusLbl => {
                let tat = self.cfg.remus_turnaround_ms;
                self.ensure_turnaround(tat)?;

                // $CCPDT,GRP,CHANNEL,SF,STO,Timeout,AF,BF,CF,DF*CS
                let mut nmea = NmeaSentence::new("$CCPDT");
                nmea.push(1); // GRP 1 is the only group
                nmea.push(request.src % 4 + 1); // channels 1-4
                nmea.push(0);
                nmea.push(0);
                nmea.push(lbl_timeout_ms(request.lbl_max_range_m, tat));
                for beacon in 0..4 {
                    nmea.push((self.cfg.remus_enable_beacons >> beacon) & 1);
                }
                self.last_ranging_type = RangingType::RemusLbl;
                self.append_to_write_queue(nmea)
            }

            RangingType::NarrowbandLbl => {
                let tat = self.cfg.narrowband_turnaround_ms;
                self.ensure_turnaround(tat)?;

                // $CCPNT,Ftx,Ttx,Trx,Timeout,FA,FB,FC,FD,Tflag*CS
                let mut nmea = NmeaSentence::new("$CCPNT");
                nmea.push(self.cfg.narrowband_transmit_freq);
                nmea.push(self.cfg.narrowband_transmit_ping_ms);
                nmea.push(self.cfg.narrowband_receive_ping_ms);
                nmea.push(lbl_timeout_ms(request.lbl_max_range_m, tat));
                for i in 0..4 {
                    nmea.push(self.cfg.narrowband_receive_freq.get(i).copied().unwrap_or(0));
                }
                nmea.push(self.cfg.narrowband_transmit_flag as u8);
                self.last_ranging_type = RangingType::NarrowbandLbl;
                self.append_to_write_queue(nmea)
            }
        }
    }

    //
    // startup pieces
    //

    /// Write `$CCCLK`. For synchronous navigation the sentence must reach
    /// the modem right after the top of a second, so this blocks until the
    /// local sub-second is within 1-50 ms, then settles for a second after
    /// the write.
    fn set_clock(&mut self) -> Result<()> {
        loop {
            let frac = f64::from(self.clock.wall_time().nanosecond()) / 1e9;
            if (1e-3..=50e-3).contains(&frac) {
                break;
            }
            self.clock.sleep(Duration::from_millis(1));
        }

        let t = self.clock.wall_time();
        let mut nmea = NmeaSentence::new("$CCCLK");
        nmea.push(t.year());
        nmea.push(t.month());
        nmea.push(t.day());
        nmea.push(t.hour());
        nmea.push(t.minute());
        nmea.push(t.second());
        self.append_to_write_queue(nmea)?;

        // breathe while the modem applies the clock
        self.clock.sleep(Duration::from_secs(1));
        Ok(())
    }

    fn write_cfg(&mut self) -> Result<()> {
        // a Hydroid buoy runs at 4800 baud and would be lost by the reset
        if self.cfg.reset_nvram && self.hydroid.is_none() {
            self.write_single_cfg("ALL,0")?;
        }

        let src = format!("SRC,{}", self.cfg.modem_id);
        self.write_single_cfg(&src)?;

        for setting in self.cfg.nvram_cfg.clone() {
            self.write_single_cfg(&setting)?;
        }
        Ok(())
    }

    fn write_single_cfg(&mut self, setting: &str) -> Result<()> {
        let setting = setting.to_uppercase();
        let mut nmea = NmeaSentence::new("$CCCFG");
        nmea.push(&setting);

        // shadow the value immediately so lookups (like SRC) work before the
        // modem confirms
        if let Some((key, value)) = setting.split_once(',') {
            self.nvram
                .insert(key.to_string(), value.parse().unwrap_or(0));
        }

        self.append_to_write_queue(nmea)
    }

    fn query_all_cfg(&mut self) -> Result<()> {
        self.append_to_write_queue(NmeaSentence::parse("$CCCFQ,ALL", ChecksumMode::Ignore).expect("static sentence"))
    }

    fn ensure_turnaround(&mut self, tat: u32) -> Result<()> {
        // NB: plain inequality on the shadowed value; a negated lookup
        // ("!shadow == tat") silently compares a boolean instead
        if self.nvram.get("TAT") != Some(&(tat as i32)) {
            self.write_single_cfg(&format!("TAT,{}", tat))?;
        }
        Ok(())
    }

    //
    // outgoing machinery
    //

    fn append_to_write_queue(&mut self, nmea: NmeaSentence) -> Result<()> {
        self.out_queue.push_back(nmea);
        // try to push it now instead of waiting for the next tick
        self.try_send()
    }

    fn try_send(&mut self) -> Result<()> {
        let Some(head) = self.out_queue.front().cloned() else {
            return Ok(());
        };

        if !self.waiting_for_modem {
            self.mm_write(&head);
            return Ok(());
        }

        if self.clock.now() < self.last_write_time + MODEM_WAIT {
            return Ok(());
        }

        warn!(
            "no serial echo for {:?} within {:?}; resending",
            head.front(),
            MODEM_WAIT
        );
        self.global_fail += 1;
        if self.global_fail >= MAX_FAILS_BEFORE_DEAD {
            error!("modem not responding after {} failures; closing link", self.global_fail);
            self.link.close();
            return Err(DriverError::ModemUnresponsive);
        }

        if !self.present_fail_step() {
            self.mm_write(&head);
        }
        Ok(())
    }

    /// Advance the per-sentence fail counter; drops the head and returns
    /// true once `RETRIES` is reached.
    fn present_fail_step(&mut self) -> bool {
        self.present_fail += 1;
        if self.present_fail < RETRIES {
            return false;
        }

        warn!(
            "modem did not respond after {} tries; dropping {:?} and continuing",
            RETRIES,
            self.out_queue.front().map(NmeaSentence::front)
        );
        if let Some(dropped) = self.out_queue.front().cloned() {
            if let Some(cb) = &mut self.cb_retries_exceeded {
                guard("retries_exceeded", || cb(&dropped));
            }
        }
        self.pop_out();
        true
    }

    fn mm_write(&mut self, nmea: &NmeaSentence) {
        let prefix = self
            .hydroid
            .as_ref()
            .map(|h| h.modem_prefix.as_str())
            .unwrap_or("");
        let line = format!("{}{}{}", prefix, nmea.message(), self.cfg.line_delimiter);
        trace!(line = line.trim_end(), "modem <<");

        if let Some(cb) = &mut self.cb_raw_outgoing {
            guard("raw_outgoing", || cb(&line));
        }
        if let Err(e) = self.link.write_line(&line) {
            warn!("write to modem failed: {}", e);
        }

        self.waiting_for_modem = true;
        self.last_write_time = self.clock.now();
    }

    fn pop_out(&mut self) {
        self.waiting_for_modem = false;
        if self.out_queue.pop_front().is_none() {
            warn!("expected to pop an outgoing sentence but the queue is empty");
        }
        self.present_fail = 0;
    }

    //
    // incoming dispatch
    //

    fn process_receive(&mut self, nmea: &NmeaSentence) {
        trace!(line = nmea.message(), "modem >>");
        // any traffic proves the modem is alive
        self.global_fail = 0;

        if nmea.front().len() < 6 {
            warn!("discarding sentence with short talker {:?}", nmea.front());
            return;
        }

        let result = match nmea.sentence_id() {
            "REV" => self.rev(nmea),
            "ERR" => self.err(nmea),
            "DRQ" => self.drq(nmea),
            "CFG" => self.cfg_reply(nmea),
            "CLK" => self.clk(nmea),
            "XST" => self.xst(nmea),
            "CYC" => self.cyc(nmea),
            "RXD" => self.rxd(nmea),
            "MUA" => self.mua(nmea),
            "ACK" => self.ack(nmea),
            "MPR" => self.mpr(nmea),
            "TTA" => self.tta(nmea),
            "TOA" => self.toa(nmea),
            "RXP" => self.rxp(),
            other => {
                debug!(sentence = other, "no handler for sentence");
                Ok(())
            }
        };
        if let Err(e) = result {
            warn!("failed to process {:?}: {}", nmea.message(), e);
        }

        // serial echo: the modem repeats our sentence id with its own talker
        let echoes_head = self
            .out_queue
            .front()
            .is_some_and(|head| head.sentence_id() == nmea.sentence_id());
        if echoes_head {
            self.pop_out();
        }
    }

    fn rev(&mut self, nmea: &NmeaSentence) -> std::result::Result<(), NmeaError> {
        match nmea.at(2)? {
            "INIT" => {
                debug!("modem rebooted; letting it settle");
                self.clock.sleep(WAIT_AFTER_REBOOT);
                self.clock_set = false;
            }
            "AUV" => {
                if let Some(reported) = parse_nmea_time(nmea.at(1)?) {
                    let expected = self.clock.wall_time().time();
                    let diff = (reported - expected).num_milliseconds().abs();
                    if diff > ALLOWED_MS_DIFF {
                        debug!(diff_ms = diff, "modem clock has drifted; will reset");
                        self.clock_set = false;
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn err(&mut self, nmea: &NmeaSentence) -> std::result::Result<(), NmeaError> {
        warn!("modem reports error: {}", nmea.message());

        // old firmware rejecting a sentence outright; recover faster than the
        // full resend timeout
        if nmea.at(2) == Ok("NMEA") {
            self.waiting_for_modem = false;
            self.present_fail_step();
        }
        Ok(())
    }

    fn drq(&mut self, nmea: &NmeaSentence) -> std::result::Result<(), NmeaError> {
        // $CADRQ,HHMMSS,SRC,DEST,ACK,N,F#*CS
        let frame = zero_based_frame(nmea, 6)?;

        let mut out = NmeaSentence::new("$CCTXD");
        match self.cached_frames.remove(&frame) {
            Some(data) => {
                out.push(data.src);
                out.push(data.dest);
                out.push(data.ack_requested as u8);
                out.push(hex::encode(&data.data));
                if data.ack_requested {
                    self.frames_awaiting_ack.insert(frame);
                }
            }
            None => {
                // a blank reply quiets further requests for this frame
                out.push(nmea.at(2)?);
                out.push(nmea.at(3)?);
                out.push(nmea.at(4)?);
                out.push("");
            }
        }
        let _ = self.append_to_write_queue(out);
        Ok(())
    }

    fn cfg_reply(&mut self, nmea: &NmeaSentence) -> std::result::Result<(), NmeaError> {
        self.nvram
            .insert(nmea.at(1)?.to_string(), nmea.as_i32(2).unwrap_or(0));

        // answers to a CFQ query arrive as CFG sentences; pop the query on
        // the first one (CFG echoes pop through the generic id match)
        if self
            .out_queue
            .front()
            .is_some_and(|head| head.sentence_id() == "CFQ")
        {
            self.pop_out();
        }
        Ok(())
    }

    fn clk(&mut self, nmea: &NmeaSentence) -> std::result::Result<(), NmeaError> {
        if self
            .out_queue
            .front()
            .map(|head| head.sentence_id() != "CLK")
            .unwrap_or(true)
        {
            return Ok(());
        }

        let date = chrono::NaiveDate::from_ymd_opt(
            nmea.as_i32(1)?,
            nmea.as_u32(2)?,
            nmea.as_u32(3)?,
        );
        let time = chrono::NaiveTime::from_hms_opt(
            nmea.as_u32(4)?,
            nmea.as_u32(5)?,
            nmea.as_u32(6)?.min(59),
        );
        let (Some(date), Some(time)) = (date, time) else {
            return Err(NmeaError::BadField {
                index: 1,
                wanted: "datetime",
                value: nmea.message(),
            });
        };

        // the modem reports the previous second
        let reported = date.and_time(time) + chrono::Duration::seconds(1);
        let expected = self.clock.wall_time();
        let diff = (reported - expected).num_milliseconds().abs();
        debug!(reported = %reported, diff_ms = diff, "modem clock report");
        if diff < ALLOWED_MS_DIFF {
            self.clock_set = true;
        }
        Ok(())
    }

    fn xst(&mut self, nmea: &NmeaSentence) -> std::result::Result<(), NmeaError> {
        if let Ok(mode) = ClockMode::try_from(nmea.as_u32(3)?) {
            self.clk_mode = mode;
        }
        Ok(())
    }

    fn cyc(&mut self, nmea: &NmeaSentence) -> std::result::Result<(), NmeaError> {
        // $CACYC,CMD,ADR1,ADR2,Packet Type,ACK,Npkt*CS
        let src = nmea.as_u16(2)?;
        let dest = nmea.as_u16(3)?;
        let rate = nmea.as_u32(4)?;
        let num_frames = nmea.as_u32(6)?;

        // ADR1 cannot be trusted to be the TOA source; drop any pending one
        self.pending_toa = None;

        if self.local_cccyc {
            self.local_cccyc = false;
        } else {
            self.cache_outgoing_data(src, dest, rate, num_frames);
        }
        Ok(())
    }

    fn cache_outgoing_data(&mut self, src: u16, dest: u16, rate: u32, num_frames: u32) {
        if src != self.cfg.modem_id {
            return;
        }

        if !self.cached_frames.is_empty() {
            warn!(
                count = self.cached_frames.len(),
                "flushing cached frames never sent in response to a $CADRQ"
            );
            self.cached_frames.clear();
        }
        if !self.frames_awaiting_ack.is_empty() {
            warn!(
                count = self.frames_awaiting_ack.len(),
                "flushing expected acknowledgments that never arrived"
            );
            self.frames_awaiting_ack.clear();
        }

        let Some(cb) = &mut self.cb_data_request else {
            return;
        };

        let max_bytes = PACKET_SIZE[(rate as usize).min(PACKET_SIZE.len() - 1)];
        for frame_number in 0..num_frames {
            let request = ModemDataRequest {
                frame_number,
                max_bytes,
                src,
                dest: (dest != BROADCAST_ID).then_some(dest),
            };
            let frame = guard("data_request", || cb(&request)).flatten();
            match frame {
                Some(frame) if !frame.data.is_empty() => {
                    self.cached_frames.insert(frame_number, frame);
                }
                _ => break, // no more data to send
            }
        }
    }

    fn rxd(&mut self, nmea: &NmeaSentence) -> std::result::Result<(), NmeaError> {
        // $CARXD,SRC,DEST,ACK,F#,HEX*CS
        let frame = ModemFrame {
            src: nmea.as_u16(1)?,
            dest: nmea.as_u16(2)?,
            ack_requested: nmea.as_bool(3)?,
            frame_number: zero_based_frame(nmea, 4)?,
            data: hex::decode(nmea.at(5)?)
                .map_err(|_| NmeaError::BadField {
                    index: 5,
                    wanted: "hex payload",
                    value: nmea.at(5).unwrap_or("").to_string(),
                })?
                .into(),
        };

        self.flush_toa(frame.src);
        if let Some(cb) = &mut self.cb_receive {
            guard("receive", || cb(&frame));
        }
        Ok(())
    }

    fn mua(&mut self, nmea: &NmeaSentence) -> std::result::Result<(), NmeaError> {
        // $CAMUA,SRC,DEST,HHHH*CS
        let frame = ModemFrame {
            src: nmea.as_u16(1)?,
            dest: nmea.as_u16(2)?,
            ack_requested: false,
            frame_number: 0,
            data: hex::decode(nmea.at(3)?)
                .map_err(|_| NmeaError::BadField {
                    index: 3,
                    wanted: "hex payload",
                    value: nmea.at(3).unwrap_or("").to_string(),
                })?
                .into(),
        };

        self.flush_toa(frame.src);
        if let Some(cb) = &mut self.cb_receive {
            guard("receive", || cb(&frame));
        }
        Ok(())
    }

    fn ack(&mut self, nmea: &NmeaSentence) -> std::result::Result<(), NmeaError> {
        // $CAACK,SRC,DEST,F#,Ack*CS
        let event = AckEvent {
            src: nmea.as_u16(1)?,
            dest: nmea.as_u16(2)?,
            frame_number: zero_based_frame(nmea, 3)?,
        };

        self.flush_toa(event.src);
        if self.frames_awaiting_ack.remove(&event.frame_number) {
            if let Some(cb) = &mut self.cb_ack {
                guard("ack", || cb(&event));
            }
        } else {
            warn!(
                frame = event.frame_number,
                "acknowledgement for a frame we were not expecting"
            );
        }
        Ok(())
    }

    fn mpr(&mut self, nmea: &NmeaSentence) -> std::result::Result<(), NmeaError> {
        // $CAMPR,SRC,DEST,TRAVELTIME*CS - src/dest reversed to match the
        // original ping request
        let mut reply = RangingReply {
            kind: RangingType::TwoWayPing,
            src: nmea.as_u16(2)?,
            dest: nmea.as_u16(1)?,
            one_way_travel_time: Vec::new(),
            receiver_clk_mode: None,
        };
        if let Ok(owtt) = nmea.as_f64(3) {
            reply.one_way_travel_time.push(owtt);
        }

        if let Some(cb) = &mut self.cb_range_reply {
            guard("range_reply", || cb(&reply));
        }
        Ok(())
    }

    fn tta(&mut self, nmea: &NmeaSentence) -> std::result::Result<(), NmeaError> {
        // $SNTTA,TA,TB,TC,TD,HHMMSS*CS
        let mut reply = RangingReply {
            kind: self.last_ranging_type,
            src: self.cfg.modem_id,
            dest: self.cfg.modem_id,
            one_way_travel_time: Vec::new(),
            receiver_clk_mode: None,
        };
        for i in 1..=4 {
            reply
                .one_way_travel_time
                .push(nmea.as_f64(i).unwrap_or(f64::NAN));
        }

        if let Some(cb) = &mut self.cb_range_reply {
            guard("range_reply", || cb(&reply));
        }
        Ok(())
    }

    fn toa(&mut self, nmea: &NmeaSentence) -> std::result::Result<(), NmeaError> {
        // timing relative to a synchronized PPS is usable even when the CCCLK
        // part is off, as long as the range is under one second of travel
        let mode = ClockMode::try_from(nmea.as_u32(2)?).unwrap_or(ClockMode::NoSyncClockBad);
        self.clk_mode = mode;

        if !matches!(
            mode,
            ClockMode::SyncToPpsClockGood | ClockMode::SyncToPpsClockBad
        ) {
            return Ok(());
        }

        let Some(toa) = parse_nmea_time(nmea.at(1)?) else {
            return Err(NmeaError::BadField {
                index: 1,
                wanted: "HHMMSS.SS time",
                value: nmea.at(1).unwrap_or("").to_string(),
            });
        };
        let frac_sec = f64::from(toa.nanosecond()) / 1e9;

        self.pending_toa = Some(RangingReply {
            kind: RangingType::OneWaySynchronous,
            src: 0, // filled when folded into the next reception
            dest: self.cfg.modem_id,
            one_way_travel_time: vec![frac_sec],
            receiver_clk_mode: Some(mode),
        });
        Ok(())
    }

    fn rxp(&mut self) -> std::result::Result<(), NmeaError> {
        if let Some(stale) = self.pending_toa.take() {
            warn!(?stale, "discarding time of arrival that was never folded");
        }
        Ok(())
    }

    /// Attach a pending one-way TOA to the reception that follows it.
    fn flush_toa(&mut self, src: u16) {
        if let Some(mut toa) = self.pending_toa.take() {
            toa.src = src;
            toa.dest = self.cfg.modem_id;
            if let Some(cb) = &mut self.cb_range_reply {
                guard("range_reply", || cb(&toa));
            }
        }
    }
}

fn lbl_timeout_ms(max_range_m: f64, turnaround_ms: u32) -> i64 {
    ((max_range_m * 2.0 / ROUGH_SPEED_OF_SOUND_M_S) * 1000.0) as i64 + i64::from(turnaround_ms)
}

/// WHOI frame numbers are 1-based on the wire; ours start at zero.
fn zero_based_frame(nmea: &NmeaSentence, index: usize) -> std::result::Result<u32, NmeaError> {
    nmea.as_u32(index)?
        .checked_sub(1)
        .ok_or(NmeaError::BadField {
            index,
            wanted: "frame number starting at 1",
            value: nmea.at(index).unwrap_or("").to_string(),
        })
}

/// Run a user callback, containing any panic so driver state stays sound.
fn guard<R>(name: &str, f: impl FnOnce() -> R) -> Option<R> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => Some(result),
        Err(_) => {
            error!(callback = name, "user callback panicked; continuing");
            None
        }
    }
}

#[cfg(test)]
mod test {
    use std::cell::RefCell;
    use std::rc::Rc;

    use bytes::Bytes;

    use crate::driver::link::{SimLink, SimLinkHandle};
    use crate::util::clock::SimClock;

    use super::*;

    fn new_driver(cfg: DriverConfig) -> (MicroModemDriver, SimLinkHandle, SimClock) {
        let link = SimLink::new();
        let handle = link.handle();
        let clock = SimClock::new();
        let driver = MicroModemDriver::new(cfg, Box::new(link), Arc::new(clock.clone()));
        (driver, handle, clock)
    }

    fn echo_for(line: &str) -> String {
        // modem echoes our sentence with the CA talker
        let body = line.trim_end().trim_start_matches("$CC");
        let stripped = body.split('*').next().unwrap();
        NmeaSentence::parse(&format!("$CA{}", stripped), ChecksumMode::Ignore)
            .unwrap()
            .message()
    }

    /// Reply to the head sentence like a well-behaved modem until the driver
    /// goes idle.
    fn drain_startup(driver: &mut MicroModemDriver, handle: &SimLinkHandle, clock: &SimClock) {
        for _ in 0..20 {
            for line in handle.take_written() {
                if line.starts_with("$CCCLK") {
                    let t = clock.wall_time();
                    handle.inject(&format!(
                        "$CACLK,{},{},{},{},{},{}",
                        t.year(),
                        t.month(),
                        t.day(),
                        t.hour(),
                        t.minute(),
                        t.second()
                    ));
                } else {
                    handle.inject(&echo_for(&line));
                }
            }
            driver.do_work().unwrap();
        }
    }

    fn started_driver(cfg: DriverConfig) -> (MicroModemDriver, SimLinkHandle, SimClock) {
        let (mut driver, handle, clock) = new_driver(cfg);
        driver.startup().unwrap();
        drain_startup(&mut driver, &handle, &clock);
        handle.take_written();
        (driver, handle, clock)
    }

    #[test]
    fn test_startup_writes_clock_config_and_query() {
        let mut cfg = DriverConfig::default();
        cfg.nvram_cfg = vec!["SNV,1".to_string()];
        let (mut driver, handle, clock) = new_driver(cfg);
        driver.startup().unwrap();

        // only the clock goes out until its echo arrives
        let written = handle.take_written();
        assert_eq!(written.len(), 1);
        assert!(written[0].starts_with("$CCCLK,"));

        // we consumed the CCCLK write, so echo it by hand
        let t = clock.wall_time();
        handle.inject(&format!(
            "$CACLK,{},{},{},{},{},{}",
            t.year(),
            t.month(),
            t.day(),
            t.hour(),
            t.minute(),
            t.second()
        ));
        driver.do_work().unwrap();
        drain_startup(&mut driver, &handle, &clock);
        assert!(driver.clock_is_set());
        assert_eq!(driver.nvram("SRC"), Some(1));
        assert_eq!(driver.nvram("SNV"), Some(1));
    }

    #[test]
    fn test_cycle_and_data_request() {
        let (mut driver, handle, _clock) = started_driver(DriverConfig::default());

        let payload = Bytes::from_static(&[0x20, 0x00, 0x80, 0x25]);
        let payload_in_cb = payload.clone();
        driver.set_data_request_cb(Box::new(move |request| {
            assert_eq!(request.max_bytes, 32);
            Some(ModemFrame {
                src: 1,
                dest: 2,
                frame_number: request.frame_number,
                ack_requested: true,
                data: payload_in_cb.clone(),
            })
        }));

        driver.handle_initiate_transmission(1, 2, 0).unwrap();
        let written = handle.take_written();
        assert_eq!(written.len(), 1);
        assert!(written[0].starts_with("$CCCYC,0,1,2,0,1,1"));

        // echo the cycle, then ask for the frame (WHOI counts frames from 1)
        handle.inject(&echo_for(&written[0]));
        handle.inject("$CADRQ,000000,1,2,1,32,1");
        driver.do_work().unwrap();

        let written = handle.take_written();
        assert_eq!(written.len(), 1);
        assert!(
            written[0].starts_with(&format!("$CCTXD,1,2,1,{}", hex::encode(&payload))),
            "unexpected TXD: {}",
            written[0]
        );
    }

    #[test]
    fn test_drq_without_cache_answers_blank() {
        let (mut driver, handle, _clock) = started_driver(DriverConfig::default());

        handle.inject("$CADRQ,000000,1,2,1,32,1");
        driver.do_work().unwrap();

        let written = handle.take_written();
        assert_eq!(written.len(), 1);
        assert!(written[0].starts_with("$CCTXD,1,2,1,*"));
    }

    #[test]
    fn test_ack_fires_after_txd() {
        let (mut driver, handle, _clock) = started_driver(DriverConfig::default());
        driver.set_data_request_cb(Box::new(|request| {
            Some(ModemFrame {
                src: 1,
                dest: 2,
                frame_number: request.frame_number,
                ack_requested: true,
                data: Bytes::from_static(b"\x01\x02"),
            })
        }));
        let acks = Rc::new(RefCell::new(Vec::new()));
        let acks_in_cb = acks.clone();
        driver.set_ack_cb(Box::new(move |event| acks_in_cb.borrow_mut().push(*event)));

        driver.handle_initiate_transmission(1, 2, 0).unwrap();
        let cyc = handle.take_written().remove(0);
        handle.inject(&echo_for(&cyc));
        handle.inject("$CADRQ,000000,1,2,1,32,1");
        driver.do_work().unwrap();
        let txd = handle.take_written().remove(0);
        handle.inject(&echo_for(&txd));
        handle.inject("$CAACK,2,1,1,1");
        driver.do_work().unwrap();

        assert_eq!(
            &*acks.borrow(),
            &[AckEvent {
                src: 2,
                dest: 1,
                frame_number: 0
            }]
        );

        // a second identical ack matches nothing
        handle.inject("$CAACK,2,1,1,1");
        driver.do_work().unwrap();
        assert_eq!(acks.borrow().len(), 1);
    }

    #[test]
    fn test_retry_exhaustion_then_dead_modem() {
        let (mut driver, handle, clock) = started_driver(DriverConfig::default());
        let dropped = Rc::new(RefCell::new(Vec::new()));
        let dropped_in_cb = dropped.clone();
        driver.set_retries_exceeded_cb(Box::new(move |nmea| {
            dropped_in_cb.borrow_mut().push(nmea.front().to_string());
        }));
        driver.set_data_request_cb(Box::new(|request| {
            Some(ModemFrame {
                src: 1,
                dest: 2,
                frame_number: request.frame_number,
                ack_requested: false,
                data: Bytes::from_static(b"\x99"),
            })
        }));

        driver.handle_initiate_transmission(1, 2, 0).unwrap();
        assert_eq!(handle.take_written().len(), 1);

        // the modem never echoes: two resends, then the head is dropped
        clock.advance(MODEM_WAIT);
        driver.do_work().unwrap();
        clock.advance(MODEM_WAIT);
        driver.do_work().unwrap();
        assert_eq!(handle.take_written().len(), 2);
        assert!(dropped.borrow().is_empty());

        clock.advance(MODEM_WAIT);
        driver.do_work().unwrap();
        assert_eq!(&*dropped.borrow(), &["$CCCYC".to_string()]);

        // next command: two more silent waits exhaust the global budget
        driver.handle_initiate_transmission(1, 2, 0).unwrap();
        clock.advance(MODEM_WAIT);
        driver.do_work().unwrap();
        clock.advance(MODEM_WAIT);
        assert!(matches!(
            driver.do_work(),
            Err(DriverError::ModemUnresponsive)
        ));
        assert!(handle.is_closed());
    }

    #[test]
    fn test_nmea_error_advances_retry_accounting() {
        let (mut driver, handle, _clock) = started_driver(DriverConfig::default());
        driver.set_data_request_cb(Box::new(|request| {
            Some(ModemFrame {
                src: 1,
                dest: 2,
                frame_number: request.frame_number,
                ack_requested: false,
                data: Bytes::from_static(b"\x99"),
            })
        }));
        driver.handle_initiate_transmission(1, 2, 0).unwrap();
        handle.take_written();

        for _ in 0..RETRIES {
            handle.inject("$CAERR,000000,NMEA,bad sentence");
            driver.do_work().unwrap();
        }
        // head was dropped, queue is idle again
        handle.inject("$CADRQ,000000,1,2,1,32,1");
        driver.do_work().unwrap();
        let written = handle.take_written();
        assert!(written.last().unwrap().starts_with("$CCTXD"));
    }

    #[test]
    fn test_two_way_ping() {
        let (mut driver, handle, _clock) = started_driver(DriverConfig::default());
        let replies = Rc::new(RefCell::new(Vec::new()));
        let replies_in_cb = replies.clone();
        driver.set_range_reply_cb(Box::new(move |reply| {
            replies_in_cb.borrow_mut().push(reply.clone())
        }));

        driver
            .handle_initiate_ranging(&RangingRequest {
                kind: RangingType::TwoWayPing,
                src: 1,
                dest: 2,
                lbl_max_range_m: 0.0,
            })
            .unwrap();
        let written = handle.take_written();
        assert!(written[0].starts_with("$CCMPC,1,2"));

        handle.inject(&echo_for(&written[0]));
        handle.inject("$CAMPR,2,1,1.234");
        driver.do_work().unwrap();

        let replies = replies.borrow();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].kind, RangingType::TwoWayPing);
        assert_eq!(replies[0].src, 1);
        assert_eq!(replies[0].dest, 2);
        assert_eq!(replies[0].one_way_travel_time, vec![1.234]);
    }

    #[test]
    fn test_remus_lbl_writes_tat_then_pdt() {
        let mut cfg = DriverConfig::default();
        cfg.remus_turnaround_ms = 50;
        cfg.remus_enable_beacons = 0b0101;
        let (mut driver, handle, _clock) = started_driver(cfg);

        driver
            .handle_initiate_ranging(&RangingRequest {
                kind: RangingType::RemusLbl,
                src: 1,
                dest: BROADCAST_ID,
                lbl_max_range_m: 1500.0,
            })
            .unwrap();

        let written = handle.take_written();
        // TAT differs from the shadow, so a CFG write precedes the PDT
        assert!(written[0].starts_with("$CCCFG,TAT,50"));
        handle.inject(&echo_for(&written[0]));
        driver.do_work().unwrap(); // echo pops the CFG
        driver.do_work().unwrap(); // next tick writes the PDT

        let written = handle.take_written();
        // timeout: 2 * 1500 m / 1500 m/s = 2 s plus 50 ms turnaround
        assert!(
            written[0].starts_with("$CCPDT,1,2,0,0,2050,1,0,1,0"),
            "unexpected PDT: {}",
            written[0]
        );
    }

    #[test]
    fn test_narrowband_lbl() {
        let mut cfg = DriverConfig::default();
        cfg.narrowband_turnaround_ms = 40;
        cfg.narrowband_transmit_freq = 26000;
        cfg.narrowband_transmit_ping_ms = 10;
        cfg.narrowband_receive_ping_ms = 15;
        cfg.narrowband_receive_freq = vec![27000, 28000];
        let (mut driver, handle, _clock) = started_driver(cfg);

        driver
            .handle_initiate_ranging(&RangingRequest {
                kind: RangingType::NarrowbandLbl,
                src: 1,
                dest: BROADCAST_ID,
                lbl_max_range_m: 750.0,
            })
            .unwrap();

        let written = handle.take_written();
        assert!(written[0].starts_with("$CCCFG,TAT,40"));
        handle.inject(&echo_for(&written[0]));
        driver.do_work().unwrap();
        driver.do_work().unwrap();

        let written = handle.take_written();
        assert!(
            written[0].starts_with("$CCPNT,26000,10,15,1040,27000,28000,0,0,0"),
            "unexpected PNT: {}",
            written[0]
        );
    }

    #[test]
    fn test_one_way_synchronous_is_passive() {
        let (mut driver, handle, _clock) = started_driver(DriverConfig::default());
        driver
            .handle_initiate_ranging(&RangingRequest {
                kind: RangingType::OneWaySynchronous,
                src: 1,
                dest: 2,
                lbl_max_range_m: 0.0,
            })
            .unwrap();
        assert!(handle.take_written().is_empty());
    }

    #[test]
    fn test_toa_folds_into_next_reception() {
        let (mut driver, handle, _clock) = started_driver(DriverConfig::default());
        let replies = Rc::new(RefCell::new(Vec::new()));
        let replies_in_cb = replies.clone();
        driver.set_range_reply_cb(Box::new(move |reply| {
            replies_in_cb.borrow_mut().push(reply.clone())
        }));
        let received = Rc::new(RefCell::new(Vec::new()));
        let received_in_cb = received.clone();
        driver.set_receive_cb(Box::new(move |frame| {
            received_in_cb.borrow_mut().push(frame.clone())
        }));

        handle.inject("$CATOA,123456.25,3");
        handle.inject("$CARXD,7,1,0,1,0a0b");
        driver.do_work().unwrap();

        let replies = replies.borrow();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].kind, RangingType::OneWaySynchronous);
        assert_eq!(replies[0].src, 7);
        assert_eq!(replies[0].dest, 1);
        assert_eq!(replies[0].one_way_travel_time, vec![0.25]);
        assert_eq!(replies[0].receiver_clk_mode, Some(ClockMode::SyncToPpsClockGood));
        assert_eq!(received.borrow().len(), 1);
        assert_eq!(&received.borrow()[0].data[..], &[0x0a, 0x0b]);
    }

    #[test]
    fn test_toa_rejected_without_pps_sync() {
        let (mut driver, handle, _clock) = started_driver(DriverConfig::default());
        let replies = Rc::new(RefCell::new(0));
        let replies_in_cb = replies.clone();
        driver.set_range_reply_cb(Box::new(move |_| *replies_in_cb.borrow_mut() += 1));

        handle.inject("$CATOA,123456.25,1");
        handle.inject("$CARXD,7,1,0,1,0a0b");
        driver.do_work().unwrap();
        assert_eq!(*replies.borrow(), 0);
    }

    #[test]
    fn test_stale_toa_discarded_on_rxp() {
        let (mut driver, handle, _clock) = started_driver(DriverConfig::default());
        let replies = Rc::new(RefCell::new(0));
        let replies_in_cb = replies.clone();
        driver.set_range_reply_cb(Box::new(move |_| *replies_in_cb.borrow_mut() += 1));

        handle.inject("$CATOA,123456.25,3");
        handle.inject("$CARXP,0");
        handle.inject("$CARXD,7,1,0,1,0a0b");
        driver.do_work().unwrap();
        // the TOA was stale; only the bare reception remains
        assert_eq!(*replies.borrow(), 0);
    }

    #[test]
    fn test_rev_init_invalidates_clock() {
        let (mut driver, handle, clock) = started_driver(DriverConfig::default());
        assert!(driver.clock_is_set());

        let before = clock.now();
        handle.inject("$CAREV,123456,INIT,0.93.0.52");
        driver.do_work().unwrap();

        assert!(!driver.clock_is_set());
        // the settle wait went through the injected clock
        assert!(clock.now() >= before + WAIT_AFTER_REBOOT);
    }

    #[test]
    fn test_rev_auv_with_drifted_clock() {
        let (mut driver, handle, clock) = started_driver(DriverConfig::default());
        assert!(driver.clock_is_set());

        let drifted = clock.wall_time() - chrono::Duration::seconds(30);
        handle.inject(&format!(
            "$CAREV,{:02}{:02}{:02},AUV,0.93.0.52",
            drifted.hour(),
            drifted.minute(),
            drifted.second()
        ));
        driver.do_work().unwrap();
        assert!(!driver.clock_is_set());
    }

    #[test]
    fn test_bad_checksum_line_is_dropped() {
        let (mut driver, handle, _clock) = started_driver(DriverConfig::default());
        let received = Rc::new(RefCell::new(0));
        let received_in_cb = received.clone();
        driver.set_receive_cb(Box::new(move |_| *received_in_cb.borrow_mut() += 1));

        handle.inject("$CARXD,7,1,0,1,0a0b*00");
        driver.do_work().unwrap();
        assert_eq!(*received.borrow(), 0);
    }

    #[test]
    fn test_callback_panic_does_not_poison_driver() {
        let (mut driver, handle, _clock) = started_driver(DriverConfig::default());
        driver.set_receive_cb(Box::new(|_| panic!("application bug")));

        handle.inject("$CARXD,7,1,0,1,0a0b");
        driver.do_work().unwrap();

        // driver still alive and processing
        handle.inject("$CADRQ,000000,1,2,1,32,1");
        driver.do_work().unwrap();
        assert!(handle
            .take_written()
            .last()
            .unwrap()
            .starts_with("$CCTXD"));
    }

    #[test]
    fn test_hydroid_gateway_prefix_and_gps_poll() {
        let mut cfg = DriverConfig::default();
        cfg.hydroid_gateway_id = Some(3);
        let (mut driver, handle, clock) = new_driver(cfg);
        driver.startup().unwrap();

        let written = handle.take_written();
        assert!(written[0].starts_with("#M3$CCCLK"));

        // reads strip the same fixed-length prefix
        handle.inject("#M3$CAREV,123456,AUV,0.93.0.52");
        driver.do_work().unwrap();

        clock.advance(HYDROID_GATEWAY_GPS_REQUEST_INTERVAL);
        driver.do_work().unwrap();
        assert!(handle
            .take_written()
            .iter()
            .any(|line| line.starts_with("#G3")));
    }

    #[test]
    fn test_shutdown_is_idempotent_and_closes_link() {
        let (mut driver, handle, _clock) = started_driver(DriverConfig::default());
        driver.shutdown();
        driver.shutdown();
        assert!(handle.is_closed());
    }

    #[test]
    fn test_xst_records_clock_mode() {
        let (mut driver, handle, _clock) = started_driver(DriverConfig::default());
        handle.inject("$CAXST,0,0,3");
        driver.do_work().unwrap();
        assert_eq!(driver.clk_mode, ClockMode::SyncToPpsClockGood);
    }
}
