//! WHOI Micro-Modem driver: a line-oriented request/response protocol engine.
//!
//! The driver owns a queue of outbound NMEA sentences, writes them one at a
//! time, and matches each against its echo from the modem (`$CCCFG` is echoed
//! as `$CACFG`, and so on). Missing echoes are retried with escalating
//! bookkeeping; received sentences are dispatched by sentence id to update
//! driver state and fire user callbacks. See [`micromodem::MicroModemDriver`]
//! for the sentence table.

pub mod config;
pub mod link;
pub mod micromodem;

pub use config::DriverConfig;
pub use link::{LineLink, SimLink, SimLinkHandle};
pub use micromodem::MicroModemDriver;

use num_enum::{IntoPrimitive, TryFromPrimitive};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("modem appears to not be responding; link closed")]
    ModemUnresponsive,
}

pub type Result<T> = std::result::Result<T, DriverError>;

/// Acknowledgement of one transmitted frame, as reported by `$CAACK`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckEvent {
    pub src: u16,
    pub dest: u16,
    /// Zero-based frame number (WHOI counts from 1 on the wire).
    pub frame_number: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangingType {
    /// `$CCMPC` mini-packet ping, round trip.
    TwoWayPing,
    /// `$CCPDT` REMUS digital transponder interrogation.
    RemusLbl,
    /// `$CCPNT` narrowband transponder interrogation.
    NarrowbandLbl,
    /// Passive one-way timing from a PPS-disciplined clock; reported via
    /// `$CATOA`, never initiated.
    OneWaySynchronous,
}

/// Receiver clock mode reported in `$CATOA`/`$CAXST`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u32)]
pub enum ClockMode {
    NoSyncClockBad = 0,
    NoSyncClockGood = 1,
    SyncToPpsClockBad = 2,
    SyncToPpsClockGood = 3,
}

/// A request from the MAC layer to interrogate ranging hardware.
#[derive(Debug, Clone, Copy)]
pub struct RangingRequest {
    pub kind: RangingType,
    pub src: u16,
    pub dest: u16,
    /// Longest expected one-way range in meters; sizes the listen timeout
    /// for LBL interrogations.
    pub lbl_max_range_m: f64,
}

/// Travel times reported back from the modem.
#[derive(Debug, Clone, PartialEq)]
pub struct RangingReply {
    pub kind: RangingType,
    pub src: u16,
    pub dest: u16,
    pub one_way_travel_time: Vec<f64>,
    pub receiver_clk_mode: Option<ClockMode>,
}
