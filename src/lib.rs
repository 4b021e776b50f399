//! Acoustic underwater networking stack.
//!
//! An acoustic link carries tens to hundreds of bits per second with
//! multi-second round trips and loss rates in the tens of percent, so every
//! bit on the wire and every transaction with the modem matters. Three
//! subsystems carry the weight:
//!
//! * [`dccl`] - the Dynamic Compact Control Language codec: schema-driven,
//!   bit-packed encoding of structured messages into the smallest possible
//!   byte strings, with pluggable per-field codecs and an optional AES
//!   envelope.
//! * [`queue`] - a multi-queue priority dispatcher that selects, packs and
//!   tracks messages on demand from the modem driver.
//! * [`driver`] - a line-oriented request/response engine for the WHOI
//!   Micro-Modem: NMEA framing, configuration handshake, data cycles,
//!   acknowledgement tracking, ranging and clock synchronisation.
//!
//! The core runs single-threaded and cooperative: one loop drives every
//! subsystem through periodic `do_work` ticks. Time is injected through
//! [`util::clock::Clock`] so that TTL, retry and blackout logic is fully
//! deterministic under test.

pub mod dccl;
pub mod driver;
pub mod queue;
pub mod util;
