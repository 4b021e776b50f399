use std::fmt::Display;

use chrono::NaiveTime;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum NmeaError {
    #[error("line too short to be an NMEA sentence: {0:?}")]
    ShortLine(String),
    #[error("sentence does not start with '$': {0:?}")]
    BadStart(String),
    #[error("bad checksum: expected {expected:02X}, found {found:02X}")]
    BadChecksum { expected: u8, found: u8 },
    #[error("checksum required but not present")]
    MissingChecksum,
    #[error("field {0} missing or empty")]
    MissingField(usize),
    #[error("field {index} is not a valid {wanted}: {value:?}")]
    BadField {
        index: usize,
        wanted: &'static str,
        value: String,
    },
}

/// How strictly [`NmeaSentence::parse`] treats the `*HH` checksum trailer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumMode {
    /// Never check, even if present.
    Ignore,
    /// Check if present; a sentence without a trailer is accepted.
    Validate,
    /// The trailer must be present and must match.
    Require,
}

/// One NMEA 0183 sentence: `$TTSSS,f1,f2,...*HH`.
///
/// `TT` is the two-character talker id, `SSS` the three-character sentence id,
/// and `HH` the hex XOR of every byte between `$` and `*`. The formatter
/// always appends a valid checksum; the parser's strictness is selected by
/// [`ChecksumMode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NmeaSentence {
    parts: Vec<String>,
}

impl NmeaSentence {
    /// Start a sentence from its leading part, e.g. `"$CCCFG"`.
    pub fn new(front: &str) -> NmeaSentence {
        NmeaSentence {
            parts: vec![front.to_string()],
        }
    }

    pub fn parse(line: &str, mode: ChecksumMode) -> Result<NmeaSentence, NmeaError> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.len() < 6 {
            return Err(NmeaError::ShortLine(line.to_string()));
        }
        if !line.starts_with('$') {
            return Err(NmeaError::BadStart(line.to_string()));
        }

        let (body, trailer) = match line.rfind('*') {
            Some(star) => (&line[..star], Some(&line[star + 1..])),
            None => (line, None),
        };

        match (trailer, mode) {
            (_, ChecksumMode::Ignore) => {}
            (None, ChecksumMode::Validate) => {}
            (None, ChecksumMode::Require) => return Err(NmeaError::MissingChecksum),
            (Some(hex_cs), _) => {
                let found = u8::from_str_radix(hex_cs.trim(), 16).map_err(|_| {
                    NmeaError::BadField {
                        index: 0,
                        wanted: "hex checksum",
                        value: hex_cs.to_string(),
                    }
                })?;
                let expected = xor_checksum(body);
                if expected != found {
                    return Err(NmeaError::BadChecksum { expected, found });
                }
            }
        }

        Ok(NmeaSentence {
            parts: body.split(',').map(str::to_string).collect(),
        })
    }

    /// Append one field, formatted with `Display`.
    pub fn push(&mut self, value: impl Display) {
        self.parts.push(value.to_string());
    }

    /// The full sentence with checksum trailer, without line ending.
    pub fn message(&self) -> String {
        let body = self.parts.join(",");
        format!("{}*{:02X}", body, xor_checksum(&body))
    }

    /// The full sentence with checksum and `\r\n`, ready for the wire.
    pub fn message_cr_nl(&self) -> String {
        format!("{}\r\n", self.message())
    }

    /// Leading part including the `$`, e.g. `"$CACYC"`.
    pub fn front(&self) -> &str {
        &self.parts[0]
    }

    /// Two-character talker id, e.g. `"CA"`.
    pub fn talker(&self) -> &str {
        &self.front()[1..3]
    }

    /// Three-character sentence id, e.g. `"CYC"`.
    pub fn sentence_id(&self) -> &str {
        &self.front()[3..6]
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    pub fn at(&self, index: usize) -> Result<&str, NmeaError> {
        match self.parts.get(index) {
            Some(s) if !s.is_empty() => Ok(s),
            _ => Err(NmeaError::MissingField(index)),
        }
    }

    /// Field accessor tolerating absent fields.
    pub fn get(&self, index: usize) -> Option<&str> {
        self.parts.get(index).map(String::as_str)
    }

    pub fn as_u32(&self, index: usize) -> Result<u32, NmeaError> {
        let s = self.at(index)?;
        s.parse().map_err(|_| NmeaError::BadField {
            index,
            wanted: "u32",
            value: s.to_string(),
        })
    }

    pub fn as_u16(&self, index: usize) -> Result<u16, NmeaError> {
        let s = self.at(index)?;
        s.parse().map_err(|_| NmeaError::BadField {
            index,
            wanted: "u16",
            value: s.to_string(),
        })
    }

    pub fn as_i32(&self, index: usize) -> Result<i32, NmeaError> {
        let s = self.at(index)?;
        s.parse().map_err(|_| NmeaError::BadField {
            index,
            wanted: "i32",
            value: s.to_string(),
        })
    }

    pub fn as_f64(&self, index: usize) -> Result<f64, NmeaError> {
        let s = self.at(index)?;
        s.parse().map_err(|_| NmeaError::BadField {
            index,
            wanted: "f64",
            value: s.to_string(),
        })
    }

    pub fn as_bool(&self, index: usize) -> Result<bool, NmeaError> {
        Ok(self.as_u32(index)? != 0)
    }
}

fn xor_checksum(body: &str) -> u8 {
    // everything between '$' and '*'
    body.bytes().skip(1).fold(0, |cs, b| cs ^ b)
}

/// Parse a modem `HHMMSS[.SS]` timestamp.
pub fn parse_nmea_time(value: &str) -> Option<NaiveTime> {
    if value.len() < 6 || !value.is_ascii() {
        return None;
    }
    let hour: u32 = value[0..2].parse().ok()?;
    let min: u32 = value[2..4].parse().ok()?;
    let sec: u32 = value[4..6].parse().ok()?;

    let micros = match value[6..].strip_prefix('.') {
        Some(frac) if !frac.is_empty() => {
            let digits: u32 = frac.parse().ok()?;
            digits * 10u32.pow(6u32.saturating_sub(frac.len() as u32))
        }
        _ => 0,
    };

    NaiveTime::from_hms_micro_opt(hour, min, sec, micros)
}
