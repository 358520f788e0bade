//! Log sequence numbers.
//!
//! An [`Lsn`] is a 64-bit position in the write-ahead log. PostgreSQL
//! renders it as two 32-bit hex halves (`"16/B374D848"`) and sends it on
//! the wire as 8 big-endian bytes; both forms convert losslessly.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

/// A position in the change stream.
///
/// The zero value is the invalid/empty sentinel: it is what an unknown
/// position parses to, and the feedback path never acknowledges it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Lsn(u64);

impl Lsn {
    /// The invalid/empty position, rendered as `0/0`.
    pub const INVALID: Lsn = Lsn(0);

    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Parses `"<high-hex>/<low-hex>"`.
    ///
    /// Malformed input (missing slash, empty or non-hex half, half wider
    /// than 32 bits) yields [`Lsn::INVALID`] instead of an error: an
    /// unparseable position means "position unknown".
    pub fn parse(text: &str) -> Self {
        let Some((high, low)) = text.trim().split_once('/') else {
            return Self::INVALID;
        };

        match (parse_half(high), parse_half(low)) {
            (Some(high), Some(low)) => Self((u64::from(high) << 32) | u64::from(low)),
            _ => Self::INVALID,
        }
    }

    /// Wraps the 8-byte big-endian wire form. Any other length is the
    /// empty sentinel.
    pub fn from_bytes(buf: &[u8]) -> Self {
        match <[u8; 8]>::try_from(buf) {
            Ok(bytes) => Self(u64::from_be_bytes(bytes)),
            Err(_) => Self::INVALID,
        }
    }

    pub fn to_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// The high ("log id") half.
    pub const fn high(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// The low ("offset") half.
    pub const fn low(self) -> u32 {
        self.0 as u32
    }
}

fn parse_half(half: &str) -> Option<u32> {
    if half.is_empty() || !half.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u32::from_str_radix(half, 16).ok()
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}/{:x}", self.high(), self.low())
    }
}

impl FromStr for Lsn {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}

impl From<u64> for Lsn {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Lsn> for u64 {
    fn from(lsn: Lsn) -> Self {
        lsn.0
    }
}

impl Serialize for Lsn {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Lsn {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Ok(Self::parse(&text))
    }
}
