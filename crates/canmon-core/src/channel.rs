//! Adapter channel handles

use std::fmt;
use std::num::NonZeroU8;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Number of channel slots an adapter driver exposes
pub const CHANNEL_COUNT: u8 = 16;

/// One of the [`CHANNEL_COUNT`] channel slots, numbered 1 through 16
///
/// Handles order ascending by number; every scan over the pool
/// (allocation, liveness polling) walks them in that order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct ChannelHandle(NonZeroU8);

impl ChannelHandle {
    pub const FIRST: ChannelHandle = ChannelHandle(NonZeroU8::MIN);

    /// Returns `None` unless `1 <= number <= 16`
    pub fn new(number: u8) -> Option<Self> {
        if number > CHANNEL_COUNT {
            return None;
        }
        NonZeroU8::new(number).map(Self)
    }

    pub fn number(&self) -> u8 {
        self.0.get()
    }

    /// Zero-based slot index (0 through 15)
    pub fn index(&self) -> usize {
        (self.0.get() - 1) as usize
    }

    /// Every handle in the pool, ascending
    pub fn all() -> impl Iterator<Item = ChannelHandle> + Clone {
        (1..=CHANNEL_COUNT).filter_map(ChannelHandle::new)
    }
}

impl fmt::Display for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "USBBUS{}", self.0)
    }
}

impl TryFrom<u8> for ChannelHandle {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        ChannelHandle::new(value)
            .ok_or_else(|| format!("channel handle must be 1..={}, got {}", CHANNEL_COUNT, value))
    }
}

impl From<ChannelHandle> for u8 {
    fn from(handle: ChannelHandle) -> Self {
        handle.number()
    }
}

impl FromStr for ChannelHandle {
    type Err = String;

    /// Accepts `3` or `USBBUS3` (case-insensitive)
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let digits = match (s.get(..6), s.get(6..)) {
            (Some(prefix), Some(rest)) if prefix.eq_ignore_ascii_case("usbbus") => rest,
            _ => s,
        };
        let number: u8 = digits
            .parse()
            .map_err(|e| format!("invalid channel handle '{}': {}", s, e))?;
        ChannelHandle::try_from(number)
    }
}
