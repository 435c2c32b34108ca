//! Supported CAN bus speeds

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Bus speed of a channel session
///
/// Fixed once a session is started; changing it means stop-then-start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum BaudRate {
    #[serde(rename = "1M")]
    Baud1M,
    #[default]
    #[serde(rename = "500k")]
    Baud500K,
    #[serde(rename = "250k")]
    Baud250K,
    #[serde(rename = "125k")]
    Baud125K,
    #[serde(rename = "100k")]
    Baud100K,
    #[serde(rename = "50k")]
    Baud50K,
    #[serde(rename = "20k")]
    Baud20K,
    #[serde(rename = "10k")]
    Baud10K,
    #[serde(rename = "5k")]
    Baud5K,
}

impl BaudRate {
    /// All supported rates, fastest first (selection-list order)
    pub const ALL: [BaudRate; 9] = [
        BaudRate::Baud1M,
        BaudRate::Baud500K,
        BaudRate::Baud250K,
        BaudRate::Baud125K,
        BaudRate::Baud100K,
        BaudRate::Baud50K,
        BaudRate::Baud20K,
        BaudRate::Baud10K,
        BaudRate::Baud5K,
    ];

    pub fn bits_per_second(&self) -> u32 {
        match self {
            BaudRate::Baud1M => 1_000_000,
            BaudRate::Baud500K => 500_000,
            BaudRate::Baud250K => 250_000,
            BaudRate::Baud125K => 125_000,
            BaudRate::Baud100K => 100_000,
            BaudRate::Baud50K => 50_000,
            BaudRate::Baud20K => 20_000,
            BaudRate::Baud10K => 10_000,
            BaudRate::Baud5K => 5_000,
        }
    }

    pub fn from_bits_per_second(bps: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|b| b.bits_per_second() == bps)
    }

    /// Short form used in config files (`"500k"`, `"1M"`)
    pub fn as_str(&self) -> &'static str {
        match self {
            BaudRate::Baud1M => "1M",
            BaudRate::Baud500K => "500k",
            BaudRate::Baud250K => "250k",
            BaudRate::Baud125K => "125k",
            BaudRate::Baud100K => "100k",
            BaudRate::Baud50K => "50k",
            BaudRate::Baud20K => "20k",
            BaudRate::Baud10K => "10k",
            BaudRate::Baud5K => "5k",
        }
    }
}

impl fmt::Display for BaudRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BaudRate::Baud1M => f.write_str("1 MBit/s"),
            other => write!(f, "{} kBit/s", other.bits_per_second() / 1000),
        }
    }
}

impl FromStr for BaudRate {
    type Err = String;

    /// Accepts `500k`, `500K`, `1M`, `500000`, `500kbit/s`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let cleaned = s.trim().to_ascii_lowercase().replace(' ', "");
        let cleaned = cleaned
            .trim_end_matches("bit/s")
            .trim_end_matches("bps")
            .trim_end_matches("bit");

        let bps = if let Some(k) = cleaned.strip_suffix('k') {
            k.parse::<u32>().ok().and_then(|v| v.checked_mul(1_000))
        } else if let Some(m) = cleaned.strip_suffix('m') {
            m.parse::<u32>().ok().and_then(|v| v.checked_mul(1_000_000))
        } else {
            cleaned.parse::<u32>().ok()
        };

        bps.and_then(BaudRate::from_bits_per_second)
            .ok_or_else(|| format!("unsupported baud rate: '{}'", s))
    }
}
