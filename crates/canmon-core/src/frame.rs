//! Classic CAN frame model

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::FrameError;

/// Maximum payload of a classic CAN frame
pub const MAX_DATA_LEN: usize = 8;

/// Significant bits of an 11-bit (standard) identifier
pub const STANDARD_ID_MASK: u32 = 0x7FF;

/// Significant bits of a 29-bit (extended) identifier
pub const EXTENDED_ID_MASK: u32 = 0x1FFF_FFFF;

/// A classic CAN data frame
///
/// The payload is stored inline; `len` is always `<= 8`. Construction goes
/// through [`CanFrame::new`] (validating) or [`CanFrame::with_payload`]
/// (infallible, for fixed 8-byte payloads).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CanFrame {
    id: u32,
    extended: bool,
    len: u8,
    data: [u8; MAX_DATA_LEN],
}

impl CanFrame {
    /// Build a frame, validating the identifier width and payload length
    pub fn new(id: u32, extended: bool, data: &[u8]) -> Result<Self, FrameError> {
        if data.len() > MAX_DATA_LEN {
            return Err(FrameError::DataTooLong(data.len()));
        }
        let mask = if extended {
            EXTENDED_ID_MASK
        } else {
            STANDARD_ID_MASK
        };
        if id & !mask != 0 {
            return Err(FrameError::InvalidId { id, extended });
        }

        let mut buf = [0u8; MAX_DATA_LEN];
        buf[..data.len()].copy_from_slice(data);
        Ok(Self {
            id,
            extended,
            len: data.len() as u8,
            data: buf,
        })
    }

    /// Build a full-length frame. The id is truncated to the significant bits
    /// of its frame type.
    pub fn with_payload(id: u32, extended: bool, data: [u8; MAX_DATA_LEN]) -> Self {
        let mask = if extended {
            EXTENDED_ID_MASK
        } else {
            STANDARD_ID_MASK
        };
        Self {
            id: id & mask,
            extended,
            len: MAX_DATA_LEN as u8,
            data,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn is_extended(&self) -> bool {
        self.extended
    }

    pub fn data(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Same frame with a different identifier (frame type is preserved)
    pub fn with_id(mut self, id: u32) -> Self {
        let mask = if self.extended {
            EXTENDED_ID_MASK
        } else {
            STANDARD_ID_MASK
        };
        self.id = id & mask;
        self
    }

    /// "Extended" or "Standard"
    pub fn frame_type(&self) -> &'static str {
        if self.extended {
            "Extended"
        } else {
            "Standard"
        }
    }

    /// Payload as dash-separated upper-case hex (`01-40-41-4A`)
    pub fn data_hex(&self) -> String {
        self.data()
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join("-")
    }
}

impl fmt::Display for CanFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ID: {:X} ({}) Data: {}",
            self.id,
            self.frame_type(),
            self.data_hex()
        )
    }
}

/// Hardware receive timestamp as reported by the adapter
///
/// `millis` wraps at `u32::MAX`; `millis_overflow` counts the wraps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverTimestamp {
    pub millis: u32,
    pub millis_overflow: u16,
    pub micros: u16,
}

impl DriverTimestamp {
    /// Total microseconds since the adapter was initialized
    pub fn as_micros(&self) -> u64 {
        let millis = ((self.millis_overflow as u64) << 32) | self.millis as u64;
        millis * 1000 + self.micros as u64
    }
}

/// A frame as handed out by [`crate::BusDriver::read`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceivedFrame {
    pub frame: CanFrame,
    /// Driver-supplied timestamp, when the adapter provides one
    pub timestamp: Option<DriverTimestamp>,
}

impl From<CanFrame> for ReceivedFrame {
    fn from(frame: CanFrame) -> Self {
        Self {
            frame,
            timestamp: None,
        }
    }
}
