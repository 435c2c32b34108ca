//! Common error types for bus drivers and frame handling

use thiserror::Error;

use crate::channel::ChannelHandle;

/// Result type for driver operations
pub type DriverResult<T> = Result<T, DriverError>;

/// Non-success status reported by a [`crate::BusDriver`] primitive
///
/// "No message queued" is not an error; [`crate::BusDriver::read`] reports it
/// as `Ok(None)`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DriverError {
    /// Channel has not been initialized (or was uninitialized meanwhile)
    #[error("Channel {0} is not initialized")]
    NotInitialized(ChannelHandle),

    /// Channel is already initialized by this or another client
    #[error("Channel {0} is already initialized")]
    AlreadyInitialized(ChannelHandle),

    /// No hardware answers on this channel
    #[error("Channel {0} is not available: {1}")]
    Unavailable(ChannelHandle, String),

    /// Bus-level fault (bus-off, error passive, ...)
    #[error("Bus error on {handle}: {message}")]
    Bus {
        handle: ChannelHandle,
        message: String,
    },

    /// Transmit queue is full
    #[error("Transmit queue full on {0}")]
    TransmitQueueFull(ChannelHandle),

    /// Parameter cannot be queried on this driver
    #[error("Parameter not supported: {0}")]
    UnsupportedParameter(String),

    /// Frame cannot be represented by this driver
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    /// OS-level failure (socket, USB, ...)
    #[error("I/O error: {0}")]
    Io(String),

    /// Driver not available in this build or on this platform
    #[error("Unsupported driver: {0}")]
    Unsupported(String),
}

/// Frame construction errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Payload of {0} bytes exceeds the 8-byte CAN limit")]
    DataTooLong(usize),

    #[error("Identifier 0x{id:X} does not fit a {} frame", id_width(.extended))]
    InvalidId { id: u32, extended: bool },
}

fn id_width(extended: &bool) -> &'static str {
    if *extended {
        "29-bit"
    } else {
        "11-bit"
    }
}

/// Message sink failures
#[derive(Debug, Error)]
pub enum SinkError {
    /// The consumer went away (window closed, pipe broken, ...)
    #[error("Sink disposed")]
    Disposed,

    #[error("Sink I/O error: {0}")]
    Io(#[from] std::io::Error),
}
