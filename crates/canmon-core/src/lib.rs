//! canmon-core - Core types and traits for CAN channel monitoring
//!
//! This crate defines the vocabulary shared by every canmon component:
//!
//! - [`CanFrame`] / [`ReceivedFrame`] - classic CAN frames (11/29-bit, up to 8 bytes)
//! - [`ChannelHandle`] - one of the 16 adapter channel slots
//! - [`BaudRate`] - the fixed set of supported bus speeds
//! - [`LogicalDeviceId`] - adapter identity as reported by device discovery
//! - [`BusDriver`] - the native adapter surface (initialize, read, write, ...)
//! - [`MessageSink`] - consumer of observed frames (display, logging, ...)

pub mod baud;
pub mod channel;
pub mod device;
pub mod driver;
pub mod error;
pub mod frame;
pub mod sink;

pub use baud::BaudRate;
pub use channel::{ChannelHandle, CHANNEL_COUNT};
pub use device::LogicalDeviceId;
pub use driver::{BusDriver, DriverParameter};
pub use error::{DriverError, DriverResult, FrameError, SinkError};
pub use frame::{CanFrame, DriverTimestamp, ReceivedFrame};
pub use sink::{spawn_sink, FrameEvent, MessageSink};
