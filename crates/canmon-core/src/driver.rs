//! Bus driver trait

use serde::{Deserialize, Serialize};

use crate::baud::BaudRate;
use crate::channel::ChannelHandle;
use crate::error::DriverResult;
use crate::frame::{CanFrame, ReceivedFrame};

/// [`DriverParameter::ChannelCondition`] values
pub const CHANNEL_UNAVAILABLE: u32 = 0;
pub const CHANNEL_AVAILABLE: u32 = 1;
pub const CHANNEL_OCCUPIED: u32 = 2;

/// Queryable driver parameters (for [`BusDriver::get_value`])
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverParameter {
    /// Device number configured on the adapter; answers only when
    /// hardware is present on the channel
    DeviceId,
    /// [`CHANNEL_AVAILABLE`], [`CHANNEL_OCCUPIED`] or [`CHANNEL_UNAVAILABLE`]
    ChannelCondition,
    /// Current bus speed in bit/s (initialized channels only)
    BitRate,
}

/// Native CAN adapter surface
///
/// Every primitive is synchronous and may block for a while (USB round
/// trips, socket syscalls). Callers must run them on blocking threads
/// (`tokio::task::spawn_blocking`), never on the async executor.
///
/// Implementations must tolerate `uninitialize` racing with an in-flight
/// `read` on the same channel: the read fails or returns empty, it never
/// panics.
pub trait BusDriver: Send + Sync {
    /// Open `handle` at `baud`
    fn initialize(&self, handle: ChannelHandle, baud: BaudRate) -> DriverResult<()>;

    /// Close `handle`. Calling this on a channel that is not initialized is
    /// allowed; drivers may report [`crate::DriverError::NotInitialized`].
    fn uninitialize(&self, handle: ChannelHandle) -> DriverResult<()>;

    /// Non-blocking read: `Ok(Some(_))` frame, `Ok(None)` queue empty,
    /// `Err(_)` driver failure
    fn read(&self, handle: ChannelHandle) -> DriverResult<Option<ReceivedFrame>>;

    /// Queue one frame for transmission
    fn write(&self, handle: ChannelHandle, frame: &CanFrame) -> DriverResult<()>;

    /// Query a channel parameter
    fn get_value(&self, handle: ChannelHandle, parameter: DriverParameter) -> DriverResult<u32>;

    /// Short driver name for logs
    fn name(&self) -> &str {
        "bus-driver"
    }
}
