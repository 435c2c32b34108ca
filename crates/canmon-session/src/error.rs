//! Session layer errors

use std::path::PathBuf;

use canmon_core::{ChannelHandle, DriverError, LogicalDeviceId};
use thiserror::Error;

use crate::registry::RegistryError;

/// Result type for session operations
pub type SessionResult<T> = Result<T, SessionError>;

/// Errors surfaced by [`crate::SessionManager`] start/stop
#[derive(Debug, Error)]
pub enum SessionError {
    /// Start requested without a device
    #[error("No device selected")]
    NoDeviceSelected,

    /// Start requested without a baud rate
    #[error("No baud rate selected")]
    NoBaudrateSelected,

    /// Device already has a running session
    #[error("Device {0} already has an active session")]
    AlreadyActive(LogicalDeviceId),

    /// All channel handles are taken
    #[error("No free channel handle: {0}")]
    ChannelsExhausted(#[from] RegistryError),

    /// Driver refused to initialize the channel; the handle was released
    #[error("Failed to initialize {handle}: {source}")]
    DriverInitFailed {
        handle: ChannelHandle,
        #[source]
        source: DriverError,
    },

    /// The device's discovered channel is held by another session
    #[error("Channel {handle} of device {device} is occupied by another session")]
    ChannelOccupied {
        device: LogicalDeviceId,
        handle: ChannelHandle,
    },

    /// The manager is shutting down and accepts no new sessions
    #[error("Session manager is shutting down")]
    ShuttingDown,

    /// Stop requested for a device without a session
    #[error("Device {0} has no active session")]
    NotActive(LogicalDeviceId),

    /// Driver reported a failure while closing the channel. The session is
    /// gone and the handle was released regardless.
    #[error("Failed to uninitialize {handle}: {source}")]
    DriverUninitFailed {
        handle: ChannelHandle,
        #[source]
        source: DriverError,
    },

    /// A blocking driver call or monitor task panicked
    #[error("Task failed: {0}")]
    TaskJoin(String),
}

impl From<tokio::task::JoinError> for SessionError {
    fn from(err: tokio::task::JoinError) -> Self {
        SessionError::TaskJoin(err.to_string())
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Baud-rate preference persistence errors
#[derive(Debug, Error)]
pub enum PreferenceError {
    #[error("Preference file I/O error ({path}): {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Preference file {path} is not valid JSON: {source}")]
    Format {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}
