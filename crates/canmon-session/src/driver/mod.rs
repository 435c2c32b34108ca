//! Bus driver implementations
//!
//! - SocketCAN raw sockets (Linux only)
//! - Mock driver for tests and demos
//!
//! # Example
//!
//! ```ignore
//! use canmon_session::config::DriverConfig;
//! use canmon_session::driver::create_driver;
//!
//! let driver = create_driver(&DriverConfig::default())?;
//! driver.initialize(ChannelHandle::FIRST, BaudRate::Baud500K)?;
//! ```

pub mod mock;

#[cfg(all(target_os = "linux", feature = "socketcan"))]
pub mod socketcan;

use std::sync::Arc;

use canmon_core::{BusDriver, DriverError};

use crate::config::DriverConfig;

/// Create a bus driver based on configuration
pub fn create_driver(config: &DriverConfig) -> Result<Arc<dyn BusDriver>, DriverError> {
    match config {
        #[cfg(all(target_os = "linux", feature = "socketcan"))]
        DriverConfig::SocketCan(cfg) => Ok(Arc::new(socketcan::SocketCanDriver::new(cfg))),
        #[cfg(not(all(target_os = "linux", feature = "socketcan")))]
        DriverConfig::SocketCan(_) => Err(DriverError::Unsupported(
            "SocketCAN requires Linux and the 'socketcan' feature".to_string(),
        )),
        DriverConfig::Mock(cfg) => Ok(Arc::new(mock::MockBusDriver::from_config(cfg)?)),
    }
}
