//! canmon-session - CAN channel sessions with a frame monitor and autoresponder
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        SessionManager                        │
//! │  start(device, baud) / stop(device) / shutdown / reconcile   │
//! └───────┬──────────────────────┬──────────────────────┬────────┘
//!         │ allocate/release     │ spawn per session    │ remember baud
//! ┌───────▼────────┐   ┌─────────▼─────────┐   ┌────────▼─────────┐
//! │ChannelRegistry │   │   FrameMonitor    │   │ PreferenceStore  │
//! │  16 handles    │   │ read -> publish   │   │  (JSON file)     │
//! └────────────────┘   │  -> Responder     │   └──────────────────┘
//!                      │  -> write         │
//!                      └───┬───────────┬───┘
//!                          │           │ broadcast<FrameEvent>
//!                  ┌───────▼───────┐   └──────► MessageSink(s)
//!                  │   BusDriver   │
//!                  │ SocketCAN/Mock│◄──── DeviceWatcher (liveness poll)
//!                  └───────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use canmon_core::BaudRate;
//! use canmon_session::config::MonitorConfig;
//! use canmon_session::driver::mock::MockBusDriver;
//! use canmon_session::{SessionManager, StartRequest};
//!
//! let manager = SessionManager::new(Arc::new(MockBusDriver::new()), MonitorConfig::default());
//! let session = manager.start(StartRequest::new("USBBUS1", BaudRate::Baud500K)).await?;
//! let mut frames = manager.subscribe();
//! // ...
//! manager.shutdown().await;
//! ```

pub mod config;
pub mod discovery;
pub mod driver;
pub mod error;
pub mod monitor;
pub mod preferences;
pub mod registry;
pub mod responder;
pub mod session;

pub use config::CanmonConfig;
pub use discovery::{probe_channels, DeviceList, DeviceWatcher, DiscoveredChannel};
pub use error::{ConfigError, PreferenceError, SessionError, SessionResult};
pub use monitor::MonitorExit;
pub use preferences::{BaudPreferences, JsonPreferenceStore, MemoryPreferenceStore, PreferenceStore};
pub use registry::{ChannelRegistry, RegistryError};
pub use responder::{rewrite_address, Responder};
pub use session::{
    CounterSnapshot, Reconciliation, SessionInfo, SessionManager, SessionState, StartRequest,
};
