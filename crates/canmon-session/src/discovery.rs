//! Device discovery by liveness poll
//!
//! Every channel handle is probed with `GetValue(DeviceId)` in ascending
//! order; handles that answer are present. [`DeviceWatcher`] repeats the
//! probe on a timer and publishes the result over a `watch` channel, so
//! consumers see the latest list at their own pace.

use std::sync::Arc;
use std::time::Duration;

use canmon_core::{BusDriver, ChannelHandle, DriverParameter, LogicalDeviceId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// A device found by discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredChannel {
    pub device: LogicalDeviceId,
    /// Channel the device answered on (liveness poll only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<ChannelHandle>,
    /// Device number configured on the adapter
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_number: Option<u32>,
}

/// Snapshot of the devices currently present
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceList {
    pub channels: Vec<DiscoveredChannel>,
    pub refreshed_at: DateTime<Utc>,
}

impl Default for DeviceList {
    fn default() -> Self {
        Self {
            channels: Vec::new(),
            refreshed_at: Utc::now(),
        }
    }
}

impl DeviceList {
    /// List from an external discovery source that only knows device ids
    pub fn from_devices(devices: impl IntoIterator<Item = LogicalDeviceId>) -> Self {
        Self {
            channels: devices
                .into_iter()
                .map(|device| DiscoveredChannel {
                    device,
                    handle: None,
                    device_number: None,
                })
                .collect(),
            refreshed_at: Utc::now(),
        }
    }

    pub fn contains(&self, device: &LogicalDeviceId) -> bool {
        self.channels.iter().any(|c| &c.device == device)
    }

    pub fn devices(&self) -> Vec<LogicalDeviceId> {
        self.channels.iter().map(|c| c.device.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    fn same_channels(&self, other: &DeviceList) -> bool {
        self.channels == other.channels
    }
}

/// Device id used for a channel found by the liveness poll
pub fn device_id_for(handle: ChannelHandle) -> LogicalDeviceId {
    LogicalDeviceId::new(handle.to_string())
}

/// Probe all 16 handles once. Blocking; call from a blocking thread.
pub fn probe_channels(driver: &dyn BusDriver) -> DeviceList {
    let channels = ChannelHandle::all()
        .filter_map(|handle| {
            match driver.get_value(handle, DriverParameter::DeviceId) {
                Ok(number) => Some(DiscoveredChannel {
                    device: device_id_for(handle),
                    handle: Some(handle),
                    device_number: Some(number),
                }),
                Err(e) => {
                    debug!(%handle, error = %e, "No device on channel");
                    None
                }
            }
        })
        .collect();

    DeviceList {
        channels,
        refreshed_at: Utc::now(),
    }
}

/// Periodic liveness poll
pub struct DeviceWatcher {
    rx: watch::Receiver<DeviceList>,
    task: JoinHandle<()>,
}

impl DeviceWatcher {
    /// Probe now, then every `interval`
    pub fn spawn(driver: Arc<dyn BusDriver>, interval: Duration) -> Self {
        let (tx, rx) = watch::channel(DeviceList::default());

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;

                let probe_driver = driver.clone();
                let list = match tokio::task::spawn_blocking(move || {
                    probe_channels(probe_driver.as_ref())
                })
                .await
                {
                    Ok(list) => list,
                    Err(e) => {
                        warn!(error = %e, "Device probe task failed");
                        continue;
                    }
                };

                let count = list.len();
                let changed = tx.send_if_modified(|current| {
                    if current.same_channels(&list) {
                        current.refreshed_at = list.refreshed_at;
                        false
                    } else {
                        *current = list;
                        true
                    }
                });

                if changed {
                    info!(devices = count, "Device list changed");
                }
            }
        });

        Self { rx, task }
    }

    pub fn subscribe(&self) -> watch::Receiver<DeviceList> {
        self.rx.clone()
    }

    pub fn current(&self) -> DeviceList {
        self.rx.borrow().clone()
    }
}

impl Drop for DeviceWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}
