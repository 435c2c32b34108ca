//! Mock bus driver for testing
//!
//! Keeps per-channel receive queues and transmit logs in memory. Tests
//! inject frames with [`MockBusDriver::inject`], inspect what the responder
//! wrote with [`MockBusDriver::written`], and switch on failures per
//! channel to exercise the error paths.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use canmon_core::driver::{CHANNEL_AVAILABLE, CHANNEL_OCCUPIED, CHANNEL_UNAVAILABLE};
use canmon_core::{
    BaudRate, BusDriver, CanFrame, ChannelHandle, DriverError, DriverParameter, DriverResult,
    ReceivedFrame,
};
use parking_lot::{Mutex, RwLock};

use crate::config::MockConfig;

/// Driver primitive invocations recorded by the mock
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverCall {
    Initialize(ChannelHandle, BaudRate),
    Uninitialize(ChannelHandle),
}

#[derive(Debug, Default)]
struct Faults {
    initialize: HashMap<ChannelHandle, DriverError>,
    uninitialize: HashMap<ChannelHandle, DriverError>,
    read: HashMap<ChannelHandle, DriverError>,
    write: HashMap<ChannelHandle, DriverError>,
}

/// In-memory [`BusDriver`]
#[derive(Debug)]
pub struct MockBusDriver {
    /// Present hardware: handle -> device number
    present: RwLock<BTreeMap<ChannelHandle, u32>>,
    /// Initialized channels and their bus speed
    open: Mutex<HashMap<ChannelHandle, BaudRate>>,
    pending: Mutex<HashMap<ChannelHandle, VecDeque<ReceivedFrame>>>,
    written: Mutex<HashMap<ChannelHandle, Vec<CanFrame>>>,
    calls: Mutex<Vec<DriverCall>>,
    faults: Mutex<Faults>,
    latency: Duration,
}

impl Default for MockBusDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBusDriver {
    /// Mock with hardware present on all 16 channels (device number = handle)
    pub fn new() -> Self {
        Self::with_present(ChannelHandle::all())
    }

    /// Mock with hardware present on `handles` only
    pub fn with_present(handles: impl IntoIterator<Item = ChannelHandle>) -> Self {
        Self {
            present: RwLock::new(handles.into_iter().map(|h| (h, h.number() as u32)).collect()),
            open: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            written: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            faults: Mutex::new(Faults::default()),
            latency: Duration::ZERO,
        }
    }

    pub fn from_config(config: &MockConfig) -> Result<Self, DriverError> {
        let handles = config
            .channels
            .iter()
            .map(|&n| {
                ChannelHandle::new(n)
                    .ok_or_else(|| DriverError::Io(format!("Invalid mock channel number {}", n)))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut driver = Self::with_present(handles);
        driver.latency = Duration::from_millis(config.latency_ms);
        Ok(driver)
    }

    /// Simulate latency of initialize/uninitialize
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Plug (`Some(device_number)`) or unplug (`None`) hardware on a channel
    pub fn set_present(&self, handle: ChannelHandle, device_number: Option<u32>) {
        let mut present = self.present.write();
        match device_number {
            Some(n) => present.insert(handle, n),
            None => present.remove(&handle),
        };
    }

    /// Queue a frame for the next reads on `handle`
    pub fn inject(&self, handle: ChannelHandle, frame: CanFrame) {
        self.inject_received(handle, frame.into());
    }

    pub fn inject_received(&self, handle: ChannelHandle, received: ReceivedFrame) {
        self.pending
            .lock()
            .entry(handle)
            .or_default()
            .push_back(received);
    }

    /// Frames written to `handle`, in transmit order
    pub fn written(&self, handle: ChannelHandle) -> Vec<CanFrame> {
        self.written.lock().get(&handle).cloned().unwrap_or_default()
    }

    pub fn clear_written(&self, handle: ChannelHandle) {
        self.written.lock().remove(&handle);
    }

    /// Frames injected but not read yet
    pub fn pending_count(&self, handle: ChannelHandle) -> usize {
        self.pending.lock().get(&handle).map_or(0, VecDeque::len)
    }

    pub fn calls(&self) -> Vec<DriverCall> {
        self.calls.lock().clone()
    }

    pub fn is_initialized(&self, handle: ChannelHandle) -> bool {
        self.open.lock().contains_key(&handle)
    }

    /// Bus speed of an initialized channel
    pub fn baud(&self, handle: ChannelHandle) -> Option<BaudRate> {
        self.open.lock().get(&handle).copied()
    }

    /// Make `initialize(handle)` fail with `error` (or succeed again with `None`)
    pub fn set_initialize_failure(&self, handle: ChannelHandle, error: Option<DriverError>) {
        set_fault(&mut self.faults.lock().initialize, handle, error);
    }

    pub fn set_uninitialize_failure(&self, handle: ChannelHandle, error: Option<DriverError>) {
        set_fault(&mut self.faults.lock().uninitialize, handle, error);
    }

    /// Make every `read(handle)` fail with `error`
    pub fn set_read_failure(&self, handle: ChannelHandle, error: Option<DriverError>) {
        set_fault(&mut self.faults.lock().read, handle, error);
    }

    pub fn set_write_failure(&self, handle: ChannelHandle, error: Option<DriverError>) {
        set_fault(&mut self.faults.lock().write, handle, error);
    }

    fn simulate_latency(&self) {
        if !self.latency.is_zero() {
            std::thread::sleep(self.latency);
        }
    }
}

fn set_fault(
    faults: &mut HashMap<ChannelHandle, DriverError>,
    handle: ChannelHandle,
    error: Option<DriverError>,
) {
    match error {
        Some(e) => faults.insert(handle, e),
        None => faults.remove(&handle),
    };
}

impl BusDriver for MockBusDriver {
    fn initialize(&self, handle: ChannelHandle, baud: BaudRate) -> DriverResult<()> {
        self.simulate_latency();
        self.calls.lock().push(DriverCall::Initialize(handle, baud));

        if let Some(err) = self.faults.lock().initialize.get(&handle) {
            return Err(err.clone());
        }
        if !self.present.read().contains_key(&handle) {
            return Err(DriverError::Unavailable(
                handle,
                "no hardware on this channel".to_string(),
            ));
        }

        let mut open = self.open.lock();
        if open.contains_key(&handle) {
            return Err(DriverError::AlreadyInitialized(handle));
        }
        open.insert(handle, baud);
        tracing::debug!(%handle, %baud, "Mock channel initialized");
        Ok(())
    }

    fn uninitialize(&self, handle: ChannelHandle) -> DriverResult<()> {
        self.simulate_latency();
        self.calls.lock().push(DriverCall::Uninitialize(handle));

        // Close even when a failure is configured, like hardware that
        // reports an error on the way down
        let was_open = self.open.lock().remove(&handle).is_some();
        if let Some(err) = self.faults.lock().uninitialize.get(&handle) {
            return Err(err.clone());
        }
        if !was_open {
            return Err(DriverError::NotInitialized(handle));
        }
        tracing::debug!(%handle, "Mock channel uninitialized");
        Ok(())
    }

    fn read(&self, handle: ChannelHandle) -> DriverResult<Option<ReceivedFrame>> {
        if !self.open.lock().contains_key(&handle) {
            return Err(DriverError::NotInitialized(handle));
        }
        if let Some(err) = self.faults.lock().read.get(&handle) {
            return Err(err.clone());
        }
        Ok(self
            .pending
            .lock()
            .get_mut(&handle)
            .and_then(VecDeque::pop_front))
    }

    fn write(&self, handle: ChannelHandle, frame: &CanFrame) -> DriverResult<()> {
        if !self.open.lock().contains_key(&handle) {
            return Err(DriverError::NotInitialized(handle));
        }
        if let Some(err) = self.faults.lock().write.get(&handle) {
            return Err(err.clone());
        }
        self.written.lock().entry(handle).or_default().push(*frame);
        Ok(())
    }

    fn get_value(&self, handle: ChannelHandle, parameter: DriverParameter) -> DriverResult<u32> {
        match parameter {
            DriverParameter::DeviceId => self
                .present
                .read()
                .get(&handle)
                .copied()
                .ok_or_else(|| DriverError::Unavailable(handle, "no hardware".to_string())),
            DriverParameter::ChannelCondition => {
                if !self.present.read().contains_key(&handle) {
                    Ok(CHANNEL_UNAVAILABLE)
                } else if self.is_initialized(handle) {
                    Ok(CHANNEL_OCCUPIED)
                } else {
                    Ok(CHANNEL_AVAILABLE)
                }
            }
            DriverParameter::BitRate => self
                .baud(handle)
                .map(|b| b.bits_per_second())
                .ok_or(DriverError::NotInitialized(handle)),
        }
    }

    fn name(&self) -> &str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(n: u8) -> ChannelHandle {
        ChannelHandle::new(n).unwrap()
    }

    #[test]
    fn test_read_write_cycle() {
        let driver = MockBusDriver::new();
        let frame = CanFrame::new(0x123, false, &[1, 2, 3]).unwrap();

        assert_eq!(driver.read(h(1)), Err(DriverError::NotInitialized(h(1))));

        driver.initialize(h(1), BaudRate::Baud500K).unwrap();
        assert_eq!(driver.read(h(1)), Ok(None));

        driver.inject(h(1), frame);
        assert_eq!(driver.read(h(1)).unwrap().map(|r| r.frame), Some(frame));
        assert_eq!(driver.read(h(1)), Ok(None));

        driver.write(h(1), &frame).unwrap();
        assert_eq!(driver.written(h(1)), vec![frame]);
        assert!(driver.written(h(2)).is_empty());
    }

    #[test]
    fn test_initialize_rules() {
        let driver = MockBusDriver::with_present([h(2)]);

        assert!(matches!(
            driver.initialize(h(1), BaudRate::Baud500K),
            Err(DriverError::Unavailable(..))
        ));
        driver.initialize(h(2), BaudRate::Baud250K).unwrap();
        assert_eq!(
            driver.initialize(h(2), BaudRate::Baud250K),
            Err(DriverError::AlreadyInitialized(h(2)))
        );
        assert_eq!(driver.get_value(h(2), DriverParameter::BitRate), Ok(250_000));

        driver.uninitialize(h(2)).unwrap();
        assert_eq!(
            driver.uninitialize(h(2)),
            Err(DriverError::NotInitialized(h(2)))
        );
        assert_eq!(
            driver.calls(),
            vec![
                DriverCall::Initialize(h(1), BaudRate::Baud500K),
                DriverCall::Initialize(h(2), BaudRate::Baud250K),
                DriverCall::Initialize(h(2), BaudRate::Baud250K),
                DriverCall::Uninitialize(h(2)),
                DriverCall::Uninitialize(h(2)),
            ]
        );
    }

    #[test]
    fn test_get_value_reflects_presence() {
        let driver = MockBusDriver::with_present([h(3)]);
        assert_eq!(driver.get_value(h(3), DriverParameter::DeviceId), Ok(3));
        assert!(driver.get_value(h(4), DriverParameter::DeviceId).is_err());
        assert_eq!(
            driver.get_value(h(3), DriverParameter::ChannelCondition),
            Ok(CHANNEL_AVAILABLE)
        );

        driver.initialize(h(3), BaudRate::Baud1M).unwrap();
        assert_eq!(
            driver.get_value(h(3), DriverParameter::ChannelCondition),
            Ok(CHANNEL_OCCUPIED)
        );

        driver.set_present(h(3), None);
        assert_eq!(
            driver.get_value(h(3), DriverParameter::ChannelCondition),
            Ok(CHANNEL_UNAVAILABLE)
        );
    }

    #[test]
    fn test_configured_faults() {
        let driver = MockBusDriver::new();
        let bus_off = DriverError::Bus {
            handle: h(1),
            message: "bus off".to_string(),
        };

        driver.set_initialize_failure(h(1), Some(bus_off.clone()));
        assert_eq!(driver.initialize(h(1), BaudRate::Baud500K), Err(bus_off.clone()));
        assert!(!driver.is_initialized(h(1)));

        driver.set_initialize_failure(h(1), None);
        driver.initialize(h(1), BaudRate::Baud500K).unwrap();

        driver.set_read_failure(h(1), Some(bus_off.clone()));
        assert_eq!(driver.read(h(1)), Err(bus_off.clone()));

        driver.set_write_failure(h(1), Some(DriverError::TransmitQueueFull(h(1))));
        let frame = CanFrame::with_payload(0x1, false, [0; 8]);
        assert_eq!(
            driver.write(h(1), &frame),
            Err(DriverError::TransmitQueueFull(h(1)))
        );
        assert!(driver.written(h(1)).is_empty());
    }

    #[test]
    fn test_from_config_rejects_bad_channel() {
        let config = MockConfig {
            channels: vec![1, 17],
            latency_ms: 0,
        };
        assert!(MockBusDriver::from_config(&config).is_err());
    }
}
