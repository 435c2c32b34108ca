//! Raw CAN socket driver

use std::collections::HashMap;
use std::path::Path;
use std::process::Command;
use std::sync::Arc;

use canmon_core::driver::{CHANNEL_AVAILABLE, CHANNEL_OCCUPIED, CHANNEL_UNAVAILABLE};
use canmon_core::{
    BaudRate, BusDriver, CanFrame, ChannelHandle, DriverError, DriverParameter, DriverResult,
    ReceivedFrame,
};
use parking_lot::Mutex;
use socketcan::{
    CanFrame as SocketFrame, CanSocket, EmbeddedFrame, ExtendedId, Frame, Socket, StandardId,
};
use tracing::{debug, info, warn};

use crate::config::SocketCanConfig;

/// Interface name for `handle`
pub fn interface_for(prefix: &str, handle: ChannelHandle) -> String {
    format!("{}{}", prefix, handle.index())
}

struct OpenChannel {
    interface: String,
    baud: BaudRate,
    socket: Arc<CanSocket>,
}

/// [`BusDriver`] over Linux raw CAN sockets
pub struct SocketCanDriver {
    config: SocketCanConfig,
    open: Mutex<HashMap<ChannelHandle, OpenChannel>>,
}

impl SocketCanDriver {
    pub fn new(config: &SocketCanConfig) -> Self {
        Self {
            config: config.clone(),
            open: Mutex::new(HashMap::new()),
        }
    }

    fn interface(&self, handle: ChannelHandle) -> String {
        interface_for(&self.config.interface_prefix, handle)
    }

    fn socket(&self, handle: ChannelHandle) -> DriverResult<Arc<CanSocket>> {
        self.open
            .lock()
            .get(&handle)
            .map(|c| c.socket.clone())
            .ok_or(DriverError::NotInitialized(handle))
    }

    fn open_socket(handle: ChannelHandle, interface: &str) -> DriverResult<CanSocket> {
        let socket = CanSocket::open(interface).map_err(|e| {
            DriverError::Unavailable(handle, format!("Failed to open {}: {}", interface, e))
        })?;

        socket
            .set_nonblocking(true)
            .map_err(|e| DriverError::Io(format!("Failed to set non-blocking: {}", e)))?;

        // Drop frames queued before this session
        while socket.read_frame().is_ok() {}

        Ok(socket)
    }
}

/// Reprogram the interface bitrate with `ip link` (needs CAP_NET_ADMIN)
fn configure_bitrate(handle: ChannelHandle, interface: &str, baud: BaudRate) -> DriverResult<()> {
    let script = format!(
        "ip link set {iface} down && ip link set {iface} type can bitrate {bitrate} && ip link set {iface} up",
        iface = interface,
        bitrate = baud.bits_per_second()
    );

    let output = Command::new("sh")
        .args(["-c", &script])
        .output()
        .map_err(|e| DriverError::Io(format!("Failed to run ip: {}", e)))?;

    if output.status.success() {
        info!(%handle, interface, %baud, "Interface bitrate configured");
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    Err(DriverError::Bus {
        handle,
        message: format!("Failed to configure {}: {}", interface, stderr.trim()),
    })
}

fn ifindex(interface: &str) -> Option<u32> {
    let path = Path::new("/sys/class/net").join(interface).join("ifindex");
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

fn to_socket_frame(frame: &CanFrame) -> DriverResult<SocketFrame> {
    let built = if frame.is_extended() {
        ExtendedId::new(frame.id()).and_then(|id| SocketFrame::new(id, frame.data()))
    } else {
        u16::try_from(frame.id())
            .ok()
            .and_then(StandardId::new)
            .and_then(|id| SocketFrame::new(id, frame.data()))
    };
    built.ok_or_else(|| DriverError::InvalidFrame(frame.to_string()))
}

impl BusDriver for SocketCanDriver {
    fn initialize(&self, handle: ChannelHandle, baud: BaudRate) -> DriverResult<()> {
        let interface = self.interface(handle);
        if self.open.lock().contains_key(&handle) {
            return Err(DriverError::AlreadyInitialized(handle));
        }

        if self.config.configure_bitrate {
            configure_bitrate(handle, &interface, baud)?;
        }

        let socket = Self::open_socket(handle, &interface)?;

        let mut open = self.open.lock();
        if open.contains_key(&handle) {
            return Err(DriverError::AlreadyInitialized(handle));
        }
        open.insert(
            handle,
            OpenChannel {
                interface: interface.clone(),
                baud,
                socket: Arc::new(socket),
            },
        );
        info!(%handle, %interface, %baud, "SocketCAN channel opened");
        Ok(())
    }

    fn uninitialize(&self, handle: ChannelHandle) -> DriverResult<()> {
        // A reader still holding the socket keeps the fd alive until its
        // read returns
        match self.open.lock().remove(&handle) {
            Some(channel) => {
                info!(%handle, interface = %channel.interface, "SocketCAN channel closed");
                Ok(())
            }
            None => Err(DriverError::NotInitialized(handle)),
        }
    }

    fn read(&self, handle: ChannelHandle) -> DriverResult<Option<ReceivedFrame>> {
        let socket = self.socket(handle)?;

        match socket.read_frame() {
            Ok(SocketFrame::Data(frame)) => {
                let id = frame.raw_id() & canmon_core::frame::EXTENDED_ID_MASK;
                CanFrame::new(id, frame.is_extended(), frame.data())
                    .map(|f| Some(ReceivedFrame::from(f)))
                    .map_err(|e| DriverError::InvalidFrame(e.to_string()))
            }
            Ok(SocketFrame::Remote(frame)) => {
                debug!(%handle, id = frame.raw_id(), "Ignoring remote frame");
                Ok(None)
            }
            Ok(SocketFrame::Error(_)) => Err(DriverError::Bus {
                handle,
                message: "error frame received".to_string(),
            }),
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(DriverError::Io(e.to_string())),
        }
    }

    fn write(&self, handle: ChannelHandle, frame: &CanFrame) -> DriverResult<()> {
        let socket = self.socket(handle)?;
        let out = to_socket_frame(frame)?;

        socket.write_frame(&out).map_err(|e| match e.kind() {
            std::io::ErrorKind::WouldBlock => DriverError::TransmitQueueFull(handle),
            _ => DriverError::Io(e.to_string()),
        })
    }

    fn get_value(&self, handle: ChannelHandle, parameter: DriverParameter) -> DriverResult<u32> {
        let interface = self.interface(handle);
        match parameter {
            DriverParameter::DeviceId => ifindex(&interface).ok_or_else(|| {
                DriverError::Unavailable(handle, format!("no interface {}", interface))
            }),
            DriverParameter::ChannelCondition => {
                if ifindex(&interface).is_none() {
                    Ok(CHANNEL_UNAVAILABLE)
                } else if self.open.lock().contains_key(&handle) {
                    Ok(CHANNEL_OCCUPIED)
                } else {
                    Ok(CHANNEL_AVAILABLE)
                }
            }
            DriverParameter::BitRate => self
                .open
                .lock()
                .get(&handle)
                .map(|c| c.baud.bits_per_second())
                .ok_or(DriverError::NotInitialized(handle)),
        }
    }

    fn name(&self) -> &str {
        "socketcan"
    }
}

impl Drop for SocketCanDriver {
    fn drop(&mut self) {
        let open = self.open.get_mut();
        if !open.is_empty() {
            warn!(count = open.len(), "Closing SocketCAN channels still open at driver drop");
        }
    }
}
