// src/device.rs

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use futures_lite::future::block_on;
use nusb::Interface;
use nusb::transfer::{Control, ControlType, Recipient};
use strum_macros::Display;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::protocol::{ANY_DEVICE, ENDPOINT_OUT, Frame, INTERFACE, LineProperties, PID, VID, baud_divisor};

// FTDI SIO vendor requests.
const SIO_RESET: u8 = 0x00;
const SIO_SET_MODEM_CTRL: u8 = 0x01;
const SIO_SET_BAUDRATE: u8 = 0x03;
const SIO_SET_DATA: u8 = 0x04;

const SIO_RESET_SIO: u16 = 0;
const SIO_RESET_PURGE_RX: u16 = 1;
const SIO_RESET_PURGE_TX: u16 = 2;

const SIO_SET_RTS_HIGH: u16 = 0x0202;
const SIO_SET_RTS_LOW: u16 = 0x0200;

// nusb needs a bound on control transfers; these complete in well under a frame.
const CONTROL_TIMEOUT: Duration = Duration::from_secs(1);

/// Which physical interface to drive.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DeviceSelector {
    /// First device matching the vendor/product pair.
    #[default]
    Any,
    /// The device with this USB serial number.
    Serial(String),
}

impl DeviceSelector {
    pub fn matches(&self, serial: Option<&str>) -> bool {
        match self {
            DeviceSelector::Any => true,
            DeviceSelector::Serial(wanted) => serial == Some(wanted.as_str()),
        }
    }
}

impl FromStr for DeviceSelector {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if s == ANY_DEVICE {
            Ok(DeviceSelector::Any)
        } else {
            Ok(DeviceSelector::Serial(s.to_string()))
        }
    }
}

impl fmt::Display for DeviceSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceSelector::Any => f.write_str(ANY_DEVICE),
            DeviceSelector::Serial(serial) => write!(f, "serial {serial}"),
        }
    }
}

/// A raw, opened serial output port.
///
/// Mirrors the handful of FTDI driver calls DMX output needs. Implementations
/// are driven from a single worker thread and never shared.
pub trait DmxPort: Send {
    /// Reset the serial engine of the chip.
    fn reset(&mut self) -> Result<()>;

    /// Set the line format, asserting a break condition when `brk` is true.
    fn set_line_property(&mut self, line: LineProperties, brk: bool) -> Result<()>;

    fn set_baud_rate(&mut self, baud: u32) -> Result<()>;

    fn set_rts(&mut self, high: bool) -> Result<()>;

    /// Drop anything still queued in the chip's RX and TX buffers.
    fn purge_buffers(&mut self) -> Result<()>;

    fn write_all(&mut self, data: &[u8]) -> Result<()>;

    fn close(self) -> Result<()>
    where
        Self: Sized;
}

/// Something that can open a [`DmxPort`].
pub trait DmxTransport: Send + Sync + 'static {
    type Port: DmxPort + 'static;

    fn open(&self, selector: &DeviceSelector) -> Result<Self::Port>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ConnectionState {
    #[strum(serialize = "closed")]
    Closed,
    #[strum(serialize = "open but unconfigured")]
    OpenUnconfigured,
    #[strum(serialize = "ready")]
    Ready,
}

/// Owns one port and tracks where it is in its open/configure/close lifecycle.
pub struct DeviceHandle<P: DmxPort> {
    port: Option<P>,
    state: ConnectionState,
    line: LineProperties,
}

impl<P: DmxPort> DeviceHandle<P> {
    pub fn new() -> Self {
        Self {
            port: None,
            state: ConnectionState::Closed,
            line: LineProperties::DMX,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn open<T>(&mut self, transport: &T, selector: &DeviceSelector) -> Result<()>
    where
        T: DmxTransport<Port = P>,
    {
        self.require(ConnectionState::Closed)?;
        self.port = Some(transport.open(selector)?);
        self.state = ConnectionState::OpenUnconfigured;
        Ok(())
    }

    /// Bring an opened port to a DMX-ready state: reset, line format, baud
    /// rate, RTS low, purge.
    pub fn configure(&mut self, line: LineProperties, baud: u32) -> Result<()> {
        self.require(ConnectionState::OpenUnconfigured)?;
        let port = self.port_mut()?;
        port.reset()?;
        port.set_line_property(line, false)?;
        port.set_baud_rate(baud)?;
        port.set_rts(false)?;
        port.purge_buffers()?;
        self.line = line;
        self.state = ConnectionState::Ready;
        Ok(())
    }

    pub fn assert_break(&mut self) -> Result<()> {
        self.require(ConnectionState::Ready)?;
        let line = self.line;
        self.port_mut()?.set_line_property(line, true)
    }

    pub fn clear_break(&mut self) -> Result<()> {
        self.require(ConnectionState::Ready)?;
        let line = self.line;
        self.port_mut()?.set_line_property(line, false)
    }

    pub fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        self.require(ConnectionState::Ready)?;
        self.port_mut()?.write_all(frame.as_bytes())
    }

    /// Close the port. The handle is `Closed` afterwards even if the driver
    /// reported an error.
    pub fn close(&mut self) -> Result<()> {
        self.state = ConnectionState::Closed;
        match self.port.take() {
            Some(port) => port.close(),
            None => Ok(()),
        }
    }

    fn require(&self, required: ConnectionState) -> Result<()> {
        if self.state == required {
            Ok(())
        } else {
            Err(Error::InvalidState {
                required,
                actual: self.state,
            })
        }
    }

    fn port_mut(&mut self) -> Result<&mut P> {
        let actual = self.state;
        self.port.as_mut().ok_or(Error::InvalidState {
            required: ConnectionState::OpenUnconfigured,
            actual,
        })
    }
}

impl<P: DmxPort> Default for DeviceHandle<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: DmxPort> Drop for DeviceHandle<P> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Unable to close device: {}", e);
        }
    }
}

// --- FTDI over nusb ---

/// Opens FT232R-based interfaces through nusb.
#[derive(Debug, Clone, Copy)]
pub struct FtdiTransport {
    vendor_id: u16,
    product_id: u16,
}

impl FtdiTransport {
    pub fn new(vendor_id: u16, product_id: u16) -> Self {
        Self { vendor_id, product_id }
    }
}

impl Default for FtdiTransport {
    fn default() -> Self {
        Self::new(VID, PID)
    }
}

impl DmxTransport for FtdiTransport {
    type Port = FtdiPort;

    fn open(&self, selector: &DeviceSelector) -> Result<FtdiPort> {
        let device_info = nusb::list_devices()
            .map_err(Error::Usb)?
            .find(|d| {
                d.vendor_id() == self.vendor_id && d.product_id() == self.product_id && selector.matches(d.serial_number())
            })
            .ok_or(Error::DeviceNotFound)?;

        debug!(
            bus = device_info.bus_number(),
            addr = device_info.device_address(),
            serial = device_info.serial_number(),
            "Found device"
        );

        let device = device_info.open().map_err(Error::Usb)?;
        let interface = device.detach_and_claim_interface(INTERFACE).map_err(Error::Usb)?;
        Ok(FtdiPort { interface })
    }
}

/// A claimed FT232R interface.
pub struct FtdiPort {
    interface: Interface,
}

impl FtdiPort {
    fn vendor_request(&self, request: u8, value: u16, index: u16) -> Result<()> {
        let control = Control {
            control_type: ControlType::Vendor,
            recipient: Recipient::Device,
            request,
            value,
            index,
        };
        self.interface.control_out_blocking(control, &[], CONTROL_TIMEOUT)?;
        Ok(())
    }
}

impl DmxPort for FtdiPort {
    fn reset(&mut self) -> Result<()> {
        self.vendor_request(SIO_RESET, SIO_RESET_SIO, 0)
    }

    fn set_line_property(&mut self, line: LineProperties, brk: bool) -> Result<()> {
        self.vendor_request(SIO_SET_DATA, line.sio_value(brk), 0)
    }

    fn set_baud_rate(&mut self, baud: u32) -> Result<()> {
        let (value, index) = baud_divisor(baud).ok_or_else(|| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("unsupported baud rate {baud}"),
            ))
        })?;
        self.vendor_request(SIO_SET_BAUDRATE, value, index)
    }

    fn set_rts(&mut self, high: bool) -> Result<()> {
        let value = if high { SIO_SET_RTS_HIGH } else { SIO_SET_RTS_LOW };
        self.vendor_request(SIO_SET_MODEM_CTRL, value, 0)
    }

    fn purge_buffers(&mut self) -> Result<()> {
        self.vendor_request(SIO_RESET, SIO_RESET_PURGE_RX, 0)?;
        self.vendor_request(SIO_RESET, SIO_RESET_PURGE_TX, 0)
    }

    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        let completion = block_on(self.interface.bulk_out(ENDPOINT_OUT, data.to_vec()));
        let sent = completion.into_result()?.actual_length();
        if sent != data.len() {
            return Err(Error::ShortWrite {
                sent,
                expected: data.len(),
            });
        }
        Ok(())
    }

    fn close(self) -> Result<()> {
        // Releasing the interface is done by nusb on drop.
        drop(self.interface);
        Ok(())
    }
}

/// One entry of the device listing.
#[derive(Debug, Clone)]
pub struct DeviceSummary {
    pub bus: u8,
    pub address: u8,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial: Option<String>,
}

/// Enumerate every attached device with the given vendor/product pair.
pub fn list_devices(vendor_id: u16, product_id: u16) -> Result<Vec<DeviceSummary>> {
    let devices = nusb::list_devices()
        .map_err(Error::Usb)?
        .filter(|d| d.vendor_id() == vendor_id && d.product_id() == product_id)
        .map(|d| DeviceSummary {
            bus: d.bus_number(),
            address: d.device_address(),
            manufacturer: d.manufacturer_string().map(str::to_string),
            product: d.product_string().map(str::to_string),
            serial: d.serial_number().map(str::to_string),
        })
        .collect::<Vec<_>>();
    info!("{} devices found.", devices.len());
    Ok(devices)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_parses_any_literal() {
        assert_eq!("any".parse::<DeviceSelector>().unwrap(), DeviceSelector::Any);
        assert_eq!(
            "EN123456".parse::<DeviceSelector>().unwrap(),
            DeviceSelector::Serial("EN123456".to_string())
        );
    }

    #[test]
    fn selector_matches_serial() {
        let any = DeviceSelector::Any;
        assert!(any.matches(None));
        assert!(any.matches(Some("A")));

        let serial = DeviceSelector::Serial("A".to_string());
        assert!(serial.matches(Some("A")));
        assert!(!serial.matches(Some("B")));
        assert!(!serial.matches(None));
    }
}
