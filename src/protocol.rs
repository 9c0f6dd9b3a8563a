//! # DMX512 over the Enttec Open DMX USB interface
//!
//! The Open DMX USB widget is a bare FTDI FT232R with an RS-485 transceiver on
//! its TX line. There is no microcontroller on board, so the host is
//! responsible for the whole DMX512 timing envelope:
//!
//! ```text
//!  ____       ______ _______________________________ _____________
//!      |_____|      |  start code | ch 1 | ... | 512|    idle
//!      BREAK   MAB
//! ```
//!
//! - **BREAK**: the line is held low (FTDI "break on") for at least 88 µs.
//! - **MAB**: mark-after-break, the line returns high for at least 8 µs.
//! - **Slots**: 513 bytes at 250 kbaud, 8N2. Slot 0 is the start code
//!   (`0x00` for dimmer data), slots 1..=512 are channel levels.
//!
//! This module holds the wire constants, the [`Frame`] type and the encoding
//! of FTDI line settings (SIO_SET_DATA word, SIO_SET_BAUDRATE divisor).

use std::fmt;
use std::time::Duration;

use num_enum::FromPrimitive;

use crate::error::{Error, Result};

// --- Constants ---

/// Enttec Open DMX USB (FTDI FT232R) vendor id.
pub const VID: u16 = 0x0403;
/// Enttec Open DMX USB (FTDI FT232R) product id.
pub const PID: u16 = 0x6001;
pub const ENDPOINT_OUT: u8 = 0x02;
pub const INTERFACE: u8 = 0;

/// Device selector literal meaning "first matching device".
pub const ANY_DEVICE: &str = "any";

pub const CHANNEL_COUNT: usize = 512;
/// Start code plus 512 channel slots.
pub const FRAME_LEN: usize = CHANNEL_COUNT + 1;

pub const DMX_BAUD_RATE: u32 = 250_000;
pub const BREAK_TIME: Duration = Duration::from_micros(88);
pub const MARK_AFTER_BREAK: Duration = Duration::from_micros(8);
pub const INTER_FRAME_GAP: Duration = Duration::from_micros(22_754);
pub const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

// --- Frame ---

/// Slot 0 of a DMX packet.
///
/// Only `0x00` is defined for dimmer data. Other values are kept as
/// `Reserved` and forwarded untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum StartCode {
    Dimmer = 0x00,
    #[num_enum(catch_all)]
    Reserved(u8),
}

/// A complete 513-byte DMX packet: start code followed by 512 channel levels.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Frame([u8; FRAME_LEN]);

impl Frame {
    pub const fn zeroed() -> Self {
        Self([0; FRAME_LEN])
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let array: [u8; FRAME_LEN] = bytes.try_into().map_err(|_| Error::InvalidFrameLength {
            expected: FRAME_LEN,
            actual: bytes.len(),
        })?;
        Ok(Self(array))
    }

    pub fn start_code(&self) -> StartCode {
        StartCode::from_primitive(self.0[0])
    }

    /// Channel levels, index 0 is DMX channel 1.
    pub fn channels(&self) -> &[u8] {
        &self.0[1..]
    }

    pub fn as_bytes(&self) -> &[u8; FRAME_LEN] {
        &self.0
    }
}

impl Default for Frame {
    fn default() -> Self {
        Self::zeroed()
    }
}

impl From<[u8; FRAME_LEN]> for Frame {
    fn from(bytes: [u8; FRAME_LEN]) -> Self {
        Self(bytes)
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("start_code", &self.start_code())
            .field("head", &hex::encode(&self.0[1..17]))
            .finish_non_exhaustive()
    }
}

// --- Line settings ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataBits {
    Seven = 7,
    Eight = 8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopBits {
    One = 0,
    OnePointFive = 1,
    Two = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    None = 0,
    Odd = 1,
    Even = 2,
    Mark = 3,
    Space = 4,
}

/// Serial line format as understood by the FTDI SIO_SET_DATA request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineProperties {
    pub data_bits: DataBits,
    pub stop_bits: StopBits,
    pub parity: Parity,
}

impl LineProperties {
    /// 8 data bits, no parity, 2 stop bits.
    pub const DMX: Self = Self {
        data_bits: DataBits::Eight,
        stop_bits: StopBits::Two,
        parity: Parity::None,
    };

    /// Encode the SIO_SET_DATA `wValue`, with the break bit set when `brk`.
    pub fn sio_value(&self, brk: bool) -> u16 {
        let mut value = self.data_bits as u16;
        value |= (self.parity as u16) << 8;
        value |= (self.stop_bits as u16) << 11;
        if brk {
            value |= 1 << 14;
        }
        value
    }
}

impl Default for LineProperties {
    fn default() -> Self {
        Self::DMX
    }
}

/// Encode a baud rate for SIO_SET_BAUDRATE on FT232BM/R chips.
///
/// Returns the `(wValue, wIndex)` pair, or `None` if the rate is zero or above
/// the 3 Mbaud ceiling.
pub fn baud_divisor(baud: u32) -> Option<(u16, u16)> {
    const BASE_CLOCK: u32 = 48_000_000;
    const FRACTION_CODE: [u32; 8] = [0, 3, 2, 4, 1, 5, 6, 7];

    if baud == 0 || baud > BASE_CLOCK / 16 {
        return None;
    }

    // Divisor in eighths, rounded to nearest.
    let divisor3 = (BASE_CLOCK + baud) / (2 * baud);
    let mut divisor = (divisor3 >> 3) | (FRACTION_CODE[(divisor3 & 0x7) as usize] << 14);

    // 3 Mbaud and 2 Mbaud have dedicated encodings.
    if divisor == 1 {
        divisor = 0;
    } else if divisor == 0x4001 {
        divisor = 1;
    }

    Some(((divisor & 0xFFFF) as u16, (divisor >> 16) as u16))
}
