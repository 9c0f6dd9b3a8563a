// src/error.rs

use nusb::transfer::TransferError;
use thiserror::Error;

use crate::device::ConnectionState;

/// The primary error type for the `opendmx-rs` library.
#[derive(Error, Debug)]
pub enum Error {
    #[error("USB device not found. Is the Open DMX USB interface connected?")]
    DeviceNotFound,

    // nusb 0.1 reports enumeration/open failures as plain io::Error, so this
    // variant is built explicitly rather than through `From`.
    #[error("USB error: {0}")]
    Usb(#[source] nusb::Error),

    #[error("USB transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid frame length: expected {expected} bytes, got {actual}")]
    InvalidFrameLength { expected: usize, actual: usize },

    #[error("Device is {actual}, operation requires {required}")]
    InvalidState {
        required: ConnectionState,
        actual: ConnectionState,
    },

    #[error("Short write: sent {sent} of {expected} bytes")]
    ShortWrite { sent: usize, expected: usize },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Log and abort. Used where continuing would risk sending a corrupt frame.
pub(crate) fn invariant_violation(what: &str) -> ! {
    tracing::error!("Invariant violated: {}", what);
    std::process::abort()
}
