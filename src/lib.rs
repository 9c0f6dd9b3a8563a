//! Continuous DMX512 output through an Enttec Open DMX USB interface.
//!
//! Frames of 513 bytes are read from a byte stream, handed to a transmission
//! engine through a single-slot exchange, and replayed to the device at the
//! DMX refresh rate. The engine reconnects on its own when the device goes
//! away.

pub mod controller;
pub mod device;
pub mod engine;
pub mod error;
pub mod exchange;
pub mod ingest;
pub mod protocol;

pub use controller::Controller;
pub use device::{DeviceSelector, DmxPort, DmxTransport, FtdiTransport};
pub use engine::{EngineConfig, StatsSnapshot, Timing};
pub use error::{Error, Result};
pub use protocol::Frame;
