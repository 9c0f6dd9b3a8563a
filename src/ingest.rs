//! Frame ingestion from a byte stream (stdin in the binary).

use std::io::{ErrorKind, Read};

use tracing::{debug, info};

use crate::controller::Controller;
use crate::device::DmxTransport;
use crate::error::Result;
use crate::protocol::{FRAME_LEN, Frame};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    Frame(Frame),
    /// A signal interrupted the read; the partial frame was dropped.
    Interrupted,
    /// The input is closed. Any partial frame was dropped.
    EndOfStream,
}

/// Read exactly one frame, accumulating across short reads.
///
/// Errors other than `Interrupted` are returned as-is; the caller must not
/// try to resynchronise on the stream after one.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<ReadOutcome> {
    let mut buf = [0u8; FRAME_LEN];
    let mut filled = 0;

    while filled < FRAME_LEN {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => {
                if filled > 0 {
                    debug!(bytes = filled, "Discarding incomplete trailing frame");
                }
                return Ok(ReadOutcome::EndOfStream);
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {
                debug!(bytes = filled, "Read interrupted, frame discarded");
                return Ok(ReadOutcome::Interrupted);
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(ReadOutcome::Frame(Frame::from(buf)))
}

/// Feed frames from `reader` to the engine until the input closes or the
/// process is asked to exit.
///
/// On end of input process exit is requested, then the engine is stopped. A
/// read error is returned to the caller, which is expected to treat it as
/// fatal.
pub fn run<R: Read, T: DmxTransport>(mut reader: R, controller: &Controller<T>) -> Result<()> {
    while controller.is_running() {
        match read_frame(&mut reader)? {
            ReadOutcome::Frame(frame) => controller.publish(&frame)?,
            ReadOutcome::Interrupted => continue,
            ReadOutcome::EndOfStream => {
                info!("End of input, shutting down");
                controller.request_process_exit();
                controller.stop();
            }
        }
    }
    Ok(())
}
