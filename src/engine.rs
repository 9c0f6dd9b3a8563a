//! Transmission engine: owns the device and drives the DMX timing loop.
//!
//! The worker thread alternates between two states until it is told to stop:
//!
//! - **acquiring**: open and configure the device, waiting
//!   [`Timing::reconnect_backoff`] between failed attempts. There is no retry
//!   limit; an unplugged interface is an expected condition.
//! - **transmitting**: every cycle adopts the freshest frame from the
//!   [`FrameExchange`] if the lock is free, then sends BREAK, MAB and the 513
//!   frame bytes, then idles for the inter-frame gap. Any device error closes
//!   the device and falls back to acquiring.
//!
//! The device is always closed before the worker exits.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::device::{ConnectionState, DeviceHandle, DeviceSelector, DmxTransport};
use crate::error::Result;
use crate::exchange::{Adoption, FrameExchange};
use crate::protocol::{
    BREAK_TIME, DMX_BAUD_RATE, Frame, INTER_FRAME_GAP, LineProperties, MARK_AFTER_BREAK, RECONNECT_BACKOFF, StartCode,
};

// Upper bound on how long a stop request waits during the backoff.
const STOP_POLL_SLICE: Duration = Duration::from_millis(50);

/// Fixed delays of one output cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    pub break_time: Duration,
    pub mark_after_break: Duration,
    pub inter_frame_gap: Duration,
    pub reconnect_backoff: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            break_time: BREAK_TIME,
            mark_after_break: MARK_AFTER_BREAK,
            inter_frame_gap: INTER_FRAME_GAP,
            reconnect_backoff: RECONNECT_BACKOFF,
        }
    }
}

impl Timing {
    /// Nominal length of one cycle, ignoring the time spent in the driver.
    #[cfg(test)]
    pub(crate) fn cycle_period(&self) -> Duration {
        self.break_time + self.mark_after_break + self.inter_frame_gap
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub selector: DeviceSelector,
    pub line: LineProperties,
    pub baud: u32,
    pub timing: Timing,
}

impl EngineConfig {
    pub fn new(selector: DeviceSelector) -> Self {
        Self {
            selector,
            line: LineProperties::DMX,
            baud: DMX_BAUD_RATE,
            timing: Timing::default(),
        }
    }

    pub fn with_timing(mut self, timing: Timing) -> Self {
        self.timing = timing;
        self
    }
}

/// Counters shared between the worker and whoever wants to observe it.
#[derive(Debug, Default)]
pub struct EngineStats {
    frames_sent: AtomicU64,
    frames_adopted: AtomicU64,
    acquisitions: AtomicU64,
    failed_acquisitions: AtomicU64,
    device_errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub frames_sent: u64,
    pub frames_adopted: u64,
    pub acquisitions: u64,
    pub failed_acquisitions: u64,
    pub device_errors: u64,
}

impl EngineStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_adopted: self.frames_adopted.load(Ordering::Relaxed),
            acquisitions: self.acquisitions.load(Ordering::Relaxed),
            failed_acquisitions: self.failed_acquisitions.load(Ordering::Relaxed),
            device_errors: self.device_errors.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Handle to a running worker thread.
pub struct Engine {
    running: Arc<AtomicBool>,
    handle: JoinHandle<Frame>,
}

impl Engine {
    /// Spawn the worker. `active` is the frame sent until a newer one is
    /// adopted.
    pub fn spawn<T: DmxTransport>(
        transport: Arc<T>,
        exchange: Arc<FrameExchange>,
        config: EngineConfig,
        stats: Arc<EngineStats>,
        active: Frame,
    ) -> Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let worker = Worker {
            transport,
            exchange,
            config,
            stats,
            running: Arc::clone(&running),
            active,
            device: DeviceHandle::new(),
            failures: 0,
        };
        let handle = thread::Builder::new()
            .name("dmx-engine".to_string())
            .spawn(move || worker.run())?;
        Ok(Self { running, handle })
    }

    /// Ask the worker to exit and wait until it has closed the device.
    ///
    /// Returns the last frame the worker was transmitting.
    pub fn stop(self) -> Frame {
        self.running.store(false, Ordering::SeqCst);
        match self.handle.join() {
            Ok(frame) => frame,
            Err(panic) => {
                error!("Engine worker panicked");
                std::panic::resume_unwind(panic)
            }
        }
    }
}

struct Worker<T: DmxTransport> {
    transport: Arc<T>,
    exchange: Arc<FrameExchange>,
    config: EngineConfig,
    stats: Arc<EngineStats>,
    running: Arc<AtomicBool>,
    active: Frame,
    device: DeviceHandle<T::Port>,
    // Consecutive failed acquisitions in the current outage.
    failures: u64,
}

impl<T: DmxTransport> Worker<T> {
    fn run(mut self) -> Frame {
        info!(device = %self.config.selector, "Engine started");
        while self.is_running() && self.acquire() {
            self.transmit();
            self.close_device();
        }
        self.close_device();
        info!("Engine stopped");
        self.active
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Returns `false` if a stop was requested before a device came up.
    fn acquire(&mut self) -> bool {
        while self.is_running() {
            match self.open_and_configure() {
                Ok(()) => {
                    info!(after_failures = self.failures, "Device ready");
                    self.failures = 0;
                    EngineStats::bump(&self.stats.acquisitions);
                    return true;
                }
                Err(e) => {
                    self.close_device();
                    self.failures += 1;
                    EngineStats::bump(&self.stats.failed_acquisitions);
                    if self.failures == 1 {
                        warn!("Unable to open device: {}", e);
                    } else {
                        debug!(attempt = self.failures, "Unable to open device: {}", e);
                    }
                    if !self.sleep_while_running(self.config.timing.reconnect_backoff) {
                        return false;
                    }
                }
            }
        }
        false
    }

    fn open_and_configure(&mut self) -> Result<()> {
        self.device.open(self.transport.as_ref(), &self.config.selector)?;
        self.device.configure(self.config.line, self.config.baud)
    }

    fn transmit(&mut self) {
        while self.is_running() {
            if let Err(e) = self.cycle() {
                EngineStats::bump(&self.stats.device_errors);
                warn!("Device error, reconnecting: {}", e);
                return;
            }
        }
    }

    fn cycle(&mut self) -> Result<()> {
        if self.exchange.try_adopt(&mut self.active) == Adoption::Adopted {
            EngineStats::bump(&self.stats.frames_adopted);
            if let StartCode::Reserved(code) = self.active.start_code() {
                debug!(code, "Forwarding frame with reserved start code");
            }
            debug!(frame = ?self.active, "Adopted new frame");
        }

        let timing = self.config.timing;

        self.device.assert_break()?;
        thread::sleep(timing.break_time);
        if !self.is_running() {
            return Ok(());
        }

        self.device.clear_break()?;
        thread::sleep(timing.mark_after_break);
        if !self.is_running() {
            return Ok(());
        }

        self.device.write_frame(&self.active)?;
        EngineStats::bump(&self.stats.frames_sent);

        self.sleep_while_running(timing.inter_frame_gap);
        Ok(())
    }

    fn close_device(&mut self) {
        if self.device.state() == ConnectionState::Closed {
            return;
        }
        if let Err(e) = self.device.close() {
            warn!("Unable to close device: {}", e);
        }
    }

    /// Sleep for `duration`, waking early on stop. Returns whether the engine
    /// is still running.
    fn sleep_while_running(&self, duration: Duration) -> bool {
        let mut remaining = duration;
        while remaining > Duration::ZERO {
            if !self.is_running() {
                return false;
            }
            let slice = remaining.min(STOP_POLL_SLICE);
            thread::sleep(slice);
            remaining = remaining.saturating_sub(slice);
        }
        self.is_running()
    }
}
