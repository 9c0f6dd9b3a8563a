//! Process-wide lifecycle: the running flag and start/stop/restart of the
//! transmission engine.
//!
//! Signal handling lives in the binary and only ever calls into this API.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{info, warn};

use crate::device::DmxTransport;
use crate::engine::{Engine, EngineConfig, EngineStats, StatsSnapshot};
use crate::error::{Result, invariant_violation};
use crate::exchange::FrameExchange;
use crate::protocol::Frame;

struct EngineSlot {
    engine: Option<Engine>,
    // Frame the next worker starts with; carried over a restart.
    last_frame: Frame,
}

pub struct Controller<T: DmxTransport> {
    transport: Arc<T>,
    config: EngineConfig,
    exchange: Arc<FrameExchange>,
    stats: Arc<EngineStats>,
    process_running: AtomicBool,
    slot: Mutex<EngineSlot>,
}

impl<T: DmxTransport> Controller<T> {
    pub fn new(transport: T, config: EngineConfig) -> Self {
        Self {
            transport: Arc::new(transport),
            config,
            exchange: Arc::new(FrameExchange::new()),
            stats: Arc::new(EngineStats::default()),
            process_running: AtomicBool::new(true),
            slot: Mutex::new(EngineSlot {
                engine: None,
                last_frame: Frame::zeroed(),
            }),
        }
    }

    /// Start the engine. Starting twice is a no-op with a warning.
    pub fn start(&self) -> Result<()> {
        let mut slot = self.lock_slot();
        if slot.engine.is_some() {
            warn!("Engine already started");
            return Ok(());
        }
        self.spawn_into(&mut slot)
    }

    /// Stop the engine and wait until the device is closed.
    pub fn stop(&self) {
        let mut slot = self.lock_slot();
        Self::stop_in(&mut slot);
    }

    /// Stop then start, forcing a fresh device acquisition.
    pub fn restart(&self) -> Result<()> {
        let mut slot = self.lock_slot();
        info!("Restarting engine");
        Self::stop_in(&mut slot);
        self.spawn_into(&mut slot)
    }

    /// Mark the process as shutting down. Does not touch the engine.
    pub fn request_process_exit(&self) {
        self.process_running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.process_running.load(Ordering::SeqCst)
    }

    pub fn is_engine_running(&self) -> bool {
        self.lock_slot().engine.is_some()
    }

    /// Hand a complete frame to the engine, starting it if it is not running
    /// and the process is not shutting down.
    pub fn publish(&self, frame: &Frame) -> Result<()> {
        self.exchange.publish(frame);

        let mut slot = self.lock_slot();
        if slot.engine.is_none() && self.is_running() {
            self.spawn_into(&mut slot)?;
        }
        Ok(())
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    fn spawn_into(&self, slot: &mut EngineSlot) -> Result<()> {
        let engine = Engine::spawn(
            Arc::clone(&self.transport),
            Arc::clone(&self.exchange),
            self.config.clone(),
            Arc::clone(&self.stats),
            slot.last_frame,
        )?;
        slot.engine = Some(engine);
        Ok(())
    }

    fn stop_in(slot: &mut EngineSlot) {
        if let Some(engine) = slot.engine.take() {
            slot.last_frame = engine.stop();
        }
    }

    fn lock_slot(&self) -> MutexGuard<'_, EngineSlot> {
        self.slot
            .lock()
            .unwrap_or_else(|_| invariant_violation("engine slot lock poisoned"))
    }
}

impl<T: DmxTransport> Drop for Controller<T> {
    fn drop(&mut self) {
        if let Ok(slot) = self.slot.get_mut() {
            Self::stop_in(slot);
        }
    }
}
