//! Common test utilities: a scripted in-memory transport that records every
//! device call.

// Not every test file uses every helper.
#![allow(dead_code)]

use std::collections::HashSet;
use std::io::{self, Read};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use opendmx_rs::device::{DeviceSelector, DmxPort, DmxTransport};
use opendmx_rs::protocol::{FRAME_LEN, Frame, LineProperties};
use opendmx_rs::{EngineConfig, Error, Result, Timing};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Open,
    OpenFailed,
    Reset,
    LineProperty(u16),
    BaudRate(u32),
    Rts(bool),
    Purge,
    Write(Vec<u8>),
    WriteFailed,
    Close,
}

#[derive(Default)]
struct MockState {
    events: Mutex<Vec<Event>>,
    open_times: Mutex<Vec<Instant>>,
    remaining_open_failures: AtomicUsize,
    fail_writes: Mutex<HashSet<usize>>,
    write_calls: AtomicUsize,
    break_delay: Mutex<Duration>,
    write_delay: Mutex<Duration>,
    panic_on_open: AtomicBool,
}

impl MockState {
    fn record(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

pub struct MockTransport {
    state: Arc<MockState>,
}

/// Test-side view of what the transport has seen.
#[derive(Clone)]
pub struct Recorder {
    state: Arc<MockState>,
}

pub fn mock_transport() -> (MockTransport, Recorder) {
    let state = Arc::new(MockState::default());
    (
        MockTransport {
            state: Arc::clone(&state),
        },
        Recorder { state },
    )
}

impl MockTransport {
    /// Fail the next `count` open attempts. `usize::MAX` fails forever.
    pub fn fail_opens(self, count: usize) -> Self {
        self.state.remaining_open_failures.store(count, Ordering::SeqCst);
        self
    }

    /// Fail the write calls with these zero-based indices.
    pub fn fail_writes(self, indices: &[usize]) -> Self {
        self.state.fail_writes.lock().unwrap().extend(indices.iter().copied());
        self
    }

    /// Panic inside `open`, as a crashing driver would.
    pub fn panic_on_open(self) -> Self {
        self.state.panic_on_open.store(true, Ordering::SeqCst);
        self
    }

    /// Make every break assertion take `delay` inside the driver call.
    pub fn slow_break(self, delay: Duration) -> Self {
        *self.state.break_delay.lock().unwrap() = delay;
        self
    }

    /// Make every write take `delay` before it completes.
    pub fn slow_writes(self, delay: Duration) -> Self {
        *self.state.write_delay.lock().unwrap() = delay;
        self
    }
}

impl DmxTransport for MockTransport {
    type Port = MockPort;

    fn open(&self, _selector: &DeviceSelector) -> Result<MockPort> {
        self.state.open_times.lock().unwrap().push(Instant::now());
        if self.state.panic_on_open.load(Ordering::SeqCst) {
            panic!("driver crashed during open");
        }
        let failed = self
            .state
            .remaining_open_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| match n {
                0 => None,
                usize::MAX => Some(usize::MAX),
                n => Some(n - 1),
            })
            .is_ok();
        if failed {
            self.state.record(Event::OpenFailed);
            return Err(Error::DeviceNotFound);
        }
        self.state.record(Event::Open);
        Ok(MockPort {
            state: Arc::clone(&self.state),
        })
    }
}

pub struct MockPort {
    state: Arc<MockState>,
}

impl DmxPort for MockPort {
    fn reset(&mut self) -> Result<()> {
        self.state.record(Event::Reset);
        Ok(())
    }

    fn set_line_property(&mut self, line: LineProperties, brk: bool) -> Result<()> {
        self.state.record(Event::LineProperty(line.sio_value(brk)));
        if brk {
            thread::sleep(*self.state.break_delay.lock().unwrap());
        }
        Ok(())
    }

    fn set_baud_rate(&mut self, baud: u32) -> Result<()> {
        self.state.record(Event::BaudRate(baud));
        Ok(())
    }

    fn set_rts(&mut self, high: bool) -> Result<()> {
        self.state.record(Event::Rts(high));
        Ok(())
    }

    fn purge_buffers(&mut self) -> Result<()> {
        self.state.record(Event::Purge);
        Ok(())
    }

    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        let index = self.state.write_calls.fetch_add(1, Ordering::SeqCst);
        if self.state.fail_writes.lock().unwrap().contains(&index) {
            self.state.record(Event::WriteFailed);
            return Err(Error::Io(io::Error::from(io::ErrorKind::BrokenPipe)));
        }
        thread::sleep(*self.state.write_delay.lock().unwrap());
        self.state.record(Event::Write(data.to_vec()));
        Ok(())
    }

    fn close(self) -> Result<()> {
        self.state.record(Event::Close);
        Ok(())
    }
}

impl Recorder {
    pub fn events(&self) -> Vec<Event> {
        self.state.events.lock().unwrap().clone()
    }

    pub fn count(&self, wanted: &Event) -> usize {
        self.events().iter().filter(|e| *e == wanted).count()
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Write(data) => Some(data),
                _ => None,
            })
            .collect()
    }

    /// Write calls that have started, including ones still in flight.
    pub fn write_calls(&self) -> usize {
        self.state.write_calls.load(Ordering::SeqCst)
    }

    pub fn open_times(&self) -> Vec<Instant> {
        self.state.open_times.lock().unwrap().clone()
    }

    /// Poll until `condition` holds, panicking after a few seconds.
    pub fn wait_until(&self, what: &str, condition: impl Fn(&Recorder) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition(self) {
            if Instant::now() > deadline {
                panic!("Timed out waiting for {}; events: {:?}", what, self.events().len());
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    pub fn wait_for_writes(&self, n: usize) {
        self.wait_until(&format!("{} writes", n), |r| r.writes().len() >= n);
    }
}

/// Cycle timing shrunk so tests run in milliseconds.
pub fn fast_timing() -> Timing {
    Timing {
        break_time: Duration::ZERO,
        mark_after_break: Duration::ZERO,
        inter_frame_gap: Duration::from_millis(1),
        reconnect_backoff: Duration::from_millis(20),
    }
}

pub fn fast_config() -> EngineConfig {
    EngineConfig::new(DeviceSelector::Any).with_timing(fast_timing())
}

pub fn frame_of(value: u8) -> Frame {
    Frame::from([value; FRAME_LEN])
}

/// A reader that serves `data`, then waits for `gate` before reporting
/// end of input.
pub struct GatedReader<F: FnMut() + Send> {
    pub data: io::Cursor<Vec<u8>>,
    pub gate: Option<F>,
}

impl<F: FnMut() + Send> Read for GatedReader<F> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.data.read(buf)?;
        if n == 0 {
            if let Some(mut gate) = self.gate.take() {
                gate();
            }
        }
        Ok(n)
    }
}

pub fn gated_reader<F: FnMut() + Send>(data: Vec<u8>, gate: F) -> GatedReader<F> {
    GatedReader {
        data: io::Cursor::new(data),
        gate: Some(gate),
    }
}

const CHILD_ENV: &str = "OPENDMX_TEST_CHILD";

/// Whether this process is the child started by [`run_test_in_child`].
pub fn in_child() -> bool {
    std::env::var_os(CHILD_ENV).is_some()
}

/// Re-run the single test `name` from the current test binary in a child
/// process, for behaviour that ends the process.
pub fn run_test_in_child(name: &str) -> ExitStatus {
    let exe = std::env::current_exe().unwrap();
    Command::new(exe)
        .args(["--exact", name, "--test-threads=1"])
        .env(CHILD_ENV, "1")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .unwrap()
}

/// Whether `status` is a termination by `SIGABRT`.
pub fn aborted(status: &ExitStatus) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        const SIGABRT: i32 = 6;
        status.signal() == Some(SIGABRT)
    }
    #[cfg(not(unix))]
    {
        !status.success()
    }
}
