//! Serial link adapter.
//!
//! [`SerialLink`] is the seam between the pumps and the transport: a real
//! port (`serialport` crate, 8N1, no flow control) or the in-memory loopback
//! pair used by integration tests and benchmarks.
//!
//! A real port that fails mid-I/O is torn down and re-opened by `maintain`
//! with exponential backoff (100 ms base, 2 s cap). While the port is closed
//! the owning pump pauses and reports the direction as unavailable.

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};

pub const RECONNECT_BASE: Duration = Duration::from_millis(100);
pub const RECONNECT_CAP: Duration = Duration::from_secs(2);

#[derive(Debug)]
pub enum LinkError {
    /// No bytes before the read deadline; benign.
    Timeout,
    /// The link is currently closed or severed.
    Disconnected,
    /// Transport failure; the adapter tears down and schedules a reconnect.
    Io(io::Error),
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkError::Timeout => write!(f, "read timed out"),
            LinkError::Disconnected => write!(f, "link disconnected"),
            LinkError::Io(e) => write!(f, "serial I/O error: {}", e),
        }
    }
}

impl std::error::Error for LinkError {}

/// Byte transport used by a pump. One owner per link; no interior locking on
/// the real-port implementation.
pub trait SerialLink: Send {
    /// Read up to `buf.len()` bytes, waiting at most `timeout`.
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, LinkError>;

    /// Write as much of `buf` as the transport accepts.
    fn write(&mut self, buf: &[u8]) -> Result<usize, LinkError>;

    fn is_open(&self) -> bool;

    /// Drive reconnection when closed. Returns true when the link is usable.
    fn maintain(&mut self) -> bool;

    fn describe(&self) -> String;
}

/// `serialport`-backed link with teardown/backoff reconnect.
pub struct SerialPortLink {
    name: String,
    baud: u32,
    port: Option<Box<dyn SerialPort>>,
    last_timeout: Duration,
    backoff: Duration,
    next_attempt: Option<Instant>,
}

impl SerialPortLink {
    /// Create the link closed; the first `maintain` call opens it.
    pub fn new(name: impl Into<String>, baud: u32) -> Self {
        Self {
            name: name.into(),
            baud,
            port: None,
            last_timeout: Duration::from_millis(1),
            backoff: RECONNECT_BASE,
            next_attempt: None,
        }
    }

    /// Open the port immediately, failing fast on a bad name.
    pub fn open(name: impl Into<String>, baud: u32) -> Result<Self, LinkError> {
        let mut link = Self::new(name, baud);
        link.port = Some(link.open_port()?);
        Ok(link)
    }

    fn open_port(&self) -> Result<Box<dyn SerialPort>, LinkError> {
        serialport::new(self.name.as_str(), self.baud)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(self.last_timeout)
            .open()
            .map_err(|e| LinkError::Io(io::Error::new(io::ErrorKind::Other, e)))
    }

    /// Current reconnect delay; grows 100 ms -> 200 ms -> ... -> 2 s.
    pub fn backoff(&self) -> Duration {
        self.backoff
    }

    fn tear_down(&mut self, err: &io::Error) {
        log::warn!("{}: tearing down after {}", self.name, err);
        self.port = None;
        self.next_attempt = Some(Instant::now() + self.backoff);
        self.backoff = (self.backoff * 2).min(RECONNECT_CAP);
    }
}

impl SerialLink for SerialPortLink {
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, LinkError> {
        let Some(port) = self.port.as_mut() else {
            return Err(LinkError::Disconnected);
        };
        if timeout != self.last_timeout {
            if let Err(e) = port.set_timeout(timeout) {
                let e = io::Error::new(io::ErrorKind::Other, e);
                self.tear_down(&e);
                return Err(LinkError::Io(e));
            }
            self.last_timeout = timeout;
        }
        match port.read(buf) {
            Ok(0) => Err(LinkError::Timeout),
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Err(LinkError::Timeout),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Err(LinkError::Timeout),
            Err(e) => {
                self.tear_down(&e);
                Err(LinkError::Io(e))
            }
        }
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, LinkError> {
        let Some(port) = self.port.as_mut() else {
            return Err(LinkError::Disconnected);
        };
        match port.write(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Err(LinkError::Timeout),
            Err(e) => {
                self.tear_down(&e);
                Err(LinkError::Io(e))
            }
        }
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn maintain(&mut self) -> bool {
        if self.port.is_some() {
            return true;
        }
        if let Some(at) = self.next_attempt {
            if Instant::now() < at {
                return false;
            }
        }
        match self.open_port() {
            Ok(port) => {
                log::info!("{}: reopened at {} baud", self.name, self.baud);
                self.port = Some(port);
                self.backoff = RECONNECT_BASE;
                self.next_attempt = None;
                true
            }
            Err(e) => {
                log::debug!("{}: reopen failed: {}", self.name, e);
                self.next_attempt = Some(Instant::now() + self.backoff);
                self.backoff = (self.backoff * 2).min(RECONNECT_CAP);
                false
            }
        }
    }

    fn describe(&self) -> String {
        format!("{}@{}", self.name, self.baud)
    }
}

struct Pipe {
    data: Mutex<VecDeque<u8>>,
    ready: Condvar,
}

impl Pipe {
    fn new() -> Self {
        Self {
            data: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
        }
    }

    fn push(&self, bytes: &[u8]) {
        let mut q = self.data.lock().unwrap();
        q.extend(bytes);
        self.ready.notify_one();
    }

    fn pop_into(&self, buf: &mut [u8], timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        let mut q = self.data.lock().unwrap();
        loop {
            if !q.is_empty() {
                let n = buf.len().min(q.len());
                for slot in buf[..n].iter_mut() {
                    *slot = q.pop_front().unwrap();
                }
                return n;
            }
            let now = Instant::now();
            if now >= deadline {
                return 0;
            }
            let (guard, _) = self.ready.wait_timeout(q, deadline - now).unwrap();
            q = guard;
        }
    }
}

/// Shared switch that simulates unplugging one end of a loopback pair.
#[derive(Clone)]
pub struct LoopbackFault(Arc<AtomicBool>);

impl LoopbackFault {
    pub fn sever(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn restore(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_severed(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// In-memory serial link; created in connected pairs by [`loopback`].
pub struct LoopbackLink {
    label: &'static str,
    rx: Arc<Pipe>,
    tx: Arc<Pipe>,
    severed: Arc<AtomicBool>,
}

impl LoopbackLink {
    /// Handle for injecting a fault on this end from another thread.
    pub fn fault_handle(&self) -> LoopbackFault {
        LoopbackFault(Arc::clone(&self.severed))
    }
}

/// A connected pair of in-memory links: bytes written to one end are read
/// from the other.
pub fn loopback() -> (LoopbackLink, LoopbackLink) {
    let a_to_b = Arc::new(Pipe::new());
    let b_to_a = Arc::new(Pipe::new());
    let a = LoopbackLink {
        label: "loopback-a",
        rx: Arc::clone(&b_to_a),
        tx: Arc::clone(&a_to_b),
        severed: Arc::new(AtomicBool::new(false)),
    };
    let b = LoopbackLink {
        label: "loopback-b",
        rx: a_to_b,
        tx: b_to_a,
        severed: Arc::new(AtomicBool::new(false)),
    };
    (a, b)
}

impl SerialLink for LoopbackLink {
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, LinkError> {
        if self.severed.load(Ordering::SeqCst) {
            return Err(LinkError::Disconnected);
        }
        match self.rx.pop_into(buf, timeout) {
            0 => Err(LinkError::Timeout),
            n => Ok(n),
        }
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, LinkError> {
        if self.severed.load(Ordering::SeqCst) {
            return Err(LinkError::Disconnected);
        }
        self.tx.push(buf);
        Ok(buf.len())
    }

    fn is_open(&self) -> bool {
        !self.severed.load(Ordering::SeqCst)
    }

    fn maintain(&mut self) -> bool {
        self.is_open()
    }

    fn describe(&self) -> String {
        self.label.to_string()
    }
}
