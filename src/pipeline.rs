//! Per-port pump.
//!
//! One pump owns each serial endpoint. Every loop turn runs three phases:
//! deliver bytes queued by the peer pump to our port, ingest port bytes into
//! the private assembly ring, then frame and forward complete APDUs into the
//! peer's delivery ring. The client-side pump frames commands and arms the
//! latency meter; the host-side pump frames responses and closes the
//! exchange.
//!
//! Rings stay strictly SPSC: the assembly ring never leaves the pump thread,
//! and each delivery ring has exactly one producer (the framing pump) and
//! one consumer (the delivering pump).

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};

use crate::apdu::{parse_header, FrameFault, FrameStatus, Framer};
use crate::config::RelayConfig;
use crate::latency::LatencyMeter;
use crate::metrics::{Direction, ErrorKind, MetricsPublisher, RelayEvent, RelayStats};
use crate::ring::{self, BufferFull, Consumer, Producer};
use crate::serial::{LinkError, SerialLink};

/// Assembly ring size: big enough for the largest legal frame (extended
/// Lc 65 535 command, or a capped response) regardless of the configured
/// delivery capacity.
const RX_ASSEMBLY_CAPACITY: usize = 1 << 17;

/// Per-read scratch; at 921 600 baud roughly 2.5 ms of line traffic.
const READ_CHUNK: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Reading,
    Forwarding,
    Blocked,
    Draining,
    Error,
    Stopped,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineState::Idle => write!(f, "idle"),
            PipelineState::Reading => write!(f, "reading"),
            PipelineState::Forwarding => write!(f, "forwarding"),
            PipelineState::Blocked => write!(f, "blocked"),
            PipelineState::Draining => write!(f, "draining"),
            PipelineState::Error => write!(f, "error"),
            PipelineState::Stopped => write!(f, "stopped"),
        }
    }
}

/// The slice of the relay configuration one pump needs.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub direction: Direction,
    pub read_timeout: Duration,
    pub inter_byte_idle: Duration,
    pub latency_threshold_ns: u64,
    pub max_retries: u32,
    pub shutdown_timeout: Duration,
    pub verify_checksum: bool,
}

impl PipelineConfig {
    pub fn new(config: &RelayConfig, direction: Direction) -> Self {
        Self {
            direction,
            read_timeout: config.read_timeout(),
            inter_byte_idle: config.inter_byte_idle(),
            latency_threshold_ns: config.latency_threshold_ns,
            max_retries: config.max_retries,
            shutdown_timeout: config.shutdown_timeout(),
            verify_checksum: config.verify_checksum,
        }
    }
}

/// A frame accepted by the framer, part-way through forwarding.
struct InFlight {
    len: usize,
    done: usize,
    /// Fingerprint and decoded Le when this is a command frame.
    command: Option<(u64, Option<usize>)>,
}

enum Decision {
    Wait,
    Accept(InFlight, bool),
    Reject(FrameFault),
}

pub struct Pipeline {
    cfg: PipelineConfig,
    link: Box<dyn SerialLink>,
    framer: Framer,
    rx_prod: Producer,
    rx_cons: Consumer,
    /// Producer half of the peer's delivery ring.
    forward: Producer,
    /// Consumer half of our own delivery ring.
    deliver: Consumer,
    meter: Arc<LatencyMeter>,
    publisher: Arc<MetricsPublisher>,
    stats: Arc<RelayStats>,
    stop: Arc<AtomicBool>,
    state: PipelineState,
    last_rx: Option<Instant>,
    in_flight: Option<InFlight>,
    port_was_down: bool,
}

impl Pipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: PipelineConfig,
        link: Box<dyn SerialLink>,
        forward: Producer,
        deliver: Consumer,
        meter: Arc<LatencyMeter>,
        publisher: Arc<MetricsPublisher>,
        stats: Arc<RelayStats>,
        stop: Arc<AtomicBool>,
    ) -> Self {
        let (rx_prod, rx_cons) = ring::ring(RX_ASSEMBLY_CAPACITY);
        let framer = Framer::new(cfg.verify_checksum);
        Self {
            cfg,
            link,
            framer,
            rx_prod,
            rx_cons,
            forward,
            deliver,
            meter,
            publisher,
            stats,
            stop,
            state: PipelineState::Idle,
            last_rx: None,
            in_flight: None,
            port_was_down: false,
        }
    }

    /// Thread body. Returns `Err` only on a fatal fault the coordinator must
    /// handle; everything else is absorbed into counters and events.
    pub fn run(mut self) -> Result<()> {
        log::info!(
            "{} pump started on {}",
            self.cfg.direction,
            self.link.describe()
        );
        let result = loop {
            if self.stop.load(Ordering::Acquire) {
                break Ok(());
            }
            if let Err(e) = self.tick() {
                break Err(e);
            }
        };
        if result.is_ok() {
            self.drain_on_shutdown();
        }
        self.set_state(PipelineState::Stopped);
        match &result {
            Ok(()) => log::info!("{} pump stopped", self.cfg.direction),
            Err(e) => log::error!("{} pump failed: {}", self.cfg.direction, e),
        }
        result
    }

    fn tick(&mut self) -> Result<()> {
        if !self.ensure_link() {
            // Paused while the adapter's backoff gates the next reopen.
            thread::sleep(Duration::from_millis(10));
            return Ok(());
        }
        self.deliver_outbound()?;
        self.ingest();
        self.process_frames();
        Ok(())
    }

    fn set_state(&mut self, next: PipelineState) {
        if self.state != next {
            log::trace!("{}: {} -> {}", self.cfg.direction, self.state, next);
            self.state = next;
        }
    }

    fn is_command_side(&self) -> bool {
        self.cfg.direction == Direction::ClientToHost
    }

    /// Direction of the exchange this pump's frames belong to.
    fn exchange_direction(&self) -> Direction {
        if self.is_command_side() {
            self.cfg.direction
        } else {
            self.cfg.direction.opposite()
        }
    }

    fn ensure_link(&mut self) -> bool {
        if self.link.is_open() {
            if self.port_was_down {
                log::info!("{}: link restored", self.cfg.direction);
                self.port_was_down = false;
            }
            return true;
        }
        if !self.port_was_down {
            self.port_was_down = true;
            log::warn!("{}: port unavailable, reconnecting", self.cfg.direction);
            self.stats.record_error(ErrorKind::PortUnavailable);
            self.publisher.publish(RelayEvent::PortUnavailable {
                direction: self.cfg.direction,
            });
        }
        self.link.maintain()
    }

    /// Peer ring -> our serial port.
    fn deliver_outbound(&mut self) -> Result<()> {
        loop {
            if self.deliver.is_empty() {
                return Ok(());
            }
            let (written, chunk_len) = {
                let view = self.deliver.peek(READ_CHUNK);
                let (first, second) = view.segments();
                let chunk = if first.is_empty() { second } else { first };
                (
                    write_with_retry(self.link.as_mut(), chunk, self.cfg.max_retries),
                    chunk.len(),
                )
            };
            match written {
                Ok(0) => return Ok(()), // OS buffer full; benign stall
                Ok(n) => {
                    self.deliver.commit(n);
                    self.stats.bytes_tx.fetch_add(n as u64, Ordering::Relaxed);
                    if n < chunk_len {
                        return Ok(());
                    }
                }
                Err(e) => {
                    self.stats.record_error(ErrorKind::Io);
                    if self.link.is_open() {
                        // Port still claims to be up but writes keep failing:
                        // nothing left to recover locally.
                        self.set_state(PipelineState::Error);
                        self.stats.record_error(ErrorKind::Fatal);
                        return Err(anyhow!(
                            "{}: serial write failed after retry: {}",
                            self.cfg.direction,
                            e
                        ));
                    }
                    // Torn down; the reconnect path takes over and the
                    // undelivered bytes stay queued.
                    log::warn!("{}: write failed, port down: {}", self.cfg.direction, e);
                    return Ok(());
                }
            }
        }
    }

    /// Serial port -> assembly ring.
    fn ingest(&mut self) {
        let free = self.rx_prod.free();
        if free == 0 {
            return; // assembly full; backpressure reaches the wire
        }
        let mut buf = [0u8; READ_CHUNK];
        let want = free.min(buf.len());
        match self.link.read(&mut buf[..want], self.cfg.read_timeout) {
            Ok(n) => {
                self.last_rx = Some(Instant::now());
                self.stats.bytes_rx.fetch_add(n as u64, Ordering::Relaxed);
                let written = self.rx_prod.write(&buf[..n]).unwrap_or(0);
                debug_assert_eq!(written, n);
                if self.state == PipelineState::Idle {
                    self.set_state(PipelineState::Reading);
                }
            }
            Err(LinkError::Timeout) => {}
            Err(e) => {
                log::debug!("{}: read error: {}", self.cfg.direction, e);
                self.stats.record_error(ErrorKind::Io);
            }
        }
    }

    /// Assembly ring -> framer -> peer delivery ring.
    fn process_frames(&mut self) {
        loop {
            if self.in_flight.is_some() {
                if !self.continue_forward() {
                    return; // blocked on the delivery ring
                }
                continue;
            }
            let avail = self.rx_cons.available();
            if avail == 0 {
                if self.state == PipelineState::Reading {
                    self.set_state(PipelineState::Idle);
                }
                return;
            }
            let idle = self.idle_elapsed();
            let decision = self.decide(avail, idle);
            match decision {
                Decision::Wait => return,
                Decision::Accept(frame, checksum_bad) => {
                    if checksum_bad {
                        // Advisory: counted and reported, forwarded verbatim.
                        self.stats.record_error(ErrorKind::Malformed);
                        self.publisher.publish(RelayEvent::FramingError {
                            kind: FrameFault::Checksum,
                            direction: self.cfg.direction,
                        });
                    }
                    self.in_flight = Some(frame);
                    self.set_state(PipelineState::Forwarding);
                }
                Decision::Reject(fault) => {
                    self.set_state(PipelineState::Draining);
                    self.stats.record_error(ErrorKind::Malformed);
                    self.publisher.publish(RelayEvent::FramingError {
                        kind: fault,
                        direction: self.cfg.direction,
                    });
                    self.drain_malformed();
                    self.set_state(PipelineState::Reading);
                }
            }
        }
    }

    fn decide(&self, avail: usize, idle: bool) -> Decision {
        let view = self.rx_cons.peek(avail);
        let status = if self.is_command_side() {
            self.framer.command_status(&view, idle)
        } else {
            let expected_le = self
                .meter
                .expected_le(self.exchange_direction())
                .flatten();
            self.framer.response_status(&view, expected_le, idle)
        };
        match status {
            FrameStatus::NeedMore => Decision::Wait,
            FrameStatus::Malformed(fault) => Decision::Reject(fault),
            FrameStatus::Complete(len) => {
                let command = if self.is_command_side() {
                    match parse_header(&view.slice(0, len)) {
                        Ok(header) => Some((header.fingerprint(), header.le)),
                        Err(fault) => return Decision::Reject(fault),
                    }
                } else {
                    None
                };
                let checksum_bad = !self.framer.checksum_ok(&view, len);
                Decision::Accept(
                    InFlight {
                        len,
                        done: 0,
                        command,
                    },
                    checksum_bad,
                )
            }
        }
    }

    /// Copy the accepted frame into the peer ring; true when finished.
    fn continue_forward(&mut self) -> bool {
        let Some(mut frame) = self.in_flight.take() else {
            return true;
        };
        while frame.done < frame.len {
            let (result, chunk_len) = {
                let view = self.rx_cons.peek(frame.len);
                let remaining = view.slice(frame.done, frame.len);
                let (first, second) = remaining.segments();
                let chunk = if first.is_empty() { second } else { first };
                (self.forward.write(chunk), chunk.len())
            };
            match result {
                Ok(n) => {
                    frame.done += n;
                    if n < chunk_len {
                        self.block(frame);
                        return false;
                    }
                }
                Err(BufferFull) => {
                    self.block(frame);
                    return false;
                }
            }
        }
        self.finish_forward(frame);
        true
    }

    fn block(&mut self, frame: InFlight) {
        if self.state != PipelineState::Blocked {
            self.stats.record_error(ErrorKind::BufferFull);
            log::trace!(
                "{}: delivery ring full at {}/{} bytes",
                self.cfg.direction,
                frame.done,
                frame.len
            );
            self.set_state(PipelineState::Blocked);
        }
        self.in_flight = Some(frame);
    }

    fn finish_forward(&mut self, frame: InFlight) {
        self.rx_cons.commit(frame.len);
        if self.is_command_side() {
            if let Some((fingerprint, le)) = frame.command {
                self.meter.begin(self.exchange_direction(), fingerprint, le);
                self.stats.frames.fetch_add(1, Ordering::Relaxed);
                log::debug!(
                    "{}: forwarded {} byte command {:#018x}",
                    self.cfg.direction,
                    frame.len,
                    fingerprint
                );
            }
        } else if let Some(sample) = self.meter.complete(self.exchange_direction()) {
            log::debug!(
                "{}: forwarded {} byte response in {} ns",
                self.cfg.direction,
                frame.len,
                sample.duration_ns()
            );
            if sample.duration_ns() >= self.cfg.latency_threshold_ns {
                self.stats.record_error(ErrorKind::HighLatency);
                self.publisher.publish(RelayEvent::HighLatency {
                    sample_ns: sample.duration_ns(),
                    direction: sample.direction,
                    fingerprint: sample.fingerprint,
                });
            }
        } else {
            log::debug!(
                "{}: forwarded {} byte response with no pending command",
                self.cfg.direction,
                frame.len
            );
        }
        self.set_state(PipelineState::Idle);
    }

    /// Discard the offending byte plus everything up to the next plausible
    /// header start currently buffered.
    fn drain_malformed(&mut self) {
        let avail = self.rx_cons.available();
        let mut discard = 1;
        {
            let view = self.rx_cons.peek(avail);
            while discard < avail {
                match view.byte(discard) {
                    Some(b) if b != 0xFF => break,
                    _ => discard += 1,
                }
            }
        }
        self.rx_cons.commit(discard);
        log::debug!(
            "{}: drained {} bytes after malformed frame",
            self.cfg.direction,
            discard
        );
    }

    fn idle_elapsed(&self) -> bool {
        match self.last_rx {
            Some(at) => at.elapsed() >= self.cfg.inter_byte_idle,
            None => false,
        }
    }

    /// Finish in-flight work within the shutdown deadline; whatever is left
    /// is counted as dropped.
    fn drain_on_shutdown(&mut self) {
        let deadline = Instant::now() + self.cfg.shutdown_timeout;
        while Instant::now() < deadline {
            let forwarding = self.in_flight.is_some();
            // A closed port cannot drain; its bytes are already lost.
            let delivering = !self.deliver.is_empty() && self.link.is_open();
            if !forwarding && !delivering {
                break;
            }
            if forwarding {
                self.continue_forward();
            }
            if delivering && self.deliver_outbound().is_err() {
                break;
            }
            thread::sleep(Duration::from_micros(200));
        }
        let leftover = self.deliver.available() + self.rx_cons.available();
        if leftover > 0 {
            self.stats
                .add_error_count(ErrorKind::ShutdownDropped, leftover as u64);
            log::warn!(
                "{}: {} bytes abandoned at shutdown",
                self.cfg.direction,
                leftover
            );
        }
    }
}

/// One immediate retry, no backoff: the exchange is time-critical and the
/// relay never re-sends an APDU on its own.
fn write_with_retry(
    link: &mut dyn SerialLink,
    buf: &[u8],
    retries: u32,
) -> Result<usize, LinkError> {
    let mut attempt = 0;
    loop {
        match link.write(buf) {
            Ok(n) => return Ok(n),
            Err(LinkError::Timeout) => return Ok(0),
            Err(e) if attempt < retries => {
                attempt += 1;
                log::warn!("serial write failed ({}), retry {}", e, attempt);
            }
            Err(e) => return Err(e),
        }
    }
}
