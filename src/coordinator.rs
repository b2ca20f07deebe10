//! Relay lifecycle.
//!
//! The coordinator owns both pumps, the delivery rings, one latency meter
//! and one publisher. A supervisor thread spawns the pump threads, publishes
//! a snapshot every metric tick, and reacts to pump faults: invoke the error
//! handler, then rebuild the whole data path when auto-restart is enabled,
//! bounded by the restart ceiling.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;

use crate::config::RelayConfig;
use crate::latency::LatencyMeter;
use crate::metrics::{
    Direction, ErrorKind, MetricStream, MetricsPublisher, RelayEvent, RelayStats, Snapshot,
};
use crate::pipeline::{Pipeline, PipelineConfig};
use crate::ring;
use crate::serial::{SerialLink, SerialPortLink};

/// Invoked once per unrecoverable coordinator-level fault.
pub type ErrorHandler = Box<dyn Fn(ErrorKind) + Send + Sync>;

/// Produces a fresh (client, host) link pair for each run cycle.
pub type LinkFactory = Box<dyn FnMut() -> Result<(Box<dyn SerialLink>, Box<dyn SerialLink>)> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Idle,
    Running,
    Faulted,
    Stopped,
}

impl fmt::Display for RelayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayState::Idle => write!(f, "idle"),
            RelayState::Running => write!(f, "running"),
            RelayState::Faulted => write!(f, "faulted"),
            RelayState::Stopped => write!(f, "stopped"),
        }
    }
}

pub struct RelayCoordinator {
    config: RelayConfig,
    stats: Arc<RelayStats>,
    meter: Arc<LatencyMeter>,
    publisher: Arc<MetricsPublisher>,
    shutdown: Arc<AtomicBool>,
    state: Arc<Mutex<RelayState>>,
    error_handler: Arc<Mutex<Option<ErrorHandler>>>,
    link_factory: Arc<Mutex<LinkFactory>>,
    started_at: Arc<Mutex<Option<Instant>>>,
    supervisor: Option<JoinHandle<()>>,
}

impl RelayCoordinator {
    /// Coordinator that opens the configured serial ports at start.
    pub fn new(config: RelayConfig) -> Self {
        let client = config.client_port.clone();
        let host = config.host_port.clone();
        let baud = config.baud_rate;
        let factory: LinkFactory = Box::new(move || {
            let client_link = SerialPortLink::open(&client, baud)
                .map_err(|e| anyhow!("failed to open client port {}: {}", client, e))?;
            let host_link = SerialPortLink::open(&host, baud)
                .map_err(|e| anyhow!("failed to open host port {}: {}", host, e))?;
            Ok((
                Box::new(client_link) as Box<dyn SerialLink>,
                Box::new(host_link) as Box<dyn SerialLink>,
            ))
        });
        Self::with_link_factory(config, factory)
    }

    /// Coordinator over caller-provided transports; used by the loopback
    /// tests and anything embedding the relay behind other byte pipes.
    pub fn with_link_factory(config: RelayConfig, factory: LinkFactory) -> Self {
        let meter = Arc::new(LatencyMeter::new(config.latency_window_size));
        Self {
            config,
            stats: Arc::new(RelayStats::new()),
            meter,
            publisher: Arc::new(MetricsPublisher::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
            state: Arc::new(Mutex::new(RelayState::Idle)),
            error_handler: Arc::new(Mutex::new(None)),
            link_factory: Arc::new(Mutex::new(factory)),
            started_at: Arc::new(Mutex::new(None)),
            supervisor: None,
        }
    }

    /// One-shot convenience over [`Self::with_link_factory`]; restarts will
    /// fault since the links cannot be rebuilt.
    pub fn with_links(
        config: RelayConfig,
        client: Box<dyn SerialLink>,
        host: Box<dyn SerialLink>,
    ) -> Self {
        let mut slot = Some((client, host));
        Self::with_link_factory(
            config,
            Box::new(move || slot.take().context("serial links already consumed")),
        )
    }

    pub fn state(&self) -> RelayState {
        *self.state.lock().unwrap()
    }

    pub fn set_error_handler<F>(&self, handler: F)
    where
        F: Fn(ErrorKind) + Send + Sync + 'static,
    {
        *self.error_handler.lock().unwrap() = Some(Box::new(handler));
    }

    pub fn subscribe(&self) -> MetricStream {
        self.publisher.subscribe()
    }

    /// On-demand snapshot; also what the supervisor publishes each tick.
    pub fn stats(&self) -> Snapshot {
        let started = self.started_at.lock().unwrap().as_ref().copied();
        build_snapshot(&self.stats, &self.meter, started)
    }

    pub fn start(&mut self) -> Result<()> {
        self.config.validate()?;
        {
            let mut state = self.state.lock().unwrap();
            if *state == RelayState::Running {
                bail!("relay already running");
            }
            *state = RelayState::Running;
        }
        self.shutdown.store(false, Ordering::Release);
        *self.started_at.lock().unwrap() = Some(Instant::now());
        log::info!(
            "starting relay: client={} host={} baud={}",
            self.config.client_port,
            self.config.host_port,
            self.config.baud_rate
        );
        let supervisor = Supervisor {
            config: self.config.clone(),
            stats: Arc::clone(&self.stats),
            meter: Arc::clone(&self.meter),
            publisher: Arc::clone(&self.publisher),
            shutdown: Arc::clone(&self.shutdown),
            state: Arc::clone(&self.state),
            error_handler: Arc::clone(&self.error_handler),
            link_factory: Arc::clone(&self.link_factory),
            started_at: Instant::now(),
        };
        self.supervisor = Some(
            thread::Builder::new()
                .name("relay-supervisor".into())
                .spawn(move || supervisor.run())
                .context("failed to spawn supervisor thread")?,
        );
        Ok(())
    }

    /// Signal the pumps, wait for the drain deadline, close the streams.
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.supervisor.take() {
            if handle.join().is_err() {
                log::error!("supervisor thread panicked");
            }
        }
        let mut state = self.state.lock().unwrap();
        if *state != RelayState::Faulted {
            *state = RelayState::Stopped;
        }
    }
}

impl Drop for RelayCoordinator {
    fn drop(&mut self) {
        if self.supervisor.is_some() {
            self.stop();
        }
    }
}

fn build_snapshot(
    stats: &RelayStats,
    meter: &LatencyMeter,
    started: Option<Instant>,
) -> Snapshot {
    let mut errors = stats.errors();
    let orphaned = meter.orphaned();
    if orphaned > 0 {
        errors.insert(ErrorKind::Orphaned, orphaned);
    }
    Snapshot {
        seq: stats.next_seq(),
        timestamp: Utc::now(),
        uptime_ns: started.map(|t| t.elapsed().as_nanos() as u64).unwrap_or(0),
        frames: stats.frames.load(Ordering::Relaxed),
        bytes_rx: stats.bytes_rx.load(Ordering::Relaxed),
        bytes_tx: stats.bytes_tx.load(Ordering::Relaxed),
        errors,
        latency: meter.stats(),
    }
}

enum CycleEnd {
    Shutdown,
    Fault(String),
}

struct Supervisor {
    config: RelayConfig,
    stats: Arc<RelayStats>,
    meter: Arc<LatencyMeter>,
    publisher: Arc<MetricsPublisher>,
    shutdown: Arc<AtomicBool>,
    state: Arc<Mutex<RelayState>>,
    error_handler: Arc<Mutex<Option<ErrorHandler>>>,
    link_factory: Arc<Mutex<LinkFactory>>,
    started_at: Instant,
}

impl Supervisor {
    fn run(self) {
        let mut attempts = 0u32;
        while !self.shutdown.load(Ordering::Acquire) {
            let links = {
                let mut guard = self.link_factory.lock().unwrap();
                let factory: &mut LinkFactory = &mut guard;
                factory()
            };
            let end = match links {
                Ok((client, host)) => self.run_cycle(client, host),
                Err(e) => CycleEnd::Fault(format!("failed to open links: {e}")),
            };
            match end {
                CycleEnd::Shutdown => break,
                CycleEnd::Fault(reason) => {
                    self.fault(&reason);
                    if !self.try_restart(&mut attempts, &reason) {
                        break;
                    }
                }
            }
        }
        self.publisher.publish(RelayEvent::Snapshot(build_snapshot(
            &self.stats,
            &self.meter,
            Some(self.started_at),
        )));
        self.publisher.close();
        log::info!("relay supervisor exited");
    }

    /// Build the data path and babysit it until shutdown or a pump fault.
    fn run_cycle(&self, client: Box<dyn SerialLink>, host: Box<dyn SerialLink>) -> CycleEnd {
        let cycle_stop = Arc::new(AtomicBool::new(false));
        let (c2h_prod, c2h_cons) = ring::ring(self.config.buffer_capacity);
        let (h2c_prod, h2c_cons) = ring::ring(self.config.buffer_capacity);
        let client_pump = Pipeline::new(
            PipelineConfig::new(&self.config, Direction::ClientToHost),
            client,
            c2h_prod,
            h2c_cons,
            Arc::clone(&self.meter),
            Arc::clone(&self.publisher),
            Arc::clone(&self.stats),
            Arc::clone(&cycle_stop),
        );
        let host_pump = Pipeline::new(
            PipelineConfig::new(&self.config, Direction::HostToClient),
            host,
            h2c_prod,
            c2h_cons,
            Arc::clone(&self.meter),
            Arc::clone(&self.publisher),
            Arc::clone(&self.stats),
            Arc::clone(&cycle_stop),
        );
        let client_handle = match spawn_pump("relay-client", client_pump) {
            Ok(h) => h,
            Err(e) => return CycleEnd::Fault(e.to_string()),
        };
        let host_handle = match spawn_pump("relay-host", host_pump) {
            Ok(h) => h,
            Err(e) => {
                cycle_stop.store(true, Ordering::Release);
                let _ = client_handle.join();
                return CycleEnd::Fault(e.to_string());
            }
        };

        let mut outcome = CycleEnd::Shutdown;
        loop {
            thread::sleep(self.config.metric_tick());
            self.publisher.publish(RelayEvent::Snapshot(build_snapshot(
                &self.stats,
                &self.meter,
                Some(self.started_at),
            )));
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }
            if client_handle.is_finished() || host_handle.is_finished() {
                outcome = CycleEnd::Fault(String::new());
                break;
            }
        }

        // Shutdown ordering: signal the pumps, let them drain inside their
        // deadline, then tear the rings down by dropping them.
        cycle_stop.store(true, Ordering::Release);
        let client_result = join_pump(client_handle);
        let host_result = join_pump(host_handle);
        match outcome {
            CycleEnd::Shutdown => CycleEnd::Shutdown,
            CycleEnd::Fault(_) => {
                let reason = [client_result, host_result]
                    .into_iter()
                    .flatten()
                    .collect::<Vec<_>>()
                    .join("; ");
                CycleEnd::Fault(if reason.is_empty() {
                    "pump exited unexpectedly".to_string()
                } else {
                    reason
                })
            }
        }
    }

    fn fault(&self, reason: &str) {
        log::error!("relay faulted: {}", reason);
        *self.state.lock().unwrap() = RelayState::Faulted;
        if let Some(handler) = self.error_handler.lock().unwrap().as_ref() {
            handler(ErrorKind::Fatal);
        }
    }

    fn try_restart(&self, attempts: &mut u32, reason: &str) -> bool {
        if !self.config.auto_restart {
            return false;
        }
        if *attempts >= self.config.restart_ceiling {
            log::error!(
                "restart ceiling of {} reached, giving up",
                self.config.restart_ceiling
            );
            return false;
        }
        *attempts += 1;
        log::warn!(
            "restarting relay (attempt {}/{}): {}",
            attempts,
            self.config.restart_ceiling,
            reason
        );
        self.publisher.publish(RelayEvent::Restarted {
            reason: reason.to_string(),
        });
        *self.state.lock().unwrap() = RelayState::Running;
        true
    }
}

fn spawn_pump(name: &str, pump: Pipeline) -> Result<JoinHandle<Result<()>>> {
    thread::Builder::new()
        .name(name.into())
        .spawn(move || pump.run())
        .with_context(|| format!("failed to spawn {name} thread"))
}

/// Join a pump thread; `Some(reason)` when it failed or panicked.
fn join_pump(handle: JoinHandle<Result<()>>) -> Option<String> {
    match handle.join() {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e.to_string()),
        Err(_) => Some("pump thread panicked".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::{loopback, LinkError};
    use std::io;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    fn test_config() -> RelayConfig {
        let mut config = RelayConfig::default();
        config.client_port = "loop-client".to_string();
        config.host_port = "loop-host".to_string();
        config.metric_tick_ms = 10;
        config.shutdown_timeout_ms = 100;
        config
    }

    /// Claims to be open but every write fails: drives a pump fatal.
    struct BrokenLink;

    impl SerialLink for BrokenLink {
        fn read(&mut self, _buf: &mut [u8], timeout: Duration) -> Result<usize, LinkError> {
            thread::sleep(timeout);
            Err(LinkError::Timeout)
        }

        fn write(&mut self, _buf: &[u8]) -> Result<usize, LinkError> {
            Err(LinkError::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "wire cut",
            )))
        }

        fn is_open(&self) -> bool {
            true
        }

        fn maintain(&mut self) -> bool {
            true
        }

        fn describe(&self) -> String {
            "broken".to_string()
        }
    }

    #[test]
    fn test_start_stop_lifecycle() {
        let (client_relay, _client_device) = loopback();
        let (host_relay, _host_device) = loopback();
        let mut relay = RelayCoordinator::with_links(
            test_config(),
            Box::new(client_relay),
            Box::new(host_relay),
        );
        assert_eq!(relay.state(), RelayState::Idle);
        relay.start().unwrap();
        assert_eq!(relay.state(), RelayState::Running);
        assert!(relay.start().is_err(), "double start must fail");
        relay.stop();
        assert_eq!(relay.state(), RelayState::Stopped);
    }

    #[test]
    fn test_stats_before_start() {
        let (client_relay, _cd) = loopback();
        let (host_relay, _hd) = loopback();
        let relay = RelayCoordinator::with_links(
            test_config(),
            Box::new(client_relay),
            Box::new(host_relay),
        );
        let snapshot = relay.stats();
        assert_eq!(snapshot.uptime_ns, 0);
        assert_eq!(snapshot.frames, 0);
        assert_eq!(snapshot.latency.count, 0);
    }

    #[test]
    fn test_snapshot_seq_is_monotonic() {
        let (client_relay, _cd) = loopback();
        let (host_relay, _hd) = loopback();
        let relay = RelayCoordinator::with_links(
            test_config(),
            Box::new(client_relay),
            Box::new(host_relay),
        );
        let a = relay.stats().seq;
        let b = relay.stats().seq;
        assert!(b > a);
    }

    #[test]
    fn test_pump_fault_invokes_error_handler() {
        let (client_relay, mut client_device) = loopback();
        let mut relay = RelayCoordinator::with_links(
            test_config(),
            Box::new(client_relay),
            Box::new(BrokenLink),
        );
        let calls = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&calls);
        relay.set_error_handler(move |kind| {
            assert_eq!(kind, ErrorKind::Fatal);
            seen.fetch_add(1, Ordering::Relaxed);
        });
        relay.start().unwrap();
        // A deterministic case 4 command reaches the broken host port.
        client_device
            .write(&[0x00, 0xA4, 0x04, 0x00, 0x02, 0x3F, 0x00, 0x00])
            .unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while relay.state() != RelayState::Faulted && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(relay.state(), RelayState::Faulted);
        assert_eq!(calls.load(Ordering::Relaxed), 1);
        relay.stop();
        assert_eq!(relay.state(), RelayState::Faulted);
    }

    #[test]
    fn test_auto_restart_bounded_by_ceiling() {
        let mut config = test_config();
        config.auto_restart = true;
        config.restart_ceiling = 2;
        let built = Arc::new(AtomicU32::new(0));
        let count = Arc::clone(&built);
        let devices: Arc<Mutex<Vec<crate::serial::LoopbackLink>>> =
            Arc::new(Mutex::new(Vec::new()));
        let device_store = Arc::clone(&devices);
        let factory: LinkFactory = Box::new(move || {
            count.fetch_add(1, Ordering::Relaxed);
            let (client_relay, client_device) = loopback();
            device_store.lock().unwrap().push(client_device);
            let client: Box<dyn SerialLink> = Box::new(client_relay);
            let host: Box<dyn SerialLink> = Box::new(BrokenLink);
            Ok((client, host))
        });
        let mut relay = RelayCoordinator::with_link_factory(config, factory);
        let stream = relay.subscribe();
        relay.start().unwrap();
        // Trip the fault in every cycle until the ceiling holds for good.
        let command = [0x00u8, 0xA4, 0x04, 0x00, 0x02, 0x3F, 0x00, 0x00];
        let deadline = Instant::now() + Duration::from_secs(5);
        while !(built.load(Ordering::Relaxed) >= 3 && relay.state() == RelayState::Faulted)
            && Instant::now() < deadline
        {
            for device in devices.lock().unwrap().iter_mut() {
                let _ = device.write(&command);
            }
            thread::sleep(Duration::from_millis(10));
        }
        relay.stop();
        // Initial cycle plus two restarts, then the ceiling holds.
        assert_eq!(built.load(Ordering::Relaxed), 3);
        let restarts = stream
            .filter(|e| matches!(e, RelayEvent::Restarted { .. }))
            .count();
        assert_eq!(restarts, 2);
        assert_eq!(relay.state(), RelayState::Faulted);
    }
}
