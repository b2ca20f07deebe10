//! Transparent APDU relay between a contactless NFC reader and a card
//! emulator, bridged over two serial links with nanosecond round-trip
//! latency measurement.
//!
//! The relay never interprets or rewrites APDUs; bytes flow through
//! verbatim while a typed metric stream reports frame counts, error
//! counters and windowed latency statistics.

pub mod apdu;
pub mod config;
pub mod coordinator;
pub mod latency;
pub mod metrics;
pub mod pipeline;
pub mod ring;
pub mod serial;

pub use config::RelayConfig;
pub use coordinator::{RelayCoordinator, RelayState};
pub use latency::{LatencySample, LatencyStats};
pub use metrics::{Direction, ErrorKind, MetricStream, RelayEvent, Snapshot};
