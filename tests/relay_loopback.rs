/// End-to-end relay scenarios over an in-memory loopback pair: a fake reader
/// on the client side, a fake card emulator on the host side, the real
/// coordinator and pumps in between.
use std::time::{Duration, Instant};

use nfc_relay::serial::{loopback, LoopbackLink, SerialLink};
use nfc_relay::{ErrorKind, RelayConfig, RelayCoordinator, RelayEvent};

const SELECT_AID: [u8; 13] = [
    0x00, 0xA4, 0x04, 0x00, 0x07, 0xA0, 0x00, 0x00, 0x00, 0x04, 0x10, 0x10, 0x00,
];
const SW_NOT_FOUND: [u8; 2] = [0x6A, 0x82];

fn test_config() -> RelayConfig {
    let mut config = RelayConfig::default();
    config.client_port = "loop-client".to_string();
    config.host_port = "loop-host".to_string();
    config.metric_tick_ms = 20;
    config.shutdown_timeout_ms = 200;
    config
}

struct Rig {
    relay: RelayCoordinator,
    /// The fake reader's end of the client link.
    client: LoopbackLink,
    /// The fake card emulator's end of the host link.
    host: LoopbackLink,
}

fn start_rig(config: RelayConfig) -> Rig {
    let (client_relay, client_device) = loopback();
    let (host_relay, host_device) = loopback();
    let mut relay =
        RelayCoordinator::with_links(config, Box::new(client_relay), Box::new(host_relay));
    relay.start().expect("relay failed to start");
    Rig {
        relay,
        client: client_device,
        host: host_device,
    }
}

fn read_exact(link: &mut LoopbackLink, n: usize, deadline: Duration) -> Vec<u8> {
    let end = Instant::now() + deadline;
    let mut out = Vec::with_capacity(n);
    let mut buf = [0u8; 512];
    while out.len() < n {
        assert!(
            Instant::now() < end,
            "timed out after {} of {} bytes",
            out.len(),
            n
        );
        let want = (n - out.len()).min(buf.len());
        match link.read(&mut buf[..want], Duration::from_millis(5)) {
            Ok(got) => out.extend_from_slice(&buf[..got]),
            Err(_) => {}
        }
    }
    out
}

fn wait_for<F: FnMut() -> bool>(mut pred: F, deadline: Duration) -> bool {
    let end = Instant::now() + deadline;
    while Instant::now() < end {
        if pred() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    pred()
}

#[test]
fn test_select_aid_exchange() {
    let mut rig = start_rig(test_config());

    rig.client.write(&SELECT_AID).unwrap();
    let relayed = read_exact(&mut rig.host, SELECT_AID.len(), Duration::from_secs(1));
    assert_eq!(relayed, SELECT_AID, "host port sees the command verbatim");

    rig.host.write(&SW_NOT_FOUND).unwrap();
    let response = read_exact(&mut rig.client, SW_NOT_FOUND.len(), Duration::from_secs(1));
    assert_eq!(response, SW_NOT_FOUND);

    assert!(wait_for(
        || rig.relay.stats().latency.count == 1,
        Duration::from_secs(1)
    ));
    let snapshot = rig.relay.stats();
    assert_eq!(snapshot.frames, 1);
    assert_eq!(snapshot.bytes_rx, 15);
    assert_eq!(snapshot.bytes_tx, 15);
    assert!(!snapshot.errors.contains_key(&ErrorKind::Malformed));
    assert!(snapshot.latency.min_ns > 0);

    rig.relay.stop();
}

#[test]
fn test_malformed_noise_is_drained() {
    let mut rig = start_rig(test_config());

    rig.client.write(&[0xFF, 0xFF]).unwrap();
    assert!(wait_for(
        || rig.relay.stats().errors.get(&ErrorKind::Malformed) == Some(&1),
        Duration::from_secs(1)
    ));

    rig.client.write(&[0x00, 0xA4, 0x04, 0x00]).unwrap();
    let relayed = read_exact(&mut rig.host, 4, Duration::from_secs(1));
    assert_eq!(relayed, [0x00, 0xA4, 0x04, 0x00], "case 1 frame intact");

    let snapshot = rig.relay.stats();
    assert_eq!(snapshot.errors.get(&ErrorKind::Malformed), Some(&1));
    assert_eq!(snapshot.frames, 1);

    rig.relay.stop();
}

#[test]
fn test_backpressure_forwards_everything_in_order() {
    let mut config = test_config();
    config.buffer_capacity = 64;
    let mut rig = start_rig(config);

    // Case 2 command asking for 126 bytes, so the 128-byte response is
    // framed by Le without any idle wait.
    rig.client.write(&[0x00, 0xB0, 0x00, 0x00, 0x7E]).unwrap();
    let relayed = read_exact(&mut rig.host, 5, Duration::from_secs(1));
    assert_eq!(relayed, [0x00, 0xB0, 0x00, 0x00, 0x7E]);

    let response: Vec<u8> = (0..126u8).chain([0x90, 0x00]).collect();
    assert_eq!(response.len(), 128);
    rig.host.write(&response).unwrap();
    let forwarded = read_exact(&mut rig.client, 128, Duration::from_secs(2));
    assert_eq!(forwarded, response, "all 128 bytes, in order");

    let snapshot = rig.relay.stats();
    assert_eq!(
        snapshot.errors.get(&ErrorKind::BufferFull),
        Some(&1),
        "one blocked episode on the 64-byte delivery ring"
    );
    assert_eq!(snapshot.latency.count, 1);

    rig.relay.stop();
}

#[test]
fn test_high_latency_event_on_slow_response() {
    let rig_config = test_config();
    let threshold = rig_config.latency_threshold_ns;
    let mut rig = start_rig(rig_config);
    let stream = rig.relay.subscribe();

    rig.client.write(&SELECT_AID).unwrap();
    let _ = read_exact(&mut rig.host, SELECT_AID.len(), Duration::from_secs(1));
    // Simulated slow card: well past the 5 ms threshold.
    std::thread::sleep(Duration::from_millis(10));
    rig.host.write(&SW_NOT_FOUND).unwrap();
    let _ = read_exact(&mut rig.client, 2, Duration::from_secs(1));

    let deadline = Instant::now() + Duration::from_secs(2);
    let mut high_latency_ns = None;
    while Instant::now() < deadline && high_latency_ns.is_none() {
        match stream.recv_timeout(Duration::from_millis(50)) {
            Some(RelayEvent::HighLatency { sample_ns, .. }) => high_latency_ns = Some(sample_ns),
            Some(_) => {}
            None => {}
        }
    }
    let sample_ns = high_latency_ns.expect("no high-latency event seen");
    assert!(sample_ns >= 10_000_000, "sample {} ns", sample_ns);
    assert!(sample_ns >= threshold);

    let snapshot = rig.relay.stats();
    assert!(snapshot.latency.max_ns >= 10_000_000);
    assert!(snapshot.latency.p95_ns >= 10_000_000, "outlier dominates p95");

    rig.relay.stop();
}

#[test]
fn test_thousand_exchange_benchmark() {
    let mut config = test_config();
    config.inter_byte_idle_ms = 1;
    config.metric_tick_ms = 50;
    let mut rig = start_rig(config);

    // SELECT with Le = 2: the 4-byte response is framed by length alone,
    // keeping the loop free of idle-window waits.
    let command: Vec<u8> = {
        let mut c = SELECT_AID.to_vec();
        *c.last_mut().unwrap() = 0x02;
        c
    };
    let response = [0xCA, 0xFE, 0x90, 0x00];

    let total = 1000;
    for _ in 0..total {
        rig.client.write(&command).unwrap();
        let relayed = read_exact(&mut rig.host, command.len(), Duration::from_secs(1));
        assert_eq!(relayed, command);
        rig.host.write(&response).unwrap();
        let back = read_exact(&mut rig.client, response.len(), Duration::from_secs(1));
        assert_eq!(back, response);
    }

    assert!(wait_for(
        || rig.relay.stats().frames == total,
        Duration::from_secs(1)
    ));
    let snapshot = rig.relay.stats();
    assert_eq!(snapshot.frames, total);
    assert!(!snapshot.errors.contains_key(&ErrorKind::Malformed));
    assert_eq!(
        snapshot.latency.count, 100,
        "window holds the most recent 100 samples"
    );
    assert!(
        snapshot.latency.p50_ns <= 5_000_000,
        "median {} ns breaches the 5 ms contract",
        snapshot.latency.p50_ns
    );

    rig.relay.stop();
}

#[test]
fn test_metric_stream_snapshots_are_ordered() {
    let mut rig = start_rig(test_config());
    let stream = rig.relay.subscribe();

    rig.client.write(&SELECT_AID).unwrap();
    let _ = read_exact(&mut rig.host, SELECT_AID.len(), Duration::from_secs(1));
    rig.host.write(&SW_NOT_FOUND).unwrap();
    let _ = read_exact(&mut rig.client, 2, Duration::from_secs(1));

    let mut seqs = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(2);
    while seqs.len() < 4 && Instant::now() < deadline {
        if let Some(RelayEvent::Snapshot(s)) = stream.recv_timeout(Duration::from_millis(100)) {
            seqs.push(s.seq);
        }
    }
    assert!(seqs.len() >= 2, "expected periodic snapshots");
    assert!(
        seqs.windows(2).all(|w| w[0] < w[1]),
        "sequence numbers must be monotonic: {seqs:?}"
    );

    rig.relay.stop();
    // After stop the stream terminates once drained.
    let drained: Vec<_> = stream.collect();
    assert!(drained
        .iter()
        .all(|e| !matches!(e, RelayEvent::Restarted { .. })));
}

#[test]
fn test_stop_is_idempotent_and_final() {
    let mut rig = start_rig(test_config());
    rig.client.write(&SELECT_AID).unwrap();
    let _ = read_exact(&mut rig.host, SELECT_AID.len(), Duration::from_secs(1));
    rig.relay.stop();
    let frames = rig.relay.stats().frames;
    rig.relay.stop();
    assert_eq!(rig.relay.stats().frames, frames);
}
