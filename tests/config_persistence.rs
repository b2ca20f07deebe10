/// JSON persistence round trip for the relay configuration, against a
/// scratch home directory so the real `~/.nfc_relay` is never touched.
use std::fs;

use nfc_relay::RelayConfig;
use tempfile::TempDir;

#[test]
fn test_config_round_trip_through_home_dir() {
    let home = TempDir::new().unwrap();
    std::env::set_var("HOME", home.path());

    // First load writes the defaults to disk.
    let config = RelayConfig::load().unwrap();
    let config_path = home.path().join(".nfc_relay").join("config.json");
    assert!(config_path.exists(), "default config persisted on first load");
    assert_eq!(config.baud_rate, 921_600);
    assert!(config.client_port.is_empty());

    let mut updated = config.clone();
    updated.client_port = "/dev/ttyACM0".to_string();
    updated.host_port = "/dev/ttyACM1".to_string();
    updated.verify_checksum = true;
    updated.save().unwrap();

    let reloaded = RelayConfig::load().unwrap();
    assert_eq!(reloaded.client_port, "/dev/ttyACM0");
    assert_eq!(reloaded.host_port, "/dev/ttyACM1");
    assert!(reloaded.verify_checksum);
    assert_eq!(reloaded.baud_rate, config.baud_rate);

    // The on-disk form is pretty-printed JSON a human can edit.
    let raw = fs::read_to_string(&config_path).unwrap();
    assert!(raw.contains("\"client_port\": \"/dev/ttyACM0\""));
}
