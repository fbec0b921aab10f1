use std::env;
use std::path::PathBuf;
use std::sync::Mutex;

use control_app::config::parse_batteries;
use control_app::ControlConfig;
use modbus_client::TransportKind;
use types::DeviceIdentity;

static ENV_LOCK: Mutex<()> = Mutex::new(());

#[test]
fn toml_config_validates() {
    let _guard = ENV_LOCK.lock().expect("env lock");
    env::set_var("SOLPLANET_CONFIG", fixture_path("config-valid.toml"));

    let config = ControlConfig::load().expect("load config");
    config.validate().expect("validate config");
    assert_eq!(config.modbus.host, "192.168.1.50");
    assert_eq!(config.modbus.transport, TransportKind::RtuOverTcp);
    assert_eq!(config.modbus.retry_count, 3);
    assert_eq!(config.batteries.len(), 2);
    assert_eq!(
        config.battery("SP00067890").map(|battery| battery.device_address),
        Some(4)
    );
    assert_eq!(config.journal_keep, 500);

    env::remove_var("SOLPLANET_CONFIG");
}

#[test]
fn json_config_validates() {
    let _guard = ENV_LOCK.lock().expect("env lock");
    env::set_var("SOLPLANET_CONFIG", fixture_path("config-valid.json"));

    let config = ControlConfig::load().expect("load config");
    config.validate().expect("validate config");
    assert_eq!(config.modbus.port, 1502);
    assert_eq!(config.modbus.max_batch_size, Some(60));
    assert_eq!(config.schedule_base_register, 42_001);
    assert_eq!(config.http_bind, "127.0.0.1:9090");
    // Unset journal fields keep their defaults.
    assert_eq!(config.journal_path, "solplanet-journal.sqlite");

    env::remove_var("SOLPLANET_CONFIG");
}

#[test]
fn invalid_config_fails_validation() {
    let _guard = ENV_LOCK.lock().expect("env lock");
    env::set_var("SOLPLANET_CONFIG", fixture_path("config-invalid.toml"));

    let config = ControlConfig::load().expect("load config");
    assert!(config.validate().is_err());

    env::remove_var("SOLPLANET_CONFIG");
}

#[test]
fn explicit_path_wins_over_env() {
    let _guard = ENV_LOCK.lock().expect("env lock");
    env::set_var("SOLPLANET_CONFIG", fixture_path("config-invalid.toml"));

    let config = ControlConfig::load_with_path(Some(fixture_path("config-valid.json")))
        .expect("load config");
    config.validate().expect("validate config");

    env::remove_var("SOLPLANET_CONFIG");
}

#[test]
fn env_overrides_apply_after_file() {
    let _guard = ENV_LOCK.lock().expect("env lock");
    env::set_var("SOLPLANET_CONFIG", fixture_path("config-valid.toml"));
    env::set_var("SOLPLANET_HOST", "10.1.2.3");
    env::set_var("SOLPLANET_TRANSPORT", "tcp");
    env::set_var("SOLPLANET_BATTERIES", "AAA:7, BBB");
    env::set_var("SOLPLANET_SCHEDULE_BASE", "42101");

    let config = ControlConfig::load().expect("load config");

    for key in [
        "SOLPLANET_CONFIG",
        "SOLPLANET_HOST",
        "SOLPLANET_TRANSPORT",
        "SOLPLANET_BATTERIES",
        "SOLPLANET_SCHEDULE_BASE",
    ] {
        env::remove_var(key);
    }

    config.validate().expect("validate config");
    assert_eq!(config.modbus.host, "10.1.2.3");
    assert_eq!(config.modbus.transport, TransportKind::Tcp);
    assert_eq!(config.schedule_base_register, 42_101);
    assert_eq!(
        config.batteries,
        vec![
            DeviceIdentity {
                isn: "AAA".to_string(),
                device_address: 7,
            },
            DeviceIdentity {
                isn: "BBB".to_string(),
                device_address: 1,
            },
        ]
    );
}

#[test]
fn unknown_transport_is_an_error() {
    let _guard = ENV_LOCK.lock().expect("env lock");
    env::set_var("SOLPLANET_TRANSPORT", "carrier-pigeon");

    let result = ControlConfig::load_with_path(None);

    env::remove_var("SOLPLANET_TRANSPORT");
    assert!(result.is_err());
}

#[test]
fn duplicate_batteries_fail_validation() {
    let mut config = ControlConfig::default();
    config.batteries = parse_batteries("SP1:1,SP1:2").expect("parse");
    assert!(config.validate().is_err());

    config.batteries = parse_batteries("SP1:1,SP2:2").expect("parse");
    config.validate().expect("validate config");

    assert!(parse_batteries("SP1:300").is_err());
}

#[test]
fn schedule_block_must_be_a_holding_address() {
    let mut config = ControlConfig::default();
    config.schedule_base_register = 30_001;
    assert!(config.validate().is_err());

    config.schedule_base_register = 40_001;
    config.validate().expect("validate config");
}

fn fixture_path(name: &str) -> String {
    let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    path.push("tests");
    path.push("fixtures");
    path.push(name);
    path.to_string_lossy().to_string()
}
