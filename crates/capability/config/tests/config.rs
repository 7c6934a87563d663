use collector_config::{CollectorConfig, ConfigError};
use domain::{ProtocolType, UnifiedDeviceInfo};

#[test]
fn load_config_from_env() {
    // Rust 2024 中 set_var 需要显式标注 unsafe（测试进程内可控）。
    unsafe {
        std::env::set_var("COLLECTOR_DEVICES_FILE", "/etc/collector/devices.json");
        std::env::set_var("COLLECTOR_SIMULATION", "on");
        std::env::set_var("COLLECTOR_POLL_INTERVAL_MS", "250");
        std::env::set_var("COLLECTOR_MAX_RECONNECT_ATTEMPTS", "5");
        std::env::set_var("COLLECTOR_AUTO_RECONNECT", "false");
        std::env::set_var("COLLECTOR_BACNET_LOCAL_PORT", "47809");
    }

    let config = CollectorConfig::from_env().expect("config");
    assert_eq!(config.devices_file, "/etc/collector/devices.json");
    assert!(config.simulation);
    assert_eq!(config.stats_interval_secs, 60);
    assert_eq!(config.overrides.poll_interval_ms, Some(250));
    assert_eq!(config.overrides.timeout_ms, None);

    let mut device = UnifiedDeviceInfo::new("dev-1", "boiler", ProtocolType::BacnetIp, "10.0.0.9");
    config.overrides.apply(&mut device);
    assert_eq!(device.poll_interval_ms, 250);
    assert_eq!(device.timeout_ms, 1000);
    assert_eq!(device.reconnect.max_attempts, 5);
    assert!(!device.reconnect.auto_reconnect);
    assert_eq!(device.bacnet_config.local_port, 47809);

    // 0 间隔非法
    unsafe {
        std::env::set_var("COLLECTOR_POLL_INTERVAL_MS", "0");
    }
    let err = CollectorConfig::from_env().expect_err("zero interval");
    assert!(matches!(err, ConfigError::Invalid(key, _) if key == "COLLECTOR_POLL_INTERVAL_MS"));

    unsafe {
        std::env::set_var("COLLECTOR_POLL_INTERVAL_MS", "fast");
    }
    assert!(CollectorConfig::from_env().is_err());
}
