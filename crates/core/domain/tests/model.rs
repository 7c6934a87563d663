use domain::{
    ConnectionStatus, DataQuality, DataType, DataValue, DriverStatistics, ProtocolType,
    UnifiedDataPoint, UnifiedDeviceInfo,
};

#[test]
fn device_info_defaults_from_json() {
    let json = r#"{"id": "dev-1", "protocol": "MODBUS_TCP", "endpoint": "10.0.0.5:502"}"#;
    let device: UnifiedDeviceInfo = serde_json::from_str(json).expect("device");

    assert_eq!(device.protocol, ProtocolType::ModbusTcp);
    assert_eq!(device.poll_interval_ms, 1000);
    assert_eq!(device.modbus_config.slave_id, 1);
    assert_eq!(device.modbus_config.byte_timeout_ms, 500);
    assert_eq!(device.bacnet_config.local_port, 47808);
    assert_eq!(device.bacnet_config.device_id, 260001);
    assert_eq!(device.reconnect.max_attempts, 3);
    assert_eq!(device.status, ConnectionStatus::Disconnected);
}

#[test]
fn point_from_json_uses_address_defaults() {
    let json = r#"{
        "id": "p1",
        "data_type": "int16",
        "modbus_address": {"register_address": 40}
    }"#;
    let point: UnifiedDataPoint = serde_json::from_str(json).expect("point");
    let address = point.modbus_address.expect("modbus address");

    assert_eq!(address.function_code, 3);
    assert_eq!(address.count, 1);
    assert_eq!(point.scale_factor, 1.0);
    assert_eq!(point.quality, DataQuality::Uncertain);
}

#[test]
fn scaling_round_trips_through_raw_value() {
    let point = UnifiedDataPoint::new("p1", "dev-1", "temp", DataType::Int16).with_scaling(0.1, -40.0);

    let engineering = point.engineering_value(DataValue::Int32(650));
    let DataValue::Double(value) = engineering else {
        panic!("expected double, got {:?}", engineering);
    };
    assert!((value - 25.0).abs() < 1e-9);

    let raw = point.raw_value(&DataValue::Double(25.0)).expect("raw");
    assert!((raw - 650.0).abs() < 1e-9);
}

#[test]
fn zero_scale_cannot_be_reversed() {
    let point = UnifiedDataPoint::new("p1", "dev-1", "x", DataType::Float32).with_scaling(0.0, 1.0);
    assert!(point.raw_value(&DataValue::Double(3.0)).is_none());
    assert!(point.raw_value(&DataValue::String("3".into())).is_none());
}

#[test]
fn statistics_success_rate() {
    let stats = DriverStatistics::new();
    assert_eq!(stats.success_rate(), 0.0);

    stats.record_read(true);
    stats.record_read(false);
    stats.record_write(true);
    stats.record_write(true);

    let snapshot = stats.snapshot();
    assert_eq!(snapshot.total_reads, 2);
    assert_eq!(snapshot.total_reads, snapshot.successful_reads + snapshot.failed_reads);
    assert_eq!(snapshot.total_writes, 2);
    assert_eq!(snapshot.success_rate(), 75.0);
    assert!(snapshot.last_activity > 0);

    stats.reset();
    assert_eq!(stats.snapshot().total_reads, 0);
}

#[test]
fn connection_status_round_trips_through_u8() {
    for status in [
        ConnectionStatus::Disconnected,
        ConnectionStatus::Connecting,
        ConnectionStatus::Connected,
        ConnectionStatus::Reconnecting,
        ConnectionStatus::Error,
    ] {
        assert_eq!(ConnectionStatus::from_u8(status.as_u8()), status);
    }
    assert_eq!(ConnectionStatus::Reconnecting.to_string(), "RECONNECTING");
}
