use collector_protocol::{
    ModbusDriver, ModbusError, ModbusProtocol, PacketDirection, SimulatedDevice,
};
use domain::{
    ConnectionStatus, DataQuality, DataType, DataValue, ProtocolType, ReconnectPolicy,
    UnifiedDataPoint, UnifiedDeviceInfo,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

fn device() -> UnifiedDeviceInfo {
    let mut device =
        UnifiedDeviceInfo::new("meter-1", "meter", ProtocolType::ModbusTcp, "127.0.0.1:5020");
    device.reconnect = ReconnectPolicy {
        auto_reconnect: true,
        max_attempts: 3,
        delay_ms: 10,
    };
    device
}

fn points() -> Vec<UnifiedDataPoint> {
    vec![
        UnifiedDataPoint::new("hr100", "meter-1", "holding", DataType::Uint16).with_modbus(3, 100),
        UnifiedDataPoint::new("ir5", "meter-1", "input", DataType::Uint16).with_modbus(4, 5),
        UnifiedDataPoint::new("scaled", "meter-1", "scaled", DataType::Int16)
            .with_modbus(3, 20)
            .with_scaling(0.1, 0.0),
        UnifiedDataPoint::new("di0", "meter-1", "input bit", DataType::Bool).with_modbus(2, 0),
    ]
}

fn wait_until<F: Fn() -> bool>(timeout: Duration, check: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    check()
}

fn driver(simulator: &Arc<SimulatedDevice>) -> ModbusDriver {
    let driver = ModbusDriver::new(ModbusProtocol::simulated(Arc::clone(simulator)));
    driver
        .initialize(device(), points())
        .expect("initialize simulated driver");
    driver
}

#[test]
fn written_register_reads_back() {
    let simulator = SimulatedDevice::new();
    let driver = driver(&simulator);
    let modbus = driver.protocol();

    modbus
        .write_holding_register(1, 10, 1234)
        .expect("write register");
    assert_eq!(
        modbus.read_holding_registers(1, 10, 1).expect("read back"),
        vec![1234]
    );
    assert_eq!(simulator.holding_register(1, 10), 1234);
    assert_eq!(driver.connection_status(), ConnectionStatus::Connected);
}

#[test]
fn unwritten_addresses_follow_simulation_pattern() {
    let simulator = SimulatedDevice::new();
    let driver = driver(&simulator);
    let modbus = driver.protocol();

    assert_eq!(
        modbus.read_holding_registers(1, 100, 3).expect("holding"),
        vec![100, 101, 102]
    );
    assert_eq!(
        modbus.read_input_registers(1, 7, 2).expect("input"),
        vec![1007, 1008]
    );
    assert_eq!(
        modbus.read_discrete_inputs(1, 0, 4).expect("discrete"),
        vec![false, true, false, true]
    );
    assert_eq!(
        modbus.read_coils(1, 4, 2).expect("coils"),
        vec![false, true]
    );
}

#[test]
fn read_cycle_decodes_and_scales_points() {
    let simulator = SimulatedDevice::new();
    let driver = driver(&simulator);

    let snapshot = driver.read_once().expect("read cycle");
    assert_eq!(snapshot.len(), 4);
    assert!(snapshot.iter().all(|point| point.quality == DataQuality::Good));
    assert_eq!(snapshot[0].current_value, DataValue::UInt32(100));
    assert_eq!(snapshot[1].current_value, DataValue::UInt32(1005));
    match snapshot[2].current_value {
        DataValue::Double(value) => assert!((value - 2.0).abs() < 1e-9),
        ref other => panic!("unexpected scaled value {:?}", other),
    }
    assert_eq!(snapshot[3].current_value, DataValue::Bool(false));

    let stats = driver.statistics();
    assert_eq!(stats.total_reads, 1);
    assert_eq!(stats.successful_reads, 1);
}

#[test]
fn point_write_reverses_scaling() {
    let simulator = SimulatedDevice::new();
    let driver = driver(&simulator);

    driver
        .write_value("scaled", DataValue::Double(12.3))
        .expect("scaled write");
    assert_eq!(simulator.holding_register(1, 20), 123);

    let err = driver
        .write_value("ir5", DataValue::UInt32(1))
        .expect_err("input registers are read-only");
    assert!(err.to_string().contains("read-only"));
}

#[test]
fn exception_is_counted_without_breaking_session() {
    let simulator = SimulatedDevice::new();
    let driver = driver(&simulator);
    let modbus = driver.protocol();
    modbus.read_holding_registers(1, 0, 1).expect("first read");

    simulator.inject_exception(2, 1);
    let err = modbus
        .read_holding_registers(1, 0, 1)
        .expect_err("exception expected");
    assert!(matches!(err, ModbusError::Exception { code: 2, .. }));
    assert_eq!(modbus.exception_codes().get(&2), Some(&1));
    assert_eq!(driver.connection_status(), ConnectionStatus::Connected);

    modbus.read_holding_registers(1, 0, 1).expect("session still usable");
    assert_eq!(simulator.connect_count(), 1);
}

#[test]
fn reconnect_budget_exhaustion_ends_in_error() {
    let simulator = SimulatedDevice::new();
    let driver = driver(&simulator);
    let modbus = driver.protocol();
    modbus.read_holding_registers(1, 0, 1).expect("lazy connect");
    assert_eq!(simulator.connect_count(), 1);

    simulator.inject_timeouts(10);
    let err = modbus
        .read_holding_registers(1, 0, 1)
        .expect_err("timeout expected");
    assert!(err.is_timeout());
    assert_eq!(driver.connection_status(), ConnectionStatus::Error);
    assert_eq!(simulator.connect_count(), 4);

    let err = modbus
        .read_holding_registers(1, 0, 1)
        .expect_err("error state fails fast");
    assert!(matches!(err, ModbusError::NotConnected(_)));
    assert_eq!(simulator.connect_count(), 4);
    assert!(modbus.modbus_statistics().timeouts >= 1);
}

#[test]
fn reconnect_recovers_after_transient_timeout() {
    let simulator = SimulatedDevice::new();
    let driver = driver(&simulator);
    let modbus = driver.protocol();
    modbus.read_holding_registers(1, 0, 1).expect("lazy connect");

    simulator.inject_timeouts(1);
    assert!(modbus.read_holding_registers(1, 0, 1).is_err());
    assert_eq!(driver.connection_status(), ConnectionStatus::Connected);
    assert_eq!(simulator.connect_count(), 2);
    assert_eq!(
        modbus.read_holding_registers(1, 0, 1).expect("after reconnect"),
        vec![0]
    );
}

#[test]
fn diagnostics_report_target_and_counters() {
    let simulator = SimulatedDevice::new();
    let driver = driver(&simulator);
    driver.read_once().expect("read cycle");

    let diagnostics = driver.protocol().detailed_diagnostics();
    assert!(diagnostics.contains("127.0.0.1:5020"));
    assert!(diagnostics.contains("Register reads:"));

    let json: serde_json::Value =
        serde_json::from_str(&driver.protocol().modbus_statistics_json()).expect("json stats");
    assert_eq!(json["connection_state"], "CONNECTED");
    assert!(driver.protocol().test_connection());
}

#[test]
fn worker_polls_simulator_until_stopped() {
    let simulator = SimulatedDevice::new();
    let driver = ModbusDriver::new(ModbusProtocol::simulated(Arc::clone(&simulator)));
    let mut config = device();
    config.poll_interval_ms = 20;
    driver.initialize(config, points()).expect("initialize");

    let snapshots = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&snapshots);
    driver.set_data_callback(move |device, points| {
        assert_eq!(device.id, "meter-1");
        assert_eq!(points.len(), 4);
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let statuses = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&statuses);
    driver.set_status_callback(move |_, status, _| sink.lock().push(status));

    driver.start().expect("start");
    assert!(wait_until(Duration::from_secs(2), || {
        driver.connection_status() == ConnectionStatus::Connected
            && snapshots.load(Ordering::SeqCst) >= 2
    }));

    driver.stop();
    let after_first = statuses.lock().len();
    driver.stop();

    assert!(!driver.is_running());
    assert_eq!(driver.connection_status(), ConnectionStatus::Disconnected);
    assert_eq!(statuses.lock().len(), after_first);
    assert_eq!(statuses.lock().last(), Some(&ConnectionStatus::Disconnected));
    assert_eq!(simulator.connect_count(), 1);
    let stats = driver.statistics();
    assert_eq!(stats.total_reads, stats.successful_reads + stats.failed_reads);
    assert!(stats.successful_reads >= 2);
}

#[test]
fn failed_point_keeps_last_value_while_others_stay_good() {
    let simulator = SimulatedDevice::new();
    let driver = driver(&simulator);
    driver.read_once().expect("first cycle");

    // 下一次请求即第一个点位 hr100
    simulator.inject_exception(2, 1);
    let snapshot = driver.read_once().expect("second cycle");

    assert_eq!(snapshot.len(), 4);
    assert_eq!(snapshot[0].id, "hr100");
    assert_eq!(snapshot[0].quality, DataQuality::Bad);
    assert_eq!(snapshot[0].current_value, DataValue::UInt32(100));
    assert!(snapshot[1..].iter().all(|point| point.quality == DataQuality::Good));
    assert_eq!(driver.protocol().exception_codes().get(&2), Some(&1));
    assert_eq!(driver.data_points()[0].quality, DataQuality::Bad);
    assert_eq!(driver.connection_status(), ConnectionStatus::Connected);

    let stats = driver.statistics();
    assert_eq!(stats.successful_reads, 2);
    assert_eq!(stats.failed_reads, 0);
}

#[test]
fn bulk_read_splits_into_request_sized_chunks() {
    let simulator = SimulatedDevice::new();
    let driver = driver(&simulator);
    let modbus = driver.protocol();
    modbus.read_holding_registers(1, 0, 1).expect("lazy connect");
    let before = simulator.request_count();

    let values = modbus
        .read_holding_registers_bulk(1, 1000, 300, 1)
        .expect("bulk read");

    assert_eq!(values.len(), 300);
    assert_eq!(values[0], 1000);
    assert_eq!(values[299], 1299);
    // 125 + 125 + 50
    assert_eq!(simulator.request_count() - before, 3);

    let err = modbus
        .read_holding_registers_bulk(1, 65_500, 100, 1)
        .expect_err("range past the address space");
    assert!(matches!(err, ModbusError::Conversion(_)));
}

#[test]
fn bulk_read_retries_a_failed_chunk() {
    let simulator = SimulatedDevice::new();
    let driver = driver(&simulator);
    let modbus = driver.protocol();

    simulator.inject_exception(6, 1);
    let values = modbus
        .read_holding_registers_bulk(1, 0, 10, 3)
        .expect("second attempt succeeds");
    assert_eq!(values, (0..10).collect::<Vec<u16>>());
    assert_eq!(modbus.exception_codes().get(&6), Some(&1));

    simulator.inject_exception(6, 5);
    let err = modbus
        .read_holding_registers_bulk(1, 0, 10, 2)
        .expect_err("attempts exhausted");
    assert!(matches!(err, ModbusError::Exception { code: 6, .. }));
    assert_eq!(modbus.exception_codes().get(&6), Some(&3));
}

#[test]
fn diagnostics_record_slaves_and_packets_when_enabled() {
    let simulator = SimulatedDevice::new();
    let driver = driver(&simulator);
    let modbus = driver.protocol();

    modbus.read_holding_registers(1, 0, 2).expect("read while disabled");
    assert!(!modbus.is_diagnostics_enabled());
    assert!(modbus.modbus_statistics().slaves.is_empty());
    assert!(modbus.packet_log().is_empty());

    modbus.enable_diagnostics(true);
    modbus.read_holding_registers(1, 0, 2).expect("read");
    modbus.read_input_registers(7, 3, 1).expect("other slave");
    simulator.inject_exception(2, 1);
    assert!(modbus.read_coils(1, 0, 1).is_err());

    let stats = modbus.modbus_statistics();
    assert_eq!(stats.slaves[&1].requests, 2);
    assert_eq!(stats.slaves[&1].failures, 1);
    assert_eq!(stats.slaves[&7].successes, 1);

    let packets = modbus.packet_log();
    assert_eq!(packets.len(), 6);
    assert_eq!(packets[0].direction, PacketDirection::Tx);
    assert_eq!(packets[1].direction, PacketDirection::Rx);
    assert_eq!(packets[1].values, "[0, 1]");
    assert_eq!(packets[3].slave_id, 7);
    assert_eq!(packets[3].function_code, 4);
    assert!(!packets[5].success);
    assert!(packets[5].error.as_deref().is_some_and(|err| err.contains("exception 2")));

    let json: serde_json::Value =
        serde_json::from_str(&modbus.modbus_statistics_json()).expect("json stats");
    assert_eq!(json["diagnostics_enabled"], true);
    assert_eq!(json["packet_log_entries"], 6);
    assert_eq!(json["slaves"]["1"]["requests"], 2);
    let report = modbus.detailed_diagnostics();
    assert!(report.contains("Diagnostics: enabled (packet logging on)"));
    assert!(report.contains("slave 7: 1 request(s)"));

    modbus.disable_diagnostics();
    assert!(modbus.packet_log().is_empty());
    assert!(modbus.modbus_statistics().slaves.is_empty());
    assert!(modbus.detailed_diagnostics().contains("Diagnostics: disabled"));
    let json: serde_json::Value =
        serde_json::from_str(&modbus.modbus_statistics_json()).expect("json stats");
    assert_eq!(json["diagnostics_enabled"], false);
}
