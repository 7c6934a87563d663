use collector_telemetry::{
    DriverLogger, LogCategory, LogLevel, MemoryDriverLogger, TracingDriverLogger,
    TransferDirection, init_tracing, metrics, record_poll_cycle,
};
use domain::ConnectionStatus;

#[test]
fn memory_logger_keeps_most_recent_entries() {
    let logger = MemoryDriverLogger::new(2);
    logger.info("first", LogCategory::General);
    logger.warn("second", LogCategory::Connection);
    logger.fatal("third", LogCategory::ErrorHandling);

    let entries = logger.entries();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].message, "second");
    assert_eq!(entries[1].level, LogLevel::Fatal);
}

#[test]
fn structured_helpers_choose_category_and_level() {
    let logger = MemoryDriverLogger::new(16);
    logger.log_connection_status_change(
        ConnectionStatus::Connected,
        ConnectionStatus::Error,
        "reconnect budget exhausted",
    );
    logger.log_data_transfer(TransferDirection::Tx, 12, "read holding registers");
    logger.log_modbus_operation(3, 100, 2, false, 15, Some("illegal data address"));

    let connection = logger.entries_in(LogCategory::Connection);
    assert_eq!(connection.len(), 1);
    assert_eq!(connection[0].level, LogLevel::Warn);
    assert!(connection[0].message.contains("CONNECTED -> ERROR"));

    let protocol = logger.entries_in(LogCategory::ProtocolSpecific);
    assert!(protocol[0].message.contains("illegal data address"));
    assert_eq!(logger.entries_in(LogCategory::Communication).len(), 1);
}

#[test]
fn tracing_logger_accepts_every_level() {
    init_tracing();
    let logger = TracingDriverLogger::new("dev-1");
    logger.debug("debug", LogCategory::General);
    logger.error("error", LogCategory::ErrorHandling);
    logger.fatal("fatal", LogCategory::ErrorHandling);
    logger.log_bacnet_operation("read-property", "analog-input:1", true, 3, None);
}

#[test]
fn poll_cycles_are_counted() {
    let before = metrics().snapshot();
    record_poll_cycle(true);
    record_poll_cycle(false);
    let after = metrics().snapshot();
    assert!(after.poll_cycles >= before.poll_cycles + 2);
    assert!(after.poll_failures > before.poll_failures);
}
