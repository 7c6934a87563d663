use collector_driver::{DriverContext, DriverError, ProtocolDriver, UnifiedDriver};
use domain::{
    ConnectionStatus, DataQuality, DataType, DataValue, ProtocolType, UnifiedDataPoint,
    UnifiedDeviceInfo, now_epoch_ms,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq)]
enum ReadBehaviour {
    Values,
    Empty,
    Fail,
    Panic,
    /// 读取途中掉线并恢复
    Reconnect,
}

/// 脚本化的协议实现。
struct ScriptedProtocol {
    connect_fails: AtomicBool,
    behaviour: Mutex<ReadBehaviour>,
    connects: AtomicU32,
    disconnects: AtomicU32,
    cleanups: AtomicU32,
    writes: Mutex<Vec<(String, DataValue)>>,
    ctx: Mutex<Option<DriverContext>>,
}

impl ScriptedProtocol {
    fn new() -> Self {
        Self {
            connect_fails: AtomicBool::new(false),
            behaviour: Mutex::new(ReadBehaviour::Values),
            connects: AtomicU32::new(0),
            disconnects: AtomicU32::new(0),
            cleanups: AtomicU32::new(0),
            writes: Mutex::new(Vec::new()),
            ctx: Mutex::new(None),
        }
    }

    fn set_behaviour(&self, behaviour: ReadBehaviour) {
        *self.behaviour.lock() = behaviour;
    }
}

impl ProtocolDriver for ScriptedProtocol {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn supports(&self, protocol: ProtocolType) -> bool {
        protocol == ProtocolType::ModbusTcp
    }

    fn initialize_protocol(&self, ctx: &DriverContext) -> Result<(), DriverError> {
        *self.ctx.lock() = Some(ctx.clone());
        Ok(())
    }

    fn connect_protocol(&self) -> Result<(), DriverError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.connect_fails.load(Ordering::SeqCst) {
            return Err(DriverError::Connection("connection refused".to_string()));
        }
        Ok(())
    }

    fn disconnect_protocol(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }

    fn read_data_protocol(
        &self,
        points: &[UnifiedDataPoint],
    ) -> Result<Vec<UnifiedDataPoint>, DriverError> {
        let behaviour = *self.behaviour.lock();
        match behaviour {
            ReadBehaviour::Reconnect | ReadBehaviour::Values => {
                if behaviour == ReadBehaviour::Reconnect {
                    let ctx = self.ctx.lock().clone();
                    if let Some(ctx) = ctx {
                        ctx.force_status(ConnectionStatus::Reconnecting, "session dropped");
                        ctx.transition(ConnectionStatus::Connected, "session restored");
                    }
                }
                Ok(points
                .iter()
                .enumerate()
                .map(|(idx, point)| {
                    let mut point = point.clone();
                    if idx == 0 {
                        point.update(DataValue::UInt32(42), DataQuality::Good, now_epoch_ms());
                    } else {
                        point.mark_bad(now_epoch_ms());
                    }
                    point
                })
                .collect())
            }
            ReadBehaviour::Empty => Ok(Vec::new()),
            ReadBehaviour::Fail => Err(DriverError::Timeout("no response".to_string())),
            ReadBehaviour::Panic => panic!("decoder bug"),
        }
    }

    fn write_value_protocol(
        &self,
        point: &UnifiedDataPoint,
        value: &DataValue,
    ) -> Result<(), DriverError> {
        if matches!(value, DataValue::String(_)) {
            return Err(DriverError::Conversion("string not supported".to_string()));
        }
        self.writes.lock().push((point.id.clone(), value.clone()));
        Ok(())
    }

    fn cleanup_protocol(&self) {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
    }
}

fn device(poll_interval_ms: u64) -> UnifiedDeviceInfo {
    let mut device = UnifiedDeviceInfo::new("dev-1", "pump", ProtocolType::ModbusTcp, "127.0.0.1:502");
    device.poll_interval_ms = poll_interval_ms;
    device
}

fn points() -> Vec<UnifiedDataPoint> {
    vec![
        UnifiedDataPoint::new("p1", "dev-1", "speed", DataType::Uint16).with_modbus(3, 0),
        UnifiedDataPoint::new("p2", "", "pressure", DataType::Uint16).with_modbus(3, 1),
        UnifiedDataPoint::new("p3", "dev-1", "state", DataType::Bool)
            .with_modbus(2, 0)
            .read_only(true),
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

fn recording_driver(
    poll_interval_ms: u64,
) -> (UnifiedDriver<ScriptedProtocol>, Arc<Mutex<Vec<ConnectionStatus>>>) {
    let driver = UnifiedDriver::new(ScriptedProtocol::new());
    let statuses = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&statuses);
    driver.set_status_callback(move |_, status, _| sink.lock().push(status));
    driver
        .initialize(device(poll_interval_ms), points())
        .expect("initialize");
    (driver, statuses)
}

#[test]
fn start_reaches_connected_and_stop_disconnects() {
    let (driver, statuses) = recording_driver(20);
    driver.start().expect("start");
    assert!(driver.is_running());
    assert!(wait_until(Duration::from_secs(2), || {
        driver.connection_status() == ConnectionStatus::Connected
    }));
    assert_eq!(driver.protocol().connects.load(Ordering::SeqCst), 1);

    driver.stop();
    assert!(!driver.is_running());
    assert_eq!(driver.connection_status(), ConnectionStatus::Disconnected);
    assert_eq!(driver.protocol().cleanups.load(Ordering::SeqCst), 1);
    assert_eq!(driver.protocol().disconnects.load(Ordering::SeqCst), 1);

    let seen = statuses.lock().clone();
    assert!(seen.contains(&ConnectionStatus::Connecting));
    assert!(seen.contains(&ConnectionStatus::Connected));
    assert_eq!(seen.last(), Some(&ConnectionStatus::Disconnected));
}

#[test]
fn stop_twice_matches_stop_once() {
    let (driver, statuses) = recording_driver(20);
    driver.start().expect("start");
    assert!(wait_until(Duration::from_secs(2), || {
        driver.connection_status() == ConnectionStatus::Connected
    }));

    driver.stop();
    let after_first = statuses.lock().len();
    driver.stop();

    assert_eq!(statuses.lock().len(), after_first);
    assert_eq!(driver.connection_status(), ConnectionStatus::Disconnected);
    assert_eq!(driver.protocol().cleanups.load(Ordering::SeqCst), 1);
}

#[test]
fn stop_is_bounded_by_poll_interval() {
    let (driver, _) = recording_driver(5_000);
    driver.start().expect("start");
    assert!(wait_until(Duration::from_secs(2), || {
        driver.statistics().total_reads >= 1
    }));

    let started = Instant::now();
    driver.stop();
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[test]
fn poll_cycles_keep_bad_points_and_balance_counters() {
    let (driver, _) = recording_driver(10);
    let snapshots = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&snapshots);
    driver.set_data_callback(move |device, points| {
        assert_eq!(device.id, "dev-1");
        sink.lock().push(points.to_vec());
    });

    driver.start().expect("start");
    assert!(wait_until(Duration::from_secs(2), || snapshots.lock().len() >= 3));
    driver.stop();

    let stats = driver.statistics();
    assert_eq!(stats.total_reads, stats.successful_reads + stats.failed_reads);
    assert!(stats.successful_reads >= 3);

    let first = snapshots.lock()[0].clone();
    assert_eq!(first.len(), 3);
    assert_eq!(first[0].quality, DataQuality::Good);
    assert_eq!(first[0].current_value, DataValue::UInt32(42));
    assert_eq!(first[1].quality, DataQuality::Bad);
    assert_eq!(first[1].device_id, "dev-1");
    assert_eq!(driver.data_points()[1].quality, DataQuality::Bad);
}

#[test]
fn read_errors_are_reported_without_changing_state() {
    let (driver, statuses) = recording_driver(10);
    driver.protocol().set_behaviour(ReadBehaviour::Fail);
    driver.start().expect("start");

    assert!(wait_until(Duration::from_secs(2), || {
        driver.statistics().failed_reads >= 2
    }));
    assert_eq!(driver.connection_status(), ConnectionStatus::Connected);
    assert!(driver.is_running());
    assert!(statuses.lock().contains(&ConnectionStatus::Error));

    driver.protocol().set_behaviour(ReadBehaviour::Panic);
    let failed = driver.statistics().failed_reads;
    assert!(wait_until(Duration::from_secs(2), || {
        driver.statistics().failed_reads > failed
    }));
    assert!(driver.is_running());

    driver.stop();
    let stats = driver.statistics();
    assert_eq!(stats.total_reads, stats.successful_reads + stats.failed_reads);
    assert_eq!(stats.successful_reads, 0);
}

#[test]
fn empty_read_counts_as_failure() {
    let (driver, _) = recording_driver(1000);
    driver.protocol().set_behaviour(ReadBehaviour::Empty);

    let points = driver.read_once().expect("read once");
    assert!(points.is_empty());
    let stats = driver.statistics();
    assert_eq!(stats.total_reads, 1);
    assert_eq!(stats.failed_reads, 1);
}

#[test]
fn connect_failure_stops_worker_in_error() {
    let driver = UnifiedDriver::new(ScriptedProtocol::new());
    driver.protocol().connect_fails.store(true, Ordering::SeqCst);
    driver.initialize(device(10), points()).expect("initialize");

    driver.start().expect("start");
    assert!(wait_until(Duration::from_secs(2), || !driver.is_running()));
    assert_eq!(driver.connection_status(), ConnectionStatus::Error);
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(driver.protocol().connects.load(Ordering::SeqCst), 1);

    // 外部重新 start 才会重试
    driver.protocol().connect_fails.store(false, Ordering::SeqCst);
    driver.start().expect("restart");
    assert!(wait_until(Duration::from_secs(2), || {
        driver.connection_status() == ConnectionStatus::Connected
    }));
    driver.stop();
    assert_eq!(driver.connection_status(), ConnectionStatus::Disconnected);
}

#[test]
fn initialize_rejects_bad_configuration() {
    let driver = UnifiedDriver::new(ScriptedProtocol::new());

    let mut bad = device(1000);
    bad.endpoint.clear();
    assert!(matches!(driver.initialize(bad, points()), Err(DriverError::Config(_))));

    let mut bad = device(1000);
    bad.poll_interval_ms = 0;
    assert!(matches!(driver.initialize(bad, points()), Err(DriverError::Config(_))));

    let mut bad = device(1000);
    bad.protocol = ProtocolType::BacnetIp;
    assert!(matches!(driver.initialize(bad, points()), Err(DriverError::Config(_))));

    let mut duplicated = points();
    duplicated.push(UnifiedDataPoint::new("p1", "dev-1", "again", DataType::Uint16));
    assert!(matches!(
        driver.initialize(device(1000), duplicated),
        Err(DriverError::Config(_))
    ));

    let foreign = vec![UnifiedDataPoint::new("p9", "dev-2", "x", DataType::Uint16)];
    assert!(driver.initialize(device(1000), foreign).is_err());

    assert!(matches!(driver.start(), Err(DriverError::NotInitialized)));
}

#[test]
fn start_on_running_driver_is_a_no_op() {
    let (driver, _) = recording_driver(20);
    driver.start().expect("start");
    assert!(wait_until(Duration::from_secs(2), || {
        driver.connection_status() == ConnectionStatus::Connected
    }));

    driver.start().expect("second start");
    std::thread::sleep(Duration::from_millis(50));
    assert!(driver.is_running());
    assert_eq!(driver.protocol().connects.load(Ordering::SeqCst), 1);
    driver.stop();
}

#[test]
fn status_callback_can_read_points_during_read_cycle() {
    let driver = Arc::new(UnifiedDriver::new(ScriptedProtocol::new()));
    driver.initialize(device(1000), points()).expect("initialize");
    driver.protocol().set_behaviour(ReadBehaviour::Reconnect);

    let ctx = driver.protocol().ctx.lock().clone().expect("context");
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    driver.set_status_callback(move |_, status, _| {
        sink.lock().push((status, ctx.data_points().len()));
    });

    let (done_tx, done_rx) = std::sync::mpsc::channel();
    let reader = Arc::clone(&driver);
    std::thread::spawn(move || {
        let _ = done_tx.send(reader.read_once().map(|points| points.len()));
    });
    let read = done_rx
        .recv_timeout(Duration::from_secs(2))
        .expect("read cycle finished");

    assert_eq!(read.expect("read"), 3);
    assert_eq!(
        seen.lock().as_slice(),
        &[
            (ConnectionStatus::Reconnecting, 3),
            (ConnectionStatus::Connected, 3)
        ]
    );
    assert_eq!(driver.connection_status(), ConnectionStatus::Connected);
}

#[test]
fn unbounded_poll_interval_still_stops() {
    let (driver, _) = recording_driver(u64::MAX);
    driver.start().expect("start");
    assert!(wait_until(Duration::from_secs(2), || {
        driver.statistics().total_reads >= 1
    }));

    let started = Instant::now();
    driver.stop();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(driver.connection_status(), ConnectionStatus::Disconnected);
}

#[test]
fn disabled_device_does_not_start() {
    let driver = UnifiedDriver::new(ScriptedProtocol::new());
    let mut disabled = device(1000);
    disabled.enabled = false;
    driver.initialize(disabled, points()).expect("initialize");
    assert!(matches!(driver.start(), Err(DriverError::Config(_))));
    assert!(!driver.is_running());
}

#[test]
fn writes_are_checked_and_counted() {
    let (driver, _) = recording_driver(1000);

    driver.write_value("p1", DataValue::UInt32(7)).expect("write");
    assert!(matches!(
        driver.write_value("missing", DataValue::Bool(true)),
        Err(DriverError::PointNotFound(_))
    ));
    assert!(matches!(
        driver.write_value("p3", DataValue::Bool(true)),
        Err(DriverError::ReadOnly(_))
    ));
    assert!(matches!(
        driver.write_value("p2", DataValue::String("x".into())),
        Err(DriverError::Conversion(_))
    ));

    let stats = driver.statistics();
    assert_eq!(stats.total_writes, 2);
    assert_eq!(stats.successful_writes, 1);
    assert_eq!(stats.failed_writes, 1);
    assert_eq!(
        driver.protocol().writes.lock().as_slice(),
        &[("p1".to_string(), DataValue::UInt32(7))]
    );
}

#[test]
fn callbacks_can_be_replaced_while_running() {
    let (driver, _) = recording_driver(10);
    let first = Arc::new(AtomicU32::new(0));
    let second = Arc::new(AtomicU32::new(0));

    let counter = Arc::clone(&first);
    driver.set_data_callback(move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    driver.start().expect("start");
    assert!(wait_until(Duration::from_secs(2), || first.load(Ordering::SeqCst) >= 1));

    let counter = Arc::clone(&second);
    driver.set_data_callback(move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let frozen = first.load(Ordering::SeqCst);
    assert!(wait_until(Duration::from_secs(2), || second.load(Ordering::SeqCst) >= 1));
    driver.stop();

    assert!(first.load(Ordering::SeqCst) <= frozen + 1);
}

#[test]
fn publish_update_pushes_full_snapshot() {
    let (driver, _) = recording_driver(1000);
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    driver.set_data_callback(move |_, points| sink.lock().push(points.len()));

    let ctx = driver.protocol().ctx.lock().clone().expect("context");
    let changed = ctx.publish_update(|point| {
        if point.id == "p2" {
            point.update(DataValue::UInt32(9), DataQuality::Good, now_epoch_ms());
            true
        } else {
            false
        }
    });

    assert_eq!(changed, 1);
    assert_eq!(received.lock().as_slice(), &[3]);
    assert_eq!(driver.data_points()[1].current_value, DataValue::UInt32(9));
}

#[tokio::test]
async fn async_wrappers_run_off_thread() {
    let (driver, _) = recording_driver(1000);
    let driver = Arc::new(driver);

    driver
        .write_value_async("p1", DataValue::UInt32(3))
        .await
        .expect("async write");
    let points = driver.read_once_async().await.expect("async read");

    assert_eq!(points.len(), 3);
    assert_eq!(driver.statistics().successful_writes, 1);
    assert_eq!(driver.statistics().successful_reads, 1);
}
