use collector_protocol::bacnet::codec::{
    Apdu, CovNotification, IAm, PropertyValue, ReadPropertyAck, SubscribeCov,
    WritePropertyRequest, decode_frame, encode_frame, property, service,
};
use collector_protocol::bacnet::{
    BacnetDriver, BacnetProtocol, BacnetValue, ObjectId, PacketDirection, PropertyRef,
};
use collector_protocol::BacnetError;
use domain::{
    ConnectionStatus, DataQuality, DataType, DataValue, ProtocolType, ReconnectPolicy,
    UnifiedDataPoint, UnifiedDeviceInfo,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const DEVICE_INSTANCE: u32 = 1234;
const ANALOG_INPUT: u16 = 0;
const ANALOG_VALUE: u16 = 2;
const BINARY_VALUE: u16 = 5;

#[derive(Default)]
struct FakeState {
    properties: HashMap<(ObjectId, u32), Vec<BacnetValue>>,
    abort_whole_object_list: bool,
    silent: bool,
    confirmed_requests: usize,
    subscriber: Option<(SocketAddr, u32)>,
    active_subscriptions: usize,
}

/// 本机回环上的最小 BACnet 设备。
struct FakeDevice {
    socket: Arc<UdpSocket>,
    addr: SocketAddr,
    state: Arc<Mutex<FakeState>>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl FakeDevice {
    fn start() -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").expect("bind fake device");
        socket
            .set_read_timeout(Some(Duration::from_millis(20)))
            .expect("read timeout");
        let addr = socket.local_addr().expect("fake address");
        let socket = Arc::new(socket);

        let mut state = FakeState::default();
        let device = ObjectId::device(DEVICE_INSTANCE);
        state.properties.insert(
            (device, property::OBJECT_NAME),
            vec![BacnetValue::CharacterString("fake-ahu".to_string())],
        );
        state.properties.insert(
            (device, property::OBJECT_LIST),
            vec![
                BacnetValue::ObjectId(device),
                BacnetValue::ObjectId(ObjectId::new(ANALOG_INPUT, 1)),
                BacnetValue::ObjectId(ObjectId::new(BINARY_VALUE, 2)),
            ],
        );
        let zone_temp = ObjectId::new(ANALOG_INPUT, 1);
        state.properties.insert(
            (zone_temp, property::OBJECT_NAME),
            vec![BacnetValue::CharacterString("Zone Temp".to_string())],
        );
        state
            .properties
            .insert((zone_temp, property::PRESENT_VALUE), vec![BacnetValue::Real(21.5)]);
        let fan = ObjectId::new(BINARY_VALUE, 2);
        state.properties.insert(
            (fan, property::OBJECT_NAME),
            vec![BacnetValue::CharacterString("Fan".to_string())],
        );
        state
            .properties
            .insert((fan, property::PRESENT_VALUE), vec![BacnetValue::Enumerated(1)]);
        state.properties.insert(
            (ObjectId::new(ANALOG_VALUE, 3), property::PRESENT_VALUE),
            vec![BacnetValue::Real(20.0)],
        );

        let state = Arc::new(Mutex::new(state));
        let stop = Arc::new(AtomicBool::new(false));
        let handle = {
            let socket = Arc::clone(&socket);
            let state = Arc::clone(&state);
            let stop = Arc::clone(&stop);
            thread::spawn(move || serve(&socket, &state, &stop))
        };
        Self {
            socket,
            addr,
            state,
            stop,
            handle: Some(handle),
        }
    }

    fn set_silent(&self, silent: bool) {
        self.state.lock().silent = silent;
    }

    fn abort_whole_object_list(&self) {
        self.state.lock().abort_whole_object_list = true;
    }

    fn confirmed_requests(&self) -> usize {
        self.state.lock().confirmed_requests
    }

    fn active_subscriptions(&self) -> usize {
        self.state.lock().active_subscriptions
    }

    fn value(&self, object: ObjectId) -> Option<Vec<BacnetValue>> {
        self.state
            .lock()
            .properties
            .get(&(object, property::PRESENT_VALUE))
            .cloned()
    }

    fn notify_cov(&self, object: ObjectId, value: BacnetValue, confirmed: bool) {
        let (subscriber, process_id) = self.state.lock().subscriber.expect("a cov subscriber");
        let data = CovNotification {
            process_id,
            initiating_device: ObjectId::device(DEVICE_INSTANCE),
            monitored_object: object,
            time_remaining: 300,
            values: vec![PropertyValue::new(property::PRESENT_VALUE, value)],
        }
        .encode()
        .expect("encode notification");
        let apdu = if confirmed {
            Apdu::ConfirmedRequest {
                invoke_id: 77,
                service: service::CONFIRMED_COV_NOTIFICATION,
                max_apdu: 1476,
                data,
            }
        } else {
            Apdu::UnconfirmedRequest {
                service: service::UNCONFIRMED_COV_NOTIFICATION,
                data,
            }
        };
        self.socket
            .send_to(&encode_frame(&apdu.encode(), false, confirmed), subscriber)
            .expect("send notification");
    }
}

impl Drop for FakeDevice {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn serve(socket: &UdpSocket, state: &Mutex<FakeState>, stop: &AtomicBool) {
    let mut buf = [0u8; 1500];
    while !stop.load(Ordering::SeqCst) {
        let Ok((len, source)) = socket.recv_from(&mut buf) else {
            continue;
        };
        let Ok(Some(apdu)) = decode_frame(&buf[..len]) else {
            continue;
        };
        let reply = match apdu {
            Apdu::UnconfirmedRequest {
                service: service::WHO_IS,
                ..
            } => {
                if state.lock().silent {
                    continue;
                }
                let data = IAm {
                    device: ObjectId::device(DEVICE_INSTANCE),
                    max_apdu: 1476,
                    segmentation: 3,
                    vendor_id: 999,
                }
                .encode()
                .expect("encode i-am");
                Apdu::UnconfirmedRequest {
                    service: service::I_AM,
                    data,
                }
            }
            Apdu::ConfirmedRequest {
                invoke_id,
                service: choice,
                data,
                ..
            } => {
                let mut state = state.lock();
                state.confirmed_requests += 1;
                if state.silent {
                    continue;
                }
                answer(&mut state, source, invoke_id, choice, &data)
            }
            _ => continue,
        };
        let _ = socket.send_to(&encode_frame(&reply.encode(), false, false), source);
    }
}

fn answer(state: &mut FakeState, source: SocketAddr, invoke_id: u8, choice: u8, data: &[u8]) -> Apdu {
    let unknown = Apdu::Error {
        invoke_id,
        service: choice,
        class: 2,
        code: 32,
    };
    match choice {
        service::READ_PROPERTY => {
            let reference = PropertyRef::decode_read(data).expect("read request");
            if reference.property == property::OBJECT_LIST
                && reference.array_index.is_none()
                && state.abort_whole_object_list
            {
                return Apdu::Abort {
                    invoke_id,
                    reason: 4,
                    server: true,
                };
            }
            let Some(values) = state
                .properties
                .get(&(reference.object, reference.property))
            else {
                return unknown;
            };
            let values = match reference.array_index {
                None => values.clone(),
                Some(0) => vec![BacnetValue::Unsigned(values.len() as u32)],
                Some(index) => match values.get(index as usize - 1) {
                    Some(value) => vec![value.clone()],
                    None => return unknown,
                },
            };
            let data = ReadPropertyAck {
                property: reference,
                values,
            }
            .encode()
            .expect("encode ack");
            Apdu::ComplexAck {
                invoke_id,
                service: choice,
                data,
            }
        }
        service::WRITE_PROPERTY => {
            let request = WritePropertyRequest::decode(data).expect("write request");
            state.properties.insert(
                (request.property.object, request.property.property),
                vec![request.value],
            );
            Apdu::SimpleAck {
                invoke_id,
                service: choice,
            }
        }
        service::SUBSCRIBE_COV => {
            let request = SubscribeCov::decode(data).expect("subscribe request");
            state.subscriber = Some((source, request.process_id));
            if request.lifetime.is_some() {
                state.active_subscriptions += 1;
            } else {
                state.active_subscriptions = state.active_subscriptions.saturating_sub(1);
            }
            Apdu::SimpleAck {
                invoke_id,
                service: choice,
            }
        }
        _ => Apdu::Reject {
            invoke_id,
            reason: 9,
        },
    }
}

fn device_info(fake: SocketAddr) -> UnifiedDeviceInfo {
    let mut device =
        UnifiedDeviceInfo::new("ahu-1", "air handler", ProtocolType::BacnetIp, fake.to_string());
    device.poll_interval_ms = 60_000;
    device.reconnect = ReconnectPolicy {
        auto_reconnect: true,
        max_attempts: 2,
        delay_ms: 10,
    };
    let config = &mut device.bacnet_config;
    config.device_id = DEVICE_INSTANCE;
    config.local_port = 0;
    config.broadcast_address = "127.0.0.1".to_string();
    config.broadcast_port = fake.port();
    config.apdu_timeout_ms = 200;
    config.apdu_retries = 1;
    config.who_is_interval_ms = 60_000;
    device
}

fn points() -> Vec<UnifiedDataPoint> {
    vec![
        UnifiedDataPoint::new("zone-temp", "ahu-1", "zone temperature", DataType::Float32)
            .with_bacnet(ANALOG_INPUT, 1),
        UnifiedDataPoint::new("fan", "ahu-1", "supply fan", DataType::Bool)
            .with_bacnet(BINARY_VALUE, 2),
        UnifiedDataPoint::new("setpoint", "ahu-1", "setpoint", DataType::Float32)
            .with_bacnet(ANALOG_VALUE, 3),
    ]
}

fn wait_until<F: Fn() -> bool>(timeout: Duration, check: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    check()
}

/// 启动驱动并等待第一次读周期完成。
fn started_driver(fake: &FakeDevice, points: Vec<UnifiedDataPoint>) -> BacnetDriver {
    let driver = BacnetDriver::new(BacnetProtocol::new());
    driver
        .initialize(device_info(fake.addr), points)
        .expect("initialize bacnet driver");
    driver.start().expect("start bacnet driver");
    assert!(wait_until(Duration::from_secs(5), || {
        driver.statistics().total_reads >= 1
    }));
    driver
}

fn point(driver: &BacnetDriver, id: &str) -> UnifiedDataPoint {
    driver
        .data_points()
        .into_iter()
        .find(|point| point.id == id)
        .expect("configured point")
}

#[test]
fn discovers_device_and_polls_points() {
    let fake = FakeDevice::start();
    let driver = started_driver(&fake, points());
    assert_eq!(driver.connection_status(), ConnectionStatus::Connected);

    let temp = point(&driver, "zone-temp");
    assert_eq!(temp.quality, DataQuality::Good);
    assert_eq!(temp.current_value, DataValue::Float(21.5));
    let fan = point(&driver, "fan");
    assert_eq!(fan.current_value, DataValue::Bool(true));

    let bacnet = driver.protocol();
    assert!(wait_until(Duration::from_secs(5), || {
        bacnet
            .discovered_devices()
            .iter()
            .any(|device| device.device_id == DEVICE_INSTANCE && device.name == "fake-ahu")
    }));
    let device = bacnet
        .discovered_devices()
        .into_iter()
        .find(|device| device.device_id == DEVICE_INSTANCE)
        .expect("discovered device");
    assert_eq!(device.port, fake.addr.port());
    assert_eq!(device.vendor_id, 999);
    assert_eq!(device.max_apdu_length, 1476);
    assert!(!device.segmentation_supported);

    let stats = bacnet.bacnet_statistics();
    assert!(stats.who_is_sent >= 1);
    assert!(stats.i_am_received >= 1);
    assert!(bacnet.local_address().is_some());

    driver.stop();
    assert_eq!(driver.connection_status(), ConnectionStatus::Disconnected);
    assert!(bacnet.local_address().is_none());
}

#[test]
fn writes_reach_the_device() {
    let fake = FakeDevice::start();
    let driver = started_driver(&fake, points());
    let setpoint = ObjectId::new(ANALOG_VALUE, 3);

    driver
        .write_value("setpoint", DataValue::Double(22.5))
        .expect("point write");
    assert_eq!(fake.value(setpoint), Some(vec![BacnetValue::Real(22.5)]));

    driver
        .protocol()
        .write_property(
            DEVICE_INSTANCE,
            PropertyRef::new(setpoint, property::PRESENT_VALUE),
            BacnetValue::Real(19.0),
            Some(8),
        )
        .expect("direct write");
    assert_eq!(fake.value(setpoint), Some(vec![BacnetValue::Real(19.0)]));

    let err = driver
        .protocol()
        .write_property(
            DEVICE_INSTANCE,
            PropertyRef::new(setpoint, property::PRESENT_VALUE),
            BacnetValue::Real(1.0),
            Some(17),
        )
        .expect_err("priority out of range");
    assert!(matches!(err, BacnetError::InvalidArgument(_)));

    let stats = driver.protocol().bacnet_statistics();
    assert_eq!(stats.write_requests, 2);
    assert_eq!(stats.successful_writes, 2);
}

#[test]
fn object_list_falls_back_to_indexed_reads() {
    let fake = FakeDevice::start();
    fake.abort_whole_object_list();
    let driver = started_driver(&fake, points());

    let objects = driver
        .protocol()
        .get_device_objects(DEVICE_INSTANCE)
        .expect("device objects");
    assert_eq!(objects.len(), 3);
    assert_eq!(objects[0].object, ObjectId::device(DEVICE_INSTANCE));
    assert_eq!(objects[0].name, "fake-ahu");
    assert_eq!(objects[0].value, None);
    assert_eq!(objects[1].name, "Zone Temp");
    assert_eq!(objects[1].value, Some(BacnetValue::Real(21.5)));
    assert_eq!(objects[2].value, Some(BacnetValue::Enumerated(1)));

    let stats = driver.protocol().bacnet_statistics();
    assert_eq!(stats.error_codes.get("abort:4"), Some(&1));
}

#[test]
fn error_pdu_is_counted_without_state_change() {
    let fake = FakeDevice::start();
    let driver = started_driver(&fake, points());

    let err = driver
        .protocol()
        .read_property(
            DEVICE_INSTANCE,
            PropertyRef::new(ObjectId::new(ANALOG_INPUT, 99), property::PRESENT_VALUE),
        )
        .expect_err("unknown object");
    assert!(matches!(err, BacnetError::ErrorPdu { class: 2, code: 32 }));

    let stats = driver.protocol().bacnet_statistics();
    assert!(stats.error_pdus >= 1);
    assert!(stats.error_codes.get("error:2:32").copied().unwrap_or(0) >= 1);
    assert_eq!(driver.connection_status(), ConnectionStatus::Connected);

    let err = driver
        .protocol()
        .read_property(
            4_000_000,
            PropertyRef::new(ObjectId::device(4_000_000), property::OBJECT_NAME),
        )
        .expect_err("unknown device");
    assert!(matches!(err, BacnetError::UnknownDevice(4_000_000)));
}

#[test]
fn cov_notification_updates_subscribed_point() {
    let fake = FakeDevice::start();
    let driver = started_driver(&fake, points());
    let bacnet = driver.protocol();
    let zone_temp = ObjectId::new(ANALOG_INPUT, 1);

    bacnet
        .subscribe_cov(DEVICE_INSTANCE, ANALOG_INPUT, 1, 300)
        .expect("subscribe");
    assert_eq!(fake.active_subscriptions(), 1);
    assert_eq!(bacnet.cov_subscriptions().len(), 1);

    fake.notify_cov(zone_temp, BacnetValue::Real(30.0), true);
    assert!(wait_until(Duration::from_secs(3), || {
        point(&driver, "zone-temp").current_value == DataValue::Float(30.0)
    }));
    let stats = bacnet.bacnet_statistics();
    assert_eq!(stats.cov_notifications, 1);
    assert_eq!(stats.cov_subscriptions, 1);

    bacnet
        .unsubscribe_cov(DEVICE_INSTANCE, ANALOG_INPUT, 1)
        .expect("unsubscribe");
    assert_eq!(fake.active_subscriptions(), 0);
    assert!(bacnet.cov_subscriptions().is_empty());
    let err = bacnet
        .unsubscribe_cov(DEVICE_INSTANCE, ANALOG_INPUT, 1)
        .expect_err("already cancelled");
    assert!(matches!(err, BacnetError::NotSubscribed(_)));

    // 取消后的通知不再入表
    fake.notify_cov(zone_temp, BacnetValue::Real(40.0), false);
    thread::sleep(Duration::from_millis(300));
    assert_eq!(
        point(&driver, "zone-temp").current_value,
        DataValue::Float(30.0)
    );
    assert_eq!(bacnet.bacnet_statistics().cov_notifications, 1);
}

#[test]
fn silent_device_times_out_and_marks_points_bad() {
    let fake = FakeDevice::start();
    fake.set_silent(true);
    let only_temp = vec![
        UnifiedDataPoint::new("zone-temp", "ahu-1", "zone temperature", DataType::Float32)
            .with_bacnet(ANALOG_INPUT, 1),
    ];
    let driver = started_driver(&fake, only_temp);

    // 1 次发送 + 1 次重试
    assert_eq!(fake.confirmed_requests(), 2);
    assert_eq!(point(&driver, "zone-temp").quality, DataQuality::Bad);
    assert_eq!(driver.protocol().bacnet_statistics().timeouts, 1);
    assert_eq!(driver.connection_status(), ConnectionStatus::Connected);
}

#[test]
fn packet_log_captures_requests_and_responses() {
    let fake = FakeDevice::start();
    let driver = BacnetDriver::new(BacnetProtocol::new());
    driver
        .initialize(device_info(fake.addr), points())
        .expect("initialize");
    driver.protocol().set_packet_logging(true);
    driver.start().expect("start");
    assert!(wait_until(Duration::from_secs(5), || {
        driver.statistics().total_reads >= 1
    }));

    let entries: Vec<_> = driver
        .protocol()
        .packet_log()
        .into_iter()
        .filter(|entry| entry.object_type == ANALOG_INPUT && entry.object_instance == 1)
        .collect();
    assert!(entries
        .iter()
        .any(|entry| entry.direction == PacketDirection::Tx));
    let response = entries
        .iter()
        .find(|entry| entry.direction == PacketDirection::Rx)
        .expect("response entry");
    assert!(response.success);
    assert_eq!(response.property_id, property::PRESENT_VALUE);
    assert_eq!(response.decoded_value, "21.5");

    let report = driver.protocol().diagnostics_report();
    assert!(report.contains("\"device_instance\": 1234"));

    driver.protocol().clear_packet_log();
    assert!(driver
        .protocol()
        .packet_log()
        .iter()
        .all(|entry| entry.object_instance != 1 || entry.object_type != ANALOG_INPUT));
}

#[test]
fn invalid_configuration_fails_initialize() {
    let fake = FakeDevice::start();
    let driver = BacnetDriver::new(BacnetProtocol::new());

    let mut device = device_info(fake.addr);
    device.bacnet_config.device_id = 5_000_000;
    assert!(driver.initialize(device, points()).is_err());

    let mut device = device_info(fake.addr);
    device.endpoint = "not-an-address".to_string();
    assert!(driver.initialize(device, points()).is_err());

    let mut device = device_info(fake.addr);
    device.bacnet_config.apdu_timeout_ms = 0;
    assert!(driver.initialize(device, points()).is_err());
}
