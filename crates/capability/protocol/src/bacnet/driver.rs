//! BACnet/IP 协议驱动
//!
//! 线程划分：
//! - 工作线程（统一基类）：按轮询周期读取点位的属性
//! - 发现线程：周期 Who-Is、新设备读名称、COV 通知入表、订阅续期
//! - I/O 线程：独占 UDP 套接字，逐个执行确认型请求
//!
//! I/O 线程上的处理器只解码并投递事件，不发起请求。
//! Error/Reject/Abort 只计数，不改变连接状态；套接字失败时重新绑定（固定间隔重连）。

use super::codec::{
    self, Apdu, CovNotification, IAm, MAX_INSTANCE, ObjectId, PropertyRef, ReadPropertyAck,
    SubscribeCov, WritePropertyRequest, property, service,
};
use super::packet_log::PacketLogEntry;
use super::stats::{BacnetCounters, BacnetStatistics, Operation};
use super::transport::{Dispatcher, Transport, TransportConfig};
use super::value::{BacnetValue, from_data_value, to_data_value};
use crate::error::BacnetError;
use crate::packet_log::{PacketDirection, PacketLog};
use collector_driver::{
    DriverContext, DriverError, ProtocolDriver, UnifiedDriver, reconnect_with_fixed_delay,
};
use collector_telemetry::{
    LogCategory, record_cov_notification, record_protocol_exception, record_timeout,
};
use domain::{
    ConnectionStatus, DataQuality, DataValue, ProtocolType, ReconnectPolicy, UnifiedDataPoint,
    UnifiedDeviceInfo, now_epoch_ms,
};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

pub const DEFAULT_BACNET_PORT: u16 = 47808;

/// 发现线程两次检查停止标志之间的最长等待
const DISCOVERY_TICK: Duration = Duration::from_millis(100);

/// I-Am 中表示不支持分段
const NO_SEGMENTATION: u32 = 3;

pub type BacnetDriver = UnifiedDriver<BacnetProtocol>;

/// Who-Is / I-Am 发现到的设备
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveredDevice {
    pub device_id: u32,
    /// 设备对象名称，读取成功前为空
    pub name: String,
    pub ip_address: IpAddr,
    pub port: u16,
    pub max_apdu_length: u32,
    pub segmentation_supported: bool,
    pub vendor_id: u32,
    pub last_seen_ms: i64,
}

/// 设备对象列表中的一项
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectDescriptor {
    pub object: ObjectId,
    pub name: String,
    /// 无 present-value 的对象为 None
    pub value: Option<BacnetValue>,
    pub timestamp_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CovSubscription {
    pub device_id: u32,
    pub object: ObjectId,
    pub process_id: u32,
    pub lifetime_s: u32,
    pub subscribed_at_ms: i64,
}

/// 解析 `ip[:port]`，缺省端口 47808。
pub fn parse_endpoint(endpoint: &str) -> Result<SocketAddr, BacnetError> {
    let endpoint = endpoint.trim();
    if endpoint.is_empty() {
        return Err(BacnetError::Endpoint("endpoint is empty".to_string()));
    }
    if let Ok(addr) = endpoint.parse::<SocketAddr>() {
        return Ok(addr);
    }
    if let Ok(ip) = endpoint.trim_matches(['[', ']']).parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, DEFAULT_BACNET_PORT));
    }
    Err(BacnetError::Endpoint(format!(
        "expected ip[:port], got {:?}",
        endpoint
    )))
}

struct Settings {
    target: SocketAddr,
    device_instance: u32,
    local: SocketAddr,
    broadcast: SocketAddr,
    timeout: Duration,
    retries: u32,
    max_apdu: u16,
    who_is_enabled: bool,
    who_is_interval: Duration,
    cov_enabled: bool,
    cov_lifetime_s: u32,
    reconnect: ReconnectPolicy,
}

impl Settings {
    fn from_device(device: &UnifiedDeviceInfo) -> Result<Self, BacnetError> {
        let config = &device.bacnet_config;
        if config.device_id > MAX_INSTANCE {
            return Err(BacnetError::InvalidArgument(format!(
                "device instance {} exceeds {}",
                config.device_id, MAX_INSTANCE
            )));
        }
        if config.apdu_timeout_ms == 0 {
            return Err(BacnetError::InvalidArgument(
                "apdu timeout must be positive".to_string(),
            ));
        }
        if config.who_is_enabled && config.who_is_interval_ms == 0 {
            return Err(BacnetError::InvalidArgument(
                "who-is interval must be positive".to_string(),
            ));
        }
        let broadcast_ip = config
            .broadcast_address
            .trim()
            .parse::<IpAddr>()
            .map_err(|_| {
                BacnetError::Endpoint(format!(
                    "invalid broadcast address {:?}",
                    config.broadcast_address
                ))
            })?;

        Ok(Self {
            target: parse_endpoint(&device.endpoint)?,
            device_instance: config.device_id,
            local: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), config.local_port),
            broadcast: SocketAddr::new(broadcast_ip, config.broadcast_port),
            timeout: Duration::from_millis(config.apdu_timeout_ms),
            retries: config.apdu_retries,
            max_apdu: config.max_apdu_length,
            who_is_enabled: config.who_is_enabled,
            who_is_interval: Duration::from_millis(config.who_is_interval_ms),
            cov_enabled: config.cov_enabled,
            cov_lifetime_s: config.cov_lifetime_s,
            reconnect: device.reconnect.clone(),
        })
    }

    fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            local: self.local,
            timeout: self.timeout,
            retries: self.retries,
            max_apdu: self.max_apdu,
        }
    }
}

/// I/O 线程投递给发现线程的事件
enum Event {
    Announced(u32),
    Cov(CovNotification),
}

struct Discovery {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

struct Inner {
    ctx: RwLock<Option<DriverContext>>,
    settings: RwLock<Option<Arc<Settings>>>,
    /// 连接互斥锁：只在取出/替换时持有，请求期间不持有
    transport: Mutex<Option<Arc<Transport>>>,
    events: Mutex<Option<Sender<Event>>>,
    discovery: Mutex<Option<Discovery>>,
    devices: RwLock<BTreeMap<u32, DiscoveredDevice>>,
    subscriptions: Mutex<BTreeMap<(u32, ObjectId), CovSubscription>>,
    counters: BacnetCounters,
    packet_log: PacketLog<PacketLogEntry>,
    next_process_id: AtomicU32,
}

pub struct BacnetProtocol {
    inner: Arc<Inner>,
}

impl Default for BacnetProtocol {
    fn default() -> Self {
        Self::new()
    }
}

impl BacnetProtocol {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                ctx: RwLock::new(None),
                settings: RwLock::new(None),
                transport: Mutex::new(None),
                events: Mutex::new(None),
                discovery: Mutex::new(None),
                devices: RwLock::new(BTreeMap::new()),
                subscriptions: Mutex::new(BTreeMap::new()),
                counters: BacnetCounters::default(),
                packet_log: PacketLog::new(1000),
                next_process_id: AtomicU32::new(1),
            }),
        }
    }

    /// 广播 Who-Is；上下限都缺省时不带范围。
    pub fn send_who_is(&self, low: Option<u32>, high: Option<u32>) -> Result<(), BacnetError> {
        let range = match (low, high) {
            (None, None) => None,
            (low, high) => {
                let low = low.unwrap_or(0);
                let high = high.unwrap_or(MAX_INSTANCE);
                if low > high || high > MAX_INSTANCE {
                    return Err(BacnetError::InvalidArgument(format!(
                        "invalid who-is range {}..={}",
                        low, high
                    )));
                }
                Some((low, high))
            }
        };
        self.inner.send_who_is(range)
    }

    pub fn discovered_devices(&self) -> Vec<DiscoveredDevice> {
        self.inner.devices.read().values().cloned().collect()
    }

    pub fn read_property(
        &self,
        device_id: u32,
        reference: PropertyRef,
    ) -> Result<Vec<BacnetValue>, BacnetError> {
        self.inner.read_property(device_id, reference)
    }

    pub fn write_property(
        &self,
        device_id: u32,
        reference: PropertyRef,
        value: BacnetValue,
        priority: Option<u8>,
    ) -> Result<(), BacnetError> {
        self.inner.write_property(device_id, reference, value, priority)
    }

    /// 枚举设备对象：整表读取被拒时退回按下标逐项读取。
    pub fn get_device_objects(&self, device_id: u32) -> Result<Vec<ObjectDescriptor>, BacnetError> {
        let list = PropertyRef::new(ObjectId::device(device_id), property::OBJECT_LIST);
        let objects = match self.inner.read_property(device_id, list) {
            Ok(values) => object_ids(&values),
            Err(err) if err.is_protocol_level() => {
                if let Ok(ctx) = self.inner.context() {
                    ctx.logger().debug(
                        &format!(
                            "object-list of device {} not readable as a whole ({}), reading by index",
                            device_id, err
                        ),
                        LogCategory::Discovery,
                    );
                }
                let count = self.inner.read_property(device_id, list.at(0))?;
                let count = match count.first() {
                    Some(BacnetValue::Unsigned(n)) => *n,
                    other => {
                        return Err(BacnetError::UnexpectedResponse(format!(
                            "object-list length is {:?}",
                            other
                        )));
                    }
                };
                let mut objects = Vec::with_capacity(count as usize);
                for index in 1..=count {
                    let values = self.inner.read_property(device_id, list.at(index))?;
                    objects.extend(object_ids(&values));
                }
                objects
            }
            Err(err) => return Err(err),
        };

        Ok(objects
            .into_iter()
            .map(|object| {
                let name = self
                    .inner
                    .read_property(device_id, PropertyRef::new(object, property::OBJECT_NAME))
                    .ok()
                    .and_then(|values| values.into_iter().next())
                    .map(|value| value.to_string())
                    .unwrap_or_default();
                let value = self
                    .inner
                    .read_property(device_id, PropertyRef::new(object, property::PRESENT_VALUE))
                    .ok()
                    .and_then(|values| values.into_iter().next());
                ObjectDescriptor {
                    object,
                    name,
                    value,
                    timestamp_ms: now_epoch_ms(),
                }
            })
            .collect())
    }

    pub fn subscribe_cov(
        &self,
        device_id: u32,
        object_type: u16,
        object_instance: u32,
        lifetime_s: u32,
    ) -> Result<(), BacnetError> {
        self.inner.subscribe_cov(
            device_id,
            ObjectId::new(object_type, object_instance),
            lifetime_s,
        )
    }

    pub fn unsubscribe_cov(
        &self,
        device_id: u32,
        object_type: u16,
        object_instance: u32,
    ) -> Result<(), BacnetError> {
        self.inner
            .unsubscribe_cov(device_id, ObjectId::new(object_type, object_instance))
    }

    pub fn cov_subscriptions(&self) -> Vec<CovSubscription> {
        self.inner.subscriptions.lock().values().cloned().collect()
    }

    pub fn set_packet_logging(&self, enabled: bool) {
        self.inner.packet_log.set_enabled(enabled);
    }

    pub fn packet_log(&self) -> Vec<PacketLogEntry> {
        self.inner.packet_log.entries()
    }

    pub fn clear_packet_log(&self) {
        self.inner.packet_log.clear();
    }

    pub fn bacnet_statistics(&self) -> BacnetStatistics {
        self.inner.counters.snapshot()
    }

    /// 当前绑定的本地地址（未连接时为 None）
    pub fn local_address(&self) -> Option<SocketAddr> {
        self.inner
            .transport
            .lock()
            .as_ref()
            .map(|transport| transport.local_addr())
    }

    /// 诊断报告（格式化 JSON）
    pub fn diagnostics_report(&self) -> String {
        serde_json::to_string_pretty(&self.diagnostics_json())
            .unwrap_or_else(|err| format!("{{\"error\": \"{}\"}}", err))
    }
}

fn object_ids(values: &[BacnetValue]) -> Vec<ObjectId> {
    values
        .iter()
        .filter_map(|value| match value {
            BacnetValue::ObjectId(id) => Some(*id),
            _ => None,
        })
        .collect()
}

fn unexpected(apdu: &Apdu) -> BacnetError {
    BacnetError::UnexpectedResponse(format!("{:?}", apdu))
}

fn expect_simple_ack(apdu: Apdu, expected: u8) -> Result<(), BacnetError> {
    match apdu {
        Apdu::SimpleAck { service, .. } if service == expected => Ok(()),
        other => Err(unexpected(&other)),
    }
}

impl Inner {
    fn context(&self) -> Result<DriverContext, BacnetError> {
        self.ctx
            .read()
            .clone()
            .ok_or_else(|| BacnetError::NotConnected("driver is not initialized".to_string()))
    }

    fn settings(&self) -> Result<Arc<Settings>, BacnetError> {
        self.settings
            .read()
            .clone()
            .ok_or_else(|| BacnetError::NotConnected("driver is not initialized".to_string()))
    }

    fn transport(&self) -> Result<Arc<Transport>, BacnetError> {
        self.transport
            .lock()
            .clone()
            .ok_or_else(|| BacnetError::NotConnected("bacnet socket is not bound".to_string()))
    }

    fn connection_state(&self) -> ConnectionStatus {
        self.ctx
            .read()
            .as_ref()
            .map_or(ConnectionStatus::Disconnected, DriverContext::status)
    }

    /// 绑定套接字并注册 I-Am / COV 处理器。
    fn bind(self: &Arc<Self>, settings: &Settings) -> Result<Arc<Transport>, BacnetError> {
        let events = self
            .events
            .lock()
            .clone()
            .ok_or_else(|| BacnetError::NotConnected("discovery is not running".to_string()))?;

        let mut dispatcher = Dispatcher::default();
        let weak = Arc::downgrade(self);
        let announce = events.clone();
        dispatcher.on_unconfirmed(service::I_AM, move |source, data| {
            if let Some(inner) = weak.upgrade() {
                inner.on_i_am(source, data, &announce);
            }
            Ok(())
        });
        let on_cov = move |_source: SocketAddr, data: &[u8]| -> Result<(), u8> {
            let notification =
                CovNotification::decode(data).map_err(|_| codec::reject_reason::INVALID_TAG)?;
            let _ = events.send(Event::Cov(notification));
            Ok(())
        };
        dispatcher.on_confirmed(service::CONFIRMED_COV_NOTIFICATION, on_cov.clone());
        dispatcher.on_unconfirmed(service::UNCONFIRMED_COV_NOTIFICATION, on_cov);

        let name = self.context().map(|ctx| ctx.device_id()).unwrap_or_default();
        let transport = Transport::bind(settings.transport_config(), dispatcher, &name)?;
        if let Ok(ctx) = self.context() {
            ctx.logger().info(
                &format!(
                    "bacnet socket bound on {} (target {} device {})",
                    transport.local_addr(),
                    settings.target,
                    settings.device_instance
                ),
                LogCategory::Connection,
            );
        }
        Ok(Arc::new(transport))
    }

    /// I/O 线程上执行：只更新设备表并投递事件。
    fn on_i_am(&self, source: SocketAddr, data: &[u8], announce: &Sender<Event>) {
        let i_am = match IAm::decode(data) {
            Ok(i_am) => i_am,
            Err(err) => {
                tracing::debug!(target: "collector.bacnet", source = %source, error = %err, "ignoring malformed i-am");
                return;
            }
        };
        self.counters.record_i_am();
        let instance = i_am.device.instance;
        let is_new = {
            let mut devices = self.devices.write();
            let is_new = !devices.contains_key(&instance);
            let device = devices.entry(instance).or_insert_with(|| DiscoveredDevice {
                device_id: instance,
                name: String::new(),
                ip_address: source.ip(),
                port: source.port(),
                max_apdu_length: 0,
                segmentation_supported: false,
                vendor_id: 0,
                last_seen_ms: 0,
            });
            device.ip_address = source.ip();
            device.port = source.port();
            device.max_apdu_length = i_am.max_apdu;
            device.segmentation_supported = i_am.segmentation != NO_SEGMENTATION;
            device.vendor_id = i_am.vendor_id;
            device.last_seen_ms = now_epoch_ms();
            is_new
        };
        if is_new {
            if let Ok(ctx) = self.context() {
                ctx.logger().info(
                    &format!("discovered bacnet device {} at {}", instance, source),
                    LogCategory::Discovery,
                );
            }
            let _ = announce.send(Event::Announced(instance));
        }
    }

    /// 配置的目标设备优先使用配置地址，其余设备取发现表。
    fn device_address(&self, device_id: u32) -> Result<SocketAddr, BacnetError> {
        let settings = self.settings()?;
        if device_id == settings.device_instance {
            return Ok(settings.target);
        }
        self.devices
            .read()
            .get(&device_id)
            .map(|device| SocketAddr::new(device.ip_address, device.port))
            .ok_or(BacnetError::UnknownDevice(device_id))
    }

    fn send_who_is(self: &Arc<Self>, range: Option<(u32, u32)>) -> Result<(), BacnetError> {
        let settings = self.settings()?;
        let transport = self.transport()?;
        let apdu = Apdu::UnconfirmedRequest {
            service: service::WHO_IS,
            data: codec::encode_who_is(range),
        };
        if let Err(err) = transport.send_unconfirmed(settings.broadcast, true, &apdu) {
            if matches!(err, BacnetError::Socket(_) | BacnetError::Closed) {
                self.counters.record_failure(&err);
                self.recover(&transport, &err);
            }
            return Err(err);
        }
        self.counters.record_who_is();
        if let Ok(ctx) = self.context() {
            ctx.logger().debug(
                &format!("who-is sent to {}", settings.broadcast),
                LogCategory::Discovery,
            );
        }
        Ok(())
    }

    /// 确认型请求；错误类 PDU 转为错误，套接字失败触发重新绑定。
    fn confirmed(
        self: &Arc<Self>,
        destination: SocketAddr,
        service_choice: u8,
        data: bytes::Bytes,
    ) -> Result<Apdu, BacnetError> {
        let transport = self.transport()?;
        match transport.request(destination, service_choice, data) {
            Ok(Apdu::Error { class, code, .. }) => Err(BacnetError::ErrorPdu { class, code }),
            Ok(Apdu::Reject { reason, .. }) => Err(BacnetError::Reject(reason)),
            Ok(Apdu::Abort { reason, .. }) => Err(BacnetError::Abort(reason)),
            Ok(apdu) => Ok(apdu),
            Err(err @ (BacnetError::Socket(_) | BacnetError::Closed)) => {
                self.recover(&transport, &err);
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// 丢弃失效的 I/O 线程；仍处于 CONNECTED 时按固定间隔重新绑定。
    fn recover(self: &Arc<Self>, failed: &Arc<Transport>, err: &BacnetError) {
        {
            let mut slot = self.transport.lock();
            match slot.as_ref() {
                Some(current) if Arc::ptr_eq(current, failed) => *slot = None,
                _ => return,
            }
        }
        failed.shutdown();

        let (Ok(ctx), Ok(settings)) = (self.context(), self.settings()) else {
            return;
        };
        if ctx.status() != ConnectionStatus::Connected || ctx.stop_requested() {
            return;
        }
        let reason = format!("bacnet socket failure: {}", err);
        let rebound = reconnect_with_fixed_delay(&ctx, &settings.reconnect, &reason, |_| {
            self.bind(&settings).map_err(DriverError::from)
        });
        if let Ok(transport) = rebound {
            *self.transport.lock() = Some(transport);
        }
    }

    fn begin(&self, operation: Operation, device_id: u32, reference: &PropertyRef) -> Instant {
        self.counters.record_request(operation);
        if self.packet_log.is_enabled() {
            self.packet_log.record(packet_entry(
                PacketDirection::Tx,
                device_id,
                reference,
                None,
                0.0,
                String::new(),
            ));
        }
        Instant::now()
    }

    #[allow(clippy::too_many_arguments)]
    fn finish<T>(
        &self,
        operation: Operation,
        service_name: &str,
        device_id: u32,
        reference: &PropertyRef,
        started: Instant,
        result: &Result<T, BacnetError>,
        describe: impl Fn(&T) -> String,
    ) {
        let elapsed = started.elapsed();
        let error = result.as_ref().err().map(ToString::to_string);
        match result {
            Ok(_) => self.counters.record_success(operation),
            Err(err) => {
                self.counters.record_failure(err);
                if err.is_protocol_level() {
                    record_protocol_exception();
                }
                if matches!(err, BacnetError::Timeout { .. }) {
                    record_timeout();
                }
            }
        }
        if let Ok(ctx) = self.context() {
            ctx.logger().log_bacnet_operation(
                service_name,
                &format!("device {} {}", device_id, reference),
                result.is_ok(),
                elapsed.as_millis() as u64,
                error.as_deref(),
            );
        }
        if self.packet_log.is_enabled() {
            let decoded = result.as_ref().map(describe).unwrap_or_default();
            self.packet_log.record(packet_entry(
                PacketDirection::Rx,
                device_id,
                reference,
                error,
                elapsed.as_secs_f64() * 1000.0,
                decoded,
            ));
        }
    }

    fn read_property(
        self: &Arc<Self>,
        device_id: u32,
        reference: PropertyRef,
    ) -> Result<Vec<BacnetValue>, BacnetError> {
        let started = self.begin(Operation::Read, device_id, &reference);
        let result = self
            .device_address(device_id)
            .and_then(|destination| {
                let data = reference.encode_read()?;
                self.confirmed(destination, service::READ_PROPERTY, data)
            })
            .and_then(|apdu| match apdu {
                Apdu::ComplexAck {
                    service: service::READ_PROPERTY,
                    data,
                    ..
                } => Ok(ReadPropertyAck::decode(&data)?.values),
                other => Err(unexpected(&other)),
            });
        self.finish(
            Operation::Read,
            "ReadProperty",
            device_id,
            &reference,
            started,
            &result,
            |values| {
                values
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(",")
            },
        );
        result
    }

    fn write_property(
        self: &Arc<Self>,
        device_id: u32,
        reference: PropertyRef,
        value: BacnetValue,
        priority: Option<u8>,
    ) -> Result<(), BacnetError> {
        if let Some(priority) = priority
            && !(1..=16).contains(&priority)
        {
            return Err(BacnetError::InvalidArgument(format!(
                "write priority {} outside 1..=16",
                priority
            )));
        }
        let started = self.begin(Operation::Write, device_id, &reference);
        let shown = value.to_string();
        let result = self
            .device_address(device_id)
            .and_then(|destination| {
                let data = WritePropertyRequest {
                    property: reference,
                    value,
                    priority,
                }
                .encode()?;
                self.confirmed(destination, service::WRITE_PROPERTY, data)
            })
            .and_then(|apdu| expect_simple_ack(apdu, service::WRITE_PROPERTY));
        self.finish(
            Operation::Write,
            "WriteProperty",
            device_id,
            &reference,
            started,
            &result,
            |_| shown.clone(),
        );
        result
    }

    fn subscribe_cov(
        self: &Arc<Self>,
        device_id: u32,
        object: ObjectId,
        lifetime_s: u32,
    ) -> Result<(), BacnetError> {
        let key = (device_id, object);
        // 续订沿用原进程号
        let process_id = self
            .subscriptions
            .lock()
            .get(&key)
            .map(|subscription| subscription.process_id)
            .unwrap_or_else(|| self.next_process_id.fetch_add(1, Ordering::Relaxed));

        let reference = PropertyRef::new(object, property::PRESENT_VALUE);
        let started = self.begin(Operation::Subscribe, device_id, &reference);
        let result = self
            .device_address(device_id)
            .and_then(|destination| {
                let data = SubscribeCov {
                    process_id,
                    object,
                    lifetime: Some((false, lifetime_s)),
                }
                .encode()?;
                self.confirmed(destination, service::SUBSCRIBE_COV, data)
            })
            .and_then(|apdu| expect_simple_ack(apdu, service::SUBSCRIBE_COV));
        self.finish(
            Operation::Subscribe,
            "SubscribeCOV",
            device_id,
            &reference,
            started,
            &result,
            |_| format!("lifetime {}s", lifetime_s),
        );
        result?;

        self.subscriptions.lock().insert(
            key,
            CovSubscription {
                device_id,
                object,
                process_id,
                lifetime_s,
                subscribed_at_ms: now_epoch_ms(),
            },
        );
        if let Ok(ctx) = self.context() {
            ctx.logger().info(
                &format!(
                    "cov subscription for device {} object {} (process {}, {}s)",
                    device_id, object, process_id, lifetime_s
                ),
                LogCategory::Subscription,
            );
        }
        Ok(())
    }

    fn unsubscribe_cov(self: &Arc<Self>, device_id: u32, object: ObjectId) -> Result<(), BacnetError> {
        let key = (device_id, object);
        let process_id = self
            .subscriptions
            .lock()
            .get(&key)
            .map(|subscription| subscription.process_id)
            .ok_or_else(|| {
                BacnetError::NotSubscribed(format!("device {} object {}", device_id, object))
            })?;

        let reference = PropertyRef::new(object, property::PRESENT_VALUE);
        let started = self.begin(Operation::Unsubscribe, device_id, &reference);
        let result = self
            .device_address(device_id)
            .and_then(|destination| {
                let data = SubscribeCov {
                    process_id,
                    object,
                    lifetime: None,
                }
                .encode()?;
                self.confirmed(destination, service::SUBSCRIBE_COV, data)
            })
            .and_then(|apdu| expect_simple_ack(apdu, service::SUBSCRIBE_COV));
        self.finish(
            Operation::Unsubscribe,
            "SubscribeCOV(cancel)",
            device_id,
            &reference,
            started,
            &result,
            |_| "cancelled".to_string(),
        );
        result?;

        self.subscriptions.lock().remove(&key);
        if let Ok(ctx) = self.context() {
            ctx.logger().info(
                &format!("cov subscription cancelled for device {} object {}", device_id, object),
                LogCategory::Subscription,
            );
        }
        Ok(())
    }

    /// 为配置点位涉及的对象订阅（或续订）COV。
    fn subscribe_points(self: &Arc<Self>, ctx: &DriverContext, settings: &Settings) {
        let objects: BTreeSet<ObjectId> = ctx
            .data_points()
            .iter()
            .filter_map(|point| point.bacnet_address.as_ref())
            .map(|address| ObjectId::new(address.object_type, address.object_instance))
            .collect();
        for object in objects {
            if let Err(err) =
                self.subscribe_cov(settings.device_instance, object, settings.cov_lifetime_s)
            {
                ctx.logger().warn(
                    &format!("cov subscription for {} failed: {}", object, err),
                    LogCategory::Subscription,
                );
            }
        }
    }

    fn handle_event(self: &Arc<Self>, ctx: &DriverContext, settings: &Settings, event: Event) {
        match event {
            Event::Announced(device_id) => {
                let reference =
                    PropertyRef::new(ObjectId::device(device_id), property::OBJECT_NAME);
                match self.read_property(device_id, reference) {
                    Ok(values) => {
                        let Some(name) = values.first() else {
                            return;
                        };
                        let mut devices = self.devices.write();
                        if let Some(device) = devices.get_mut(&device_id) {
                            device.name = name.to_string();
                        }
                    }
                    Err(err) => ctx.logger().debug(
                        &format!("object-name of device {} unavailable: {}", device_id, err),
                        LogCategory::Discovery,
                    ),
                }
            }
            Event::Cov(notification) => self.apply_cov(ctx, settings, notification),
        }
    }

    /// 已跟踪订阅的 COV 通知：更新匹配点位并推送快照。
    fn apply_cov(&self, ctx: &DriverContext, settings: &Settings, notification: CovNotification) {
        let device_id = notification.initiating_device.instance;
        let object = notification.monitored_object;
        let logger = ctx.logger();
        if !self.subscriptions.lock().contains_key(&(device_id, object)) {
            logger.debug(
                &format!(
                    "ignoring cov notification for untracked device {} object {}",
                    device_id, object
                ),
                LogCategory::Subscription,
            );
            return;
        }
        self.counters.record_cov_notification();
        record_cov_notification();

        let now = now_epoch_ms();
        let changed = if device_id == settings.device_instance {
            ctx.publish_update(|point| {
                let Some(address) = point.bacnet_address.as_ref() else {
                    return false;
                };
                if address.object_type != object.object_type
                    || address.object_instance != object.instance
                {
                    return false;
                }
                let Some(value) = notification
                    .values
                    .iter()
                    .find(|pv| {
                        pv.property == address.property_id && pv.array_index == address.array_index
                    })
                    .and_then(|pv| pv.values.first())
                else {
                    return false;
                };
                match to_data_value(value, point.data_type) {
                    Ok(raw) => {
                        let value = point.engineering_value(raw);
                        point.update(value, DataQuality::Good, now);
                        true
                    }
                    Err(err) => {
                        logger.warn(
                            &format!("cov value for point {} rejected: {}", point.id, err),
                            LogCategory::Subscription,
                        );
                        false
                    }
                }
            })
        } else {
            0
        };

        if self.packet_log.is_enabled() {
            let decoded = notification
                .values
                .iter()
                .find(|pv| pv.property == property::PRESENT_VALUE)
                .and_then(|pv| pv.values.first())
                .map(ToString::to_string)
                .unwrap_or_default();
            self.packet_log.record(packet_entry(
                PacketDirection::Rx,
                device_id,
                &PropertyRef::new(object, property::PRESENT_VALUE),
                None,
                0.0,
                decoded,
            ));
        }
        logger.debug(
            &format!("cov notification for {} updated {} point(s)", object, changed),
            LogCategory::Subscription,
        );
    }

    fn start_discovery(
        self: &Arc<Self>,
        ctx: DriverContext,
        settings: Arc<Settings>,
        events: Receiver<Event>,
    ) -> Result<(), BacnetError> {
        let stop = Arc::new(AtomicBool::new(false));
        let weak = Arc::downgrade(self);
        let flag = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name(format!("bacnet-discovery-{}", ctx.device_id()))
            .spawn(move || run_discovery(weak, ctx, settings, events, flag))?;
        *self.discovery.lock() = Some(Discovery { stop, handle });
        Ok(())
    }

    /// 先关套接字再停发现线程，阻塞中的请求随之以 Closed 返回。
    fn shutdown(&self) {
        let transport = self.transport.lock().take();
        if let Some(transport) = transport {
            transport.shutdown();
        }
        self.events.lock().take();
        let discovery = self.discovery.lock().take();
        if let Some(discovery) = discovery {
            discovery.stop.store(true, Ordering::Release);
            if discovery.handle.thread().id() != thread::current().id() {
                let _ = discovery.handle.join();
            }
        }
    }
}

fn packet_entry(
    direction: PacketDirection,
    device_id: u32,
    reference: &PropertyRef,
    error: Option<String>,
    latency_ms: f64,
    decoded_value: String,
) -> PacketLogEntry {
    PacketLogEntry {
        direction,
        timestamp_ms: now_epoch_ms(),
        device_id,
        object_type: reference.object.object_type,
        object_instance: reference.object.instance,
        property_id: reference.property,
        success: error.is_none(),
        error,
        latency_ms,
        decoded_value,
    }
}

fn run_discovery(
    weak: Weak<Inner>,
    ctx: DriverContext,
    settings: Arc<Settings>,
    events: Receiver<Event>,
    stop: Arc<AtomicBool>,
) {
    let renewal = Duration::from_secs(u64::from(settings.cov_lifetime_s / 2).max(1));
    let mut next_who_is = Instant::now();
    let mut next_renewal = Instant::now();

    while !stop.load(Ordering::Acquire) {
        let Some(inner) = weak.upgrade() else {
            break;
        };
        let now = Instant::now();
        if settings.who_is_enabled && now >= next_who_is {
            if let Err(err) = inner.send_who_is(None) {
                ctx.logger().warn(
                    &format!("who-is broadcast failed: {}", err),
                    LogCategory::Discovery,
                );
            }
            next_who_is = now + settings.who_is_interval;
        }
        if settings.cov_enabled && now >= next_renewal {
            inner.subscribe_points(&ctx, &settings);
            next_renewal = now + renewal;
        }
        drop(inner);

        match events.recv_timeout(DISCOVERY_TICK) {
            Ok(event) => {
                if let Some(inner) = weak.upgrade() {
                    inner.handle_event(&ctx, &settings, event);
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    ctx.logger()
        .debug("bacnet discovery stopped", LogCategory::Discovery);
}

impl ProtocolDriver for BacnetProtocol {
    fn name(&self) -> &'static str {
        "bacnet"
    }

    fn supports(&self, protocol: ProtocolType) -> bool {
        protocol == ProtocolType::BacnetIp
    }

    fn initialize_protocol(&self, ctx: &DriverContext) -> Result<(), DriverError> {
        let device = ctx.device_info();
        let settings = Settings::from_device(&device)?;

        self.inner
            .packet_log
            .set_capacity(device.bacnet_config.packet_log_capacity);
        self.inner.devices.write().clear();
        self.inner.subscriptions.lock().clear();
        ctx.logger().info(
            &format!(
                "bacnet configured for device {} at {}",
                settings.device_instance, settings.target
            ),
            LogCategory::General,
        );
        *self.inner.settings.write() = Some(Arc::new(settings));
        *self.inner.ctx.write() = Some(ctx.clone());
        Ok(())
    }

    fn connect_protocol(&self) -> Result<(), DriverError> {
        let ctx = self.inner.context()?;
        let settings = self.inner.settings()?;
        self.inner.shutdown();

        let (sender, receiver) = mpsc::channel();
        *self.inner.events.lock() = Some(sender);
        let transport = match self.inner.bind(&settings) {
            Ok(transport) => transport,
            Err(err) => {
                self.inner.events.lock().take();
                return Err(err.into());
            }
        };
        *self.inner.transport.lock() = Some(transport);
        if let Err(err) = self.inner.start_discovery(ctx, settings, receiver) {
            self.inner.shutdown();
            return Err(err.into());
        }
        Ok(())
    }

    fn disconnect_protocol(&self) {
        let bound = self.inner.transport.lock().is_some();
        self.inner.shutdown();
        if bound && let Ok(ctx) = self.inner.context() {
            ctx.logger()
                .debug("bacnet socket closed", LogCategory::Connection);
        }
    }

    fn read_data_protocol(
        &self,
        points: &[UnifiedDataPoint],
    ) -> Result<Vec<UnifiedDataPoint>, DriverError> {
        let ctx = self.inner.context()?;
        let settings = self.inner.settings()?;
        self.inner.transport()?;

        let logger = ctx.logger();
        let mut failures = 0usize;
        let snapshot: Vec<UnifiedDataPoint> = points
            .iter()
            .map(|point| {
                let mut point = point.clone();
                let read = point
                    .bacnet_address
                    .as_ref()
                    .ok_or_else(|| {
                        BacnetError::InvalidArgument(format!(
                            "point {} has no bacnet address",
                            point.id
                        ))
                    })
                    .and_then(|address| {
                        let mut reference = PropertyRef::new(
                            ObjectId::new(address.object_type, address.object_instance),
                            address.property_id,
                        );
                        reference.array_index = address.array_index;
                        self.inner.read_property(settings.device_instance, reference)
                    })
                    .and_then(|values| {
                        values.first().cloned().ok_or_else(|| {
                            BacnetError::UnexpectedResponse("empty property value".to_string())
                        })
                    })
                    .and_then(|value| to_data_value(&value, point.data_type));
                match read {
                    Ok(raw) => {
                        let value = point.engineering_value(raw);
                        point.update(value, DataQuality::Good, now_epoch_ms());
                    }
                    Err(err) => {
                        failures += 1;
                        logger.debug(
                            &format!("point {} read failed: {}", point.id, err),
                            LogCategory::DataProcessing,
                        );
                        point.mark_bad(now_epoch_ms());
                    }
                }
                point
            })
            .collect();

        if failures > 0 {
            logger.warn(
                &format!("{} of {} point(s) read with BAD quality", failures, points.len()),
                LogCategory::DataProcessing,
            );
        }
        Ok(snapshot)
    }

    fn write_value_protocol(
        &self,
        point: &UnifiedDataPoint,
        value: &DataValue,
    ) -> Result<(), DriverError> {
        let settings = self.inner.settings()?;
        let address = point.bacnet_address.as_ref().ok_or_else(|| {
            DriverError::Config(format!("point {} has no bacnet address", point.id))
        })?;
        let encoded = from_data_value(point, address.object_type, value)?;
        let mut reference = PropertyRef::new(
            ObjectId::new(address.object_type, address.object_instance),
            address.property_id,
        );
        reference.array_index = address.array_index;
        self.inner
            .write_property(settings.device_instance, reference, encoded, None)?;
        Ok(())
    }

    fn cleanup_protocol(&self) {
        self.inner.shutdown();
        self.inner.subscriptions.lock().clear();
        if let Ok(ctx) = self.inner.context() {
            ctx.logger()
                .info("bacnet resources released", LogCategory::General);
        }
    }

    fn diagnostics_json(&self) -> serde_json::Value {
        let settings = self.inner.settings().ok();
        json!({
            "protocol": "bacnet_ip",
            "connection_state": self.inner.connection_state().as_str(),
            "target": settings.as_ref().map(|s| s.target.to_string()),
            "device_instance": settings.as_ref().map(|s| s.device_instance),
            "local_address": self.local_address().map(|addr| addr.to_string()),
            "statistics": self.inner.counters.snapshot(),
            "discovered_devices": self.discovered_devices(),
            "cov_subscriptions": self.cov_subscriptions(),
            "packet_logging": self.inner.packet_log.is_enabled(),
            "packet_log_entries": self.inner.packet_log.len(),
        })
    }
}
