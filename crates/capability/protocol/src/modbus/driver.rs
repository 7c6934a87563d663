//! Modbus TCP/RTU 协议驱动
//!
//! 每个驱动独占一个会话（连接互斥锁保护）。直接调用的寄存器/线圈操作会按需惰性建立会话；
//! 处于 ERROR 时快速失败，需 Stop + Start 恢复。
//!
//! 失败分类：
//! - 异常码：计数 + 直方图，不改变连接状态
//! - 超时 / 传输错误：丢弃会话，固定间隔重连（CONNECTED -> RECONNECTING -> CONNECTED | ERROR）
//!
//! 诊断默认关闭；开启后记录按从站的请求与响应时间，并可选记录报文日志。

use super::registers::{decode_registers, encode_registers, register_width};
use super::simulated::{SimulatedConnector, SimulatedDevice};
use super::stats::{ModbusCounters, ModbusPacketEntry, ModbusStatistics, Operation};
use super::target::ModbusTarget;
use super::transport::{ModbusConnector, ModbusTransport, NativeConnector, bus_lock};
use crate::error::{ModbusError, exception_name};
use crate::packet_log::{PacketDirection, PacketLog};
use collector_driver::{
    DriverContext, DriverError, ProtocolDriver, UnifiedDriver, reconnect_with_fixed_delay,
};
use collector_telemetry::{LogCategory, record_protocol_exception, record_timeout};
use domain::{
    ConnectionStatus, DataQuality, DataType, DataValue, ProtocolType, ReconnectPolicy,
    UnifiedDataPoint, now_epoch_ms,
};
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use std::collections::BTreeMap;
use std::fmt::{self, Write as _};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// 诊断输出中列出的点位数量
const DIAGNOSTIC_POINTS: usize = 10;
/// 诊断输出中列出的最近报文数量
const DIAGNOSTIC_PACKETS: usize = 10;
/// 批量读重试退避步长（第 n 次重试前等待 n 倍）
const BULK_RETRY_STEP: Duration = Duration::from_millis(100);

pub type ModbusDriver = UnifiedDriver<ModbusProtocol>;

type Session = Option<Box<dyn ModbusTransport>>;

struct Settings {
    target: ModbusTarget,
    slave_id: u8,
    timeout: Duration,
    max_registers: u16,
    reconnect: ReconnectPolicy,
    /// RTU 共享总线锁
    bus: Option<Arc<Mutex<()>>>,
}

pub struct ModbusProtocol {
    connector: Arc<dyn ModbusConnector>,
    ctx: RwLock<Option<DriverContext>>,
    settings: RwLock<Option<Arc<Settings>>>,
    session: Mutex<Session>,
    counters: ModbusCounters,
    diagnostics: AtomicBool,
    packet_log: PacketLog<ModbusPacketEntry>,
}

impl Default for ModbusProtocol {
    fn default() -> Self {
        Self::new()
    }
}

impl ModbusProtocol {
    /// 使用 tokio-modbus 原生客户端。
    pub fn new() -> Self {
        Self::with_connector(Arc::new(NativeConnector))
    }

    pub fn with_connector(connector: Arc<dyn ModbusConnector>) -> Self {
        Self {
            connector,
            ctx: RwLock::new(None),
            settings: RwLock::new(None),
            session: Mutex::new(None),
            counters: ModbusCounters::default(),
            diagnostics: AtomicBool::new(false),
            packet_log: PacketLog::new(1000),
        }
    }

    /// 模拟模式：连接到给定的模拟从站。
    pub fn simulated(device: Arc<SimulatedDevice>) -> Self {
        Self::with_connector(Arc::new(SimulatedConnector::new(device)))
    }

    fn context(&self) -> Result<DriverContext, ModbusError> {
        self.ctx
            .read()
            .clone()
            .ok_or_else(|| ModbusError::NotConnected("driver is not initialized".to_string()))
    }

    fn settings(&self) -> Result<Arc<Settings>, ModbusError> {
        self.settings
            .read()
            .clone()
            .ok_or_else(|| ModbusError::NotConnected("driver is not initialized".to_string()))
    }

    pub fn read_holding_registers(
        &self,
        slave: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, ModbusError> {
        self.execute(3, slave, address, count, Operation::RegisterRead, |transport| {
            transport.read_holding_registers(address, count)
        })
    }

    pub fn read_input_registers(
        &self,
        slave: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, ModbusError> {
        self.execute(4, slave, address, count, Operation::RegisterRead, |transport| {
            transport.read_input_registers(address, count)
        })
    }

    pub fn read_coils(&self, slave: u8, address: u16, count: u16) -> Result<Vec<bool>, ModbusError> {
        self.execute(1, slave, address, count, Operation::CoilRead, |transport| {
            transport.read_coils(address, count)
        })
    }

    pub fn read_discrete_inputs(
        &self,
        slave: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<bool>, ModbusError> {
        self.execute(2, slave, address, count, Operation::CoilRead, |transport| {
            transport.read_discrete_inputs(address, count)
        })
    }

    pub fn write_holding_register(
        &self,
        slave: u8,
        address: u16,
        value: u16,
    ) -> Result<(), ModbusError> {
        self.execute(6, slave, address, 1, Operation::RegisterWrite, |transport| {
            transport.write_single_register(address, value)
        })
    }

    pub fn write_holding_registers(
        &self,
        slave: u8,
        address: u16,
        values: &[u16],
    ) -> Result<(), ModbusError> {
        let count = u16::try_from(values.len()).unwrap_or(u16::MAX);
        self.execute(16, slave, address, count, Operation::RegisterWrite, |transport| {
            transport.write_multiple_registers(address, values)
        })
    }

    pub fn write_coil(&self, slave: u8, address: u16, value: bool) -> Result<(), ModbusError> {
        self.execute(5, slave, address, 1, Operation::CoilWrite, |transport| {
            transport.write_single_coil(address, value)
        })
    }

    pub fn write_coils(&self, slave: u8, address: u16, values: &[bool]) -> Result<(), ModbusError> {
        let count = u16::try_from(values.len()).unwrap_or(u16::MAX);
        self.execute(15, slave, address, count, Operation::CoilWrite, |transport| {
            transport.write_multiple_coils(address, values)
        })
    }

    /// 分块批量读保持寄存器：按单次请求上限切块，每块失败后退避重试，共尝试 `max_attempts` 次。
    ///
    /// 任一块耗尽重试即整体失败；退避期间可被 Stop 打断。
    pub fn read_holding_registers_bulk(
        &self,
        slave: u8,
        start: u16,
        count: u16,
        max_attempts: u32,
    ) -> Result<Vec<u16>, ModbusError> {
        if u32::from(start) + u32::from(count) > 0x1_0000 {
            return Err(ModbusError::Conversion(format!(
                "register range {}+{} exceeds the address space",
                start, count
            )));
        }
        let ctx = self.context()?;
        let settings = self.settings()?;
        let attempts = max_attempts.max(1);

        let mut values = Vec::with_capacity(usize::from(count));
        let mut offset = 0u16;
        while offset < count {
            let address = start + offset;
            let chunk = (count - offset).min(settings.max_registers);
            let mut attempt = 1u32;
            let registers = loop {
                match self.read_holding_registers(slave, address, chunk) {
                    Ok(registers) => break registers,
                    Err(err) if attempt < attempts => {
                        ctx.logger().debug(
                            &format!(
                                "bulk read of {} register(s) at {} failed (attempt {}/{}): {}",
                                chunk, address, attempt, attempts, err
                            ),
                            LogCategory::ProtocolSpecific,
                        );
                        if ctx.wait_for_stop(BULK_RETRY_STEP.saturating_mul(attempt)) {
                            return Err(err);
                        }
                        attempt += 1;
                    }
                    Err(err) => return Err(err),
                }
            };
            values.extend(registers);
            offset += chunk;
        }
        Ok(values)
    }

    /// 单次请求：连接锁内执行，失败时分类处理。
    fn execute<T, F>(
        &self,
        function: u8,
        slave: u8,
        address: u16,
        count: u16,
        operation: Operation,
        mut request: F,
    ) -> Result<T, ModbusError>
    where
        T: fmt::Debug,
        F: FnMut(&mut dyn ModbusTransport) -> Result<T, ModbusError>,
    {
        let ctx = self.context()?;
        let settings = self.settings()?;
        let mut session = self.session.lock();
        self.ensure_connection(&ctx, &settings, &mut session)?;

        let packet = PacketHeader {
            slave,
            function,
            address,
            count,
        };
        if self.packet_log.is_enabled() {
            self.packet_log
                .record(packet.entry(PacketDirection::Tx, None, 0.0, String::new()));
        }
        let started = Instant::now();
        let result = match session.as_mut() {
            Some(transport) => {
                let _bus = settings.bus.as_ref().map(|bus| bus.lock());
                transport.set_slave(slave);
                request(&mut **transport)
            }
            None => Err(ModbusError::NotConnected("no active session".to_string())),
        };
        let elapsed = started.elapsed();
        let duration_ms = elapsed.as_millis() as u64;
        if self.is_diagnostics_enabled() {
            self.counters
                .record_slave_request(slave, result.is_ok(), duration_ms);
        }
        if self.packet_log.is_enabled() {
            let latency_ms = elapsed.as_secs_f64() * 1000.0;
            let entry = match &result {
                Ok(values) => packet.entry(
                    PacketDirection::Rx,
                    None,
                    latency_ms,
                    format!("{:?}", values),
                ),
                Err(err) => packet.entry(
                    PacketDirection::Rx,
                    Some(err.to_string()),
                    latency_ms,
                    String::new(),
                ),
            };
            self.packet_log.record(entry);
        }

        let logger = ctx.logger();
        match &result {
            Ok(_) => {
                self.counters.record_success(operation);
                logger.log_modbus_operation(function, address, count, true, duration_ms, None);
            }
            Err(err) => {
                logger.log_modbus_operation(
                    function,
                    address,
                    count,
                    false,
                    duration_ms,
                    Some(&err.to_string()),
                );
                self.handle_failure(&ctx, &settings, &mut session, err);
            }
        }
        result
    }

    fn ensure_connection(
        &self,
        ctx: &DriverContext,
        settings: &Settings,
        session: &mut Session,
    ) -> Result<(), ModbusError> {
        if session.is_some() {
            return Ok(());
        }
        match ctx.status() {
            ConnectionStatus::Error => Err(ModbusError::NotConnected(
                "connection is in ERROR state".to_string(),
            )),
            ConnectionStatus::Disconnected => {
                ctx.transition(ConnectionStatus::Connecting, "connecting on demand");
                match self.open(ctx, settings) {
                    Ok(transport) => {
                        *session = Some(transport);
                        ctx.transition(ConnectionStatus::Connected, "connected on demand");
                        Ok(())
                    }
                    Err(err) => {
                        ctx.transition(
                            ConnectionStatus::Error,
                            &format!("connection failed: {}", err),
                        );
                        Err(err)
                    }
                }
            }
            _ => {
                *session = Some(self.open(ctx, settings)?);
                Ok(())
            }
        }
    }

    fn open(
        &self,
        ctx: &DriverContext,
        settings: &Settings,
    ) -> Result<Box<dyn ModbusTransport>, ModbusError> {
        let result = self
            .connector
            .connect(&settings.target, settings.timeout, settings.slave_id);
        self.counters.record_connect(result.is_ok());
        let logger = ctx.logger();
        match &result {
            Ok(_) => logger.info(
                &format!("modbus session opened to {}", settings.target),
                LogCategory::Connection,
            ),
            Err(err) => {
                if err.is_timeout() {
                    self.counters.record_timeout();
                    record_timeout();
                }
                logger.warn(
                    &format!("modbus connect to {} failed: {}", settings.target, err),
                    LogCategory::Connection,
                );
            }
        }
        result
    }

    fn handle_failure(
        &self,
        ctx: &DriverContext,
        settings: &Settings,
        session: &mut Session,
        err: &ModbusError,
    ) {
        match err {
            ModbusError::Exception { function, code } => {
                self.counters.record_exception(*code);
                record_protocol_exception();
                ctx.logger().warn(
                    &format!(
                        "function {} rejected with exception {} ({})",
                        function,
                        code,
                        exception_name(*code)
                    ),
                    LogCategory::ProtocolSpecific,
                );
            }
            err if err.breaks_session() => {
                if err.is_timeout() {
                    self.counters.record_timeout();
                    record_timeout();
                }
                *session = None;
                if ctx.status() != ConnectionStatus::Connected {
                    return;
                }
                let reason = format!("modbus transport failure: {}", err);
                let reconnected = reconnect_with_fixed_delay(ctx, &settings.reconnect, &reason, |_| {
                    self.open(ctx, settings).map_err(DriverError::from)
                });
                if let Ok(transport) = reconnected {
                    *session = Some(transport);
                }
            }
            _ => {}
        }
    }

    fn read_point(
        &self,
        settings: &Settings,
        point: &UnifiedDataPoint,
    ) -> Result<DataValue, ModbusError> {
        let address = point.modbus_address.as_ref().ok_or_else(|| {
            ModbusError::Conversion(format!("point {} has no modbus address", point.id))
        })?;
        let slave = address.slave_id.unwrap_or(settings.slave_id);
        let start = address.register_address;
        let width = register_width(point);
        if width > settings.max_registers {
            return Err(ModbusError::Conversion(format!(
                "point {} needs {} registers, limit is {}",
                point.id, width, settings.max_registers
            )));
        }

        match address.function_code {
            3 => decode_registers(
                &self.read_holding_registers(slave, start, width)?,
                point.data_type,
            ),
            4 => decode_registers(
                &self.read_input_registers(slave, start, width)?,
                point.data_type,
            ),
            1 => first_bit(self.read_coils(slave, start, 1)?).map(|on| bit_value(point.data_type, on)),
            2 => first_bit(self.read_discrete_inputs(slave, start, 1)?)
                .map(|on| bit_value(point.data_type, on)),
            other => Err(ModbusError::UnsupportedFunction(other)),
        }
    }

    /// 开启诊断：按从站统计请求与响应时间，`packet_logging` 决定是否同时记录报文。
    pub fn enable_diagnostics(&self, packet_logging: bool) {
        self.diagnostics.store(true, Ordering::Release);
        self.packet_log.set_enabled(packet_logging);
        if let Ok(ctx) = self.context() {
            ctx.logger().info(
                &format!("modbus diagnostics enabled (packet_logging: {})", packet_logging),
                LogCategory::ProtocolSpecific,
            );
        }
    }

    /// 关闭诊断并丢弃诊断期间积累的记录。
    pub fn disable_diagnostics(&self) {
        self.diagnostics.store(false, Ordering::Release);
        self.packet_log.set_enabled(false);
        self.packet_log.clear();
        self.counters.clear_slaves();
        if let Ok(ctx) = self.context() {
            ctx.logger()
                .info("modbus diagnostics disabled", LogCategory::ProtocolSpecific);
        }
    }

    pub fn is_diagnostics_enabled(&self) -> bool {
        self.diagnostics.load(Ordering::Acquire)
    }

    /// 单独开关报文日志（不影响按从站统计）。
    pub fn set_packet_logging(&self, enabled: bool) {
        self.packet_log.set_enabled(enabled);
    }

    pub fn packet_log(&self) -> Vec<ModbusPacketEntry> {
        self.packet_log.entries()
    }

    pub fn clear_packet_log(&self) {
        self.packet_log.clear();
    }

    /// 协议计数器快照
    pub fn modbus_statistics(&self) -> ModbusStatistics {
        self.counters.snapshot()
    }

    /// 异常码直方图
    pub fn exception_codes(&self) -> BTreeMap<u8, u64> {
        self.counters.snapshot().exception_codes
    }

    pub fn reset_modbus_statistics(&self) {
        self.counters.reset();
        if let Ok(ctx) = self.context() {
            ctx.logger()
                .info("modbus statistics reset", LogCategory::Performance);
        }
    }

    fn connection_state(&self) -> ConnectionStatus {
        self.ctx
            .read()
            .as_ref()
            .map_or(ConnectionStatus::Disconnected, DriverContext::status)
    }

    fn statistics_value(&self) -> serde_json::Value {
        let stats = self.counters.snapshot();
        json!({
            "connection_state": self.connection_state().as_str(),
            "register_reads": stats.register_reads,
            "coil_reads": stats.coil_reads,
            "register_writes": stats.register_writes,
            "coil_writes": stats.coil_writes,
            "exceptions": stats.exceptions,
            "timeouts": stats.timeouts,
            "connections": stats.connections,
            "connection_failures": stats.connection_failures,
            "exception_codes": stats.exception_codes,
            "diagnostics_enabled": self.is_diagnostics_enabled(),
            "packet_logging": self.packet_log.is_enabled(),
            "packet_log_entries": self.packet_log.len(),
            "slaves": stats.slaves,
        })
    }

    /// 协议统计（JSON 字符串）
    pub fn modbus_statistics_json(&self) -> String {
        self.statistics_value().to_string()
    }

    /// 人类可读的诊断快照
    pub fn detailed_diagnostics(&self) -> String {
        let mut out = String::from("=== Modbus Driver Diagnostics ===\n");
        let Ok(ctx) = self.context() else {
            out.push_str("Driver not initialized\n");
            return out;
        };
        let device = ctx.device_info();
        let stats = self.counters.snapshot();

        let _ = writeln!(out, "Device: {} ({})", device.name, device.id);
        let _ = writeln!(out, "Protocol: {}", device.protocol);
        if let Ok(settings) = self.settings() {
            let _ = writeln!(out, "Target: {}", settings.target);
            let _ = writeln!(out, "Slave ID: {}", settings.slave_id);
            let _ = writeln!(out, "Response timeout: {} ms", settings.timeout.as_millis());
        }
        let _ = writeln!(out, "Connection: {}", device.status);
        let session = if self.session.lock().is_some() { "open" } else { "closed" };
        let _ = writeln!(out, "Session: {}", session);

        out.push_str("\n--- Statistics ---\n");
        let _ = writeln!(out, "Register reads: {}", stats.register_reads);
        let _ = writeln!(out, "Coil reads: {}", stats.coil_reads);
        let _ = writeln!(out, "Register writes: {}", stats.register_writes);
        let _ = writeln!(out, "Coil writes: {}", stats.coil_writes);
        let _ = writeln!(out, "Exceptions: {}", stats.exceptions);
        for (code, count) in &stats.exception_codes {
            let _ = writeln!(out, "  code {} ({}): {}", code, exception_name(*code), count);
        }
        let _ = writeln!(out, "Timeouts: {}", stats.timeouts);
        let _ = writeln!(
            out,
            "Connections: {} (failures: {})",
            stats.connections, stats.connection_failures
        );
        out.push_str("\n--- Diagnostics ---\n");
        if self.is_diagnostics_enabled() {
            let _ = writeln!(
                out,
                "Diagnostics: enabled (packet logging {})",
                if self.packet_log.is_enabled() { "on" } else { "off" }
            );
            for (slave, slave_stats) in &stats.slaves {
                let _ = writeln!(
                    out,
                    "  slave {}: {} request(s), {} failed, avg {:.1} ms, max {} ms, last {} ms",
                    slave,
                    slave_stats.requests,
                    slave_stats.failures,
                    slave_stats.avg_response_ms,
                    slave_stats.max_response_ms,
                    slave_stats.last_response_ms
                );
            }
        } else {
            out.push_str("Diagnostics: disabled\n");
        }
        let packets = self.packet_log.entries();
        if !packets.is_empty() {
            let _ = writeln!(
                out,
                "Recent packets (last {} of {}):",
                packets.len().min(DIAGNOSTIC_PACKETS),
                packets.len()
            );
            for packet in packets.iter().rev().take(DIAGNOSTIC_PACKETS).rev() {
                let _ = writeln!(
                    out,
                    "  {} slave={} fc={} addr={} count={} {} {:.2} ms {}",
                    packet.direction,
                    packet.slave_id,
                    packet.function_code,
                    packet.address,
                    packet.count,
                    if packet.success { "ok" } else { "failed" },
                    packet.latency_ms,
                    packet.error.as_deref().unwrap_or(&packet.values)
                );
            }
        }

        let base = ctx.statistics().snapshot();
        let _ = writeln!(
            out,
            "Reads: {}/{} ok, writes: {}/{} ok, success rate {:.1}%",
            base.successful_reads,
            base.total_reads,
            base.successful_writes,
            base.total_writes,
            base.success_rate()
        );

        let points = ctx.data_points();
        let _ = writeln!(
            out,
            "\n--- Data Points (first {} of {}) ---",
            points.len().min(DIAGNOSTIC_POINTS),
            points.len()
        );
        for point in points.iter().take(DIAGNOSTIC_POINTS) {
            let address = point
                .modbus_address
                .as_ref()
                .map(|addr| format!("fc={} addr={}", addr.function_code, addr.register_address))
                .unwrap_or_else(|| "no address".to_string());
            let _ = writeln!(
                out,
                "  {} [{}] {} type={} value={} quality={}",
                point.id, point.name, address, point.data_type, point.current_value, point.quality
            );
        }
        out
    }

    /// 自检：已连接时读 1 个保持寄存器，否则尝试一次新连接。
    pub fn test_connection(&self) -> bool {
        let (Ok(ctx), Ok(settings)) = (self.context(), self.settings()) else {
            return false;
        };
        let connected =
            ctx.status() == ConnectionStatus::Connected && self.session.lock().is_some();
        if connected {
            return match self.read_holding_registers(settings.slave_id, 0, 1) {
                Ok(_) | Err(ModbusError::Exception { .. }) => true,
                Err(_) => false,
            };
        }
        self.open(&ctx, &settings).is_ok()
    }
}

/// 一次请求的报文标识
#[derive(Clone, Copy)]
struct PacketHeader {
    slave: u8,
    function: u8,
    address: u16,
    count: u16,
}

impl PacketHeader {
    fn entry(
        self,
        direction: PacketDirection,
        error: Option<String>,
        latency_ms: f64,
        values: String,
    ) -> ModbusPacketEntry {
        ModbusPacketEntry {
            direction,
            timestamp_ms: now_epoch_ms(),
            slave_id: self.slave,
            function_code: self.function,
            address: self.address,
            count: self.count,
            success: error.is_none(),
            error,
            latency_ms,
            values,
        }
    }
}

fn first_bit(bits: Vec<bool>) -> Result<bool, ModbusError> {
    bits.first()
        .copied()
        .ok_or_else(|| ModbusError::Conversion("empty bit response".to_string()))
}

fn bit_value(data_type: DataType, on: bool) -> DataValue {
    data_type
        .wrap_raw(f64::from(u8::from(on)))
        .unwrap_or(DataValue::Bool(on))
}

impl ProtocolDriver for ModbusProtocol {
    fn name(&self) -> &'static str {
        "modbus"
    }

    fn supports(&self, protocol: ProtocolType) -> bool {
        matches!(protocol, ProtocolType::ModbusTcp | ProtocolType::ModbusRtu)
    }

    fn initialize_protocol(&self, ctx: &DriverContext) -> Result<(), DriverError> {
        let device = ctx.device_info();
        let target = ModbusTarget::from_device(&device)?;
        let bus = match &target {
            ModbusTarget::Rtu(serial) => Some(bus_lock(&serial.path)),
            ModbusTarget::Tcp(_) => None,
        };
        let settings = Settings {
            slave_id: device.modbus_config.slave_id,
            timeout: Duration::from_millis(device.timeout_ms),
            max_registers: device.modbus_config.max_registers_per_request.max(1),
            reconnect: device.reconnect.clone(),
            bus,
            target,
        };

        *self.session.lock() = None;
        self.packet_log
            .set_capacity(device.modbus_config.packet_log_capacity);
        ctx.logger().info(
            &format!(
                "modbus configured for {} (slave {})",
                settings.target, settings.slave_id
            ),
            LogCategory::General,
        );
        *self.settings.write() = Some(Arc::new(settings));
        *self.ctx.write() = Some(ctx.clone());
        Ok(())
    }

    fn connect_protocol(&self) -> Result<(), DriverError> {
        let ctx = self.context()?;
        let settings = self.settings()?;
        let mut session = self.session.lock();
        *session = None;
        *session = Some(self.open(&ctx, &settings)?);
        Ok(())
    }

    fn disconnect_protocol(&self) {
        if self.session.lock().take().is_some()
            && let Ok(ctx) = self.context()
        {
            ctx.logger()
                .debug("modbus session closed", LogCategory::Connection);
        }
    }

    fn read_data_protocol(
        &self,
        points: &[UnifiedDataPoint],
    ) -> Result<Vec<UnifiedDataPoint>, DriverError> {
        let ctx = self.context()?;
        let settings = self.settings()?;
        {
            let mut session = self.session.lock();
            self.ensure_connection(&ctx, &settings, &mut session)?;
        }

        let logger = ctx.logger();
        let mut failures = 0usize;
        let snapshot: Vec<UnifiedDataPoint> = points
            .iter()
            .map(|point| {
                let mut point = point.clone();
                match self.read_point(&settings, &point) {
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
        let settings = self.settings()?;
        let address = point.modbus_address.as_ref().ok_or_else(|| {
            DriverError::Config(format!("point {} has no modbus address", point.id))
        })?;
        let slave = address.slave_id.unwrap_or(settings.slave_id);
        let start = address.register_address;

        match address.function_code {
            1 | 5 | 15 => {
                let on = value.as_bool().ok_or_else(|| {
                    DriverError::Conversion(format!(
                        "cannot write {} to coil point {}",
                        value.type_name(),
                        point.id
                    ))
                })?;
                if address.function_code == 15 {
                    self.write_coils(slave, start, &[on])?;
                } else {
                    self.write_coil(slave, start, on)?;
                }
            }
            3 | 6 | 16 => {
                let registers = encode_registers(point, value)?;
                if registers.len() == 1 && address.function_code != 16 {
                    self.write_holding_register(slave, start, registers[0])?;
                } else {
                    self.write_holding_registers(slave, start, &registers)?;
                }
            }
            2 | 4 => {
                return Err(DriverError::ReadOnly(format!(
                    "{} (function code {} is read-only)",
                    point.id, address.function_code
                )));
            }
            other => return Err(ModbusError::UnsupportedFunction(other).into()),
        }
        Ok(())
    }

    fn cleanup_protocol(&self) {
        *self.session.lock() = None;
        if let Ok(ctx) = self.context() {
            ctx.logger()
                .info("modbus resources released", LogCategory::General);
        }
    }

    fn diagnostics_json(&self) -> serde_json::Value {
        let mut value = self.statistics_value();
        if let (Some(map), Ok(settings)) = (value.as_object_mut(), self.settings()) {
            map.insert("target".to_string(), json!(settings.target.to_string()));
            map.insert("slave_id".to_string(), json!(settings.slave_id));
        }
        value
    }
}
