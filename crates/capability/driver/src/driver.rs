//! 统一驱动基类：生命周期、工作线程、轮询循环、回调与统计。

use crate::context::{DataCallback, DriverContext, PointTable, StatusCallback};
use crate::error::DriverError;
use crate::protocol::ProtocolDriver;
use collector_telemetry::{DriverLogger, LogCategory, record_poll_cycle, record_write};
use domain::{
    ConnectionStatus, DataValue, StatisticsSnapshot, UnifiedDataPoint, UnifiedDeviceInfo,
};
use parking_lot::Mutex;
use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// 与协议无关的驱动接口（驱动工厂返回的对象类型）。
pub trait CollectorDriver: Send + Sync {
    fn initialize(
        &self,
        device: UnifiedDeviceInfo,
        points: Vec<UnifiedDataPoint>,
    ) -> Result<(), DriverError>;
    fn start(&self) -> Result<(), DriverError>;
    fn stop(&self);
    fn set_data_callback(&self, callback: DataCallback);
    fn set_status_callback(&self, callback: StatusCallback);
    fn statistics(&self) -> StatisticsSnapshot;
    fn reset_statistics(&self);
    fn connection_status(&self) -> ConnectionStatus;
    fn is_running(&self) -> bool;
    fn device_info(&self) -> UnifiedDeviceInfo;
    fn data_points(&self) -> Vec<UnifiedDataPoint>;
    fn write_value(&self, point_id: &str, value: DataValue) -> Result<(), DriverError>;
    fn read_once(&self) -> Result<Vec<UnifiedDataPoint>, DriverError>;
    fn protocol_name(&self) -> &'static str;
    fn diagnostics_json(&self) -> serde_json::Value;
}

/// 统一驱动：持有一个协议实现和一条工作线程。
pub struct UnifiedDriver<P: ProtocolDriver> {
    protocol: Arc<P>,
    ctx: DriverContext,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<P: ProtocolDriver> UnifiedDriver<P> {
    pub fn new(protocol: P) -> Self {
        Self {
            protocol: Arc::new(protocol),
            ctx: DriverContext::new(),
            worker: Mutex::new(None),
        }
    }

    /// 替换日志协作者（默认输出到 tracing）。
    pub fn with_logger(self, logger: Arc<dyn DriverLogger>) -> Self {
        self.ctx.set_logger(logger);
        self
    }

    /// 协议专有操作入口。
    pub fn protocol(&self) -> &Arc<P> {
        &self.protocol
    }

    pub fn context(&self) -> &DriverContext {
        &self.ctx
    }

    /// 校验并保存配置，委托协议初始化；不发起 I/O。
    pub fn initialize(
        &self,
        device: UnifiedDeviceInfo,
        points: Vec<UnifiedDataPoint>,
    ) -> Result<(), DriverError> {
        if self.ctx.is_running() {
            return Err(DriverError::AlreadyRunning);
        }
        validate_device(&device)?;
        if !self.protocol.supports(device.protocol) {
            return Err(DriverError::Config(format!(
                "{} driver does not support protocol {}",
                self.protocol.name(),
                device.protocol
            )));
        }
        let table = PointTable::build(&device.id, points)?;
        let point_count = table.len();

        self.ctx.set_initialized(false);
        self.ctx.configure(device, table);
        self.ctx
            .force_status(ConnectionStatus::Disconnected, "driver initialized");

        if let Err(err) = self.protocol.initialize_protocol(&self.ctx) {
            self.ctx.logger().error(
                &format!("protocol initialization failed: {}", err),
                LogCategory::General,
            );
            return Err(err);
        }
        self.ctx.set_initialized(true);
        info!(
            target: "collector.driver",
            device_id = %self.ctx.device_id(),
            protocol = self.protocol.name(),
            points = point_count,
            "driver initialized"
        );
        Ok(())
    }

    /// 启动工作线程并立即返回；已运行时直接成功。
    pub fn start(&self) -> Result<(), DriverError> {
        if !self.ctx.is_initialized() {
            return Err(DriverError::NotInitialized);
        }
        let mut worker = self.worker.lock();
        if self.ctx.is_running() {
            return Ok(());
        }
        let device = self.ctx.device_info();
        if !device.enabled {
            return Err(DriverError::Config(format!("device {} is disabled", device.id)));
        }
        // 上一次因连接失败退出的线程
        if let Some(finished) = worker.take() {
            let _ = finished.join();
        }

        self.ctx.clear_stop_request();
        self.ctx.set_running(true);
        self.ctx.statistics().mark_started();

        let protocol = Arc::clone(&self.protocol);
        let ctx = self.ctx.clone();
        let spawned = thread::Builder::new()
            .name(format!("driver-{}", device.id))
            .spawn(move || run_worker(protocol, ctx));
        match spawned {
            Ok(handle) => {
                *worker = Some(handle);
                Ok(())
            }
            Err(err) => {
                self.ctx.set_running(false);
                Err(DriverError::Io(err))
            }
        }
    }

    /// 停止工作线程并清理协议资源；可重复调用。
    pub fn stop(&self) {
        let handle = self.worker.lock().take();
        let was_running = self.ctx.set_running(false);
        if handle.is_none()
            && !was_running
            && self.ctx.status() == ConnectionStatus::Disconnected
        {
            return;
        }

        self.ctx.request_stop();
        if let Some(handle) = handle {
            // 在回调中调用 Stop 时无法 join 自身
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
        self.protocol.cleanup_protocol();
        self.ctx
            .force_status(ConnectionStatus::Disconnected, "driver stopped");
        self.ctx.clear_stop_request();
        info!(
            target: "collector.driver",
            device_id = %self.ctx.device_id(),
            "driver stopped"
        );
    }

    pub fn set_data_callback<F>(&self, callback: F)
    where
        F: Fn(&UnifiedDeviceInfo, &[UnifiedDataPoint]) + Send + Sync + 'static,
    {
        self.ctx.set_data_callback(Some(Arc::new(callback)));
    }

    /// 读写周期内发生的状态通知在点位锁释放后回调，回调内可以读取点位表。
    pub fn set_status_callback<F>(&self, callback: F)
    where
        F: Fn(&UnifiedDeviceInfo, ConnectionStatus, &str) + Send + Sync + 'static,
    {
        self.ctx.set_status_callback(Some(Arc::new(callback)));
    }

    pub fn statistics(&self) -> StatisticsSnapshot {
        self.ctx.statistics().snapshot()
    }

    /// 运维显式清零基础统计。
    pub fn reset_statistics(&self) {
        self.ctx.statistics().reset();
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.ctx.status()
    }

    pub fn is_running(&self) -> bool {
        self.ctx.is_running()
    }

    pub fn device_info(&self) -> UnifiedDeviceInfo {
        self.ctx.device_info()
    }

    /// 点位快照；读周期进行中会等待其结束。
    pub fn data_points(&self) -> Vec<UnifiedDataPoint> {
        self.ctx.data_points()
    }

    /// 单点写入：独占点位表与传输句柄。
    pub fn write_value(&self, point_id: &str, value: DataValue) -> Result<(), DriverError> {
        if !self.ctx.is_initialized() {
            return Err(DriverError::NotInitialized);
        }
        let table = self.ctx.lock_points();
        let point = table
            .get(point_id)
            .ok_or_else(|| DriverError::PointNotFound(point_id.to_string()))?;
        if point.read_only {
            return Err(DriverError::ReadOnly(point_id.to_string()));
        }

        let started = Instant::now();
        let result = self.protocol.write_value_protocol(point, &value);
        drop(table);

        let success = result.is_ok();
        self.ctx.statistics().record_write(success);
        record_write(success);
        let logger = self.ctx.logger();
        match &result {
            Ok(()) => logger.debug(
                &format!("wrote {} to {}", value, point_id),
                LogCategory::DataProcessing,
            ),
            Err(err) => logger.error(
                &format!("write to {} failed: {}", point_id, err),
                LogCategory::DataProcessing,
            ),
        }
        logger.log_performance_metric("write_latency", elapsed_ms(started) as f64, "ms");
        result
    }

    /// 在调度之外执行一次读周期（统计与回调同轮询周期）。
    pub fn read_once(&self) -> Result<Vec<UnifiedDataPoint>, DriverError> {
        if !self.ctx.is_initialized() {
            return Err(DriverError::NotInitialized);
        }
        poll_cycle(self.protocol.as_ref(), &self.ctx)
    }

    /// 在阻塞线程池上执行一次读周期。
    pub async fn read_once_async(self: &Arc<Self>) -> Result<Vec<UnifiedDataPoint>, DriverError> {
        let driver = Arc::clone(self);
        tokio::task::spawn_blocking(move || driver.read_once())
            .await
            .map_err(|err| DriverError::Internal(format!("blocking read task failed: {}", err)))?
    }

    /// 在阻塞线程池上执行一次写入。
    pub async fn write_value_async(
        self: &Arc<Self>,
        point_id: impl Into<String>,
        value: DataValue,
    ) -> Result<(), DriverError> {
        let driver = Arc::clone(self);
        let point_id = point_id.into();
        tokio::task::spawn_blocking(move || driver.write_value(&point_id, value))
            .await
            .map_err(|err| DriverError::Internal(format!("blocking write task failed: {}", err)))?
    }
}

impl<P: ProtocolDriver> Drop for UnifiedDriver<P> {
    fn drop(&mut self) {
        self.stop();
    }
}

impl<P: ProtocolDriver> CollectorDriver for UnifiedDriver<P> {
    fn initialize(
        &self,
        device: UnifiedDeviceInfo,
        points: Vec<UnifiedDataPoint>,
    ) -> Result<(), DriverError> {
        UnifiedDriver::initialize(self, device, points)
    }

    fn start(&self) -> Result<(), DriverError> {
        UnifiedDriver::start(self)
    }

    fn stop(&self) {
        UnifiedDriver::stop(self)
    }

    fn set_data_callback(&self, callback: DataCallback) {
        self.ctx.set_data_callback(Some(callback));
    }

    fn set_status_callback(&self, callback: StatusCallback) {
        self.ctx.set_status_callback(Some(callback));
    }

    fn statistics(&self) -> StatisticsSnapshot {
        UnifiedDriver::statistics(self)
    }

    fn reset_statistics(&self) {
        UnifiedDriver::reset_statistics(self)
    }

    fn connection_status(&self) -> ConnectionStatus {
        UnifiedDriver::connection_status(self)
    }

    fn is_running(&self) -> bool {
        UnifiedDriver::is_running(self)
    }

    fn device_info(&self) -> UnifiedDeviceInfo {
        UnifiedDriver::device_info(self)
    }

    fn data_points(&self) -> Vec<UnifiedDataPoint> {
        UnifiedDriver::data_points(self)
    }

    fn write_value(&self, point_id: &str, value: DataValue) -> Result<(), DriverError> {
        UnifiedDriver::write_value(self, point_id, value)
    }

    fn read_once(&self) -> Result<Vec<UnifiedDataPoint>, DriverError> {
        UnifiedDriver::read_once(self)
    }

    fn protocol_name(&self) -> &'static str {
        self.protocol.name()
    }

    fn diagnostics_json(&self) -> serde_json::Value {
        self.protocol.diagnostics_json()
    }
}

fn validate_device(device: &UnifiedDeviceInfo) -> Result<(), DriverError> {
    if device.id.trim().is_empty() {
        return Err(DriverError::Config("device id is empty".to_string()));
    }
    if device.endpoint.trim().is_empty() {
        return Err(DriverError::Config(format!(
            "device {} has an empty endpoint",
            device.id
        )));
    }
    if device.poll_interval_ms == 0 {
        return Err(DriverError::Config(format!(
            "device {} has a zero poll interval",
            device.id
        )));
    }
    if device.timeout_ms == 0 {
        return Err(DriverError::Config(format!(
            "device {} has a zero timeout",
            device.id
        )));
    }
    Ok(())
}

fn run_worker<P: ProtocolDriver>(protocol: Arc<P>, ctx: DriverContext) {
    let device_id = ctx.device_id();
    let poll_interval = Duration::from_millis(ctx.device_info().poll_interval_ms);
    debug!(target: "collector.driver", device_id = %device_id, "worker started");

    // 直接调用协议操作时可能已惰性建立会话
    if !matches!(
        ctx.status(),
        ConnectionStatus::Disconnected | ConnectionStatus::Error
    ) {
        protocol.disconnect_protocol();
        ctx.force_status(
            ConnectionStatus::Disconnected,
            "resetting session before start",
        );
    }

    ctx.transition(ConnectionStatus::Connecting, "attempting connection");
    let started = Instant::now();
    if let Err(err) = protocol.connect_protocol() {
        ctx.transition(
            ConnectionStatus::Error,
            &format!("connection failed: {}", err),
        );
        ctx.set_running(false);
        warn!(
            target: "collector.driver",
            device_id = %device_id,
            error = %err,
            "worker exiting after connection failure"
        );
        return;
    }
    ctx.transition(ConnectionStatus::Connected, "connected successfully");
    ctx.logger()
        .log_performance_metric("connect_time", elapsed_ms(started) as f64, "ms");

    while ctx.is_running() {
        let _ = poll_cycle(protocol.as_ref(), &ctx);
        if ctx.wait_for_stop(poll_interval) {
            break;
        }
    }

    protocol.disconnect_protocol();
    ctx.transition(ConnectionStatus::Disconnected, "worker stopped");
    debug!(target: "collector.driver", device_id = %device_id, "worker exited");
}

/// 一次读周期：total_reads 恒加一，非空结果计成功，空结果或错误计失败。
fn poll_cycle<P: ProtocolDriver>(
    protocol: &P,
    ctx: &DriverContext,
) -> Result<Vec<UnifiedDataPoint>, DriverError> {
    let started = Instant::now();
    let mut table = ctx.lock_points();
    let result = catch_unwind(AssertUnwindSafe(|| {
        protocol.read_data_protocol(table.points())
    }))
    .unwrap_or_else(|panic| Err(DriverError::Internal(panic_message(panic))));

    match result {
        Ok(snapshot) if !snapshot.is_empty() => {
            table.apply(&snapshot);
            let current = table.points().to_vec();
            drop(table);
            ctx.statistics().record_read(true);
            record_poll_cycle(true);
            ctx.logger()
                .log_performance_metric("read_cycle", elapsed_ms(started) as f64, "ms");
            ctx.emit_data(&current);
            Ok(current)
        }
        Ok(_) => {
            drop(table);
            ctx.statistics().record_read(false);
            record_poll_cycle(false);
            ctx.logger()
                .warn("read cycle returned no data points", LogCategory::DataProcessing);
            Ok(Vec::new())
        }
        Err(err) => {
            drop(table);
            ctx.statistics().record_read(false);
            record_poll_cycle(false);
            ctx.report(ConnectionStatus::Error, &format!("read error: {}", err));
            Err(err)
        }
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("read cycle panicked: {}", message)
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("read cycle panicked: {}", message)
    } else {
        "read cycle panicked".to_string()
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}
