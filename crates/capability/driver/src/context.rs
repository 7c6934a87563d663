//! 驱动共享上下文：设备配置、点位表、统计、状态机与回调槽位。
//!
//! [`DriverContext`] 在初始化时交给协议实现，协议通过它迁移连接状态、
//! 读取设备配置、记录日志，以及在自有线程中推送主动上报（COV）的数据。

use crate::error::DriverError;
use crate::state::ConnectionStateMachine;
use collector_telemetry::{
    DriverLogger, LogCategory, TracingDriverLogger, record_data_callback, record_status_change,
};
use domain::{ConnectionStatus, DriverStatistics, UnifiedDataPoint, UnifiedDeviceInfo};
use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::warn;
use uuid::Uuid;

/// 数据回调：每个成功的轮询周期（或 COV 通知）推送全部点位快照。
pub type DataCallback = Arc<dyn Fn(&UnifiedDeviceInfo, &[UnifiedDataPoint]) + Send + Sync>;

/// 状态回调：每次状态迁移及每次可恢复的周期错误触发。
pub type StatusCallback = Arc<dyn Fn(&UnifiedDeviceInfo, ConnectionStatus, &str) + Send + Sync>;

/// 点位表：按配置顺序保存，附带 id 索引。
#[derive(Debug, Default)]
pub struct PointTable {
    points: Vec<UnifiedDataPoint>,
    index: HashMap<String, usize>,
}

impl PointTable {
    /// 校验并建立索引：id 唯一，device_id 为空时补齐，不一致时报错。
    pub fn build(device_id: &str, points: Vec<UnifiedDataPoint>) -> Result<Self, DriverError> {
        let mut table = PointTable {
            points: Vec::with_capacity(points.len()),
            index: HashMap::with_capacity(points.len()),
        };
        for mut point in points {
            if point.id.is_empty() {
                return Err(DriverError::Config("data point id is empty".to_string()));
            }
            if point.device_id.is_empty() {
                point.device_id = device_id.to_string();
            } else if point.device_id != device_id {
                return Err(DriverError::Config(format!(
                    "data point {} belongs to device {}, not {}",
                    point.id, point.device_id, device_id
                )));
            }
            if table.index.contains_key(&point.id) {
                return Err(DriverError::Config(format!(
                    "duplicate data point id: {}",
                    point.id
                )));
            }
            table.index.insert(point.id.clone(), table.points.len());
            table.points.push(point);
        }
        Ok(table)
    }

    pub fn points(&self) -> &[UnifiedDataPoint] {
        &self.points
    }

    pub fn get(&self, id: &str) -> Option<&UnifiedDataPoint> {
        self.index.get(id).map(|&idx| &self.points[idx])
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// 将读取结果的运行时字段写回表中（按 id 匹配）。
    pub fn apply(&mut self, snapshot: &[UnifiedDataPoint]) {
        for update in snapshot {
            if let Some(&idx) = self.index.get(&update.id) {
                let point = &mut self.points[idx];
                point.current_value = update.current_value.clone();
                point.quality = update.quality;
                point.last_update = update.last_update;
            }
        }
    }

    fn for_each_mut<F>(&mut self, mut apply: F) -> usize
    where
        F: FnMut(&mut UnifiedDataPoint) -> bool,
    {
        self.points
            .iter_mut()
            .map(|point| apply(point))
            .filter(|changed| *changed)
            .count()
    }
}

pub(crate) struct DriverShared {
    instance_id: Uuid,
    device: RwLock<UnifiedDeviceInfo>,
    points: Mutex<PointTable>,
    statistics: DriverStatistics,
    state: ConnectionStateMachine,
    data_callback: RwLock<Option<DataCallback>>,
    status_callback: RwLock<Option<StatusCallback>>,
    /// 点位锁被读写周期持有期间积压的状态通知
    deferred_status: Mutex<Option<Vec<(ConnectionStatus, String)>>>,
    logger: RwLock<Arc<dyn DriverLogger>>,
    custom_logger: AtomicBool,
    running: AtomicBool,
    initialized: AtomicBool,
    stop_requested: Mutex<bool>,
    stop_signal: Condvar,
}

/// 驱动上下文（廉价克隆）。
#[derive(Clone)]
pub struct DriverContext {
    shared: Arc<DriverShared>,
}

impl DriverContext {
    pub(crate) fn new() -> Self {
        let instance_id = Uuid::new_v4();
        Self {
            shared: Arc::new(DriverShared {
                instance_id,
                device: RwLock::new(UnifiedDeviceInfo::default()),
                points: Mutex::new(PointTable::default()),
                statistics: DriverStatistics::new(),
                state: ConnectionStateMachine::new(),
                data_callback: RwLock::new(None),
                status_callback: RwLock::new(None),
                deferred_status: Mutex::new(None),
                logger: RwLock::new(Arc::new(TracingDriverLogger::new(instance_id.to_string()))),
                custom_logger: AtomicBool::new(false),
                running: AtomicBool::new(false),
                initialized: AtomicBool::new(false),
                stop_requested: Mutex::new(false),
                stop_signal: Condvar::new(),
            }),
        }
    }

    /// 驱动实例 ID（日志关联用）。
    pub fn instance_id(&self) -> Uuid {
        self.shared.instance_id
    }

    /// 设备配置快照（含当前连接状态）。
    pub fn device_info(&self) -> UnifiedDeviceInfo {
        let mut device = self.shared.device.read().clone();
        device.status = self.status();
        device
    }

    pub fn device_id(&self) -> String {
        self.shared.device.read().id.clone()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.shared.state.current()
    }

    /// 点位快照；读周期进行中会等待其结束，不能在 `read_data_protocol` 内调用。
    pub fn data_points(&self) -> Vec<UnifiedDataPoint> {
        self.shared.points.lock().points().to_vec()
    }

    pub fn statistics(&self) -> &DriverStatistics {
        &self.shared.statistics
    }

    pub fn logger(&self) -> Arc<dyn DriverLogger> {
        Arc::clone(&self.shared.logger.read())
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    pub fn is_initialized(&self) -> bool {
        self.shared.initialized.load(Ordering::Acquire)
    }

    /// 校验后迁移状态；成功时记录日志并触发状态回调。
    pub fn transition(&self, to: ConnectionStatus, message: &str) -> bool {
        match self.shared.state.transition(to) {
            Ok(from) => {
                self.after_transition(from, to, message);
                true
            }
            Err(err) => {
                warn!(
                    target: "collector.driver",
                    device_id = %self.device_id(),
                    error = %err,
                    "rejected connection state transition"
                );
                false
            }
        }
    }

    /// 无条件写入状态并触发回调。
    pub fn force_status(&self, to: ConnectionStatus, message: &str) {
        let from = self.shared.state.force(to);
        self.after_transition(from, to, message);
    }

    /// 上报可恢复错误：只触发状态回调，不改变状态。
    pub fn report(&self, status: ConnectionStatus, message: &str) {
        self.logger().error(message, LogCategory::ErrorHandling);
        self.notify_status(status, message);
    }

    fn after_transition(&self, from: ConnectionStatus, to: ConnectionStatus, message: &str) {
        self.logger().log_connection_status_change(from, to, message);
        record_status_change();
        self.notify_status(to, message);
    }

    fn notify_status(&self, status: ConnectionStatus, message: &str) {
        if let Some(queue) = self.shared.deferred_status.lock().as_mut() {
            queue.push((status, message.to_string()));
            return;
        }
        self.invoke_status_callback(status, message);
    }

    fn invoke_status_callback(&self, status: ConnectionStatus, message: &str) {
        let callback = self.shared.status_callback.read().clone();
        if let Some(callback) = callback {
            callback(&self.device_info(), status, message);
        }
    }

    pub(crate) fn emit_data(&self, points: &[UnifiedDataPoint]) {
        let callback = self.shared.data_callback.read().clone();
        if let Some(callback) = callback {
            record_data_callback();
            callback(&self.device_info(), points);
        }
    }

    /// 在点位表上应用主动上报的更新，有变化时推送全部快照，返回变化的点位数。
    ///
    /// 只能在协议自有线程中调用：工作线程读周期持有点位锁。
    pub fn publish_update<F>(&self, apply: F) -> usize
    where
        F: FnMut(&mut UnifiedDataPoint) -> bool,
    {
        let mut table = self.shared.points.lock();
        let changed = table.for_each_mut(apply);
        if changed == 0 {
            return 0;
        }
        let snapshot = table.points().to_vec();
        drop(table);
        self.shared.statistics.touch();
        self.emit_data(&snapshot);
        changed
    }

    /// 可被 Stop 打断的等待；返回 true 表示已请求停止。
    ///
    /// 超时无法表示为时间点时（如 `Duration::MAX`）一直等到 Stop。
    pub fn wait_for_stop(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut requested = self.shared.stop_requested.lock();
        while !*requested {
            match deadline {
                Some(deadline) => {
                    if self
                        .shared
                        .stop_signal
                        .wait_until(&mut requested, deadline)
                        .timed_out()
                    {
                        break;
                    }
                }
                None => self.shared.stop_signal.wait(&mut requested),
            }
        }
        *requested
    }

    pub fn stop_requested(&self) -> bool {
        *self.shared.stop_requested.lock()
    }

    pub(crate) fn request_stop(&self) {
        let mut requested = self.shared.stop_requested.lock();
        *requested = true;
        self.shared.stop_signal.notify_all();
    }

    pub(crate) fn clear_stop_request(&self) {
        *self.shared.stop_requested.lock() = false;
    }

    pub(crate) fn set_running(&self, running: bool) -> bool {
        self.shared.running.swap(running, Ordering::AcqRel)
    }

    pub(crate) fn set_initialized(&self, initialized: bool) {
        self.shared.initialized.store(initialized, Ordering::Release);
    }

    /// 独占点位表；持有期间的状态通知在释放后按序回调。
    pub(crate) fn lock_points(&self) -> PointsGuard<'_> {
        let guard = self.shared.points.lock();
        *self.shared.deferred_status.lock() = Some(Vec::new());
        PointsGuard {
            guard,
            deferred: DeferredStatus {
                ctx: self,
                pending: Vec::new(),
            },
        }
    }

    pub(crate) fn configure(&self, device: UnifiedDeviceInfo, table: PointTable) {
        if !self.shared.custom_logger.load(Ordering::Acquire) {
            *self.shared.logger.write() = Arc::new(TracingDriverLogger::new(device.id.clone()));
        }
        *self.shared.device.write() = device;
        *self.shared.points.lock() = table;
    }

    pub(crate) fn set_logger(&self, logger: Arc<dyn DriverLogger>) {
        self.shared.custom_logger.store(true, Ordering::Release);
        *self.shared.logger.write() = logger;
    }

    pub(crate) fn set_data_callback(&self, callback: Option<DataCallback>) {
        *self.shared.data_callback.write() = callback;
    }

    pub(crate) fn set_status_callback(&self, callback: Option<StatusCallback>) {
        *self.shared.status_callback.write() = callback;
    }
}

/// 读写周期持有的点位锁。
///
/// 释放时先取走积压的状态通知，放开点位锁后再按序回调。
pub(crate) struct PointsGuard<'a> {
    guard: MutexGuard<'a, PointTable>,
    deferred: DeferredStatus<'a>,
}

struct DeferredStatus<'a> {
    ctx: &'a DriverContext,
    pending: Vec<(ConnectionStatus, String)>,
}

impl Deref for PointsGuard<'_> {
    type Target = PointTable;

    fn deref(&self) -> &PointTable {
        &self.guard
    }
}

impl DerefMut for PointsGuard<'_> {
    fn deref_mut(&mut self) -> &mut PointTable {
        &mut self.guard
    }
}

impl Drop for PointsGuard<'_> {
    fn drop(&mut self) {
        // 字段随后按声明顺序释放：guard 先于 deferred
        let pending = self.deferred.ctx.shared.deferred_status.lock().take();
        self.deferred.pending = pending.unwrap_or_default();
    }
}

impl Drop for DeferredStatus<'_> {
    fn drop(&mut self) {
        for (status, message) in self.pending.drain(..) {
            self.ctx.invoke_status_callback(status, &message);
        }
    }
}
