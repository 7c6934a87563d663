//! 协议驱动能力集合：每个协议实现一次，构造时选定。

use crate::context::DriverContext;
use crate::error::DriverError;
use domain::{DataValue, ProtocolType, UnifiedDataPoint};

/// 协议钩子。
///
/// 所有方法都在驱动自有线程或调用方线程上同步执行，I/O 以配置的超时为上限。
/// `read_data_protocol` 执行期间基类持有点位锁，实现不得在其中调用
/// [`DriverContext::publish_update`]；其间的状态迁移照常生效，回调推迟到锁释放后。
pub trait ProtocolDriver: Send + Sync + 'static {
    /// 协议名称（日志与诊断使用）。
    fn name(&self) -> &'static str;

    /// 是否支持该设备协议类型。
    fn supports(&self, protocol: ProtocolType) -> bool;

    /// 解析协议配置并保存上下文；不得发起 I/O。
    fn initialize_protocol(&self, ctx: &DriverContext) -> Result<(), DriverError>;

    /// 建立会话。状态迁移由基类负责。
    fn connect_protocol(&self) -> Result<(), DriverError>;

    /// 释放会话。
    fn disconnect_protocol(&self);

    /// 读取全部点位，返回完整快照；单点失败以 BAD 质量保留在结果中。
    fn read_data_protocol(
        &self,
        points: &[UnifiedDataPoint],
    ) -> Result<Vec<UnifiedDataPoint>, DriverError>;

    /// 单点同步写入。
    fn write_value_protocol(
        &self,
        point: &UnifiedDataPoint,
        value: &DataValue,
    ) -> Result<(), DriverError>;

    /// Stop 时释放全部协议资源。
    fn cleanup_protocol(&self);

    /// 协议诊断（JSON）。
    fn diagnostics_json(&self) -> serde_json::Value {
        serde_json::Value::Null
    }
}
