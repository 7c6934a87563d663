//! 驱动工厂：按协议类型构造驱动。

use crate::bacnet::{BacnetDriver, BacnetProtocol};
use crate::modbus::{ModbusDriver, ModbusProtocol, SimulatedDevice};
use collector_driver::{CollectorDriver, DriverError};
use collector_telemetry::DriverLogger;
use domain::{ProtocolType, UnifiedDataPoint, UnifiedDeviceInfo};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// 驱动构造函数
pub type DriverConstructor = Arc<dyn Fn() -> Box<dyn CollectorDriver> + Send + Sync>;

/// 协议类型到构造函数的注册表。
///
/// 默认注册 MODBUS_TCP、MODBUS_RTU、BACNET_IP；模拟模式下 Modbus 驱动连接到共享的模拟从站。
pub struct DriverFactory {
    constructors: HashMap<ProtocolType, DriverConstructor>,
}

impl Default for DriverFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl DriverFactory {
    pub fn new() -> Self {
        Self::build(None, None)
    }

    /// Modbus 驱动使用模拟从站。
    pub fn simulated(device: Arc<SimulatedDevice>) -> Self {
        Self::build(Some(device), None)
    }

    /// 所有默认驱动使用同一个日志协作者。
    pub fn with_logger(simulator: Option<Arc<SimulatedDevice>>, logger: Arc<dyn DriverLogger>) -> Self {
        Self::build(simulator, Some(logger))
    }

    /// 空注册表
    pub fn empty() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    fn build(simulator: Option<Arc<SimulatedDevice>>, logger: Option<Arc<dyn DriverLogger>>) -> Self {
        let mut factory = Self::empty();

        let modbus = {
            let logger = logger.clone();
            move || -> Box<dyn CollectorDriver> {
                let protocol = match &simulator {
                    Some(device) => ModbusProtocol::simulated(Arc::clone(device)),
                    None => ModbusProtocol::new(),
                };
                let driver = ModbusDriver::new(protocol);
                match &logger {
                    Some(logger) => Box::new(driver.with_logger(Arc::clone(logger))),
                    None => Box::new(driver),
                }
            }
        };
        let modbus: DriverConstructor = Arc::new(modbus);
        factory
            .constructors
            .insert(ProtocolType::ModbusTcp, Arc::clone(&modbus));
        factory.constructors.insert(ProtocolType::ModbusRtu, modbus);

        factory.register(ProtocolType::BacnetIp, move || -> Box<dyn CollectorDriver> {
            let driver = BacnetDriver::new(BacnetProtocol::new());
            match &logger {
                Some(logger) => Box::new(driver.with_logger(Arc::clone(logger))),
                None => Box::new(driver),
            }
        });
        factory
    }

    /// 注册（或替换）某协议的构造函数。
    pub fn register<F>(&mut self, protocol: ProtocolType, constructor: F)
    where
        F: Fn() -> Box<dyn CollectorDriver> + Send + Sync + 'static,
    {
        self.constructors.insert(protocol, Arc::new(constructor));
    }

    pub fn supports(&self, protocol: ProtocolType) -> bool {
        self.constructors.contains_key(&protocol)
    }

    /// 已注册的协议，按名称排序
    pub fn supported_protocols(&self) -> Vec<ProtocolType> {
        let mut protocols: Vec<ProtocolType> = self.constructors.keys().copied().collect();
        protocols.sort_by_key(|protocol| protocol.to_string());
        protocols
    }

    /// 构造未初始化的驱动；未注册的协议返回配置错误。
    pub fn create(&self, protocol: ProtocolType) -> Result<Box<dyn CollectorDriver>, DriverError> {
        let constructor = self.constructors.get(&protocol).ok_or_else(|| {
            DriverError::Config(format!("no driver registered for protocol {}", protocol))
        })?;
        Ok(constructor())
    }

    /// 构造并初始化设备驱动（不启动）。
    pub fn create_for_device(
        &self,
        device: UnifiedDeviceInfo,
        points: Vec<UnifiedDataPoint>,
    ) -> Result<Box<dyn CollectorDriver>, DriverError> {
        let driver = self.create(device.protocol)?;
        let device_id = device.id.clone();
        let protocol = device.protocol;
        driver.initialize(device, points)?;
        info!(
            target: "collector.factory",
            device_id = %device_id,
            protocol = %protocol,
            driver = driver.protocol_name(),
            "driver created"
        );
        Ok(driver)
    }
}
