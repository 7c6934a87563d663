//! 模拟从站：固定的寄存器映射 + 写入回读 + 故障注入。
//!
//! 未写入的地址按以下规则返回：
//! 保持寄存器 `start+i`，输入寄存器 `start+i+1000`，
//! 线圈 `(start+i) % 2`，离散输入 `(start+i+2000) % 2`。

use super::target::ModbusTarget;
use super::transport::{ModbusConnector, ModbusTransport};
use crate::error::ModbusError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

const MAX_REGISTERS: u16 = 125;
const MAX_BITS: u16 = 2000;

#[derive(Debug, Default)]
struct Faults {
    timeouts: u32,
    exception: Option<(u8, u32)>,
    refuse_connections: bool,
}

#[derive(Debug, Default)]
struct Memory {
    holding: HashMap<(u8, u16), u16>,
    coils: HashMap<(u8, u16), bool>,
}

/// 多个驱动可共享同一个模拟从站。
#[derive(Debug, Default)]
pub struct SimulatedDevice {
    memory: Mutex<Memory>,
    faults: Mutex<Faults>,
    connects: AtomicU32,
    requests: AtomicU32,
}

impl SimulatedDevice {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 接下来 `count` 次操作（连接或请求）超时。
    pub fn inject_timeouts(&self, count: u32) {
        self.faults.lock().timeouts = count;
    }

    /// 接下来 `count` 次请求返回异常码。
    pub fn inject_exception(&self, code: u8, count: u32) {
        self.faults.lock().exception = (count > 0).then_some((code, count));
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.faults.lock().refuse_connections = refuse;
    }

    pub fn clear_faults(&self) {
        *self.faults.lock() = Faults::default();
    }

    /// 连接尝试次数（含失败）
    pub fn connect_count(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn request_count(&self) -> u32 {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn holding_register(&self, slave: u8, address: u16) -> u16 {
        self.memory
            .lock()
            .holding
            .get(&(slave, address))
            .copied()
            .unwrap_or(address)
    }

    fn connect(&self) -> Result<(), ModbusError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let mut faults = self.faults.lock();
        if faults.timeouts > 0 {
            faults.timeouts -= 1;
            return Err(ModbusError::Timeout("simulated connect timeout".to_string()));
        }
        if faults.refuse_connections {
            return Err(ModbusError::Transport("simulated connection refused".to_string()));
        }
        Ok(())
    }

    fn check_request(&self, function: u8, address: u16, count: u16, limit: u16) -> Result<(), ModbusError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let mut faults = self.faults.lock();
        if faults.timeouts > 0 {
            faults.timeouts -= 1;
            return Err(ModbusError::Timeout("simulated response timeout".to_string()));
        }
        if let Some((code, remaining)) = faults.exception {
            faults.exception = (remaining > 1).then(|| (code, remaining - 1));
            return Err(ModbusError::Exception { function, code });
        }
        drop(faults);

        if count == 0 || count > limit {
            return Err(ModbusError::Exception { function, code: 3 });
        }
        if u32::from(address) + u32::from(count) > 0x1_0000 {
            return Err(ModbusError::Exception { function, code: 2 });
        }
        Ok(())
    }
}

/// 连接到共享模拟从站的工厂
#[derive(Debug, Clone)]
pub struct SimulatedConnector {
    device: Arc<SimulatedDevice>,
}

impl SimulatedConnector {
    pub fn new(device: Arc<SimulatedDevice>) -> Self {
        Self { device }
    }

    pub fn device(&self) -> &Arc<SimulatedDevice> {
        &self.device
    }
}

impl ModbusConnector for SimulatedConnector {
    fn connect(
        &self,
        _target: &ModbusTarget,
        _timeout: Duration,
        slave: u8,
    ) -> Result<Box<dyn ModbusTransport>, ModbusError> {
        self.device.connect()?;
        Ok(Box::new(SimulatedTransport {
            device: Arc::clone(&self.device),
            slave,
        }))
    }
}

struct SimulatedTransport {
    device: Arc<SimulatedDevice>,
    slave: u8,
}

impl SimulatedTransport {
    fn registers(&self, function: u8, address: u16, count: u16, base: u32) -> Result<Vec<u16>, ModbusError> {
        self.device.check_request(function, address, count, MAX_REGISTERS)?;
        let memory = self.device.memory.lock();
        Ok((0..count)
            .map(|i| {
                let addr = address + i;
                match (function, memory.holding.get(&(self.slave, addr))) {
                    (3, Some(&written)) => written,
                    _ => (u32::from(addr) + base) as u16,
                }
            })
            .collect())
    }

    fn bits(&self, function: u8, address: u16, count: u16, base: u32) -> Result<Vec<bool>, ModbusError> {
        self.device.check_request(function, address, count, MAX_BITS)?;
        let memory = self.device.memory.lock();
        Ok((0..count)
            .map(|i| {
                let addr = address + i;
                match (function, memory.coils.get(&(self.slave, addr))) {
                    (1, Some(&written)) => written,
                    _ => (u32::from(addr) + base) % 2 == 1,
                }
            })
            .collect())
    }
}

impl ModbusTransport for SimulatedTransport {
    fn set_slave(&mut self, slave: u8) {
        self.slave = slave;
    }

    fn read_holding_registers(&mut self, address: u16, count: u16) -> Result<Vec<u16>, ModbusError> {
        self.registers(3, address, count, 0)
    }

    fn read_input_registers(&mut self, address: u16, count: u16) -> Result<Vec<u16>, ModbusError> {
        self.registers(4, address, count, 1000)
    }

    fn read_coils(&mut self, address: u16, count: u16) -> Result<Vec<bool>, ModbusError> {
        self.bits(1, address, count, 0)
    }

    fn read_discrete_inputs(&mut self, address: u16, count: u16) -> Result<Vec<bool>, ModbusError> {
        self.bits(2, address, count, 2000)
    }

    fn write_single_register(&mut self, address: u16, value: u16) -> Result<(), ModbusError> {
        self.write_multiple_registers(address, &[value])
    }

    fn write_multiple_registers(&mut self, address: u16, values: &[u16]) -> Result<(), ModbusError> {
        let function = if values.len() == 1 { 6 } else { 16 };
        let count = u16::try_from(values.len()).unwrap_or(u16::MAX);
        self.device.check_request(function, address, count, MAX_REGISTERS)?;
        let mut memory = self.device.memory.lock();
        for (i, value) in (0u16..).zip(values) {
            memory.holding.insert((self.slave, address + i), *value);
        }
        Ok(())
    }

    fn write_single_coil(&mut self, address: u16, value: bool) -> Result<(), ModbusError> {
        self.write_multiple_coils(address, &[value])
    }

    fn write_multiple_coils(&mut self, address: u16, values: &[bool]) -> Result<(), ModbusError> {
        let function = if values.len() == 1 { 5 } else { 15 };
        let count = u16::try_from(values.len()).unwrap_or(u16::MAX);
        self.device.check_request(function, address, count, MAX_BITS)?;
        let mut memory = self.device.memory.lock();
        for (i, value) in (0u16..).zip(values) {
            memory.coils.insert((self.slave, address + i), *value);
        }
        Ok(())
    }
}
