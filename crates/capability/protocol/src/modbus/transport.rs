//! Modbus 传输抽象：原生 tokio-modbus 同步客户端（串口按路径共享），或测试用的模拟从站。

use super::target::{ModbusTarget, SerialSettings};
use crate::error::ModbusError;
use domain::SerialParity;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tokio_modbus::client::sync::{self, Context, Reader, Writer};
use tokio_modbus::prelude::{Slave, SlaveContext};

/// 一个已建立的 Modbus 会话；所有调用阻塞至响应或超时。
pub trait ModbusTransport: Send {
    fn set_slave(&mut self, slave: u8);
    fn read_holding_registers(&mut self, address: u16, count: u16) -> Result<Vec<u16>, ModbusError>;
    fn read_input_registers(&mut self, address: u16, count: u16) -> Result<Vec<u16>, ModbusError>;
    fn read_coils(&mut self, address: u16, count: u16) -> Result<Vec<bool>, ModbusError>;
    fn read_discrete_inputs(&mut self, address: u16, count: u16) -> Result<Vec<bool>, ModbusError>;
    fn write_single_register(&mut self, address: u16, value: u16) -> Result<(), ModbusError>;
    fn write_multiple_registers(&mut self, address: u16, values: &[u16]) -> Result<(), ModbusError>;
    fn write_single_coil(&mut self, address: u16, value: bool) -> Result<(), ModbusError>;
    fn write_multiple_coils(&mut self, address: u16, values: &[bool]) -> Result<(), ModbusError>;
}

/// 会话工厂：每次（重）连接创建新会话。
pub trait ModbusConnector: Send + Sync {
    fn connect(
        &self,
        target: &ModbusTarget,
        timeout: Duration,
        slave: u8,
    ) -> Result<Box<dyn ModbusTransport>, ModbusError>;
}

/// tokio-modbus 同步客户端
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeConnector;

impl ModbusConnector for NativeConnector {
    fn connect(
        &self,
        target: &ModbusTarget,
        timeout: Duration,
        slave: u8,
    ) -> Result<Box<dyn ModbusTransport>, ModbusError> {
        match target {
            ModbusTarget::Tcp(addr) => {
                let context =
                    sync::tcp::connect_slave_with_timeout(*addr, Slave(slave), Some(timeout))
                        .map_err(ModbusError::from_io)?;
                Ok(Box::new(NativeTransport { context }))
            }
            ModbusTarget::Rtu(serial) => {
                let port = shared_serial(serial, timeout);
                port.ensure_open(slave)?;
                Ok(Box::new(SerialTransport { port, slave }))
            }
        }
    }
}

fn serial_builder(serial: &SerialSettings) -> tokio_serial::SerialPortBuilder {
    let parity = match serial.parity {
        SerialParity::None => tokio_serial::Parity::None,
        SerialParity::Even => tokio_serial::Parity::Even,
        SerialParity::Odd => tokio_serial::Parity::Odd,
    };
    let data_bits = match serial.data_bits {
        5 => tokio_serial::DataBits::Five,
        6 => tokio_serial::DataBits::Six,
        7 => tokio_serial::DataBits::Seven,
        _ => tokio_serial::DataBits::Eight,
    };
    let stop_bits = if serial.stop_bits == 2 {
        tokio_serial::StopBits::Two
    } else {
        tokio_serial::StopBits::One
    };
    tokio_serial::new(serial.path.as_str(), serial.baud_rate)
        .parity(parity)
        .data_bits(data_bits)
        .stop_bits(stop_bits)
        .timeout(Duration::from_millis(serial.byte_timeout_ms))
}

struct NativeTransport {
    context: Context,
}

/// 展开 tokio-modbus 的嵌套结果：外层为传输错误，内层为异常码。
fn flatten<T>(function: u8, result: tokio_modbus::Result<T>) -> Result<T, ModbusError> {
    match result {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(exception)) => Err(ModbusError::Exception {
            function,
            code: u8::from(exception),
        }),
        Err(tokio_modbus::Error::Transport(err)) => Err(ModbusError::from_io(err)),
        Err(err) => Err(ModbusError::Transport(err.to_string())),
    }
}

impl ModbusTransport for NativeTransport {
    fn set_slave(&mut self, slave: u8) {
        self.context.set_slave(Slave(slave));
    }

    fn read_holding_registers(&mut self, address: u16, count: u16) -> Result<Vec<u16>, ModbusError> {
        flatten(3, self.context.read_holding_registers(address, count))
    }

    fn read_input_registers(&mut self, address: u16, count: u16) -> Result<Vec<u16>, ModbusError> {
        flatten(4, self.context.read_input_registers(address, count))
    }

    fn read_coils(&mut self, address: u16, count: u16) -> Result<Vec<bool>, ModbusError> {
        flatten(1, self.context.read_coils(address, count))
    }

    fn read_discrete_inputs(&mut self, address: u16, count: u16) -> Result<Vec<bool>, ModbusError> {
        flatten(2, self.context.read_discrete_inputs(address, count))
    }

    fn write_single_register(&mut self, address: u16, value: u16) -> Result<(), ModbusError> {
        flatten(6, self.context.write_single_register(address, value))
    }

    fn write_multiple_registers(&mut self, address: u16, values: &[u16]) -> Result<(), ModbusError> {
        flatten(16, self.context.write_multiple_registers(address, values))
    }

    fn write_single_coil(&mut self, address: u16, value: bool) -> Result<(), ModbusError> {
        flatten(5, self.context.write_single_coil(address, value))
    }

    fn write_multiple_coils(&mut self, address: u16, values: &[bool]) -> Result<(), ModbusError> {
        flatten(15, self.context.write_multiple_coils(address, values))
    }
}

/// 一个串口路径上的客户端。串口只能被独占打开，同一路径上的所有会话复用它；
/// 传输错误后关闭，下一次请求时重新打开。串口参数与超时取首个打开者的配置。
struct SharedSerial {
    settings: SerialSettings,
    timeout: Duration,
    context: Mutex<Option<Context>>,
}

impl SharedSerial {
    fn open(&self, slave: u8) -> Result<Context, ModbusError> {
        let builder = serial_builder(&self.settings);
        sync::rtu::connect_slave_with_timeout(&builder, Slave(slave), Some(self.timeout))
            .map_err(ModbusError::from_io)
    }

    fn ensure_open(&self, slave: u8) -> Result<(), ModbusError> {
        let mut context = self.context.lock();
        if context.is_none() {
            *context = Some(self.open(slave)?);
        }
        Ok(())
    }
}

/// 按路径查找仍在使用的共享串口；最后一个会话释放后串口随之关闭。
fn shared_serial(serial: &SerialSettings, timeout: Duration) -> Arc<SharedSerial> {
    static PORTS: OnceLock<Mutex<HashMap<String, Weak<SharedSerial>>>> = OnceLock::new();
    let mut ports = PORTS.get_or_init(|| Mutex::new(HashMap::new())).lock();
    if let Some(port) = ports.get(&serial.path).and_then(Weak::upgrade) {
        return port;
    }
    ports.retain(|_, port| port.strong_count() > 0);
    let port = Arc::new(SharedSerial {
        settings: serial.clone(),
        timeout,
        context: Mutex::new(None),
    });
    ports.insert(serial.path.clone(), Arc::downgrade(&port));
    port
}

/// 共享串口上的一个从站会话：每次事务持有串口锁并切换从站地址。
struct SerialTransport {
    port: Arc<SharedSerial>,
    slave: u8,
}

impl SerialTransport {
    fn call<T, F>(&mut self, function: u8, request: F) -> Result<T, ModbusError>
    where
        F: FnOnce(&mut Context) -> tokio_modbus::Result<T>,
    {
        let mut slot = self.port.context.lock();
        if slot.is_none() {
            *slot = Some(self.port.open(self.slave)?);
        }
        let Some(context) = slot.as_mut() else {
            return Err(ModbusError::NotConnected("serial port is closed".to_string()));
        };
        context.set_slave(Slave(self.slave));
        let result = flatten(function, request(context));
        if matches!(&result, Err(err) if err.breaks_session()) {
            *slot = None;
        }
        result
    }
}

impl ModbusTransport for SerialTransport {
    fn set_slave(&mut self, slave: u8) {
        self.slave = slave;
    }

    fn read_holding_registers(&mut self, address: u16, count: u16) -> Result<Vec<u16>, ModbusError> {
        self.call(3, |context| context.read_holding_registers(address, count))
    }

    fn read_input_registers(&mut self, address: u16, count: u16) -> Result<Vec<u16>, ModbusError> {
        self.call(4, |context| context.read_input_registers(address, count))
    }

    fn read_coils(&mut self, address: u16, count: u16) -> Result<Vec<bool>, ModbusError> {
        self.call(1, |context| context.read_coils(address, count))
    }

    fn read_discrete_inputs(&mut self, address: u16, count: u16) -> Result<Vec<bool>, ModbusError> {
        self.call(2, |context| context.read_discrete_inputs(address, count))
    }

    fn write_single_register(&mut self, address: u16, value: u16) -> Result<(), ModbusError> {
        self.call(6, |context| context.write_single_register(address, value))
    }

    fn write_multiple_registers(&mut self, address: u16, values: &[u16]) -> Result<(), ModbusError> {
        self.call(16, |context| context.write_multiple_registers(address, values))
    }

    fn write_single_coil(&mut self, address: u16, value: bool) -> Result<(), ModbusError> {
        self.call(5, |context| context.write_single_coil(address, value))
    }

    fn write_multiple_coils(&mut self, address: u16, values: &[bool]) -> Result<(), ModbusError> {
        self.call(15, |context| context.write_multiple_coils(address, values))
    }
}

/// 共享同一串口的驱动通过同一把锁串行化事务。
pub fn bus_lock(path: &str) -> Arc<Mutex<()>> {
    static BUSES: OnceLock<Mutex<HashMap<String, Weak<Mutex<()>>>>> = OnceLock::new();
    let mut buses = BUSES.get_or_init(|| Mutex::new(HashMap::new())).lock();
    if let Some(lock) = buses.get(path).and_then(Weak::upgrade) {
        return lock;
    }
    buses.retain(|_, lock| lock.strong_count() > 0);
    let lock = Arc::new(Mutex::new(()));
    buses.insert(path.to_string(), Arc::downgrade(&lock));
    lock
}
