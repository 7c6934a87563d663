//! # 统一驱动框架
//!
//! 所有协议驱动共享的生命周期与连接状态机：
//!
//! ```text
//! Owner (DriverFactory)
//!       │ initialize → start
//!       ▼
//! UnifiedDriver<P: ProtocolDriver>
//!       │ worker thread
//!       ├── connect_protocol
//!       ├── loop: read_data_protocol → DataCallback → sleep(poll_interval)
//!       └── disconnect_protocol
//!       │
//!       ▼
//! DriverContext (状态机 / 点位表 / 统计 / 回调 / DriverLogger)
//! ```
//!
//! 连接失败时工作线程进入 ERROR 并退出，需外部重新 `start`；
//! 会话内的 I/O 失败由协议通过 [`reconnect_with_fixed_delay`] 处理。

mod context;
mod driver;
mod error;
mod protocol;
mod reconnect;
mod state;

pub use context::{DataCallback, DriverContext, PointTable, StatusCallback};
pub use driver::{CollectorDriver, UnifiedDriver};
pub use error::DriverError;
pub use protocol::ProtocolDriver;
pub use reconnect::reconnect_with_fixed_delay;
pub use state::{ConnectionStateMachine, InvalidTransition};
