//! BACnet/IP 驱动
//!
//! 仅支持非分段报文；服务覆盖 Who-Is/I-Am、ReadProperty、WriteProperty、SubscribeCOV 与 COV 通知。

pub mod codec;
mod driver;
mod packet_log;
mod stats;
mod transport;
mod value;

pub use codec::{ObjectId, PropertyRef};
pub use driver::{
    BacnetDriver, BacnetProtocol, CovSubscription, DEFAULT_BACNET_PORT, DiscoveredDevice,
    ObjectDescriptor, parse_endpoint,
};
pub use crate::packet_log::{PacketDirection, PacketLog};
pub use packet_log::PacketLogEntry;
pub use stats::BacnetStatistics;
pub use value::{BacnetValue, from_data_value, to_data_value};
