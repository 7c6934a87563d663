//! 连接状态机：所有协议驱动共用的状态与迁移规则。

use domain::ConnectionStatus;
use std::sync::atomic::{AtomicU8, Ordering};

/// 非法迁移
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid connection transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: ConnectionStatus,
    pub to: ConnectionStatus,
}

/// 原子状态字段：任意线程可读，仅驱动自身的工作/连接逻辑写入。
#[derive(Debug)]
pub struct ConnectionStateMachine {
    state: AtomicU8,
}

impl ConnectionStateMachine {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(ConnectionStatus::Disconnected.as_u8()),
        }
    }

    pub fn current(&self) -> ConnectionStatus {
        ConnectionStatus::from_u8(self.state.load(Ordering::Acquire))
    }

    /// 自动迁移规则；DISCONNECTED 可由任意状态进入。
    pub fn is_allowed(from: ConnectionStatus, to: ConnectionStatus) -> bool {
        use ConnectionStatus::*;
        matches!(
            (from, to),
            (_, Disconnected)
                | (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Error)
                | (Connected, Reconnecting)
                | (Connected, Error)
                | (Reconnecting, Connected)
                | (Reconnecting, Error)
                | (Error, Connecting)
        )
    }

    /// 校验后迁移，返回迁移前的状态。
    pub fn transition(&self, to: ConnectionStatus) -> Result<ConnectionStatus, InvalidTransition> {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let from = ConnectionStatus::from_u8(current);
            if !Self::is_allowed(from, to) {
                return Err(InvalidTransition { from, to });
            }
            match self.state.compare_exchange(
                current,
                to.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(from),
                Err(actual) => current = actual,
            }
        }
    }

    /// 无条件写入（显式 Stop/Initialize 使用），返回旧状态。
    pub fn force(&self, to: ConnectionStatus) -> ConnectionStatus {
        ConnectionStatus::from_u8(self.state.swap(to.as_u8(), Ordering::AcqRel))
    }
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
