//! 会话内固定间隔自动重连。

use crate::context::DriverContext;
use crate::error::DriverError;
use collector_telemetry::{LogCategory, record_reconnect_attempt};
use domain::{ConnectionStatus, ReconnectPolicy};
use std::time::Duration;

/// 已建立会话发生 I/O 失败后的重连序列：
/// CONNECTED -> RECONNECTING，最多 `max_attempts` 次（每次前等待 `delay_ms`），
/// 成功回到 CONNECTED，耗尽后进入 ERROR。未开启自动重连时直接进入 ERROR。
pub fn reconnect_with_fixed_delay<T, F>(
    ctx: &DriverContext,
    policy: &ReconnectPolicy,
    reason: &str,
    mut connect: F,
) -> Result<T, DriverError>
where
    F: FnMut(u32) -> Result<T, DriverError>,
{
    if !policy.auto_reconnect {
        ctx.transition(
            ConnectionStatus::Error,
            &format!("{}; auto reconnect disabled", reason),
        );
        return Err(DriverError::NotConnected(reason.to_string()));
    }

    ctx.transition(ConnectionStatus::Reconnecting, reason);
    let logger = ctx.logger();
    let mut last_error = None;
    for attempt in 1..=policy.max_attempts {
        if policy.delay_ms > 0 && ctx.wait_for_stop(Duration::from_millis(policy.delay_ms)) {
            last_error = Some(DriverError::NotConnected(
                "reconnect interrupted by stop".to_string(),
            ));
            break;
        }
        record_reconnect_attempt();
        match connect(attempt) {
            Ok(session) => {
                ctx.transition(
                    ConnectionStatus::Connected,
                    &format!("reconnected after {} attempt(s)", attempt),
                );
                return Ok(session);
            }
            Err(err) => {
                logger.warn(
                    &format!(
                        "reconnect attempt {}/{} failed: {}",
                        attempt, policy.max_attempts, err
                    ),
                    LogCategory::Connection,
                );
                last_error = Some(err);
            }
        }
    }

    ctx.transition(
        ConnectionStatus::Error,
        &format!("reconnect failed after {} attempt(s)", policy.max_attempts),
    );
    Err(last_error.unwrap_or_else(|| DriverError::NotConnected(reason.to_string())))
}
