//! 采集进程：加载设备清单，经驱动工厂创建并启动驱动，周期输出统计，Ctrl-C 时全部停止。

mod devices;

use collector_config::CollectorConfig;
use collector_driver::CollectorDriver;
use collector_protocol::{DriverFactory, SimulatedDevice};
use collector_telemetry::{init_tracing_with, metrics};
use devices::DeviceEntry;
use domain::{ConnectionStatus, DataQuality, UnifiedDataPoint, UnifiedDeviceInfo};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 加载本地 .env（如存在）
    dotenvy::dotenv().ok();
    let config = CollectorConfig::from_env()?;
    init_tracing_with(&config.log_filter);

    let entries = devices::load(&config.devices_file, &config.overrides)?;
    let factory = if config.simulation {
        info!(target: "collector.app", "modbus devices use the in-process simulator");
        DriverFactory::simulated(SimulatedDevice::new())
    } else {
        DriverFactory::new()
    };

    let mut drivers: Vec<Arc<dyn CollectorDriver>> = Vec::new();
    for entry in entries {
        if !entry.device.enabled {
            info!(target: "collector.app", device_id = %entry.device.id, "device disabled, skipped");
            continue;
        }
        let device_id = entry.device.id.clone();
        match start_driver(&factory, entry) {
            Ok(driver) => drivers.push(driver),
            Err(err) => {
                warn!(target: "collector.app", device_id = %device_id, error = %err, "driver not started")
            }
        }
    }
    if drivers.is_empty() {
        warn!(target: "collector.app", "no driver running");
    } else {
        info!(target: "collector.app", drivers = drivers.len(), "collector running");
    }

    let stats_task = (config.stats_interval_secs > 0).then(|| {
        let drivers = drivers.clone();
        let period = Duration::from_secs(config.stats_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // 首个 tick 立即返回
            ticker.tick().await;
            loop {
                ticker.tick().await;
                log_statistics(&drivers);
            }
        })
    });

    tokio::signal::ctrl_c().await?;
    info!(target: "collector.app", "shutdown requested");
    if let Some(task) = stats_task {
        task.abort();
    }

    // stop 会 join 工作线程
    let stopping = drivers.clone();
    tokio::task::spawn_blocking(move || {
        for driver in &stopping {
            driver.stop();
        }
    })
    .await?;
    log_statistics(&drivers);
    info!(target: "collector.app", "collector stopped");
    Ok(())
}

fn start_driver(
    factory: &DriverFactory,
    entry: DeviceEntry,
) -> Result<Arc<dyn CollectorDriver>, collector_driver::DriverError> {
    let driver: Arc<dyn CollectorDriver> =
        Arc::from(factory.create_for_device(entry.device, entry.points)?);
    driver.set_data_callback(Arc::new(on_data));
    driver.set_status_callback(Arc::new(on_status));
    driver.start()?;
    Ok(driver)
}

fn on_data(device: &UnifiedDeviceInfo, points: &[UnifiedDataPoint]) {
    let good = points
        .iter()
        .filter(|point| point.quality == DataQuality::Good)
        .count();
    debug!(
        target: "collector.app",
        device_id = %device.id,
        points = points.len(),
        good,
        "data snapshot"
    );
    for point in points {
        debug!(
            target: "collector.app",
            device_id = %device.id,
            point_id = %point.id,
            value = ?point.current_value,
            quality = ?point.quality,
            unit = %point.unit,
            "point value"
        );
    }
}

fn on_status(device: &UnifiedDeviceInfo, status: ConnectionStatus, message: &str) {
    match status {
        ConnectionStatus::Error => warn!(
            target: "collector.app",
            device_id = %device.id,
            status = status.as_str(),
            detail = message,
            "device status changed"
        ),
        _ => info!(
            target: "collector.app",
            device_id = %device.id,
            status = status.as_str(),
            detail = message,
            "device status changed"
        ),
    }
}

fn log_statistics(drivers: &[Arc<dyn CollectorDriver>]) {
    for driver in drivers {
        let device = driver.device_info();
        let stats = driver.statistics();
        info!(
            target: "collector.app",
            device_id = %device.id,
            protocol = %device.protocol,
            status = driver.connection_status().as_str(),
            total_reads = stats.total_reads,
            failed_reads = stats.failed_reads,
            total_writes = stats.total_writes,
            success_rate = stats.success_rate(),
            "driver statistics"
        );
    }
    let totals = metrics().snapshot();
    info!(
        target: "collector.app",
        poll_cycles = totals.poll_cycles,
        poll_failures = totals.poll_failures,
        reconnect_attempts = totals.reconnect_attempts,
        timeouts = totals.timeouts,
        cov_notifications = totals.cov_notifications,
        "collector metrics"
    );
}
