//! 告警任务
//!
//! 后台线程阻塞在 `alerts_wait` 上，统计错误状态并把事件转成宿主回调。
//! bus-off 只记录，不自动恢复（宿主调用 `restart()`）。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use canmux_can::Alerts;
use canmux_manager::{CanManager, HostScheduler, ManagerError};
use tracing::{debug, error, info, trace, warn};

use crate::bus::BindingShared;
use crate::options::{irq_recv, irq_send};

pub const ALERT_THREAD_NAME: &str = "canmux-can-alerts";

/// 单次等待时长，也是退出请求的响应延迟上限
const ALERT_POLL: Duration = Duration::from_millis(100);

pub(crate) struct AlertTask {
    shutdown: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

impl AlertTask {
    pub fn spawn(manager: Arc<CanManager>, host: HostScheduler, shared: Arc<BindingShared>) -> std::io::Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = shutdown.clone();
        let thread = thread::Builder::new()
            .name(ALERT_THREAD_NAME.into())
            .spawn(move || alert_loop(&manager, &host, &shared, &flag))?;
        debug!("CAN alert task started");
        Ok(Self { shutdown, thread })
    }

    pub fn stop(self) {
        self.shutdown.store(true, Ordering::Release);
        if self.thread.join().is_err() {
            error!("CAN alert task panicked");
        }
    }
}

fn alert_loop(manager: &CanManager, host: &HostScheduler, shared: &BindingShared, shutdown: &AtomicBool) {
    while !shutdown.load(Ordering::Acquire) {
        match manager.alerts_wait(Alerts::ALL, ALERT_POLL) {
            Ok(alerts) => handle_alerts(alerts, host, shared),
            Err(ManagerError::Timeout) => {},
            Err(e) => {
                // 驱动未安装（其他客户端让总线停下）时等待
                trace!("alerts_wait failed: {}", e);
                thread::sleep(ALERT_POLL);
            },
        }
    }
    trace!("CAN alert task exited");
}

/// 把一组告警转换为计数与宿主回调
pub(crate) fn handle_alerts(alerts: Alerts, host: &HostScheduler, shared: &BindingShared) {
    let counters = &shared.counters;
    if alerts.contains(Alerts::BUS_OFF) {
        counters.num_bus_off.fetch_add(1, Ordering::Relaxed);
        error!("CAN bus-off detected; call restart() to recover");
    }
    if alerts.contains(Alerts::ERR_PASS) {
        counters.num_error_passive.fetch_add(1, Ordering::Relaxed);
        warn!("CAN controller is error-passive");
    }
    if alerts.contains(Alerts::ABOVE_ERR_WARN) {
        counters.num_error_warning.fetch_add(1, Ordering::Relaxed);
        warn!("CAN error counters above warning limit");
    }
    if alerts.contains(Alerts::BUS_RECOVERED) {
        info!("CAN bus recovered");
    }

    if let Some(callback) = shared.tx_callback() {
        for (alert, code) in [
            (Alerts::TX_IDLE, irq_send::TX_IDLE),
            (Alerts::TX_SUCCESS, irq_send::TX_SUCCESS),
            (Alerts::TX_FAILED, irq_send::TX_FAILED),
            (Alerts::TX_RETRIED, irq_send::TX_RETRIED),
        ] {
            if alerts.contains(alert) {
                shared.schedule(host, &callback, code);
            }
        }
    }

    if alerts.contains(Alerts::RX_FIFO_OVERRUN)
        && let Some(callback) = shared.rx_callback()
    {
        shared.schedule(host, &callback, irq_recv::FIFO_OVERRUN);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canmux_manager::HostCallback;
    use parking_lot::Mutex;

    fn recorder() -> (HostCallback, Arc<Mutex<Vec<i32>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callback: HostCallback = Arc::new(move |code: i32| sink.lock().push(code));
        (callback, seen)
    }

    #[test]
    fn test_error_alerts_are_counted() {
        let host = HostScheduler::default();
        let shared = BindingShared::default();
        handle_alerts(Alerts::BUS_OFF | Alerts::ERR_PASS, &host, &shared);
        handle_alerts(Alerts::ABOVE_ERR_WARN, &host, &shared);

        assert_eq!(shared.counters.num_bus_off.load(Ordering::Relaxed), 1);
        assert_eq!(shared.counters.num_error_passive.load(Ordering::Relaxed), 1);
        assert_eq!(shared.counters.num_error_warning.load(Ordering::Relaxed), 1);
        assert_eq!(host.pending(), 0, "no callbacks installed");
    }

    #[test]
    fn test_tx_alerts_map_to_irq_send_codes() {
        let host = HostScheduler::new(16);
        let shared = BindingShared::default();
        let (callback, seen) = recorder();
        shared.set_tx_callback(Some(callback));

        handle_alerts(Alerts::TX_SUCCESS | Alerts::TX_IDLE, &host, &shared);
        handle_alerts(Alerts::TX_FAILED | Alerts::TX_RETRIED, &host, &shared);
        host.run_pending();
        assert_eq!(*seen.lock(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_fifo_overrun_maps_to_irq_recv() {
        let host = HostScheduler::default();
        let shared = BindingShared::default();
        let (callback, seen) = recorder();
        shared.set_rx_callback(Some(callback));

        handle_alerts(Alerts::RX_FIFO_OVERRUN, &host, &shared);
        host.run_pending();
        assert_eq!(*seen.lock(), vec![irq_recv::FIFO_OVERRUN]);
    }
}
