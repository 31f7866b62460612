//! 内存虚拟控制器
//!
//! 完整实现 [`CanDriver`] 状态机，无需任何硬件，供测试和 `canmux-bridge --virtual` 使用。
//!
//! - 自收帧（`self_reception`）回送到本控制器的接收队列
//! - `NoAck` 模式下发送总是成功
//! - `Normal` 模式需要总线上有应答方（[`MockCanDriver::set_ack_partner`]），
//!   否则等待超时后返回 `NoAck` 并增加 TEC
//! - 测试钩子：[`inject_rx`](MockCanDriver::inject_rx)、
//!   [`trigger_bus_off`](MockCanDriver::trigger_bus_off)、
//!   [`fail_next`](MockCanDriver::fail_next)、调用日志 [`calls`](MockCanDriver::calls)

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, trace};

use crate::{
    Alerts, BusMode, BusState, CanDriver, CanError, CanFrame, DriverConfig, DriverStatus,
    deadline_after,
};

/// 调用日志条目（`receive` 不记录）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverCall {
    Install(BusMode),
    Uninstall,
    Start,
    Stop,
    Transmit,
    Recover,
}

/// 可注入故障的操作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverOp {
    Install,
    Start,
    Transmit,
    Receive,
}

/// 错误计数阈值（CAN 2.0）
const ERROR_WARNING_LIMIT: u32 = 96;
const ERROR_PASSIVE_LIMIT: u32 = 128;
const BUS_OFF_LIMIT: u32 = 256;

struct Controller {
    config: Option<DriverConfig>,
    status: DriverStatus,
    rx_queue: VecDeque<CanFrame>,
    pending_alerts: Alerts,
    ack_partner: bool,
    faults: Vec<(DriverOp, CanError)>,
    calls: Vec<DriverCall>,
    transmitted: Vec<CanFrame>,
}

impl Controller {
    fn raise(&mut self, alerts: Alerts) {
        if let Some(config) = &self.config {
            self.pending_alerts |= alerts & config.general.alerts;
        }
    }

    fn take_fault(&mut self, op: DriverOp) -> Option<CanError> {
        let index = self.faults.iter().position(|(o, _)| *o == op)?;
        Some(self.faults.remove(index).1)
    }

    fn rx_capacity(&self) -> usize {
        self.config
            .map(|c| c.general.rx_queue_len.max(1) as usize)
            .unwrap_or(1)
    }

    fn enqueue_rx(&mut self, frame: CanFrame) -> bool {
        if self.rx_queue.len() >= self.rx_capacity() {
            self.status.rx_missed_count += 1;
            self.raise(Alerts::RX_QUEUE_FULL);
            return false;
        }
        self.rx_queue.push_back(frame);
        self.raise(Alerts::RX_DATA);
        true
    }

    /// TEC 增加后按阈值产生告警
    fn bump_tec(&mut self, amount: u32) {
        let before = self.status.tx_error_counter;
        let after = before.saturating_add(amount);
        self.status.tx_error_counter = after;
        if before < ERROR_WARNING_LIMIT && after >= ERROR_WARNING_LIMIT {
            self.raise(Alerts::ABOVE_ERR_WARN);
        }
        if before < ERROR_PASSIVE_LIMIT && after >= ERROR_PASSIVE_LIMIT {
            self.raise(Alerts::ERR_PASS);
        }
        if after >= BUS_OFF_LIMIT {
            self.enter_bus_off();
        }
    }

    fn enter_bus_off(&mut self) {
        self.status.state = BusState::BusOff;
        self.status.tx_error_counter = self.status.tx_error_counter.max(BUS_OFF_LIMIT);
        self.raise(Alerts::BUS_OFF);
    }
}

/// 内存虚拟控制器
pub struct MockCanDriver {
    inner: Mutex<Controller>,
    changed: Condvar,
    epoch: Instant,
}

impl MockCanDriver {
    /// 创建未安装的虚拟控制器（默认有应答方）
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Controller {
                config: None,
                status: DriverStatus::default(),
                rx_queue: VecDeque::new(),
                pending_alerts: Alerts::NONE,
                ack_partner: true,
                faults: Vec::new(),
                calls: Vec::new(),
                transmitted: Vec::new(),
            }),
            changed: Condvar::new(),
            epoch: Instant::now(),
        }
    }

    /// 设置总线上是否有其他节点应答
    pub fn set_ack_partner(&self, present: bool) {
        self.inner.lock().ack_partner = present;
        self.changed.notify_all();
    }

    /// 模拟总线上收到一帧
    ///
    /// 控制器未运行、验收滤波器拒绝或接收队列已满时返回 `false`。
    pub fn inject_rx(&self, frame: CanFrame) -> bool {
        let mut ctl = self.inner.lock();
        let Some(config) = ctl.config else {
            return false;
        };
        if ctl.status.state != BusState::Running || !config.filter.accepts(&frame) {
            return false;
        }
        let frame = frame.with_timestamp(self.now_us());
        let accepted = ctl.enqueue_rx(frame);
        drop(ctl);
        self.changed.notify_all();
        accepted
    }

    /// 强制进入 bus-off
    pub fn trigger_bus_off(&self) {
        let mut ctl = self.inner.lock();
        if ctl.config.is_none() {
            return;
        }
        debug!("Mock controller forced into bus-off");
        ctl.raise(Alerts::ABOVE_ERR_WARN | Alerts::ERR_PASS);
        ctl.enter_bus_off();
        drop(ctl);
        self.changed.notify_all();
    }

    /// 模拟硬件 FIFO 溢出
    pub fn trigger_fifo_overrun(&self) {
        let mut ctl = self.inner.lock();
        ctl.status.rx_overrun_count += 1;
        ctl.raise(Alerts::RX_FIFO_OVERRUN);
        drop(ctl);
        self.changed.notify_all();
    }

    /// 让下一次 `op` 调用返回 `err`
    pub fn fail_next(&self, op: DriverOp, err: CanError) {
        self.inner.lock().faults.push((op, err));
    }

    /// 调用日志
    pub fn calls(&self) -> Vec<DriverCall> {
        self.inner.lock().calls.clone()
    }

    /// 清空调用日志
    pub fn clear_calls(&self) {
        self.inner.lock().calls.clear();
    }

    /// 所有成功发送到总线上的帧
    pub fn transmitted(&self) -> Vec<CanFrame> {
        self.inner.lock().transmitted.clone()
    }

    pub fn is_installed(&self) -> bool {
        self.inner.lock().config.is_some()
    }

    /// 当前安装配置
    pub fn installed_config(&self) -> Option<DriverConfig> {
        self.inner.lock().config
    }

    pub fn bus_state(&self) -> Option<BusState> {
        let ctl = self.inner.lock();
        ctl.config.map(|_| ctl.status.state)
    }

    fn now_us(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
    }

    /// 在截止时间前等待状态变化，超时返回 `true`
    fn wait(&self, guard: &mut MutexGuard<'_, Controller>, deadline: Option<Instant>) -> bool {
        match deadline {
            Some(deadline) => self.changed.wait_until(guard, deadline).timed_out(),
            None => {
                self.changed.wait(guard);
                false
            },
        }
    }
}

impl Default for MockCanDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MockCanDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ctl = self.inner.lock();
        f.debug_struct("MockCanDriver")
            .field("installed", &ctl.config.is_some())
            .field("state", &ctl.status.state)
            .field("rx_pending", &ctl.rx_queue.len())
            .finish()
    }
}

impl CanDriver for MockCanDriver {
    fn install(&self, config: &DriverConfig) -> Result<(), CanError> {
        let mut ctl = self.inner.lock();
        ctl.calls.push(DriverCall::Install(config.mode));
        if let Some(err) = ctl.take_fault(DriverOp::Install) {
            return Err(err);
        }
        if ctl.config.is_some() {
            return Err(CanError::AlreadyInstalled);
        }
        if !config.timing.is_valid() {
            return Err(CanError::InvalidConfig(format!("{:?}", config.timing)));
        }

        ctl.config = Some(*config);
        ctl.status = DriverStatus::default();
        ctl.rx_queue.clear();
        ctl.pending_alerts = Alerts::NONE;
        trace!("Mock controller installed in {:?} mode", config.mode);
        Ok(())
    }

    fn uninstall(&self) -> Result<(), CanError> {
        let mut ctl = self.inner.lock();
        ctl.calls.push(DriverCall::Uninstall);
        if ctl.config.is_none() {
            return Err(CanError::NotInstalled);
        }
        if matches!(ctl.status.state, BusState::Running | BusState::Recovering) {
            return Err(CanError::Busy);
        }
        ctl.config = None;
        ctl.rx_queue.clear();
        ctl.pending_alerts = Alerts::NONE;
        drop(ctl);
        self.changed.notify_all();
        Ok(())
    }

    fn start(&self) -> Result<(), CanError> {
        let mut ctl = self.inner.lock();
        ctl.calls.push(DriverCall::Start);
        if let Some(err) = ctl.take_fault(DriverOp::Start) {
            return Err(err);
        }
        if ctl.config.is_none() {
            return Err(CanError::NotInstalled);
        }
        match ctl.status.state {
            BusState::Stopped => {},
            BusState::BusOff | BusState::Recovering => return Err(CanError::BusOff),
            BusState::Running => return Err(CanError::InvalidArgument("already running".into())),
        }
        ctl.status.state = BusState::Running;
        ctl.raise(Alerts::ERR_ACTIVE);
        drop(ctl);
        self.changed.notify_all();
        Ok(())
    }

    fn stop(&self) -> Result<(), CanError> {
        let mut ctl = self.inner.lock();
        ctl.calls.push(DriverCall::Stop);
        if ctl.status.state != BusState::Running || ctl.config.is_none() {
            return Err(CanError::NotRunning);
        }
        ctl.status.state = BusState::Stopped;
        drop(ctl);
        self.changed.notify_all();
        Ok(())
    }

    fn transmit(&self, frame: &CanFrame, timeout: Duration) -> Result<(), CanError> {
        let mut ctl = self.inner.lock();
        ctl.calls.push(DriverCall::Transmit);
        if let Some(err) = ctl.take_fault(DriverOp::Transmit) {
            ctl.status.tx_failed_count += 1;
            ctl.raise(Alerts::TX_FAILED);
            return Err(err);
        }

        let mode = match (ctl.config, ctl.status.state) {
            (None, _) => return Err(CanError::NotRunning),
            (Some(_), BusState::BusOff | BusState::Recovering) => return Err(CanError::BusOff),
            (Some(_), BusState::Stopped) => return Err(CanError::NotRunning),
            (Some(config), BusState::Running) => config.mode,
        };
        if mode == BusMode::ListenOnly {
            return Err(CanError::NotSupported);
        }

        if mode == BusMode::Normal && !ctl.ack_partner {
            let deadline = deadline_after(timeout);
            while !ctl.ack_partner {
                if timeout.is_zero() || self.wait(&mut ctl, deadline) {
                    ctl.status.tx_failed_count += 1;
                    ctl.raise(Alerts::TX_FAILED | Alerts::TX_RETRIED);
                    ctl.bump_tec(8);
                    return Err(CanError::NoAck);
                }
                match ctl.status.state {
                    BusState::Running => {},
                    BusState::BusOff | BusState::Recovering => return Err(CanError::BusOff),
                    BusState::Stopped => return Err(CanError::NotRunning),
                }
            }
        }

        ctl.transmitted.push(*frame);
        ctl.status.tx_error_counter = ctl.status.tx_error_counter.saturating_sub(1);
        ctl.raise(Alerts::TX_SUCCESS | Alerts::TX_IDLE);
        if frame.self_reception {
            let echo = frame.with_timestamp(self.now_us());
            ctl.enqueue_rx(echo);
        }
        drop(ctl);
        self.changed.notify_all();

        trace!("Mock transmit: ID=0x{:X}, len={}", frame.id, frame.len);
        Ok(())
    }

    fn receive(&self, timeout: Duration) -> Result<CanFrame, CanError> {
        let deadline = deadline_after(timeout);
        let mut ctl = self.inner.lock();
        if let Some(err) = ctl.take_fault(DriverOp::Receive) {
            return Err(err);
        }
        loop {
            if ctl.config.is_none() || ctl.status.state != BusState::Running {
                return Err(CanError::NotRunning);
            }
            if let Some(frame) = ctl.rx_queue.pop_front() {
                return Ok(frame);
            }
            if timeout.is_zero() || self.wait(&mut ctl, deadline) {
                return Err(CanError::Timeout);
            }
        }
    }

    fn status(&self) -> Result<DriverStatus, CanError> {
        let ctl = self.inner.lock();
        if ctl.config.is_none() {
            return Err(CanError::NotInstalled);
        }
        let mut status = ctl.status;
        status.msgs_to_rx = ctl.rx_queue.len() as u32;
        Ok(status)
    }

    fn recover(&self) -> Result<(), CanError> {
        let mut ctl = self.inner.lock();
        ctl.calls.push(DriverCall::Recover);
        if ctl.config.is_none() {
            return Err(CanError::NotInstalled);
        }
        if ctl.status.state != BusState::BusOff {
            return Err(CanError::NotBusOff);
        }
        // 128 × 11 个隐性位在虚拟总线上瞬间完成
        ctl.raise(Alerts::RECOVERY_IN_PROGRESS);
        ctl.status.state = BusState::Stopped;
        ctl.status.tx_error_counter = 0;
        ctl.status.rx_error_counter = 0;
        ctl.raise(Alerts::BUS_RECOVERED | Alerts::BELOW_ERR_WARN);
        drop(ctl);
        self.changed.notify_all();
        debug!("Mock controller recovered from bus-off");
        Ok(())
    }

    fn alerts_wait(&self, mask: Alerts, timeout: Duration) -> Result<Alerts, CanError> {
        let deadline = deadline_after(timeout);
        let mut ctl = self.inner.lock();
        loop {
            if ctl.config.is_none() {
                return Err(CanError::NotInstalled);
            }
            let fired = ctl.pending_alerts & mask;
            if !fired.is_empty() {
                ctl.pending_alerts.remove(fired);
                return Ok(fired);
            }
            if timeout.is_zero() || self.wait(&mut ctl, deadline) {
                return Err(CanError::Timeout);
            }
        }
    }

    fn clear_transmit_queue(&self) -> Result<(), CanError> {
        let ctl = self.inner.lock();
        if ctl.config.is_none() {
            return Err(CanError::NotInstalled);
        }
        // 发送是同步完成的，队列恒为空
        Ok(())
    }

    fn clear_receive_queue(&self) -> Result<(), CanError> {
        let mut ctl = self.inner.lock();
        if ctl.config.is_none() {
            return Err(CanError::NotInstalled);
        }
        ctl.rx_queue.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FilterConfig, GeneralConfig, TimingConfig};
    use std::sync::Arc;
    use std::thread;

    fn config(mode: BusMode) -> DriverConfig {
        let general = GeneralConfig {
            rx_queue_len: 4,
            ..GeneralConfig::default()
        };
        DriverConfig::new(general, TimingConfig::default(), FilterConfig::accept_all(), mode)
    }

    fn running(mode: BusMode) -> MockCanDriver {
        let driver = MockCanDriver::new();
        driver.install(&config(mode)).unwrap();
        driver.start().unwrap();
        driver
    }

    #[test]
    fn test_lifecycle_state_machine() {
        let driver = MockCanDriver::new();
        assert!(matches!(driver.start(), Err(CanError::NotInstalled)));
        assert!(matches!(driver.status(), Err(CanError::NotInstalled)));

        driver.install(&config(BusMode::Normal)).unwrap();
        assert!(matches!(
            driver.install(&config(BusMode::Normal)),
            Err(CanError::AlreadyInstalled)
        ));
        assert!(matches!(driver.stop(), Err(CanError::NotRunning)));

        driver.start().unwrap();
        assert_eq!(driver.status().unwrap().state, BusState::Running);
        assert!(matches!(driver.uninstall(), Err(CanError::Busy)));

        driver.stop().unwrap();
        driver.uninstall().unwrap();
        assert!(!driver.is_installed());
        assert_eq!(
            driver.calls(),
            vec![
                DriverCall::Start,
                DriverCall::Install(BusMode::Normal),
                DriverCall::Install(BusMode::Normal),
                DriverCall::Stop,
                DriverCall::Start,
                DriverCall::Uninstall,
                DriverCall::Stop,
                DriverCall::Uninstall,
            ]
        );
    }

    #[test]
    fn test_self_reception_loops_back() {
        let driver = running(BusMode::NoAck);
        let frame = CanFrame::new_standard(0x123, &[0xDE, 0xAD])
            .unwrap()
            .with_self_reception(true);
        driver.transmit(&frame, Duration::from_millis(10)).unwrap();

        let rx = driver.receive(Duration::from_millis(10)).unwrap();
        assert_eq!(rx.id, 0x123);
        assert_eq!(rx.data_slice(), &[0xDE, 0xAD]);
        assert_eq!(driver.transmitted().len(), 1);
    }

    #[test]
    fn test_plain_transmit_does_not_loop_back() {
        let driver = running(BusMode::NoAck);
        let frame = CanFrame::new_standard(0x1, &[1]).unwrap();
        driver.transmit(&frame, Duration::ZERO).unwrap();
        assert!(matches!(
            driver.receive(Duration::ZERO),
            Err(CanError::Timeout)
        ));
    }

    #[test]
    fn test_listen_only_rejects_transmit() {
        let driver = running(BusMode::ListenOnly);
        let frame = CanFrame::new_standard(0x1, &[]).unwrap();
        assert!(matches!(
            driver.transmit(&frame, Duration::ZERO),
            Err(CanError::NotSupported)
        ));
    }

    #[test]
    fn test_normal_without_partner_reports_no_ack() {
        let driver = running(BusMode::Normal);
        driver.set_ack_partner(false);
        let frame = CanFrame::new_standard(0x1, &[]).unwrap();
        let start = Instant::now();
        assert!(matches!(
            driver.transmit(&frame, Duration::from_millis(20)),
            Err(CanError::NoAck)
        ));
        assert!(start.elapsed() >= Duration::from_millis(20));
        let status = driver.status().unwrap();
        assert_eq!(status.tx_error_counter, 8);
        assert_eq!(status.tx_failed_count, 1);
        assert!(driver.transmitted().is_empty());
    }

    #[test]
    fn test_rx_queue_overflow_counts_missed() {
        let driver = running(BusMode::Normal);
        let frame = CanFrame::new_standard(0x10, &[]).unwrap();
        for _ in 0..4 {
            assert!(driver.inject_rx(frame));
        }
        assert!(!driver.inject_rx(frame));
        let status = driver.status().unwrap();
        assert_eq!(status.msgs_to_rx, 4);
        assert_eq!(status.rx_missed_count, 1);
        let alerts = driver.alerts_wait(Alerts::RX_QUEUE_FULL, Duration::ZERO).unwrap();
        assert!(alerts.contains(Alerts::RX_QUEUE_FULL));
    }

    #[test]
    fn test_bus_off_and_recover() {
        let driver = running(BusMode::Normal);
        driver.trigger_bus_off();
        assert_eq!(driver.bus_state(), Some(BusState::BusOff));
        let frame = CanFrame::new_standard(0x1, &[]).unwrap();
        assert!(matches!(
            driver.transmit(&frame, Duration::ZERO),
            Err(CanError::BusOff)
        ));
        assert!(matches!(driver.start(), Err(CanError::BusOff)));

        let alerts = driver.alerts_wait(Alerts::ALL, Duration::ZERO).unwrap();
        assert!(alerts.contains(Alerts::BUS_OFF));

        driver.recover().unwrap();
        assert_eq!(driver.bus_state(), Some(BusState::Stopped));
        assert!(matches!(driver.recover(), Err(CanError::NotBusOff)));
        let alerts = driver.alerts_wait(Alerts::BUS_RECOVERED, Duration::ZERO).unwrap();
        assert!(alerts.contains(Alerts::BUS_RECOVERED));
        driver.start().unwrap();
    }

    #[test]
    fn test_stop_wakes_blocked_receiver() {
        let driver = Arc::new(running(BusMode::Normal));
        let rx = {
            let driver = driver.clone();
            thread::spawn(move || driver.receive(crate::WAIT_FOREVER))
        };
        thread::sleep(Duration::from_millis(20));
        driver.stop().unwrap();
        assert!(matches!(rx.join().unwrap(), Err(CanError::NotRunning)));
    }

    #[test]
    fn test_alerts_wait_times_out() {
        let driver = running(BusMode::Normal);
        let _ = driver.alerts_wait(Alerts::ALL, Duration::ZERO);
        assert!(matches!(
            driver.alerts_wait(Alerts::BUS_OFF, Duration::from_millis(5)),
            Err(CanError::Timeout)
        ));
    }

    #[test]
    fn test_inject_honours_acceptance_filter() {
        let driver = MockCanDriver::new();
        let mut cfg = config(BusMode::Normal);
        cfg.filter = crate::FilterConfig {
            acceptance_code: 0x123 << 21,
            acceptance_mask: 0x001F_FFFF,
            single_filter: true,
        };
        driver.install(&cfg).unwrap();
        driver.start().unwrap();

        assert!(driver.inject_rx(CanFrame::new_standard(0x123, &[1]).unwrap()));
        assert!(!driver.inject_rx(CanFrame::new_standard(0x124, &[1]).unwrap()));
        assert_eq!(driver.status().unwrap().msgs_to_rx, 1);
    }

    #[test]
    fn test_fail_next_is_one_shot() {
        let driver = MockCanDriver::new();
        driver.fail_next(DriverOp::Install, CanError::NoResources);
        assert!(matches!(
            driver.install(&config(BusMode::Normal)),
            Err(CanError::NoResources)
        ));
        driver.install(&config(BusMode::Normal)).unwrap();
    }
}
