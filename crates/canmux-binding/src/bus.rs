//! 脚本宿主可见的 CAN 总线对象
//!
//! 一个 [`CanBus`] 是管理器的一个客户端。`init` 只注册；第一次 `send`、`recv`
//! 或 `irq_recv(Some(..))` 才创建接收队列、安装回调并激活（惰性激活），
//! 在此之前其他客户端（比如 GVRET 桥）可以让总线保持停止。

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use canmux_can::{Alerts, BusMode, BusState, CanFrame, WAIT_FOREVER};
use canmux_manager::{CanManager, ClientId, HostCallback, HostScheduler, ManagerError, RxHandler, log_backoff};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, trace, warn};

use crate::alert::AlertTask;
use crate::error::BindingError;
use crate::options::{
    BindingState, CanInfo, CanOptions, DEFAULT_SEND_TIMEOUT, FilterMode, ReceivedFrame, SendOptions, encode_filter,
    irq_recv,
};

const MSG_BUS_OFF_RESTART: &str = "CAN bus is BUS_OFF - use restart() to recover";
const MSG_BUS_OFF_TX: &str = "CAN bus is BUS_OFF - check transceiver, termination, or use LOOPBACK mode";
const MSG_NO_ACK: &str = "CAN TX timeout - no ACK received. Use LOOPBACK mode for testing without transceiver";
const MSG_NOT_READY: &str = "Device is not ready";

/// 可用的控制器数量
const CONTROLLER_COUNT: u32 = 1;

/// 绑定计数器（告警任务与 RX 回调写入）
#[derive(Debug, Default)]
pub(crate) struct BindingCounters {
    pub rx_dropped: AtomicU64,
    pub num_bus_off: AtomicU32,
    pub num_error_passive: AtomicU32,
    pub num_error_warning: AtomicU32,
    /// 连续的宿主调度失败次数
    pub sched_saturation: AtomicU64,
}

impl BindingCounters {
    fn reset(&self) {
        self.rx_dropped.store(0, Ordering::Relaxed);
        self.num_bus_off.store(0, Ordering::Relaxed);
        self.num_error_passive.store(0, Ordering::Relaxed);
        self.num_error_warning.store(0, Ordering::Relaxed);
        self.sched_saturation.store(0, Ordering::Relaxed);
    }
}

/// RX 回调、告警任务与宿主线程共享的状态
#[derive(Default)]
pub(crate) struct BindingShared {
    pub counters: BindingCounters,
    rx_cb: RwLock<Option<HostCallback>>,
    tx_cb: RwLock<Option<HostCallback>>,
}

impl BindingShared {
    pub fn rx_callback(&self) -> Option<HostCallback> {
        self.rx_cb.read().clone()
    }

    pub fn tx_callback(&self) -> Option<HostCallback> {
        self.tx_cb.read().clone()
    }

    pub fn set_rx_callback(&self, callback: Option<HostCallback>) {
        *self.rx_cb.write() = callback;
    }

    pub fn set_tx_callback(&self, callback: Option<HostCallback>) {
        *self.tx_cb.write() = callback;
    }

    /// 投递宿主回调，记录连续饱和次数
    pub fn schedule(&self, host: &HostScheduler, callback: &HostCallback, code: i32) {
        if host.schedule(callback, code) {
            self.counters.sched_saturation.store(0, Ordering::Relaxed);
            return;
        }
        let failures = self.counters.sched_saturation.fetch_add(1, Ordering::Relaxed) + 1;
        if log_backoff(failures) {
            warn!("Host scheduler saturated ({} consecutive failures)", failures);
        }
    }

    /// 管理器 RX 回调：非阻塞入队
    pub fn on_frame(&self, tx: &Sender<CanFrame>, capacity: usize, host: &HostScheduler, frame: &CanFrame) {
        match tx.try_send(*frame) {
            Ok(()) => {
                let Some(callback) = self.rx_callback() else {
                    return;
                };
                let queued = tx.len();
                if queued >= capacity {
                    self.schedule(host, &callback, irq_recv::QUEUE_FULL);
                } else if queued == 1 {
                    self.schedule(host, &callback, irq_recv::FIRST_FRAME);
                }
            },
            Err(TrySendError::Full(_)) => {
                let dropped = self.counters.rx_dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if log_backoff(dropped) {
                    warn!("RX queue full, {} frame(s) dropped so far", dropped);
                }
                if let Some(callback) = self.rx_callback() {
                    self.schedule(host, &callback, irq_recv::OVERFLOW);
                }
            },
            Err(TrySendError::Disconnected(_)) => {},
        }
    }
}

struct Session {
    options: CanOptions,
    client: ClientId,
    /// 激活后才存在
    rx: Option<Receiver<CanFrame>>,
    alerts: Option<AlertTask>,
}

/// 激活后发送/接收所需的最小信息（不持锁使用）
struct ActiveLink {
    client: ClientId,
    rx: Receiver<CanFrame>,
    self_reception: bool,
}

/// CAN 总线对象
///
/// # 示例
///
/// ```rust
/// use std::sync::Arc;
/// use std::time::Duration;
/// use canmux_binding::{CanBus, CanMode, CanOptions, SendOptions};
/// use canmux_can::MockCanDriver;
/// use canmux_manager::{CanManager, HostScheduler};
///
/// let manager = Arc::new(CanManager::new(Arc::new(MockCanDriver::new())));
/// let options = CanOptions {
///     mode: CanMode::Loopback,
///     ..CanOptions::default()
/// };
/// let bus = CanBus::new(manager, HostScheduler::default(), 0, Some(options)).unwrap();
///
/// bus.send(&[0x01, 0x02], 0x7E, SendOptions::default()).unwrap();
/// let frame = bus.recv(Duration::from_secs(1)).unwrap();
/// assert_eq!(frame.data, vec![0x01, 0x02]);
/// ```
pub struct CanBus {
    manager: Arc<CanManager>,
    host: HostScheduler,
    session: Mutex<Option<Session>>,
    shared: Arc<BindingShared>,
}

impl CanBus {
    /// 创建总线对象；带参数时立即 `init`
    pub fn new(
        manager: Arc<CanManager>,
        host: HostScheduler,
        bus_index: u32,
        options: Option<CanOptions>,
    ) -> Result<Self, BindingError> {
        if bus_index >= CONTROLLER_COUNT {
            return Err(BindingError::InvalidArgument(format!(
                "out of CAN controllers:{}",
                CONTROLLER_COUNT
            )));
        }
        let bus = Self {
            manager,
            host,
            session: Mutex::new(None),
            shared: Arc::new(BindingShared::default()),
        };
        if let Some(options) = options {
            bus.init(options)?;
        }
        Ok(bus)
    }

    /// 配置总线参数并注册为管理器客户端（不激活）
    pub fn init(&self, options: CanOptions) -> Result<(), BindingError> {
        let mut session = self.session.lock();
        if session.is_some() {
            return Err(BindingError::InvalidState("Device is already initialized".into()));
        }
        if options.auto_restart {
            return Err(BindingError::NotSupported("Auto-restart not supported".into()));
        }
        let timing = options.timing()?;

        self.manager.set_timing(timing)?;
        self.manager.set_general(options.general())?;
        self.manager.set_loopback(options.mode.wants_no_ack())?;
        let client = self.manager.register(options.mode.client_mode())?;

        self.shared.counters.reset();
        *session = Some(Session {
            options,
            client,
            rx: None,
            alerts: None,
        });
        info!(
            "CAN bus initialised (client {}, mode {:?}, bitrate {})",
            client, options.mode, options.bitrate
        );
        Ok(())
    }

    /// 注销客户端并停止告警任务
    pub fn deinit(&self) -> Result<(), BindingError> {
        let session = self
            .session
            .lock()
            .take()
            .ok_or_else(BindingError::not_initialized)?;
        self.teardown(session)
    }

    pub fn is_initialized(&self) -> bool {
        self.session.lock().is_some()
    }

    // ==================== 收发 ====================

    /// 发送一帧
    ///
    /// `timeout` 为 0 时使用默认的 1 秒；不允许无限等待。
    pub fn send(&self, data: &[u8], id: u32, options: SendOptions) -> Result<(), BindingError> {
        if data.len() > 8 {
            return Err(BindingError::InvalidArgument("CAN data field too long".into()));
        }
        let timeout = if options.timeout.is_zero() {
            DEFAULT_SEND_TIMEOUT
        } else if options.timeout == WAIT_FOREVER {
            return Err(BindingError::InvalidArgument(
                "send timeout must be finite".into(),
            ));
        } else {
            options.timeout
        };

        let link = self.ensure_activated()?;
        let frame = if options.rtr {
            CanFrame::new_remote(id, data.len() as u8, options.extended)
        } else {
            CanFrame::new(id, data, options.extended)
        }
        .map_err(|e| BindingError::InvalidArgument(e.to_string()))?
        .with_self_reception(link.self_reception);

        match self.manager.status().map(|s| s.state) {
            Ok(BusState::Running) => {},
            Ok(BusState::BusOff) => return Err(BindingError::BusOff(MSG_BUS_OFF_RESTART.into())),
            Ok(state) => {
                debug!("send: device not ready, state={}", state);
                return Err(BindingError::InvalidState(MSG_NOT_READY.into()));
            },
            Err(_) => return Err(BindingError::InvalidState(MSG_NOT_READY.into())),
        }

        trace!("send: ID=0x{:X}, DLC={}, timeout={:?}", frame.id, frame.len, timeout);
        match self.manager.transmit(link.client, &frame, timeout) {
            Ok(()) => Ok(()),
            Err(ManagerError::Timeout) => Err(self.classify_tx_timeout()),
            Err(ManagerError::NoAck) => {
                if self.tx_error_counter() > 0 {
                    Err(BindingError::NoAck(MSG_NO_ACK.into()))
                } else {
                    Err(BindingError::Timeout)
                }
            },
            Err(ManagerError::BusOff) => Err(BindingError::BusOff(MSG_BUS_OFF_TX.into())),
            Err(e) => Err(e.into()),
        }
    }

    /// 从接收队列取一帧（默认超时见 [`crate::DEFAULT_RECV_TIMEOUT`]）
    ///
    /// 不允许无限等待。
    pub fn recv(&self, timeout: Duration) -> Result<ReceivedFrame, BindingError> {
        if timeout == WAIT_FOREVER {
            return Err(BindingError::InvalidArgument(
                "recv timeout must be finite".into(),
            ));
        }
        let link = self.ensure_activated()?;
        match link.rx.recv_timeout(timeout) {
            Ok(frame) => Ok(ReceivedFrame::from(&frame)),
            Err(RecvTimeoutError::Timeout) => Err(BindingError::Timeout),
            Err(RecvTimeoutError::Disconnected) => {
                Err(BindingError::InvalidState("RX queue not initialized".into()))
            },
        }
    }

    /// 接收队列中是否有帧
    pub fn any(&self) -> bool {
        self.session
            .lock()
            .as_ref()
            .and_then(|s| s.rx.as_ref())
            .is_some_and(|rx| !rx.is_empty())
    }

    pub fn clear_tx(&self) -> Result<(), BindingError> {
        self.require_initialized()?;
        self.manager.clear_tx_queue()?;
        Ok(())
    }

    /// 清空绑定接收队列和驱动接收队列
    pub fn clear_rx(&self) -> Result<(), BindingError> {
        let rx = {
            let session = self.session.lock();
            let session = session.as_ref().ok_or_else(BindingError::not_initialized)?;
            session.rx.clone()
        };
        if let Some(rx) = rx {
            let drained = rx.try_iter().count();
            trace!("clear_rx: dropped {} queued frame(s)", drained);
        }
        match self.manager.clear_rx_queue() {
            Ok(()) | Err(ManagerError::InvalidState(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    // ==================== 滤波器 ====================

    /// 设置验收滤波器（运行中会触发重装）
    ///
    /// `mode` 为原始值：1 RAW_SINGLE，2 RAW_DUAL，3 ADDRESS。
    pub fn set_filters(&self, bank: u32, mode: i32, params: &[u32], rtr: bool, extended: bool) -> Result<(), BindingError> {
        self.require_initialized()?;
        if bank != 0 {
            return Err(BindingError::InvalidArgument(format!("Bank ({}) doesn't exist", bank)));
        }
        let &[first, second] = params else {
            return Err(BindingError::InvalidArgument("params must be a 2-values list".into()));
        };
        let mode = FilterMode::from_raw(mode)
            .ok_or_else(|| BindingError::InvalidArgument("CAN filter parameter error".into()))?;

        let filter = encode_filter(self.manager.settings().filter, mode, [first, second], rtr, extended);
        debug!(
            "set_filters: {:?} code=0x{:08X} mask=0x{:08X}",
            mode, filter.acceptance_code, filter.acceptance_mask
        );
        self.manager.set_filter(filter)?;
        Ok(())
    }

    pub fn clear_filters(&self) -> Result<(), BindingError> {
        self.require_initialized()?;
        self.manager.set_filter(canmux_can::FilterConfig::accept_all())?;
        Ok(())
    }

    // ==================== 状态 ====================

    /// bus-off 时发起恢复，否则什么都不做
    pub fn restart(&self) -> Result<(), BindingError> {
        self.require_initialized()?;
        match self.manager.status() {
            Ok(status) if status.state == BusState::BusOff => {
                info!("Restarting CAN bus after bus-off");
                self.manager.recover()?;
            },
            _ => debug!("restart: bus is not bus-off, nothing to do"),
        }
        Ok(())
    }

    pub fn state(&self) -> BindingState {
        if !self.is_initialized() {
            return BindingState::NotInitiated;
        }
        match self.manager.status() {
            Ok(status) => status.state.into(),
            Err(_) => BindingState::Stopped,
        }
    }

    pub fn info(&self) -> Result<CanInfo, BindingError> {
        self.require_initialized()?;
        let status = self.manager.status().ok();
        let driver = status.unwrap_or_default();
        let counters = &self.shared.counters;
        Ok(CanInfo {
            state: status.map_or(BindingState::Stopped, |s| s.state.into()),
            msgs_to_tx: driver.msgs_to_tx,
            msgs_to_rx: driver.msgs_to_rx,
            tx_error_counter: driver.tx_error_counter,
            rx_error_counter: driver.rx_error_counter,
            tx_failed_count: driver.tx_failed_count,
            rx_missed_count: driver.rx_missed_count,
            arb_lost_count: driver.arb_lost_count,
            bus_error_count: driver.bus_error_count,
            rx_dropped: counters.rx_dropped.load(Ordering::Relaxed),
            num_bus_off: counters.num_bus_off.load(Ordering::Relaxed),
            num_error_passive: counters.num_error_passive.load(Ordering::Relaxed),
            num_error_warning: counters.num_error_warning.load(Ordering::Relaxed),
        })
    }

    /// 读取并清除当前挂起的告警（不等待）
    pub fn alert(&self) -> Result<Alerts, BindingError> {
        self.require_initialized()?;
        match self.manager.alerts_wait(Alerts::ALL, Duration::ZERO) {
            Ok(alerts) => Ok(alerts),
            Err(ManagerError::Timeout) | Err(ManagerError::InvalidState(_)) => Ok(Alerts::NONE),
            Err(e) => Err(e.into()),
        }
    }

    // ==================== 宿主回调 ====================

    /// 设置接收事件回调；设置非空回调会激活总线
    pub fn irq_recv(&self, callback: Option<HostCallback>) -> Result<(), BindingError> {
        let activate = callback.is_some();
        self.shared.set_rx_callback(callback);
        if activate {
            self.ensure_activated()?;
        }
        Ok(())
    }

    pub fn irq_send(&self, callback: Option<HostCallback>) {
        self.shared.set_tx_callback(callback);
    }

    // ==================== 内部 ====================

    /// 惰性激活：第一次调用时创建接收队列、安装回调、激活客户端并启动告警任务
    fn ensure_activated(&self) -> Result<ActiveLink, BindingError> {
        let mut guard = self.session.lock();
        let session = guard.as_mut().ok_or_else(BindingError::not_initialized)?;
        let self_reception = session.options.mode.self_reception();
        if let Some(rx) = &session.rx {
            return Ok(ActiveLink {
                client: session.client,
                rx: rx.clone(),
                self_reception,
            });
        }

        let capacity = session.options.rx_queue_capacity();
        let (tx, rx) = bounded(capacity);
        let shared = self.shared.clone();
        let host = self.host.clone();
        let handler = RxHandler::new(move |frame| shared.on_frame(&tx, capacity, &host, frame));

        self.manager.set_rx_callback(session.client, Some(handler))?;
        if let Err(e) = self.manager.activate(session.client) {
            if let Err(cleanup) = self.manager.set_rx_callback(session.client, None) {
                warn!("Failed to remove RX callback after activation failure: {}", cleanup);
            }
            return Err(e.into());
        }

        match AlertTask::spawn(self.manager.clone(), self.host.clone(), self.shared.clone()) {
            Ok(task) => session.alerts = Some(task),
            Err(e) => warn!("Failed to start CAN alert task: {}", e),
        }
        session.rx = Some(rx.clone());
        debug!("CAN binding activated (client {})", session.client);

        Ok(ActiveLink {
            client: session.client,
            rx,
            self_reception,
        })
    }

    fn teardown(&self, session: Session) -> Result<(), BindingError> {
        if let Some(task) = session.alerts {
            task.stop();
        }
        let result = self.manager.unregister(session.client);
        if session.options.mode.wants_no_ack()
            && let Err(e) = self.manager.set_loopback(false)
        {
            warn!("Failed to clear bus loopback: {}", e);
        }
        self.shared.set_rx_callback(None);
        self.shared.set_tx_callback(None);
        debug!("CAN bus deinitialised (client {})", session.client);
        result.map_err(Into::into)
    }

    fn require_initialized(&self) -> Result<(), BindingError> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(BindingError::not_initialized())
        }
    }

    fn tx_error_counter(&self) -> u32 {
        self.manager.status().map_or(0, |s| s.tx_error_counter)
    }

    /// 驱动报告超时：结合当前状态判断真实原因
    fn classify_tx_timeout(&self) -> BindingError {
        match self.manager.status() {
            Ok(status) if status.state == BusState::BusOff => BindingError::BusOff(MSG_BUS_OFF_TX.into()),
            Ok(status) if status.tx_error_counter > 0 => BindingError::NoAck(MSG_NO_ACK.into()),
            _ => BindingError::Timeout,
        }
    }
}

impl Drop for CanBus {
    fn drop(&mut self) {
        if let Some(session) = self.session.get_mut().take()
            && let Err(e) = self.teardown(session)
        {
            warn!("CAN bus teardown on drop failed: {}", e);
        }
    }
}

impl fmt::Display for CanBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let options = match self.session.lock().as_ref() {
            Some(session) => session.options,
            None => return f.write_str("Device is not initialized"),
        };
        let settings = self.manager.settings();
        let bitrate = match options.bitrate {
            0 => settings.timing.bitrate().unwrap_or(0),
            bitrate => bitrate,
        };
        let mode = self
            .manager
            .driver_state()
            .mode
            .unwrap_or(options.mode.expected_bus_mode());
        let mode = match mode {
            BusMode::Normal => "NORMAL",
            BusMode::NoAck => "NO_ACK",
            BusMode::ListenOnly => "LISTEN",
        };
        write!(
            f,
            "CAN(tx={}, rx={}, bitrate={}, mode={}, loopback={}, extframe={})",
            options.tx_pin,
            options.rx_pin,
            bitrate,
            mode,
            options.mode.self_reception() as u8,
            options.extframe as u8
        )
    }
}

impl fmt::Debug for CanBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CanBus")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
