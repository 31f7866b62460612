//! CAN 管理器
//!
//! 单写多读的总线代理：多个独立客户端共享一个物理控制器。
//!
//! # 并发模型
//!
//! - **注册表**：一把 `RwLock`，任何驱动 I/O 之前释放
//! - **调和**：`reconcile_lock` 串行化所有生命周期变更
//! - **发送**：`tx_lock` 只在一次驱动 `transmit` 调用期间持有；
//!   `stop`/`uninstall` 也持有它，保证拆除时没有进行中的发送
//! - **分发线程**：驱动 `start` 后创建，`stop` 后停止并 join
//!
//! # 锁顺序
//!
//! `reconcile_lock` → `tx_lock` → 注册表写锁（短暂）。分发线程平时只取注册表读锁；
//! 接收遇到不可恢复错误时按 `tx_lock` → 注册表写锁的顺序自行拆除总线。

use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use canmux_can::{Alerts, BusState, CanDriver, CanError, CanFrame, DriverStatus, FilterConfig, GeneralConfig, TimingConfig};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, trace, warn};

use crate::client::{ClientId, ClientMode, ClientShared, RxHandler};
use crate::config::{BusSettings, ManagerConfig};
use crate::dispatcher::{DispatchStats, DispatchStatsSnapshot, DispatcherHandle};
use crate::error::ManagerError;
use crate::reconciler::{self, DriverState, DriverStep};
use crate::registry::{ClientRegistry, RegistrySnapshot};

/// 注册表锁保护的全部状态
#[derive(Debug)]
pub(crate) struct ManagerState {
    pub registry: ClientRegistry,
    pub settings: BusSettings,
    pub driver_state: DriverState,
}

/// CAN 管理器
///
/// # 示例
///
/// ```rust
/// use std::sync::Arc;
/// use std::time::Duration;
/// use canmux_can::{CanFrame, MockCanDriver};
/// use canmux_manager::{CanManager, ClientMode, RxHandler};
///
/// let driver = Arc::new(MockCanDriver::new());
/// let manager = CanManager::new(driver.clone());
///
/// let client = manager.register(ClientMode::TxEnabled).unwrap();
/// manager
///     .set_rx_callback(client, Some(RxHandler::new(|frame| println!("{:?}", frame))))
///     .unwrap();
/// manager.activate(client).unwrap();
///
/// let frame = CanFrame::new_standard(0x123, &[1, 2, 3]).unwrap();
/// manager.transmit(client, &frame, Duration::from_millis(100)).unwrap();
///
/// manager.unregister(client).unwrap();
/// ```
pub struct CanManager {
    driver: Arc<dyn CanDriver>,
    config: ManagerConfig,
    state: Arc<RwLock<ManagerState>>,
    reconcile_lock: Mutex<()>,
    tx_lock: Arc<Mutex<()>>,
    dispatcher: Mutex<Option<DispatcherHandle>>,
    dispatcher_thread: RwLock<Option<ThreadId>>,
    stats: Arc<DispatchStats>,
}

impl CanManager {
    /// 使用默认总线参数创建管理器（不触碰驱动）
    pub fn new(driver: Arc<dyn CanDriver>) -> Self {
        Self::with_config(driver, BusSettings::default(), ManagerConfig::default())
    }

    pub fn with_config(driver: Arc<dyn CanDriver>, settings: BusSettings, config: ManagerConfig) -> Self {
        Self {
            driver,
            config,
            state: Arc::new(RwLock::new(ManagerState {
                registry: ClientRegistry::new(config.max_clients),
                settings,
                driver_state: DriverState {
                    timing: settings.timing,
                    filter: settings.filter,
                    ..DriverState::default()
                },
            })),
            reconcile_lock: Mutex::new(()),
            tx_lock: Arc::new(Mutex::new(())),
            dispatcher: Mutex::new(None),
            dispatcher_thread: RwLock::new(None),
            stats: Arc::new(DispatchStats::default()),
        }
    }

    // ==================== 客户端生命周期 ====================

    /// 注册客户端（不活跃，不改变总线）
    pub fn register(&self, mode: ClientMode) -> Result<ClientId, ManagerError> {
        let id = self.state.write().registry.insert(mode)?;
        debug!("Client {} registered ({:?})", id, mode);
        Ok(id)
    }

    /// 替换接收回调
    ///
    /// 替换是原子的；返回前等待所有在途的回调执行完毕。不能在回调内调用。
    /// 在途回调超过 `drain_timeout` 仍未结束时返回 `Timeout`（新回调已生效）。
    pub fn set_rx_callback(&self, id: ClientId, callback: Option<RxHandler>) -> Result<(), ManagerError> {
        self.ensure_not_dispatcher("set_rx_callback")?;
        let shared = self.shared(id)?;
        shared.swap_callback(callback);
        if !self.drain_callbacks(id, &shared) {
            return Err(ManagerError::Timeout);
        }
        Ok(())
    }

    /// 修改客户端模式
    ///
    /// 仍有其他活跃 TX 客户端时，拒绝降级为 `RxOnly`。只有活跃客户端才触发调和。
    pub fn set_mode(&self, id: ClientId, mode: ClientMode) -> Result<(), ManagerError> {
        self.ensure_not_dispatcher("set_mode")?;
        let needs_reconcile = {
            let mut st = self.state.write();
            let other_tx = st.registry.other_active_tx(id);
            let record = st
                .registry
                .get_mut(id)
                .ok_or_else(|| unknown_client(id))?;
            if record.mode == mode {
                return Ok(());
            }
            if mode == ClientMode::RxOnly && other_tx > 0 {
                return Err(ManagerError::invalid_state(format!(
                    "cannot demote client {} to RX-only while {} other TX client(s) are active",
                    id, other_tx
                )));
            }
            record.mode = mode;
            record.active
        };

        debug!("Client {} mode set to {:?}", id, mode);
        if needs_reconcile {
            self.reconcile()?;
        }
        Ok(())
    }

    /// 激活客户端
    ///
    /// 返回时总线已安装并以兼容模式运行。调和失败时客户端保持不活跃。
    pub fn activate(&self, id: ClientId) -> Result<(), ManagerError> {
        self.ensure_not_dispatcher("activate")?;
        let was_active = {
            let mut st = self.state.write();
            let record = st
                .registry
                .get_mut(id)
                .ok_or_else(|| unknown_client(id))?;
            if record.shared.is_pending_delete() {
                return Err(ManagerError::invalid_arg(format!(
                    "client {} is being unregistered",
                    id
                )));
            }
            std::mem::replace(&mut record.active, true)
        };
        if was_active {
            warn!("Client {} already active", id);
        }

        if let Err(e) = self.reconcile() {
            if !was_active
                && let Some(record) = self.state.write().registry.get_mut(id)
            {
                record.active = false;
            }
            return Err(e);
        }
        Ok(())
    }

    /// 使客户端失活
    pub fn deactivate(&self, id: ClientId) -> Result<(), ManagerError> {
        self.ensure_not_dispatcher("deactivate")?;
        let was_active = {
            let mut st = self.state.write();
            let record = st
                .registry
                .get_mut(id)
                .ok_or_else(|| unknown_client(id))?;
            std::mem::replace(&mut record.active, false)
        };
        if !was_active {
            warn!("Client {} already inactive", id);
        }
        self.reconcile()
    }

    /// 注销客户端（两阶段删除）
    ///
    /// 1. 失活并置位 `pending_delete`，调和
    /// 2. 轮询等待 `callbacks_active` 归零（上限 1 秒）
    /// 3. 从注册表移除，再次调和
    pub fn unregister(&self, id: ClientId) -> Result<(), ManagerError> {
        self.ensure_not_dispatcher("unregister")?;
        let (shared, was_active) = {
            let mut st = self.state.write();
            let record = st
                .registry
                .get_mut(id)
                .ok_or_else(|| unknown_client(id))?;
            let was_active = std::mem::replace(&mut record.active, false);
            record.shared.mark_pending_delete();
            (record.shared.clone(), was_active)
        };

        if was_active && let Err(e) = self.reconcile() {
            warn!("Reconcile after deactivating client {} failed: {}", id, e);
        }

        self.drain_callbacks(id, &shared);
        self.state.write().registry.remove(id);
        debug!("Client {} unregistered", id);

        if let Err(e) = self.reconcile() {
            warn!("Reconcile after unregistering client {} failed: {}", id, e);
        }
        Ok(())
    }

    pub fn is_registered(&self, id: ClientId) -> bool {
        self.state.read().registry.contains(id)
    }

    pub fn is_active(&self, id: ClientId) -> bool {
        self.state
            .read()
            .registry
            .get(id)
            .is_some_and(|record| record.active)
    }

    pub fn client_mode(&self, id: ClientId) -> Option<ClientMode> {
        self.state.read().registry.get(id).map(|record| record.mode)
    }

    // ==================== 发送 ====================

    /// 通过管理器发送一帧
    ///
    /// # 错误
    /// - `InvalidArgument`：未知 / 不活跃 / 正在注销的客户端
    /// - `InvalidState`：`RxOnly` 客户端，或驱动未运行
    /// - `BusOff` / `NoAck` / `Timeout`：驱动原样上报
    pub fn transmit(&self, id: ClientId, frame: &CanFrame, timeout: Duration) -> Result<(), ManagerError> {
        {
            let st = self.state.read();
            let record = st.registry.get(id).ok_or_else(|| unknown_client(id))?;
            if !record.active || record.shared.is_pending_delete() {
                return Err(ManagerError::invalid_arg(format!(
                    "client {} is not active",
                    id
                )));
            }
            if record.mode == ClientMode::RxOnly {
                return Err(ManagerError::invalid_state(format!(
                    "client {} is RX-only",
                    id
                )));
            }
            if !st.driver_state.running {
                return Err(ManagerError::invalid_state("driver not running"));
            }
        }

        let result = {
            let _tx = self.tx_lock.lock();
            self.driver.transmit(frame, timeout)
        };

        match result {
            Ok(()) => {
                trace!("Client {} sent ID=0x{:X}, len={}", id, frame.id, frame.len);
                Ok(())
            },
            Err(e) if e.is_fatal() => {
                let err = ManagerError::Fatal(e.to_string());
                self.enter_fatal(&e);
                Err(err)
            },
            Err(e) => Err(e.into()),
        }
    }

    // ==================== 总线参数 ====================

    /// 全局回环（NO_ACK）请求，运行中会触发重装
    pub fn set_loopback(&self, enabled: bool) -> Result<(), ManagerError> {
        self.ensure_not_dispatcher("set_loopback")?;
        self.state.write().settings.loopback = enabled;
        self.reconcile()
    }

    pub fn set_timing(&self, timing: TimingConfig) -> Result<(), ManagerError> {
        self.ensure_not_dispatcher("set_timing")?;
        if !timing.is_valid() {
            return Err(ManagerError::invalid_arg(format!("invalid timing {:?}", timing)));
        }
        self.state.write().settings.timing = timing;
        self.reconcile()
    }

    pub fn set_filter(&self, filter: FilterConfig) -> Result<(), ManagerError> {
        self.ensure_not_dispatcher("set_filter")?;
        self.state.write().settings.filter = filter;
        self.reconcile()
    }

    /// 修改通用配置（引脚、队列、告警），已安装时重装驱动
    pub fn set_general(&self, general: GeneralConfig) -> Result<(), ManagerError> {
        self.ensure_not_dispatcher("set_general")?;
        let must_reinstall = {
            let mut st = self.state.write();
            let changed = st.settings.general != general;
            st.settings.general = general;
            changed && st.driver_state.installed
        };

        if must_reinstall {
            let _guard = self.reconcile_lock.lock();
            let current = self.state.read().driver_state;
            let settings = self.state.read().settings;
            for step in [DriverStep::Stop, DriverStep::Uninstall] {
                let needed = match step {
                    DriverStep::Stop => current.running,
                    _ => true,
                };
                if needed && let Err(e) = self.apply_step(step, &settings) {
                    return Err(self.handle_step_failure(step, e));
                }
            }
            return self.reconcile_locked();
        }
        self.reconcile()
    }

    pub fn settings(&self) -> BusSettings {
        self.state.read().settings
    }

    // ==================== 恢复与查询 ====================

    /// bus-off 恢复
    ///
    /// 发起驱动恢复，等待控制器退出 `Recovering`（上限 1 秒），然后通过调和重新启动。
    pub fn recover(&self) -> Result<(), ManagerError> {
        self.ensure_not_dispatcher("recover")?;
        {
            let _guard = self.reconcile_lock.lock();
            self.driver.recover().map_err(|e| match e {
                CanError::NotBusOff => ManagerError::invalid_state("bus is not in bus-off state"),
                other => ManagerError::from(other),
            })?;

            let deadline = Instant::now() + self.config.recover_timeout;
            loop {
                let status = self.driver.status()?;
                if status.state != BusState::Recovering {
                    break;
                }
                if Instant::now() >= deadline {
                    warn!("Bus-off recovery did not finish within {:?}", self.config.recover_timeout);
                    return Err(ManagerError::Timeout);
                }
                thread::sleep(self.config.drain_poll);
            }

            // 控制器恢复后处于 Stopped
            self.state.write().driver_state.running = false;
            self.stop_dispatcher();
            self.reconcile_locked()?;
        }
        info!("CAN bus recovered from bus-off");
        Ok(())
    }

    /// 驱动状态（未安装时返回 `InvalidState`）
    pub fn status(&self) -> Result<DriverStatus, ManagerError> {
        Ok(self.driver.status()?)
    }

    pub fn driver_state(&self) -> DriverState {
        self.state.read().driver_state
    }

    pub fn counts(&self) -> RegistrySnapshot {
        self.state.read().registry.counts()
    }

    pub fn alerts_wait(&self, mask: Alerts, timeout: Duration) -> Result<Alerts, ManagerError> {
        Ok(self.driver.alerts_wait(mask, timeout)?)
    }

    pub fn clear_tx_queue(&self) -> Result<(), ManagerError> {
        Ok(self.driver.clear_transmit_queue()?)
    }

    pub fn clear_rx_queue(&self) -> Result<(), ManagerError> {
        Ok(self.driver.clear_receive_queue()?)
    }

    pub fn dispatch_stats(&self) -> DispatchStatsSnapshot {
        self.stats.snapshot()
    }

    // ==================== 调和 ====================

    fn reconcile(&self) -> Result<(), ManagerError> {
        let _guard = self.reconcile_lock.lock();
        self.reconcile_locked()
    }

    /// 调和（调用者持有 `reconcile_lock`）
    fn reconcile_locked(&self) -> Result<(), ManagerError> {
        let (plan, steps, settings) = {
            let st = self.state.read();
            let plan = reconciler::plan(&st.registry.counts(), &st.settings, &st.driver_state);
            let steps = plan.steps(&st.driver_state);
            (plan, steps, st.settings)
        };
        if steps.is_empty() {
            return Ok(());
        }

        debug!("Reconciling bus towards {:?}: {:?}", plan.target_mode, steps.as_slice());
        for step in steps {
            if let Err(e) = self.apply_step(step, &settings) {
                return Err(self.handle_step_failure(step, e));
            }
        }

        match plan.target_mode {
            Some(mode) => info!("CAN bus running in {:?} mode", mode),
            None => info!("CAN bus stopped and uninstalled"),
        }
        Ok(())
    }

    fn apply_step(&self, step: DriverStep, settings: &BusSettings) -> Result<(), CanError> {
        match step {
            DriverStep::Stop => {
                {
                    let _tx = self.tx_lock.lock();
                    match self.driver.stop() {
                        Ok(()) | Err(CanError::NotRunning) => {},
                        Err(e) => return Err(e),
                    }
                    self.update_driver_state(step, settings);
                }
                self.stop_dispatcher();
            },
            DriverStep::Uninstall => {
                self.stop_dispatcher();
                let _tx = self.tx_lock.lock();
                match self.driver.uninstall() {
                    Ok(()) | Err(CanError::NotInstalled) => {},
                    Err(e) => return Err(e),
                }
                self.update_driver_state(step, settings);
            },
            DriverStep::Install(mode) => {
                self.driver.install(&settings.driver_config(mode))?;
                self.update_driver_state(step, settings);
            },
            DriverStep::Start => {
                self.driver.start()?;
                self.update_driver_state(step, settings);
                self.spawn_dispatcher()?;
            },
        }
        Ok(())
    }

    fn update_driver_state(&self, step: DriverStep, settings: &BusSettings) {
        let mut st = self.state.write();
        st.driver_state = st.driver_state.after(step, settings);
    }

    /// 调和失败：总线保持停止/卸载，客户端保持注册
    fn handle_step_failure(&self, step: DriverStep, err: CanError) -> ManagerError {
        warn!("Bus reconcile step {:?} failed: {}", step, err);
        if err.is_fatal() {
            let message = err.to_string();
            self.deactivate_all_fatal(&err);
            self.teardown_best_effort();
            return ManagerError::Fatal(message);
        }
        self.teardown_best_effort();
        ManagerError::BusUnavailable(err)
    }

    /// 不可恢复错误：停止总线，所有客户端失活，需要重新初始化
    fn enter_fatal(&self, err: &CanError) {
        self.deactivate_all_fatal(err);
        if self.on_dispatcher_thread() {
            // 分发线程不能 join 自己，也不能等待可能正在 join 它的调和
            self.teardown_best_effort();
        } else {
            let _guard = self.reconcile_lock.lock();
            self.teardown_best_effort();
        }
    }

    fn deactivate_all_fatal(&self, err: &CanError) {
        let count = self.state.write().registry.deactivate_all();
        error!(
            "Fatal CAN driver error: {}; {} client(s) deactivated, re-init required",
            err, count
        );
    }

    fn teardown_best_effort(&self) {
        {
            let _tx = self.tx_lock.lock();
            if let Err(e) = self.driver.stop() {
                trace!("Teardown stop: {}", e);
            }
        }
        self.stop_dispatcher();
        {
            let _tx = self.tx_lock.lock();
            if let Err(e) = self.driver.uninstall() {
                trace!("Teardown uninstall: {}", e);
            }
        }
        let mut st = self.state.write();
        st.driver_state.installed = false;
        st.driver_state.running = false;
        st.driver_state.mode = None;
    }

    // ==================== 分发线程 ====================

    fn spawn_dispatcher(&self) -> Result<(), CanError> {
        self.stop_dispatcher();
        let handle = DispatcherHandle::spawn(
            self.driver.clone(),
            self.state.clone(),
            self.tx_lock.clone(),
            self.stats.clone(),
            self.config.dispatcher,
        )?;
        *self.dispatcher_thread.write() = Some(handle.thread_id());
        *self.dispatcher.lock() = Some(handle);
        Ok(())
    }

    fn stop_dispatcher(&self) {
        let Some(handle) = self.dispatcher.lock().take() else {
            return;
        };
        if handle.thread_id() == thread::current().id() {
            // 在分发线程自身上：只通知退出，句柄 drop 后线程自行结束
            handle.signal();
            return;
        }
        handle.stop();
        *self.dispatcher_thread.write() = None;
    }

    fn on_dispatcher_thread(&self) -> bool {
        *self.dispatcher_thread.read() == Some(thread::current().id())
    }

    fn ensure_not_dispatcher(&self, op: &str) -> Result<(), ManagerError> {
        if self.on_dispatcher_thread() {
            return Err(ManagerError::invalid_state(format!(
                "{} is not allowed from an RX callback",
                op
            )));
        }
        Ok(())
    }

    // ==================== 工具 ====================

    fn shared(&self, id: ClientId) -> Result<Arc<ClientShared>, ManagerError> {
        self.state
            .read()
            .registry
            .get(id)
            .map(|record| record.shared.clone())
            .ok_or_else(|| unknown_client(id))
    }

    /// 等待在途回调结束，超时返回 `false`
    fn drain_callbacks(&self, id: ClientId, shared: &ClientShared) -> bool {
        let deadline = Instant::now() + self.config.drain_timeout;
        while shared.callbacks_active() > 0 {
            if Instant::now() >= deadline {
                warn!(
                    "Client {}: {} callback(s) still running after {:?}",
                    id,
                    shared.callbacks_active(),
                    self.config.drain_timeout
                );
                return false;
            }
            thread::sleep(self.config.drain_poll);
        }
        true
    }
}

impl Drop for CanManager {
    fn drop(&mut self) {
        let installed = self.state.read().driver_state.installed;
        if installed {
            debug!("CanManager dropped, shutting down the bus");
            self.teardown_best_effort();
        } else {
            self.stop_dispatcher();
        }
    }
}

impl std::fmt::Debug for CanManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.state.read();
        f.debug_struct("CanManager")
            .field("counts", &st.registry.counts())
            .field("driver_state", &st.driver_state)
            .field("loopback", &st.settings.loopback)
            .finish()
    }
}

fn unknown_client(id: ClientId) -> ManagerError {
    ManagerError::invalid_arg(format!("unknown client {}", id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use canmux_can::mock::{DriverCall, DriverOp};
    use canmux_can::{BusMode, MockCanDriver};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn setup() -> (Arc<MockCanDriver>, CanManager) {
        let driver = Arc::new(MockCanDriver::new());
        let settings = BusSettings {
            general: GeneralConfig {
                rx_queue_len: 32,
                ..GeneralConfig::default()
            },
            ..BusSettings::default()
        };
        let manager = CanManager::with_config(driver.clone(), settings, ManagerConfig::default());
        (driver, manager)
    }

    #[test]
    fn test_register_does_not_touch_driver() {
        let (driver, manager) = setup();
        let id = manager.register(ClientMode::TxEnabled).unwrap();
        assert!(manager.is_registered(id));
        assert!(!manager.is_active(id));
        assert!(driver.calls().is_empty());
    }

    #[test]
    fn test_activate_installs_and_starts() {
        let (driver, manager) = setup();
        let id = manager.register(ClientMode::TxEnabled).unwrap();
        manager.activate(id).unwrap();
        assert_eq!(
            driver.calls(),
            vec![DriverCall::Install(BusMode::Normal), DriverCall::Start]
        );
        let state = manager.driver_state();
        assert!(state.installed && state.running);
        assert_eq!(state.mode, Some(BusMode::Normal));
    }

    #[test]
    fn test_activate_twice_is_noop() {
        let (driver, manager) = setup();
        let id = manager.register(ClientMode::RxOnly).unwrap();
        manager.activate(id).unwrap();
        driver.clear_calls();
        manager.activate(id).unwrap();
        assert!(driver.calls().is_empty());
    }

    #[test]
    fn test_transmit_validation() {
        let (_driver, manager) = setup();
        let frame = CanFrame::new_standard(0x100, &[1]).unwrap();
        let timeout = Duration::from_millis(10);

        let unknown = ClientId::new(99).unwrap();
        assert!(matches!(
            manager.transmit(unknown, &frame, timeout),
            Err(ManagerError::InvalidArgument(_))
        ));

        let tx = manager.register(ClientMode::TxEnabled).unwrap();
        assert!(matches!(
            manager.transmit(tx, &frame, timeout),
            Err(ManagerError::InvalidArgument(_))
        ));

        let rx = manager.register(ClientMode::RxOnly).unwrap();
        manager.activate(rx).unwrap();
        assert!(matches!(
            manager.transmit(rx, &frame, timeout),
            Err(ManagerError::InvalidState(_))
        ));

        manager.activate(tx).unwrap();
        manager.transmit(tx, &frame, timeout).unwrap();
    }

    #[test]
    fn test_install_failure_reports_bus_unavailable() {
        let (driver, manager) = setup();
        driver.fail_next(DriverOp::Install, CanError::NoResources);
        let id = manager.register(ClientMode::TxEnabled).unwrap();
        assert!(matches!(
            manager.activate(id),
            Err(ManagerError::BusUnavailable(CanError::NoResources))
        ));
        assert!(manager.is_registered(id));
        assert!(!manager.is_active(id));
        assert!(!manager.driver_state().installed);

        // 再次激活成功
        manager.activate(id).unwrap();
        assert!(manager.driver_state().running);
    }

    #[test]
    fn test_fatal_transmit_deactivates_everyone() {
        let (driver, manager) = setup();
        let a = manager.register(ClientMode::TxEnabled).unwrap();
        let b = manager.register(ClientMode::RxOnly).unwrap();
        manager.activate(a).unwrap();
        manager.activate(b).unwrap();

        driver.fail_next(DriverOp::Transmit, CanError::Fatal("controller vanished".into()));
        let frame = CanFrame::new_standard(0x1, &[]).unwrap();
        assert!(matches!(
            manager.transmit(a, &frame, Duration::from_millis(10)),
            Err(ManagerError::Fatal(_))
        ));
        assert!(!manager.is_active(a));
        assert!(!manager.is_active(b));
        assert!(!manager.driver_state().installed);
        assert!(!driver.is_installed());
    }

    #[test]
    fn test_callback_panic_is_contained() {
        let (driver, manager) = setup();
        let hits = Arc::new(AtomicUsize::new(0));

        let bad = manager.register(ClientMode::RxOnly).unwrap();
        manager
            .set_rx_callback(bad, Some(RxHandler::new(|_| panic!("bad client"))))
            .unwrap();
        let good = manager.register(ClientMode::RxOnly).unwrap();
        let counter = hits.clone();
        manager
            .set_rx_callback(
                good,
                Some(RxHandler::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                })),
            )
            .unwrap();
        manager.activate(bad).unwrap();
        manager.activate(good).unwrap();

        for i in 0..3u8 {
            assert!(driver.inject_rx(CanFrame::new_standard(0x10, &[i]).unwrap()));
        }
        let deadline = Instant::now() + Duration::from_secs(2);
        while hits.load(Ordering::SeqCst) < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert_eq!(manager.dispatch_stats().callback_panics, 3);
    }

    #[test]
    fn test_recover_requires_bus_off() {
        let (_driver, manager) = setup();
        let id = manager.register(ClientMode::TxEnabled).unwrap();
        manager.activate(id).unwrap();
        assert!(matches!(
            manager.recover(),
            Err(ManagerError::InvalidState(_))
        ));
    }

    #[test]
    fn test_drop_tears_down_bus() {
        let (driver, manager) = setup();
        let id = manager.register(ClientMode::TxEnabled).unwrap();
        manager.activate(id).unwrap();
        drop(manager);
        assert!(!driver.is_installed());
    }
}
