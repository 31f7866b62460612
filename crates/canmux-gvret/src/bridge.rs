//! GVRET 桥接客户端
//!
//! 作为共享总线管理器的一个客户端：
//! - `start` 注册为 `TxEnabled`、挂接接收回调、创建环形缓冲并启动 TCP 任务，但不激活总线
//! - TCP 客户端连上后才激活，断开后失活
//! - 接收回调把通过过滤的帧编码后放入环形缓冲，由 TCP 任务发出
//! - 主机发来的 BUILD_CAN_FRAME 经管理器发送

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use arc_swap::{ArcSwap, ArcSwapOption};
use canmux_can::CanFrame;
use canmux_manager::{CanManager, ClientId, ClientMode, ErrorKind, HostCallback, HostScheduler, RxHandler};
use mio::Waker;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, trace, warn};

use crate::error::GvretError;
use crate::filter::{SoftwareFilter, SoftwareFilters};
use crate::protocol::{self, BusSetup, Command, DEFAULT_PORT, Packet};
use crate::ring::{DEFAULT_RING_CAPACITY, FrameRing};
use crate::server::TcpTask;
use crate::stats::{GvretStats, GvretStatsSnapshot};

/// 桥接配置
#[derive(Debug, Clone)]
pub struct GvretConfig {
    /// 监听地址（默认 `0.0.0.0:23`）
    pub bind_addr: SocketAddr,
    /// 出站环形缓冲容量（字节）
    pub ring_capacity: usize,
    /// 单帧发送超时
    pub tx_timeout: Duration,
}

impl Default for GvretConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            ring_capacity: DEFAULT_RING_CAPACITY,
            tx_timeout: Duration::from_millis(100),
        }
    }
}

/// 等待在途回调退出：每 10 ms 检查一次，最多 100 次
const QUIESCE_POLL: Duration = Duration::from_millis(10);
const QUIESCE_ATTEMPTS: u32 = 100;

struct ActiveGuard<'a>(&'a AtomicU32);

impl<'a> ActiveGuard<'a> {
    fn enter(counter: &'a AtomicU32) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// 回调、TCP 任务和宿主 API 共享的状态
pub(crate) struct BridgeCore {
    manager: Arc<CanManager>,
    host: HostScheduler,
    config: GvretConfig,
    enabled: AtomicBool,
    callback_active: AtomicU32,
    bitrate: AtomicU32,
    ring: ArcSwapOption<FrameRing>,
    filters: ArcSwap<SoftwareFilters>,
    bitrate_cb: RwLock<Option<HostCallback>>,
    waker: ArcSwapOption<Waker>,
    ring_overflows: AtomicU64,
    stats: GvretStats,
    epoch: Instant,
}

impl BridgeCore {
    pub(crate) fn new(manager: Arc<CanManager>, host: HostScheduler, config: GvretConfig) -> Self {
        Self {
            manager,
            host,
            config,
            enabled: AtomicBool::new(false),
            callback_active: AtomicU32::new(0),
            bitrate: AtomicU32::new(0),
            ring: ArcSwapOption::empty(),
            filters: ArcSwap::from_pointee(SoftwareFilters::default()),
            bitrate_cb: RwLock::new(None),
            waker: ArcSwapOption::empty(),
            ring_overflows: AtomicU64::new(0),
            stats: GvretStats::default(),
            epoch: Instant::now(),
        }
    }

    pub(crate) fn manager(&self) -> &CanManager {
        &self.manager
    }

    pub(crate) fn config(&self) -> &GvretConfig {
        &self.config
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub(crate) fn set_waker(&self, waker: Option<Arc<Waker>>) {
        self.waker.store(waker);
    }

    pub(crate) fn pop_packet(&self) -> Option<Packet> {
        self.ring.load().as_ref()?.pop()
    }

    /// 丢弃尚未发出的包（客户端断开时调用，不把旧帧发给下一个客户端）
    pub(crate) fn discard_packets(&self) -> usize {
        self.ring.load().as_ref().map_or(0, |ring| ring.clear())
    }

    /// 测试用：已启用且带环形缓冲的核心
    #[cfg(test)]
    pub(crate) fn armed(manager: Arc<CanManager>, host: HostScheduler) -> Arc<Self> {
        let core = Arc::new(Self::new(manager, host, GvretConfig::default()));
        core.ring.store(Some(Arc::new(FrameRing::new(DEFAULT_RING_CAPACITY))));
        core.enabled.store(true, Ordering::Release);
        core
    }

    pub(crate) fn has_packets(&self) -> bool {
        self.ring.load().as_ref().is_some_and(|ring| !ring.is_empty())
    }

    /// 桥接时间基准下的微秒时间戳（32 位回绕）
    fn now_us(&self) -> u32 {
        self.epoch.elapsed().as_micros() as u32
    }

    /// 管理器接收回调（RX 分发线程上执行）
    pub(crate) fn on_frame(&self, frame: &CanFrame) {
        if !self.is_enabled() {
            return;
        }
        let _guard = ActiveGuard::enter(&self.callback_active);
        if !self.is_enabled() {
            return;
        }

        let ring = self.ring.load();
        let Some(ring) = ring.as_ref() else {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };
        if frame.is_remote {
            return;
        }
        if !self.filters.load().accepts(frame) {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let Some(packet) = protocol::encode_frame(frame, self.now_us(), 0) else {
            return;
        };

        if ring.push(packet) {
            self.stats.rx.fetch_add(1, Ordering::Relaxed);
            if ring.len() == 1 {
                self.wake_tcp();
            }
        } else {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            let overflows = self.ring_overflows.fetch_add(1, Ordering::Relaxed) + 1;
            if overflows == 1 || overflows % 100 == 0 {
                warn!("GVRET ring buffer full, frame dropped (total overflows: {})", overflows);
            }
        }
    }

    fn wake_tcp(&self) {
        if let Some(waker) = self.waker.load().as_ref()
            && let Err(e) = waker.wake()
        {
            trace!("GVRET waker failed: {}", e);
        }
    }

    /// 处理一条完整命令，返回需要立即发回的响应
    pub(crate) fn handle_command(&self, client: ClientId, command: Command) -> Option<Packet> {
        match command {
            Command::GetDevInfo => {
                debug!("GVRET GET_DEV_INFO");
                Some(protocol::dev_info())
            },
            Command::GetNumBuses => Some(protocol::num_buses()),
            Command::GetCanbusParams => Some(protocol::canbus_params(self.bitrate.load(Ordering::Relaxed))),
            Command::GetExtBuses => Some(protocol::ext_buses()),
            Command::Keepalive => Some(protocol::keepalive()),
            Command::TimeSync => Some(protocol::time_sync(self.now_us())),
            Command::SetupCanbus(setup) => {
                self.setup_canbus(client, setup);
                None
            },
            Command::BuildCanFrame { bus, frame } => {
                self.transmit(client, bus, &frame);
                None
            },
            Command::SetExtBuses => None,
        }
    }

    fn setup_canbus(&self, client: ClientId, setup: BusSetup) {
        if !setup.is_valid() {
            debug!("GVRET SETUP_CANBUS without valid flag ignored (0x{:08X})", setup.0);
            return;
        }

        let bitrate = setup.bitrate();
        let current = self.bitrate.load(Ordering::Relaxed);
        if bitrate > 0 && bitrate != current {
            info!("GVRET SETUP_CANBUS: new bitrate requested: {} (current: {})", bitrate, current);
            self.bitrate.store(bitrate, Ordering::Relaxed);
            self.schedule_bitrate_hook(bitrate);
        }

        if setup.is_listen_only() {
            match self.manager.set_mode(client, ClientMode::RxOnly) {
                Ok(()) => info!("GVRET switched to listen-only mode"),
                Err(e) if e.kind() == ErrorKind::InvalidState => {
                    warn!("GVRET cannot switch to listen-only: other TX clients active")
                },
                Err(e) => warn!("GVRET listen-only request failed: {}", e),
            }
        } else if self.manager.client_mode(client) != Some(ClientMode::TxEnabled) {
            match self.manager.set_mode(client, ClientMode::TxEnabled) {
                Ok(()) => info!("GVRET listen-only cleared, TX enabled"),
                Err(e) => warn!("GVRET failed to re-enable TX: {}", e),
            }
        }
    }

    fn schedule_bitrate_hook(&self, bitrate: u32) {
        let Some(callback) = self.bitrate_cb.read().clone() else {
            return;
        };
        let arg = i32::try_from(bitrate).unwrap_or(i32::MAX);
        if self.host.schedule(&callback, arg) {
            let failures = self.stats.sched_saturation.swap(0, Ordering::Relaxed);
            if failures > 0 {
                info!("GVRET bitrate callback scheduled (after {} failures)", failures);
            }
        } else {
            let failures = self.stats.sched_saturation.fetch_add(1, Ordering::Relaxed) + 1;
            warn!("GVRET failed to schedule bitrate callback (fail count: {})", failures);
        }
    }

    fn transmit(&self, client: ClientId, bus: u8, frame: &CanFrame) {
        if bus != 0 {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            warn!("GVRET frame for unsupported bus {} dropped", bus);
            return;
        }
        if !self.is_enabled() {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            warn!("GVRET frame dropped: bridge not running");
            return;
        }
        match self.manager.transmit(client, frame, self.config.tx_timeout) {
            Ok(()) => {
                self.stats.tx.fetch_add(1, Ordering::Relaxed);
            },
            Err(e) => {
                let dropped = self.stats.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if canmux_manager::log_backoff(dropped) {
                    warn!("GVRET transmit of 0x{:X} failed: {} (dropped: {})", frame.id, e, dropped);
                }
            },
        }
    }

    fn wait_callbacks_quiesced(&self) {
        for _ in 0..QUIESCE_ATTEMPTS {
            if self.callback_active.load(Ordering::Acquire) == 0 {
                return;
            }
            thread::sleep(QUIESCE_POLL);
        }
        warn!(
            "GVRET stop: {} callbacks still active after {:?}",
            self.callback_active.load(Ordering::Acquire),
            QUIESCE_POLL * QUIESCE_ATTEMPTS
        );
    }
}

struct Session {
    client: ClientId,
    tcp: TcpTask,
    tx_pin: u8,
    rx_pin: u8,
}

/// GVRET / SavvyCAN TCP 桥接
///
/// # 示例
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use canmux_can::MockCanDriver;
/// use canmux_gvret::{GvretBridge, GvretConfig};
/// use canmux_manager::{CanManager, HostScheduler};
///
/// let manager = Arc::new(CanManager::new(Arc::new(MockCanDriver::new())));
/// let bridge = GvretBridge::new(manager, HostScheduler::default(), GvretConfig::default());
/// bridge.start(4, 5, 500_000).unwrap();
/// // SavvyCAN 连接 tcp://<host>:23 后总线才被激活
/// bridge.stop();
/// ```
pub struct GvretBridge {
    core: Arc<BridgeCore>,
    session: Mutex<Option<Session>>,
}

impl GvretBridge {
    pub fn new(manager: Arc<CanManager>, host: HostScheduler, config: GvretConfig) -> Self {
        Self {
            core: Arc::new(BridgeCore::new(manager, host, config)),
            session: Mutex::new(None),
        }
    }

    /// 注册客户端并启动 TCP 服务（已在运行时先停止）
    pub fn start(&self, tx_pin: u8, rx_pin: u8, bitrate: u32) -> Result<(), GvretError> {
        let mut session = self.session.lock();
        if let Some(old) = session.take() {
            info!("GVRET already running, restarting");
            self.shutdown(old);
        }

        self.core.stats.reset();
        self.core.ring_overflows.store(0, Ordering::Relaxed);
        self.core.bitrate.store(bitrate, Ordering::Relaxed);

        let manager = &self.core.manager;
        let client = manager.register(ClientMode::TxEnabled)?;
        let core = self.core.clone();
        if let Err(e) = manager.set_rx_callback(client, Some(RxHandler::new(move |frame| core.on_frame(frame)))) {
            self.release(client);
            return Err(e.into());
        }
        self.core
            .ring
            .store(Some(Arc::new(FrameRing::new(self.core.config.ring_capacity))));
        self.core.enabled.store(true, Ordering::Release);

        let tcp = match TcpTask::spawn(self.core.clone(), client) {
            Ok(tcp) => tcp,
            Err(e) => {
                self.core.enabled.store(false, Ordering::Release);
                self.release(client);
                self.core.ring.store(None);
                return Err(e);
            },
        };

        info!(
            "GVRET started on {} (tx={}, rx={}, bitrate={}), waiting for a TCP client",
            tcp.local_addr(),
            tx_pin,
            rx_pin,
            bitrate
        );
        *session = Some(Session {
            client,
            tcp,
            tx_pin,
            rx_pin,
        });
        Ok(())
    }

    pub fn stop(&self) {
        if let Some(session) = self.session.lock().take() {
            self.shutdown(session);
        }
    }

    fn shutdown(&self, session: Session) {
        let core = &self.core;
        core.enabled.store(false, Ordering::Release);

        if core.manager.is_active(session.client)
            && let Err(e) = core.manager.deactivate(session.client)
        {
            warn!("GVRET stop: deactivate failed: {}", e);
        }
        session.tcp.stop();
        core.set_waker(None);
        self.release(session.client);
        core.wait_callbacks_quiesced();

        core.ring.store(None);
        core.stats.reset();
        info!("GVRET stopped");
    }

    fn release(&self, client: ClientId) {
        if let Err(e) = self.core.manager.unregister(client) {
            warn!("GVRET: unregister failed: {}", e);
        }
    }

    pub fn is_running(&self) -> bool {
        self.session.lock().is_some()
    }

    /// 实际监听地址（绑定端口 0 时可用来取得分配的端口）
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.session.lock().as_ref().map(|s| s.tcp.local_addr())
    }

    pub fn client_id(&self) -> Option<ClientId> {
        self.session.lock().as_ref().map(|s| s.client)
    }

    pub fn pins(&self) -> Option<(u8, u8)> {
        self.session.lock().as_ref().map(|s| (s.tx_pin, s.rx_pin))
    }

    /// 添加软件过滤器；表满时忽略并告警
    pub fn add_filter(&self, id: u32, mask: u32, extended: bool) {
        let filter = SoftwareFilter { id, mask, extended };
        let mut added = false;
        self.core.filters.rcu(|current| {
            let mut next = SoftwareFilters::clone(current);
            added = next.add(filter);
            next
        });
        if added {
            debug!("GVRET filter added: id=0x{:X} mask=0x{:X} ext={}", id, mask, extended);
        } else {
            warn!("GVRET filter table full, filter 0x{:X}/0x{:X} ignored", id, mask);
        }
    }

    pub fn clear_filters(&self) {
        self.core.filters.store(Arc::new(SoftwareFilters::default()));
        debug!("GVRET filters cleared");
    }

    pub fn filter_count(&self) -> usize {
        self.core.filters.load().len()
    }

    pub fn set_bitrate_change_callback(&self, callback: Option<HostCallback>) {
        *self.core.bitrate_cb.write() = callback;
    }

    pub fn get_bitrate(&self) -> u32 {
        self.core.bitrate.load(Ordering::Relaxed)
    }

    /// `(rx, tx, dropped)`
    pub fn get_stats(&self) -> (u64, u64, u64) {
        let s = self.core.stats.snapshot();
        (s.rx, s.tx, s.dropped)
    }

    pub fn stats(&self) -> GvretStatsSnapshot {
        self.core.stats.snapshot()
    }
}

impl Drop for GvretBridge {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for GvretBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GvretBridge")
            .field("running", &self.is_running())
            .field("bitrate", &self.get_bitrate())
            .field("stats", &self.stats())
            .finish()
    }
}
