//! RX 分发线程
//!
//! 驱动启动时由管理器创建，驱动停止后由管理器停止并 join。
//!
//! 循环：`receive(100ms)` → 在读锁下快照目标客户端 → 释放锁 → 依次调用回调。
//! 每次调用前递增 `callbacks_active` 并复查 `pending_delete`，
//! 保证两阶段删除时回调不会在客户端被移除之后执行。
//!
//! 接收返回不可恢复错误（`CanError::is_fatal`）时，分发线程把所有客户端置为不活跃、
//! 停止并卸载驱动后退出；之后需要客户端重新激活才会再次安装总线。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle, ThreadId};

use canmux_can::{BusState, CanDriver, CanError, CanFrame};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, trace, warn};

use crate::config::DispatcherConfig;
use crate::manager::ManagerState;

pub const DISPATCHER_THREAD_NAME: &str = "canmux-rx-dispatcher";

/// 分发统计（原子计数器，无锁读取）
#[derive(Debug, Default)]
pub struct DispatchStats {
    pub frames_received: AtomicU64,
    pub frames_delivered: AtomicU64,
    pub callback_panics: AtomicU64,
    pub receive_errors: AtomicU64,
}

/// 分发统计快照
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DispatchStatsSnapshot {
    pub frames_received: u64,
    pub frames_delivered: u64,
    pub callback_panics: u64,
    pub receive_errors: u64,
}

impl DispatchStats {
    pub fn snapshot(&self) -> DispatchStatsSnapshot {
        DispatchStatsSnapshot {
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_delivered: self.frames_delivered.load(Ordering::Relaxed),
            callback_panics: self.callback_panics.load(Ordering::Relaxed),
            receive_errors: self.receive_errors.load(Ordering::Relaxed),
        }
    }
}

/// 运行中的分发线程句柄
pub(crate) struct DispatcherHandle {
    shutdown: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

impl DispatcherHandle {
    pub fn spawn(
        driver: Arc<dyn CanDriver>,
        state: Arc<RwLock<ManagerState>>,
        tx_lock: Arc<Mutex<()>>,
        stats: Arc<DispatchStats>,
        config: DispatcherConfig,
    ) -> std::io::Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = shutdown.clone();
        let thread = thread::Builder::new()
            .name(DISPATCHER_THREAD_NAME.into())
            .spawn(move || rx_loop(driver, state, tx_lock, stats, config, flag))?;
        debug!("RX dispatcher started");
        Ok(Self { shutdown, thread })
    }

    pub fn thread_id(&self) -> ThreadId {
        self.thread.thread().id()
    }

    /// 请求退出（不等待）
    pub fn signal(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    /// 请求退出并等待线程结束
    pub fn stop(self) {
        self.signal();
        if self.thread.join().is_err() {
            error!("RX dispatcher thread panicked");
        } else {
            debug!("RX dispatcher stopped");
        }
    }
}

fn rx_loop(
    driver: Arc<dyn CanDriver>,
    state: Arc<RwLock<ManagerState>>,
    tx_lock: Arc<Mutex<()>>,
    stats: Arc<DispatchStats>,
    config: DispatcherConfig,
    shutdown: Arc<AtomicBool>,
) {
    while !shutdown.load(Ordering::Acquire) {
        match driver.receive(config.receive_timeout) {
            Ok(frame) => {
                stats.frames_received.fetch_add(1, Ordering::Relaxed);
                dispatch(&state, &stats, &frame);
            },
            Err(CanError::Timeout) => continue,
            Err(e) if e.is_fatal() => {
                stats.receive_errors.fetch_add(1, Ordering::Relaxed);
                escalate_fatal(driver.as_ref(), &state, &tx_lock, &e);
                break;
            },
            Err(e) => {
                stats.receive_errors.fetch_add(1, Ordering::Relaxed);
                trace!("RX dispatcher receive error: {}, idling", e);
                idle_until_running(driver.as_ref(), &config, &shutdown);
            },
        }
    }
    trace!("RX dispatcher loop exited");
}

/// 接收遇到不可恢复错误：所有客户端失活，停止并卸载驱动
///
/// 在分发线程上执行，不能 join 自己；管理器下次调和时回收本线程句柄。
fn escalate_fatal(driver: &dyn CanDriver, state: &RwLock<ManagerState>, tx_lock: &Mutex<()>, err: &CanError) {
    let count = state.write().registry.deactivate_all();
    error!(
        "Fatal CAN driver error on receive: {}; {} client(s) deactivated, re-init required",
        err, count
    );
    {
        let _tx = tx_lock.lock();
        if let Err(e) = driver.stop() {
            trace!("Fatal teardown stop: {}", e);
        }
        if let Err(e) = driver.uninstall() {
            trace!("Fatal teardown uninstall: {}", e);
        }
    }
    let mut st = state.write();
    st.driver_state.installed = false;
    st.driver_state.running = false;
    st.driver_state.mode = None;
}

/// 驱动不可用时按 `idle_step` 空转，直到驱动恢复运行或收到退出请求
fn idle_until_running(driver: &dyn CanDriver, config: &DispatcherConfig, shutdown: &AtomicBool) {
    while !shutdown.load(Ordering::Acquire) {
        if let Ok(status) = driver.status()
            && status.state == BusState::Running
        {
            return;
        }
        thread::sleep(config.idle_step);
    }
}

/// 把一帧分发给所有目标客户端
pub(crate) fn dispatch(state: &RwLock<ManagerState>, stats: &DispatchStats, frame: &CanFrame) {
    // 短读锁：只复制目标列表
    let targets = state.read().registry.rx_targets();

    for (id, shared) in targets {
        let _guard = shared.enter_callback();
        if shared.is_pending_delete() {
            continue;
        }
        let Some(callback) = shared.load_callback() else {
            continue;
        };

        let result =
            std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| callback.call(frame)));
        match result {
            Ok(()) => {
                stats.frames_delivered.fetch_add(1, Ordering::Relaxed);
            },
            Err(_) => {
                stats.callback_panics.fetch_add(1, Ordering::Relaxed);
                warn!("RX callback of client {} panicked (frame ID=0x{:X})", id, frame.id);
            },
        }
    }
}
