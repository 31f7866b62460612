//! 模块级原始客户端接口
//!
//! 脚本直接持有管理器客户端句柄（`register` / `activate` / `transmit` ...），不经过 [`CanBus`](crate::CanBus)。
//!
//! 接收回调不在分发线程上执行：帧和回调一起进入所有原始客户端共享的有界队列
//! （[`RAW_RX_QUEUE_LEN`]），由宿主线程上的排空回调依次交给各自的回调。
//! 队列满时帧被丢弃并计数。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use canmux_can::CanFrame;
use canmux_can::frame::MAX_DATA_LEN;
use canmux_manager::{CanManager, ClientId, ClientMode, HostCallback, HostScheduler, RxHandler, log_backoff};
use crossbeam_channel::{Receiver, Sender, bounded};
use tracing::{debug, error, warn};

use crate::error::BindingError;
use crate::options::ReceivedFrame;

/// 共享接收队列深度
pub const RAW_RX_QUEUE_LEN: usize = 32;

/// 原始发送的驱动超时
pub const RAW_TX_TIMEOUT: Duration = Duration::from_millis(100);

/// 宿主常量：只接收
pub const MODE_RX_ONLY: i32 = 0;
/// 宿主常量：需要发送
pub const MODE_TX_ENABLED: i32 = 1;

/// 原始客户端接收回调（在宿主线程上执行）
pub type RawRxCallback = Arc<dyn Fn(&ReceivedFrame) + Send + Sync>;

/// 宿主整数模式转换为客户端模式
pub fn client_mode_from_raw(raw: i32) -> Result<ClientMode, BindingError> {
    match raw {
        MODE_RX_ONLY => Ok(ClientMode::RxOnly),
        MODE_TX_ENABLED => Ok(ClientMode::TxEnabled),
        _ => Err(BindingError::InvalidArgument(format!("invalid client mode {}", raw))),
    }
}

/// 原始发送帧
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawFrame {
    pub id: u32,
    /// 超过 8 字节的部分被截断
    pub data: Vec<u8>,
    pub extended: bool,
    pub rtr: bool,
    /// 覆盖全局回环设置的自收标志
    pub self_reception: Option<bool>,
}

struct PendingFrame {
    frame: CanFrame,
    callback: RawRxCallback,
}

struct RawQueue {
    tx: Sender<PendingFrame>,
    rx: Receiver<PendingFrame>,
    /// 已向宿主投递排空回调且尚未开始执行
    drain_scheduled: AtomicBool,
    dropped: AtomicU64,
    sched_failures: AtomicU64,
}

impl RawQueue {
    fn new() -> Self {
        let (tx, rx) = bounded(RAW_RX_QUEUE_LEN);
        Self {
            tx,
            rx,
            drain_scheduled: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
            sched_failures: AtomicU64::new(0),
        }
    }

    /// 分发线程上执行：入队，必要时投递一次排空
    fn enqueue(&self, host: &HostScheduler, drain: &HostCallback, frame: &CanFrame, callback: &RawRxCallback) {
        let pending = PendingFrame {
            frame: *frame,
            callback: callback.clone(),
        };
        if self.tx.try_send(pending).is_err() {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if log_backoff(dropped) {
                warn!("Raw CAN RX queue full, frame ID=0x{:X} dropped (total: {})", frame.id, dropped);
            }
            return;
        }

        if self.drain_scheduled.swap(true, Ordering::AcqRel) {
            return;
        }
        if host.schedule(drain, 0) {
            self.sched_failures.store(0, Ordering::Relaxed);
        } else {
            self.drain_scheduled.store(false, Ordering::Release);
            let failures = self.sched_failures.fetch_add(1, Ordering::Relaxed) + 1;
            if log_backoff(failures) {
                warn!("Host scheduler saturated, raw CAN RX delivery delayed ({} consecutive)", failures);
            }
        }
    }

    /// 宿主线程上执行：把队列中的帧交给各自的回调
    fn drain(&self) -> usize {
        self.drain_scheduled.store(false, Ordering::Release);
        let mut delivered = 0;
        while let Ok(pending) = self.rx.try_recv() {
            let frame = ReceivedFrame::from(&pending.frame);
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| (pending.callback)(&frame)));
            if result.is_err() {
                error!("Raw CAN RX callback panicked (ID=0x{:X})", frame.id);
            }
            delivered += 1;
        }
        delivered
    }
}

/// 模块级原始客户端接口
///
/// 每个句柄就是一个管理器 [`ClientId`]；激活、模式并集和两阶段删除都由管理器负责。
pub struct RawCan {
    manager: Arc<CanManager>,
    host: HostScheduler,
    queue: Arc<RawQueue>,
    drain: HostCallback,
    loopback: AtomicBool,
}

impl RawCan {
    pub fn new(manager: Arc<CanManager>, host: HostScheduler) -> Self {
        let queue = Arc::new(RawQueue::new());
        let drain_queue = queue.clone();
        let drain: HostCallback = Arc::new(move |_: i32| {
            drain_queue.drain();
        });
        Self {
            manager,
            host,
            queue,
            drain,
            loopback: AtomicBool::new(false),
        }
    }

    pub fn register(&self, mode: ClientMode) -> Result<ClientId, BindingError> {
        let id = self.manager.register(mode)?;
        debug!("Raw CAN client {} registered", id);
        Ok(id)
    }

    pub fn activate(&self, id: ClientId) -> Result<(), BindingError> {
        Ok(self.manager.activate(id)?)
    }

    pub fn deactivate(&self, id: ClientId) -> Result<(), BindingError> {
        Ok(self.manager.deactivate(id)?)
    }

    /// 注销客户端；已在共享队列中的帧仍会交付
    pub fn unregister(&self, id: ClientId) -> Result<(), BindingError> {
        Ok(self.manager.unregister(id)?)
    }

    /// 设置或清除接收回调
    pub fn set_rx_callback(&self, id: ClientId, callback: Option<RawRxCallback>) -> Result<(), BindingError> {
        let handler = callback.map(|callback| {
            let queue = self.queue.clone();
            let host = self.host.clone();
            let drain = self.drain.clone();
            RxHandler::new(move |frame| queue.enqueue(&host, &drain, frame, &callback))
        });
        Ok(self.manager.set_rx_callback(id, handler)?)
    }

    /// 发送一帧（驱动超时 [`RAW_TX_TIMEOUT`]）
    ///
    /// 全局回环开启时帧默认标记自收，`RawFrame::self_reception` 可覆盖。
    pub fn transmit(&self, id: ClientId, frame: &RawFrame) -> Result<(), BindingError> {
        let len = frame.data.len().min(MAX_DATA_LEN);
        let can_frame = if frame.rtr {
            CanFrame::new_remote(frame.id, len as u8, frame.extended)
        } else {
            CanFrame::new(frame.id, &frame.data[..len], frame.extended)
        }
        .map_err(|e| BindingError::InvalidArgument(e.to_string()))?
        .with_self_reception(
            frame
                .self_reception
                .unwrap_or_else(|| self.loopback.load(Ordering::Relaxed)),
        );

        if let Err(e) = self.manager.transmit(id, &can_frame, RAW_TX_TIMEOUT) {
            warn!("Raw CAN client {} transmit failed: {}", id, e);
            return Err(e.into());
        }
        Ok(())
    }

    /// 全局回环（管理器 NO_ACK 安装 + 原始发送默认自收）
    pub fn set_loopback(&self, enabled: bool) -> Result<(), BindingError> {
        self.manager.set_loopback(enabled)?;
        self.loopback.store(enabled, Ordering::Relaxed);
        Ok(())
    }

    pub fn loopback(&self) -> bool {
        self.loopback.load(Ordering::Relaxed)
    }

    /// 立即在当前线程排空共享接收队列，返回交付的帧数
    ///
    /// 只应在宿主线程上调用；正常情况下由投递到宿主的排空回调完成。
    pub fn process_rx_queue(&self) -> usize {
        self.queue.drain()
    }

    /// 共享队列中等待交付的帧数
    pub fn pending(&self) -> usize {
        self.queue.rx.len()
    }

    /// 队列满丢弃的帧数
    pub fn dropped(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for RawCan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawCan")
            .field("pending", &self.pending())
            .field("dropped", &self.dropped())
            .field("loopback", &self.loopback())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn frame(id: u32) -> CanFrame {
        CanFrame::new_standard(id, &[id as u8]).unwrap()
    }

    #[test]
    fn test_client_mode_from_raw() {
        assert_eq!(client_mode_from_raw(0).unwrap(), ClientMode::RxOnly);
        assert_eq!(client_mode_from_raw(1).unwrap(), ClientMode::TxEnabled);
        assert!(matches!(client_mode_from_raw(7), Err(BindingError::InvalidArgument(_))));
    }

    #[test]
    fn test_single_drain_scheduled_for_burst() {
        let queue = RawQueue::new();
        let host = HostScheduler::new(4);
        let noop: HostCallback = Arc::new(|_: i32| {});
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callback: RawRxCallback = Arc::new(move |f: &ReceivedFrame| sink.lock().push(f.id));

        for id in 1..=3 {
            queue.enqueue(&host, &noop, &frame(id), &callback);
        }
        assert_eq!(host.pending(), 1);
        assert_eq!(queue.drain(), 3);
        assert_eq!(*seen.lock(), vec![1, 2, 3]);

        // 排空后再次入队会重新投递
        queue.enqueue(&host, &noop, &frame(4), &callback);
        assert_eq!(host.pending(), 2);
    }

    #[test]
    fn test_full_queue_drops_frames() {
        let queue = RawQueue::new();
        let host = HostScheduler::new(4);
        let noop: HostCallback = Arc::new(|_: i32| {});
        let callback: RawRxCallback = Arc::new(|_: &ReceivedFrame| {});

        for id in 0..(RAW_RX_QUEUE_LEN as u32 + 5) {
            queue.enqueue(&host, &noop, &frame(id), &callback);
        }
        assert_eq!(queue.rx.len(), RAW_RX_QUEUE_LEN);
        assert_eq!(queue.dropped.load(Ordering::Relaxed), 5);
    }

    #[test]
    fn test_saturated_host_retries_on_next_frame() {
        let queue = RawQueue::new();
        let host = HostScheduler::new(1);
        let noop: HostCallback = Arc::new(|_: i32| {});
        assert!(host.schedule(&noop, 9));
        let callback: RawRxCallback = Arc::new(|_: &ReceivedFrame| {});

        queue.enqueue(&host, &noop, &frame(1), &callback);
        assert_eq!(queue.sched_failures.load(Ordering::Relaxed), 1);
        assert!(!queue.drain_scheduled.load(Ordering::Relaxed));

        host.run_pending();
        queue.enqueue(&host, &noop, &frame(2), &callback);
        assert_eq!(host.pending(), 1);
        assert_eq!(queue.sched_failures.load(Ordering::Relaxed), 0);
        assert_eq!(queue.drain(), 2);
    }

    #[test]
    fn test_panicking_callback_does_not_stop_drain() {
        let queue = RawQueue::new();
        let host = HostScheduler::new(4);
        let noop: HostCallback = Arc::new(|_: i32| {});
        let bad: RawRxCallback = Arc::new(|_: &ReceivedFrame| panic!("script error"));
        let count = Arc::new(AtomicU64::new(0));
        let counter = count.clone();
        let good: RawRxCallback = Arc::new(move |_: &ReceivedFrame| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        queue.enqueue(&host, &noop, &frame(1), &bad);
        queue.enqueue(&host, &noop, &frame(2), &good);
        assert_eq!(queue.drain(), 2);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
