//! 客户端端点
//!
//! 每个使用总线的逻辑客户端（脚本绑定、GVRET 桥、协议栈）在管理器中对应一个端点。
//! 管理器是端点状态的唯一写者；RX 分发线程只读取回调槽和两阶段删除标志。

use std::fmt;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use arc_swap::ArcSwapOption;
use canmux_can::CanFrame;

/// 客户端工作模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientMode {
    /// 只接收
    RxOnly,
    /// 需要发送
    TxEnabled,
}

/// 客户端 ID（非零，从 1 开始递增）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(NonZeroU32);

impl ClientId {
    pub fn new(raw: u32) -> Option<Self> {
        NonZeroU32::new(raw).map(ClientId)
    }

    pub fn get(self) -> u32 {
        self.0.get()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// 接收回调
///
/// 闭包捕获的环境即客户端上下文。回调在 RX 分发线程上执行，必须快速返回；
/// 回调内可以调用 `transmit`，但不能调用生命周期操作。
pub struct RxHandler(Box<dyn Fn(&CanFrame) + Send + Sync>);

impl RxHandler {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&CanFrame) + Send + Sync + 'static,
    {
        Self(Box::new(f))
    }

    #[inline]
    pub fn call(&self, frame: &CanFrame) {
        (self.0)(frame)
    }
}

impl fmt::Debug for RxHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RxHandler(..)")
    }
}

/// 端点中与分发线程共享的部分
#[derive(Debug, Default)]
pub struct ClientShared {
    /// 两阶段删除第一阶段：置位后分发线程不再调用回调
    pending_delete: AtomicBool,
    /// 正在执行的回调数
    callbacks_active: AtomicU32,
    rx_cb: ArcSwapOption<RxHandler>,
}

impl ClientShared {
    pub fn is_pending_delete(&self) -> bool {
        self.pending_delete.load(Ordering::Acquire)
    }

    pub(crate) fn mark_pending_delete(&self) {
        self.pending_delete.store(true, Ordering::Release);
    }

    pub fn callbacks_active(&self) -> u32 {
        self.callbacks_active.load(Ordering::Acquire)
    }

    pub fn has_callback(&self) -> bool {
        self.rx_cb.load().is_some()
    }

    pub(crate) fn swap_callback(&self, cb: Option<RxHandler>) {
        self.rx_cb.store(cb.map(Arc::new));
    }

    /// 登记一次回调调用，返回的守卫在 drop 时撤销登记（包括 panic 展开时）
    pub(crate) fn enter_callback(&self) -> CallbackGuard<'_> {
        self.callbacks_active.fetch_add(1, Ordering::AcqRel);
        CallbackGuard { shared: self }
    }

    pub(crate) fn load_callback(&self) -> Option<Arc<RxHandler>> {
        self.rx_cb.load_full()
    }
}

pub(crate) struct CallbackGuard<'a> {
    shared: &'a ClientShared,
}

impl Drop for CallbackGuard<'_> {
    fn drop(&mut self) {
        self.shared.callbacks_active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// 注册表中的客户端记录
#[derive(Debug, Clone)]
pub(crate) struct ClientRecord {
    pub mode: ClientMode,
    pub active: bool,
    pub shared: Arc<ClientShared>,
}

impl ClientRecord {
    pub fn new(mode: ClientMode) -> Self {
        Self {
            mode,
            active: false,
            shared: Arc::new(ClientShared::default()),
        }
    }

    /// 可以接收分发的帧
    pub fn is_rx_target(&self) -> bool {
        self.active && !self.shared.is_pending_delete() && self.shared.has_callback()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_client_id_is_non_zero() {
        assert!(ClientId::new(0).is_none());
        let id = ClientId::new(7).unwrap();
        assert_eq!(id.get(), 7);
        assert_eq!(id.to_string(), "#7");
    }

    #[test]
    fn test_callback_guard_balances_counter() {
        let shared = ClientShared::default();
        {
            let _a = shared.enter_callback();
            let _b = shared.enter_callback();
            assert_eq!(shared.callbacks_active(), 2);
        }
        assert_eq!(shared.callbacks_active(), 0);
    }

    #[test]
    fn test_callback_guard_survives_panic() {
        let shared = ClientShared::default();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = shared.enter_callback();
            panic!("callback failure");
        }));
        assert!(result.is_err());
        assert_eq!(shared.callbacks_active(), 0);
    }

    #[test]
    fn test_rx_target_requires_active_and_callback() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut record = ClientRecord::new(ClientMode::RxOnly);
        assert!(!record.is_rx_target());

        let counter = calls.clone();
        record.shared.swap_callback(Some(RxHandler::new(move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
        })));
        assert!(!record.is_rx_target());

        record.active = true;
        assert!(record.is_rx_target());

        let frame = CanFrame::new_standard(0x1, &[]).unwrap();
        record.shared.load_callback().unwrap().call(&frame);
        assert_eq!(calls.load(Ordering::Relaxed), 1);

        record.shared.mark_pending_delete();
        assert!(!record.is_rx_target());
    }
}
