//! 桥接统计

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct GvretStats {
    /// 通过过滤并入队的帧
    pub rx: AtomicU64,
    /// 成功发送的帧
    pub tx: AtomicU64,
    /// 丢弃的帧（环满、过滤拒绝、发送失败、非 0 号总线）
    pub dropped: AtomicU64,
    /// 比特率回调连续投递失败次数
    pub sched_saturation: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GvretStatsSnapshot {
    pub rx: u64,
    pub tx: u64,
    pub dropped: u64,
    pub sched_saturation: u64,
}

impl GvretStats {
    pub fn snapshot(&self) -> GvretStatsSnapshot {
        GvretStatsSnapshot {
            rx: self.rx.load(Ordering::Relaxed),
            tx: self.tx.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            sched_saturation: self.sched_saturation.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.rx.store(0, Ordering::Relaxed);
        self.tx.store(0, Ordering::Relaxed);
        self.dropped.store(0, Ordering::Relaxed);
        self.sched_saturation.store(0, Ordering::Relaxed);
    }
}
