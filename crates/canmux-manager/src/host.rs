//! 宿主调度器
//!
//! 宿主（脚本运行时）是单线程协作式的：后台线程不能直接调用宿主回调，
//! 只能把 `(回调, 整数参数)` 投递到有界队列，由宿主线程在安全点调用
//! [`HostScheduler::run_pending`] 取出执行。

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use tracing::error;

/// 宿主回调
pub type HostCallback = Arc<dyn Fn(i32) + Send + Sync>;

/// 默认队列深度
pub const DEFAULT_SCHEDULER_DEPTH: usize = 8;

/// 有界宿主调度队列
#[derive(Clone)]
pub struct HostScheduler {
    tx: Sender<(HostCallback, i32)>,
    rx: Receiver<(HostCallback, i32)>,
}

impl HostScheduler {
    pub fn new(depth: usize) -> Self {
        let (tx, rx) = bounded(depth.max(1));
        Self { tx, rx }
    }

    /// 投递一次回调，队列满时返回 `false`（不阻塞）
    pub fn schedule(&self, callback: &HostCallback, arg: i32) -> bool {
        match self.tx.try_send((callback.clone(), arg)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// 在宿主线程上执行当前已排队的回调，返回执行数量
    ///
    /// 回调 panic 被捕获并记录，不影响后续回调。
    pub fn run_pending(&self) -> usize {
        let mut executed = 0;
        while let Ok((callback, arg)) = self.rx.try_recv() {
            run_callback(&callback, arg);
            executed += 1;
        }
        executed
    }

    /// 等待并执行一个回调，超时返回 `false`
    pub fn run_one(&self, timeout: Duration) -> bool {
        match self.rx.recv_timeout(timeout) {
            Ok((callback, arg)) => {
                run_callback(&callback, arg);
                true
            },
            Err(_) => false,
        }
    }

    /// 已排队的回调数
    pub fn pending(&self) -> usize {
        self.rx.len()
    }
}

impl Default for HostScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_SCHEDULER_DEPTH)
    }
}

impl std::fmt::Debug for HostScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostScheduler")
            .field("pending", &self.pending())
            .field("capacity", &self.tx.capacity())
            .finish()
    }
}

fn run_callback(callback: &HostCallback, arg: i32) {
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| callback(arg)));
    if result.is_err() {
        error!("Host callback panicked (arg={})", arg);
    }
}

/// 退避日志：第 1 次、第 10 次、之后每 100 次返回 `true`
#[inline]
pub fn log_backoff(count: u64) -> bool {
    count == 1 || count == 10 || (count > 0 && count % 100 == 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI32, Ordering};

    #[test]
    fn test_schedule_and_run_pending() {
        let scheduler = HostScheduler::new(2);
        let last = Arc::new(AtomicI32::new(-1));
        let sink = last.clone();
        let callback: HostCallback = Arc::new(move |arg: i32| sink.store(arg, Ordering::SeqCst));

        assert!(scheduler.schedule(&callback, 1));
        assert!(scheduler.schedule(&callback, 2));
        assert!(!scheduler.schedule(&callback, 3), "queue depth is 2");
        assert_eq!(scheduler.pending(), 2);

        assert_eq!(scheduler.run_pending(), 2);
        assert_eq!(last.load(Ordering::SeqCst), 2);
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn test_panicking_callback_is_contained() {
        let scheduler = HostScheduler::default();
        let panicking: HostCallback = Arc::new(|_: i32| panic!("host failure"));
        let hits = Arc::new(AtomicI32::new(0));
        let sink = hits.clone();
        let counting: HostCallback = Arc::new(move |_| {
            sink.fetch_add(1, Ordering::SeqCst);
        });

        scheduler.schedule(&panicking, 0);
        scheduler.schedule(&counting, 0);
        assert_eq!(scheduler.run_pending(), 2);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_run_one_times_out() {
        let scheduler = HostScheduler::default();
        assert!(!scheduler.run_one(Duration::from_millis(5)));
    }

    #[test]
    fn test_log_backoff_points() {
        let points: Vec<u64> = (0..=300).filter(|n| log_backoff(*n)).collect();
        assert_eq!(points, vec![1, 10, 100, 200, 300]);
    }
}
