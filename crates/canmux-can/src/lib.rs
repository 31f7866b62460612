//! # canmux CAN Driver Facade
//!
//! CAN 控制器驱动门面：把一个物理控制器的生命周期（install / start / stop / uninstall）、
//! 收发、状态和告警抽象为 [`CanDriver`] trait。
//!
//! 上层（`canmux-manager`）只通过这个 trait 访问控制器，因此同一套管理逻辑可以运行在：
//!
//! - Linux SocketCAN 接口上（[`socketcan::SocketCanDriver`]）
//! - 内存中的虚拟控制器上（[`mock::MockCanDriver`]，`mock` feature）

use std::time::Duration;

pub mod config;
pub mod error;
pub mod frame;
pub mod status;

#[cfg(feature = "mock")]
pub mod mock;

#[cfg(target_os = "linux")]
pub mod socketcan;

pub use config::{BusMode, DriverConfig, FilterConfig, GeneralConfig, TimingConfig};
pub use error::CanError;
pub use frame::{CanFrame, ProtocolError};
pub use status::{Alerts, BusState, DriverStatus};

#[cfg(feature = "mock")]
pub use mock::MockCanDriver;

#[cfg(target_os = "linux")]
pub use socketcan::SocketCanDriver;

/// 无限等待
pub const WAIT_FOREVER: Duration = Duration::MAX;

/// CAN 控制器驱动门面
///
/// 所有方法都接收 `&self`：实现对象本身就是控制器句柄，由实现负责内部同步。
///
/// # 状态机
///
/// ```text
/// (uninstalled) --install--> Stopped --start--> Running --stop--> Stopped --uninstall--> (uninstalled)
///                                                  |
///                                           (TEC > 255)
///                                                  v
///                                   BusOff --recover--> Recovering --> Stopped
/// ```
///
/// # 超时
///
/// `Duration::ZERO` 表示轮询，[`WAIT_FOREVER`] 表示无限等待。驱动从不重试。
pub trait CanDriver: Send + Sync {
    /// 安装驱动
    ///
    /// # 错误
    /// - `AlreadyInstalled`、`InvalidConfig`、`NoResources`
    fn install(&self, config: &DriverConfig) -> Result<(), CanError>;

    /// 卸载驱动，运行中返回 `Busy`
    fn uninstall(&self) -> Result<(), CanError>;

    /// 启动控制器
    fn start(&self) -> Result<(), CanError>;

    /// 停止控制器，未运行返回 `NotRunning`
    fn stop(&self) -> Result<(), CanError>;

    /// 发送一帧
    ///
    /// 可以并发调用，不保证并发发送之间的顺序。
    ///
    /// # 错误
    /// - `Timeout`、`BusOff`、`NoAck`、`NotRunning`
    /// - `NotSupported`：只听模式
    fn transmit(&self, frame: &CanFrame, timeout: Duration) -> Result<(), CanError>;

    /// 接收一帧，超时返回 `Timeout`
    fn receive(&self, timeout: Duration) -> Result<CanFrame, CanError>;

    /// 查询状态，未安装返回 `NotInstalled`
    fn status(&self) -> Result<DriverStatus, CanError>;

    /// 发起 bus-off 恢复，恢复完成后控制器回到 `Stopped`
    fn recover(&self) -> Result<(), CanError>;

    /// 等待 `mask` 中的任意告警，返回触发的告警（读取即清除）
    fn alerts_wait(&self, mask: Alerts, timeout: Duration) -> Result<Alerts, CanError>;

    /// 清空发送队列
    fn clear_transmit_queue(&self) -> Result<(), CanError>;

    /// 清空接收队列
    fn clear_receive_queue(&self) -> Result<(), CanError>;
}

/// 把 `Duration` 转换为截止时间，`WAIT_FOREVER` 或溢出时返回 `None`
pub fn deadline_after(timeout: Duration) -> Option<std::time::Instant> {
    if timeout == WAIT_FOREVER {
        return None;
    }
    std::time::Instant::now().checked_add(timeout)
}
