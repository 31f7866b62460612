//! # canmux 总线管理器
//!
//! 让多个互不知情的客户端共享一个 CAN 控制器：
//! - 客户端注册表（模式 / 活跃标志 / 接收回调）
//! - 总线状态调和器：由活跃客户端集合推导驱动应处的模式
//! - RX 分发线程：把每一帧扇出给所有活跃客户端
//! - 两阶段删除：注销后不再有回调执行
//!
//! # 使用场景
//!
//! 脚本绑定（`canmux-binding`）和 GVRET 桥（`canmux-gvret`）各自注册为一个客户端，
//! 同时使用同一条总线。

mod client;
pub mod config;
pub mod dispatcher;
mod error;
pub mod host;
mod manager;
pub mod reconciler;
mod registry;

pub use client::{ClientId, ClientMode, ClientShared, RxHandler};
pub use config::{BusSettings, DispatcherConfig, ManagerConfig};
pub use dispatcher::{DISPATCHER_THREAD_NAME, DispatchStats, DispatchStatsSnapshot};
pub use error::{ErrorKind, ManagerError};
pub use host::{DEFAULT_SCHEDULER_DEPTH, HostCallback, HostScheduler, log_backoff};
pub use manager::CanManager;
pub use reconciler::{BusStatePlan, DriverState, DriverStep};
pub use registry::{MAX_CLIENTS, RegistrySnapshot};
