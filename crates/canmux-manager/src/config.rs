//! 管理器配置

use std::time::Duration;

use canmux_can::{BusMode, DriverConfig, FilterConfig, GeneralConfig, TimingConfig};

use crate::registry::MAX_CLIENTS;

/// 管理器安装驱动时使用的总线参数
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BusSettings {
    pub general: GeneralConfig,
    pub timing: TimingConfig,
    pub filter: FilterConfig,
    /// 全局回环请求：TX 客户端存在时以 NO_ACK 模式安装
    pub loopback: bool,
}

impl BusSettings {
    pub fn driver_config(&self, mode: BusMode) -> DriverConfig {
        DriverConfig::new(self.general, self.timing, self.filter, mode)
    }
}

/// RX 分发线程配置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// 单次 `receive` 超时
    pub receive_timeout: Duration,
    /// 驱动不可用时的空闲步长
    pub idle_step: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            receive_timeout: Duration::from_millis(100),
            idle_step: Duration::from_millis(10),
        }
    }
}

/// 管理器配置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagerConfig {
    pub dispatcher: DispatcherConfig,
    /// 两阶段删除 / 回调替换时轮询 `callbacks_active` 的间隔
    pub drain_poll: Duration,
    /// 等待在途回调的上限
    pub drain_timeout: Duration,
    /// `recover` 等待控制器退出 Recovering 的上限
    pub recover_timeout: Duration,
    pub max_clients: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            dispatcher: DispatcherConfig::default(),
            drain_poll: Duration::from_millis(10),
            drain_timeout: Duration::from_secs(1),
            recover_timeout: Duration::from_secs(1),
            max_clients: MAX_CLIENTS,
        }
    }
}
