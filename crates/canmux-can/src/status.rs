//! 控制器状态与告警

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};

/// 控制器总线状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BusState {
    /// 已安装但未启动（或已停止）
    #[default]
    Stopped,
    /// 运行中
    Running,
    /// 总线关闭（TEC 超过 255）
    BusOff,
    /// 正在从 bus-off 恢复
    Recovering,
}

impl fmt::Display for BusState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BusState::Stopped => "STOPPED",
            BusState::Running => "RUNNING",
            BusState::BusOff => "BUS_OFF",
            BusState::Recovering => "RECOVERING",
        };
        f.write_str(name)
    }
}

/// 控制器状态快照
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DriverStatus {
    pub state: BusState,
    /// 发送队列中待发送的帧数
    pub msgs_to_tx: u32,
    /// 接收队列中待读取的帧数
    pub msgs_to_rx: u32,
    pub tx_error_counter: u32,
    pub rx_error_counter: u32,
    pub tx_failed_count: u32,
    /// 接收队列满导致丢弃的帧数
    pub rx_missed_count: u32,
    /// 硬件 FIFO 溢出次数
    pub rx_overrun_count: u32,
    pub arb_lost_count: u32,
    pub bus_error_count: u32,
}

/// 告警位集合
///
/// 位值与控制器告警寄存器一致，可以直接按位组合：
///
/// ```rust
/// use canmux_can::Alerts;
///
/// let mask = Alerts::BUS_OFF | Alerts::ERR_PASS;
/// assert!(mask.contains(Alerts::BUS_OFF));
/// assert!(!mask.contains(Alerts::TX_IDLE));
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Alerts(u32);

impl Alerts {
    pub const NONE: Alerts = Alerts(0);
    pub const TX_IDLE: Alerts = Alerts(0x0000_0001);
    pub const TX_SUCCESS: Alerts = Alerts(0x0000_0002);
    pub const RX_DATA: Alerts = Alerts(0x0000_0004);
    pub const BELOW_ERR_WARN: Alerts = Alerts(0x0000_0008);
    pub const ERR_ACTIVE: Alerts = Alerts(0x0000_0010);
    pub const RECOVERY_IN_PROGRESS: Alerts = Alerts(0x0000_0020);
    pub const BUS_RECOVERED: Alerts = Alerts(0x0000_0040);
    pub const ARB_LOST: Alerts = Alerts(0x0000_0080);
    pub const ABOVE_ERR_WARN: Alerts = Alerts(0x0000_0100);
    pub const BUS_ERROR: Alerts = Alerts(0x0000_0200);
    pub const TX_FAILED: Alerts = Alerts(0x0000_0400);
    pub const RX_QUEUE_FULL: Alerts = Alerts(0x0000_0800);
    pub const ERR_PASS: Alerts = Alerts(0x0000_1000);
    pub const BUS_OFF: Alerts = Alerts(0x0000_2000);
    pub const RX_FIFO_OVERRUN: Alerts = Alerts(0x0000_4000);
    pub const TX_RETRIED: Alerts = Alerts(0x0000_8000);
    pub const PERIPH_RESET: Alerts = Alerts(0x0001_0000);
    pub const ALL: Alerts = Alerts(0x0001_FFFF);

    pub const fn from_bits(bits: u32) -> Self {
        Alerts(bits & Self::ALL.0)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// `other` 的所有位都已置位
    pub const fn contains(self, other: Alerts) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    /// 与 `other` 有任意交集
    pub const fn intersects(self, other: Alerts) -> bool {
        self.0 & other.0 != 0
    }

    pub fn insert(&mut self, other: Alerts) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Alerts) {
        self.0 &= !other.0;
    }
}

impl BitOr for Alerts {
    type Output = Alerts;

    fn bitor(self, rhs: Alerts) -> Alerts {
        Alerts(self.0 | rhs.0)
    }
}

impl BitOrAssign for Alerts {
    fn bitor_assign(&mut self, rhs: Alerts) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Alerts {
    type Output = Alerts;

    fn bitand(self, rhs: Alerts) -> Alerts {
        Alerts(self.0 & rhs.0)
    }
}

impl fmt::Debug for Alerts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Alerts({:#07x})", self.0)
    }
}
