//! 绑定层参数与结果类型

use std::fmt;
use std::time::Duration;

use canmux_can::config::{DEFAULT_BS1, DEFAULT_BS2, DEFAULT_PRESCALER, DEFAULT_SJW};
use canmux_can::{Alerts, BusMode, BusState, CanFrame, FilterConfig, GeneralConfig, TimingConfig};
use canmux_manager::ClientMode;

use crate::error::BindingError;

/// `send` 默认超时（调用方传 0 时使用）
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_millis(1000);

/// `recv` 默认超时
pub const DEFAULT_RECV_TIMEOUT: Duration = Duration::from_millis(5000);

/// `rx_queue == 0` 时的接收队列容量
pub const DEFAULT_RX_QUEUE: usize = 20;

/// `irq_recv` 回调参数
pub mod irq_recv {
    /// 队列中出现第一帧
    pub const FIRST_FRAME: i32 = 0;
    /// 队列已满
    pub const QUEUE_FULL: i32 = 1;
    /// 队列溢出，帧被丢弃
    pub const OVERFLOW: i32 = 2;
    /// 控制器 FIFO 溢出
    pub const FIFO_OVERRUN: i32 = 3;
}

/// `irq_send` 回调参数
pub mod irq_send {
    pub const TX_IDLE: i32 = 0;
    pub const TX_SUCCESS: i32 = 1;
    pub const TX_FAILED: i32 = 2;
    pub const TX_RETRIED: i32 = 3;
}

/// 宿主可见的工作模式（原始值与宿主常量一致）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CanMode {
    #[default]
    Normal,
    NoAck,
    Listen,
    /// 自发自收，无需外部应答
    Loopback,
    SilentLoopback,
}

impl CanMode {
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(CanMode::Normal),
            1 => Some(CanMode::NoAck),
            2 => Some(CanMode::Listen),
            -2 => Some(CanMode::Loopback),
            -3 => Some(CanMode::SilentLoopback),
            _ => None,
        }
    }

    pub fn raw(self) -> i32 {
        match self {
            CanMode::Normal => 0,
            CanMode::NoAck => 1,
            CanMode::Listen => 2,
            CanMode::Loopback => -2,
            CanMode::SilentLoopback => -3,
        }
    }

    /// 发出的帧是否标记自收
    pub fn self_reception(self) -> bool {
        matches!(self, CanMode::Loopback | CanMode::SilentLoopback)
    }

    /// 是否请求管理器的全局回环（NO_ACK 安装）
    pub fn wants_no_ack(self) -> bool {
        matches!(self, CanMode::NoAck | CanMode::Loopback | CanMode::SilentLoopback)
    }

    pub fn client_mode(self) -> ClientMode {
        match self {
            CanMode::Listen => ClientMode::RxOnly,
            _ => ClientMode::TxEnabled,
        }
    }

    /// 尚未安装时显示的总线模式
    pub(crate) fn expected_bus_mode(self) -> BusMode {
        match self {
            CanMode::Listen => BusMode::ListenOnly,
            CanMode::Normal => BusMode::Normal,
            _ => BusMode::NoAck,
        }
    }
}

/// `init` 参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanOptions {
    pub mode: CanMode,
    /// 0 表示使用 `prescaler`/`sjw`/`bs1`/`bs2`
    pub bitrate: u32,
    pub tx_pin: u8,
    pub rx_pin: u8,
    pub clkout_pin: Option<u8>,
    pub bus_off_pin: Option<u8>,
    pub tx_queue: u32,
    /// 0 表示使用 [`DEFAULT_RX_QUEUE`]
    pub rx_queue: u32,
    pub extframe: bool,
    pub auto_restart: bool,
    pub prescaler: u32,
    pub sjw: u8,
    pub bs1: u8,
    pub bs2: u8,
}

impl Default for CanOptions {
    fn default() -> Self {
        Self {
            mode: CanMode::Normal,
            bitrate: 500_000,
            tx_pin: 4,
            rx_pin: 5,
            clkout_pin: None,
            bus_off_pin: None,
            tx_queue: 1,
            rx_queue: 1,
            extframe: false,
            auto_restart: false,
            prescaler: DEFAULT_PRESCALER,
            sjw: DEFAULT_SJW,
            bs1: DEFAULT_BS1,
            bs2: DEFAULT_BS2,
        }
    }
}

impl CanOptions {
    /// 计算时序；非零波特率必须在预设表中
    pub fn timing(&self) -> Result<TimingConfig, BindingError> {
        if self.bitrate == 0 {
            let timing = TimingConfig::manual(self.prescaler, self.sjw, self.bs1, self.bs2);
            if !timing.is_valid() {
                return Err(BindingError::InvalidArgument(format!(
                    "invalid bit timing (prescaler={}, sjw={}, bs1={}, bs2={})",
                    self.prescaler, self.sjw, self.bs1, self.bs2
                )));
            }
            return Ok(timing);
        }
        TimingConfig::from_bitrate(self.bitrate).ok_or_else(|| {
            BindingError::InvalidArgument(format!("Unable to set bitrate {}", self.bitrate))
        })
    }

    pub fn general(&self) -> GeneralConfig {
        GeneralConfig {
            tx_pin: self.tx_pin,
            rx_pin: self.rx_pin,
            clkout_pin: self.clkout_pin,
            bus_off_pin: self.bus_off_pin,
            tx_queue_len: self.tx_queue,
            rx_queue_len: self.rx_queue,
            alerts: Alerts::ALL,
        }
    }

    pub fn rx_queue_capacity(&self) -> usize {
        match self.rx_queue {
            0 => DEFAULT_RX_QUEUE,
            n => n as usize,
        }
    }
}

/// `send` 参数
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SendOptions {
    /// `Duration::ZERO` 使用 [`DEFAULT_SEND_TIMEOUT`]
    pub timeout: Duration,
    pub rtr: bool,
    pub extended: bool,
}

/// `recv` 返回的帧
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFrame {
    pub id: u32,
    pub extended: bool,
    pub rtr: bool,
    pub data: Vec<u8>,
}

impl From<&CanFrame> for ReceivedFrame {
    fn from(frame: &CanFrame) -> Self {
        Self {
            id: frame.id,
            extended: frame.is_extended,
            rtr: frame.is_remote,
            data: frame.data_slice().to_vec(),
        }
    }
}

/// 滤波器模式（原始值与宿主常量一致）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterMode {
    RawSingle,
    RawDual,
    /// `[id, mask]`，由绑定编码进验收寄存器
    Address,
}

impl FilterMode {
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            1 => Some(FilterMode::RawSingle),
            2 => Some(FilterMode::RawDual),
            3 => Some(FilterMode::Address),
            _ => None,
        }
    }
}

/// 把 `set_filters` 的参数编码为验收寄存器值
///
/// 标准帧使用双滤波器的 16 bit 半区；`current` 的高半区为全通时两个半区都写入，
/// 否则只写低半区、保留高半区。
pub fn encode_filter(current: FilterConfig, mode: FilterMode, params: [u32; 2], rtr: bool, extended: bool) -> FilterConfig {
    let [first, second] = params;
    match mode {
        FilterMode::RawSingle => FilterConfig {
            acceptance_code: first,
            acceptance_mask: second,
            single_filter: true,
        },
        FilterMode::RawDual => FilterConfig {
            acceptance_code: first,
            acceptance_mask: second,
            single_filter: false,
        },
        FilterMode::Address if extended => FilterConfig {
            acceptance_code: ((first & 0x1FFF_FFFF) << 3) | ((rtr as u32) << 2),
            acceptance_mask: ((second & 0x1FFF_FFFF) << 3) | 0x3,
            single_filter: true,
        },
        FilterMode::Address => {
            let code = ((first & 0x7FF) << 5) | ((rtr as u32) << 4);
            let mask = (second & 0x7FF) << 5;
            let high_is_open = current.single_filter || (current.acceptance_mask >> 16) == 0xFFFF;
            if high_is_open {
                FilterConfig {
                    acceptance_code: (code << 16) | code,
                    acceptance_mask: (mask << 16) | mask,
                    single_filter: false,
                }
            } else {
                FilterConfig {
                    acceptance_code: (current.acceptance_code & 0xFFFF_0000) | code,
                    acceptance_mask: (current.acceptance_mask & 0xFFFF_0000) | mask,
                    single_filter: false,
                }
            }
        },
    }
}

/// `state()` 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingState {
    NotInitiated,
    Stopped,
    Running,
    BusOff,
    Recovering,
}

impl From<BusState> for BindingState {
    fn from(state: BusState) -> Self {
        match state {
            BusState::Stopped => BindingState::Stopped,
            BusState::Running => BindingState::Running,
            BusState::BusOff => BindingState::BusOff,
            BusState::Recovering => BindingState::Recovering,
        }
    }
}

impl fmt::Display for BindingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BindingState::NotInitiated => "NOT_INITIATED",
            BindingState::Stopped => "STOPPED",
            BindingState::Running => "RUNNING",
            BindingState::BusOff => "BUS_OFF",
            BindingState::Recovering => "RECOVERING",
        };
        f.write_str(name)
    }
}

/// `info()` 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanInfo {
    pub state: BindingState,
    pub msgs_to_tx: u32,
    pub msgs_to_rx: u32,
    pub tx_error_counter: u32,
    pub rx_error_counter: u32,
    pub tx_failed_count: u32,
    pub rx_missed_count: u32,
    pub arb_lost_count: u32,
    pub bus_error_count: u32,
    /// 绑定接收队列溢出丢弃的帧数
    pub rx_dropped: u64,
    pub num_bus_off: u32,
    pub num_error_passive: u32,
    pub num_error_warning: u32,
}
