//! 驱动安装配置
//!
//! 一次 `install` 需要的全部参数：通用配置（引脚、队列、告警）、位时序、验收滤波器和工作模式。

use crate::frame::CanFrame;
use crate::status::Alerts;

/// 控制器工作模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BusMode {
    /// 正常模式：收发 + 应答
    Normal,
    /// 无应答模式：发送不需要外部 ACK（自测/回环）
    NoAck,
    /// 只听模式：不发送、不应答
    ListenOnly,
}

impl BusMode {
    /// 该模式下是否允许发送
    pub fn can_transmit(self) -> bool {
        !matches!(self, BusMode::ListenOnly)
    }
}

/// 位时序配置
///
/// 以 40 MHz 时钟计算：`bitrate = 40_000_000 / (brp * (1 + tseg_1 + tseg_2))`。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimingConfig {
    /// 波特率预分频
    pub brp: u32,
    /// 时间段 1
    pub tseg_1: u8,
    /// 时间段 2
    pub tseg_2: u8,
    /// 同步跳转宽度
    pub sjw: u8,
    /// 三次采样
    pub triple_sampling: bool,
}

/// 控制器时钟（Hz）
pub const CONTROLLER_CLOCK_HZ: u32 = 40_000_000;

/// 手动时序的默认参数
pub const DEFAULT_PRESCALER: u32 = 8;
pub const DEFAULT_SJW: u8 = 3;
pub const DEFAULT_BS1: u8 = 15;
pub const DEFAULT_BS2: u8 = 4;

/// 支持的预设波特率
pub const SUPPORTED_BITRATES: [u32; 14] = [
    1_000, 5_000, 10_000, 12_500, 16_000, 20_000, 25_000, 50_000, 100_000, 125_000, 250_000,
    500_000, 800_000, 1_000_000,
];

impl TimingConfig {
    /// 根据预设表查找波特率对应的时序
    ///
    /// 不在表中的波特率返回 `None`。
    pub fn from_bitrate(bitrate: u32) -> Option<Self> {
        let (brp, tseg_1, tseg_2) = match bitrate {
            1_000 => (2000, 15, 4),
            5_000 => (400, 15, 4),
            10_000 => (200, 15, 4),
            12_500 => (160, 15, 4),
            16_000 => (125, 15, 4),
            20_000 => (100, 15, 4),
            25_000 => (80, 15, 4),
            50_000 => (40, 15, 4),
            100_000 => (20, 15, 4),
            125_000 => (16, 15, 4),
            250_000 => (8, 15, 4),
            500_000 => (4, 15, 4),
            800_000 => (2, 23, 6),
            1_000_000 => (2, 15, 4),
            _ => return None,
        };

        Some(Self {
            brp,
            tseg_1,
            tseg_2,
            sjw: 3,
            triple_sampling: false,
        })
    }

    /// 手动时序（bitrate == 0 时使用）
    pub fn manual(prescaler: u32, sjw: u8, bs1: u8, bs2: u8) -> Self {
        Self {
            brp: prescaler,
            tseg_1: bs1,
            tseg_2: bs2,
            sjw,
            triple_sampling: false,
        }
    }

    /// 由时序反算波特率，参数非法时返回 `None`
    pub fn bitrate(&self) -> Option<u32> {
        let quanta = 1 + self.tseg_1 as u32 + self.tseg_2 as u32;
        if self.brp == 0 {
            return None;
        }
        Some(CONTROLLER_CLOCK_HZ / (self.brp * quanta))
    }

    /// 基本合法性检查
    pub fn is_valid(&self) -> bool {
        self.brp > 0
            && self.tseg_1 > 0
            && self.tseg_2 > 0
            && self.sjw > 0
            && self.sjw <= self.tseg_2.max(1)
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        // 500 kbit/s
        Self {
            brp: 4,
            tseg_1: 15,
            tseg_2: 4,
            sjw: 3,
            triple_sampling: false,
        }
    }
}

/// 硬件验收滤波器
///
/// 掩码位为 1 表示"不关心"。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FilterConfig {
    pub acceptance_code: u32,
    pub acceptance_mask: u32,
    pub single_filter: bool,
}

impl FilterConfig {
    /// 接收所有帧
    pub const fn accept_all() -> Self {
        Self {
            acceptance_code: 0,
            acceptance_mask: 0xFFFF_FFFF,
            single_filter: true,
        }
    }

    /// 是否为全通滤波器
    pub fn is_accept_all(&self) -> bool {
        self.acceptance_mask == 0xFFFF_FFFF
    }

    /// 按验收寄存器布局判断一帧是否通过
    ///
    /// 单滤波器：扩展帧比较 `id << 3 | rtr << 2`，标准帧比较
    /// `id << 21 | rtr << 20 | data[0] << 8 | data[1]`。
    ///
    /// 双滤波器：两个 16 bit 半区各自独立，任一命中即通过。标准帧比较
    /// `id << 5 | rtr << 4`（低 4 bit 不参与），扩展帧比较 ID 的高 16 bit。
    pub fn accepts(&self, frame: &CanFrame) -> bool {
        if self.is_accept_all() {
            return true;
        }

        let rtr = frame.is_remote as u32;
        if self.single_filter {
            let value = if frame.is_extended {
                (frame.id << 3) | (rtr << 2)
            } else {
                (frame.id << 21) | (rtr << 20) | ((frame.data[0] as u32) << 8) | frame.data[1] as u32
            };
            return (value ^ self.acceptance_code) & !self.acceptance_mask == 0;
        }

        let (value, care) = if frame.is_extended {
            ((frame.id >> 13) & 0xFFFF, 0xFFFF)
        } else {
            ((frame.id << 5) | (rtr << 4), 0xFFF0)
        };
        let half_matches =
            |code: u32, mask: u32| (value ^ code) & !mask & care == 0;

        half_matches(self.acceptance_code >> 16, self.acceptance_mask >> 16)
            || half_matches(self.acceptance_code & 0xFFFF, self.acceptance_mask & 0xFFFF)
    }
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self::accept_all()
    }
}

/// 通用配置（引脚、队列、告警）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GeneralConfig {
    pub tx_pin: u8,
    pub rx_pin: u8,
    pub clkout_pin: Option<u8>,
    pub bus_off_pin: Option<u8>,
    /// 发送队列长度，0 表示不排队
    pub tx_queue_len: u32,
    /// 接收队列长度
    pub rx_queue_len: u32,
    /// 启用的告警
    pub alerts: Alerts,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            tx_pin: 4,
            rx_pin: 5,
            clkout_pin: None,
            bus_off_pin: None,
            tx_queue_len: 1,
            rx_queue_len: 1,
            alerts: Alerts::ALL,
        }
    }
}

/// `install` 的完整参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverConfig {
    pub general: GeneralConfig,
    pub timing: TimingConfig,
    pub filter: FilterConfig,
    pub mode: BusMode,
}

impl DriverConfig {
    pub fn new(general: GeneralConfig, timing: TimingConfig, filter: FilterConfig, mode: BusMode) -> Self {
        Self {
            general,
            timing,
            filter,
            mode,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preset_table_matches_bitrate() {
        for bitrate in SUPPORTED_BITRATES {
            let timing = TimingConfig::from_bitrate(bitrate).unwrap();
            assert_eq!(timing.bitrate(), Some(bitrate), "preset for {}", bitrate);
            assert!(timing.is_valid());
        }
    }

    #[test]
    fn test_unknown_bitrate_has_no_preset() {
        assert!(TimingConfig::from_bitrate(0).is_none());
        assert!(TimingConfig::from_bitrate(333_333).is_none());
    }

    #[test]
    fn test_manual_timing_defaults() {
        let timing = TimingConfig::manual(DEFAULT_PRESCALER, DEFAULT_SJW, DEFAULT_BS1, DEFAULT_BS2);
        assert_eq!(timing.brp, 8);
        assert_eq!(timing.bitrate(), Some(250_000));
    }

    #[test]
    fn test_default_timing_is_500k() {
        assert_eq!(TimingConfig::default(), TimingConfig::from_bitrate(500_000).unwrap());
    }

    #[test]
    fn test_accept_all_filter() {
        assert!(FilterConfig::default().is_accept_all());
        let filter = FilterConfig {
            acceptance_code: 0x123 << 21,
            acceptance_mask: 0x001F_FFFF,
            single_filter: true,
        };
        assert!(!filter.is_accept_all());
    }

    #[test]
    fn test_single_filter_extended() {
        let filter = FilterConfig {
            acceptance_code: 0x18FF_1000 << 3,
            acceptance_mask: (0x0000_00FF << 3) | 0x3,
            single_filter: true,
        };
        assert!(filter.accepts(&CanFrame::new_extended(0x18FF_1000, &[]).unwrap()));
        assert!(filter.accepts(&CanFrame::new_extended(0x18FF_10AB, &[]).unwrap()));
        assert!(!filter.accepts(&CanFrame::new_extended(0x18FF_2000, &[]).unwrap()));
    }

    #[test]
    fn test_dual_filter_standard_halves() {
        let upper = 0x100 << 5;
        let lower = 0x200 << 5;
        let filter = FilterConfig {
            acceptance_code: (upper << 16) | lower,
            acceptance_mask: 0,
            single_filter: false,
        };
        assert!(filter.accepts(&CanFrame::new_standard(0x100, &[0x55]).unwrap()));
        assert!(filter.accepts(&CanFrame::new_standard(0x200, &[]).unwrap()));
        assert!(!filter.accepts(&CanFrame::new_standard(0x300, &[]).unwrap()));
        assert!(!filter.accepts(&CanFrame::new_remote(0x100, 0, false).unwrap()));
    }

    #[test]
    fn test_listen_only_cannot_transmit() {
        assert!(BusMode::Normal.can_transmit());
        assert!(BusMode::NoAck.can_transmit());
        assert!(!BusMode::ListenOnly.can_transmit());
    }
}
